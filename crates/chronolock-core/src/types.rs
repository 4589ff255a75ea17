use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Group used when a key is built without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Identity of a job: `(group, name)` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

impl std::str::FromStr for JobKey {
    type Err = CoreError;

    /// Parses `group.name`; a bare name lands in the default group.
    fn from_str(s: &str) -> Result<Self> {
        parse_key(s).map(|(group, name)| Self::new(group, name))
    }
}

/// Identity of a trigger: `(group, name)` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

impl std::str::FromStr for TriggerKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        parse_key(s).map(|(group, name)| Self::new(group, name))
    }
}

fn parse_key(s: &str) -> Result<(String, String)> {
    let (group, name) = match s.split_once('.') {
        Some((group, name)) => (group, name),
        None => (DEFAULT_GROUP, s),
    };
    if group.is_empty() || name.is_empty() {
        return Err(CoreError::InvalidKey(s.to_string()));
    }
    Ok((group.to_string(), name.to_string()))
}

/// How a [`GroupMatcher`] compares its value against a group name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    Anything,
}

/// Selects keys by their group name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMatcher {
    pub operator: MatchOperator,
    pub value: String,
}

impl GroupMatcher {
    pub fn equals(group: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::Equals,
            value: group.into(),
        }
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::StartsWith,
            value: prefix.into(),
        }
    }

    pub fn ends_with(suffix: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::EndsWith,
            value: suffix.into(),
        }
    }

    pub fn contains(fragment: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::Contains,
            value: fragment.into(),
        }
    }

    pub fn any() -> Self {
        Self {
            operator: MatchOperator::Anything,
            value: String::new(),
        }
    }

    pub fn is_match(&self, group: &str) -> bool {
        match self.operator {
            MatchOperator::Equals => group == self.value,
            MatchOperator::StartsWith => group.starts_with(&self.value),
            MatchOperator::EndsWith => group.ends_with(&self.value),
            MatchOperator::Contains => group.contains(&self.value),
            MatchOperator::Anything => true,
        }
    }

    /// SQL `LIKE` pattern equivalent to this matcher, using `\` as the escape
    /// character. Callers must add `ESCAPE '\'` to the clause.
    pub fn like_pattern(&self) -> String {
        let escaped: String = self
            .value
            .chars()
            .flat_map(|c| match c {
                '%' | '_' | '\\' => vec!['\\', c],
                other => vec![other],
            })
            .collect();
        match self.operator {
            MatchOperator::Equals => escaped,
            MatchOperator::StartsWith => format!("{escaped}%"),
            MatchOperator::EndsWith => format!("%{escaped}"),
            MatchOperator::Contains => format!("%{escaped}%"),
            MatchOperator::Anything => "%".to_string(),
        }
    }
}

impl fmt::Display for GroupMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            MatchOperator::Equals => write!(f, "group == {:?}", self.value),
            MatchOperator::StartsWith => write!(f, "group starts with {:?}", self.value),
            MatchOperator::EndsWith => write!(f, "group ends with {:?}", self.value),
            MatchOperator::Contains => write!(f, "group contains {:?}", self.value),
            MatchOperator::Anything => write!(f, "any group"),
        }
    }
}
