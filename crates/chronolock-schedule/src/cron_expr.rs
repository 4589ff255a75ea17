use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, ScheduleError},
    misfire::MisfireInstruction,
    schedule::{FireContext, ScheduleKind},
};

/// Fires whenever a cron expression matches, evaluated in UTC.
///
/// Accepts the 6/7-field form (`sec min hour dom month dow [year]`) and the
/// classic 5-field form, which is normalised by prefixing a zero seconds field.
/// The expression is parsed once at construction; only the text is persisted.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredCron", into = "StoredCron")]
pub struct CronSchedule {
    expression: String,
    parsed: cron::Schedule,
}

#[derive(Serialize, Deserialize)]
struct StoredCron {
    expression: String,
}

impl CronSchedule {
    pub fn new(expression: &str) -> Result<Self> {
        let expression = normalize(expression);
        let parsed = parse(&expression)?;
        Ok(Self { expression, parsed })
    }

    /// The normalised expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .finish()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl TryFrom<StoredCron> for CronSchedule {
    type Error = ScheduleError;

    fn try_from(stored: StoredCron) -> Result<Self> {
        Self::new(&stored.expression)
    }
}

impl From<CronSchedule> for StoredCron {
    fn from(schedule: CronSchedule) -> Self {
        Self {
            expression: schedule.expression,
        }
    }
}

fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn parse(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

impl ScheduleKind for CronSchedule {
    const TYPE_TAG: &'static str = "cron";

    fn fire_time_after(&self, after: DateTime<Utc>, ctx: &FireContext) -> Option<DateTime<Utc>> {
        let from = if after < ctx.start {
            ctx.start - Duration::milliseconds(1)
        } else {
            after
        };
        self.parsed
            .after(&from)
            .take(3)
            .find(|t| *t > after && *t >= ctx.start)
    }

    fn smart_misfire(&self) -> MisfireInstruction {
        MisfireInstruction::FireNow
    }

    fn extra_properties(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ScheduleError::InvalidProperties {
            kind: Self::TYPE_TAG,
            reason: e.to_string(),
        })
    }

    fn restore(props: &Value) -> Result<Self> {
        serde_json::from_value(props.clone()).map_err(|e| ScheduleError::InvalidProperties {
            kind: Self::TYPE_TAG,
            reason: e.to_string(),
        })
    }
}
