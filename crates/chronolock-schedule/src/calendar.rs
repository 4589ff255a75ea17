use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};

/// Exclusion schedule a trigger can reference by name. Fire times that fall
/// on an excluded instant are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Calendar {
    /// Whole UTC dates that never fire.
    Holiday {
        #[serde(default)]
        description: Option<String>,
        excluded_dates: BTreeSet<NaiveDate>,
    },
    /// Weekdays that never fire; 0 is Monday, 6 is Sunday.
    Weekly {
        #[serde(default)]
        description: Option<String>,
        excluded_days: BTreeSet<u8>,
    },
}

impl Calendar {
    pub fn holiday(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Calendar::Holiday {
            description: None,
            excluded_dates: dates.into_iter().collect(),
        }
    }

    pub fn weekly(days: impl IntoIterator<Item = u8>) -> Result<Self> {
        let excluded_days: BTreeSet<u8> = days.into_iter().collect();
        if let Some(bad) = excluded_days.iter().find(|d| **d > 6) {
            return Err(ScheduleError::Calendar(format!("weekday {bad} out of range 0..=6")));
        }
        if excluded_days.len() == 7 {
            return Err(ScheduleError::Calendar("every weekday is excluded".into()));
        }
        Ok(Calendar::Weekly {
            description: None,
            excluded_days,
        })
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Calendar::Holiday { description, .. } | Calendar::Weekly { description, .. } => {
                description.as_deref()
            }
        }
    }

    pub fn is_time_included(&self, t: DateTime<Utc>) -> bool {
        match self {
            Calendar::Holiday { excluded_dates, .. } => !excluded_dates.contains(&t.date_naive()),
            Calendar::Weekly { excluded_days, .. } => {
                let day = t.weekday().num_days_from_monday() as u8;
                !excluded_days.contains(&day)
            }
        }
    }
}
