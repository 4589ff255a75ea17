use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cron_expr::CronSchedule,
    error::{Result, ScheduleError},
    misfire::MisfireInstruction,
    schedule::{FireContext, ScheduleKind},
};

const MAX_WEEK_JUMPS: usize = 1_000;

/// A cron schedule that only fires in every `interval_in_week`-th week,
/// counting from the week containing the trigger's start time. Weeks start
/// on Monday, UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub cron: CronSchedule,
    pub interval_in_week: u32,
}

impl WeeklySchedule {
    pub fn new(expression: &str, interval_in_week: u32) -> Result<Self> {
        let schedule = Self {
            cron: CronSchedule::new(expression)?,
            interval_in_week,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_in_week == 0 {
            return Err(ScheduleError::InvalidInterval(
                "interval_in_week must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn week_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let monday = t.date_naive() - Duration::days(i64::from(t.weekday().num_days_from_monday()));
    monday.and_time(NaiveTime::MIN).and_utc()
}

fn weeks_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (week_start(to) - week_start(from)).num_days() / 7
}

impl ScheduleKind for WeeklySchedule {
    const TYPE_TAG: &'static str = "weekly";

    fn fire_time_after(&self, after: DateTime<Utc>, ctx: &FireContext) -> Option<DateTime<Utc>> {
        let interval = i64::from(self.interval_in_week);
        let mut cursor = after;
        for _ in 0..MAX_WEEK_JUMPS {
            let candidate = self.cron.fire_time_after(cursor, ctx)?;
            let offset = weeks_between(ctx.start, candidate);
            if offset % interval == 0 {
                return Some(candidate);
            }
            let skip = interval - offset % interval;
            cursor = week_start(candidate) + Duration::weeks(skip) - Duration::milliseconds(1);
        }
        None
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
        let stored: Self =
            serde_json::from_value(props.clone()).map_err(|e| ScheduleError::InvalidProperties {
                kind: Self::TYPE_TAG,
                reason: e.to_string(),
            })?;
        stored.validate()?;
        Ok(stored)
    }
}
