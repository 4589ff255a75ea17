use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, ScheduleError},
    misfire::MisfireInstruction,
    schedule::{FireContext, ScheduleKind},
};

/// `repeat_count` value meaning "repeat until the end time, if any".
pub const REPEAT_INDEFINITELY: i64 = -1;

/// Fires at the trigger's start time, then every `repeat_interval_ms`,
/// `repeat_count` more times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    pub repeat_interval_ms: i64,
    pub repeat_count: i64,
}

impl SimpleSchedule {
    /// A single fire at the start time.
    pub fn once() -> Self {
        Self {
            repeat_interval_ms: 0,
            repeat_count: 0,
        }
    }

    pub fn repeating(interval_ms: i64, repeat_count: i64) -> Result<Self> {
        let schedule = Self {
            repeat_interval_ms: interval_ms,
            repeat_count,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn forever(interval_ms: i64) -> Result<Self> {
        Self::repeating(interval_ms, REPEAT_INDEFINITELY)
    }

    /// Rejects negative counts and repeats without a positive interval.
    pub fn validate(&self) -> Result<()> {
        if self.repeat_count < REPEAT_INDEFINITELY {
            return Err(ScheduleError::InvalidInterval(format!(
                "repeat count {} is negative",
                self.repeat_count
            )));
        }
        if self.repeat_count != 0 && self.repeat_interval_ms <= 0 {
            return Err(ScheduleError::InvalidInterval(
                "a repeating schedule needs a positive interval".into(),
            ));
        }
        Ok(())
    }
}

impl ScheduleKind for SimpleSchedule {
    const TYPE_TAG: &'static str = "simple";

    fn fire_time_after(&self, after: DateTime<Utc>, ctx: &FireContext) -> Option<DateTime<Utc>> {
        let n = if after < ctx.start {
            0
        } else if self.repeat_count == 0 {
            return None;
        } else {
            (after - ctx.start)
                .num_milliseconds()
                .checked_div(self.repeat_interval_ms)?
                + 1
        };
        if self.repeat_count != REPEAT_INDEFINITELY && n > self.repeat_count {
            return None;
        }
        let offset = n.checked_mul(self.repeat_interval_ms)?;
        ctx.start.checked_add_signed(Duration::milliseconds(offset))
    }

    fn smart_misfire(&self) -> MisfireInstruction {
        match self.repeat_count {
            0 => MisfireInstruction::FireNow,
            REPEAT_INDEFINITELY => MisfireInstruction::DoNothing,
            _ => MisfireInstruction::FireNow,
        }
    }

    fn extra_properties(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ScheduleError::InvalidProperties {
            kind: Self::TYPE_TAG,
            reason: e.to_string(),
        })
    }

    fn restore(props: &Value) -> Result<Self> {
        let schedule: Self =
            serde_json::from_value(props.clone()).map_err(|e| ScheduleError::InvalidProperties {
                kind: Self::TYPE_TAG,
                reason: e.to_string(),
            })?;
        schedule.validate()?;
        Ok(schedule)
    }
}
