use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    calendar::Calendar,
    cron_expr::CronSchedule,
    error::{Result, ScheduleError},
    misfire::MisfireInstruction,
    simple::SimpleSchedule,
    weekly::WeeklySchedule,
};

/// Upper bound on how many calendar-excluded fire times are skipped before
/// the trigger is considered exhausted.
const MAX_CALENDAR_SKIPS: usize = 10_000;

/// Trigger-level bounds a schedule is evaluated within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireContext {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// The last time the trigger actually fired, if ever.
    pub previous: Option<DateTime<Utc>>,
}

impl FireContext {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: None,
            previous: None,
        }
    }

    fn past_end(&self, t: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| t > end)
    }
}

/// One pluggable way of computing fire times.
///
/// Each kind owns the extra properties it needs and knows how to write them
/// out and read them back; the stored [`ScheduleKind::TYPE_TAG`] picks the
/// kind when a trigger is loaded.
pub trait ScheduleKind: Sized {
    const TYPE_TAG: &'static str;

    /// The first fire time strictly after `after`, honouring the context's
    /// start and end bounds. `None` when the schedule is exhausted.
    fn fire_time_after(&self, after: DateTime<Utc>, ctx: &FireContext) -> Option<DateTime<Utc>>;

    /// The concrete instruction `MisfireInstruction::Smart` resolves to.
    fn smart_misfire(&self) -> MisfireInstruction;

    fn extra_properties(&self) -> Result<Value>;

    fn restore(props: &Value) -> Result<Self>;
}

/// Every schedule kind a trigger can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Simple(SimpleSchedule),
    Cron(CronSchedule),
    Weekly(WeeklySchedule),
}

struct RegistryEntry {
    tag: &'static str,
    restore: fn(&Value) -> Result<Schedule>,
}

static REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        tag: SimpleSchedule::TYPE_TAG,
        restore: restore_simple,
    },
    RegistryEntry {
        tag: CronSchedule::TYPE_TAG,
        restore: restore_cron,
    },
    RegistryEntry {
        tag: WeeklySchedule::TYPE_TAG,
        restore: restore_weekly,
    },
];

fn restore_simple(props: &Value) -> Result<Schedule> {
    SimpleSchedule::restore(props).map(Schedule::Simple)
}

fn restore_cron(props: &Value) -> Result<Schedule> {
    CronSchedule::restore(props).map(Schedule::Cron)
}

fn restore_weekly(props: &Value) -> Result<Schedule> {
    WeeklySchedule::restore(props).map(Schedule::Weekly)
}

/// Rebuild a schedule from its stored type tag and extra properties.
pub fn restore(tag: &str, props: &Value) -> Result<Schedule> {
    REGISTRY
        .iter()
        .find(|entry| entry.tag == tag)
        .map(|entry| (entry.restore)(props))
        .unwrap_or_else(|| Err(ScheduleError::UnknownKind(tag.to_string())))
}

/// Type tags of every registered kind.
pub fn registered_kinds() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|entry| entry.tag)
}

impl Schedule {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Schedule::Simple(_) => SimpleSchedule::TYPE_TAG,
            Schedule::Cron(_) => CronSchedule::TYPE_TAG,
            Schedule::Weekly(_) => WeeklySchedule::TYPE_TAG,
        }
    }

    /// Checks the invariants the constructors enforce, for schedules built
    /// from public fields.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Simple(s) => s.validate(),
            Schedule::Cron(_) => Ok(()),
            Schedule::Weekly(s) => s.validate(),
        }
    }

    pub fn fire_time_after(&self, after: DateTime<Utc>, ctx: &FireContext) -> Option<DateTime<Utc>> {
        let next = match self {
            Schedule::Simple(s) => s.fire_time_after(after, ctx),
            Schedule::Cron(s) => s.fire_time_after(after, ctx),
            Schedule::Weekly(s) => s.fire_time_after(after, ctx),
        }?;
        if ctx.past_end(next) {
            None
        } else {
            Some(next)
        }
    }

    /// First fire time at or after `ctx.start`.
    pub fn first_fire_time(&self, ctx: &FireContext, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        self.next_included_fire_time(ctx.start - Duration::milliseconds(1), ctx, calendar)
    }

    /// Like [`Schedule::fire_time_after`] but skips instants the calendar excludes.
    pub fn next_included_fire_time(
        &self,
        after: DateTime<Utc>,
        ctx: &FireContext,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let mut next = self.fire_time_after(after, ctx)?;
        let Some(calendar) = calendar else {
            return Some(next);
        };
        for _ in 0..MAX_CALENDAR_SKIPS {
            if calendar.is_time_included(next) {
                return Some(next);
            }
            next = self.fire_time_after(next, ctx)?;
        }
        None
    }

    /// Replace `Smart` with the kind's concrete default.
    pub fn resolve_misfire(&self, instruction: MisfireInstruction) -> MisfireInstruction {
        if instruction != MisfireInstruction::Smart {
            return instruction;
        }
        match self {
            Schedule::Simple(s) => s.smart_misfire(),
            Schedule::Cron(s) => s.smart_misfire(),
            Schedule::Weekly(s) => s.smart_misfire(),
        }
    }

    pub fn extra_properties(&self) -> Result<Value> {
        match self {
            Schedule::Simple(s) => s.extra_properties(),
            Schedule::Cron(s) => s.extra_properties(),
            Schedule::Weekly(s) => s.extra_properties(),
        }
    }
}
