use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chronolock_core::{JobKey, TriggerKey};
use chronolock_schedule::{Calendar, FireContext, MisfireInstruction, Schedule};

/// Opaque key/value payload attached to jobs and triggers.
pub type JobData = BTreeMap<String, Value>;

/// Default trigger priority; higher fires first when fire times tie.
pub const DEFAULT_PRIORITY: i32 = 5;

/// A persisted job definition. Executing it is the host's business; the
/// store only tracks identity, flags and data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub description: Option<String>,
    /// Host-side identifier of the code to run.
    pub job_type: String,
    /// Durable jobs survive having no triggers.
    pub durable: bool,
    /// Re-run after the executing instance crashed mid-flight.
    pub requests_recovery: bool,
    pub concurrent_execution_disallowed: bool,
    pub persist_data_after_execution: bool,
    pub data: JobData,
}

impl Job {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            job_type: job_type.into(),
            durable: false,
            requests_recovery: false,
            concurrent_execution_disallowed: false,
            persist_data_after_execution: false,
            data: JobData::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.concurrent_execution_disallowed = disallow;
        self
    }

    pub fn persist_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Trigger lifecycle state.
///
/// ```text
/// WAITING ──acquire──▶ ACQUIRED ──fire──▶ WAITING | BLOCKED | COMPLETE
///    ▲                    │
///    └──release/recover───┘
/// WAITING ◀──pause/resume──▶ PAUSED      BLOCKED ◀──▶ PAUSED_BLOCKED
/// any ──error instruction──▶ ERROR
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Paused,
    /// Its job is executing and disallows concurrent execution.
    Blocked,
    PausedBlocked,
    /// No fire time remains.
    Complete,
    Error,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Paused => "PAUSED",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TriggerState::Waiting),
            "ACQUIRED" => Ok(TriggerState::Acquired),
            "PAUSED" => Ok(TriggerState::Paused),
            "BLOCKED" => Ok(TriggerState::Blocked),
            "PAUSED_BLOCKED" => Ok(TriggerState::PausedBlocked),
            "COMPLETE" => Ok(TriggerState::Complete),
            "ERROR" => Ok(TriggerState::Error),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// Attached to a trigger created to re-run a job whose executing instance died.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    /// The trigger whose fire was interrupted.
    pub original: TriggerKey,
    pub scheduled_fire_time: DateTime<Utc>,
    pub failed_instance: String,
}

/// A persisted trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub misfire_instruction: MisfireInstruction,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub calendar_name: Option<String>,
    pub data: JobData,
    pub schedule: Schedule,
    pub recovery: Option<RecoveryMarker>,
}

impl Trigger {
    /// A WAITING trigger whose first fire time is computed from `start_time`.
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule, start_time: DateTime<Utc>) -> Self {
        let mut trigger = Self {
            key,
            job_key,
            description: None,
            state: TriggerState::Waiting,
            next_fire_time: None,
            previous_fire_time: None,
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::Smart,
            start_time,
            end_time: None,
            calendar_name: None,
            data: JobData::new(),
            schedule,
            recovery: None,
        };
        trigger.compute_first_fire_time(None);
        trigger
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self.compute_first_fire_time(None);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    /// The store recomputes the first fire time against the named calendar.
    pub fn with_calendar(mut self, name: impl Into<String>) -> Self {
        self.calendar_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn fire_context(&self) -> FireContext {
        FireContext {
            start: self.start_time,
            end: self.end_time,
            previous: self.previous_fire_time,
        }
    }

    pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        self.next_fire_time = self.schedule.first_fire_time(&self.fire_context(), calendar);
        self.next_fire_time
    }

    /// Advance past the current fire time: it becomes the previous fire time
    /// and the next included time after it becomes the next one.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        let fired = self.next_fire_time;
        self.previous_fire_time = fired;
        self.next_fire_time = fired.and_then(|at| {
            self.schedule
                .next_included_fire_time(at, &self.fire_context(), calendar)
        });
    }

    /// Apply this trigger's misfire instruction as of `now`.
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        match self.schedule.resolve_misfire(self.misfire_instruction) {
            MisfireInstruction::FireNow => {
                let past_end = self.end_time.is_some_and(|end| now > end);
                self.next_fire_time = if past_end { None } else { Some(now) };
            }
            MisfireInstruction::DoNothing => {
                self.next_fire_time =
                    self.schedule
                        .next_included_fire_time(now, &self.fire_context(), calendar);
            }
            MisfireInstruction::IgnoreMisfirePolicy | MisfireInstruction::Smart => {}
        }
    }

    /// Recompute the next fire time after the referenced calendar changed.
    /// A next time already in the past is kept when still included, so the
    /// misfire check sees it.
    pub fn update_with_new_calendar(&mut self, calendar: &Calendar, now: DateTime<Utc>) {
        let Some(next) = self.next_fire_time else {
            return;
        };
        if calendar.is_time_included(next) {
            return;
        }
        let after = if next < now { now } else { next };
        self.next_fire_time =
            self.schedule
                .next_included_fire_time(after, &self.fire_context(), Some(calendar));
    }

    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }
}

/// How the host finished executing a fired trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    #[default]
    NoOp,
    DeleteTrigger,
    SetTriggerComplete,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

/// Everything the host needs to execute one fired trigger.
#[derive(Debug, Clone)]
pub struct FireResult {
    /// The trigger as persisted after firing (next fire time advanced).
    pub trigger: Trigger,
    pub job: Job,
    pub calendar: Option<Calendar>,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Present when this run re-executes a job interrupted by a crashed instance.
    pub recovering: Option<RecoveryMarker>,
}

/// Kind of resource a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Trigger,
    Job,
    /// Serialises recovery of one dead instance across live peers.
    Recovery,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Trigger => "trigger",
            ResourceType::Job => "job",
            ResourceType::Recovery => "recovery",
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "trigger" => Ok(ResourceType::Trigger),
            "job" => Ok(ResourceType::Job),
            "recovery" => Ok(ResourceType::Recovery),
            other => Err(format!("unknown resource type: {other}")),
        }
    }
}

/// Composite identity of a lock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub resource_type: ResourceType,
    pub group: String,
    pub name: String,
}

/// Group used for recovery locks; the name is the dead instance's id.
pub const RECOVERY_LOCK_GROUP: &str = "_$_RECOVERY_$_";

impl LockKey {
    pub fn trigger(key: &TriggerKey) -> Self {
        Self {
            resource_type: ResourceType::Trigger,
            group: key.group.clone(),
            name: key.name.clone(),
        }
    }

    pub fn job(key: &JobKey) -> Self {
        Self {
            resource_type: ResourceType::Job,
            group: key.group.clone(),
            name: key.name.clone(),
        }
    }

    pub fn recovery(instance_id: &str) -> Self {
        Self {
            resource_type: ResourceType::Recovery,
            group: RECOVERY_LOCK_GROUP.to_string(),
            name: instance_id.to_string(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.resource_type.as_str(), self.group, self.name)
    }
}

/// A lock row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: LockKey,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// The previous holder's lock had timed out and now belongs to us.
    Stolen { previous_owner: String },
    /// Someone (possibly this very instance) holds a live lock.
    Denied { owner: String },
}

impl LockOutcome {
    pub fn is_held(&self) -> bool {
        !matches!(self, LockOutcome::Denied { .. })
    }
}

/// One instance's heartbeat row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerCheckin {
    pub scheduler_name: String,
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

impl SchedulerCheckin {
    /// Dead once the last checkin is older than `interval * dead_factor`.
    pub fn is_dead(&self, now: DateTime<Utc>, dead_factor: u32) -> bool {
        let age = (now - self.last_checkin).num_milliseconds();
        age > self.checkin_interval_ms.saturating_mul(i64::from(dead_factor))
    }
}
