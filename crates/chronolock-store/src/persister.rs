use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use chronolock_core::{JobKey, TriggerKey};
use chronolock_schedule::Calendar;

use crate::{
    dao::{CalendarDao, JobDao, TriggerDao},
    db::Tables,
    error::{Result, StoreError},
    lock::LockManager,
    state::TriggerStateManager,
    types::{Job, LockKey, Trigger},
};

/// Job / trigger / calendar writes that touch more than one row. Every
/// method runs inside the caller's transaction, so a failure part-way leaves
/// nothing behind once the caller rolls back.
pub struct Persister {
    jobs: JobDao,
    triggers: TriggerDao,
    calendars: CalendarDao,
    state: Arc<TriggerStateManager>,
    locks: Arc<LockManager>,
}

impl Persister {
    pub fn new(tables: Arc<Tables>, state: Arc<TriggerStateManager>, locks: Arc<LockManager>) -> Self {
        Self {
            jobs: JobDao::new(tables.clone()),
            triggers: TriggerDao::new(tables.clone()),
            calendars: CalendarDao::new(tables),
            state,
            locks,
        }
    }

    pub fn store_job(&self, conn: &Connection, job: &Job, replace: bool) -> Result<()> {
        if replace && self.jobs.update(conn, job)? {
            debug!(job = %job.key, "job replaced");
            return Ok(());
        }
        self.jobs.insert(conn, job)?;
        debug!(job = %job.key, "job stored");
        Ok(())
    }

    /// Store a trigger whose job must already exist and whose schedule
    /// passes validation. The first fire time is
    /// computed against the trigger's calendar, and the initial state
    /// reflects paused groups and a running non-concurrent job.
    pub fn store_trigger(&self, conn: &Connection, trigger: &Trigger, replace: bool) -> Result<()> {
        if !self.jobs.exists(conn, &trigger.job_key)? {
            return Err(StoreError::ReferentialViolation {
                trigger: trigger.key.to_string(),
                job: trigger.job_key.to_string(),
            });
        }
        trigger
            .schedule
            .validate()
            .map_err(|e| StoreError::InvalidTrigger(format!("{}: {e}", trigger.key)))?;
        let calendar = self.calendar_for(conn, trigger)?;

        let mut trigger = trigger.clone();
        if trigger.previous_fire_time.is_none()
            && trigger.compute_first_fire_time(calendar.as_ref()).is_none()
        {
            return Err(StoreError::InvalidTrigger(format!(
                "{} will never fire",
                trigger.key
            )));
        }
        trigger.state = self.state.initial_state(conn, &trigger.key, &trigger.job_key)?;

        if replace && self.triggers.update(conn, &trigger)? {
            debug!(trigger = %trigger.key, state = %trigger.state, "trigger replaced");
            return Ok(());
        }
        self.triggers.insert(conn, &trigger)?;
        debug!(trigger = %trigger.key, state = %trigger.state, "trigger stored");
        Ok(())
    }

    fn calendar_for(&self, conn: &Connection, trigger: &Trigger) -> Result<Option<Calendar>> {
        let Some(name) = &trigger.calendar_name else {
            return Ok(None);
        };
        match self.calendars.get(conn, name)? {
            Some(calendar) => Ok(Some(calendar)),
            None => Err(StoreError::InvalidTrigger(format!(
                "{} references missing calendar {name}",
                trigger.key
            ))),
        }
    }

    pub fn store_job_and_trigger(&self, conn: &Connection, job: &Job, trigger: &Trigger) -> Result<()> {
        self.store_job(conn, job, false)?;
        self.store_trigger(conn, trigger, false)
    }

    pub fn store_jobs_and_triggers(&self, conn: &Connection, batch: &[(Job, Vec<Trigger>)], replace: bool) -> Result<()> {
        for (job, triggers) in batch {
            self.store_job(conn, job, replace)?;
            for trigger in triggers {
                self.store_trigger(conn, trigger, replace)?;
            }
        }
        Ok(())
    }

    /// Remove a trigger and its lock. A non-durable job left without
    /// triggers is removed with it. `false` if the trigger did not exist.
    pub fn remove_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<bool> {
        let Some(trigger) = self.triggers.get(conn, key)? else {
            return Ok(false);
        };
        self.triggers.delete(conn, key)?;
        self.locks.force_release(conn, &LockKey::trigger(key))?;
        self.remove_orphaned_job(conn, &trigger.job_key)?;
        debug!(trigger = %key, "trigger removed");
        Ok(true)
    }

    fn remove_orphaned_job(&self, conn: &Connection, job_key: &JobKey) -> Result<()> {
        let Some(job) = self.jobs.get(conn, job_key)? else {
            return Ok(());
        };
        if !job.durable && self.triggers.count_for_job(conn, job_key)? == 0 {
            self.jobs.delete(conn, job_key)?;
            self.locks.force_release(conn, &LockKey::job(job_key))?;
            info!(job = %job_key, "orphaned non-durable job removed");
        }
        Ok(())
    }

    /// Remove a job after all of its triggers. `false` if it did not exist.
    pub fn remove_job(&self, conn: &Connection, key: &JobKey) -> Result<bool> {
        for trigger in self.triggers.for_job(conn, key)? {
            self.triggers.delete(conn, &trigger.key)?;
            self.locks.force_release(conn, &LockKey::trigger(&trigger.key))?;
        }
        let removed = self.jobs.delete(conn, key)?;
        if removed {
            self.locks.force_release(conn, &LockKey::job(key))?;
            debug!(job = %key, "job removed");
        }
        Ok(removed)
    }

    /// Swap the trigger stored under `key` for `new_trigger`. Both must
    /// belong to the same job; the old data map is merged into the new one
    /// with the new values winning. `false` if nothing was stored under `key`.
    pub fn replace_trigger(&self, conn: &Connection, key: &TriggerKey, new_trigger: &Trigger) -> Result<bool> {
        let Some(old) = self.triggers.get(conn, key)? else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(StoreError::InvalidTrigger(format!(
                "replacement for {key} belongs to job {} instead of {}",
                new_trigger.job_key, old.job_key
            )));
        }
        let mut merged = new_trigger.clone();
        for (k, v) in old.data {
            merged.data.entry(k).or_insert(v);
        }
        self.triggers.delete(conn, key)?;
        self.locks.force_release(conn, &LockKey::trigger(key))?;
        self.store_trigger(conn, &merged, false)?;
        info!(old = %key, new = %merged.key, "trigger replaced");
        Ok(true)
    }

    pub fn retrieve_job(&self, conn: &Connection, key: &JobKey) -> Result<Option<Job>> {
        self.jobs.get(conn, key)
    }

    pub fn retrieve_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.triggers.get(conn, key)
    }

    pub fn triggers_for_job(&self, conn: &Connection, key: &JobKey) -> Result<Vec<Trigger>> {
        self.triggers.for_job(conn, key)
    }

    /// Store a calendar. With `update_triggers`, every trigger referencing it
    /// has its next fire time recomputed.
    pub fn store_calendar(
        &self,
        conn: &Connection,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !(replace && self.calendars.update(conn, name, calendar)?) {
            self.calendars.insert(conn, name, calendar)?;
        }
        if update_triggers {
            let referencing = self.triggers.with_calendar(conn, name)?;
            let count = referencing.len();
            for mut trigger in referencing {
                trigger.update_with_new_calendar(calendar, now);
                self.triggers.update(conn, &trigger)?;
            }
            debug!(calendar = name, count, "triggers rescheduled for calendar");
        }
        Ok(())
    }

    pub fn remove_calendar(&self, conn: &Connection, name: &str) -> Result<bool> {
        let referencing = self.triggers.count_with_calendar(conn, name)?;
        if referencing > 0 {
            return Err(StoreError::CalendarInUse {
                name: name.to_string(),
                triggers: referencing,
            });
        }
        self.calendars.delete(conn, name)
    }

    pub fn retrieve_calendar(&self, conn: &Connection, name: &str) -> Result<Option<Calendar>> {
        self.calendars.get(conn, name)
    }

    /// Remove every job, trigger and calendar.
    pub fn clear(&self, conn: &Connection) -> Result<()> {
        self.triggers.delete_all(conn)?;
        self.jobs.delete_all(conn)?;
        self.calendars.delete_all(conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::init_db, types::TriggerState};
    use chrono::TimeZone;
    use chronolock_core::ManualClock;
    use chronolock_schedule::{Schedule, SimpleSchedule};

    struct Fixture {
        conn: Connection,
        persister: Persister,
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        init_db(&conn, &tables).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let locks = Arc::new(LockManager::new(tables.clone(), "a", clock, 60_000, 60_000));
        let state = Arc::new(TriggerStateManager::new(tables.clone(), locks.clone()));
        Fixture {
            conn,
            persister: Persister::new(tables, state, locks),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
    }

    fn job(name: &str) -> Job {
        Job::new(JobKey::new("g", name), "noop")
    }

    fn trigger(name: &str, job: &str) -> Trigger {
        Trigger::new(
            TriggerKey::new("g", name),
            JobKey::new("g", job),
            Schedule::Simple(SimpleSchedule::forever(60_000).unwrap()),
            t0(),
        )
    }

    #[test]
    fn trigger_for_missing_job_is_rejected() {
        let f = fixture();
        let err = f
            .persister
            .store_trigger(&f.conn, &trigger("t", "ghost"), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::ReferentialViolation { .. }));
    }

    #[test]
    fn removing_last_trigger_removes_non_durable_job() {
        let f = fixture();
        f.persister.store_job(&f.conn, &job("j"), false).unwrap();
        f.persister.store_trigger(&f.conn, &trigger("t1", "j"), false).unwrap();
        f.persister.store_trigger(&f.conn, &trigger("t2", "j"), false).unwrap();

        assert!(f.persister.remove_trigger(&f.conn, &TriggerKey::new("g", "t1")).unwrap());
        assert!(f.persister.retrieve_job(&f.conn, &JobKey::new("g", "j")).unwrap().is_some());

        assert!(f.persister.remove_trigger(&f.conn, &TriggerKey::new("g", "t2")).unwrap());
        assert!(f.persister.retrieve_job(&f.conn, &JobKey::new("g", "j")).unwrap().is_none());
        assert!(!f.persister.remove_trigger(&f.conn, &TriggerKey::new("g", "t2")).unwrap());
    }

    #[test]
    fn durable_job_survives_without_triggers() {
        let f = fixture();
        f.persister.store_job(&f.conn, &job("j").durable(true), false).unwrap();
        f.persister.store_trigger(&f.conn, &trigger("t", "j"), false).unwrap();
        f.persister.remove_trigger(&f.conn, &TriggerKey::new("g", "t")).unwrap();
        assert!(f.persister.retrieve_job(&f.conn, &JobKey::new("g", "j")).unwrap().is_some());
    }

    #[test]
    fn remove_job_takes_its_triggers() {
        let f = fixture();
        f.persister.store_job_and_trigger(&f.conn, &job("j"), &trigger("t", "j")).unwrap();
        assert!(f.persister.remove_job(&f.conn, &JobKey::new("g", "j")).unwrap());
        assert!(f
            .persister
            .retrieve_trigger(&f.conn, &TriggerKey::new("g", "t"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn replace_merges_data_and_requires_same_job() {
        let f = fixture();
        f.persister.store_job(&f.conn, &job("j"), false).unwrap();
        f.persister.store_job(&f.conn, &job("other").durable(true), false).unwrap();
        f.persister
            .store_trigger(&f.conn, &trigger("t", "j").with_data("a", 1).with_data("b", 1), false)
            .unwrap();

        let foreign = trigger("t2", "other");
        assert!(matches!(
            f.persister.replace_trigger(&f.conn, &TriggerKey::new("g", "t"), &foreign),
            Err(StoreError::InvalidTrigger(_))
        ));

        let new = trigger("t2", "j").with_data("b", 2);
        assert!(f
            .persister
            .replace_trigger(&f.conn, &TriggerKey::new("g", "t"), &new)
            .unwrap());
        let stored = f
            .persister
            .retrieve_trigger(&f.conn, &TriggerKey::new("g", "t2"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.data["a"], 1);
        assert_eq!(stored.data["b"], 2);
        assert_eq!(stored.state, TriggerState::Waiting);
        // Replacing must not orphan-delete the job in between.
        assert!(f.persister.retrieve_job(&f.conn, &JobKey::new("g", "j")).unwrap().is_some());
    }

    #[test]
    fn calendar_in_use_cannot_be_removed() {
        let f = fixture();
        f.persister
            .store_calendar(&f.conn, "weekends", &Calendar::weekly([5, 6]).unwrap(), false, false, t0())
            .unwrap();
        f.persister.store_job(&f.conn, &job("j"), false).unwrap();
        f.persister
            .store_trigger(&f.conn, &trigger("t", "j").with_calendar("weekends"), false)
            .unwrap();
        assert!(matches!(
            f.persister.remove_calendar(&f.conn, "weekends"),
            Err(StoreError::CalendarInUse { triggers: 1, .. })
        ));
    }

    #[test]
    fn missing_calendar_is_rejected() {
        let f = fixture();
        f.persister.store_job(&f.conn, &job("j"), false).unwrap();
        let err = f
            .persister
            .store_trigger(&f.conn, &trigger("t", "j").with_calendar("nope"), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTrigger(_)));
    }

    #[test]
    fn hand_built_zero_interval_schedule_is_rejected() {
        let f = fixture();
        f.persister.store_job(&f.conn, &job("j"), false).unwrap();
        let broken = Trigger::new(
            TriggerKey::new("g", "spin"),
            JobKey::new("g", "j"),
            Schedule::Simple(SimpleSchedule {
                repeat_interval_ms: 0,
                repeat_count: 5,
            }),
            t0(),
        );
        let err = f.persister.store_trigger(&f.conn, &broken, false).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTrigger(_)));
        assert!(f
            .persister
            .retrieve_trigger(&f.conn, &TriggerKey::new("g", "spin"))
            .unwrap()
            .is_none());
    }
}
