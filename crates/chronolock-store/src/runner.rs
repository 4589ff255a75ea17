use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use chronolock_core::{Clock, JobKey, TriggerKey};

use crate::{
    dao::{CalendarDao, JobDao, TriggerDao},
    db::Tables,
    error::Result,
    lock::LockManager,
    misfire::MisfireHandler,
    state::TriggerStateManager,
    types::{FireResult, LockKey, LockOutcome, ResourceType, Trigger, TriggerState},
};

/// Extra candidates read per acquisition beyond `max_count`, to make up for
/// ones that get skipped.
const CANDIDATE_SLACK: usize = 16;

fn by_fire_time_then_priority(a: &Trigger, b: &Trigger) -> Ordering {
    a.next_fire_time
        .cmp(&b.next_fire_time)
        .then(b.priority.cmp(&a.priority))
}

/// The acquire → misfire-check → fire → release lifecycle.
pub struct TriggerRunner {
    triggers: TriggerDao,
    jobs: JobDao,
    calendars: CalendarDao,
    locks: Arc<LockManager>,
    misfire: Arc<MisfireHandler>,
    state: Arc<TriggerStateManager>,
    clock: Arc<dyn Clock>,
}

impl TriggerRunner {
    pub fn new(
        tables: Arc<Tables>,
        locks: Arc<LockManager>,
        misfire: Arc<MisfireHandler>,
        state: Arc<TriggerStateManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            triggers: TriggerDao::new(tables.clone()),
            jobs: JobDao::new(tables.clone()),
            calendars: CalendarDao::new(tables),
            locks,
            misfire,
            state,
            clock,
        }
    }

    /// Lock and mark ACQUIRED up to `max_count` WAITING triggers due no later
    /// than `no_later_than + time_window`. ACQUIRED triggers whose lock has
    /// timed out are candidates too. Misfire policy is applied to each
    /// locked trigger before it is handed out; a trigger it pushes past the
    /// window is released again. At most one trigger per non-concurrent job
    /// is acquired per call.
    pub fn acquire_next(
        &self,
        conn: &Connection,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let horizon = no_later_than + time_window;
        let mut candidates = self
            .triggers
            .acquirable(conn, horizon, max_count + CANDIDATE_SLACK)?;
        let abandoned = self.triggers.stale_acquired(
            conn,
            horizon,
            self.locks.stale_before(ResourceType::Trigger),
            max_count,
        )?;
        if !abandoned.is_empty() {
            candidates.extend(abandoned);
            candidates.sort_by(by_fire_time_then_priority);
        }

        let mut acquired: Vec<Trigger> = Vec::with_capacity(max_count);
        let mut exclusive_jobs: HashSet<JobKey> = HashSet::new();

        for mut trigger in candidates {
            if acquired.len() >= max_count {
                break;
            }
            let Some(job) = self.jobs.get(conn, &trigger.job_key)? else {
                warn!(trigger = %trigger.key, job = %trigger.job_key, "trigger references missing job");
                continue;
            };
            if job.concurrent_execution_disallowed && exclusive_jobs.contains(&job.key) {
                continue;
            }

            let lock_key = LockKey::trigger(&trigger.key);
            match self.locks.try_acquire(conn, &lock_key)? {
                LockOutcome::Denied { owner } => {
                    debug!(trigger = %trigger.key, %owner, "trigger locked elsewhere, skipped");
                    continue;
                }
                LockOutcome::Stolen { previous_owner } => {
                    info!(trigger = %trigger.key, %previous_owner, "trigger lock taken over");
                }
                LockOutcome::Granted => {}
            }

            if self.misfire.apply(conn, &mut trigger)? {
                match trigger.next_fire_time {
                    None => {
                        trigger.state = TriggerState::Complete;
                        self.triggers.update(conn, &trigger)?;
                        self.locks.release(conn, &lock_key)?;
                        info!(trigger = %trigger.key, "misfired trigger has no fire time left");
                        continue;
                    }
                    Some(next) if next > horizon => {
                        trigger.state = TriggerState::Waiting;
                        self.triggers.update(conn, &trigger)?;
                        self.locks.release(conn, &lock_key)?;
                        continue;
                    }
                    Some(_) => {}
                }
            }

            trigger.state = TriggerState::Acquired;
            self.triggers.update(conn, &trigger)?;
            if job.concurrent_execution_disallowed {
                exclusive_jobs.insert(job.key.clone());
            }
            acquired.push(trigger);
        }

        acquired.sort_by(by_fire_time_then_priority);
        if !acquired.is_empty() {
            debug!(count = acquired.len(), "triggers acquired");
        }
        Ok(acquired)
    }

    /// Hand an acquired trigger back without firing it. A no-op when the
    /// trigger lock has since passed to another instance.
    pub fn release_acquired(&self, conn: &Connection, key: &TriggerKey) -> Result<()> {
        let lock_key = LockKey::trigger(key);
        if !self.locks.holds(conn, &lock_key)? {
            debug!(trigger = %key, "release skipped: trigger lock not held");
            return Ok(());
        }
        self.triggers
            .transition(conn, key, &[TriggerState::Acquired], TriggerState::Waiting)?;
        self.locks.release(conn, &lock_key)?;
        Ok(())
    }

    /// Fire one previously acquired trigger. `None` means the trigger must
    /// not run (deleted, paused, lock lost, job gone, calendar gone, or its
    /// non-concurrent job is already executing).
    pub fn trigger_fired(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<FireResult>> {
        let lock_key = LockKey::trigger(key);
        let Some(mut trigger) = self.triggers.get(conn, key)? else {
            debug!(trigger = %key, "fired trigger no longer exists");
            return Ok(None);
        };
        if !self.locks.holds(conn, &lock_key)? {
            warn!(trigger = %key, "trigger lock lost before firing");
            return Ok(None);
        }
        if trigger.state != TriggerState::Acquired {
            debug!(trigger = %key, state = %trigger.state, "trigger not acquired, not firing");
            self.locks.release(conn, &lock_key)?;
            return Ok(None);
        }
        let Some(job) = self.jobs.get(conn, &trigger.job_key)? else {
            debug!(trigger = %key, job = %trigger.job_key, "job of fired trigger no longer exists");
            self.locks.release(conn, &lock_key)?;
            return Ok(None);
        };
        let calendar = match &trigger.calendar_name {
            Some(name) => match self.calendars.get(conn, name)? {
                Some(calendar) => Some(calendar),
                None => {
                    warn!(trigger = %key, calendar = %name, "calendar missing, trigger set to ERROR");
                    self.triggers.set_state(conn, key, TriggerState::Error)?;
                    self.locks.release(conn, &lock_key)?;
                    return Ok(None);
                }
            },
            None => None,
        };
        let Some(scheduled_fire_time) = trigger.next_fire_time else {
            self.triggers.set_state(conn, key, TriggerState::Complete)?;
            self.locks.release(conn, &lock_key)?;
            return Ok(None);
        };

        if job.concurrent_execution_disallowed {
            let job_lock = LockKey::job(&job.key);
            if let LockOutcome::Denied { owner } = self.locks.try_acquire(conn, &job_lock)? {
                debug!(trigger = %key, job = %job.key, %owner, "job already executing, trigger blocked");
                self.triggers.set_state(conn, key, TriggerState::Blocked)?;
                self.locks.release(conn, &lock_key)?;
                return Ok(None);
            }
            self.state.block_job_triggers(conn, &job.key)?;
        }

        let previous_fire_time = trigger.previous_fire_time;
        trigger.triggered(calendar.as_ref());
        trigger.state = if !trigger.may_fire_again() {
            TriggerState::Complete
        } else if job.concurrent_execution_disallowed {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };
        self.triggers.update(conn, &trigger)?;

        info!(
            trigger = %key,
            job = %job.key,
            scheduled = %scheduled_fire_time,
            next = ?trigger.next_fire_time,
            "trigger fired"
        );
        Ok(Some(FireResult {
            recovering: trigger.recovery.clone(),
            next_fire_time: trigger.next_fire_time,
            trigger,
            job,
            calendar,
            fire_time: self.clock.now(),
            scheduled_fire_time,
            previous_fire_time,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::init_db, persister::Persister, types::Job};
    use chrono::TimeZone;
    use chronolock_core::ManualClock;
    use chronolock_schedule::{Calendar, MisfireInstruction, Schedule, SimpleSchedule};

    struct Fixture {
        conn: Connection,
        clock: Arc<ManualClock>,
        persister: Persister,
        locks: Arc<LockManager>,
        runner: TriggerRunner,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        init_db(&conn, &tables).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let locks = Arc::new(LockManager::new(tables.clone(), "a", clock.clone(), 60_000, 60_000));
        let misfire = Arc::new(MisfireHandler::new(tables.clone(), clock.clone(), 5_000));
        let state = Arc::new(TriggerStateManager::new(tables.clone(), locks.clone()));
        Fixture {
            conn,
            persister: Persister::new(tables.clone(), state.clone(), locks.clone()),
            runner: TriggerRunner::new(tables, locks.clone(), misfire, state, clock.clone()),
            locks,
            clock,
        }
    }

    fn every_minute(name: &str, job: &str) -> Trigger {
        Trigger::new(
            TriggerKey::new("g", name),
            JobKey::new("g", job),
            Schedule::Simple(SimpleSchedule::forever(60_000).unwrap()),
            t0(),
        )
    }

    #[test]
    fn acquires_due_trigger_and_locks_it() {
        let f = fixture();
        f.persister
            .store_job_and_trigger(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), &every_minute("t", "j"))
            .unwrap();

        let acquired = f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].state, TriggerState::Acquired);
        assert!(f.locks.holds(&f.conn, &LockKey::trigger(&acquired[0].key)).unwrap());

        // Already ACQUIRED: a second pass finds nothing.
        assert!(f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap().is_empty());
    }

    #[test]
    fn respects_window_and_max_count() {
        let f = fixture();
        f.persister.store_job(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), false).unwrap();
        for (name, offset) in [("a", 0), ("b", 10), ("c", 120)] {
            let t = Trigger::new(
                TriggerKey::new("g", name),
                JobKey::new("g", "j"),
                Schedule::Simple(SimpleSchedule::once()),
                t0() + Duration::seconds(offset),
            );
            f.persister.store_trigger(&f.conn, &t, false).unwrap();
        }
        let acquired = f
            .runner
            .acquire_next(&f.conn, t0(), 5, Duration::seconds(30))
            .unwrap();
        let names: Vec<_> = acquired.iter().map(|t| t.key.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        f.runner.release_acquired(&f.conn, &TriggerKey::new("g", "a")).unwrap();
        f.runner.release_acquired(&f.conn, &TriggerKey::new("g", "b")).unwrap();
        let acquired = f.runner.acquire_next(&f.conn, t0(), 1, Duration::seconds(30)).unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].key.name, "a");
    }

    #[test]
    fn higher_priority_wins_a_tie() {
        let f = fixture();
        f.persister.store_job(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), false).unwrap();
        f.persister.store_trigger(&f.conn, &every_minute("low", "j").with_priority(1), false).unwrap();
        f.persister.store_trigger(&f.conn, &every_minute("high", "j").with_priority(9), false).unwrap();
        let acquired = f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        assert_eq!(acquired[0].key.name, "high");
    }

    #[test]
    fn misfired_trigger_is_corrected_before_hand_out() {
        let f = fixture();
        let t = Trigger::new(
            TriggerKey::new("g", "late"),
            JobKey::new("g", "j"),
            Schedule::Simple(SimpleSchedule::once()),
            t0() - Duration::hours(1),
        )
        .with_misfire_instruction(MisfireInstruction::FireNow);
        f.persister
            .store_job_and_trigger(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), &t)
            .unwrap();
        let acquired = f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].next_fire_time, Some(t0()));
    }

    #[test]
    fn fire_advances_and_returns_bundle() {
        let f = fixture();
        f.persister
            .store_job_and_trigger(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), &every_minute("t", "j"))
            .unwrap();
        let key = TriggerKey::new("g", "t");
        f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        let fired = f.runner.trigger_fired(&f.conn, &key).unwrap().unwrap();
        assert_eq!(fired.scheduled_fire_time, t0());
        assert_eq!(fired.next_fire_time, Some(t0() + Duration::minutes(1)));
        assert_eq!(fired.trigger.state, TriggerState::Waiting);
        assert_eq!(fired.job.key, JobKey::new("g", "j"));
        assert!(fired.recovering.is_none());
        // Held until the job completes.
        assert!(f.locks.holds(&f.conn, &LockKey::trigger(&key)).unwrap());
    }

    #[test]
    fn fire_of_deleted_trigger_is_omitted() {
        let f = fixture();
        f.persister
            .store_job_and_trigger(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), &every_minute("t", "j"))
            .unwrap();
        let key = TriggerKey::new("g", "t");
        f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        f.persister.remove_trigger(&f.conn, &key).unwrap();
        assert!(f.runner.trigger_fired(&f.conn, &key).unwrap().is_none());
    }

    #[test]
    fn fire_of_paused_trigger_is_omitted_and_unlocked() {
        let f = fixture();
        f.persister
            .store_job_and_trigger(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), &every_minute("t", "j"))
            .unwrap();
        let key = TriggerKey::new("g", "t");
        f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        f.runner.state.pause_trigger(&f.conn, &key).unwrap();
        assert!(f.runner.trigger_fired(&f.conn, &key).unwrap().is_none());
        assert!(f.locks.get(&f.conn, &LockKey::trigger(&key)).unwrap().is_none());
    }

    #[test]
    fn non_concurrent_job_blocks_siblings() {
        let f = fixture();
        let job = Job::new(JobKey::new("g", "j"), "noop").disallow_concurrent_execution(true);
        f.persister.store_job(&f.conn, &job, false).unwrap();
        f.persister.store_trigger(&f.conn, &every_minute("t1", "j"), false).unwrap();
        f.persister.store_trigger(&f.conn, &every_minute("t2", "j"), false).unwrap();

        // One trigger per non-concurrent job per batch.
        let acquired = f.runner.acquire_next(&f.conn, t0(), 5, Duration::zero()).unwrap();
        assert_eq!(acquired.len(), 1);
        let fired = f
            .runner
            .trigger_fired(&f.conn, &acquired[0].key)
            .unwrap()
            .unwrap();
        assert_eq!(fired.trigger.state, TriggerState::Blocked);
        assert!(f.locks.holds(&f.conn, &LockKey::job(&job.key)).unwrap());
        for t in f.persister.triggers_for_job(&f.conn, &job.key).unwrap() {
            assert_eq!(t.state, TriggerState::Blocked);
        }
    }

    #[test]
    fn missing_calendar_puts_trigger_in_error() {
        let f = fixture();
        f.persister
            .store_calendar(&f.conn, "cal", &Calendar::holiday(Vec::<chrono::NaiveDate>::new()), false, false, t0())
            .unwrap();
        f.persister
            .store_job_and_trigger(
                &f.conn,
                &Job::new(JobKey::new("g", "j"), "noop"),
                &every_minute("t", "j").with_calendar("cal"),
            )
            .unwrap();
        let key = TriggerKey::new("g", "t");
        f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap();
        // Bypass the in-use check to simulate a concurrent removal.
        crate::dao::CalendarDao::new(Arc::new(Tables::new("qrtz_").unwrap()))
            .delete(&f.conn, "cal")
            .unwrap();
        assert!(f.runner.trigger_fired(&f.conn, &key).unwrap().is_none());
        assert_eq!(
            f.persister.retrieve_trigger(&f.conn, &key).unwrap().unwrap().state,
            TriggerState::Error
        );
    }

    #[test]
    fn stale_lock_of_other_instance_is_taken_over() {
        let f = fixture();
        let t = every_minute("t", "j").with_misfire_instruction(MisfireInstruction::FireNow);
        f.persister
            .store_job_and_trigger(&f.conn, &Job::new(JobKey::new("g", "j"), "noop"), &t)
            .unwrap();
        let other = LockManager::new(
            Arc::new(Tables::new("qrtz_").unwrap()),
            "b",
            f.clock.clone(),
            60_000,
            60_000,
        );
        let key = LockKey::trigger(&TriggerKey::new("g", "t"));
        other.try_acquire(&f.conn, &key).unwrap();
        assert!(f.runner.acquire_next(&f.conn, t0(), 1, Duration::zero()).unwrap().is_empty());

        f.clock.advance(Duration::minutes(2));
        // Misfired meanwhile: the lock is stolen and the trigger fires now.
        let acquired = f
            .runner
            .acquire_next(&f.conn, f.clock.now(), 1, Duration::zero())
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert!(f.locks.holds(&f.conn, &key).unwrap());
    }
}
