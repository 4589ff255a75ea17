use std::{collections::BTreeSet, sync::Arc};

use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use chronolock_core::{JobKey, TriggerKey};
use chronolock_schedule::{MisfireInstruction, Schedule, SimpleSchedule};

use crate::{
    connector::Connector,
    dao::{JobDao, TriggerDao},
    db::Tables,
    error::Result,
    lock::LockManager,
    misfire::MisfireHandler,
    persister::Persister,
    state::TriggerStateManager,
    types::{Lock, LockKey, LockOutcome, RecoveryMarker, ResourceType, Trigger, TriggerState},
};

/// Group that one-shot recovery triggers are stored in.
pub const RECOVERY_TRIGGER_GROUP: &str = "RECOVERING_JOBS";

/// What one recovery pass over a dead instance did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub instance_id: String,
    /// Another live instance was already recovering this one.
    pub skipped: bool,
    /// ACQUIRED triggers put back to WAITING (or COMPLETE).
    pub triggers_reset: usize,
    /// One-shot triggers created to re-run interrupted jobs.
    pub recovery_triggers: usize,
    pub jobs_unblocked: usize,
    pub locks_released: usize,
}

impl RecoveryReport {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.triggers_reset == 0
            && self.recovery_triggers == 0
            && self.jobs_unblocked == 0
            && self.locks_released == 0
    }
}

/// Reclaims the locks of an instance that stopped checking in and re-queues
/// the triggers it had in flight.
pub struct TriggerRecoverer {
    triggers: TriggerDao,
    jobs: JobDao,
    locks: Arc<LockManager>,
    misfire: Arc<MisfireHandler>,
    state: Arc<TriggerStateManager>,
    persister: Arc<Persister>,
}

impl TriggerRecoverer {
    pub fn new(
        tables: Arc<Tables>,
        locks: Arc<LockManager>,
        misfire: Arc<MisfireHandler>,
        state: Arc<TriggerStateManager>,
        persister: Arc<Persister>,
    ) -> Self {
        Self {
            triggers: TriggerDao::new(tables.clone()),
            jobs: JobDao::new(tables),
            locks,
            misfire,
            state,
            persister,
        }
    }

    /// Recover everything `dead_instance` holds. Peers racing on the same
    /// dead instance are serialised by a recovery lock; the loser reports
    /// `skipped`. Each lock is reclaimed in its own transaction, so running
    /// this twice changes nothing the second time.
    #[instrument(skip(self, connector), fields(instance_id = %self.locks.instance_id()))]
    pub fn recover_instance(&self, connector: &Connector, dead_instance: &str) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::new(dead_instance);
        let recovery_key = LockKey::recovery(dead_instance);

        if let LockOutcome::Denied { owner } =
            connector.with_tx(|conn| self.locks.try_acquire(conn, &recovery_key))?
        {
            debug!(dead = dead_instance, %owner, "instance already being recovered");
            report.skipped = true;
            return Ok(report);
        }

        let result = self.recover_locks(connector, dead_instance, &recovery_key, &mut report);
        let released = connector.with_tx(|conn| self.locks.release(conn, &recovery_key));
        result?;
        released?;

        if report.is_empty() {
            debug!(dead = dead_instance, "nothing to recover");
        } else {
            info!(
                dead = dead_instance,
                triggers_reset = report.triggers_reset,
                recovery_triggers = report.recovery_triggers,
                jobs_unblocked = report.jobs_unblocked,
                locks_released = report.locks_released,
                "instance recovered"
            );
        }
        Ok(report)
    }

    fn recover_locks(
        &self,
        connector: &Connector,
        dead_instance: &str,
        recovery_key: &LockKey,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let held = connector.with_conn(|conn| self.locks.owned_by(conn, dead_instance))?;
        for lock in held.iter().filter(|l| &l.key != recovery_key) {
            connector.with_tx(|conn| self.recover_lock(conn, lock, report))?;
        }
        Ok(())
    }

    fn recover_lock(&self, conn: &Connection, lock: &Lock, report: &mut RecoveryReport) -> Result<()> {
        if !self.locks.take_over(conn, lock)? {
            debug!(lock = %lock.key, "lock changed hands, left alone");
            return Ok(());
        }
        match lock.key.resource_type {
            ResourceType::Trigger => {
                let key = TriggerKey::new(lock.key.group.clone(), lock.key.name.clone());
                self.recover_trigger(conn, &key, &lock.instance_id, report)?;
                self.locks.release(conn, &lock.key)?;
            }
            ResourceType::Job => {
                let job = JobKey::new(lock.key.group.clone(), lock.key.name.clone());
                self.locks.release(conn, &lock.key)?;
                self.state.unblock_job_triggers(conn, &job)?;
                report.jobs_unblocked += 1;
            }
            ResourceType::Recovery => {
                // The dead instance was itself recovering a peer.
                self.locks.release(conn, &lock.key)?;
            }
        }
        report.locks_released += 1;
        Ok(())
    }

    fn recover_trigger(
        &self,
        conn: &Connection,
        key: &TriggerKey,
        dead_instance: &str,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let Some(mut trigger) = self.triggers.get(conn, key)? else {
            return Ok(());
        };
        match trigger.state {
            TriggerState::Acquired => {
                trigger.state = TriggerState::Waiting;
                self.misfire.apply(conn, &mut trigger)?;
                if trigger.next_fire_time.is_none() {
                    trigger.state = TriggerState::Complete;
                }
                self.triggers.update(conn, &trigger)?;
                report.triggers_reset += 1;
                debug!(trigger = %key, state = %trigger.state, "acquired trigger released");
            }
            TriggerState::Waiting | TriggerState::Blocked | TriggerState::Complete => {
                // Already fired; the job may have been running when the
                // owner died.
                if self.schedule_recovery_run(conn, &trigger, dead_instance)? {
                    report.recovery_triggers += 1;
                }
                if trigger.state == TriggerState::Complete {
                    self.persister.remove_trigger(conn, key)?;
                }
            }
            TriggerState::Paused | TriggerState::PausedBlocked | TriggerState::Error => {}
        }
        Ok(())
    }

    /// Store a one-shot trigger re-running the interrupted fire of
    /// `trigger` when its job asks for recovery.
    fn schedule_recovery_run(&self, conn: &Connection, trigger: &Trigger, dead_instance: &str) -> Result<bool> {
        let Some(job) = self.jobs.get(conn, &trigger.job_key)? else {
            return Ok(false);
        };
        if !job.requests_recovery {
            return Ok(false);
        }
        let Some(scheduled) = trigger.previous_fire_time else {
            return Ok(false);
        };
        let key = TriggerKey::new(
            RECOVERY_TRIGGER_GROUP,
            format!("recover_{dead_instance}_{}", Uuid::new_v4().simple()),
        );
        let mut rerun = Trigger::new(
            key,
            job.key.clone(),
            Schedule::Simple(SimpleSchedule::once()),
            scheduled,
        )
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy)
        .with_priority(trigger.priority);
        rerun.data = trigger.data.clone();
        rerun.recovery = Some(RecoveryMarker {
            original: trigger.key.clone(),
            scheduled_fire_time: scheduled,
            failed_instance: dead_instance.to_string(),
        });
        self.persister.store_trigger(conn, &rerun, false)?;
        warn!(
            job = %job.key,
            original = %trigger.key,
            recovery = %rerun.key,
            "interrupted job scheduled for recovery"
        );
        Ok(true)
    }

    /// Every instance id that currently owns at least one lock.
    pub fn lock_owners(&self, connector: &Connector) -> Result<BTreeSet<String>> {
        let locks = connector.with_conn(|conn| self.locks.all(conn))?;
        Ok(locks.into_iter().map(|l| l.instance_id).collect())
    }

    /// Recover every lock owner. Only safe when no other instance is live.
    pub fn recover_all(&self, connector: &Connector) -> Result<Vec<RecoveryReport>> {
        let mut reports = Vec::new();
        for owner in self.lock_owners(connector)? {
            reports.push(self.recover_instance(connector, &owner)?);
        }
        Ok(reports)
    }
}
