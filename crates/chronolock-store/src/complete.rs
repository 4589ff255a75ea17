use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::{
    connector::Connector,
    dao::{JobDao, TriggerDao},
    db::Tables,
    error::Result,
    lock::LockManager,
    persister::Persister,
    state::TriggerStateManager,
    types::{CompletedExecutionInstruction, Job, LockKey, Trigger, TriggerState},
};

/// Post-execution bookkeeping for one fired trigger.
pub struct JobCompleteHandler {
    jobs: JobDao,
    triggers: TriggerDao,
    persister: Arc<Persister>,
    state: Arc<TriggerStateManager>,
    locks: Arc<LockManager>,
}

impl JobCompleteHandler {
    pub fn new(
        tables: Arc<Tables>,
        persister: Arc<Persister>,
        state: Arc<TriggerStateManager>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            jobs: JobDao::new(tables.clone()),
            triggers: TriggerDao::new(tables),
            persister,
            state,
            locks,
        }
    }

    /// Apply `instruction` for the run of `job` fired by `trigger`, then
    /// release the locks taken when it fired. The locks are released in a
    /// transaction of their own, so they are freed even when applying the
    /// instruction fails; that failure is still returned.
    pub fn job_complete(
        &self,
        connector: &Connector,
        trigger: &Trigger,
        job: &Job,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let applied = connector.with_tx(|conn| self.apply(conn, trigger, job, instruction));
        if let Err(e) = &applied {
            warn!(trigger = %trigger.key, error = %e, "completion instruction failed");
        }

        connector.with_tx(|conn| {
            self.locks.release(conn, &LockKey::trigger(&trigger.key))?;
            if job.concurrent_execution_disallowed
                && self.locks.release(conn, &LockKey::job(&job.key))?
            {
                self.state.unblock_job_triggers(conn, &job.key)?;
            }
            Ok(())
        })?;

        debug!(trigger = %trigger.key, job = %job.key, ?instruction, "job completed");
        applied
    }

    fn apply(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        job: &Job,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        if job.persist_data_after_execution && !self.jobs.set_data(conn, &job.key, &job.data)? {
            debug!(job = %job.key, "job gone before its data could be saved");
        }

        let per_trigger = matches!(
            instruction,
            CompletedExecutionInstruction::NoOp
                | CompletedExecutionInstruction::DeleteTrigger
                | CompletedExecutionInstruction::SetTriggerComplete
                | CompletedExecutionInstruction::SetTriggerError
        );
        if per_trigger && !self.locks.holds(conn, &LockKey::trigger(&trigger.key))? {
            warn!(trigger = %trigger.key, ?instruction, "trigger lock lost during execution, instruction skipped");
            return Ok(());
        }

        match instruction {
            CompletedExecutionInstruction::NoOp => {
                self.state.transition(
                    conn,
                    &trigger.key,
                    &[TriggerState::Acquired],
                    TriggerState::Waiting,
                )?;
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time.is_none() {
                    // Rescheduled while the job ran: the stored copy has a
                    // fire time again and must be kept.
                    let rescheduled = self
                        .triggers
                        .get(conn, &trigger.key)?
                        .is_some_and(|stored| stored.next_fire_time.is_some());
                    if rescheduled {
                        debug!(trigger = %trigger.key, "trigger rescheduled during execution, kept");
                        return Ok(());
                    }
                }
                if self.persister.remove_trigger(conn, &trigger.key)? {
                    info!(trigger = %trigger.key, "trigger deleted on completion");
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.state.set_state(conn, &trigger.key, TriggerState::Complete)?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                warn!(trigger = %trigger.key, "trigger set to ERROR on completion");
                self.state.set_state(conn, &trigger.key, TriggerState::Error)?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.state
                    .set_job_triggers_state(conn, &job.key, TriggerState::Complete)?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                warn!(job = %job.key, "all job triggers set to ERROR on completion");
                self.state
                    .set_job_triggers_state(conn, &job.key, TriggerState::Error)?;
            }
        }
        Ok(())
    }
}
