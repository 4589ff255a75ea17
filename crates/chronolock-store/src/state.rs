use std::{collections::BTreeSet, sync::Arc};

use rusqlite::Connection;
use tracing::info;

use chronolock_core::{GroupMatcher, JobKey, MatchOperator, TriggerKey};

use crate::{
    dao::{JobDao, PausedGroupDao, TriggerDao},
    db::Tables,
    error::Result,
    lock::LockManager,
    types::{LockKey, TriggerState},
};

/// Stored in the paused trigger groups table while everything is paused, so
/// groups created later also start paused.
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

const ALL_STATES: &[TriggerState] = &[
    TriggerState::Waiting,
    TriggerState::Acquired,
    TriggerState::Paused,
    TriggerState::Blocked,
    TriggerState::PausedBlocked,
    TriggerState::Complete,
    TriggerState::Error,
];

/// Trigger state transitions and the pause/resume overlay on groups.
pub struct TriggerStateManager {
    triggers: TriggerDao,
    jobs: JobDao,
    paused_job_groups: PausedGroupDao,
    paused_trigger_groups: PausedGroupDao,
    locks: Arc<LockManager>,
}

impl TriggerStateManager {
    pub fn new(tables: Arc<Tables>, locks: Arc<LockManager>) -> Self {
        Self {
            paused_job_groups: PausedGroupDao::new(tables.paused_job_groups.clone()),
            paused_trigger_groups: PausedGroupDao::new(tables.paused_trigger_groups.clone()),
            triggers: TriggerDao::new(tables.clone()),
            jobs: JobDao::new(tables),
            locks,
        }
    }

    /// State a newly stored trigger starts in: paused when its group, its
    /// job's group or everything is paused; blocked while its job executes
    /// under a non-concurrent lock.
    pub fn initial_state(&self, conn: &Connection, trigger: &TriggerKey, job: &JobKey) -> Result<TriggerState> {
        let paused = self.paused_trigger_groups.contains(conn, &trigger.group)?
            || self.paused_trigger_groups.contains(conn, ALL_GROUPS_PAUSED)?
            || self.paused_job_groups.contains(conn, &job.group)?;
        let blocked = self.locks.get(conn, &LockKey::job(job))?.is_some();
        Ok(match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        })
    }

    pub fn state(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<TriggerState>> {
        self.triggers.state(conn, key)
    }

    pub fn set_state(&self, conn: &Connection, key: &TriggerKey, state: TriggerState) -> Result<bool> {
        self.triggers.set_state(conn, key, state)
    }

    pub fn transition(
        &self,
        conn: &Connection,
        key: &TriggerKey,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<bool> {
        self.triggers.transition(conn, key, from, to)
    }

    /// Force every trigger of `job` into `state`.
    pub fn set_job_triggers_state(&self, conn: &Connection, job: &JobKey, state: TriggerState) -> Result<usize> {
        self.triggers.transition_for_job(conn, job, ALL_STATES, state)
    }

    /// The job started executing under its non-concurrent lock.
    pub fn block_job_triggers(&self, conn: &Connection, job: &JobKey) -> Result<()> {
        self.triggers
            .transition_for_job(conn, job, &[TriggerState::Waiting], TriggerState::Blocked)?;
        self.triggers
            .transition_for_job(conn, job, &[TriggerState::Paused], TriggerState::PausedBlocked)?;
        Ok(())
    }

    pub fn unblock_job_triggers(&self, conn: &Connection, job: &JobKey) -> Result<()> {
        self.triggers
            .transition_for_job(conn, job, &[TriggerState::Blocked], TriggerState::Waiting)?;
        self.triggers
            .transition_for_job(conn, job, &[TriggerState::PausedBlocked], TriggerState::Paused)?;
        Ok(())
    }

    pub fn pause_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<()> {
        if !self.triggers.transition(
            conn,
            key,
            &[TriggerState::Waiting, TriggerState::Acquired],
            TriggerState::Paused,
        )? {
            self.triggers
                .transition(conn, key, &[TriggerState::Blocked], TriggerState::PausedBlocked)?;
        }
        Ok(())
    }

    /// Back to WAITING, or BLOCKED if the job is still executing under its
    /// non-concurrent lock.
    pub fn resume_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<()> {
        let Some(trigger) = self.triggers.get(conn, key)? else {
            return Ok(());
        };
        if !matches!(trigger.state, TriggerState::Paused | TriggerState::PausedBlocked) {
            return Ok(());
        }
        let blocked = self.locks.get(conn, &LockKey::job(&trigger.job_key))?.is_some();
        let to = if blocked {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };
        self.triggers.transition(
            conn,
            key,
            &[TriggerState::Paused, TriggerState::PausedBlocked],
            to,
        )?;
        Ok(())
    }

    /// Groups a pause or resume applies to. An `Equals` matcher names its
    /// group even before any trigger lives in it.
    fn trigger_groups(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<BTreeSet<String>> {
        let mut groups: BTreeSet<String> = self
            .triggers
            .group_names(conn)?
            .into_iter()
            .filter(|g| matcher.is_match(g))
            .collect();
        if matcher.operator == MatchOperator::Equals {
            groups.insert(matcher.value.clone());
        }
        Ok(groups)
    }

    fn job_groups(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<BTreeSet<String>> {
        let mut groups: BTreeSet<String> = self
            .jobs
            .group_names(conn)?
            .into_iter()
            .filter(|g| matcher.is_match(g))
            .collect();
        if matcher.operator == MatchOperator::Equals {
            groups.insert(matcher.value.clone());
        }
        Ok(groups)
    }

    /// Pause the matched trigger groups and remember them as paused. Returns
    /// the group names.
    pub fn pause_triggers(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let groups = self.trigger_groups(conn, matcher)?;
        for group in &groups {
            self.paused_trigger_groups.add(conn, group)?;
        }
        for key in self.triggers.keys_matching(conn, matcher)? {
            self.pause_trigger(conn, &key)?;
        }
        info!(%matcher, count = groups.len(), "trigger groups paused");
        Ok(groups.into_iter().collect())
    }

    pub fn resume_triggers(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut groups = self.trigger_groups(conn, matcher)?;
        groups.extend(
            self.paused_trigger_groups
                .all(conn)?
                .into_iter()
                .filter(|g| g != ALL_GROUPS_PAUSED && matcher.is_match(g)),
        );
        for group in &groups {
            self.paused_trigger_groups.remove(conn, group)?;
        }
        for key in self.triggers.keys_matching(conn, matcher)? {
            self.resume_trigger(conn, &key)?;
        }
        info!(%matcher, count = groups.len(), "trigger groups resumed");
        Ok(groups.into_iter().collect())
    }

    pub fn pause_job(&self, conn: &Connection, job: &JobKey) -> Result<()> {
        for trigger in self.triggers.for_job(conn, job)? {
            self.pause_trigger(conn, &trigger.key)?;
        }
        Ok(())
    }

    pub fn resume_job(&self, conn: &Connection, job: &JobKey) -> Result<()> {
        for trigger in self.triggers.for_job(conn, job)? {
            self.resume_trigger(conn, &trigger.key)?;
        }
        Ok(())
    }

    /// Pause every trigger of every job in the matched job groups and
    /// remember the groups as paused. Returns the group names.
    pub fn pause_jobs(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let groups = self.job_groups(conn, matcher)?;
        for group in &groups {
            self.paused_job_groups.add(conn, group)?;
        }
        for key in self.triggers.keys_for_job_groups(conn, matcher)? {
            self.pause_trigger(conn, &key)?;
        }
        info!(%matcher, count = groups.len(), "job groups paused");
        Ok(groups.into_iter().collect())
    }

    pub fn resume_jobs(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut groups = self.job_groups(conn, matcher)?;
        groups.extend(
            self.paused_job_groups
                .all(conn)?
                .into_iter()
                .filter(|g| matcher.is_match(g)),
        );
        for group in &groups {
            self.paused_job_groups.remove(conn, group)?;
        }
        for key in self.triggers.keys_for_job_groups(conn, matcher)? {
            self.resume_trigger(conn, &key)?;
        }
        info!(%matcher, count = groups.len(), "job groups resumed");
        Ok(groups.into_iter().collect())
    }

    pub fn pause_all(&self, conn: &Connection) -> Result<()> {
        self.pause_triggers(conn, &GroupMatcher::any())?;
        self.paused_trigger_groups.add(conn, ALL_GROUPS_PAUSED)?;
        Ok(())
    }

    pub fn resume_all(&self, conn: &Connection) -> Result<()> {
        self.paused_trigger_groups.remove(conn, ALL_GROUPS_PAUSED)?;
        self.resume_triggers(conn, &GroupMatcher::any())?;
        Ok(())
    }

    pub fn paused_trigger_groups(&self, conn: &Connection) -> Result<Vec<String>> {
        self.paused_trigger_groups.all(conn)
    }

    pub fn paused_job_groups(&self, conn: &Connection) -> Result<Vec<String>> {
        self.paused_job_groups.all(conn)
    }

    pub fn clear_paused_groups(&self, conn: &Connection) -> Result<()> {
        self.paused_job_groups.delete_all(conn)?;
        self.paused_trigger_groups.delete_all(conn)?;
        Ok(())
    }
}
