use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use chronolock_core::{ChronolockConfig, Clock, CoreError, GroupMatcher, JobKey, SystemClock, TriggerKey};
use chronolock_schedule::Calendar;

use crate::{
    checkin::CheckinExecutor,
    complete::JobCompleteHandler,
    connector::Connector,
    dao::{CalendarDao, CheckinDao, JobDao, TriggerDao},
    db::Tables,
    error::{Result, StoreError},
    lock::LockManager,
    misfire::MisfireHandler,
    persister::Persister,
    recovery::{RecoveryReport, TriggerRecoverer},
    runner::TriggerRunner,
    state::TriggerStateManager,
    types::{
        CompletedExecutionInstruction, FireResult, Job, Lock, SchedulerCheckin, Trigger, TriggerState,
    },
};

/// The job store: one instance's view of the shared scheduling database.
///
/// Built once from an immutable [`ChronolockConfig`]; every collaborator is
/// wired through its constructor. Each public operation runs in its own
/// immediate transaction on this store's connection.
pub struct JobStore {
    config: ChronolockConfig,
    instance_id: String,
    tables: Arc<Tables>,
    connector: Connector,
    clock: Arc<dyn Clock>,
    jobs: JobDao,
    triggers: TriggerDao,
    calendars: CalendarDao,
    checkins: CheckinDao,
    locks: Arc<LockManager>,
    misfire: Arc<MisfireHandler>,
    state: Arc<TriggerStateManager>,
    persister: Arc<Persister>,
    runner: TriggerRunner,
    completer: JobCompleteHandler,
    recoverer: Arc<TriggerRecoverer>,
    started: AtomicBool,
}

impl JobStore {
    /// Open the database named by `config.store.path` with the system clock.
    pub fn open(config: &ChronolockConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: &ChronolockConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let tables = Arc::new(Tables::new(&config.store.table_prefix)?);
        let connector = Connector::open(&config.store, &tables)?;
        Ok(Self::assemble(config, tables, connector, clock))
    }

    /// A store on a private in-memory database. Clustering features that
    /// need a second connection are unavailable.
    pub fn open_in_memory(config: &ChronolockConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let tables = Arc::new(Tables::new(&config.store.table_prefix)?);
        let connector = Connector::open_in_memory(&tables)?;
        Ok(Self::assemble(config, tables, connector, clock))
    }

    fn assemble(
        config: &ChronolockConfig,
        tables: Arc<Tables>,
        connector: Connector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let instance_id = config.scheduler.resolved_instance_id();
        let locks = Arc::new(LockManager::new(
            tables.clone(),
            instance_id.clone(),
            clock.clone(),
            config.scheduler.trigger_timeout_ms,
            config.scheduler.job_timeout_ms,
        ));
        let misfire = Arc::new(MisfireHandler::new(
            tables.clone(),
            clock.clone(),
            config.scheduler.misfire_threshold_ms,
        ));
        let state = Arc::new(TriggerStateManager::new(tables.clone(), locks.clone()));
        let persister = Arc::new(Persister::new(tables.clone(), state.clone(), locks.clone()));
        let runner = TriggerRunner::new(
            tables.clone(),
            locks.clone(),
            misfire.clone(),
            state.clone(),
            clock.clone(),
        );
        let completer = JobCompleteHandler::new(
            tables.clone(),
            persister.clone(),
            state.clone(),
            locks.clone(),
        );
        let recoverer = Arc::new(TriggerRecoverer::new(
            tables.clone(),
            locks.clone(),
            misfire.clone(),
            state.clone(),
            persister.clone(),
        ));
        info!(
            %instance_id,
            clustered = config.cluster.enabled,
            path = ?connector.path(),
            "job store opened"
        );
        Self {
            config: config.clone(),
            instance_id,
            jobs: JobDao::new(tables.clone()),
            triggers: TriggerDao::new(tables.clone()),
            calendars: CalendarDao::new(tables.clone()),
            checkins: CheckinDao::new(tables.clone()),
            tables,
            connector,
            clock,
            locks,
            misfire,
            state,
            persister,
            runner,
            completer,
            recoverer,
            started: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &ChronolockConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(StoreError::NotStarted)
        }
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    /// Reconcile whatever a previous crash left behind before normal
    /// operation starts.
    ///
    /// Clustered: check in, then recover locks held by this instance id (a
    /// previous incarnation) and by peers that are dead or never checked in.
    /// Standalone: every lock in the store is stale, so all are recovered.
    /// Any failure is a [`StoreError::ClusterRecoveryFailure`] and leaves the
    /// store not started.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub fn startup(&self) -> Result<Vec<RecoveryReport>> {
        let recovered = if self.config.cluster.enabled {
            self.cluster_startup()
        } else {
            self.recoverer.recover_all(&self.connector)
        };
        let reports = recovered.map_err(|e| StoreError::recovery("startup recovery failed", e))?;

        self.started.store(true, Ordering::Release);
        info!(recovered = reports.iter().filter(|r| !r.is_empty()).count(), "job store started");
        Ok(reports)
    }

    fn cluster_startup(&self) -> Result<Vec<RecoveryReport>> {
        self.check_in()?;
        let mut reports = vec![self.recoverer.recover_instance(&self.connector, &self.instance_id)?];
        reports.extend(self.recover_unreachable()?);
        Ok(reports)
    }

    /// Recover lock owners other than this instance that are dead or have
    /// never checked in. Safe while other instances are running.
    pub fn recover_unreachable(&self) -> Result<Vec<RecoveryReport>> {
        let now = self.clock.now();
        let live: BTreeSet<String> = self
            .checkins()?
            .into_iter()
            .filter(|c| !c.is_dead(now, self.config.cluster.dead_factor))
            .map(|c| c.instance_id)
            .collect();

        let mut reports = Vec::new();
        for owner in self.recoverer.lock_owners(&self.connector)? {
            if owner == self.instance_id || live.contains(&owner) {
                continue;
            }
            warn!(%owner, "locks held by dead or unknown instance");
            reports.push(self.recoverer.recover_instance(&self.connector, &owner)?);
        }
        Ok(reports)
    }

    fn check_in(&self) -> Result<()> {
        let checkin = SchedulerCheckin {
            scheduler_name: self.config.scheduler.name.clone(),
            instance_id: self.instance_id.clone(),
            last_checkin: self.clock.now(),
            checkin_interval_ms: i64::try_from(self.config.cluster.checkin_interval_ms).unwrap_or(i64::MAX),
        };
        self.connector.with_tx(|conn| self.checkins.upsert(conn, &checkin))
    }

    /// A heartbeat executor with its own connection to the same database.
    pub fn checkin_executor(&self) -> Result<CheckinExecutor> {
        if self.connector.path().is_none() {
            return Err(CoreError::Config("checkin needs a file-backed store".into()).into());
        }
        let connector = Connector::open(&self.config.store, &self.tables)?;
        Ok(CheckinExecutor::new(
            connector,
            self.tables.clone(),
            self.recoverer.clone(),
            self.clock.clone(),
            self.config.scheduler.name.clone(),
            self.instance_id.clone(),
            self.config.cluster.checkin_interval_ms,
            self.config.cluster.dead_factor,
        ))
    }

    /// Recover the locks of one instance now.
    pub fn recover_instance(&self, instance_id: &str) -> Result<RecoveryReport> {
        self.recoverer.recover_instance(&self.connector, instance_id)
    }

    /// Recover every lock owner. Only safe when no other instance runs.
    pub fn recover_all(&self) -> Result<Vec<RecoveryReport>> {
        self.recoverer.recover_all(&self.connector)
    }

    // ── storing and removing ─────────────────────────────────────────────────

    #[instrument(skip(self, job), fields(job = %job.key))]
    pub fn store_job(&self, job: &Job, replace: bool) -> Result<()> {
        self.connector
            .with_tx(|conn| self.persister.store_job(conn, job, replace))
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub fn store_trigger(&self, trigger: &Trigger, replace: bool) -> Result<()> {
        self.connector
            .with_tx(|conn| self.persister.store_trigger(conn, trigger, replace))
    }

    /// Store a new job and its first trigger atomically.
    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    pub fn store_job_and_trigger(&self, job: &Job, trigger: &Trigger) -> Result<()> {
        self.connector
            .with_tx(|conn| self.persister.store_job_and_trigger(conn, job, trigger))
    }

    /// Store many jobs with their triggers in one transaction; nothing is
    /// stored if any item fails.
    #[instrument(skip(self, batch), fields(jobs = batch.len()))]
    pub fn store_jobs_and_triggers(&self, batch: &[(Job, Vec<Trigger>)], replace: bool) -> Result<()> {
        self.connector
            .with_tx(|conn| self.persister.store_jobs_and_triggers(conn, batch, replace))
    }

    #[instrument(skip(self), fields(job = %key))]
    pub fn remove_job(&self, key: &JobKey) -> Result<bool> {
        self.connector
            .with_tx(|conn| self.persister.remove_job(conn, key))
    }

    /// Remove each job independently; one failure does not stop the rest.
    pub fn remove_jobs(&self, keys: &[JobKey]) -> Vec<Result<bool>> {
        keys.iter().map(|key| self.remove_job(key)).collect()
    }

    #[instrument(skip(self), fields(trigger = %key))]
    pub fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        self.connector
            .with_tx(|conn| self.persister.remove_trigger(conn, key))
    }

    /// Remove each trigger independently; one failure does not stop the rest.
    pub fn remove_triggers(&self, keys: &[TriggerKey]) -> Vec<Result<bool>> {
        keys.iter().map(|key| self.remove_trigger(key)).collect()
    }

    /// Swap the trigger under `key` for `new_trigger`. On failure the old
    /// trigger stays in place.
    #[instrument(skip(self, new_trigger), fields(trigger = %key, new = %new_trigger.key))]
    pub fn replace_trigger(&self, key: &TriggerKey, new_trigger: &Trigger) -> Result<bool> {
        self.connector
            .with_tx(|conn| self.persister.replace_trigger(conn, key, new_trigger))
    }

    // ── queries ──────────────────────────────────────────────────────────────

    pub fn retrieve_job(&self, key: &JobKey) -> Result<Option<Job>> {
        self.connector.with_conn(|conn| self.persister.retrieve_job(conn, key))
    }

    pub fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.connector
            .with_conn(|conn| self.persister.retrieve_trigger(conn, key))
    }

    pub fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
        self.connector.with_conn(|conn| self.jobs.exists(conn, key))
    }

    pub fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        self.connector.with_conn(|conn| self.triggers.exists(conn, key))
    }

    pub fn check_calendar_exists(&self, name: &str) -> Result<bool> {
        self.connector.with_conn(|conn| self.calendars.exists(conn, name))
    }

    pub fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        self.connector
            .with_conn(|conn| self.persister.triggers_for_job(conn, key))
    }

    /// `None` when no such trigger is stored.
    pub fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        self.connector.with_conn(|conn| self.state.state(conn, key))
    }

    pub fn number_of_jobs(&self) -> Result<usize> {
        self.connector.with_conn(|conn| self.jobs.count(conn))
    }

    pub fn number_of_triggers(&self) -> Result<usize> {
        self.connector.with_conn(|conn| self.triggers.count(conn))
    }

    pub fn number_of_calendars(&self) -> Result<usize> {
        self.connector.with_conn(|conn| self.calendars.count(conn))
    }

    pub fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        self.connector
            .with_conn(|conn| self.jobs.keys_matching(conn, matcher))
    }

    pub fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        self.connector
            .with_conn(|conn| self.triggers.keys_matching(conn, matcher))
    }

    pub fn job_group_names(&self) -> Result<Vec<String>> {
        self.connector.with_conn(|conn| self.jobs.group_names(conn))
    }

    pub fn trigger_group_names(&self) -> Result<Vec<String>> {
        self.connector.with_conn(|conn| self.triggers.group_names(conn))
    }

    pub fn calendar_names(&self) -> Result<Vec<String>> {
        self.connector.with_conn(|conn| self.calendars.names(conn))
    }

    /// Heartbeat rows of this scheduler's instances.
    pub fn checkins(&self) -> Result<Vec<SchedulerCheckin>> {
        self.connector
            .with_conn(|conn| self.checkins.all(conn, &self.config.scheduler.name))
    }

    /// Every outstanding lock, whoever holds it.
    pub fn locks(&self) -> Result<Vec<Lock>> {
        self.connector.with_conn(|conn| self.locks.all(conn))
    }

    // ── calendars ────────────────────────────────────────────────────────────

    #[instrument(skip(self, calendar))]
    pub fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        self.connector.with_tx(|conn| {
            self.persister
                .store_calendar(conn, name, calendar, replace, update_triggers, now)
        })
    }

    #[instrument(skip(self))]
    pub fn remove_calendar(&self, name: &str) -> Result<bool> {
        self.connector
            .with_tx(|conn| self.persister.remove_calendar(conn, name))
    }

    pub fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.connector
            .with_conn(|conn| self.persister.retrieve_calendar(conn, name))
    }

    // ── pause / resume ───────────────────────────────────────────────────────

    #[instrument(skip(self), fields(trigger = %key))]
    pub fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.connector.with_tx(|conn| self.state.pause_trigger(conn, key))
    }

    #[instrument(skip(self), fields(trigger = %key))]
    pub fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.connector
            .with_tx(|conn| self.state.resume_trigger(conn, key))
    }

    #[instrument(skip(self), fields(job = %key))]
    pub fn pause_job(&self, key: &JobKey) -> Result<()> {
        self.connector.with_tx(|conn| self.state.pause_job(conn, key))
    }

    #[instrument(skip(self), fields(job = %key))]
    pub fn resume_job(&self, key: &JobKey) -> Result<()> {
        self.connector.with_tx(|conn| self.state.resume_job(conn, key))
    }

    /// Pause the matched trigger groups; returns the paused group names.
    #[instrument(skip(self), fields(matcher = %matcher))]
    pub fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.connector
            .with_tx(|conn| self.state.pause_triggers(conn, matcher))
    }

    #[instrument(skip(self), fields(matcher = %matcher))]
    pub fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.connector
            .with_tx(|conn| self.state.resume_triggers(conn, matcher))
    }

    /// Pause the matched job groups; returns the paused group names.
    #[instrument(skip(self), fields(matcher = %matcher))]
    pub fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.connector
            .with_tx(|conn| self.state.pause_jobs(conn, matcher))
    }

    #[instrument(skip(self), fields(matcher = %matcher))]
    pub fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.connector
            .with_tx(|conn| self.state.resume_jobs(conn, matcher))
    }

    #[instrument(skip(self))]
    pub fn pause_all(&self) -> Result<()> {
        self.connector.with_tx(|conn| self.state.pause_all(conn))
    }

    /// Resume every trigger group. Paused job groups stay paused.
    #[instrument(skip(self))]
    pub fn resume_all(&self) -> Result<()> {
        self.connector.with_tx(|conn| self.state.resume_all(conn))
    }

    pub fn paused_trigger_groups(&self) -> Result<Vec<String>> {
        self.connector
            .with_conn(|conn| self.state.paused_trigger_groups(conn))
    }

    pub fn paused_job_groups(&self) -> Result<Vec<String>> {
        self.connector
            .with_conn(|conn| self.state.paused_job_groups(conn))
    }

    // ── firing ───────────────────────────────────────────────────────────────

    /// Lock and return up to `max_count` triggers due by
    /// `no_later_than + time_window`, misfire policy already applied.
    /// [`StoreError::NotStarted`] until [`JobStore::startup`] has succeeded.
    #[instrument(skip(self))]
    pub fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>> {
        self.ensure_started()?;
        self.connector.with_tx(|conn| {
            self.runner
                .acquire_next(conn, no_later_than, max_count, time_window)
        })
    }

    #[instrument(skip(self), fields(trigger = %key))]
    pub fn release_acquired_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.connector
            .with_tx(|conn| self.runner.release_acquired(conn, key))
    }

    /// Fire previously acquired triggers, each in its own transaction. The
    /// result lines up with `triggers`; `Ok(None)` means that trigger must
    /// not run.
    #[instrument(skip(self, triggers), fields(count = triggers.len()))]
    pub fn triggers_fired(&self, triggers: &[Trigger]) -> Vec<Result<Option<FireResult>>> {
        triggers
            .iter()
            .map(|t| {
                self.ensure_started()?;
                self.connector
                    .with_tx(|conn| self.runner.trigger_fired(conn, &t.key))
            })
            .collect()
    }

    /// Record that the job fired by `trigger` finished.
    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key, job = %job.key))]
    pub fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &Job,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        self.completer
            .job_complete(&self.connector, trigger, job, instruction)
    }

    // ── maintenance ──────────────────────────────────────────────────────────

    /// Apply misfire policy to WAITING triggers nobody acquired in time.
    pub fn scan_misfires(&self) -> Result<usize> {
        self.connector.with_tx(|conn| self.misfire.scan(conn))
    }

    /// Delete every job, trigger, calendar, paused group, lock and checkin.
    #[instrument(skip(self))]
    pub fn clear_all_scheduling_data(&self) -> Result<()> {
        self.connector.with_tx(|conn| {
            self.persister.clear(conn)?;
            self.state.clear_paused_groups(conn)?;
            self.locks.delete_all(conn)?;
            self.checkins.delete_all(conn)?;
            Ok(())
        })?;
        warn!("all scheduling data cleared");
        Ok(())
    }
}
