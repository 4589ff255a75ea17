use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use chronolock_core::Clock;

use crate::{
    connector::Connector,
    dao::CheckinDao,
    db::Tables,
    error::Result,
    recovery::{RecoveryReport, TriggerRecoverer},
    types::SchedulerCheckin,
};

/// Periodic liveness heartbeat plus dead-peer detection.
///
/// Owns its own [`Connector`] so a slow recovery pass never holds up the
/// connection the acquisition loop uses.
pub struct CheckinExecutor {
    connector: Connector,
    checkins: CheckinDao,
    recoverer: Arc<TriggerRecoverer>,
    clock: Arc<dyn Clock>,
    scheduler_name: String,
    instance_id: String,
    interval_ms: u64,
    dead_factor: u32,
}

impl CheckinExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Connector,
        tables: Arc<Tables>,
        recoverer: Arc<TriggerRecoverer>,
        clock: Arc<dyn Clock>,
        scheduler_name: impl Into<String>,
        instance_id: impl Into<String>,
        interval_ms: u64,
        dead_factor: u32,
    ) -> Self {
        Self {
            connector,
            checkins: CheckinDao::new(tables),
            recoverer,
            clock,
            scheduler_name: scheduler_name.into(),
            instance_id: instance_id.into(),
            interval_ms,
            dead_factor,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Write this instance's heartbeat row.
    pub fn checkin(&self) -> Result<()> {
        let checkin = SchedulerCheckin {
            scheduler_name: self.scheduler_name.clone(),
            instance_id: self.instance_id.clone(),
            last_checkin: self.clock.now(),
            checkin_interval_ms: i64::try_from(self.interval_ms).unwrap_or(i64::MAX),
        };
        self.connector
            .with_tx(|conn| self.checkins.upsert(conn, &checkin))
    }

    /// Every checkin row of this scheduler, this instance's included.
    pub fn checkins(&self) -> Result<Vec<SchedulerCheckin>> {
        self.connector
            .with_conn(|conn| self.checkins.all(conn, &self.scheduler_name))
    }

    /// Peers whose last checkin is older than their interval times the dead
    /// factor.
    pub fn dead_instances(&self) -> Result<Vec<SchedulerCheckin>> {
        let now = self.clock.now();
        Ok(self
            .checkins()?
            .into_iter()
            .filter(|c| c.instance_id != self.instance_id && c.is_dead(now, self.dead_factor))
            .collect())
    }

    /// One heartbeat: check in, then recover every peer judged dead. A peer
    /// whose recovery fails is logged and left for the next heartbeat; the
    /// remaining peers are still recovered.
    pub fn checkin_once(&self) -> Result<Vec<RecoveryReport>> {
        self.checkin()?;
        let mut reports = Vec::new();
        for dead in self.dead_instances()? {
            let report = match self.recoverer.recover_instance(&self.connector, &dead.instance_id) {
                Ok(report) => report,
                Err(e) => {
                    error!(dead = %dead.instance_id, code = e.code(), error = %e, "peer recovery failed");
                    continue;
                }
            };
            if !report.is_empty() {
                warn!(
                    dead = %dead.instance_id,
                    last_checkin = %dead.last_checkin,
                    "peer declared dead and recovered"
                );
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Heartbeat loop. Ticks every checkin interval until `shutdown`
    /// broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.instance_id,
            interval_ms = self.interval_ms,
            "checkin executor started"
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(self.interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.checkin_once() {
                        Ok(reports) => debug!(dead = reports.len(), "checked in"),
                        Err(e) => error!(error = %e, "checkin failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("checkin executor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::LockManager, misfire::MisfireHandler, persister::Persister, state::TriggerStateManager,
        types::{Job, LockKey, Trigger},
    };
    use chrono::{Duration, TimeZone, Utc};
    use chronolock_core::{JobKey, ManualClock, TriggerKey};
    use chronolock_schedule::{Schedule, SimpleSchedule};

    fn executor(dir: &tempfile::TempDir, instance: &str, clock: Arc<ManualClock>) -> CheckinExecutor {
        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        let config = chronolock_core::config::StoreConfig {
            path: dir.path().join("cluster.db").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let connector = Connector::open(&config, &tables).unwrap();
        let locks = Arc::new(LockManager::new(tables.clone(), instance, clock.clone(), 60_000, 60_000));
        let state = Arc::new(TriggerStateManager::new(tables.clone(), locks.clone()));
        let misfire = Arc::new(MisfireHandler::new(tables.clone(), clock.clone(), 5_000));
        let persister = Arc::new(Persister::new(tables.clone(), state.clone(), locks.clone()));
        let recoverer = Arc::new(TriggerRecoverer::new(tables.clone(), locks, misfire, state, persister));
        CheckinExecutor::new(connector, tables, recoverer, clock, "sched", instance, 1_000, 2)
    }

    #[test]
    fn silent_peer_is_declared_dead() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let a = executor(&dir, "a", clock.clone());
        let b = executor(&dir, "b", clock.clone());
        a.checkin().unwrap();
        b.checkin().unwrap();
        assert!(b.dead_instances().unwrap().is_empty());

        clock.advance(Duration::milliseconds(2_000));
        b.checkin().unwrap();
        assert!(b.dead_instances().unwrap().is_empty());

        clock.advance(Duration::milliseconds(1));
        b.checkin().unwrap();
        let dead = b.dead_instances().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].instance_id, "a");
        assert_eq!(b.checkins().unwrap().len(), 2);
    }

    #[test]
    fn heartbeat_recovers_dead_peer_locks() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let a = executor(&dir, "a", clock.clone());
        let b = executor(&dir, "b", clock.clone());
        a.checkin().unwrap();

        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        let a_locks = LockManager::new(tables, "a", clock.clone(), 60_000, 60_000);
        let key = LockKey::trigger(&TriggerKey::new("g", "t"));
        a.connector
            .with_tx(|conn| a_locks.try_acquire(conn, &key))
            .unwrap();

        clock.advance(Duration::seconds(10));
        let reports = b.checkin_once().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].locks_released, 1);
        let left = b.connector.with_conn(|conn| a_locks.get(conn, &key)).unwrap();
        assert!(left.is_none());
    }

    #[test]
    fn failing_peer_does_not_stop_recovery_of_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let a = executor(&dir, "a", clock.clone());
        let b = executor(&dir, "b", clock.clone());
        let c = executor(&dir, "c", clock.clone());
        a.checkin().unwrap();
        c.checkin().unwrap();

        // A holds the lock of a trigger whose stored schedule no longer decodes.
        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        let a_locks = Arc::new(LockManager::new(tables.clone(), "a", clock.clone(), 60_000, 60_000));
        let state = Arc::new(TriggerStateManager::new(tables.clone(), a_locks.clone()));
        let persister = Persister::new(tables.clone(), state, a_locks.clone());
        let broken = TriggerKey::new("g", "broken");
        let trigger = Trigger::new(
            broken.clone(),
            JobKey::new("g", "j"),
            Schedule::Simple(SimpleSchedule::once()),
            clock.now(),
        );
        a.connector
            .with_tx(|conn| {
                persister.store_job_and_trigger(conn, &Job::new(JobKey::new("g", "j"), "noop"), &trigger)?;
                a_locks.try_acquire(conn, &LockKey::trigger(&broken))?;
                conn.execute(
                    &format!("UPDATE {} SET schedule_kind='lunar'", tables.triggers),
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        // C holds a plain job lock.
        let c_locks = LockManager::new(tables, "c", clock.clone(), 60_000, 60_000);
        let job_lock = LockKey::job(&JobKey::new("g", "other"));
        c.connector
            .with_tx(|conn| c_locks.try_acquire(conn, &job_lock))
            .unwrap();

        clock.advance(Duration::seconds(10));
        let reports = b.checkin_once().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].instance_id, "c");
        assert_eq!(reports[0].jobs_unblocked, 1);
        let left = b.connector.with_conn(|conn| c_locks.get(conn, &job_lock)).unwrap();
        assert!(left.is_none());
    }

    #[tokio::test]
    async fn loop_checks_in_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let a = Arc::new(executor(&dir, "a", clock));
        let (tx, rx) = watch::channel(false);
        let handle = a.clone().start(rx);

        // The first interval tick fires immediately.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(a.checkins().unwrap().len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
