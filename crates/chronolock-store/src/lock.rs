use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use chronolock_core::Clock;

use crate::{
    dao::LockDao,
    db::Tables,
    error::{is_constraint_violation, Result, StoreError},
    types::{Lock, LockKey, LockOutcome, ResourceType},
};

/// Cross-process mutual exclusion over named resources, arbitrated by the
/// unique index on the lock table.
///
/// A lock is taken by inserting its row. A conflicting insert is denied
/// unless the existing row is older than the resource type's timeout, in
/// which case ownership is moved over with a compare-and-set update. Release
/// only deletes rows the caller still owns.
pub struct LockManager {
    dao: LockDao,
    instance_id: String,
    clock: Arc<dyn Clock>,
    trigger_timeout: Duration,
    job_timeout: Duration,
}

impl LockManager {
    pub fn new(
        tables: Arc<Tables>,
        instance_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        trigger_timeout_ms: u64,
        job_timeout_ms: u64,
    ) -> Self {
        Self {
            dao: LockDao::new(tables),
            instance_id: instance_id.into(),
            clock,
            trigger_timeout: Duration::milliseconds(trigger_timeout_ms as i64),
            job_timeout: Duration::milliseconds(job_timeout_ms as i64),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn timeout_for(&self, resource_type: ResourceType) -> Duration {
        match resource_type {
            ResourceType::Job => self.job_timeout,
            ResourceType::Trigger | ResourceType::Recovery => self.trigger_timeout,
        }
    }

    /// Locks of `resource_type` taken before this instant may be stolen.
    pub fn stale_before(&self, resource_type: ResourceType) -> DateTime<Utc> {
        self.clock.now() - self.timeout_for(resource_type)
    }

    /// One acquisition attempt. Never waits.
    pub fn try_acquire(&self, conn: &Connection, key: &LockKey) -> Result<LockOutcome> {
        let now = self.clock.now();
        let lock = Lock {
            key: key.clone(),
            instance_id: self.instance_id.clone(),
            acquired_at: now,
        };
        // Two rounds: the holder may release between our insert and our read.
        for _ in 0..2 {
            match self.dao.insert(conn, &lock) {
                Ok(()) => {
                    debug!(lock = %key, "lock granted");
                    return Ok(LockOutcome::Granted);
                }
                Err(e) if is_constraint_violation(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let Some(existing) = self.dao.get(conn, key)? else {
                continue;
            };
            let age = now - existing.acquired_at;
            if existing.instance_id == self.instance_id || age <= self.timeout_for(key.resource_type) {
                debug!(lock = %key, owner = %existing.instance_id, "lock denied");
                return Ok(LockOutcome::Denied {
                    owner: existing.instance_id,
                });
            }
            if self.dao.reassign(conn, &existing, &self.instance_id, now)? {
                warn!(
                    lock = %key,
                    previous_owner = %existing.instance_id,
                    age_ms = age.num_milliseconds(),
                    "stale lock stolen"
                );
                return Ok(LockOutcome::Stolen {
                    previous_owner: existing.instance_id,
                });
            }
        }
        let owner = self
            .dao
            .get(conn, key)?
            .map(|l| l.instance_id)
            .unwrap_or_default();
        Ok(LockOutcome::Denied { owner })
    }

    /// Like [`LockManager::try_acquire`] but a denial is an error.
    pub fn acquire(&self, conn: &Connection, key: &LockKey) -> Result<LockOutcome> {
        match self.try_acquire(conn, key)? {
            LockOutcome::Denied { owner } => Err(StoreError::LockDenied {
                resource: format!("{key} (held by {owner})"),
            }),
            outcome => Ok(outcome),
        }
    }

    /// Delete the lock if this instance still owns it. `false` means it had
    /// already timed out and been taken (or was never held).
    pub fn release(&self, conn: &Connection, key: &LockKey) -> Result<bool> {
        let released = self.dao.delete_owned(conn, key, &self.instance_id)?;
        if !released {
            debug!(lock = %key, "release skipped: not the owner");
        }
        Ok(released)
    }

    /// Delete regardless of owner. Only recovery and removal paths use this.
    pub fn force_release(&self, conn: &Connection, key: &LockKey) -> Result<bool> {
        let released = self.dao.delete(conn, key)?;
        if released {
            info!(lock = %key, "lock force-released");
        }
        Ok(released)
    }

    /// Move a lock observed as held by a dead owner over to this instance.
    /// `false` if someone else changed it in the meantime.
    pub fn take_over(&self, conn: &Connection, observed: &Lock) -> Result<bool> {
        self.dao
            .reassign(conn, observed, &self.instance_id, self.clock.now())
    }

    pub fn holds(&self, conn: &Connection, key: &LockKey) -> Result<bool> {
        Ok(self
            .dao
            .get(conn, key)?
            .is_some_and(|l| l.instance_id == self.instance_id))
    }

    pub fn get(&self, conn: &Connection, key: &LockKey) -> Result<Option<Lock>> {
        self.dao.get(conn, key)
    }

    pub fn owned_by(&self, conn: &Connection, owner: &str) -> Result<Vec<Lock>> {
        self.dao.owned_by(conn, owner)
    }

    pub fn all(&self, conn: &Connection) -> Result<Vec<Lock>> {
        self.dao.all(conn)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        self.dao.delete_all(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::{TimeZone, Utc};
    use chronolock_core::{ManualClock, TriggerKey};

    struct Fixture {
        conn: Connection,
        clock: Arc<ManualClock>,
        a: LockManager,
        b: LockManager,
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        init_db(&conn, &tables).unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let a = LockManager::new(tables.clone(), "a", clock.clone(), 1_000, 5_000);
        let b = LockManager::new(tables, "b", clock.clone(), 1_000, 5_000);
        Fixture { conn, clock, a, b }
    }

    fn key() -> LockKey {
        LockKey::trigger(&TriggerKey::new("g", "t"))
    }

    #[test]
    fn held_lock_is_denied_to_peer() {
        let f = fixture();
        assert_eq!(f.a.try_acquire(&f.conn, &key()).unwrap(), LockOutcome::Granted);
        assert_eq!(
            f.b.try_acquire(&f.conn, &key()).unwrap(),
            LockOutcome::Denied { owner: "a".into() }
        );
        assert!(matches!(
            f.b.acquire(&f.conn, &key()),
            Err(StoreError::LockDenied { .. })
        ));
    }

    #[test]
    fn reacquire_by_owner_is_denied() {
        let f = fixture();
        f.a.try_acquire(&f.conn, &key()).unwrap();
        assert!(!f.a.try_acquire(&f.conn, &key()).unwrap().is_held());
    }

    #[test]
    fn stale_lock_is_stolen_after_timeout() {
        let f = fixture();
        f.a.try_acquire(&f.conn, &key()).unwrap();
        f.clock.advance(Duration::milliseconds(1_000));
        assert!(!f.b.try_acquire(&f.conn, &key()).unwrap().is_held());
        f.clock.advance(Duration::milliseconds(1));
        assert_eq!(
            f.b.try_acquire(&f.conn, &key()).unwrap(),
            LockOutcome::Stolen {
                previous_owner: "a".into()
            }
        );
        assert!(f.b.holds(&f.conn, &key()).unwrap());
        // The old owner's release is now a no-op.
        assert!(!f.a.release(&f.conn, &key()).unwrap());
        assert!(f.b.holds(&f.conn, &key()).unwrap());
    }

    #[test]
    fn job_locks_use_job_timeout() {
        let f = fixture();
        let job = LockKey::job(&chronolock_core::JobKey::new("g", "j"));
        f.a.try_acquire(&f.conn, &job).unwrap();
        f.clock.advance(Duration::milliseconds(2_000));
        assert!(!f.b.try_acquire(&f.conn, &job).unwrap().is_held());
        f.clock.advance(Duration::milliseconds(3_001));
        assert!(f.b.try_acquire(&f.conn, &job).unwrap().is_held());
    }

    #[test]
    fn release_frees_for_peer() {
        let f = fixture();
        f.a.try_acquire(&f.conn, &key()).unwrap();
        assert!(f.a.release(&f.conn, &key()).unwrap());
        assert_eq!(f.b.try_acquire(&f.conn, &key()).unwrap(), LockOutcome::Granted);
    }
}
