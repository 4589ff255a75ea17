use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{millis_at, parse_column, to_millis};
use crate::{
    db::Tables,
    error::Result,
    types::{Lock, LockKey},
};

fn lock_from_row(row: &Row<'_>) -> rusqlite::Result<Lock> {
    Ok(Lock {
        key: LockKey {
            resource_type: parse_column(row, 0)?,
            group: row.get(1)?,
            name: row.get(2)?,
        },
        instance_id: row.get(3)?,
        acquired_at: millis_at(row, 4)?,
    })
}

pub struct LockDao {
    tables: Arc<Tables>,
}

impl LockDao {
    pub fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    /// Plain insert; a held lock surfaces as a constraint violation the
    /// caller interprets.
    pub fn insert(&self, conn: &Connection, lock: &Lock) -> rusqlite::Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (resource_type, lock_group, lock_name, instance_id, acquired_at)
                 VALUES (?1,?2,?3,?4,?5)",
                self.tables.locks
            ),
            params![
                lock.key.resource_type.as_str(),
                lock.key.group,
                lock.key.name,
                lock.instance_id,
                to_millis(lock.acquired_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, key: &LockKey) -> Result<Option<Lock>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT resource_type, lock_group, lock_name, instance_id, acquired_at
                     FROM {} WHERE resource_type=?1 AND lock_group=?2 AND lock_name=?3",
                    self.tables.locks
                ),
                params![key.resource_type.as_str(), key.group, key.name],
                lock_from_row,
            )
            .optional()?)
    }

    /// Compare-and-set ownership: succeeds only if the row still carries the
    /// owner and timestamp the caller observed.
    pub fn reassign(
        &self,
        conn: &Connection,
        observed: &Lock,
        new_owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "UPDATE {} SET instance_id=?4, acquired_at=?5
                 WHERE resource_type=?1 AND lock_group=?2 AND lock_name=?3
                   AND instance_id=?6 AND acquired_at=?7",
                self.tables.locks
            ),
            params![
                observed.key.resource_type.as_str(),
                observed.key.group,
                observed.key.name,
                new_owner,
                to_millis(at),
                observed.instance_id,
                to_millis(observed.acquired_at),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn delete_owned(&self, conn: &Connection, key: &LockKey, owner: &str) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "DELETE FROM {} WHERE resource_type=?1 AND lock_group=?2 AND lock_name=?3
                 AND instance_id=?4",
                self.tables.locks
            ),
            params![key.resource_type.as_str(), key.group, key.name, owner],
        )?;
        Ok(n > 0)
    }

    pub fn delete(&self, conn: &Connection, key: &LockKey) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "DELETE FROM {} WHERE resource_type=?1 AND lock_group=?2 AND lock_name=?3",
                self.tables.locks
            ),
            params![key.resource_type.as_str(), key.group, key.name],
        )?;
        Ok(n > 0)
    }

    pub fn owned_by(&self, conn: &Connection, owner: &str) -> Result<Vec<Lock>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT resource_type, lock_group, lock_name, instance_id, acquired_at
             FROM {} WHERE instance_id=?1 ORDER BY acquired_at",
            self.tables.locks
        ))?;
        let locks = stmt
            .query_map([owner], lock_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(locks)
    }

    pub fn all(&self, conn: &Connection) -> Result<Vec<Lock>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT resource_type, lock_group, lock_name, instance_id, acquired_at
             FROM {} ORDER BY acquired_at",
            self.tables.locks
        ))?;
        let locks = stmt
            .query_map([], lock_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(locks)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {}", self.tables.locks), [])?)
    }
}
