use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// A set of paused group names backed by one table. Used twice: once for job
/// groups and once for trigger groups.
pub struct PausedGroupDao {
    table: String,
}

impl PausedGroupDao {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Idempotent. Returns `true` if the group was not paused before.
    pub fn add(&self, conn: &Connection, group: &str) -> Result<bool> {
        let n = conn.execute(
            &format!("INSERT OR IGNORE INTO {} (group_name) VALUES (?1)", self.table),
            [group],
        )?;
        Ok(n > 0)
    }

    pub fn remove(&self, conn: &Connection, group: &str) -> Result<bool> {
        let n = conn.execute(
            &format!("DELETE FROM {} WHERE group_name=?1", self.table),
            [group],
        )?;
        Ok(n > 0)
    }

    pub fn contains(&self, conn: &Connection, group: &str) -> Result<bool> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE group_name=?1", self.table),
                [group],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn all(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT group_name FROM {} ORDER BY group_name",
            self.table
        ))?;
        let groups = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(groups)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {}", self.table), [])?)
    }
}
