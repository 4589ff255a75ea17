use std::sync::Arc;

use rusqlite::{params, Connection, Row};

use super::{millis_at, to_millis};
use crate::{db::Tables, error::Result, types::SchedulerCheckin};

fn checkin_from_row(row: &Row<'_>) -> rusqlite::Result<SchedulerCheckin> {
    Ok(SchedulerCheckin {
        scheduler_name: row.get(0)?,
        instance_id: row.get(1)?,
        last_checkin: millis_at(row, 2)?,
        checkin_interval_ms: row.get(3)?,
    })
}

pub struct CheckinDao {
    tables: Arc<Tables>,
}

impl CheckinDao {
    pub fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    /// Insert or refresh this instance's heartbeat row.
    pub fn upsert(&self, conn: &Connection, checkin: &SchedulerCheckin) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (scheduler_name, instance_id, last_checkin, checkin_interval)
                 VALUES (?1,?2,?3,?4)
                 ON CONFLICT (scheduler_name, instance_id)
                 DO UPDATE SET last_checkin=excluded.last_checkin,
                               checkin_interval=excluded.checkin_interval",
                self.tables.schedulers
            ),
            params![
                checkin.scheduler_name,
                checkin.instance_id,
                to_millis(checkin.last_checkin),
                checkin.checkin_interval_ms,
            ],
        )?;
        Ok(())
    }

    /// Every instance row of one logical scheduler.
    pub fn all(&self, conn: &Connection, scheduler_name: &str) -> Result<Vec<SchedulerCheckin>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT scheduler_name, instance_id, last_checkin, checkin_interval
             FROM {} WHERE scheduler_name=?1 ORDER BY instance_id",
            self.tables.schedulers
        ))?;
        let rows = stmt
            .query_map([scheduler_name], checkin_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {}", self.tables.schedulers), [])?)
    }
}
