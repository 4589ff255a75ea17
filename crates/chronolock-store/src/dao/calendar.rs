use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use chronolock_schedule::Calendar;

use crate::{
    db::Tables,
    error::{is_constraint_violation, Result, StoreError},
};

pub struct CalendarDao {
    tables: Arc<Tables>,
}

impl CalendarDao {
    pub fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    pub fn insert(&self, conn: &Connection, name: &str, calendar: &Calendar) -> Result<()> {
        let res = conn.execute(
            &format!(
                "INSERT INTO {} (name, calendar) VALUES (?1, ?2)",
                self.tables.calendars
            ),
            params![name, serde_json::to_string(calendar)?],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "calendar",
                key: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update(&self, conn: &Connection, name: &str, calendar: &Calendar) -> Result<bool> {
        let n = conn.execute(
            &format!("UPDATE {} SET calendar=?2 WHERE name=?1", self.tables.calendars),
            params![name, serde_json::to_string(calendar)?],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, conn: &Connection, name: &str) -> Result<Option<Calendar>> {
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT calendar FROM {} WHERE name=?1", self.tables.calendars),
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    pub fn exists(&self, conn: &Connection, name: &str) -> Result<bool> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE name=?1", self.tables.calendars),
                [name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete(&self, conn: &Connection, name: &str) -> Result<bool> {
        let n = conn.execute(
            &format!("DELETE FROM {} WHERE name=?1", self.tables.calendars),
            [name],
        )?;
        Ok(n > 0)
    }

    pub fn names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT name FROM {} ORDER BY name",
            self.tables.calendars
        ))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    pub fn count(&self, conn: &Connection) -> Result<usize> {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.tables.calendars),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {}", self.tables.calendars), [])?)
    }
}
