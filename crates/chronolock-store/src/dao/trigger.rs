use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::warn;

use chronolock_core::{GroupMatcher, JobKey, TriggerKey};
use chronolock_schedule::{schedule, MisfireInstruction};

use super::{millis_at, opt_millis_at, parse_column, to_millis};
use crate::{
    db::Tables,
    envelope,
    error::{is_constraint_violation, Result, StoreError},
    types::{RecoveryMarker, Trigger, TriggerState},
};

const TRIGGER_COLUMNS: &str = "trigger_group, trigger_name, job_group, job_name, description, \
     state, next_fire_time, previous_fire_time, priority, misfire_instruction, start_time, \
     end_time, calendar_name, schedule_kind, schedule_props, data, recovery";

/// Raw row; schedule, data and recovery JSON are decoded afterwards so a
/// decoding failure surfaces as a store error instead of a rusqlite one.
struct TriggerRow {
    key: TriggerKey,
    job_key: JobKey,
    description: Option<String>,
    state: TriggerState,
    next_fire_time: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    priority: i32,
    misfire_instruction: MisfireInstruction,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    calendar_name: Option<String>,
    schedule_kind: String,
    schedule_props: String,
    data: String,
    recovery: Option<String>,
}

impl TriggerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            job_key: JobKey::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
            description: row.get(4)?,
            state: parse_column(row, 5)?,
            next_fire_time: opt_millis_at(row, 6)?,
            previous_fire_time: opt_millis_at(row, 7)?,
            priority: row.get(8)?,
            misfire_instruction: parse_column(row, 9)?,
            start_time: millis_at(row, 10)?,
            end_time: opt_millis_at(row, 11)?,
            calendar_name: row.get(12)?,
            schedule_kind: row.get(13)?,
            schedule_props: row.get(14)?,
            data: row.get(15)?,
            recovery: row.get(16)?,
        })
    }

    fn into_trigger(self) -> Result<Trigger> {
        let props: serde_json::Value = serde_json::from_str(&self.schedule_props)?;
        let recovery: Option<RecoveryMarker> = self
            .recovery
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Trigger {
            key: self.key,
            job_key: self.job_key,
            description: self.description,
            state: self.state,
            next_fire_time: self.next_fire_time,
            previous_fire_time: self.previous_fire_time,
            priority: self.priority,
            misfire_instruction: self.misfire_instruction,
            start_time: self.start_time,
            end_time: self.end_time,
            calendar_name: self.calendar_name,
            data: envelope::decode(&self.data)?,
            schedule: schedule::restore(&self.schedule_kind, &props)?,
            recovery,
        })
    }
}

/// Decode rows, skipping (and logging) the ones that no longer decode so one
/// bad document cannot stall every scan.
fn decode_rows(rows: Vec<TriggerRow>) -> Vec<Trigger> {
    rows.into_iter()
        .filter_map(|row| {
            let key = row.key.clone();
            row.into_trigger()
                .map_err(|e| warn!(trigger = %key, error = %e, "skipping unreadable trigger row"))
                .ok()
        })
        .collect()
}

fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct TriggerDao {
    tables: Arc<Tables>,
}

impl TriggerDao {
    pub fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    fn query(&self, conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Trigger>> {
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<TriggerRow> = stmt
            .query_map(args, TriggerRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(decode_rows(rows))
    }

    pub fn insert(&self, conn: &Connection, t: &Trigger) -> Result<()> {
        let props = serde_json::to_string(&t.schedule.extra_properties()?)?;
        let recovery = t.recovery.as_ref().map(serde_json::to_string).transpose()?;
        let res = conn.execute(
            &format!(
                "INSERT INTO {} ({TRIGGER_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                self.tables.triggers
            ),
            params![
                t.key.group,
                t.key.name,
                t.job_key.group,
                t.job_key.name,
                t.description,
                t.state.as_str(),
                t.next_fire_time.map(to_millis),
                t.previous_fire_time.map(to_millis),
                t.priority,
                t.misfire_instruction.to_string(),
                to_millis(t.start_time),
                t.end_time.map(to_millis),
                t.calendar_name,
                t.schedule.type_tag(),
                props,
                envelope::encode(&t.data)?,
                recovery,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "trigger",
                key: t.key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite every column of an existing trigger. `false` if it is absent.
    pub fn update(&self, conn: &Connection, t: &Trigger) -> Result<bool> {
        let props = serde_json::to_string(&t.schedule.extra_properties()?)?;
        let recovery = t.recovery.as_ref().map(serde_json::to_string).transpose()?;
        let n = conn.execute(
            &format!(
                "UPDATE {} SET job_group=?3, job_name=?4, description=?5, state=?6,
                    next_fire_time=?7, previous_fire_time=?8, priority=?9,
                    misfire_instruction=?10, start_time=?11, end_time=?12,
                    calendar_name=?13, schedule_kind=?14, schedule_props=?15,
                    data=?16, recovery=?17
                 WHERE trigger_group=?1 AND trigger_name=?2",
                self.tables.triggers
            ),
            params![
                t.key.group,
                t.key.name,
                t.job_key.group,
                t.job_key.name,
                t.description,
                t.state.as_str(),
                t.next_fire_time.map(to_millis),
                t.previous_fire_time.map(to_millis),
                t.priority,
                t.misfire_instruction.to_string(),
                to_millis(t.start_time),
                t.end_time.map(to_millis),
                t.calendar_name,
                t.schedule.type_tag(),
                props,
                envelope::encode(&t.data)?,
                recovery,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<Trigger>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {TRIGGER_COLUMNS} FROM {} WHERE trigger_group=?1 AND trigger_name=?2",
                    self.tables.triggers
                ),
                params![key.group, key.name],
                TriggerRow::from_row,
            )
            .optional()?;
        row.map(TriggerRow::into_trigger).transpose()
    }

    pub fn exists(&self, conn: &Connection, key: &TriggerKey) -> Result<bool> {
        Ok(self.state(conn, key)?.is_some())
    }

    pub fn state(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<TriggerState>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT state FROM {} WHERE trigger_group=?1 AND trigger_name=?2",
                    self.tables.triggers
                ),
                params![key.group, key.name],
                |row| parse_column(row, 0),
            )
            .optional()?)
    }

    pub fn delete(&self, conn: &Connection, key: &TriggerKey) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "DELETE FROM {} WHERE trigger_group=?1 AND trigger_name=?2",
                self.tables.triggers
            ),
            params![key.group, key.name],
        )?;
        Ok(n > 0)
    }

    pub fn set_state(&self, conn: &Connection, key: &TriggerKey, state: TriggerState) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "UPDATE {} SET state=?3 WHERE trigger_group=?1 AND trigger_name=?2",
                self.tables.triggers
            ),
            params![key.group, key.name, state.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Move the trigger to `to` only if it is currently in one of `from`.
    pub fn transition(
        &self,
        conn: &Connection,
        key: &TriggerKey,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET state=?1 WHERE trigger_group=?2 AND trigger_name=?3 AND state IN ({})",
            self.tables.triggers,
            placeholders(4, from.len())
        );
        let to_str = to.as_str();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&to_str, &key.group, &key.name];
        let from_strs: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        args.extend(from_strs.iter().map(|s| s as &dyn rusqlite::ToSql));
        Ok(conn.execute(&sql, params_from_iter(args))? > 0)
    }

    /// Move every trigger of `job` in one of `from` to `to`. Returns the count.
    pub fn transition_for_job(
        &self,
        conn: &Connection,
        job: &JobKey,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET state=?1 WHERE job_group=?2 AND job_name=?3 AND state IN ({})",
            self.tables.triggers,
            placeholders(4, from.len())
        );
        let to_str = to.as_str();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&to_str, &job.group, &job.name];
        let from_strs: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        args.extend(from_strs.iter().map(|s| s as &dyn rusqlite::ToSql));
        Ok(conn.execute(&sql, params_from_iter(args))?)
    }

    pub fn for_job(&self, conn: &Connection, job: &JobKey) -> Result<Vec<Trigger>> {
        self.query(
            conn,
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM {} WHERE job_group=?1 AND job_name=?2
                 ORDER BY trigger_group, trigger_name",
                self.tables.triggers
            ),
            params![job.group, job.name],
        )
    }

    pub fn count_for_job(&self, conn: &Connection, job: &JobKey) -> Result<usize> {
        let n: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE job_group=?1 AND job_name=?2",
                self.tables.triggers
            ),
            params![job.group, job.name],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// WAITING triggers due at or before `horizon`, earliest first, higher
    /// priority first on ties.
    pub fn acquirable(&self, conn: &Connection, horizon: DateTime<Utc>, limit: usize) -> Result<Vec<Trigger>> {
        self.query(
            conn,
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM {}
                 WHERE state='WAITING' AND next_fire_time IS NOT NULL AND next_fire_time <= ?1
                 ORDER BY next_fire_time ASC, priority DESC
                 LIMIT ?2",
                self.tables.triggers
            ),
            params![to_millis(horizon), limit as i64],
        )
    }

    /// ACQUIRED triggers due at or before `horizon` whose trigger lock is
    /// missing or was taken before `stale_before`, i.e. abandoned by the
    /// instance that acquired them.
    pub fn stale_acquired(
        &self,
        conn: &Connection,
        horizon: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>> {
        let t = &self.tables.triggers;
        self.query(
            conn,
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM {t}
                 WHERE state='ACQUIRED' AND next_fire_time IS NOT NULL AND next_fire_time <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM {l}
                       WHERE resource_type='trigger'
                         AND lock_group={t}.trigger_group AND lock_name={t}.trigger_name
                         AND acquired_at >= ?2)
                 ORDER BY next_fire_time ASC, priority DESC
                 LIMIT ?3",
                l = self.tables.locks
            ),
            params![to_millis(horizon), to_millis(stale_before), limit as i64],
        )
    }

    /// WAITING triggers whose next fire time is strictly before `before`.
    pub fn waiting_before(&self, conn: &Connection, before: DateTime<Utc>) -> Result<Vec<Trigger>> {
        self.query(
            conn,
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM {}
                 WHERE state='WAITING' AND next_fire_time IS NOT NULL AND next_fire_time < ?1
                 ORDER BY next_fire_time ASC, priority DESC",
                self.tables.triggers
            ),
            params![to_millis(before)],
        )
    }

    pub fn with_calendar(&self, conn: &Connection, calendar: &str) -> Result<Vec<Trigger>> {
        self.query(
            conn,
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM {} WHERE calendar_name=?1",
                self.tables.triggers
            ),
            params![calendar],
        )
    }

    pub fn count_with_calendar(&self, conn: &Connection, calendar: &str) -> Result<usize> {
        let n: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE calendar_name=?1",
                self.tables.triggers
            ),
            [calendar],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn group_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT trigger_group FROM {} ORDER BY trigger_group",
            self.tables.triggers
        ))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    pub fn keys_matching(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT trigger_group, trigger_name FROM {} WHERE trigger_group LIKE ?1 ESCAPE '\\'
             ORDER BY trigger_group, trigger_name",
            self.tables.triggers
        ))?;
        let keys: Vec<TriggerKey> = stmt
            .query_map([matcher.like_pattern()], |row| {
                Ok(TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(keys.into_iter().filter(|k| matcher.is_match(&k.group)).collect())
    }

    /// Triggers whose job is in a group selected by `matcher`.
    pub fn keys_for_job_groups(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT trigger_group, trigger_name, job_group FROM {} WHERE job_group LIKE ?1 ESCAPE '\\'",
            self.tables.triggers
        ))?;
        let rows: Vec<(TriggerKey, String)> = stmt
            .query_map([matcher.like_pattern()], |row| {
                Ok((
                    TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows
            .into_iter()
            .filter(|(_, job_group)| matcher.is_match(job_group))
            .map(|(key, _)| key)
            .collect())
    }

    pub fn count(&self, conn: &Connection) -> Result<usize> {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.tables.triggers),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {}", self.tables.triggers), [])?)
    }
}
