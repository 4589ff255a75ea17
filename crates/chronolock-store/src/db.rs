use rusqlite::Connection;

use chronolock_core::config::validate_table_prefix;

use crate::error::Result;

/// Prefixed table names, shared by every DAO of one store.
#[derive(Debug, Clone)]
pub struct Tables {
    pub jobs: String,
    pub triggers: String,
    pub locks: String,
    pub calendars: String,
    pub paused_job_groups: String,
    pub paused_trigger_groups: String,
    pub schedulers: String,
}

impl Tables {
    pub fn new(prefix: &str) -> Result<Self> {
        validate_table_prefix(prefix)?;
        Ok(Self {
            jobs: format!("{prefix}jobs"),
            triggers: format!("{prefix}triggers"),
            locks: format!("{prefix}locks"),
            calendars: format!("{prefix}calendars"),
            paused_job_groups: format!("{prefix}paused_job_groups"),
            paused_trigger_groups: format!("{prefix}paused_trigger_groups"),
            schedulers: format!("{prefix}schedulers"),
        })
    }
}

/// Initialise the store schema in `conn` (idempotent).
///
/// Times are epoch milliseconds. Every uniqueness rule the coordination
/// protocol relies on is a real `UNIQUE` index, so concurrent processes are
/// arbitrated by SQLite rather than by read-then-write checks.
pub fn init_db(conn: &Connection, t: &Tables) -> Result<()> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {jobs} (
            job_group               TEXT    NOT NULL,
            job_name                TEXT    NOT NULL,
            description             TEXT,
            job_type                TEXT    NOT NULL,
            durable                 INTEGER NOT NULL DEFAULT 0,
            requests_recovery       INTEGER NOT NULL DEFAULT 0,
            concurrent_disallowed   INTEGER NOT NULL DEFAULT 0,
            persist_data            INTEGER NOT NULL DEFAULT 0,
            data                    TEXT    NOT NULL,   -- versioned JSON envelope
            PRIMARY KEY (job_group, job_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS {triggers} (
            trigger_group       TEXT    NOT NULL,
            trigger_name        TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            description         TEXT,
            state               TEXT    NOT NULL,
            next_fire_time      INTEGER,
            previous_fire_time  INTEGER,
            priority            INTEGER NOT NULL DEFAULT 5,
            misfire_instruction TEXT    NOT NULL,
            start_time          INTEGER NOT NULL,
            end_time            INTEGER,
            calendar_name       TEXT,
            schedule_kind       TEXT    NOT NULL,
            schedule_props      TEXT    NOT NULL,   -- kind-specific JSON
            data                TEXT    NOT NULL,   -- versioned JSON envelope
            recovery            TEXT,               -- JSON RecoveryMarker or NULL
            PRIMARY KEY (trigger_group, trigger_name),
            FOREIGN KEY (job_group, job_name) REFERENCES {jobs} (job_group, job_name)
        ) STRICT;

        -- Acquisition scan: WHERE state = 'WAITING' AND next_fire_time <= ?
        CREATE INDEX IF NOT EXISTS idx_{triggers}_state_next
            ON {triggers} (state, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_{triggers}_job
            ON {triggers} (job_group, job_name);

        CREATE TABLE IF NOT EXISTS {locks} (
            resource_type   TEXT    NOT NULL,
            lock_group      TEXT    NOT NULL,
            lock_name       TEXT    NOT NULL,
            instance_id     TEXT    NOT NULL,
            acquired_at     INTEGER NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS uq_{locks}_resource
            ON {locks} (resource_type, lock_group, lock_name);
        CREATE INDEX IF NOT EXISTS idx_{locks}_owner ON {locks} (instance_id);

        CREATE TABLE IF NOT EXISTS {calendars} (
            name        TEXT    NOT NULL,
            calendar    TEXT    NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS uq_{calendars}_name ON {calendars} (name);

        CREATE TABLE IF NOT EXISTS {paused_job_groups} (
            group_name  TEXT    NOT NULL PRIMARY KEY
        ) STRICT;

        CREATE TABLE IF NOT EXISTS {paused_trigger_groups} (
            group_name  TEXT    NOT NULL PRIMARY KEY
        ) STRICT;

        CREATE TABLE IF NOT EXISTS {schedulers} (
            scheduler_name      TEXT    NOT NULL,
            instance_id         TEXT    NOT NULL,
            last_checkin        INTEGER NOT NULL,
            checkin_interval    INTEGER NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS uq_{schedulers}_instance
            ON {schedulers} (scheduler_name, instance_id);
        ",
        jobs = t.jobs,
        triggers = t.triggers,
        locks = t.locks,
        calendars = t.calendars,
        paused_job_groups = t.paused_job_groups,
        paused_trigger_groups = t.paused_trigger_groups,
        schedulers = t.schedulers,
    ))?;
    Ok(())
}
