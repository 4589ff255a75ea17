use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use chronolock_core::{GroupMatcher, JobKey};

use crate::{
    db::Tables,
    envelope,
    error::{is_constraint_violation, Result, StoreError},
    types::{Job, JobData},
};

const JOB_COLUMNS: &str = "job_group, job_name, description, job_type, durable, \
     requests_recovery, concurrent_disallowed, persist_data, data";

/// Raw row; the data envelope is decoded outside the rusqlite closure.
struct JobRow {
    key: JobKey,
    description: Option<String>,
    job_type: String,
    durable: bool,
    requests_recovery: bool,
    concurrent_disallowed: bool,
    persist_data: bool,
    data: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: JobKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            description: row.get(2)?,
            job_type: row.get(3)?,
            durable: row.get(4)?,
            requests_recovery: row.get(5)?,
            concurrent_disallowed: row.get(6)?,
            persist_data: row.get(7)?,
            data: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            key: self.key,
            description: self.description,
            job_type: self.job_type,
            durable: self.durable,
            requests_recovery: self.requests_recovery,
            concurrent_execution_disallowed: self.concurrent_disallowed,
            persist_data_after_execution: self.persist_data,
            data: envelope::decode(&self.data)?,
        })
    }
}

pub struct JobDao {
    tables: Arc<Tables>,
}

impl JobDao {
    pub fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    pub fn insert(&self, conn: &Connection, job: &Job) -> Result<()> {
        let data = envelope::encode(&job.data)?;
        let res = conn.execute(
            &format!(
                "INSERT INTO {} ({JOB_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                self.tables.jobs
            ),
            params![
                job.key.group,
                job.key.name,
                job.description,
                job.job_type,
                job.durable,
                job.requests_recovery,
                job.concurrent_execution_disallowed,
                job.persist_data_after_execution,
                data,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "job",
                key: job.key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite every column of an existing job. `false` if it is absent.
    pub fn update(&self, conn: &Connection, job: &Job) -> Result<bool> {
        let data = envelope::encode(&job.data)?;
        let n = conn.execute(
            &format!(
                "UPDATE {} SET description=?3, job_type=?4, durable=?5, requests_recovery=?6,
                    concurrent_disallowed=?7, persist_data=?8, data=?9
                 WHERE job_group=?1 AND job_name=?2",
                self.tables.jobs
            ),
            params![
                job.key.group,
                job.key.name,
                job.description,
                job.job_type,
                job.durable,
                job.requests_recovery,
                job.concurrent_execution_disallowed,
                job.persist_data_after_execution,
                data,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn set_data(&self, conn: &Connection, key: &JobKey, data: &JobData) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "UPDATE {} SET data=?3 WHERE job_group=?1 AND job_name=?2",
                self.tables.jobs
            ),
            params![key.group, key.name, envelope::encode(data)?],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, conn: &Connection, key: &JobKey) -> Result<Option<Job>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM {} WHERE job_group=?1 AND job_name=?2",
                    self.tables.jobs
                ),
                params![key.group, key.name],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn exists(&self, conn: &Connection, key: &JobKey) -> Result<bool> {
        let found = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE job_group=?1 AND job_name=?2",
                    self.tables.jobs
                ),
                params![key.group, key.name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete(&self, conn: &Connection, key: &JobKey) -> Result<bool> {
        let n = conn.execute(
            &format!(
                "DELETE FROM {} WHERE job_group=?1 AND job_name=?2",
                self.tables.jobs
            ),
            params![key.group, key.name],
        )?;
        Ok(n > 0)
    }

    pub fn all(&self, conn: &Connection) -> Result<Vec<Job>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM {} ORDER BY job_group, job_name",
            self.tables.jobs
        ))?;
        let rows: Vec<JobRow> = stmt
            .query_map([], JobRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key = row.key.clone();
                row.into_job()
                    .map_err(|e| warn!(job = %key, error = %e, "skipping unreadable job row"))
                    .ok()
            })
            .collect())
    }

    pub fn group_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT job_group FROM {} ORDER BY job_group",
            self.tables.jobs
        ))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    pub fn keys_matching(&self, conn: &Connection, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT job_group, job_name FROM {} WHERE job_group LIKE ?1 ESCAPE '\\'
             ORDER BY job_group, job_name",
            self.tables.jobs
        ))?;
        let keys: Vec<JobKey> = stmt
            .query_map([matcher.like_pattern()], |row| {
                Ok(JobKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        // LIKE is case-insensitive for ASCII; the matcher is not.
        Ok(keys.into_iter().filter(|k| matcher.is_match(&k.group)).collect())
    }

    pub fn count(&self, conn: &Connection) -> Result<usize> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.tables.jobs), [], |r| {
            r.get(0)
        })?;
        Ok(n as usize)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&format!("DELETE FROM {}", self.tables.jobs), [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn setup() -> (Connection, JobDao) {
        let conn = Connection::open_in_memory().unwrap();
        let tables = Arc::new(Tables::new("qrtz_").unwrap());
        init_db(&conn, &tables).unwrap();
        (conn, JobDao::new(tables))
    }

    #[test]
    fn duplicate_insert_is_already_exists() {
        let (conn, dao) = setup();
        let job = Job::new(JobKey::new("g", "j"), "noop");
        dao.insert(&conn, &job).unwrap();
        let err = dao.insert(&conn, &job).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { kind: "job", .. }));
    }

    #[test]
    fn stored_job_reads_back() {
        let (conn, dao) = setup();
        let job = Job::new(JobKey::new("g", "j"), "report")
            .durable(true)
            .disallow_concurrent_execution(true)
            .with_data("to", "ops@example.com");
        dao.insert(&conn, &job).unwrap();
        assert_eq!(dao.get(&conn, &job.key).unwrap(), Some(job));
        assert_eq!(dao.get(&conn, &JobKey::new("g", "other")).unwrap(), None);
    }

    #[test]
    fn matcher_is_case_sensitive() {
        let (conn, dao) = setup();
        dao.insert(&conn, &Job::new(JobKey::new("Reports", "a"), "x")).unwrap();
        dao.insert(&conn, &Job::new(JobKey::new("reports", "b"), "x")).unwrap();
        let keys = dao
            .keys_matching(&conn, &GroupMatcher::starts_with("rep"))
            .unwrap();
        assert_eq!(keys, vec![JobKey::new("reports", "b")]);
        assert_eq!(dao.group_names(&conn).unwrap().len(), 2);
    }
}
