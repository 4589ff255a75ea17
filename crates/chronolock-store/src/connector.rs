use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, warn};

use chronolock_core::config::StoreConfig;

use crate::{
    db::{init_db, Tables},
    error::Result,
};

/// One session on the shared database.
///
/// Every mutating call goes through [`Connector::with_tx`], which runs the
/// closure inside a `BEGIN IMMEDIATE` transaction: the write lock is taken up
/// front, so two processes can never interleave a read-check-write sequence.
pub struct Connector {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Connector {
    /// Open (creating if needed) the database at `config.path` and make sure
    /// the schema exists.
    pub fn open(config: &StoreConfig, tables: &Tables) -> Result<Self> {
        let path = Path::new(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_db(&conn, tables)?;
        debug!(path = %path.display(), "store connection opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// A private in-memory database; only useful for single-instance tests.
    pub fn open_in_memory(tables: &Tables) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn, tables)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` in an immediate transaction. Commits on `Ok`; on `Err` the
    /// transaction is rolled back before the error is returned.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }

    /// Run a read-only closure outside any explicit transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }
}
