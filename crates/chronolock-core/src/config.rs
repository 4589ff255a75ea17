use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

pub const DEFAULT_TABLE_PREFIX: &str = "qrtz_";
pub const DEFAULT_SCHEDULER_NAME: &str = "chronolock";
/// Instance id placeholder replaced by a generated id at startup.
pub const AUTO_INSTANCE_ID: &str = "AUTO";
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 5_000;
pub const DEFAULT_TRIGGER_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
pub const DEFAULT_CHECKIN_INTERVAL_MS: u64 = 7_500;
pub const DEFAULT_DEAD_FACTOR: u32 = 2;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (chronolock.toml + CHRONOLOCK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChronolockConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

/// Where the shared database lives and how its tables are named.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Prepended to every table name so several deployments can share a file.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// How long a connection waits on another process's write transaction.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            table_prefix: default_table_prefix(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_name")]
    pub name: String,
    /// `AUTO` generates a fresh id on every start.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    /// Age after which another instance may steal a trigger lock.
    #[serde(default = "default_trigger_timeout_ms")]
    pub trigger_timeout_ms: u64,
    /// Age after which another instance may steal a job lock.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_scheduler_name(),
            instance_id: default_instance_id(),
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            trigger_timeout_ms: DEFAULT_TRIGGER_TIMEOUT_MS,
            job_timeout_ms: DEFAULT_JOB_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    /// The configured instance id, or a freshly generated UUIDv7 for `AUTO`.
    pub fn resolved_instance_id(&self) -> String {
        if self.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            Uuid::now_v7().to_string()
        } else {
            self.instance_id.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,
    /// A peer is dead once its checkin is older than `checkin_interval_ms * dead_factor`.
    #[serde(default = "default_dead_factor")]
    pub dead_factor: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            checkin_interval_ms: DEFAULT_CHECKIN_INTERVAL_MS,
            dead_factor: DEFAULT_DEAD_FACTOR,
        }
    }
}

/// Settings for the `chronolock-node` host loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub batch_time_window_ms: u64,
    #[serde(default = "default_misfire_scan_interval_ms")]
    pub misfire_scan_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: default_idle_wait_ms(),
            batch_size: default_batch_size(),
            batch_time_window_ms: 0,
            misfire_scan_interval_ms: default_misfire_scan_interval_ms(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chronolock/chronolock.db", home)
}
fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_scheduler_name() -> String {
    DEFAULT_SCHEDULER_NAME.to_string()
}
fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_trigger_timeout_ms() -> u64 {
    DEFAULT_TRIGGER_TIMEOUT_MS
}
fn default_job_timeout_ms() -> u64 {
    DEFAULT_JOB_TIMEOUT_MS
}
fn default_checkin_interval_ms() -> u64 {
    DEFAULT_CHECKIN_INTERVAL_MS
}
fn default_dead_factor() -> u32 {
    DEFAULT_DEAD_FACTOR
}
fn default_idle_wait_ms() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    1
}
fn default_misfire_scan_interval_ms() -> u64 {
    60_000
}

impl ChronolockConfig {
    /// Load config from a TOML file with CHRONOLOCK_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CHRONOLOCK_SCHEDULER__MISFIRE_THRESHOLD_MS=10000`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChronolockConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHRONOLOCK_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the store unsafe to run.
    pub fn validate(&self) -> Result<()> {
        validate_table_prefix(&self.store.table_prefix)?;
        if self.scheduler.name.trim().is_empty() {
            return Err(CoreError::Config("scheduler.name must not be empty".into()));
        }
        if self.scheduler.instance_id.trim().is_empty() {
            return Err(CoreError::Config(
                "scheduler.instance_id must not be empty".into(),
            ));
        }
        if self.scheduler.trigger_timeout_ms == 0 || self.scheduler.job_timeout_ms == 0 {
            return Err(CoreError::Config("lock timeouts must be positive".into()));
        }
        if self.cluster.checkin_interval_ms == 0 {
            return Err(CoreError::Config(
                "cluster.checkin_interval_ms must be positive".into(),
            ));
        }
        if self.cluster.dead_factor == 0 {
            return Err(CoreError::Config("cluster.dead_factor must be at least 1".into()));
        }
        if self.node.batch_size == 0 {
            return Err(CoreError::Config("node.batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Table names are spliced into SQL, so only identifier characters are allowed.
pub fn validate_table_prefix(prefix: &str) -> Result<()> {
    if prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(CoreError::Config(format!(
            "store.table_prefix may only contain [A-Za-z0-9_], got {prefix:?}"
        )))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chronolock/chronolock.toml", home)
}
