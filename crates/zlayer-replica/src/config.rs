//! Configuration types for WAL replication
//!
//! These are the already-resolved descriptors handed to the [`Store`]: where
//! each database lives, where its replica goes and how often to sync,
//! snapshot, compact and prune. Reading them from disk is left to the
//! embedding application.
//!
//! [`Store`]: crate::store::Store

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compaction::CompactionLevel;
use crate::error::{ReplicaError, Result};
use crate::retry::RetryPolicy;

/// Serde helpers for human readable durations ("30s", "5m", "24h")
pub(crate) mod duration {
    use humantime::format_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(|e| D::Error::custom(format!("invalid duration: {e}")))
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact format (single line)
    Compact,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    /// Filter directives overriding `level` (e.g. "zlayer_replica=debug")
    #[serde(default)]
    pub filter_directives: Option<String>,

    /// Also write JSON logs to rotating files
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,

    /// Include source code location in logs
    #[serde(default = "default_true")]
    pub include_location: bool,

    /// Include target (module path) in logs
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            filter_directives: None,
            file: None,
            include_location: true,
            include_target: true,
        }
    }
}

/// File logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileLoggingConfig {
    /// Directory for log files
    pub directory: PathBuf,

    /// File name prefix
    #[serde(default = "default_log_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub rotation: RotationStrategy,
}

fn default_log_prefix() -> String {
    "zlayer-replica".to_string()
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// Single file, never rotated
    Never,
}

/// Destination of one database's replica
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Directory on a locally mounted filesystem
    File { path: PathBuf },

    /// S3 or an S3-compatible object store (MinIO, R2, ...)
    S3 {
        bucket: String,
        /// Key prefix for all objects
        #[serde(default)]
        path: String,
        /// AWS region (if not using environment/profile defaults)
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint URL; implies path-style addressing
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// Azure Blob Storage
    Abs {
        /// Storage account; falls back to `AZURE_STORAGE_ACCOUNT_NAME`
        #[serde(default)]
        account_name: Option<String>,
        /// Account key; falls back to `AZURE_STORAGE_ACCOUNT_KEY`
        #[serde(default)]
        account_key: Option<String>,
        container: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default)]
        path: String,
        /// Service account key file; falls back to application default credentials
        #[serde(default)]
        service_account_path: Option<PathBuf>,
    },

    /// Directory on an SFTP server
    Sftp {
        /// `host` or `host:port`
        host: String,
        user: String,
        #[serde(default)]
        password: Option<String>,
        /// Private key used instead of a password
        #[serde(default)]
        key_path: Option<PathBuf>,
        path: String,
    },
}

impl BackendConfig {
    /// Short backend name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::S3 { .. } => "s3",
            Self::Abs { .. } => "abs",
            Self::Gcs { .. } => "gcs",
            Self::Sftp { .. } => "sftp",
        }
    }

    fn validate(&self) -> Result<()> {
        let missing = |field: &str| -> Result<()> {
            Err(ReplicaError::Config(format!(
                "{} replica requires a non-empty {field}",
                self.kind()
            )))
        };
        match self {
            Self::File { path } if path.as_os_str().is_empty() => missing("path"),
            Self::S3 { bucket, .. } if bucket.is_empty() => missing("bucket"),
            Self::Abs { container, .. } if container.is_empty() => missing("container"),
            Self::Gcs { bucket, .. } if bucket.is_empty() => missing("bucket"),
            Self::Sftp { host, .. } if host.is_empty() => missing("host"),
            Self::Sftp { user, .. } if user.is_empty() => missing("user"),
            _ => Ok(()),
        }
    }
}

/// One replicated database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbConfig {
    /// Path of the SQLite database file
    pub path: PathBuf,

    /// Directory for local replication state (default: `.<name>-replica` next to the database)
    #[serde(default)]
    pub meta_path: Option<PathBuf>,

    /// How often the WAL is polled for new frames
    #[serde(default = "default_sync_interval", with = "duration")]
    pub sync_interval: Duration,

    /// Compression level for zstd (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    pub replica: BackendConfig,
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_compression_level() -> i32 {
    3
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>, replica: BackendConfig) -> Self {
        Self {
            path: path.into(),
            meta_path: None,
            sync_interval: default_sync_interval(),
            compression_level: default_compression_level(),
            replica,
        }
    }

    pub fn with_meta_path(mut self, meta_path: impl Into<PathBuf>) -> Self {
        self.meta_path = Some(meta_path.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Directory holding local replication state for this database.
    pub fn meta_path(&self) -> PathBuf {
        if let Some(path) = &self.meta_path {
            return path.clone();
        }
        let name = self
            .path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{name}-replica"))
    }

    fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ReplicaError::Config("database path is empty".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(ReplicaError::Config(format!(
                "{}: sync interval must be positive",
                self.path.display()
            )));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ReplicaError::Config(format!(
                "{}: compression level {} outside 1-22",
                self.path.display(),
                self.compression_level
            )));
        }
        self.replica.validate()
    }
}

/// Snapshot cadence and retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotConfig {
    /// Age of the newest snapshot after which a new one is taken
    #[serde(default = "default_snapshot_interval", with = "duration")]
    pub interval: Duration,

    /// How long snapshots and segments stay restorable
    #[serde(default = "default_snapshot_retention", with = "duration")]
    pub retention: Duration,

    /// Snapshots always kept per generation regardless of age
    #[serde(default = "default_retain_count")]
    pub retain_count: usize,

    /// Cap on prior generations kept inside the retention window (unbounded if unset)
    #[serde(default)]
    pub retain_generations: Option<usize>,

    /// How often the snapshot and retention pass runs
    #[serde(default = "default_check_interval", with = "duration")]
    pub check_interval: Duration,
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_snapshot_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_retain_count() -> usize {
    1
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: default_snapshot_interval(),
            retention: default_snapshot_retention(),
            retain_count: default_retain_count(),
            retain_generations: None,
            check_interval: default_check_interval(),
        }
    }
}

/// One compaction level above the raw segment stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionLevelConfig {
    /// Units older than this are merged into this level
    #[serde(with = "duration")]
    pub interval: Duration,
}

fn default_levels() -> Vec<CompactionLevelConfig> {
    [30, 5 * 60, 60 * 60]
        .into_iter()
        .map(|secs| CompactionLevelConfig {
            interval: Duration::from_secs(secs),
        })
        .collect()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Everything the [`Store`](crate::store::Store) needs to run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicateConfig {
    #[serde(default)]
    pub dbs: Vec<DbConfig>,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Compaction levels 1..=N, intervals strictly increasing
    #[serde(default = "default_levels")]
    pub levels: Vec<CompactionLevelConfig>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Longest close waits for in-flight work before abandoning it
    #[serde(default = "default_shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            dbs: Vec::new(),
            snapshot: SnapshotConfig::default(),
            levels: default_levels(),
            retry: RetryPolicy::default(),
            shutdown_timeout: default_shutdown_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ReplicateConfig {
    pub fn with_db(mut self, db: DbConfig) -> Self {
        self.dbs.push(db);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_levels(mut self, intervals: &[Duration]) -> Self {
        self.levels = intervals
            .iter()
            .map(|interval| CompactionLevelConfig {
                interval: *interval,
            })
            .collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Compaction levels numbered from 1; level 0 is the shipped stream.
    pub fn compaction_levels(&self) -> Vec<CompactionLevel> {
        self.levels
            .iter()
            .zip(1u8..)
            .map(|(cfg, level)| CompactionLevel {
                level,
                interval: cfg.interval,
            })
            .collect()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for db in &self.dbs {
            db.validate()?;
            if !seen.insert(db.path.clone()) {
                return Err(ReplicaError::Config(format!(
                    "database {} configured more than once",
                    db.path.display()
                )));
            }
        }

        if self.levels.len() > usize::from(u8::MAX) {
            return Err(ReplicaError::Config("too many compaction levels".into()));
        }
        let mut previous = Duration::ZERO;
        for (i, level) in self.levels.iter().enumerate() {
            if level.interval <= previous {
                return Err(ReplicaError::Config(format!(
                    "compaction level {} interval {:?} must exceed the level below ({:?})",
                    i + 1,
                    level.interval,
                    previous
                )));
            }
            previous = level.interval;
        }

        if self.snapshot.interval.is_zero() || self.snapshot.check_interval.is_zero() {
            return Err(ReplicaError::Config(
                "snapshot interval and check interval must be positive".into(),
            ));
        }
        if self.snapshot.retain_count == 0 {
            return Err(ReplicaError::Config(
                "snapshot retain_count must keep at least one snapshot".into(),
            ));
        }
        Ok(())
    }
}
