//! Continuous SQLite WAL replication
//!
//! Ships committed WAL frames of live SQLite databases to a replica as an
//! ordered, checksum-chained stream of segments, grouped into generations
//! that each start from a full snapshot. Databases can be restored to the
//! latest state, a point in time or an exact segment index.
//!
//! # Features
//!
//! - **Change capture**: per-database WAL polling with discontinuity
//!   detection and automatic new generations
//! - **Backends**: local directory, S3, Azure Blob Storage, Google Cloud
//!   Storage and SFTP behind one [`ReplicaClient`] trait
//! - **Compaction**: tiered merging of segments without breaking the chain
//! - **Retention**: time and count based pruning of snapshots, segments and
//!   old generations
//! - **Restore**: chain-verified replay with partial results on corruption
//!
//! # Modules
//!
//! - [`store`]: multi-database service with background tasks
//! - [`db`]: change capture for one database
//! - [`generation`]: generations, positions, segments and restore planning
//! - [`backend`]: storage backends
//! - [`compaction`], [`retention`], [`restore`]: replica maintenance and recovery
//! - [`wal`]: SQLite WAL format
//!
//! # Example
//!
//! ```no_run
//! use zlayer_replica::{BackendConfig, DbConfig, ReplicateConfig, Store};
//!
//! # async fn run() -> zlayer_replica::Result<()> {
//! let config = ReplicateConfig::default().with_db(DbConfig::new(
//!     "/var/lib/app/data.db",
//!     BackendConfig::File {
//!         path: "/mnt/backup/data".into(),
//!     },
//! ));
//! let store = Store::open(config).await?;
//! // ... run the application ...
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod logging;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod store;
pub mod wal;

pub use backend::{open_client, ReplicaClient};
pub use config::{
    BackendConfig, DbConfig, LoggingConfig, ReplicateConfig, SnapshotConfig,
};
pub use db::{CapturePhase, Db, DbStatus};
pub use error::{ReplicaError, Result};
pub use generation::{GenerationId, Position, RestoreTarget, SegmentInfo, SnapshotInfo};
pub use logging::{init_logging, LogGuard};
pub use restore::{restore, RestoreOptions, RestoreOutcome};
pub use retry::RetryPolicy;
pub use store::Store;
