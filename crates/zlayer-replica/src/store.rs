//! Replication service over a set of databases
//!
//! A [`Store`] owns one capture task per database plus shared background
//! tasks: one compaction task per configured level and one task that takes
//! due snapshots and enforces retention. All of them stop cooperatively when
//! the store is closed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::compaction::{self, CompactionLevel};
use crate::config::{ReplicateConfig, SnapshotConfig};
use crate::db::{CapturePhase, Db, DbStatus};
use crate::error::{ReplicaError, Result};
use crate::retention::{self, RetentionPolicy};
use crate::retry::RetryPolicy;

/// A running set of replicated databases
pub struct Store {
    config: ReplicateConfig,
    dbs: Vec<Arc<Db>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Store {
    /// Open every configured database and start replicating.
    ///
    /// Opening is all-or-nothing: if any database fails to open, the ones
    /// already opened are closed again and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError::Config`] for an invalid configuration, or the
    /// first error raised while opening a database.
    pub async fn open(config: ReplicateConfig) -> Result<Self> {
        config.validate()?;

        let mut dbs: Vec<Db> = Vec::with_capacity(config.dbs.len());
        for db_config in &config.dbs {
            match Db::open(db_config.clone(), config.retry.clone()).await {
                Ok(db) => dbs.push(db),
                Err(e) => {
                    error!("Failed to open {}: {}", db_config.path.display(), e);
                    for opened in &dbs {
                        if let Err(close_err) = opened.close().await {
                            warn!("Failed to close {}: {}", opened.path().display(), close_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self::start(config, dbs))
    }

    /// Start replicating databases that were opened by the caller.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: ReplicateConfig, dbs: Vec<Db>) -> Self {
        let dbs: Vec<Arc<Db>> = dbs.into_iter().map(Arc::new).collect();
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        for db in &dbs {
            let status = db.status();
            info!("initialized db: {}", status.path.display());
            info!(
                "replicating to: type={} {} sync-interval={:?}",
                status.kind,
                status.location,
                db.config().sync_interval
            );
            let span = info_span!("db", path = %status.path.display());
            handles.push(tokio::spawn(
                Arc::clone(db).run(shutdown.subscribe()).instrument(span),
            ));
        }

        for level in config.compaction_levels() {
            let span = info_span!("compaction", level = level.level);
            handles.push(tokio::spawn(
                compaction_loop(
                    dbs.clone(),
                    level,
                    config.retry.clone(),
                    shutdown.subscribe(),
                )
                .instrument(span),
            ));
        }

        handles.push(tokio::spawn(
            snapshot_loop(dbs.clone(), config.snapshot.clone(), shutdown.subscribe())
                .instrument(info_span!("snapshots")),
        ));

        debug!(
            "Store started with {} database(s) and {} background task(s)",
            dbs.len(),
            handles.len()
        );
        Self {
            config,
            dbs,
            shutdown,
            handles,
        }
    }

    pub fn dbs(&self) -> &[Arc<Db>] {
        &self.dbs
    }

    pub fn config(&self) -> &ReplicateConfig {
        &self.config
    }

    pub fn statuses(&self) -> Vec<DbStatus> {
        self.dbs.iter().map(|db| db.status()).collect()
    }

    /// Run one compaction, snapshot and retention pass over every database,
    /// independent of the background schedules.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<()> {
        let levels = self.config.compaction_levels();
        for db in &self.dbs {
            let Some(position) = db.position() else {
                continue;
            };
            compaction::compact_all(
                db.client().as_ref(),
                &position,
                &levels,
                &self.config.retry,
                now,
            )
            .await?;
            snapshot_and_enforce(db, &self.config.snapshot, now).await?;
        }
        Ok(())
    }

    /// Stop all tasks and flush every database.
    ///
    /// Background tasks get `shutdown_timeout` to finish the work in hand and
    /// are aborted after that. Every database is closed even if others fail.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError::Close`] listing each database that failed to
    /// close.
    pub async fn close(mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        // Err only means every task already exited.
        let _ = self.shutdown.send(true);

        let mut handles = std::mem::take(&mut self.handles);
        let joined = timeout_at(deadline, join_all(handles.iter_mut())).await;
        match joined {
            Ok(results) => {
                for joined in results {
                    if let Err(e) = joined {
                        warn!("Background task ended abnormally: {}", e);
                    }
                }
            }
            Err(_) => {
                warn!(
                    "Background tasks still running after {:?}, aborting them",
                    self.config.shutdown_timeout
                );
                for handle in &handles {
                    handle.abort();
                }
            }
        }

        let mut failures: Vec<(PathBuf, ReplicaError)> = Vec::new();
        for db in &self.dbs {
            let path = db.path().to_path_buf();
            match timeout_at(deadline, db.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Failed to close {}: {}", path.display(), e);
                    failures.push((path, e));
                }
                Err(_) => {
                    let e = ReplicaError::InvalidState(format!(
                        "close did not finish within {:?}",
                        self.config.shutdown_timeout
                    ));
                    error!("Failed to close {}: {}", path.display(), e);
                    failures.push((path, e));
                }
            }
        }

        if failures.is_empty() {
            info!("Store closed");
            Ok(())
        } else {
            Err(ReplicaError::Close(failures))
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn compaction_loop(
    dbs: Vec<Arc<Db>>,
    level: CompactionLevel,
    retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(level.interval);
    while !*shutdown.borrow() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for db in &dbs {
                    let Some(position) = db.position() else {
                        continue;
                    };
                    if let Err(e) =
                        compaction::compact(db.client().as_ref(), &position, &level, &retry, Utc::now()).await
                    {
                        warn!("Level {} compaction of {} failed: {}", level.level, db.path().display(), e);
                    }
                }
            }
        }
    }
}

async fn snapshot_loop(
    dbs: Vec<Arc<Db>>,
    config: SnapshotConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(config.check_interval);
    while !*shutdown.borrow() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for db in &dbs {
                    if let Err(e) = snapshot_and_enforce(db, &config, Utc::now()).await {
                        warn!("Snapshot/retention of {} failed: {}", db.path().display(), e);
                    }
                }
            }
        }
    }
}

async fn snapshot_and_enforce(db: &Db, config: &SnapshotConfig, now: DateTime<Utc>) -> Result<()> {
    db.snapshot_if_due(config.interval, now).await?;

    let status = db.status();
    let (CapturePhase::Steady, Some(position)) = (status.phase, status.position) else {
        debug!("Skipping retention for {} until capture is steady", db.path().display());
        return Ok(());
    };
    retention::enforce(
        db.client().as_ref(),
        &position,
        &RetentionPolicy::from(config),
        now,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryClient, ReplicaClient};
    use crate::config::{BackendConfig, DbConfig};
    use crate::wal::WalBuilder;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir, name: &str) -> DbConfig {
        DbConfig::new(
            dir.path().join(name),
            BackendConfig::File {
                path: dir.path().join("replica").join(name),
            },
        )
        .with_sync_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_open_rejects_duplicate_databases() {
        let dir = TempDir::new().unwrap();
        let config = ReplicateConfig::default()
            .with_db(file_config(&dir, "a.db"))
            .with_db(file_config(&dir, "a.db"));
        assert!(matches!(
            Store::open(config).await,
            Err(ReplicaError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_fails_when_any_database_fails() {
        let dir = TempDir::new().unwrap();
        let unreachable = DbConfig::new(
            dir.path().join("b.db"),
            BackendConfig::Sftp {
                host: "127.0.0.1:1".to_string(),
                user: "backup".to_string(),
                password: Some("secret".to_string()),
                key_path: None,
                path: "/backups".to_string(),
            },
        );
        let config = ReplicateConfig::default()
            .with_retry(RetryPolicy::none())
            .with_db(file_config(&dir, "a.db"))
            .with_db(unreachable);
        assert!(Store::open(config).await.is_err());
    }

    #[tokio::test]
    async fn test_replicates_and_closes() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a.db"), b"").await.unwrap();
        let mut wal = WalBuilder::new(512, 1, 2);
        wal.commit_page(1, 1, 0xaa);
        tokio::fs::write(dir.path().join("a.db-wal"), wal.bytes())
            .await
            .unwrap();

        let config = ReplicateConfig::default().with_db(file_config(&dir, "a.db"));
        let store = Store::open(config).await.unwrap();

        let mut replicated = false;
        for _ in 0..200 {
            if store.statuses()[0]
                .position
                .as_ref()
                .is_some_and(|p| p.index == 1)
            {
                replicated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replicated);

        let status = &store.statuses()[0];
        assert_eq!(status.kind, "file");
        assert!(status.last_error.is_none());

        wal.commit_page(2, 2, 0xbb);
        tokio::fs::write(dir.path().join("a.db-wal"), wal.bytes())
            .await
            .unwrap();
        let db = Arc::clone(&store.dbs()[0]);
        store.close().await.unwrap();
        assert_eq!(db.position().unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_maintain_snapshots_and_compacts() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a.db"), b"").await.unwrap();
        let client = Arc::new(MemoryClient::new());
        let db_config = file_config(&dir, "a.db").with_sync_interval(Duration::from_secs(3600));
        let db = Db::with_client(db_config.clone(), client.clone(), RetryPolicy::none())
            .await
            .unwrap();

        let mut wal = WalBuilder::new(512, 1, 2);
        db.sync().await.unwrap();
        for fill in 1..=3u8 {
            wal.commit_page(1, 1, fill);
            tokio::fs::write(dir.path().join("a.db-wal"), wal.bytes())
                .await
                .unwrap();
            db.sync().await.unwrap();
        }

        let config = ReplicateConfig::default()
            .with_snapshot(SnapshotConfig {
                interval: Duration::from_secs(60),
                ..SnapshotConfig::default()
            })
            .with_db(db_config);
        let store = Store::start(config, vec![db]);
        let generation = store.dbs()[0].position().unwrap().generation;

        store
            .maintain(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();

        let snapshots = client.list_snapshots(&generation).await.unwrap();
        assert!(snapshots.iter().any(|s| s.index == 3));
        let segments = client.list_segments(&generation).await.unwrap();
        assert!(segments.iter().any(|s| s.level > 0 && s.max_index == 2));
        store.close().await.unwrap();
    }
}
