//! Change capture for one database
//!
//! Each [`Db`] polls its database's WAL, cuts newly committed frames into a
//! level 0 segment and ships it to the replica. Indices within a generation
//! are shipped strictly in order; the local [`Position`] only advances once
//! the backend has confirmed the write and is persisted to
//! `<meta>/position.json` so a restart resumes without gaps.
//!
//! When continuity with the shipped history can no longer be proven (the WAL
//! was restarted with new salts, shrank below the shipped offset, or the
//! database changed behind an absent WAL) the loop moves through
//! [`CapturePhase::DiscontinuityDetected`] to
//! [`CapturePhase::NewGenerationInit`], snapshots the database into a fresh
//! generation and carries on from the start of the current WAL.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{open_client, ReplicaClient};
use crate::config::DbConfig;
use crate::error::{ReplicaError, Result};
use crate::generation::{
    chain_checksum, content_checksum, GenerationId, Position, RestoreTarget, SegmentInfo,
    SnapshotInfo,
};
use crate::restore;
use crate::retry::{with_retry, RetryPolicy};
use crate::wal::{scan_committed, wal_path, WalHeader, WAL_HEADER_SIZE};

/// Name of the persisted position file inside the meta directory
pub const STATE_FILE: &str = "position.json";

const DEFAULT_PAGE_SIZE: u32 = 4096;
const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// Where the capture loop is in its discontinuity handling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    /// Shipping frames in the current generation
    Steady,
    /// Continuity was lost; the current generation is being closed
    DiscontinuityDetected,
    /// Waiting to snapshot the database into a new generation
    #[default]
    NewGenerationInit,
}

/// Why a new generation was needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discontinuity {
    /// No local position exists yet
    NoPosition,
    /// The replica no longer holds the recorded generation
    GenerationMissing,
    /// The WAL was restarted
    SaltChanged {
        previous: (u32, u32),
        current: (u32, u32),
    },
    /// The WAL is shorter than what was already shipped
    WalShrank { len: u64, offset: u64 },
    /// Frames before the shipped offset no longer verify
    WalRewritten { offset: u64 },
    /// The database changed while it had no WAL
    DatabaseChanged,
}

impl fmt::Display for Discontinuity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPosition => write!(f, "no local position"),
            Self::GenerationMissing => write!(f, "generation missing from replica"),
            Self::SaltChanged { previous, current } => write!(
                f,
                "wal salt changed from {:08x}/{:08x} to {:08x}/{:08x}",
                previous.0, previous.1, current.0, current.1
            ),
            Self::WalShrank { len, offset } => {
                write!(f, "wal shrank to {len} bytes, below shipped offset {offset}")
            }
            Self::WalRewritten { offset } => write!(f, "wal rewritten before offset {offset}"),
            Self::DatabaseChanged => write!(f, "database changed without a wal"),
        }
    }
}

/// Snapshot of a database's replication state
#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    pub path: PathBuf,
    /// Backend kind ("file", "s3", ...)
    pub kind: &'static str,
    pub location: String,
    pub position: Option<Position>,
    pub phase: CapturePhase,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Replication state persisted between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LocalState {
    position: Position,
    /// Chain value of the last confirmed segment
    chain: u32,
    /// WAL salts of the generation; unset when it began without a WAL
    salts: Option<(u32, u32)>,
    page_size: u32,
    /// Checksum of the database image the generation started from
    db_checksum: u32,
}

/// Running WAL checksum at a frame boundary
#[derive(Debug, Clone, Copy)]
struct Cursor {
    offset: u64,
    checksum: (u32, u32),
}

/// A segment whose write has not been confirmed yet
#[derive(Debug, Clone)]
struct Pending {
    info: SegmentInfo,
    payload: Vec<u8>,
    cursor: Cursor,
}

struct Capture {
    phase: CapturePhase,
    reason: Option<Discontinuity>,
    local: Option<LocalState>,
    cursor: Option<Cursor>,
    pending: Option<Pending>,
}

impl Capture {
    fn detect(&mut self, reason: Discontinuity) {
        self.phase = CapturePhase::DiscontinuityDetected;
        self.reason = Some(reason);
        self.cursor = None;
    }
}

enum Step {
    Done(Option<SegmentInfo>),
    Reset(Discontinuity),
}

/// One replicated database
pub struct Db {
    config: DbConfig,
    wal_path: PathBuf,
    meta_path: PathBuf,
    client: Arc<dyn ReplicaClient>,
    retry: RetryPolicy,
    capture: Mutex<Capture>,
    status: RwLock<DbStatus>,
}

impl Db {
    /// Connect to the configured backend and recover local state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached to discover
    /// existing generations or the meta directory cannot be created.
    pub async fn open(config: DbConfig, retry: RetryPolicy) -> Result<Self> {
        let client = open_client(&config.replica, config.compression_level).await?;
        Self::with_client(config, client, retry).await
    }

    /// Like [`open`](Self::open) with an already constructed client.
    pub async fn with_client(
        config: DbConfig,
        client: Arc<dyn ReplicaClient>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let meta_path = config.meta_path();
        tokio::fs::create_dir_all(&meta_path).await?;

        let generations =
            with_retry(&retry, "list generations", || client.list_generations()).await?;

        let mut capture = Capture {
            phase: CapturePhase::NewGenerationInit,
            reason: Some(Discontinuity::NoPosition),
            local: None,
            cursor: None,
            pending: None,
        };

        if let Some(mut local) = load_state(&meta_path).await? {
            let generation = local.position.generation.clone();
            let snapshots = if generations.contains(&generation) {
                with_retry(&retry, "list snapshots", || client.list_snapshots(&generation))
                    .await?
            } else {
                Vec::new()
            };

            if snapshots.is_empty() {
                warn!(
                    "Generation {} of {} is not on the replica, starting a new one",
                    generation,
                    config.path.display()
                );
                capture.reason = Some(Discontinuity::GenerationMissing);
            } else {
                let segments =
                    with_retry(&retry, "list segments", || client.list_segments(&generation))
                        .await?;
                let adopted = reconcile(&mut local, &segments);
                if adopted > 0 {
                    info!(
                        "Adopted {} segment(s) already on the replica for {}, resuming at {}",
                        adopted,
                        config.path.display(),
                        local.position
                    );
                    save_state(&meta_path, &local).await?;
                }
                capture.phase = CapturePhase::Steady;
                capture.reason = None;
                capture.local = Some(local);
            }
        }

        let status = DbStatus {
            path: config.path.clone(),
            kind: client.kind(),
            location: client.location(),
            position: capture.local.as_ref().map(|l| l.position.clone()),
            phase: capture.phase,
            last_sync: None,
            last_error: None,
        };
        debug!(
            "Opened {} in phase {:?} ({} generation(s) on replica)",
            config.path.display(),
            capture.phase,
            generations.len()
        );

        Ok(Self {
            wal_path: wal_path(&config.path),
            meta_path,
            config,
            client,
            retry,
            capture: Mutex::new(capture),
            status: RwLock::new(status),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ReplicaClient> {
        &self.client
    }

    pub fn status(&self) -> DbStatus {
        self.status.read().clone()
    }

    /// Last confirmed position.
    pub fn position(&self) -> Option<Position> {
        self.status.read().position.clone()
    }

    /// Run one capture cycle, returning the segment shipped, if any.
    ///
    /// # Errors
    ///
    /// Backend failures that outlast the retry budget are returned; the
    /// unconfirmed segment is kept and re-shipped unchanged next cycle.
    pub async fn sync(&self) -> Result<Option<SegmentInfo>> {
        let mut capture = self.capture.lock().await;
        let result = self.sync_locked(&mut capture).await;
        self.record(&capture, result.as_ref().err());
        result
    }

    /// Ship whatever is outstanding before shutdown.
    ///
    /// Nothing is written for a database that never reached a generation.
    pub async fn close(&self) -> Result<()> {
        let mut capture = self.capture.lock().await;
        if capture.phase != CapturePhase::Steady {
            return Ok(());
        }

        let had_pending = capture.pending.is_some();
        let mut result = self.sync_locked(&mut capture).await;
        if had_pending && result.is_ok() {
            result = self.sync_locked(&mut capture).await;
        }
        self.record(&capture, result.as_ref().err());

        if let Some(local) = &capture.local {
            info!("Closed {} at {}", self.config.path.display(), local.position);
        }
        result.map(|_| ())
    }

    /// Capture loop: sync every `sync_interval` until `shutdown` fires or a
    /// non-transient error stops replication of this database.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => match self.sync().await {
                    Ok(Some(info)) => trace!("Shipped segment {} of generation {}", info.min_index, info.generation),
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        warn!("Sync of {} failed, retrying next cycle: {}", self.config.path.display(), e);
                    }
                    Err(e) => {
                        error!("Replication of {} stopped: {}", self.config.path.display(), e);
                        break;
                    }
                },
            }
        }
        debug!("Capture loop for {} exited", self.config.path.display());
    }

    /// Write a new snapshot at the confirmed position when the newest one is
    /// older than `interval` and segments have been shipped since.
    ///
    /// The image is rebuilt from the replica itself, so it matches exactly
    /// what a restore to the same index would produce.
    pub async fn snapshot_if_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<SnapshotInfo>> {
        let Some(local) = self.capture.lock().await.local.clone() else {
            return Ok(None);
        };
        let position = local.position;
        let Some(last_index) = position.last_index() else {
            return Ok(None);
        };

        let snapshots = self.client.list_snapshots(&position.generation).await?;
        let Some(latest) = snapshots.iter().max_by_key(|s| (s.index, s.created_at)) else {
            return Ok(None);
        };
        let interval = chrono::Duration::from_std(interval)
            .map_err(|e| ReplicaError::Config(format!("snapshot interval: {e}")))?;
        if latest.index >= position.index || now - latest.created_at < interval {
            return Ok(None);
        }

        let target = RestoreTarget::Index {
            generation: position.generation.clone(),
            index: last_index,
        };
        let plan = restore::plan(self.client.as_ref(), &position.generation, &target).await?;
        let replay = restore::replay(self.client.as_ref(), &plan).await?;
        if let Some(broken) = replay.broken {
            return Err(ReplicaError::ChainBroken(broken));
        }
        if replay.position.index != position.index || replay.chain != local.chain {
            return Err(ReplicaError::InvalidState(format!(
                "replay of {} reached {} with chain {:08x}, expected {} with chain {:08x}",
                self.config.path.display(),
                replay.position,
                replay.chain,
                position,
                local.chain
            )));
        }

        let info = SnapshotInfo {
            generation: position.generation.clone(),
            index: position.index,
            created_at: now,
            page_size: local.page_size,
            size: replay.image.len() as u64,
            checksum: content_checksum(&replay.image),
            chain: replay.chain,
        };
        with_retry(&self.retry, "write snapshot", || {
            self.client.write_snapshot(&info, &replay.image)
        })
        .await?;
        info!(
            "Snapshot of {} written at {} ({} bytes)",
            self.config.path.display(),
            position,
            info.size
        );
        Ok(Some(info))
    }

    fn record(&self, capture: &Capture, error: Option<&ReplicaError>) {
        let mut status = self.status.write();
        status.phase = capture.phase;
        status.position = capture.local.as_ref().map(|l| l.position.clone());
        match error {
            None => {
                status.last_sync = Some(Utc::now());
                status.last_error = None;
            }
            Some(e) => status.last_error = Some(e.to_string()),
        }
    }

    async fn sync_locked(&self, capture: &mut Capture) -> Result<Option<SegmentInfo>> {
        if let Some(pending) = capture.pending.take() {
            return self.ship(capture, pending).await.map(Some);
        }

        // A second reset in one cycle means the WAL is changing under us;
        // try again next cycle rather than spin.
        let mut resets = 0;
        loop {
            match capture.phase {
                CapturePhase::DiscontinuityDetected => {
                    let reason = capture.reason.clone().unwrap_or(Discontinuity::NoPosition);
                    match &capture.local {
                        Some(local) => info!(
                            "Closing generation {} of {} at {}: {}",
                            local.position.generation,
                            self.config.path.display(),
                            local.position,
                            reason
                        ),
                        None => debug!("No generation for {}: {}", self.config.path.display(), reason),
                    }
                    capture.phase = CapturePhase::NewGenerationInit;
                }
                CapturePhase::NewGenerationInit => {
                    if !self.start_generation(capture).await? {
                        return Ok(None);
                    }
                }
                CapturePhase::Steady => match self.capture_frames(capture).await? {
                    Step::Done(shipped) => return Ok(shipped),
                    Step::Reset(reason) => {
                        capture.detect(reason);
                        resets += 1;
                        if resets > 1 {
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }

    /// Snapshot the database into a new generation. Returns `false` when the
    /// database does not exist yet or changed while being read.
    async fn start_generation(&self, capture: &mut Capture) -> Result<bool> {
        let before = read_wal_header(&self.wal_path).await?;
        let db = match tokio::fs::read(&self.config.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Database {} does not exist yet", self.config.path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let after = read_wal_header(&self.wal_path).await?;
        if before.map(|h| h.salts()) != after.map(|h| h.salts()) {
            debug!(
                "WAL of {} restarted while reading the database, retrying",
                self.config.path.display()
            );
            return Ok(false);
        }

        let page_size = after
            .map(|h| h.page_size() as u32)
            .or_else(|| db_page_size(&db))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let generation = GenerationId::random();
        let snapshot = SnapshotInfo {
            generation: generation.clone(),
            index: 0,
            created_at: Utc::now(),
            page_size,
            size: db.len() as u64,
            checksum: content_checksum(&db),
            chain: 0,
        };
        with_retry(&self.retry, "write snapshot", || {
            self.client.write_snapshot(&snapshot, &db)
        })
        .await?;

        let local = LocalState {
            position: Position {
                generation: generation.clone(),
                index: 0,
                offset: WAL_HEADER_SIZE as u64,
            },
            chain: 0,
            salts: after.map(|h| h.salts()),
            page_size,
            db_checksum: snapshot.checksum,
        };
        save_state(&self.meta_path, &local).await?;

        info!(
            "Started generation {} for {} ({}), snapshot {} bytes",
            generation,
            self.config.path.display(),
            capture
                .reason
                .as_ref()
                .map_or_else(|| "new".to_string(), ToString::to_string),
            db.len()
        );
        capture.local = Some(local);
        capture.cursor = None;
        capture.reason = None;
        capture.phase = CapturePhase::Steady;
        Ok(true)
    }

    /// Cut committed frames past the shipped offset into the next segment.
    async fn capture_frames(&self, capture: &mut Capture) -> Result<Step> {
        let Some(mut local) = capture.local.clone() else {
            return Ok(Step::Reset(Discontinuity::NoPosition));
        };

        let wal = match tokio::fs::read(&self.wal_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Step::Done(None)),
            Err(e) => return Err(e.into()),
        };
        if wal.len() < WAL_HEADER_SIZE {
            return Ok(Step::Done(None));
        }
        let header = match WalHeader::parse(&wal) {
            Ok(header) => header,
            Err(e) => {
                debug!("WAL of {} not readable yet: {}", self.config.path.display(), e);
                return Ok(Step::Done(None));
            }
        };

        match local.salts {
            Some(previous) if previous != header.salts() => {
                return Ok(Step::Reset(Discontinuity::SaltChanged {
                    previous,
                    current: header.salts(),
                }));
            }
            Some(_) => {}
            None => {
                // The generation began without a WAL; the new WAL continues it
                // only if the database is still the snapshotted image.
                let db = tokio::fs::read(&self.config.path).await?;
                if content_checksum(&db) != local.db_checksum {
                    return Ok(Step::Reset(Discontinuity::DatabaseChanged));
                }
                local.salts = Some(header.salts());
                local.page_size = header.page_size() as u32;
                save_state(&self.meta_path, &local).await?;
                capture.local = Some(local.clone());
                debug!(
                    "WAL of {} appeared, continuing generation {}",
                    self.config.path.display(),
                    local.position.generation
                );
            }
        }

        let offset = local.position.offset;
        if (wal.len() as u64) < offset {
            return Ok(Step::Reset(Discontinuity::WalShrank {
                len: wal.len() as u64,
                offset,
            }));
        }
        let start = usize::try_from(offset)
            .ok()
            .filter(|o| *o >= WAL_HEADER_SIZE)
            .ok_or_else(|| ReplicaError::InvalidState(format!("bad wal offset {offset}")))?;

        let seed = match capture.cursor {
            Some(cursor) if cursor.offset == offset => cursor.checksum,
            _ => {
                let prefix = scan_committed(&header, &wal[WAL_HEADER_SIZE..start], header.checksum());
                if prefix.committed_len != start - WAL_HEADER_SIZE {
                    return Ok(Step::Reset(Discontinuity::WalRewritten { offset }));
                }
                prefix.checksum
            }
        };

        let scan = scan_committed(&header, &wal[start..], seed);
        if scan.committed_len == 0 {
            return Ok(Step::Done(None));
        }

        let payload = wal[start..start + scan.committed_len].to_vec();
        let info = SegmentInfo {
            generation: local.position.generation.clone(),
            level: 0,
            min_index: local.position.index,
            max_index: local.position.index,
            offset,
            size: payload.len() as u64,
            created_at: Utc::now(),
            page_size: header.page_size() as u32,
            checksum: chain_checksum(local.chain, &payload),
        };
        let pending = Pending {
            info,
            payload,
            cursor: Cursor {
                offset: offset + scan.committed_len as u64,
                checksum: scan.checksum,
            },
        };
        trace!(
            "Captured {} frame(s) in {} commit(s) from {}",
            scan.frames,
            scan.commits,
            self.wal_path.display()
        );
        self.ship(capture, pending).await.map(|info| Step::Done(Some(info)))
    }

    /// Write `pending` and advance the position once confirmed.
    async fn ship(&self, capture: &mut Capture, pending: Pending) -> Result<SegmentInfo> {
        let written = with_retry(&self.retry, "write segment", || {
            self.client.write_segment(&pending.info, &pending.payload)
        })
        .await;
        if let Err(e) = written {
            warn!(
                "Segment {} of {} not confirmed: {}",
                pending.info.min_index,
                self.config.path.display(),
                e
            );
            if e.is_transient() {
                capture.pending = Some(pending);
            }
            return Err(e);
        }

        let local = capture
            .local
            .as_mut()
            .ok_or_else(|| ReplicaError::InvalidState("shipped without a position".into()))?;
        local.position.index = pending.info.max_index + 1;
        local.position.offset = pending.cursor.offset;
        local.chain = pending.info.checksum;
        capture.cursor = Some(pending.cursor);
        save_state(&self.meta_path, local).await?;

        debug!(
            "Shipped segment {} of {} ({} bytes), now at {}",
            pending.info.min_index,
            self.config.path.display(),
            pending.info.size,
            local.position
        );
        Ok(pending.info)
    }
}

/// Advance `local` past level 0 segments that reached the replica but were
/// never recorded locally. Returns how many were adopted.
fn reconcile(local: &mut LocalState, segments: &[SegmentInfo]) -> usize {
    let mut adopted = 0;
    while let Some(unit) = segments.iter().find(|s| {
        s.level == 0 && s.min_index == local.position.index && s.offset == local.position.offset
    }) {
        local.position.index = unit.max_index + 1;
        local.position.offset = unit.offset + unit.size;
        local.chain = unit.checksum;
        adopted += 1;
    }
    adopted
}

async fn read_wal_header(path: &Path) -> Result<Option<WalHeader>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = [0u8; WAL_HEADER_SIZE];
    match file.read_exact(&mut buf).await {
        Ok(_) => Ok(WalHeader::parse(&buf).ok()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Page size recorded in a database file header.
fn db_page_size(db: &[u8]) -> Option<u32> {
    if db.len() < 100 || !db.starts_with(SQLITE_HEADER) {
        return None;
    }
    match u16::from_be_bytes([db[16], db[17]]) {
        1 => Some(65536),
        n => Some(u32::from(n)),
    }
}

async fn load_state(meta_path: &Path) -> Result<Option<LocalState>> {
    let path = meta_path.join(STATE_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

async fn save_state(meta_path: &Path, state: &LocalState) -> Result<()> {
    let path = meta_path.join(STATE_FILE);
    let tmp = meta_path.join(format!("{STATE_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(state)?;
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryClient;
    use crate::config::BackendConfig;
    use crate::wal::{WalBuilder, FRAME_HEADER_SIZE};
    use tempfile::TempDir;

    const PAGE: u32 = 512;

    struct Fixture {
        dir: TempDir,
        client: Arc<MemoryClient>,
        wal: WalBuilder,
        pages: u32,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            tokio::fs::write(dir.path().join("app.db"), b"").await.unwrap();
            Self {
                dir,
                client: Arc::new(MemoryClient::new()),
                wal: WalBuilder::new(PAGE, 0x1111, 0x2222),
                pages: 0,
            }
        }

        fn config(&self) -> DbConfig {
            DbConfig::new(
                self.dir.path().join("app.db"),
                BackendConfig::File {
                    path: self.dir.path().join("replica"),
                },
            )
        }

        async fn open(&self, retry: RetryPolicy) -> Db {
            Db::with_client(self.config(), self.client.clone(), retry)
                .await
                .unwrap()
        }

        async fn commit(&mut self, pgno: u32, fill: u8) {
            self.pages = self.pages.max(pgno);
            self.wal.commit_page(pgno, self.pages, fill);
            tokio::fs::write(self.dir.path().join("app.db-wal"), self.wal.bytes())
                .await
                .unwrap();
        }

        /// Simulate a checkpoint that restarts the WAL with new salts.
        async fn restart_wal(&mut self, salt1: u32) {
            self.wal = WalBuilder::new(PAGE, salt1, 0x2222);
            tokio::fs::write(self.dir.path().join("app.db-wal"), self.wal.bytes())
                .await
                .unwrap();
        }

        async fn level0(&self, generation: &GenerationId) -> Vec<u64> {
            self.client
                .list_segments(generation)
                .await
                .unwrap()
                .iter()
                .filter(|s| s.level == 0)
                .map(|s| s.min_index)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_indices_are_contiguous_from_zero() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        assert_eq!(db.status().phase, CapturePhase::NewGenerationInit);

        // Empty database, no WAL yet: only the generation and snapshot.
        assert!(db.sync().await.unwrap().is_none());
        let generation = db.position().unwrap().generation;
        let snapshots = fx.client.list_snapshots(&generation).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].size, 0);

        for (pgno, fill) in [(1, 0xa1), (2, 0xb2), (1, 0xc3)] {
            fx.commit(pgno, fill).await;
            let shipped = db.sync().await.unwrap().unwrap();
            assert_eq!(shipped.page_size, PAGE);
        }
        assert!(db.sync().await.unwrap().is_none());

        assert_eq!(fx.level0(&generation).await, vec![0, 1, 2]);
        let status = db.status();
        assert_eq!(status.phase, CapturePhase::Steady);
        assert_eq!(status.kind, "memory");
        assert_eq!(status.position.unwrap().index, 3);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_salt_change_starts_new_generation() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        fx.commit(1, 1).await;
        fx.commit(2, 2).await;
        db.sync().await.unwrap();
        let first = db.position().unwrap();
        assert_eq!(first.index, 1);

        tokio::fs::write(fx.dir.path().join("app.db"), vec![7u8; 1024])
            .await
            .unwrap();
        fx.restart_wal(0x9999).await;
        fx.commit(1, 3).await;
        let shipped = db.sync().await.unwrap().unwrap();

        let second = db.position().unwrap();
        assert_ne!(second.generation, first.generation);
        assert_eq!(shipped.generation, second.generation);
        assert_eq!(shipped.min_index, 0);
        assert_eq!(shipped.offset, WAL_HEADER_SIZE as u64);

        let snapshots = fx.client.list_snapshots(&second.generation).await.unwrap();
        assert_eq!(snapshots[0].size, 1024);
        assert_eq!(fx.level0(&first.generation).await, vec![0]);

        fx.commit(2, 4).await;
        db.sync().await.unwrap();
        assert_eq!(fx.level0(&first.generation).await, vec![0]);
        assert_eq!(fx.level0(&second.generation).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_truncated_wal_is_a_discontinuity() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        fx.commit(1, 1).await;
        fx.commit(1, 2).await;
        db.sync().await.unwrap();
        let first = db.position().unwrap().generation;

        let shortened = fx.wal.bytes()[..WAL_HEADER_SIZE + FRAME_HEADER_SIZE + PAGE as usize].to_vec();
        tokio::fs::write(fx.dir.path().join("app.db-wal"), shortened)
            .await
            .unwrap();
        db.sync().await.unwrap();
        assert_ne!(db.position().unwrap().generation, first);
    }

    #[tokio::test]
    async fn test_failed_write_reships_identical_segment() {
        let mut fx = Fixture::new().await;
        let retry = RetryPolicy::exponential(3, Duration::from_millis(1));
        let db = fx.open(retry).await;
        db.sync().await.unwrap();
        for i in 0..5u8 {
            fx.commit(1, i).await;
            db.sync().await.unwrap();
        }
        let before = db.position().unwrap();
        assert_eq!(before.last_index(), Some(4));

        fx.commit(2, 0x55).await;
        fx.client.fail_next_writes(4);
        assert!(db.sync().await.is_err());
        assert_eq!(db.position().unwrap(), before);
        assert!(db.status().last_error.is_some());

        // More frames arrive before the next cycle; they go into index 6.
        fx.commit(3, 0x66).await;
        let reshipped = db.sync().await.unwrap().unwrap();
        assert_eq!(reshipped.min_index, 5);
        assert_eq!(reshipped.offset, before.offset);
        assert_eq!(reshipped.size, (FRAME_HEADER_SIZE + PAGE as usize) as u64);

        let next = db.sync().await.unwrap().unwrap();
        assert_eq!(next.min_index, 6);
        assert_eq!(next.offset, before.offset + reshipped.size);

        // The backend accepts an identical rewrite and rejects a different one.
        let payload = fx.client.read_segment(&reshipped).await.unwrap();
        fx.client.write_segment(&reshipped, &payload).await.unwrap();
        let conflicting = SegmentInfo {
            checksum: reshipped.checksum ^ 1,
            ..reshipped.clone()
        };
        assert!(matches!(
            fx.client.write_segment(&conflicting, &payload).await,
            Err(ReplicaError::SegmentConflict { index: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_resumes_and_adopts_unrecorded_segments() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        fx.commit(1, 1).await;
        db.sync().await.unwrap();
        let state_path = fx.config().meta_path().join(STATE_FILE);
        let stale = tokio::fs::read(&state_path).await.unwrap();

        fx.commit(2, 2).await;
        db.sync().await.unwrap();
        let shipped = db.position().unwrap();
        drop(db);

        // Crash between confirmation and persisting the position.
        tokio::fs::write(&state_path, stale).await.unwrap();

        let db = fx.open(RetryPolicy::none()).await;
        assert_eq!(db.status().phase, CapturePhase::Steady);
        assert_eq!(db.position().unwrap(), shipped);

        fx.commit(3, 3).await;
        let next = db.sync().await.unwrap().unwrap();
        assert_eq!(next.generation, shipped.generation);
        assert_eq!(next.min_index, 2);
    }

    #[tokio::test]
    async fn test_generation_missing_on_replica() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        fx.commit(1, 1).await;
        db.sync().await.unwrap();
        drop(db);

        fx.client = Arc::new(MemoryClient::new());
        let db = fx.open(RetryPolicy::none()).await;
        assert_eq!(db.status().phase, CapturePhase::NewGenerationInit);
        db.sync().await.unwrap();
        assert_eq!(db.status().phase, CapturePhase::Steady);
    }

    #[tokio::test]
    async fn test_database_changed_without_wal() {
        let fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        let first = db.position().unwrap().generation;

        tokio::fs::write(fx.dir.path().join("app.db"), vec![1u8; 512])
            .await
            .unwrap();
        let mut wal = WalBuilder::new(PAGE, 5, 6);
        wal.commit_page(2, 2, 9);
        tokio::fs::write(fx.dir.path().join("app.db-wal"), wal.bytes())
            .await
            .unwrap();
        db.sync().await.unwrap();
        assert_ne!(db.position().unwrap().generation, first);
    }

    #[tokio::test]
    async fn test_snapshot_if_due() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        assert!(db
            .snapshot_if_due(Duration::ZERO, Utc::now())
            .await
            .unwrap()
            .is_none());

        db.sync().await.unwrap();
        for (pgno, fill) in [(1, 0xa1), (2, 0xb2), (1, 0xc3)] {
            fx.commit(pgno, fill).await;
            db.sync().await.unwrap();
        }

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(db
            .snapshot_if_due(Duration::from_secs(3600), later)
            .await
            .unwrap()
            .is_none());

        let info = db
            .snapshot_if_due(Duration::ZERO, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.index, 3);
        assert_eq!(info.page_size, PAGE);
        let first = fx.client.list_snapshots(&info.generation).await.unwrap();
        assert_eq!(first[0].page_size, DEFAULT_PAGE_SIZE);
        let mut expected = vec![0xc3u8; 512];
        expected.extend(vec![0xb2u8; 512]);
        assert_eq!(fx.client.read_snapshot(&info).await.unwrap(), expected);
        assert_eq!(info.chain, db.capture.lock().await.local.as_ref().unwrap().chain);

        assert!(db
            .snapshot_if_due(Duration::ZERO, later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_close_flushes_outstanding_frames() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        fx.commit(1, 1).await;
        db.close().await.unwrap();
        assert_eq!(db.position().unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_close_after_wal_restart_ships_new_generation() {
        let mut fx = Fixture::new().await;
        let db = fx.open(RetryPolicy::none()).await;
        db.sync().await.unwrap();
        fx.commit(1, 1).await;
        db.sync().await.unwrap();
        let first = db.position().unwrap().generation;

        tokio::fs::write(fx.dir.path().join("app.db"), vec![1u8; 512])
            .await
            .unwrap();
        fx.restart_wal(0x4242).await;
        fx.commit(2, 2).await;
        db.close().await.unwrap();

        let position = db.position().unwrap();
        assert_ne!(position.generation, first);
        assert_eq!(position.index, 1);
        assert_eq!(fx.level0(&position.generation).await, vec![0]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut fx = Fixture::new().await;
        fx.commit(1, 1).await;
        let config = fx.config().with_sync_interval(Duration::from_millis(10));
        let db = Arc::new(
            Db::with_client(config, fx.client.clone(), RetryPolicy::none())
                .await
                .unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&db).run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(db.position().unwrap().index, 1);
    }

    #[test]
    fn test_db_page_size() {
        let mut header = vec![0u8; 100];
        header[..16].copy_from_slice(SQLITE_HEADER);
        header[16..18].copy_from_slice(&4096u16.to_be_bytes());
        assert_eq!(db_page_size(&header), Some(4096));
        header[16..18].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(db_page_size(&header), Some(65536));
        assert_eq!(db_page_size(b"not a database"), None);
    }
}
