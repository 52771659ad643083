//! Rebuild a database file from its replica
//!
//! Restore picks a generation and snapshot for the requested target, then
//! replays verified segments on top of the snapshot image in index order.
//! Frames are applied page by page: each frame overwrites its page and a
//! commit frame sets the database size. Verification stops at the first
//! broken link in the checksum chain; nothing past it is ever applied.
//!
//! The same replay builds mid-generation snapshots (see
//! [`crate::db::Db::snapshot_if_due`]).

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::backend::ReplicaClient;
use crate::error::{ReplicaError, Result};
use crate::generation::{
    plan_restore, select_generation, verify_chain, ChainBreak, GenerationId, GenerationSummary,
    Position, RestorePlan, RestoreTarget, SegmentInfo, SnapshotInfo,
};
use crate::wal::{self, WAL_HEADER_SIZE};

/// What to restore and where
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Destination database file
    pub output: PathBuf,
    pub target: RestoreTarget,
    /// Replace an existing file at `output`
    pub overwrite: bool,
}

impl RestoreOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            target: RestoreTarget::Latest,
            overwrite: false,
        }
    }

    pub fn with_target(mut self, target: RestoreTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Result of a completed restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Replica position the restored file corresponds to
    pub position: Position,
    pub snapshot: SnapshotInfo,
    /// Units replayed on top of the snapshot
    pub applied: Vec<SegmentInfo>,
    /// Size of the restored database in bytes
    pub size: u64,
}

/// Database image rebuilt in memory
#[derive(Debug, Clone)]
pub(crate) struct Replay {
    pub image: Vec<u8>,
    pub position: Position,
    /// Chain value after the last applied unit
    pub chain: u32,
    pub applied: Vec<SegmentInfo>,
    /// First point that could not be verified, if replay stopped early
    pub broken: Option<ChainBreak>,
}

/// Apply the frames of one unit to a database image.
pub(crate) fn apply_frames(image: &mut Vec<u8>, payload: &[u8], page_size: usize) -> Result<()> {
    for frame in wal::frames(payload, page_size) {
        let (header, page) = frame?;
        if header.pgno == 0 {
            return Err(ReplicaError::WalParse("frame for page 0".to_string()));
        }
        let start = (header.pgno as usize - 1) * page_size;
        if image.len() < start + page_size {
            image.resize(start + page_size, 0);
        }
        image[start..start + page_size].copy_from_slice(page);
        if header.is_commit() {
            image.resize(header.db_size as usize * page_size, 0);
        }
    }
    Ok(())
}

/// Read the planned snapshot and replay verified units until the plan ends
/// or the chain breaks.
pub(crate) async fn replay(client: &dyn ReplicaClient, plan: &RestorePlan) -> Result<Replay> {
    let snapshot = &plan.snapshot;
    let mut image = client.read_snapshot(snapshot).await?;

    let mut chain = snapshot.chain;
    let mut next = snapshot.index;
    let mut offset = WAL_HEADER_SIZE as u64;
    let mut applied = Vec::new();
    let mut broken = None;

    for unit in &plan.units {
        let payload = match client.read_segment(unit).await {
            Ok(payload) => payload,
            Err(ReplicaError::NotFound(key)) => {
                broken = Some(ChainBreak {
                    index: unit.min_index,
                    reason: format!("segment object {key} is missing"),
                });
                break;
            }
            Err(e) => return Err(e),
        };
        match verify_chain(chain, next, &[(unit, payload.as_slice())]) {
            Ok(value) => chain = value,
            Err(b) => {
                broken = Some(b);
                break;
            }
        }
        if let Err(e) = apply_frames(&mut image, &payload, unit.page_size as usize) {
            broken = Some(ChainBreak {
                index: unit.min_index,
                reason: e.to_string(),
            });
            break;
        }
        debug!(
            "Applied level {} segment {}..={} ({} bytes)",
            unit.level, unit.min_index, unit.max_index, unit.size
        );
        next = unit.max_index + 1;
        offset = unit.offset + unit.size;
        applied.push(unit.clone());
    }

    if broken.is_none() {
        broken = plan.gap.clone();
    }

    Ok(Replay {
        image,
        position: Position {
            generation: snapshot.generation.clone(),
            index: next,
            offset,
        },
        chain,
        applied,
        broken,
    })
}

/// Summaries of every generation on the replica.
pub async fn generation_summaries(client: &dyn ReplicaClient) -> Result<Vec<GenerationSummary>> {
    let mut summaries = Vec::new();
    for id in client.list_generations().await? {
        let snapshots = client.list_snapshots(&id).await?;
        let segments = client.list_segments(&id).await?;
        summaries.push(GenerationSummary::from_listing(id, &snapshots, &segments));
    }
    Ok(summaries)
}

/// Plan a restore of `target` in `generation`.
pub async fn plan(
    client: &dyn ReplicaClient,
    generation: &GenerationId,
    target: &RestoreTarget,
) -> Result<RestorePlan> {
    let snapshots = client.list_snapshots(generation).await?;
    if snapshots.is_empty() {
        return Err(ReplicaError::NoSnapshot(generation.clone()));
    }
    let segments = client.list_segments(generation).await?;
    plan_restore(&snapshots, &segments, target)
}

/// Restore a database from `client` into `options.output`.
///
/// The file is written to a temporary name and renamed into place. When
/// the chain breaks before the target the file is still written, holding
/// the last verified state, and [`ReplicaError::RestoreIncomplete`] reports
/// how far it got.
pub async fn restore(client: &dyn ReplicaClient, options: &RestoreOptions) -> Result<RestoreOutcome> {
    if !options.overwrite && tokio::fs::try_exists(&options.output).await? {
        return Err(ReplicaError::InvalidState(format!(
            "{} already exists",
            options.output.display()
        )));
    }

    let summaries = generation_summaries(client).await?;
    if summaries.is_empty() {
        return Err(ReplicaError::NoGeneration);
    }
    let generation = match select_generation(&summaries, &options.target) {
        Some(summary) => summary.id.clone(),
        None => match &options.target {
            RestoreTarget::Index { generation, .. }
                if summaries.iter().any(|s| &s.id == generation) =>
            {
                return Err(ReplicaError::NoSnapshot(generation.clone()))
            }
            _ => return Err(ReplicaError::NoGeneration),
        },
    };

    let plan = plan(client, &generation, &options.target).await?;
    info!(
        "Restoring {} from {} generation {} snapshot {} with {} unit(s)",
        options.output.display(),
        client.kind(),
        generation,
        plan.snapshot.index,
        plan.units.len()
    );

    let replay = replay(client, &plan).await?;
    write_database(&options.output, &replay.image).await?;

    if let Some(broken) = replay.broken {
        warn!(
            "Restore of {} stopped at {}: {}",
            options.output.display(),
            replay.position,
            broken
        );
        return Err(ReplicaError::RestoreIncomplete {
            reached: replay.position,
            broken,
        });
    }

    info!(
        "Restored {} to {} ({} bytes)",
        options.output.display(),
        replay.position,
        replay.image.len()
    );
    Ok(RestoreOutcome {
        position: replay.position,
        snapshot: plan.snapshot,
        applied: replay.applied,
        size: replay.image.len() as u64,
    })
}

/// Write `image` as a standalone database at `path`, removing stale WAL
/// and shared-memory files that would otherwise be replayed over it.
async fn write_database(path: &Path, image: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp = path.with_file_name(format!(".{name}.restore.tmp"));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(image).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    for suffix in ["-wal", "-shm"] {
        let stale = path.with_file_name(format!("{name}{suffix}"));
        match tokio::fs::remove_file(&stale).await {
            Ok(()) => debug!("Removed stale {}", stale.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryClient;
    use crate::generation::{chain_checksum, content_checksum};
    use crate::wal::{WalBuilder, WAL_HEADER_SIZE};
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    const PAGE: u32 = 512;

    fn generation() -> GenerationId {
        GenerationId::parse("1111222233334444").unwrap()
    }

    /// Ship `wal` as one level 0 segment per commit, like the capture loop.
    async fn ship(client: &MemoryClient, db: &[u8], wal: &WalBuilder) -> Vec<SegmentInfo> {
        let snapshot = SnapshotInfo {
            generation: generation(),
            index: 0,
            created_at: Utc::now() - ChronoDuration::minutes(10),
            page_size: PAGE,
            size: db.len() as u64,
            checksum: content_checksum(db),
            chain: 0,
        };
        client.write_snapshot(&snapshot, db).await.unwrap();

        let frame = crate::wal::FRAME_HEADER_SIZE + PAGE as usize;
        let bytes = &wal.bytes()[WAL_HEADER_SIZE..];
        let mut chain = 0;
        let mut segments = Vec::new();
        for (i, payload) in bytes.chunks(frame).enumerate() {
            chain = chain_checksum(chain, payload);
            let info = SegmentInfo {
                generation: generation(),
                level: 0,
                min_index: i as u64,
                max_index: i as u64,
                offset: (WAL_HEADER_SIZE + i * frame) as u64,
                size: payload.len() as u64,
                created_at: Utc::now() - ChronoDuration::minutes(9 - i as i64),
                page_size: PAGE,
                checksum: chain,
            };
            client.write_segment(&info, payload).await.unwrap();
            segments.push(info);
        }
        segments
    }

    fn three_commits() -> WalBuilder {
        let mut wal = WalBuilder::new(PAGE, 7, 9);
        wal.commit_page(1, 1, 0xa1)
            .commit_page(2, 2, 0xb2)
            .commit_page(1, 2, 0xc3);
        wal
    }

    #[test]
    fn test_apply_frames_truncates_on_commit() {
        let mut wal = WalBuilder::new(PAGE, 1, 2);
        wal.frame(3, 0, &[9u8; 512]).frame(1, 1, &[4u8; 512]);
        let mut image = vec![0u8; 4 * 512];
        apply_frames(&mut image, &wal.bytes()[WAL_HEADER_SIZE..], 512).unwrap();
        assert_eq!(image, vec![4u8; 512]);
    }

    #[tokio::test]
    async fn test_restore_latest_matches_source() {
        let client = MemoryClient::new();
        ship(&client, &[], &three_commits()).await;

        let dir = TempDir::new().unwrap();
        let output = dir.path().join("restored.db");
        let outcome = restore(&client, &RestoreOptions::new(&output)).await.unwrap();

        let mut expected = vec![0xc3u8; 512];
        expected.extend(vec![0xb2u8; 512]);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), expected);
        assert_eq!(outcome.position.index, 3);
        assert_eq!(outcome.applied.len(), 3);
        assert_eq!(outcome.size, 1024);
    }

    #[tokio::test]
    async fn test_frames_replay_with_their_own_page_size() {
        let client = MemoryClient::new();
        ship(&client, &[], &three_commits()).await;

        // A generation that began before its WAL existed records the
        // default page size on its first snapshot.
        let first = client.list_snapshots(&generation()).await.unwrap().remove(0);
        client
            .delete_snapshot(&generation(), &first.object_name())
            .await
            .unwrap();
        let early = SnapshotInfo {
            page_size: 4096,
            ..first
        };
        client.write_snapshot(&early, &[]).await.unwrap();

        let dir = TempDir::new().unwrap();
        let output = dir.path().join("restored.db");
        let outcome = restore(&client, &RestoreOptions::new(&output)).await.unwrap();
        assert_eq!(outcome.position.index, 3);
        assert_eq!(outcome.snapshot.page_size, 4096);

        let mut expected = vec![0xc3u8; 512];
        expected.extend(vec![0xb2u8; 512]);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_restore_to_index() {
        let client = MemoryClient::new();
        ship(&client, &[], &three_commits()).await;

        let dir = TempDir::new().unwrap();
        let output = dir.path().join("restored.db");
        let options = RestoreOptions::new(&output).with_target(RestoreTarget::Index {
            generation: generation(),
            index: 0,
        });
        let outcome = restore(&client, &options).await.unwrap();
        assert_eq!(outcome.position.index, 1);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), vec![0xa1u8; 512]);
    }

    #[tokio::test]
    async fn test_partial_restore_reports_position() {
        let client = MemoryClient::new();
        let segments = ship(&client, &[], &three_commits()).await;
        client.tamper_segment(&segments[2], b"garbage").unwrap();

        let dir = TempDir::new().unwrap();
        let output = dir.path().join("restored.db");
        let err = restore(&client, &RestoreOptions::new(&output))
            .await
            .unwrap_err();
        match err {
            ReplicaError::RestoreIncomplete { reached, broken } => {
                assert_eq!(reached.index, 2);
                assert_eq!(broken.index, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        let mut expected = vec![0xa1u8; 512];
        expected.extend(vec![0xb2u8; 512]);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_refuses_to_overwrite() {
        let client = MemoryClient::new();
        ship(&client, &[], &three_commits()).await;

        let dir = TempDir::new().unwrap();
        let output = dir.path().join("restored.db");
        tokio::fs::write(&output, b"keep me").await.unwrap();
        tokio::fs::write(dir.path().join("restored.db-wal"), b"stale").await.unwrap();

        assert!(matches!(
            restore(&client, &RestoreOptions::new(&output)).await,
            Err(ReplicaError::InvalidState(_))
        ));
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"keep me");

        restore(&client, &RestoreOptions::new(&output).with_overwrite(true))
            .await
            .unwrap();
        assert!(!dir.path().join("restored.db-wal").exists());
    }

    #[tokio::test]
    async fn test_empty_replica() {
        let client = MemoryClient::new();
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            restore(&client, &RestoreOptions::new(dir.path().join("x.db"))).await,
            Err(ReplicaError::NoGeneration)
        ));
    }
}
