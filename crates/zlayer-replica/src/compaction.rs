//! Segment compaction
//!
//! Level N merges runs of level N-1 units into one unit covering the same
//! index range. Merging is plain concatenation: a unit's checksum continues
//! the CRC chain from its predecessor, so the merged checksum equals that of
//! the last source and the chain stays verifiable at any level.
//!
//! Compaction only writes. Sources become deletable by the retention pass
//! once a higher level covers them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::ReplicaClient;
use crate::error::{ReplicaError, Result};
use crate::generation::{chain_seed, verify_chain, Position, SegmentInfo};
use crate::retry::{with_retry, RetryPolicy};

/// A compaction tier above the raw segment stream (level 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionLevel {
    pub level: u8,
    /// Units of the level below older than this are merged
    pub interval: Duration,
}

/// Select the run of level `level - 1` units to merge next.
///
/// The run starts right after the highest index already covered at
/// `level`, is contiguous, and ends before the first unit that is too young,
/// not yet confirmed (`max_index >= limit`) or cut from a WAL with a
/// different page size.
pub fn select_run(
    segments: &[SegmentInfo],
    level: u8,
    cutoff: DateTime<Utc>,
    limit: u64,
) -> Vec<SegmentInfo> {
    let Some(source) = level.checked_sub(1) else {
        return Vec::new();
    };
    let covered = segments
        .iter()
        .filter(|s| s.level == level)
        .map(|s| s.max_index)
        .max();

    let mut candidates: Vec<&SegmentInfo> = segments
        .iter()
        .filter(|s| s.level == source && covered.map_or(true, |c| s.min_index > c))
        .collect();
    candidates.sort_by_key(|s| s.min_index);

    let mut run: Vec<SegmentInfo> = Vec::new();
    for unit in candidates {
        if let Some(last) = run.last() {
            if unit.min_index != last.max_index + 1 || unit.page_size != last.page_size {
                break;
            }
        } else if covered.is_some_and(|c| unit.min_index != c + 1) {
            // Something between the covered range and this unit is missing.
            break;
        }
        if unit.created_at > cutoff || unit.max_index >= limit {
            break;
        }
        run.push(unit.clone());
    }
    run
}

/// Merge the next eligible run in `position`'s generation into `level`.
///
/// Returns the written unit, or `None` when nothing is due. Units at or
/// past `position.index` are never touched.
pub async fn compact(
    client: &dyn ReplicaClient,
    position: &Position,
    level: &CompactionLevel,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Option<SegmentInfo>> {
    let generation = &position.generation;
    let segments = client.list_segments(generation).await?;
    let interval = chrono::Duration::from_std(level.interval)
        .map_err(|e| ReplicaError::Config(format!("compaction interval: {e}")))?;

    let run = select_run(&segments, level.level, now - interval, position.index);
    let (Some(first), Some(last)) = (run.first(), run.last()) else {
        return Ok(None);
    };

    let snapshots = client.list_snapshots(generation).await?;
    let Some(seed) = chain_seed(first.min_index, &snapshots, &segments) else {
        warn!(
            "Cannot compact generation {} from index {}: preceding chain value unknown",
            generation, first.min_index
        );
        return Ok(None);
    };

    let mut payloads = Vec::with_capacity(run.len());
    for unit in &run {
        payloads.push(client.read_segment(unit).await?);
    }
    let units: Vec<(&SegmentInfo, &[u8])> = run
        .iter()
        .zip(&payloads)
        .map(|(info, payload)| (info, payload.as_slice()))
        .collect();
    let checksum = verify_chain(seed, first.min_index, &units).map_err(ReplicaError::ChainBroken)?;

    let merged: Vec<u8> = payloads.concat();
    let info = SegmentInfo {
        generation: generation.clone(),
        level: level.level,
        min_index: first.min_index,
        max_index: last.max_index,
        offset: first.offset,
        size: merged.len() as u64,
        created_at: run.iter().map(|u| u.created_at).max().unwrap_or(now),
        page_size: first.page_size,
        checksum,
    };

    with_retry(retry, "write compacted segment", || {
        client.write_segment(&info, &merged)
    })
    .await?;

    info!(
        "Compacted {} level {} unit(s) of generation {} into level {} segment {}..={}",
        run.len(),
        level.level - 1,
        generation,
        level.level,
        info.min_index,
        info.max_index
    );
    Ok(Some(info))
}

/// Compact every level in order, so a single pass can promote a unit
/// through several tiers.
pub async fn compact_all(
    client: &dyn ReplicaClient,
    position: &Position,
    levels: &[CompactionLevel],
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<SegmentInfo>> {
    let mut written = Vec::new();
    for level in levels {
        if let Some(info) = compact(client, position, level, retry, now).await? {
            written.push(info);
        }
    }
    debug!(
        "Compaction pass over generation {} wrote {} unit(s)",
        position.generation,
        written.len()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryClient;
    use crate::generation::{chain_checksum, GenerationId};

    fn generation() -> GenerationId {
        GenerationId::parse("00000000c0ffee00").unwrap()
    }

    fn position(index: u64) -> Position {
        Position {
            generation: generation(),
            index,
            offset: 0,
        }
    }

    fn levels() -> Vec<CompactionLevel> {
        vec![
            CompactionLevel {
                level: 1,
                interval: Duration::from_secs(30),
            },
            CompactionLevel {
                level: 2,
                interval: Duration::from_secs(300),
            },
        ]
    }

    /// Write `count` level 0 segments, each `age_secs` old.
    async fn seed(client: &MemoryClient, count: u64, age_secs: i64) -> Vec<SegmentInfo> {
        let mut chain = 0;
        let mut out = Vec::new();
        for i in 0..count {
            let payload = vec![i as u8 + 1; 16];
            chain = chain_checksum(chain, &payload);
            let info = SegmentInfo {
                generation: generation(),
                level: 0,
                min_index: i,
                max_index: i,
                offset: 32 + i * 16,
                size: 16,
                created_at: Utc::now() - chrono::Duration::seconds(age_secs),
                page_size: 4096,
                checksum: chain,
            };
            client.write_segment(&info, &payload).await.unwrap();
            out.push(info);
        }
        out
    }

    #[tokio::test]
    async fn test_merge_preserves_chain() {
        let client = MemoryClient::new();
        let sources = seed(&client, 3, 60).await;

        let merged = compact(&client, &position(3), &levels()[0], &RetryPolicy::none(), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((merged.min_index, merged.max_index), (0, 2));
        assert_eq!(merged.checksum, sources[2].checksum);
        assert_eq!(merged.size, 48);
        assert_eq!(merged.offset, 32);

        let payload = client.read_segment(&merged).await.unwrap();
        let source_payloads: Vec<Vec<u8>> = [1u8, 2, 3].iter().map(|b| vec![*b; 16]).collect();
        let individual: Vec<(&SegmentInfo, &[u8])> = sources
            .iter()
            .zip(&source_payloads)
            .map(|(s, p)| (s, p.as_slice()))
            .collect();
        assert_eq!(
            verify_chain(0, 0, &[(&merged, payload.as_slice())]),
            verify_chain(0, 0, &individual)
        );
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let client = MemoryClient::new();
        seed(&client, 4, 60).await;
        let policy = RetryPolicy::none();

        assert!(compact(&client, &position(4), &levels()[0], &policy, Utc::now())
            .await
            .unwrap()
            .is_some());
        let writes = client.write_count();
        assert!(compact(&client, &position(4), &levels()[0], &policy, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert_eq!(client.write_count(), writes);
    }

    #[tokio::test]
    async fn test_young_and_unconfirmed_units_wait() {
        let client = MemoryClient::new();
        seed(&client, 3, 5).await;
        let policy = RetryPolicy::none();
        assert!(compact(&client, &position(3), &levels()[0], &policy, Utc::now())
            .await
            .unwrap()
            .is_none());

        let client = MemoryClient::new();
        seed(&client, 3, 60).await;
        let merged = compact(&client, &position(2), &levels()[0], &policy, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.max_index, 1);
    }

    #[tokio::test]
    async fn test_compact_all_promotes_through_levels() {
        let client = MemoryClient::new();
        seed(&client, 3, 600).await;
        let written = compact_all(
            &client,
            &position(3),
            &levels(),
            &RetryPolicy::none(),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].level, 2);
        assert_eq!((written[1].min_index, written[1].max_index), (0, 2));
    }

    #[tokio::test]
    async fn test_corrupt_source_is_not_merged() {
        let client = MemoryClient::new();
        let sources = seed(&client, 3, 60).await;
        client.tamper_segment(&sources[1], &[0u8; 16]).unwrap();

        let err = compact(&client, &position(3), &levels()[0], &RetryPolicy::none(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::ChainBroken(ref b) if b.index == 1));
        let segments = client.list_segments(&generation()).await.unwrap();
        assert!(segments.iter().all(|s| s.level == 0));
    }

    #[test]
    fn test_select_run_stops_at_gap() {
        let mut segments: Vec<SegmentInfo> = (0..5u64)
            .filter(|i| *i != 3)
            .map(|i| SegmentInfo {
                generation: generation(),
                level: 0,
                min_index: i,
                max_index: i,
                offset: 0,
                size: 1,
                created_at: Utc::now() - chrono::Duration::seconds(100),
                page_size: 4096,
                checksum: 0,
            })
            .collect();
        let run = select_run(&segments, 1, Utc::now(), 10);
        assert_eq!(run.len(), 3);

        segments.push(SegmentInfo {
            level: 1,
            max_index: 2,
            ..segments[0].clone()
        });
        // Index 3 is missing, so nothing after the covered range can be merged.
        assert!(select_run(&segments, 1, Utc::now(), 10).is_empty());
    }

    #[test]
    fn test_select_run_keeps_one_page_size() {
        let segments: Vec<SegmentInfo> = (0..4u64)
            .map(|i| SegmentInfo {
                generation: generation(),
                level: 0,
                min_index: i,
                max_index: i,
                offset: 0,
                size: 1,
                created_at: Utc::now() - chrono::Duration::seconds(100),
                page_size: if i < 2 { 512 } else { 4096 },
                checksum: 0,
            })
            .collect();
        let run = select_run(&segments, 1, Utc::now(), 10);
        assert_eq!(run.iter().map(|u| u.max_index).collect::<Vec<_>>(), vec![0, 1]);
        assert!(run.iter().all(|u| u.page_size == 512));
    }
}
