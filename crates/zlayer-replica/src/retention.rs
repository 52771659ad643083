//! Retention of snapshots, segments and generations
//!
//! A pass over one database's replica keeps:
//!
//! - every snapshot of the current generation created inside the retention
//!   window, the newest snapshot older than the window (the restore base for
//!   the start of the window) and the `retain_count` newest snapshots
//! - every segment at or after the oldest kept snapshot
//! - lower-level segments inside the window even when a higher level covers
//!   them, so point-in-time restore keeps its granularity
//! - lower-level segments unless a unit that is itself older than the
//!   window and starts at or after the oldest kept snapshot covers them
//! - for every surviving segment, the nearest snapshot at or before its
//!   first index
//!
//! Deletion runs oldest to newest: segments first, then the snapshots they
//! depended on. Nothing at or past the capture loop's confirmed index is
//! touched, and no generation started after the current one is pruned.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::backend::ReplicaClient;
use crate::config::SnapshotConfig;
use crate::error::{ReplicaError, Result};
use crate::generation::{GenerationId, GenerationSummary, Position, SegmentInfo, SnapshotInfo};

/// How long and how much history to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention: Duration,
    /// Minimum number of snapshots kept in the current generation
    pub retain_count: usize,
    /// Cap on prior generations kept while still inside the window
    pub retain_generations: Option<usize>,
}

impl From<&SnapshotConfig> for RetentionPolicy {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            retention: config.retention,
            retain_count: config.retain_count,
            retain_generations: config.retain_generations,
        }
    }
}

/// What a retention pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub snapshots_deleted: usize,
    pub segments_deleted: usize,
    pub generations_deleted: Vec<GenerationId>,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.snapshots_deleted == 0
            && self.segments_deleted == 0
            && self.generations_deleted.is_empty()
    }
}

/// Snapshots of a generation that must be kept.
pub fn retained_snapshots<'a>(
    snapshots: &'a [SnapshotInfo],
    cutoff: DateTime<Utc>,
    retain_count: usize,
) -> Vec<&'a SnapshotInfo> {
    let mut ordered: Vec<&SnapshotInfo> = snapshots.iter().collect();
    ordered.sort_by_key(|s| (s.created_at, s.index));

    let mut keep: Vec<&SnapshotInfo> = ordered
        .iter()
        .copied()
        .filter(|s| s.created_at >= cutoff)
        .collect();
    if let Some(base) = ordered.iter().rev().copied().find(|s| s.created_at < cutoff) {
        keep.push(base);
    }
    for s in ordered.iter().rev().take(retain_count.max(1)) {
        if !keep.iter().any(|k| k.index == s.index && k.created_at == s.created_at) {
            keep.push(s);
        }
    }
    keep.sort_by_key(|s| (s.index, s.created_at));
    keep
}

/// Segments of the current generation that may be deleted, oldest first.
pub fn expendable_segments(
    segments: &[SegmentInfo],
    base_index: u64,
    cutoff: DateTime<Utc>,
    confirmed: u64,
) -> Vec<SegmentInfo> {
    let mut out: Vec<SegmentInfo> = segments
        .iter()
        .filter(|s| s.max_index < confirmed)
        .filter(|s| {
            if s.max_index < base_index {
                return true;
            }
            s.created_at < cutoff
                && segments
                    .iter()
                    .any(|h| {
                        h.level > s.level
                            && h.created_at < cutoff
                            && h.min_index >= base_index
                            && h.covers(s)
                    })
        })
        .cloned()
        .collect();
    out.sort_by_key(|s| (s.min_index, s.level));
    out
}

/// Run one retention pass for the database at `position`.
pub async fn enforce(
    client: &dyn ReplicaClient,
    position: &Position,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let retention = chrono::Duration::from_std(policy.retention)
        .map_err(|e| ReplicaError::Config(format!("retention: {e}")))?;
    let cutoff = now - retention;
    let mut report = RetentionReport::default();

    let current = &position.generation;
    let snapshots = client.list_snapshots(current).await?;
    if let Some(started) = snapshots.iter().map(|s| s.created_at).min() {
        enforce_current(client, position, &snapshots, policy, cutoff, &mut report).await?;
        prune_prior_generations(client, current, started, policy, cutoff, &mut report).await?;
    } else {
        debug!(
            "Generation {} has no snapshot yet, skipping retention",
            current
        );
    }

    if !report.is_empty() {
        info!(
            "Retention removed {} snapshot(s), {} segment(s) and {} generation(s) from {}",
            report.snapshots_deleted,
            report.segments_deleted,
            report.generations_deleted.len(),
            client.kind()
        );
    }
    Ok(report)
}

async fn enforce_current(
    client: &dyn ReplicaClient,
    position: &Position,
    snapshots: &[SnapshotInfo],
    policy: &RetentionPolicy,
    cutoff: DateTime<Utc>,
    report: &mut RetentionReport,
) -> Result<()> {
    let generation = &position.generation;
    let keep = retained_snapshots(snapshots, cutoff, policy.retain_count);
    let Some(base_index) = keep.iter().map(|s| s.index).min() else {
        return Ok(());
    };

    let segments = client.list_segments(generation).await?;
    let expendable = expendable_segments(&segments, base_index, cutoff, position.index);
    for unit in &expendable {
        client.delete_segment(unit).await?;
        report.segments_deleted += 1;
    }

    let mut kept: HashSet<String> = keep.iter().map(|s| s.object_name()).collect();
    for unit in segments.iter().filter(|s| !expendable.contains(s)) {
        if let Some(base) = snapshots
            .iter()
            .filter(|s| s.index <= unit.min_index)
            .max_by_key(|s| (s.index, s.created_at))
        {
            kept.insert(base.object_name());
        }
    }
    let mut doomed: Vec<&SnapshotInfo> = snapshots
        .iter()
        .filter(|s| !kept.contains(&s.object_name()) && s.index <= base_index)
        .collect();
    doomed.sort_by_key(|s| (s.index, s.created_at));
    for snapshot in doomed {
        debug!(
            "Deleting snapshot {} of generation {} created {}",
            snapshot.index, generation, snapshot.created_at
        );
        client
            .delete_snapshot(generation, &snapshot.object_name())
            .await?;
        report.snapshots_deleted += 1;
    }
    Ok(())
}

/// Delete generations started before `current` that are unrestorable,
/// wholly older than the window, or beyond the `retain_generations` cap.
///
/// A generation whose first snapshot is no older than `started` is left
/// alone: `current` may already have been superseded by it.
async fn prune_prior_generations(
    client: &dyn ReplicaClient,
    current: &GenerationId,
    started: DateTime<Utc>,
    policy: &RetentionPolicy,
    cutoff: DateTime<Utc>,
    report: &mut RetentionReport,
) -> Result<()> {
    let mut prior = Vec::new();
    for id in client.list_generations().await? {
        if &id == current {
            continue;
        }
        let snapshots = client.list_snapshots(&id).await?;
        let segments = client.list_segments(&id).await?;
        if snapshots.iter().map(|s| s.created_at).min() >= Some(started) {
            debug!("Keeping generation {}: not older than {}", id, current);
            continue;
        }
        prior.push((
            GenerationSummary::from_listing(id, &snapshots, &segments),
            snapshots,
            segments,
        ));
    }
    // Newest first, so the cap keeps the most recent lineages.
    prior.sort_by(|a, b| b.0.updated_at.cmp(&a.0.updated_at));

    let mut kept = 0;
    for (summary, snapshots, segments) in prior {
        let reason = if summary.created_at.is_none() {
            Some("has no snapshot")
        } else if summary.updated_at.is_some_and(|u| u < cutoff) {
            Some("is outside the retention window")
        } else if policy.retain_generations.is_some_and(|cap| kept >= cap) {
            Some("exceeds the generation cap")
        } else {
            kept += 1;
            None
        };
        let Some(reason) = reason else {
            continue;
        };

        info!("Deleting generation {}: {}", summary.id, reason);
        let mut segments = segments;
        segments.sort_by_key(|s| (s.min_index, s.level));
        for unit in &segments {
            client.delete_segment(unit).await?;
            report.segments_deleted += 1;
        }
        for snapshot in &snapshots {
            client
                .delete_snapshot(&summary.id, &snapshot.object_name())
                .await?;
            report.snapshots_deleted += 1;
        }
        report.generations_deleted.push(summary.id);
    }
    Ok(())
}
