//! Generation, snapshot and segment model
//!
//! A generation is one unbroken lineage: a snapshot of the database file
//! followed by an ordered run of WAL segments. Every segment carries a CRC-32
//! continued from the checksum of the segment before it, so reordering, gaps
//! and silent corruption are caught before any byte is applied.
//!
//! Object metadata is encoded in the object name so that listing a backend
//! is enough to plan a restore:
//!
//! ```text
//! generations/<gen>/snapshots/<index>-<created>-<page size>-<size>-<crc>-<chain>.snapshot.zst
//! generations/<gen>/wal/<level>/<min>-<max>-<offset>-<size>-<created>-<page size>-<crc>.wal.zst
//! ```
//!
//! Nothing in here performs I/O.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReplicaError, Result};

const SNAPSHOT_SUFFIX: &str = ".snapshot.zst";
const SEGMENT_SUFFIX: &str = ".wal.zst";

/// Opaque generation identifier (16 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GenerationId(String);

impl GenerationId {
    pub fn random() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 16 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_string()))
        } else {
            Err(ReplicaError::InvalidName(format!("generation id {s:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GenerationId {
    type Error = ReplicaError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<GenerationId> for String {
    fn from(id: GenerationId) -> Self {
        id.0
    }
}

/// How much of a database's WAL has been durably shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub generation: GenerationId,
    /// Index of the next segment; every index below it is confirmed.
    pub index: u64,
    /// WAL byte offset shipped through
    pub offset: u64,
}

impl Position {
    /// Index of the last confirmed segment, if any.
    pub fn last_index(&self) -> Option<u64> {
        self.index.checked_sub(1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:016x}@{}", self.generation, self.index, self.offset)
    }
}

/// Continue the segment checksum chain over `payload`.
pub fn chain_checksum(seed: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum of a snapshot's content.
pub fn content_checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn millis(ts: &DateTime<Utc>) -> u64 {
    u64::try_from(ts.timestamp_millis()).unwrap_or(0)
}

fn from_millis(ms: u64) -> Result<DateTime<Utc>> {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| ReplicaError::InvalidName(format!("timestamp {ms:x}")))
}

fn hex_fields<const N: usize>(stem: &str, name: &str) -> Result<[u64; N]> {
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() != N {
        return Err(ReplicaError::InvalidName(name.to_string()));
    }
    let mut out = [0u64; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u64::from_str_radix(part, 16)
            .map_err(|_| ReplicaError::InvalidName(name.to_string()))?;
    }
    Ok(out)
}

fn narrow(value: u64, name: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| ReplicaError::InvalidName(name.to_string()))
}

/// Full copy of the database at the start of segment `index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub generation: GenerationId,
    /// Segment index this snapshot precedes
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub page_size: u32,
    /// Uncompressed size in bytes
    pub size: u64,
    /// CRC-32 of the uncompressed content
    pub checksum: u32,
    /// Chain value at `index`, seeding the checksum of segment `index`
    pub chain: u32,
}

impl SnapshotInfo {
    pub fn object_name(&self) -> String {
        format!(
            "{:016x}-{:016x}-{:08x}-{:016x}-{:08x}-{:08x}{SNAPSHOT_SUFFIX}",
            self.index,
            millis(&self.created_at),
            self.page_size,
            self.size,
            self.checksum,
            self.chain
        )
    }

    pub fn parse_name(generation: &GenerationId, name: &str) -> Result<Self> {
        let stem = name
            .strip_suffix(SNAPSHOT_SUFFIX)
            .ok_or_else(|| ReplicaError::InvalidName(name.to_string()))?;
        let [index, created, page_size, size, checksum, chain] = hex_fields::<6>(stem, name)?;
        Ok(Self {
            generation: generation.clone(),
            index,
            created_at: from_millis(created)?,
            page_size: narrow(page_size, name)?,
            size,
            checksum: narrow(checksum, name)?,
            chain: narrow(chain, name)?,
        })
    }
}

/// A run of WAL frames covering segment indices `min_index..=max_index`.
///
/// Level 0 units are shipped by the capture loop and cover a single index.
/// Higher levels are produced by compaction and subsume a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub generation: GenerationId,
    pub level: u8,
    pub min_index: u64,
    pub max_index: u64,
    /// WAL offset of the first frame
    pub offset: u64,
    /// Uncompressed payload size
    pub size: u64,
    /// Newest data time contained in the unit
    pub created_at: DateTime<Utc>,
    /// Page size of the WAL the frames were cut from
    pub page_size: u32,
    /// Chained checksum through `max_index`
    pub checksum: u32,
}

impl SegmentInfo {
    pub fn object_name(&self) -> String {
        format!(
            "{:016x}-{:016x}-{:016x}-{:016x}-{:016x}-{:08x}-{:08x}{SEGMENT_SUFFIX}",
            self.min_index,
            self.max_index,
            self.offset,
            self.size,
            millis(&self.created_at),
            self.page_size,
            self.checksum
        )
    }

    pub fn parse_name(generation: &GenerationId, level: u8, name: &str) -> Result<Self> {
        let stem = name
            .strip_suffix(SEGMENT_SUFFIX)
            .ok_or_else(|| ReplicaError::InvalidName(name.to_string()))?;
        let [min_index, max_index, offset, size, created, page_size, checksum] =
            hex_fields::<7>(stem, name)?;
        if max_index < min_index || page_size == 0 {
            return Err(ReplicaError::InvalidName(name.to_string()));
        }
        Ok(Self {
            generation: generation.clone(),
            level,
            min_index,
            max_index,
            offset,
            size,
            created_at: from_millis(created)?,
            page_size: narrow(page_size, name)?,
            checksum: narrow(checksum, name)?,
        })
    }

    /// Whether this unit subsumes every index of `other`.
    pub fn covers(&self, other: &SegmentInfo) -> bool {
        self.min_index <= other.min_index && other.max_index <= self.max_index
    }
}

/// Sort snapshots oldest first.
pub fn sort_snapshots(snapshots: &mut [SnapshotInfo]) {
    snapshots.sort_by(|a, b| (a.index, a.created_at).cmp(&(b.index, b.created_at)));
}

/// Sort segments by index, lower levels first for equal starting index.
pub fn sort_segments(segments: &mut [SegmentInfo]) {
    segments.sort_by(|a, b| {
        (a.min_index, a.level, a.max_index).cmp(&(b.min_index, b.level, b.max_index))
    });
}

/// First point at which a chain failed to verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Segment index at which verification failed
    pub index: u64,
    pub reason: String,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index {}: {}", self.index, self.reason)
    }
}

/// Verify a contiguous run of units starting at `start` and seeded with `seed`.
///
/// Returns the chain value after the last unit, or the first break.
pub fn verify_chain(
    seed: u32,
    start: u64,
    units: &[(&SegmentInfo, &[u8])],
) -> std::result::Result<u32, ChainBreak> {
    let mut chain = seed;
    let mut next = start;

    for (info, payload) in units {
        if info.min_index != next {
            return Err(ChainBreak {
                index: next,
                reason: format!(
                    "expected segment {next}, found range {}..={}",
                    info.min_index, info.max_index
                ),
            });
        }
        if payload.len() as u64 != info.size {
            return Err(ChainBreak {
                index: info.min_index,
                reason: format!("size {} does not match recorded {}", payload.len(), info.size),
            });
        }
        let actual = chain_checksum(chain, payload);
        if actual != info.checksum {
            return Err(ChainBreak {
                index: info.min_index,
                reason: format!("checksum {actual:08x} does not match recorded {:08x}", info.checksum),
            });
        }
        chain = actual;
        next = info.max_index + 1;
    }

    Ok(chain)
}

/// Chain value that seeds the unit starting at `index`, if it can be derived
/// from what is known about the generation.
pub fn chain_seed(index: u64, snapshots: &[SnapshotInfo], segments: &[SegmentInfo]) -> Option<u32> {
    if index == 0 {
        return Some(0);
    }
    segments
        .iter()
        .find(|s| s.max_index + 1 == index)
        .map(|s| s.checksum)
        .or_else(|| {
            snapshots
                .iter()
                .find(|s| s.index == index)
                .map(|s| s.chain)
        })
}

/// Point in a generation to restore to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestoreTarget {
    /// Everything in the newest generation
    #[default]
    Latest,
    /// State as of a wall-clock time
    Timestamp(DateTime<Utc>),
    /// Through segment `index` (inclusive) of a specific generation
    Index {
        generation: GenerationId,
        index: u64,
    },
}

/// Time span covered by one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSummary {
    pub id: GenerationId,
    /// Creation time of its oldest snapshot
    pub created_at: Option<DateTime<Utc>>,
    /// Newest object time in the generation
    pub updated_at: Option<DateTime<Utc>>,
}

impl GenerationSummary {
    pub fn from_listing(
        id: GenerationId,
        snapshots: &[SnapshotInfo],
        segments: &[SegmentInfo],
    ) -> Self {
        let created_at = snapshots.iter().map(|s| s.created_at).min();
        let updated_at = snapshots
            .iter()
            .map(|s| s.created_at)
            .chain(segments.iter().map(|s| s.created_at))
            .max();
        Self {
            id,
            created_at,
            updated_at,
        }
    }
}

/// Pick the generation that holds `target`. Generations without a snapshot
/// are never chosen.
pub fn select_generation<'a>(
    summaries: &'a [GenerationSummary],
    target: &RestoreTarget,
) -> Option<&'a GenerationSummary> {
    let mut restorable = summaries.iter().filter(|s| s.created_at.is_some());
    match target {
        RestoreTarget::Latest => restorable.max_by_key(|s| (s.updated_at, s.created_at)),
        RestoreTarget::Timestamp(ts) => restorable
            .filter(|s| s.created_at.is_some_and(|c| c <= *ts))
            .max_by_key(|s| s.created_at),
        RestoreTarget::Index { generation, .. } => restorable.find(|s| &s.id == generation),
    }
}

/// Snapshot plus the ordered units to apply on top of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub snapshot: SnapshotInfo,
    pub units: Vec<SegmentInfo>,
    /// Last index the target asks for, if it lies beyond the snapshot
    pub wanted: Option<u64>,
    /// Set when the units stop short of `wanted`
    pub gap: Option<ChainBreak>,
}

impl RestorePlan {
    /// Index after the last planned unit.
    pub fn end_index(&self) -> u64 {
        self.units
            .last()
            .map_or(self.snapshot.index, |u| u.max_index + 1)
    }
}

/// Compute the snapshot and units needed to reach `target` within one
/// generation. At each step the highest-level unit starting at the next
/// index is preferred so that compacted history is read in as few objects
/// as possible.
pub fn plan_restore(
    snapshots: &[SnapshotInfo],
    segments: &[SegmentInfo],
    target: &RestoreTarget,
) -> Result<RestorePlan> {
    let generation = snapshots
        .first()
        .map(|s| s.generation.clone())
        .ok_or(ReplicaError::NoGeneration)?;

    let snapshot = match target {
        RestoreTarget::Latest => snapshots.iter().max_by_key(|s| (s.index, s.created_at)),
        RestoreTarget::Timestamp(ts) => snapshots
            .iter()
            .filter(|s| s.created_at <= *ts)
            .max_by_key(|s| (s.index, s.created_at)),
        RestoreTarget::Index { index, .. } => snapshots
            .iter()
            .filter(|s| s.index <= index + 1)
            .max_by_key(|s| (s.index, s.created_at)),
    }
    .cloned()
    .ok_or_else(|| ReplicaError::NoSnapshot(generation.clone()))?;

    let eligible = |unit: &SegmentInfo| match target {
        RestoreTarget::Latest => true,
        RestoreTarget::Timestamp(ts) => unit.created_at <= *ts,
        RestoreTarget::Index { index, .. } => unit.max_index <= *index,
    };

    let wanted = segments
        .iter()
        .filter(|u| u.max_index >= snapshot.index && eligible(u))
        .map(|u| u.max_index)
        .max();
    let wanted = match target {
        RestoreTarget::Index { index, .. } if *index >= snapshot.index => Some(*index),
        RestoreTarget::Index { .. } => None,
        _ => wanted,
    };

    let mut units = Vec::new();
    let mut next = snapshot.index;
    while let Some(unit) = segments
        .iter()
        .filter(|u| u.min_index == next && eligible(u))
        .max_by_key(|u| (u.level, u.max_index))
    {
        next = unit.max_index + 1;
        units.push(unit.clone());
    }

    let gap = match wanted {
        Some(w) if next <= w => Some(ChainBreak {
            index: next,
            reason: format!("no segment starts at index {next}"),
        }),
        _ => None,
    };

    Ok(RestorePlan {
        snapshot,
        units,
        wanted,
        gap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation() -> GenerationId {
        GenerationId::parse("00000000000000aa").unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// Build level 0 segments over `payloads` and return them with their bytes.
    fn chain(payloads: &[&[u8]]) -> Vec<SegmentInfo> {
        let mut prev = 0;
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                prev = chain_checksum(prev, p);
                SegmentInfo {
                    generation: generation(),
                    level: 0,
                    min_index: i as u64,
                    max_index: i as u64,
                    offset: 32 + i as u64 * 100,
                    size: p.len() as u64,
                    created_at: ts(i as i64 * 10),
                    page_size: 4096,
                    checksum: prev,
                }
            })
            .collect()
    }

    fn snapshot(index: u64, at: i64) -> SnapshotInfo {
        SnapshotInfo {
            generation: generation(),
            index,
            created_at: ts(at),
            page_size: 4096,
            size: 0,
            checksum: content_checksum(&[]),
            chain: 0,
        }
    }

    #[test]
    fn test_generation_id() {
        let id = GenerationId::random();
        assert_eq!(id.as_str().len(), 16);
        assert_eq!(GenerationId::parse(id.as_str()).unwrap(), id);
        assert!(GenerationId::parse("XYZ").is_err());
        assert!(GenerationId::parse("00000000000000AA").is_err());
    }

    #[test]
    fn test_object_names_parse_back() {
        let snap = SnapshotInfo {
            chain: 0xdead_beef,
            size: 8192,
            ..snapshot(7, 5)
        };
        let name = snap.object_name();
        assert!(name.ends_with(".snapshot.zst"));
        assert_eq!(SnapshotInfo::parse_name(&generation(), &name).unwrap(), snap);

        let seg = chain(&[b"abc", b"def"]).pop().unwrap();
        let name = seg.object_name();
        assert_eq!(SegmentInfo::parse_name(&generation(), 0, &name).unwrap(), seg);
        assert!(SegmentInfo::parse_name(&generation(), 0, "junk.wal.zst").is_err());
        let no_page_size = SegmentInfo {
            page_size: 0,
            ..seg.clone()
        };
        assert!(SegmentInfo::parse_name(&generation(), 0, &no_page_size.object_name()).is_err());
        assert!(SegmentInfo::parse_name(&generation(), 0, &name.replace(".wal", "")).is_err());
    }

    #[test]
    fn test_chain_verifies_in_order() {
        let payloads: [&[u8]; 3] = [b"one", b"two", b"three"];
        let segs = chain(&payloads);
        let units: Vec<_> = segs.iter().zip(payloads).collect();
        assert_eq!(verify_chain(0, 0, &units).unwrap(), segs[2].checksum);
    }

    #[test]
    fn test_chain_detects_reorder_and_corruption() {
        let payloads: [&[u8]; 3] = [b"one", b"two", b"three"];
        let segs = chain(&payloads);

        let swapped = vec![(&segs[0], payloads[0]), (&segs[2], payloads[2])];
        assert_eq!(verify_chain(0, 0, &swapped).unwrap_err().index, 1);

        let corrupt = vec![
            (&segs[0], payloads[0]),
            (&segs[1], b"tw0".as_slice()),
            (&segs[2], payloads[2]),
        ];
        assert_eq!(verify_chain(0, 0, &corrupt).unwrap_err().index, 1);
    }

    #[test]
    fn test_merged_unit_preserves_chain() {
        let payloads: [&[u8]; 3] = [b"one", b"two", b"three"];
        let segs = chain(&payloads);
        let merged_payload = payloads.concat();
        let merged = SegmentInfo {
            level: 1,
            min_index: 0,
            max_index: 2,
            size: merged_payload.len() as u64,
            checksum: chain_checksum(0, &merged_payload),
            ..segs[0].clone()
        };
        assert_eq!(merged.checksum, segs[2].checksum);

        let individual: Vec<_> = segs.iter().zip(payloads).collect();
        assert_eq!(
            verify_chain(0, 0, &[(&merged, merged_payload.as_slice())]),
            verify_chain(0, 0, &individual)
        );
    }

    #[test]
    fn test_chain_seed_lookup() {
        let segs = chain(&[b"a", b"b"]);
        let snaps = vec![SnapshotInfo {
            chain: 0x1234,
            ..snapshot(5, 0)
        }];
        assert_eq!(chain_seed(0, &snaps, &segs), Some(0));
        assert_eq!(chain_seed(2, &snaps, &segs), Some(segs[1].checksum));
        assert_eq!(chain_seed(5, &snaps, &segs), Some(0x1234));
        assert_eq!(chain_seed(9, &snaps, &segs), None);
    }

    #[test]
    fn test_plan_prefers_compacted_units() {
        let mut segs = chain(&[b"a", b"b", b"c", b"d"]);
        segs.push(SegmentInfo {
            level: 1,
            min_index: 0,
            max_index: 2,
            created_at: ts(20),
            checksum: segs[2].checksum,
            ..segs[0].clone()
        });
        let plan = plan_restore(&[snapshot(0, 0)], &segs, &RestoreTarget::Latest).unwrap();
        let ranges: Vec<_> = plan.units.iter().map(|u| (u.level, u.min_index, u.max_index)).collect();
        assert_eq!(ranges, vec![(1, 0, 2), (0, 3, 3)]);
        assert_eq!(plan.end_index(), 4);
        assert!(plan.gap.is_none());
    }

    #[test]
    fn test_plan_by_timestamp_falls_back_to_fine_units() {
        let mut segs = chain(&[b"a", b"b", b"c"]);
        segs.push(SegmentInfo {
            level: 1,
            min_index: 0,
            max_index: 2,
            created_at: ts(20),
            checksum: segs[2].checksum,
            ..segs[0].clone()
        });
        let plan = plan_restore(&[snapshot(0, 0)], &segs, &RestoreTarget::Timestamp(ts(12))).unwrap();
        let ranges: Vec<_> = plan.units.iter().map(|u| (u.level, u.min_index)).collect();
        assert_eq!(ranges, vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn test_plan_by_index_picks_nearest_snapshot() {
        let segs = chain(&[b"a", b"b", b"c", b"d"]);
        let snaps = vec![snapshot(0, 0), snapshot(2, 25)];
        let target = RestoreTarget::Index {
            generation: generation(),
            index: 3,
        };
        let plan = plan_restore(&snaps, &segs, &target).unwrap();
        assert_eq!(plan.snapshot.index, 2);
        assert_eq!(plan.units.len(), 2);

        let early = RestoreTarget::Index {
            generation: generation(),
            index: 0,
        };
        let plan = plan_restore(&snaps, &segs, &early).unwrap();
        assert_eq!(plan.snapshot.index, 0);
        assert_eq!(plan.units.len(), 1);
    }

    #[test]
    fn test_plan_reports_gap() {
        let mut segs = chain(&[b"a", b"b", b"c"]);
        segs.remove(1);
        let plan = plan_restore(&[snapshot(0, 0)], &segs, &RestoreTarget::Latest).unwrap();
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.gap.unwrap().index, 1);
    }

    #[test]
    fn test_plan_without_snapshot_fails() {
        let segs = chain(&[b"a"]);
        let err = plan_restore(&[snapshot(0, 50)], &segs, &RestoreTarget::Timestamp(ts(10)));
        assert!(matches!(err, Err(ReplicaError::NoSnapshot(_))));
    }

    #[test]
    fn test_select_generation() {
        let g = |id: &str, created: Option<i64>, updated: i64| GenerationSummary {
            id: GenerationId::parse(id).unwrap(),
            created_at: created.map(ts),
            updated_at: Some(ts(updated)),
        };
        let summaries = vec![
            g("0000000000000001", Some(0), 50),
            g("0000000000000002", Some(60), 90),
            g("0000000000000003", None, 100),
        ];
        let latest = select_generation(&summaries, &RestoreTarget::Latest).unwrap();
        assert_eq!(latest.id.as_str(), "0000000000000002");
        let at = select_generation(&summaries, &RestoreTarget::Timestamp(ts(30))).unwrap();
        assert_eq!(at.id.as_str(), "0000000000000001");
        assert!(select_generation(&summaries, &RestoreTarget::Timestamp(ts(-5))).is_none());

        let by_id = |id: &str| RestoreTarget::Index {
            generation: GenerationId::parse(id).unwrap(),
            index: 0,
        };
        let picked = select_generation(&summaries, &by_id("0000000000000001")).unwrap();
        assert_eq!(picked.id.as_str(), "0000000000000001");
        assert!(select_generation(&summaries, &by_id("0000000000000003")).is_none());
    }
}
