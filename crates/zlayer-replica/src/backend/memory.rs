//! In-memory backend
//!
//! Keeps objects in a map using the same key layout as the real backends.
//! Supports injected write failures and object tampering so that retry,
//! conflict and chain-verification paths can be exercised in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{check_existing, compress, decompress, verify_snapshot, Layout, ReplicaClient};
use crate::error::{ReplicaError, Result};
use crate::generation::{sort_segments, sort_snapshots, GenerationId, SegmentInfo, SnapshotInfo};

/// Replica held in process memory
#[derive(Default)]
pub struct MemoryClient {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    layout: Layout,
    fail_writes: AtomicU32,
    writes: AtomicU64,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transient backend error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of objects stored by successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Overwrite the payload of a stored segment, bypassing all checks.
    pub fn tamper_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()> {
        let compressed = compress(data, 1)?;
        self.objects
            .lock()
            .insert(self.layout.segment_key(info), compressed);
        Ok(())
    }

    fn take_failure(&self) -> Result<()> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ReplicaError::backend("memory", "injected write failure"));
        }
        Ok(())
    }

    fn put(&self, key: String, data: &[u8]) -> Result<()> {
        self.take_failure()?;
        let compressed = compress(data, 1)?;
        self.objects.lock().insert(key, compressed);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let objects = self.objects.lock();
        let data = objects
            .get(key)
            .ok_or_else(|| ReplicaError::NotFound(key.to_string()))?;
        decompress(data)
    }

    /// Names directly under `dir` (the next path component of each key).
    fn children(&self, dir: &str) -> Vec<String> {
        let objects = self.objects.lock();
        let mut names: Vec<String> = objects
            .range(dir.to_string()..)
            .take_while(|(k, _)| k.starts_with(dir))
            .filter_map(|(k, _)| k[dir.len()..].split('/').next().map(str::to_string))
            .collect();
        names.dedup();
        names
    }
}

#[async_trait]
impl ReplicaClient for MemoryClient {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>> {
        Ok(self
            .children(&self.layout.generations_dir())
            .iter()
            .filter_map(|name| GenerationId::parse(name).ok())
            .collect())
    }

    async fn list_snapshots(&self, generation: &GenerationId) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots: Vec<SnapshotInfo> = self
            .children(&self.layout.snapshots_dir(generation))
            .iter()
            .filter_map(|name| self.layout.parse_snapshot(generation, name))
            .collect();
        sort_snapshots(&mut snapshots);
        Ok(snapshots)
    }

    async fn list_segments(&self, generation: &GenerationId) -> Result<Vec<SegmentInfo>> {
        let wal_dir = self.layout.wal_dir(generation);
        let keys: Vec<String> = {
            let objects = self.objects.lock();
            objects
                .range(wal_dir.clone()..)
                .take_while(|(k, _)| k.starts_with(&wal_dir))
                .map(|(k, _)| k[wal_dir.len()..].to_string())
                .collect()
        };
        let mut segments: Vec<SegmentInfo> = keys
            .iter()
            .filter_map(|relative| self.layout.parse_segment(generation, relative))
            .collect();
        sort_segments(&mut segments);
        Ok(segments)
    }

    async fn write_snapshot(&self, info: &SnapshotInfo, data: &[u8]) -> Result<String> {
        self.put(self.layout.snapshot_key(info), data)?;
        Ok(info.object_name())
    }

    async fn write_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()> {
        self.take_failure()?;
        let existing = self.list_segments(&info.generation).await?;
        if check_existing(info, &existing)? {
            return Ok(());
        }
        let compressed = compress(data, 1)?;
        self.objects
            .lock()
            .insert(self.layout.segment_key(info), compressed);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_snapshot(&self, info: &SnapshotInfo) -> Result<Vec<u8>> {
        let data = self.get(&self.layout.snapshot_key(info))?;
        verify_snapshot(info, &data)?;
        Ok(data)
    }

    async fn read_segment(&self, info: &SegmentInfo) -> Result<Vec<u8>> {
        self.get(&self.layout.segment_key(info))
    }

    async fn delete_segment(&self, info: &SegmentInfo) -> Result<()> {
        self.objects.lock().remove(&self.layout.segment_key(info));
        Ok(())
    }

    async fn delete_snapshot(&self, generation: &GenerationId, id: &str) -> Result<()> {
        self.objects
            .lock()
            .remove(&self.layout.snapshot_key_for(generation, id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn segment(index: u64, checksum: u32) -> SegmentInfo {
        SegmentInfo {
            generation: GenerationId::parse("0000000000000001").unwrap(),
            level: 0,
            min_index: index,
            max_index: index,
            offset: 32,
            size: 3,
            created_at: Utc::now(),
            page_size: 4096,
            checksum,
        }
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let client = MemoryClient::new();
        client.fail_next_writes(2);
        assert!(client.write_segment(&segment(0, 1), b"abc").await.is_err());
        assert!(client.write_segment(&segment(0, 1), b"abc").await.is_err());
        client.write_segment(&segment(0, 1), b"abc").await.unwrap();
        assert_eq!(client.write_count(), 1);
    }

    #[tokio::test]
    async fn test_listing() {
        let client = MemoryClient::new();
        client.write_segment(&segment(1, 2), b"def").await.unwrap();
        client.write_segment(&segment(0, 1), b"abc").await.unwrap();
        let generations = client.list_generations().await.unwrap();
        assert_eq!(generations.len(), 1);
        let segments = client.list_segments(&generations[0]).await.unwrap();
        assert_eq!(
            segments.iter().map(|s| s.min_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(client.read_segment(&segments[1]).await.unwrap(), b"def");
    }
}
