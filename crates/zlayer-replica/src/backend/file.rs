//! Local filesystem backend
//!
//! Objects are files under a root directory. Writes go to a hidden temp file
//! that is fsynced and renamed into place, so readers never observe a partial
//! object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::{check_existing, compress, decompress, verify_snapshot, Layout, ReplicaClient};
use crate::error::{ReplicaError, Result};
use crate::generation::{sort_segments, sort_snapshots, GenerationId, SegmentInfo, SnapshotInfo};

/// Replica stored in a local directory
pub struct FileClient {
    root: PathBuf,
    layout: Layout,
    compression_level: i32,
}

impl FileClient {
    pub fn new(root: PathBuf, compression_level: i32) -> Self {
        Self {
            root,
            layout: Layout::new(""),
            compression_level,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// File names in a directory; a missing directory is empty.
    async fn read_names(dir: &Path) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    /// Create `tmp`, recreating `dir` while it is missing. A delete in the
    /// same generation may prune the directory between the two steps.
    async fn create_tmp(dir: &Path, tmp: &Path) -> std::io::Result<tokio::fs::File> {
        let mut attempts = 0;
        loop {
            match tokio::fs::File::create(tmp).await {
                Err(e) if e.kind() == ErrorKind::NotFound && attempts < 3 => {
                    attempts += 1;
                    if attempts > 1 {
                        debug!("{} vanished while writing, recreating it", dir.display());
                    }
                    tokio::fs::create_dir_all(dir).await?;
                }
                result => return result,
            }
        }
    }

    async fn write_atomic(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key);
        let dir = path
            .parent()
            .ok_or_else(|| ReplicaError::InvalidState(format!("no parent for {key}")))?;

        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let tmp = dir.join(format!(".{name}.tmp"));
        let result = async {
            let mut file = Self::create_tmp(dir, &tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        trace!("Wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn read_object(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => decompress(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ReplicaError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_object(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove directories left empty by deletes, innermost first.
    async fn prune_empty_dirs(&self, generation: &GenerationId) {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for name in Self::read_names(&self.path(&self.layout.wal_dir(generation)))
            .await
            .unwrap_or_default()
        {
            dirs.push(self.path(&self.layout.wal_dir(generation)).join(name));
        }
        dirs.push(self.path(&self.layout.wal_dir(generation)));
        dirs.push(self.path(&self.layout.snapshots_dir(generation)));
        dirs.push(self.path(&format!("{}{generation}", self.layout.generations_dir())));
        for dir in dirs {
            // Fails harmlessly while the directory still has entries.
            let _ = tokio::fs::remove_dir(&dir).await;
        }
    }
}

#[async_trait]
impl ReplicaClient for FileClient {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn location(&self) -> String {
        format!("path={}", self.root.display())
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>> {
        let names = Self::read_names(&self.path(&self.layout.generations_dir())).await?;
        let mut generations: Vec<GenerationId> = names
            .iter()
            .filter_map(|name| GenerationId::parse(name).ok())
            .collect();
        generations.sort();
        Ok(generations)
    }

    async fn list_snapshots(&self, generation: &GenerationId) -> Result<Vec<SnapshotInfo>> {
        let names = Self::read_names(&self.path(&self.layout.snapshots_dir(generation))).await?;
        let mut snapshots: Vec<SnapshotInfo> = names
            .iter()
            .filter_map(|name| self.layout.parse_snapshot(generation, name))
            .collect();
        sort_snapshots(&mut snapshots);
        Ok(snapshots)
    }

    async fn list_segments(&self, generation: &GenerationId) -> Result<Vec<SegmentInfo>> {
        let wal_dir = self.path(&self.layout.wal_dir(generation));
        let mut segments = Vec::new();
        for level in Self::read_names(&wal_dir).await? {
            for name in Self::read_names(&wal_dir.join(&level)).await? {
                if let Some(info) = self
                    .layout
                    .parse_segment(generation, &format!("{level}/{name}"))
                {
                    segments.push(info);
                }
            }
        }
        sort_segments(&mut segments);
        Ok(segments)
    }

    async fn write_snapshot(&self, info: &SnapshotInfo, data: &[u8]) -> Result<String> {
        let compressed = compress(data, self.compression_level)?;
        self.write_atomic(&self.layout.snapshot_key(info), &compressed)
            .await?;
        debug!(
            "Snapshot {} of generation {} written to {} ({} bytes)",
            info.index,
            info.generation,
            self.root.display(),
            data.len()
        );
        Ok(info.object_name())
    }

    async fn write_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()> {
        let level_dir = self.path(&self.layout.level_dir(&info.generation, info.level));
        let existing: Vec<SegmentInfo> = Self::read_names(&level_dir)
            .await?
            .iter()
            .filter_map(|name| SegmentInfo::parse_name(&info.generation, info.level, name).ok())
            .collect();
        if check_existing(info, &existing)? {
            debug!(
                "Segment {}..={} of generation {} already stored",
                info.min_index, info.max_index, info.generation
            );
            return Ok(());
        }

        let compressed = compress(data, self.compression_level)?;
        self.write_atomic(&self.layout.segment_key(info), &compressed)
            .await
    }

    async fn read_snapshot(&self, info: &SnapshotInfo) -> Result<Vec<u8>> {
        let data = self.read_object(&self.layout.snapshot_key(info)).await?;
        verify_snapshot(info, &data)?;
        Ok(data)
    }

    async fn read_segment(&self, info: &SegmentInfo) -> Result<Vec<u8>> {
        self.read_object(&self.layout.segment_key(info)).await
    }

    async fn delete_segment(&self, info: &SegmentInfo) -> Result<()> {
        self.remove_object(&self.layout.segment_key(info)).await?;
        self.prune_empty_dirs(&info.generation).await;
        Ok(())
    }

    async fn delete_snapshot(&self, generation: &GenerationId, id: &str) -> Result<()> {
        self.remove_object(&self.layout.snapshot_key_for(generation, id))
            .await?;
        self.prune_empty_dirs(generation).await;
        Ok(())
    }
}
