//! Storage backends for replica data
//!
//! Every backend stores the same object layout (see [`crate::generation`])
//! and satisfies the same [`ReplicaClient`] contract; they differ only in
//! addressing and latency. The variant is chosen once, from a
//! [`BackendConfig`], when a database is opened.
//!
//! - [`file::FileClient`]: local or mounted directory
//! - [`s3::S3Client`]: S3 and S3-compatible object stores
//! - [`blob::BlobClient`]: Azure Blob Storage and Google Cloud Storage
//! - [`sftp::SftpClient`]: directory on an SFTP server
//! - [`memory::MemoryClient`]: in-process store for tests

pub mod blob;
pub mod file;
pub mod memory;
pub mod s3;
pub mod sftp;

use std::io::{Read, Write};
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{ReplicaError, Result};
use crate::generation::{GenerationId, SegmentInfo, SnapshotInfo};

pub use blob::BlobClient;
pub use file::FileClient;
pub use memory::MemoryClient;
pub use s3::S3Client;
pub use sftp::SftpClient;

/// Operations every replica destination supports.
///
/// Listings are returned oldest first (see [`crate::generation::sort_snapshots`]
/// and [`crate::generation::sort_segments`]). Writes are all-or-nothing: an
/// object is either absent or complete.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Short backend name ("file", "s3", ...)
    fn kind(&self) -> &'static str;

    /// Human readable destination, used in logs.
    fn location(&self) -> String;

    async fn list_generations(&self) -> Result<Vec<GenerationId>>;

    async fn list_snapshots(&self, generation: &GenerationId) -> Result<Vec<SnapshotInfo>>;

    /// Segments of every level in a generation.
    async fn list_segments(&self, generation: &GenerationId) -> Result<Vec<SegmentInfo>>;

    /// Store a snapshot, returning its identifier.
    async fn write_snapshot(&self, info: &SnapshotInfo, data: &[u8]) -> Result<String>;

    /// Store a segment.
    ///
    /// Writing a unit whose level and index range already exist succeeds
    /// without rewriting when the checksum matches and fails with
    /// [`ReplicaError::SegmentConflict`] otherwise.
    async fn write_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()>;

    async fn read_snapshot(&self, info: &SnapshotInfo) -> Result<Vec<u8>>;

    async fn read_segment(&self, info: &SegmentInfo) -> Result<Vec<u8>>;

    /// Remove one segment object. Removing a missing object is not an error.
    async fn delete_segment(&self, info: &SegmentInfo) -> Result<()>;

    /// Remove a snapshot by the identifier [`write_snapshot`](Self::write_snapshot) returned.
    async fn delete_snapshot(&self, generation: &GenerationId, id: &str) -> Result<()>;

    /// Remove every unit at `level` lying entirely inside `range`, oldest first.
    async fn delete_segments(
        &self,
        generation: &GenerationId,
        level: u8,
        range: RangeInclusive<u64>,
    ) -> Result<usize> {
        let mut deleted = 0;
        for info in self.list_segments(generation).await? {
            if info.level == level
                && range.contains(&info.min_index)
                && range.contains(&info.max_index)
            {
                self.delete_segment(&info).await?;
                deleted += 1;
            }
        }
        debug!(
            "Deleted {} level {} segment(s) in {:?} from generation {}",
            deleted, level, range, generation
        );
        Ok(deleted)
    }
}

/// Build the client described by `config`.
pub async fn open_client(
    config: &BackendConfig,
    compression_level: i32,
) -> Result<Arc<dyn ReplicaClient>> {
    let client: Arc<dyn ReplicaClient> = match config {
        BackendConfig::File { path } => Arc::new(FileClient::new(path.clone(), compression_level)),
        BackendConfig::S3 {
            bucket,
            path,
            region,
            endpoint,
        } => Arc::new(
            S3Client::connect(
                bucket.clone(),
                path.clone(),
                region.clone(),
                endpoint.clone(),
                compression_level,
            )
            .await?,
        ),
        BackendConfig::Abs {
            account_name,
            account_key,
            container,
            path,
            endpoint,
        } => Arc::new(BlobClient::azure(
            account_name.as_deref(),
            account_key.as_deref(),
            container,
            path,
            endpoint.as_deref(),
            compression_level,
        )?),
        BackendConfig::Gcs {
            bucket,
            path,
            service_account_path,
        } => Arc::new(BlobClient::gcs(
            bucket,
            path,
            service_account_path.as_deref(),
            compression_level,
        )?),
        BackendConfig::Sftp {
            host,
            user,
            password,
            key_path,
            path,
        } => Arc::new(SftpClient::new(
            host.clone(),
            user.clone(),
            password.clone(),
            key_path.clone(),
            path.clone(),
            compression_level,
        )),
    };
    Ok(client)
}

/// Key layout shared by all backends.
#[derive(Debug, Clone, Default)]
pub(crate) struct Layout {
    prefix: String,
}

impl Layout {
    /// `prefix` is a key prefix or directory; a trailing separator is added.
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else if prefix.starts_with('/') {
            format!("/{trimmed}/")
        } else {
            format!("{trimmed}/")
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generations_dir(&self) -> String {
        format!("{}generations/", self.prefix)
    }

    pub fn snapshots_dir(&self, generation: &GenerationId) -> String {
        format!("{}{generation}/snapshots/", self.generations_dir())
    }

    pub fn wal_dir(&self, generation: &GenerationId) -> String {
        format!("{}{generation}/wal/", self.generations_dir())
    }

    pub fn level_dir(&self, generation: &GenerationId, level: u8) -> String {
        format!("{}{level:02x}/", self.wal_dir(generation))
    }

    pub fn snapshot_key(&self, info: &SnapshotInfo) -> String {
        format!("{}{}", self.snapshots_dir(&info.generation), info.object_name())
    }

    pub fn snapshot_key_for(&self, generation: &GenerationId, id: &str) -> String {
        format!("{}{id}", self.snapshots_dir(generation))
    }

    pub fn segment_key(&self, info: &SegmentInfo) -> String {
        format!(
            "{}{}",
            self.level_dir(&info.generation, info.level),
            info.object_name()
        )
    }

    /// Parse a snapshot listing entry, skipping foreign objects.
    pub fn parse_snapshot(&self, generation: &GenerationId, name: &str) -> Option<SnapshotInfo> {
        match SnapshotInfo::parse_name(generation, name) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("Ignoring object in snapshots of {}: {}", generation, e);
                None
            }
        }
    }

    /// Parse `<level>/<name>` relative to the generation's wal directory.
    pub fn parse_segment(&self, generation: &GenerationId, relative: &str) -> Option<SegmentInfo> {
        let (level, name) = relative.split_once('/')?;
        let level = u8::from_str_radix(level, 16).ok()?;
        match SegmentInfo::parse_name(generation, level, name) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("Ignoring object in wal of {}: {}", generation, e);
                None
            }
        }
    }
}

/// Decide whether a segment write is a repeat of something already stored.
///
/// Returns `Ok(true)` when an identical unit exists and the write can be
/// skipped.
pub(crate) fn check_existing(info: &SegmentInfo, existing: &[SegmentInfo]) -> Result<bool> {
    match existing
        .iter()
        .find(|e| e.level == info.level && e.min_index == info.min_index && e.max_index == info.max_index)
    {
        Some(e) if e.checksum == info.checksum => Ok(true),
        Some(e) => Err(ReplicaError::SegmentConflict {
            generation: info.generation.clone(),
            index: info.min_index,
            existing: e.checksum,
            attempted: info.checksum,
        }),
        None => Ok(false),
    }
}

/// Compress an object payload with zstd.
pub(crate) fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress an object payload.
pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::stream::Decoder::new(data)?;
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Check a decompressed snapshot against the size and checksum in its name.
pub(crate) fn verify_snapshot(info: &SnapshotInfo, data: &[u8]) -> Result<()> {
    let checksum = crate::generation::content_checksum(data);
    if data.len() as u64 != info.size || checksum != info.checksum {
        return Err(ReplicaError::InvalidState(format!(
            "snapshot {} of generation {} is corrupt: {} bytes crc {:08x}, expected {} bytes crc {:08x}",
            info.index,
            info.generation,
            data.len(),
            checksum,
            info.size,
            info.checksum
        )));
    }
    Ok(())
}
