//! Blob store backend (Azure Blob Storage, Google Cloud Storage)
//!
//! Both services are reached through the `object_store` crate, which gives
//! them one put/get/list/delete surface. Puts are atomic.

use std::path::Path as FsPath;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};

use super::{check_existing, compress, decompress, verify_snapshot, Layout, ReplicaClient};
use crate::error::{ReplicaError, Result};
use crate::generation::{sort_segments, sort_snapshots, GenerationId, SegmentInfo, SnapshotInfo};

/// Replica stored in a blob container or bucket
pub struct BlobClient {
    kind: &'static str,
    store: Arc<dyn ObjectStore>,
    location: String,
    layout: Layout,
    compression_level: i32,
}

impl BlobClient {
    /// Azure Blob Storage container.
    ///
    /// Account name and key fall back to `AZURE_STORAGE_*` environment
    /// variables when not given.
    pub fn azure(
        account_name: Option<&str>,
        account_key: Option<&str>,
        container: &str,
        path: &str,
        endpoint: Option<&str>,
        compression_level: i32,
    ) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::from_env().with_container_name(container);
        if let Some(account) = account_name {
            builder = builder.with_account(account);
        }
        if let Some(key) = account_key {
            builder = builder.with_access_key(key);
        }
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint.to_string());
        }
        let store = builder.build().map_err(|e| ReplicaError::backend("abs", e))?;

        let location = format!(
            "account={} container={} path={}",
            account_name.unwrap_or("env"),
            container,
            path
        );
        Ok(Self::with_store(
            "abs",
            Arc::new(store),
            location,
            path,
            compression_level,
        ))
    }

    /// Google Cloud Storage bucket.
    ///
    /// Without a service account file, credentials come from the
    /// environment (`GOOGLE_*` variables or the metadata server).
    pub fn gcs(
        bucket: &str,
        path: &str,
        service_account_path: Option<&FsPath>,
        compression_level: i32,
    ) -> Result<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(service_account) = service_account_path {
            builder = builder.with_service_account_path(service_account.to_string_lossy());
        }
        let store = builder.build().map_err(|e| ReplicaError::backend("gcs", e))?;

        Ok(Self::with_store(
            "gcs",
            Arc::new(store),
            format!("bucket={bucket} path={path}"),
            path,
            compression_level,
        ))
    }

    /// Wrap an already configured store.
    pub fn with_store(
        kind: &'static str,
        store: Arc<dyn ObjectStore>,
        location: String,
        path: &str,
        compression_level: i32,
    ) -> Self {
        Self {
            kind,
            store,
            location,
            // Object paths are never absolute.
            layout: Layout::new(path.trim_start_matches('/')),
            compression_level,
        }
    }

    fn err(&self, e: object_store::Error) -> ReplicaError {
        match e {
            object_store::Error::NotFound { path, .. } => ReplicaError::NotFound(path),
            other => ReplicaError::backend(self.kind, other),
        }
    }

    /// Full keys of every object under `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::from(prefix);
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| self.err(e))?;
        Ok(objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let compressed = compress(data, self.compression_level)?;
        let compressed_len = compressed.len();
        self.store
            .put(&Path::from(key), PutPayload::from(compressed))
            .await
            .map_err(|e| self.err(e))?;
        debug!(
            "Uploaded {} {} ({} bytes, {} compressed)",
            self.kind,
            key,
            data.len(),
            compressed_len
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| self.err(e))?;
        let bytes = result.bytes().await.map_err(|e| self.err(e))?;
        decompress(&bytes)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(self.err(e)),
        }
    }
}

#[async_trait]
impl ReplicaClient for BlobClient {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>> {
        let prefix = Path::from(self.layout.generations_dir());
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(|e| self.err(e))?;
        let mut generations: Vec<GenerationId> = listing
            .common_prefixes
            .iter()
            .filter_map(|dir| dir.filename())
            .filter_map(|name| GenerationId::parse(name).ok())
            .collect();
        generations.sort();
        Ok(generations)
    }

    async fn list_snapshots(&self, generation: &GenerationId) -> Result<Vec<SnapshotInfo>> {
        let prefix = self.layout.snapshots_dir(generation);
        let mut snapshots: Vec<SnapshotInfo> = self
            .list_keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| {
                self.layout
                    .parse_snapshot(generation, key.strip_prefix(prefix.as_str())?)
            })
            .collect();
        sort_snapshots(&mut snapshots);
        Ok(snapshots)
    }

    async fn list_segments(&self, generation: &GenerationId) -> Result<Vec<SegmentInfo>> {
        let prefix = self.layout.wal_dir(generation);
        let mut segments: Vec<SegmentInfo> = self
            .list_keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| {
                self.layout
                    .parse_segment(generation, key.strip_prefix(prefix.as_str())?)
            })
            .collect();
        sort_segments(&mut segments);
        Ok(segments)
    }

    async fn write_snapshot(&self, info: &SnapshotInfo, data: &[u8]) -> Result<String> {
        let key = self.layout.snapshot_key(info);
        info!("Uploading snapshot to {} {} ({} bytes)", self.kind, key, data.len());
        self.put(&key, data).await?;
        Ok(info.object_name())
    }

    async fn write_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()> {
        let level_dir = self.layout.level_dir(&info.generation, info.level);
        let existing: Vec<SegmentInfo> = self
            .list_keys(&level_dir)
            .await?
            .iter()
            .filter_map(|key| {
                SegmentInfo::parse_name(
                    &info.generation,
                    info.level,
                    key.strip_prefix(level_dir.as_str())?,
                )
                .ok()
            })
            .collect();
        if check_existing(info, &existing)? {
            debug!(
                "Segment {}..={} of generation {} already in {}",
                info.min_index, info.max_index, info.generation, self.kind
            );
            return Ok(());
        }
        self.put(&self.layout.segment_key(info), data).await
    }

    async fn read_snapshot(&self, info: &SnapshotInfo) -> Result<Vec<u8>> {
        let key = self.layout.snapshot_key(info);
        info!("Downloading snapshot: {}", key);
        let data = self.get(&key).await?;
        verify_snapshot(info, &data)?;
        Ok(data)
    }

    async fn read_segment(&self, info: &SegmentInfo) -> Result<Vec<u8>> {
        self.get(&self.layout.segment_key(info)).await
    }

    async fn delete_segment(&self, info: &SegmentInfo) -> Result<()> {
        self.delete(&self.layout.segment_key(info)).await
    }

    async fn delete_snapshot(&self, generation: &GenerationId, id: &str) -> Result<()> {
        self.delete(&self.layout.snapshot_key_for(generation, id))
            .await
    }
}
