//! S3 backend
//!
//! Stores replica objects in an S3 bucket (or any S3-compatible store such as
//! MinIO) under a key prefix, compressed with zstd. `PutObject` is atomic, so
//! an object is visible only once fully written.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsClient;
use tracing::{debug, info};

use super::{check_existing, compress, decompress, verify_snapshot, Layout, ReplicaClient};
use crate::error::{ReplicaError, Result};
use crate::generation::{sort_segments, sort_snapshots, GenerationId, SegmentInfo, SnapshotInfo};

const KIND: &str = "s3";

/// Replica stored in an S3 bucket
pub struct S3Client {
    client: AwsClient,
    bucket: String,
    region: Option<String>,
    endpoint: Option<String>,
    layout: Layout,
    compression_level: i32,
}

impl S3Client {
    /// Build a client from the environment (credentials, profile, region),
    /// with optional region and endpoint overrides.
    ///
    /// A custom endpoint switches to path-style addressing, which is what
    /// MinIO and most self-hosted stores expect.
    pub async fn connect(
        bucket: String,
        path: String,
        region: Option<String>,
        endpoint: Option<String>,
        compression_level: i32,
    ) -> Result<Self> {
        let mut aws_config_builder = aws_config::from_env();

        if let Some(region) = &region {
            aws_config_builder =
                aws_config_builder.region(aws_sdk_s3::config::Region::new(region.clone()));
        }

        let aws_config = aws_config_builder.load().await;

        let s3_client_config = if let Some(endpoint) = &endpoint {
            aws_sdk_s3::config::Builder::from(&aws_config)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build()
        } else {
            aws_sdk_s3::config::Builder::from(&aws_config).build()
        };

        Ok(Self::new(
            AwsClient::from_conf(s3_client_config),
            bucket,
            &path,
            region,
            endpoint,
            compression_level,
        ))
    }

    /// Wrap a pre-configured SDK client.
    pub fn new(
        client: AwsClient,
        bucket: String,
        path: &str,
        region: Option<String>,
        endpoint: Option<String>,
        compression_level: i32,
    ) -> Self {
        Self {
            client,
            bucket,
            region,
            endpoint,
            layout: Layout::new(path),
            compression_level,
        }
    }

    /// All keys under `prefix`, following continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ReplicaError::backend(KIND, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let compressed = compress(data, self.compression_level)?;
        let compressed_len = compressed.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(compressed))
            .content_type("application/zstd")
            .send()
            .await
            .map_err(|e| ReplicaError::backend(KIND, e))?;

        debug!(
            "Uploaded s3://{}/{} ({} bytes, {} compressed)",
            self.bucket,
            key,
            data.len(),
            compressed_len
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    ReplicaError::NotFound(key.to_string())
                } else {
                    ReplicaError::backend(KIND, e)
                }
            })?;

        let compressed_bytes = response
            .body
            .collect()
            .await
            .map_err(|e| ReplicaError::backend(KIND, e))?
            .into_bytes();

        decompress(&compressed_bytes)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ReplicaError::backend(KIND, e))?;
        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }
}

#[async_trait]
impl ReplicaClient for S3Client {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn location(&self) -> String {
        format!(
            "bucket={} path={} region={} endpoint={}",
            self.bucket,
            self.layout.prefix(),
            self.region.as_deref().unwrap_or("default"),
            self.endpoint.as_deref().unwrap_or("default")
        )
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>> {
        let prefix = self.layout.generations_dir();
        let mut generations = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ReplicaError::backend(KIND, e))?;

            for common in response.common_prefixes() {
                let Some(dir) = common.prefix() else {
                    continue;
                };
                let name = dir
                    .strip_prefix(prefix.as_str())
                    .unwrap_or(dir)
                    .trim_end_matches('/');
                if let Ok(id) = GenerationId::parse(name) {
                    generations.push(id);
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

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
        info!(
            "Uploading snapshot to s3://{}/{} ({} bytes)",
            self.bucket,
            key,
            data.len()
        );
        self.put(&key, data).await?;
        Ok(info.object_name())
    }

    async fn write_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()> {
        // Same level and index range share a key prefix; the rest of the
        // name carries metadata that may differ between attempts.
        let range_prefix = format!(
            "{}{:016x}-{:016x}-",
            self.layout.level_dir(&info.generation, info.level),
            info.min_index,
            info.max_index
        );
        let level_dir = self.layout.level_dir(&info.generation, info.level);
        let existing: Vec<SegmentInfo> = self
            .list_keys(&range_prefix)
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
                "Segment {}..={} of generation {} already in s3://{}",
                info.min_index, info.max_index, info.generation, self.bucket
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
