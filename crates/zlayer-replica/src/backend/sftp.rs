//! SFTP backend
//!
//! Objects are files under a directory on an SFTP server. libssh2 is
//! blocking, so every operation runs on the blocking pool. One session is
//! kept open and re-established after a failure.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use tracing::{debug, info, warn};

use super::{check_existing, compress, decompress, verify_snapshot, Layout, ReplicaClient};
use crate::error::{ReplicaError, Result};
use crate::generation::{sort_segments, sort_snapshots, GenerationId, SegmentInfo, SnapshotInfo};

const KIND: &str = "sftp";
const DEFAULT_PORT: u16 = 22;
/// libssh2 status for a missing file
const NO_SUCH_FILE: i32 = 2;

struct Connection {
    address: String,
    user: String,
    password: Option<String>,
    key_path: Option<PathBuf>,
    session: Mutex<Option<Session>>,
}

impl Connection {
    fn connect(&self) -> Result<Session> {
        let tcp = TcpStream::connect(&self.address)?;
        let mut session = Session::new().map_err(|e| ReplicaError::backend(KIND, e))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ReplicaError::backend(KIND, e))?;

        match (&self.key_path, &self.password) {
            (Some(key), passphrase) => session
                .userauth_pubkey_file(&self.user, None, key, passphrase.as_deref())
                .map_err(|e| ReplicaError::backend(KIND, e))?,
            (None, Some(password)) => session
                .userauth_password(&self.user, password)
                .map_err(|e| ReplicaError::backend(KIND, e))?,
            (None, None) => session
                .userauth_agent(&self.user)
                .map_err(|e| ReplicaError::backend(KIND, e))?,
        }

        if !session.authenticated() {
            return Err(ReplicaError::Config(format!(
                "sftp authentication failed for {}@{}",
                self.user, self.address
            )));
        }
        info!("Connected to sftp://{}@{}", self.user, self.address);
        Ok(session)
    }

    fn sftp(&self) -> Result<Sftp> {
        let mut guard = self.session.lock();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let session = guard
            .as_ref()
            .ok_or_else(|| ReplicaError::InvalidState("sftp session missing".to_string()))?;
        match session.sftp() {
            Ok(sftp) => Ok(sftp),
            Err(e) => {
                *guard = None;
                Err(ReplicaError::backend(KIND, e))
            }
        }
    }

    fn reset(&self) {
        self.session.lock().take();
    }
}

fn sftp_err(e: ssh2::Error) -> ReplicaError {
    ReplicaError::backend(KIND, e)
}

fn is_missing(e: &ssh2::Error) -> bool {
    e.code() == ErrorCode::SFTP(NO_SUCH_FILE)
}

/// Entry names of `dir`; a missing directory is empty.
fn read_names(sftp: &Sftp, dir: &str) -> Result<Vec<String>> {
    match sftp.readdir(Path::new(dir)) {
        Ok(entries) => Ok(entries
            .iter()
            .filter_map(|(path, _)| path.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .collect()),
        Err(e) if is_missing(&e) => Ok(Vec::new()),
        Err(e) => Err(sftp_err(e)),
    }
}

fn mkdir_all(sftp: &Sftp, dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || sftp.stat(dir).is_ok() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        mkdir_all(sftp, parent)?;
    }
    match sftp.mkdir(dir, 0o755) {
        Ok(()) => Ok(()),
        // Lost a race with another writer.
        Err(_) if sftp.stat(dir).is_ok() => Ok(()),
        Err(e) => Err(sftp_err(e)),
    }
}

fn write_atomic(sftp: &Sftp, key: &str, data: &[u8]) -> Result<()> {
    let path = Path::new(key);
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    mkdir_all(sftp, dir)?;

    let name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp = dir.join(format!(".{name}.tmp"));
    let result = (|| {
        let mut file = sftp.create(&tmp).map_err(sftp_err)?;
        file.write_all(data)?;
        file.fsync().map_err(sftp_err)?;
        drop(file);
        sftp.rename(
            &tmp,
            path,
            Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
        )
        .map_err(sftp_err)
    })();
    if result.is_err() {
        let _ = sftp.unlink(&tmp);
    }
    result
}

fn read_object(sftp: &Sftp, key: &str) -> Result<Vec<u8>> {
    let mut file = match sftp.open(Path::new(key)) {
        Ok(file) => file,
        Err(e) if is_missing(&e) => return Err(ReplicaError::NotFound(key.to_string())),
        Err(e) => return Err(sftp_err(e)),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    decompress(&data)
}

fn remove_object(sftp: &Sftp, key: &str) -> Result<()> {
    match sftp.unlink(Path::new(key)) {
        Ok(()) => Ok(()),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(sftp_err(e)),
    }
}

/// Replica stored on an SFTP server
pub struct SftpClient {
    conn: Arc<Connection>,
    layout: Layout,
    compression_level: i32,
}

impl SftpClient {
    /// `host` may carry a port (`host:2222`); the default is 22. A key file
    /// takes precedence over a password, in which case the password unlocks
    /// the key. With neither, the ssh agent is used.
    pub fn new(
        host: String,
        user: String,
        password: Option<String>,
        key_path: Option<PathBuf>,
        path: String,
        compression_level: i32,
    ) -> Self {
        Self {
            conn: Arc::new(Connection {
                address: with_default_port(&host),
                user,
                password,
                key_path,
                session: Mutex::new(None),
            }),
            layout: Layout::new(&path),
            compression_level,
        }
    }

    /// Run `op` against a live sftp channel on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp, &Layout) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || {
            let sftp = conn.sftp()?;
            let result = op(&sftp, &layout);
            if let Err(e) = &result {
                if e.is_transient() {
                    warn!("sftp operation failed, dropping session: {}", e);
                    conn.reset();
                }
            }
            result
        })
        .await
        .map_err(|e| ReplicaError::InvalidState(format!("sftp task failed: {e}")))?
    }
}

fn with_default_port(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    }
}

#[async_trait]
impl ReplicaClient for SftpClient {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn location(&self) -> String {
        format!(
            "host={} user={} path={}",
            self.conn.address,
            self.conn.user,
            self.layout.prefix()
        )
    }

    async fn list_generations(&self) -> Result<Vec<GenerationId>> {
        self.run(|sftp, layout| {
            let mut generations: Vec<GenerationId> = read_names(sftp, &layout.generations_dir())?
                .iter()
                .filter_map(|name| GenerationId::parse(name).ok())
                .collect();
            generations.sort();
            Ok(generations)
        })
        .await
    }

    async fn list_snapshots(&self, generation: &GenerationId) -> Result<Vec<SnapshotInfo>> {
        let generation = generation.clone();
        self.run(move |sftp, layout| {
            let mut snapshots: Vec<SnapshotInfo> =
                read_names(sftp, &layout.snapshots_dir(&generation))?
                    .iter()
                    .filter_map(|name| layout.parse_snapshot(&generation, name))
                    .collect();
            sort_snapshots(&mut snapshots);
            Ok(snapshots)
        })
        .await
    }

    async fn list_segments(&self, generation: &GenerationId) -> Result<Vec<SegmentInfo>> {
        let generation = generation.clone();
        self.run(move |sftp, layout| {
            let wal_dir = layout.wal_dir(&generation);
            let mut segments = Vec::new();
            for level in read_names(sftp, &wal_dir)? {
                for name in read_names(sftp, &format!("{wal_dir}{level}/"))? {
                    if let Some(info) = layout.parse_segment(&generation, &format!("{level}/{name}"))
                    {
                        segments.push(info);
                    }
                }
            }
            sort_segments(&mut segments);
            Ok(segments)
        })
        .await
    }

    async fn write_snapshot(&self, info: &SnapshotInfo, data: &[u8]) -> Result<String> {
        let compressed = compress(data, self.compression_level)?;
        let key = self.layout.snapshot_key(info);
        debug!("Uploading snapshot {} ({} bytes)", key, data.len());
        self.run(move |sftp, _| write_atomic(sftp, &key, &compressed))
            .await?;
        Ok(info.object_name())
    }

    async fn write_segment(&self, info: &SegmentInfo, data: &[u8]) -> Result<()> {
        let compressed = compress(data, self.compression_level)?;
        let info = info.clone();
        self.run(move |sftp, layout| {
            let existing: Vec<SegmentInfo> =
                read_names(sftp, &layout.level_dir(&info.generation, info.level))?
                    .iter()
                    .filter_map(|name| {
                        SegmentInfo::parse_name(&info.generation, info.level, name).ok()
                    })
                    .collect();
            if check_existing(&info, &existing)? {
                return Ok(());
            }
            write_atomic(sftp, &layout.segment_key(&info), &compressed)
        })
        .await
    }

    async fn read_snapshot(&self, info: &SnapshotInfo) -> Result<Vec<u8>> {
        let key = self.layout.snapshot_key(info);
        let data = self.run(move |sftp, _| read_object(sftp, &key)).await?;
        verify_snapshot(info, &data)?;
        Ok(data)
    }

    async fn read_segment(&self, info: &SegmentInfo) -> Result<Vec<u8>> {
        let key = self.layout.segment_key(info);
        self.run(move |sftp, _| read_object(sftp, &key)).await
    }

    async fn delete_segment(&self, info: &SegmentInfo) -> Result<()> {
        let key = self.layout.segment_key(info);
        self.run(move |sftp, _| remove_object(sftp, &key)).await
    }

    async fn delete_snapshot(&self, generation: &GenerationId, id: &str) -> Result<()> {
        let key = self.layout.snapshot_key_for(generation, id);
        self.run(move |sftp, _| remove_object(sftp, &key)).await
    }
}
