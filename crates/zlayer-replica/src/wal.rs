//! SQLite WAL parsing
//!
//! Reads the 32-byte WAL header and walks frames, validating salts and the
//! cumulative frame checksum so that only fully committed transactions are
//! ever shipped.
//!
//! See: https://www.sqlite.org/fileformat2.html#walformat

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReplicaError, Result};

/// Size of the WAL file header
pub const WAL_HEADER_SIZE: usize = 32;

/// Size of each frame header preceding a page image
pub const FRAME_HEADER_SIZE: usize = 24;

/// Magic value for little-endian checksum words
const MAGIC_LE: u32 = 0x377f_0682;

/// Magic value for big-endian checksum words
const MAGIC_BE: u32 = 0x377f_0683;

/// WAL format version written by every SQLite since 3.7.0
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// Path of the WAL file that belongs to a database file.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut wal_path = db_path.to_path_buf();
    let filename = wal_path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    wal_path.set_file_name(format!("{filename}-wal"));
    wal_path
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// SQLite WAL header (first 32 bytes of the WAL file)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalHeader {
    /// Magic number: 0x377f0682 or 0x377f0683
    pub magic: u32,
    /// Format version (currently 3007000)
    pub format_version: u32,
    /// Database page size
    pub page_size: u32,
    /// Checkpoint sequence number
    pub checkpoint_seq: u32,
    /// Salt-1, incremented on every WAL restart
    pub salt1: u32,
    /// Salt-2, randomized on every WAL restart
    pub salt2: u32,
    /// Checksum-1
    pub checksum1: u32,
    /// Checksum-2
    pub checksum2: u32,
}

impl WalHeader {
    /// Parse a WAL header, validating the magic number and header checksum.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WAL_HEADER_SIZE {
            return Err(ReplicaError::WalParse(format!(
                "header needs {WAL_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let magic = be_u32(bytes, 0);
        if magic != MAGIC_LE && magic != MAGIC_BE {
            return Err(ReplicaError::WalParse(format!(
                "bad magic number {magic:#010x}"
            )));
        }

        let header = Self {
            magic,
            format_version: be_u32(bytes, 4),
            page_size: be_u32(bytes, 8),
            checkpoint_seq: be_u32(bytes, 12),
            salt1: be_u32(bytes, 16),
            salt2: be_u32(bytes, 20),
            checksum1: be_u32(bytes, 24),
            checksum2: be_u32(bytes, 28),
        };

        let expected = wal_checksum(header.big_endian(), &bytes[..24], (0, 0));
        if expected != (header.checksum1, header.checksum2) {
            return Err(ReplicaError::WalParse("header checksum mismatch".into()));
        }

        let page_size = header.page_size();
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(ReplicaError::WalParse(format!(
                "invalid page size {page_size}"
            )));
        }

        Ok(header)
    }

    /// Whether checksum words are interpreted big-endian.
    pub fn big_endian(&self) -> bool {
        self.magic == MAGIC_BE
    }

    /// Page size in bytes (a stored value of 1 means 65536).
    pub fn page_size(&self) -> usize {
        if self.page_size == 1 {
            65536
        } else {
            self.page_size as usize
        }
    }

    pub fn salts(&self) -> (u32, u32) {
        (self.salt1, self.salt2)
    }

    /// Size of one frame including its header.
    pub fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.page_size()
    }

    pub fn checksum(&self) -> (u32, u32) {
        (self.checksum1, self.checksum2)
    }

    /// Serialize back into the on-disk layout.
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut out = [0u8; WAL_HEADER_SIZE];
        for (i, word) in [
            self.magic,
            self.format_version,
            self.page_size,
            self.checkpoint_seq,
            self.salt1,
            self.salt2,
            self.checksum1,
            self.checksum2,
        ]
        .iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

/// Header of a single WAL frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Page number this frame writes
    pub pgno: u32,
    /// Database size in pages after commit, zero for non-commit frames
    pub db_size: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum1: u32,
    pub checksum2: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ReplicaError::WalParse(format!(
                "frame header needs {FRAME_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            pgno: be_u32(bytes, 0),
            db_size: be_u32(bytes, 4),
            salt1: be_u32(bytes, 8),
            salt2: be_u32(bytes, 12),
            checksum1: be_u32(bytes, 16),
            checksum2: be_u32(bytes, 20),
        })
    }

    pub fn is_commit(&self) -> bool {
        self.db_size != 0
    }
}

/// SQLite's cumulative WAL checksum over 8-byte chunks of `data`.
pub fn wal_checksum(big_endian: bool, data: &[u8], seed: (u32, u32)) -> (u32, u32) {
    let (mut s1, mut s2) = seed;
    for chunk in data.chunks_exact(8) {
        let (a, b) = if big_endian {
            (be_u32(chunk, 0), be_u32(chunk, 4))
        } else {
            (
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            )
        };
        s1 = s1.wrapping_add(a).wrapping_add(s2);
        s2 = s2.wrapping_add(b).wrapping_add(s1);
    }
    (s1, s2)
}

/// Checksum of one frame, chained from `seed`.
fn frame_checksum(big_endian: bool, frame: &[u8], seed: (u32, u32)) -> (u32, u32) {
    let seed = wal_checksum(big_endian, &frame[..8], seed);
    wal_checksum(big_endian, &frame[FRAME_HEADER_SIZE..], seed)
}

/// Outcome of scanning WAL bytes for committed frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameScan {
    /// Bytes through the end of the last valid commit frame
    pub committed_len: usize,
    /// Running checksum after the last commit frame
    pub checksum: (u32, u32),
    /// Number of frames up to the last commit
    pub frames: usize,
    /// Number of commit frames found
    pub commits: usize,
}

/// Walk frames in `data` (which starts on a frame boundary) and find the
/// longest prefix that ends on a valid commit frame.
///
/// Scanning stops at the first frame with foreign salts or a checksum that
/// does not continue from `seed`; such frames are leftovers from a previous
/// WAL incarnation or a write still in progress.
pub fn scan_committed(header: &WalHeader, data: &[u8], seed: (u32, u32)) -> FrameScan {
    let frame_size = header.frame_size();
    let mut scan = FrameScan {
        committed_len: 0,
        checksum: seed,
        frames: 0,
        commits: 0,
    };
    let mut running = seed;
    let mut offset = 0;
    let mut frames = 0;

    while offset + frame_size <= data.len() {
        let frame = &data[offset..offset + frame_size];
        let Ok(fh) = FrameHeader::parse(frame) else {
            break;
        };
        if (fh.salt1, fh.salt2) != header.salts() {
            break;
        }
        running = frame_checksum(header.big_endian(), frame, running);
        if running != (fh.checksum1, fh.checksum2) {
            break;
        }

        offset += frame_size;
        frames += 1;
        if fh.is_commit() {
            scan.committed_len = offset;
            scan.checksum = running;
            scan.frames = frames;
            scan.commits += 1;
        }
    }

    scan
}

/// Iterate `(header, page)` pairs of a segment payload.
pub fn frames(payload: &[u8], page_size: usize) -> FrameIter<'_> {
    FrameIter {
        payload,
        page_size,
        offset: 0,
    }
}

pub struct FrameIter<'a> {
    payload: &'a [u8],
    page_size: usize,
    offset: usize,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<(FrameHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let frame_size = FRAME_HEADER_SIZE + self.page_size;
        let payload = self.payload;
        let rest = &payload[self.offset..];
        if rest.len() < frame_size {
            self.offset = self.payload.len();
            return Some(Err(ReplicaError::WalParse(format!(
                "truncated frame: {} of {frame_size} bytes",
                rest.len()
            ))));
        }
        self.offset += frame_size;
        Some(FrameHeader::parse(rest).map(|fh| (fh, &rest[FRAME_HEADER_SIZE..frame_size])))
    }
}

/// Builds well-formed WAL images page by page.
///
/// Used to lay down test fixtures and by tooling that needs to synthesize a
/// WAL; replication itself only ever reads WAL files.
#[derive(Debug, Clone)]
pub struct WalBuilder {
    header: WalHeader,
    running: (u32, u32),
    bytes: Vec<u8>,
}

impl WalBuilder {
    pub fn new(page_size: u32, salt1: u32, salt2: u32) -> Self {
        let mut header = WalHeader {
            magic: MAGIC_LE,
            format_version: WAL_FORMAT_VERSION,
            page_size,
            checkpoint_seq: 0,
            salt1,
            salt2,
            checksum1: 0,
            checksum2: 0,
        };
        let (c1, c2) = wal_checksum(false, &header.encode()[..24], (0, 0));
        header.checksum1 = c1;
        header.checksum2 = c2;
        Self {
            header,
            running: (c1, c2),
            bytes: header.encode().to_vec(),
        }
    }

    pub fn header(&self) -> WalHeader {
        self.header
    }

    /// Append a frame; `db_size` of zero marks a non-commit frame.
    pub fn frame(&mut self, pgno: u32, db_size: u32, page: &[u8]) -> &mut Self {
        let page_size = self.header.page_size();
        let mut frame = vec![0u8; FRAME_HEADER_SIZE + page_size];
        frame[0..4].copy_from_slice(&pgno.to_be_bytes());
        frame[4..8].copy_from_slice(&db_size.to_be_bytes());
        frame[8..12].copy_from_slice(&self.header.salt1.to_be_bytes());
        frame[12..16].copy_from_slice(&self.header.salt2.to_be_bytes());
        let len = page.len().min(page_size);
        frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].copy_from_slice(&page[..len]);
        self.running = frame_checksum(false, &frame, self.running);
        frame[16..20].copy_from_slice(&self.running.0.to_be_bytes());
        frame[20..24].copy_from_slice(&self.running.1.to_be_bytes());
        self.bytes.extend_from_slice(&frame);
        self
    }

    /// Append a one-page transaction filling page `pgno` with `fill`.
    pub fn commit_page(&mut self, pgno: u32, db_size: u32, fill: u8) -> &mut Self {
        let page = vec![fill; self.header.page_size()];
        self.frame(pgno, db_size, &page)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
