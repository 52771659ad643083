//! Error types for WAL replication

use std::path::PathBuf;

use thiserror::Error;

use crate::generation::{ChainBreak, GenerationId, Position};

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backend request failed. Network failures and throttling land here
    /// and are retried by the caller.
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("WAL parse error: {0}")]
    WalParse(String),

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Checksum chain broken at index {}: {}", .0.index, .0.reason)]
    ChainBroken(ChainBreak),

    /// A segment with the same index but different content already exists.
    #[error("Segment {index} of generation {generation} already exists with checksum {existing:08x}, refusing {attempted:08x}")]
    SegmentConflict {
        generation: GenerationId,
        index: u64,
        existing: u32,
        attempted: u32,
    },

    #[error("No snapshot available in generation {0}")]
    NoSnapshot(GenerationId),

    #[error("No generation found on replica")]
    NoGeneration,

    /// Restore stopped at a chain break before the target. The output file
    /// holds the database as of `reached`.
    #[error("Restore incomplete: reached index {} of generation {} before chain break at index {}", .reached.index, .reached.generation, .broken.index)]
    RestoreIncomplete {
        reached: Position,
        broken: ChainBreak,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Logging initialization failed: {0}")]
    Logging(String),

    #[error("Failed to close {} database(s)", .0.len())]
    Close(Vec<(PathBuf, ReplicaError)>),
}

impl ReplicaError {
    /// Build a backend error tagged with the backend kind.
    pub fn backend(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend,
            message: err.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ReplicaError::backend("s3", "throttled").is_transient());
        assert!(
            ReplicaError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient()
        );
        assert!(
            !ReplicaError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient()
        );
        assert!(!ReplicaError::Config("bad".into()).is_transient());
        assert!(!ReplicaError::WalParse("short".into()).is_transient());
    }

    #[test]
    fn test_close_error_message() {
        let err = ReplicaError::Close(vec![
            ("/a.db".into(), ReplicaError::backend("file", "disk full")),
            ("/b.db".into(), ReplicaError::NoGeneration),
        ]);
        assert_eq!(err.to_string(), "Failed to close 2 database(s)");
    }
}
