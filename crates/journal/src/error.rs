//! Error types for journals

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal is not open")]
    NotOpen,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid journal fragment {}: {reason}", path.display())]
    InvalidFragment { path: PathBuf, reason: String },

    #[error("corrupted journal record in {} at position {position}: {reason}", path.display())]
    Corrupted {
        path: PathBuf,
        position: u64,
        reason: String,
    },

    #[error("record of {size} bytes does not fit in a journal fragment of {max} bytes")]
    RecordTooLarge { size: usize, max: u64 },

    #[error("journal failure: {0}")]
    Failed(String),
}

impl JournalError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
