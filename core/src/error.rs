use thiserror::Error;

use crate::BlockNumber;

/// errno values recorded in the log superblock when the journal aborts
pub const EIO: i32 = 5;
pub const ENOSPC: i32 = 28;
pub const EROFS: i32 = 30;
pub const EOPNOTSUPP: i32 = 95;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write to block {block} did not complete")]
    IoFailed { block: BlockNumber },

    #[error("Device does not support barrier writes")]
    BarrierNotSupported,

    #[error("No free blocks left in the log")]
    LogFull,

    #[error("Journal aborted (errno {0})")]
    Aborted(i32),

    #[error("Resource busy")]
    Busy,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt log: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl JournalError {
    /// Numeric code stored in the superblock `errno` field.
    pub fn errno(&self) -> i32 {
        match self {
            JournalError::LogFull => ENOSPC,
            JournalError::BarrierNotSupported => EOPNOTSUPP,
            JournalError::Aborted(errno) => *errno,
            JournalError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            JournalError::IoFailed { .. } | JournalError::Corrupt(_) => EIO,
            _ => EROFS,
        }
    }
}

pub type JournalResult<T> = Result<T, JournalError>;
