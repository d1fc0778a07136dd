pub mod config;
pub mod error;

pub use config::{ChecksumKind, JournalConfig, JournalMode};
pub use error::{JournalError, JournalResult};

/// Transaction sequence number
pub type Tid = u32;

/// Block number on the log or filesystem device
pub type BlockNumber = u64;
