// jbd2-style write-ahead journal: handles, the commit engine, checkpointing
// and recovery over pluggable block devices

pub mod allocator;
pub mod arena;
pub mod buffer;
pub mod checkpoint;
pub mod checksum;
pub mod commit;
pub mod commit_thread;
pub mod device;
pub mod format;
pub mod journal;
pub mod recovery;
pub mod revoke;
pub mod superblock;
pub mod transaction;

// Re-export the journal surface
pub use buffer::{BlockBuffer, BufferList};
pub use checkpoint::CheckpointStats;
pub use commit_thread::CommitThread;
pub use device::{BlockDevice, FileDevice, IoEvent, IoStatus, MemoryDevice};
pub use journal::{tid_geq, tid_gt, HeadInfo, Journal, JournalStats};
pub use recovery::RecoveryInfo;
pub use superblock::JournalSuperblock;
pub use transaction::{Handle, TransactionRunStats, TransactionState};

pub use jcommit_core::{BlockNumber, ChecksumKind, JournalConfig, JournalError, JournalMode, JournalResult, Tid};
