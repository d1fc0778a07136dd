// Shared fixtures for the journal integration tests
#![allow(dead_code)]

use jcommit_journal::{BlockBuffer, BlockNumber, Handle, IoEvent, Journal, JournalConfig, MemoryDevice};
use std::sync::Arc;

pub const BS: usize = 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> JournalConfig {
    JournalConfig {
        block_size: BS,
        log_blocks: 64,
        commit_interval_ms: 60_000,
        ..Default::default()
    }
}

/// A journal over two in-memory devices kept around for inspection
pub struct Rig {
    pub log: Arc<MemoryDevice>,
    pub fs: Arc<MemoryDevice>,
    pub journal: Arc<Journal>,
}

impl Rig {
    pub fn new(config: JournalConfig) -> Self {
        init_logging();
        let log = Arc::new(MemoryDevice::new(config.block_size));
        let fs = Arc::new(MemoryDevice::new(config.block_size));
        let journal = Journal::create(config, log.clone(), fs.clone()).unwrap();
        Self { log, fs, journal }
    }

    /// Drop the journal without checkpointing and open the same devices
    /// again, as after a crash.
    pub fn reopen(self) -> (Self, jcommit_journal::RecoveryInfo) {
        let config = self.journal.config().clone();
        drop(self.journal);
        let (journal, info) = Journal::open(config, self.log.clone(), self.fs.clone()).unwrap();
        (
            Self {
                log: self.log,
                fs: self.fs,
                journal,
            },
            info,
        )
    }
}

/// Take write access to `blocknr`, fill it with `fill` and mark it dirty.
pub fn write_metadata(journal: &Journal, handle: &mut Handle, blocknr: BlockNumber, fill: u8) -> Arc<BlockBuffer> {
    let buffer = journal.buffer(blocknr).unwrap();
    handle.get_write_access(&buffer).unwrap();
    buffer.modify(|data| data.fill(fill));
    handle.dirty_metadata(&buffer).unwrap();
    buffer
}

/// Blocks submitted to a device, in submission order, with their barrier flag
pub fn submissions(device: &MemoryDevice) -> Vec<(BlockNumber, bool)> {
    device
        .events()
        .into_iter()
        .filter_map(|event| match event {
            IoEvent::Submitted { block, barrier } => Some((block, barrier)),
            _ => None,
        })
        .collect()
}
