// Journal Configuration
// Loaded from JSON, validated before a journal is opened

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{JournalError, JournalResult};
use crate::Tid;

/// Journal modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Journal data and metadata
    Journal,
    /// Journal metadata only, data written before metadata
    Ordered,
    /// Journal metadata only, data can be written anytime
    Writeback,
}

impl JournalMode {
    /// Whether data blocks must reach disk before the metadata naming them.
    pub fn flushes_data(&self) -> bool {
        matches!(self, JournalMode::Ordered)
    }
}

/// Checksum algorithm recorded in commit blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    None,
    Crc32,
    Crc32c,
}

/// Journal configuration and capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Size of every log and filesystem block in bytes
    pub block_size: usize,
    /// First usable log block (block 0 holds the superblock)
    pub log_first: u64,
    /// Total log length in blocks, superblock included
    pub log_blocks: u64,
    /// Journal mode
    pub mode: JournalMode,
    /// Shadow buffers per metadata write batch
    pub batch_size: usize,
    /// Data buffers per ordered-mode write batch
    pub max_data_batch: usize,
    /// Request ordering barriers on commit records
    pub barrier: bool,
    /// Submit the commit record together with the metadata blocks
    pub async_commit: bool,
    /// Checksum written in commit records
    pub checksum: ChecksumKind,
    /// 64-bit block numbers in descriptor tags
    pub large_block: bool,
    /// Commit thread wakeup interval
    pub commit_interval_ms: u64,
    /// Sequence number of the first transaction of a fresh log
    pub first_tid: Tid,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            log_first: 1,
            log_blocks: 1024,
            mode: JournalMode::Ordered,
            batch_size: 64,
            max_data_batch: 64,
            barrier: true,
            async_commit: false,
            checksum: ChecksumKind::None,
            large_block: false,
            commit_interval_ms: 5000,
            first_tid: 1,
        }
    }
}

/// Descriptor header: magic, block type, sequence
const HEADER_BYTES: usize = 12;
/// Log UUID following the first tag of every descriptor
const UUID_BYTES: usize = 16;

impl JournalConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> JournalResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: JournalConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// On-disk size of one descriptor tag for this configuration.
    pub fn tag_bytes(&self) -> usize {
        if self.large_block {
            12
        } else {
            8
        }
    }

    pub fn validate(&self) -> JournalResult<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 1024 {
            return Err(JournalError::Configuration(format!(
                "block size {} must be a power of two of at least 1024",
                self.block_size
            )));
        }
        if HEADER_BYTES + self.tag_bytes() + UUID_BYTES > self.block_size {
            return Err(JournalError::Configuration(
                "descriptor block cannot hold a single tag".to_string(),
            ));
        }
        if self.log_first == 0 || self.log_first >= self.log_blocks {
            return Err(JournalError::Configuration(format!(
                "first log block {} outside log of {} blocks",
                self.log_first, self.log_blocks
            )));
        }
        if self.log_blocks - self.log_first < 4 {
            return Err(JournalError::Configuration(format!(
                "log of {} blocks is too small",
                self.log_blocks
            )));
        }
        if self.batch_size == 0 || self.max_data_batch == 0 {
            return Err(JournalError::Configuration(
                "batch sizes must be non-zero".to_string(),
            ));
        }
        if self.first_tid == 0 {
            return Err(JournalError::Configuration(
                "first transaction id must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        JournalConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_tiny_log() {
        let config = JournalConfig {
            log_blocks: 3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(JournalError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_odd_block_size() {
        let config = JournalConfig {
            block_size: 3000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "block_size": 1024, "mode": "writeback", "checksum": "crc32c" }}"#
        )
        .unwrap();

        let config = JournalConfig::from_file(file.path()).unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.mode, JournalMode::Writeback);
        assert_eq!(config.checksum, ChecksumKind::Crc32c);
        assert_eq!(config.batch_size, 64);
    }
}
