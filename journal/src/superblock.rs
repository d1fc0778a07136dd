// Journal Superblock
// Block 0 of the log: geometry, log start, errno and feature words

use byteorder::{BigEndian, ByteOrder};
use jcommit_core::{BlockNumber, ChecksumKind, JournalConfig, JournalError, JournalResult, Tid};

use crate::checksum::{commit_checksum_fields, kind_from_type};
use crate::format::{JournalHeader, JBD2_SUPERBLOCK_V2, UUID_SIZE};

/// Feature flags
pub const JBD2_FEATURE_COMPAT_CHECKSUM: u32 = 0x0000_0001;
pub const JBD2_FEATURE_INCOMPAT_REVOKE: u32 = 0x0000_0001;
pub const JBD2_FEATURE_INCOMPAT_64BIT: u32 = 0x0000_0002;
pub const JBD2_FEATURE_INCOMPAT_ASYNC_COMMIT: u32 = 0x0000_0004;

const S_BLOCKSIZE: usize = 12;
const S_MAXLEN: usize = 16;
const S_FIRST: usize = 20;
const S_SEQUENCE: usize = 24;
const S_START: usize = 28;
const S_ERRNO: usize = 32;
const S_FEATURE_COMPAT: usize = 36;
const S_FEATURE_INCOMPAT: usize = 40;
const S_FEATURE_RO_COMPAT: usize = 44;
const S_UUID: usize = 48;
const S_NR_USERS: usize = 64;
const S_CHECKSUM_TYPE: usize = 80;
const SUPERBLOCK_SIZE: usize = 1024;

/// Journal superblock structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSuperblock {
    pub block_size: u32,
    /// Total log length in blocks
    pub maxlen: u32,
    /// First log block after the superblock
    pub first: u32,
    /// Sequence of the oldest transaction still in the log
    pub sequence: Tid,
    /// Block of that transaction; 0 means the log is empty
    pub start: u32,
    /// Non-zero once the journal aborted
    pub errno: i32,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; UUID_SIZE],
    pub checksum_type: u8,
}

impl JournalSuperblock {
    /// Superblock of a freshly formatted, empty log.
    pub fn new(config: &JournalConfig, uuid: [u8; UUID_SIZE]) -> Self {
        let mut feature_compat = 0;
        let mut feature_incompat = JBD2_FEATURE_INCOMPAT_REVOKE;
        if config.checksum != ChecksumKind::None {
            feature_compat |= JBD2_FEATURE_COMPAT_CHECKSUM;
        }
        if config.large_block {
            feature_incompat |= JBD2_FEATURE_INCOMPAT_64BIT;
        }
        if config.async_commit {
            feature_incompat |= JBD2_FEATURE_INCOMPAT_ASYNC_COMMIT;
        }
        Self {
            block_size: config.block_size as u32,
            maxlen: config.log_blocks as u32,
            first: config.log_first as u32,
            sequence: config.first_tid,
            start: 0,
            errno: 0,
            feature_compat,
            feature_incompat,
            feature_ro_compat: 0,
            uuid,
            checksum_type: commit_checksum_fields(config.checksum).0,
        }
    }

    pub fn is_empty_log(&self) -> bool {
        self.start == 0
    }

    pub fn has_incompat(&self, feature: u32) -> bool {
        self.feature_incompat & feature != 0
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        if self.feature_compat & JBD2_FEATURE_COMPAT_CHECKSUM == 0 {
            return ChecksumKind::None;
        }
        kind_from_type(self.checksum_type).unwrap_or(ChecksumKind::None)
    }

    /// Point the log start at the oldest live transaction, or mark the log
    /// empty when `start` is `None`.
    pub fn set_start(&mut self, start: Option<BlockNumber>, sequence: Tid) {
        self.start = start.map_or(0, |b| b as u32);
        self.sequence = sequence;
    }

    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size.max(SUPERBLOCK_SIZE)];
        JournalHeader::new(JBD2_SUPERBLOCK_V2, 0).encode(&mut buf);
        BigEndian::write_u32(&mut buf[S_BLOCKSIZE..], self.block_size);
        BigEndian::write_u32(&mut buf[S_MAXLEN..], self.maxlen);
        BigEndian::write_u32(&mut buf[S_FIRST..], self.first);
        BigEndian::write_u32(&mut buf[S_SEQUENCE..], self.sequence);
        BigEndian::write_u32(&mut buf[S_START..], self.start);
        BigEndian::write_i32(&mut buf[S_ERRNO..], self.errno);
        BigEndian::write_u32(&mut buf[S_FEATURE_COMPAT..], self.feature_compat);
        BigEndian::write_u32(&mut buf[S_FEATURE_INCOMPAT..], self.feature_incompat);
        BigEndian::write_u32(&mut buf[S_FEATURE_RO_COMPAT..], self.feature_ro_compat);
        buf[S_UUID..S_UUID + UUID_SIZE].copy_from_slice(&self.uuid);
        BigEndian::write_u32(&mut buf[S_NR_USERS..], 1);
        buf[S_CHECKSUM_TYPE] = self.checksum_type;
        buf.truncate(block_size);
        buf
    }

    pub fn decode(raw: &[u8]) -> JournalResult<Self> {
        if raw.len() < S_CHECKSUM_TYPE + 1 {
            return Err(JournalError::Corrupt("superblock truncated".to_string()));
        }
        let header = JournalHeader::decode(raw)?;
        if !header.is_valid() || header.block_type != JBD2_SUPERBLOCK_V2 {
            return Err(JournalError::Corrupt("invalid journal superblock".to_string()));
        }
        let mut uuid = [0u8; UUID_SIZE];
        uuid.copy_from_slice(&raw[S_UUID..S_UUID + UUID_SIZE]);
        Ok(Self {
            block_size: BigEndian::read_u32(&raw[S_BLOCKSIZE..]),
            maxlen: BigEndian::read_u32(&raw[S_MAXLEN..]),
            first: BigEndian::read_u32(&raw[S_FIRST..]),
            sequence: BigEndian::read_u32(&raw[S_SEQUENCE..]),
            start: BigEndian::read_u32(&raw[S_START..]),
            errno: BigEndian::read_i32(&raw[S_ERRNO..]),
            feature_compat: BigEndian::read_u32(&raw[S_FEATURE_COMPAT..]),
            feature_incompat: BigEndian::read_u32(&raw[S_FEATURE_INCOMPAT..]),
            feature_ro_compat: BigEndian::read_u32(&raw[S_FEATURE_RO_COMPAT..]),
            uuid,
            checksum_type: raw[S_CHECKSUM_TYPE],
        })
    }

    /// Check the stored geometry against the configuration used to open.
    pub fn check_geometry(&self, config: &JournalConfig) -> JournalResult<()> {
        if self.block_size as usize != config.block_size {
            return Err(JournalError::Configuration(format!(
                "log block size {} does not match configured {}",
                self.block_size, config.block_size
            )));
        }
        if self.maxlen as u64 != config.log_blocks || self.first as u64 != config.log_first {
            return Err(JournalError::Configuration(format!(
                "log geometry {}..{} does not match configured {}..{}",
                self.first, self.maxlen, config.log_first, config.log_blocks
            )));
        }
        if self.has_incompat(JBD2_FEATURE_INCOMPAT_64BIT) != config.large_block {
            return Err(JournalError::Configuration("64-bit tag setting differs from log".to_string()));
        }
        Ok(())
    }
}
