// JBD2 On-Disk Record Formats
// Block headers, descriptor tags and commit records. All fields big-endian.

use byteorder::{BigEndian, ByteOrder};
use jcommit_core::{BlockNumber, JournalError, JournalResult, Tid};
use static_assertions::const_assert;

/// JBD2 magic number
pub const JBD2_MAGIC_NUMBER: u32 = 0xC03B3998;

/// JBD2 block types
pub const JBD2_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD2_COMMIT_BLOCK: u32 = 2;
pub const JBD2_SUPERBLOCK_V1: u32 = 3;
pub const JBD2_SUPERBLOCK_V2: u32 = 4;
pub const JBD2_REVOKE_BLOCK: u32 = 5;

/// Journal descriptor flags
pub const JBD2_FLAG_ESCAPE: u16 = 1;
pub const JBD2_FLAG_SAME_UUID: u16 = 2;
pub const JBD2_FLAG_DELETED: u16 = 4;
pub const JBD2_FLAG_LAST_TAG: u16 = 8;

/// Checksum types stored in commit blocks
pub const JBD2_CRC32_CHKSUM: u8 = 1;
pub const JBD2_CRC32C_CHKSUM: u8 = 4;
pub const JBD2_CRC32_CHKSUM_SIZE: u8 = 4;

pub const HEADER_SIZE: usize = 12;
pub const UUID_SIZE: usize = 16;

/// Commit header: header, type, size, padding, 8 checksum words, sec, nsec
pub const COMMIT_HEADER_SIZE: usize = 60;
const COMMIT_CHKSUM_TYPE: usize = 12;
const COMMIT_CHKSUM_SIZE: usize = 13;
const COMMIT_CHKSUM: usize = 16;
const COMMIT_SEC: usize = 48;
const COMMIT_NSEC: usize = 56;

pub const MIN_BLOCK_SIZE: usize = 1024;
const_assert!(COMMIT_HEADER_SIZE <= MIN_BLOCK_SIZE);

/// Common header of every journal metadata block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub block_type: u32,
    pub sequence: Tid,
}

impl JournalHeader {
    pub fn new(block_type: u32, sequence: Tid) -> Self {
        Self {
            magic: JBD2_MAGIC_NUMBER,
            block_type,
            sequence,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.block_type);
        BigEndian::write_u32(&mut buf[8..12], self.sequence);
    }

    pub fn decode(buf: &[u8]) -> JournalResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JournalError::Corrupt("block shorter than header".to_string()));
        }
        Ok(Self {
            magic: BigEndian::read_u32(&buf[0..4]),
            block_type: BigEndian::read_u32(&buf[4..8]),
            sequence: BigEndian::read_u32(&buf[8..12]),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.magic == JBD2_MAGIC_NUMBER
    }
}

/// One entry of a descriptor block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    pub target: BlockNumber,
    pub checksum: u16,
    pub flags: u16,
}

impl BlockTag {
    pub fn is_escaped(&self) -> bool {
        self.flags & JBD2_FLAG_ESCAPE != 0
    }

    pub fn same_uuid(&self) -> bool {
        self.flags & JBD2_FLAG_SAME_UUID != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & JBD2_FLAG_LAST_TAG != 0
    }
}

fn tag_bytes(large_block: bool) -> usize {
    if large_block {
        12
    } else {
        8
    }
}

/// Tags that fit in one descriptor block.
pub fn descriptor_capacity(block_size: usize, large_block: bool) -> usize {
    block_size.saturating_sub(HEADER_SIZE + UUID_SIZE) / tag_bytes(large_block)
}

/// Incrementally packs tags into a descriptor block.
///
/// The log UUID follows the first tag only; later tags carry
/// `JBD2_FLAG_SAME_UUID`. `finish` sets `JBD2_FLAG_LAST_TAG` on the final tag.
pub struct DescriptorBuilder {
    buf: Vec<u8>,
    offset: usize,
    large_block: bool,
    uuid: [u8; UUID_SIZE],
    tags: Vec<BlockTag>,
    last_flags_at: Option<usize>,
}

impl DescriptorBuilder {
    pub fn new(block_size: usize, sequence: Tid, uuid: [u8; UUID_SIZE], large_block: bool) -> Self {
        let mut buf = vec![0u8; block_size];
        JournalHeader::new(JBD2_DESCRIPTOR_BLOCK, sequence).encode(&mut buf);
        Self {
            buf,
            offset: HEADER_SIZE,
            large_block,
            uuid,
            tags: Vec::new(),
            last_flags_at: None,
        }
    }

    fn needed(&self) -> usize {
        tag_bytes(self.large_block) + if self.tags.is_empty() { UUID_SIZE } else { 0 }
    }

    /// Whether one more tag fits in this block.
    pub fn has_room(&self) -> bool {
        self.offset + self.needed() <= self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[BlockTag] {
        &self.tags
    }

    pub fn push(&mut self, target: BlockNumber, checksum: u16, escaped: bool) -> JournalResult<BlockTag> {
        if !self.has_room() {
            return Err(JournalError::Other("descriptor block is full".to_string()));
        }
        if !self.large_block && target > u32::MAX as u64 {
            return Err(JournalError::InvalidInput(format!(
                "block {} needs 64-bit tags",
                target
            )));
        }

        let first = self.tags.is_empty();
        let mut flags = 0u16;
        if escaped {
            flags |= JBD2_FLAG_ESCAPE;
        }
        if !first {
            flags |= JBD2_FLAG_SAME_UUID;
        }

        let off = self.offset;
        BigEndian::write_u32(&mut self.buf[off..off + 4], target as u32);
        BigEndian::write_u16(&mut self.buf[off + 4..off + 6], checksum);
        BigEndian::write_u16(&mut self.buf[off + 6..off + 8], flags);
        self.last_flags_at = Some(off + 6);
        self.offset += 8;
        if self.large_block {
            BigEndian::write_u32(&mut self.buf[self.offset..self.offset + 4], (target >> 32) as u32);
            self.offset += 4;
        }
        if first {
            self.buf[self.offset..self.offset + UUID_SIZE].copy_from_slice(&self.uuid);
            self.offset += UUID_SIZE;
        }

        let tag = BlockTag {
            target,
            checksum,
            flags,
        };
        self.tags.push(tag);
        Ok(tag)
    }

    /// Seal the block, marking the final tag, and return its bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if let (Some(at), Some(last)) = (self.last_flags_at, self.tags.last_mut()) {
            last.flags |= JBD2_FLAG_LAST_TAG;
            BigEndian::write_u16(&mut self.buf[at..at + 2], last.flags);
        }
        self.buf
    }
}

/// Decode the tags of a descriptor block.
pub fn parse_descriptor(raw: &[u8], large_block: bool) -> JournalResult<(JournalHeader, Vec<BlockTag>)> {
    let header = JournalHeader::decode(raw)?;
    if !header.is_valid() || header.block_type != JBD2_DESCRIPTOR_BLOCK {
        return Err(JournalError::Corrupt("not a descriptor block".to_string()));
    }

    let size = tag_bytes(large_block);
    let mut tags = Vec::new();
    let mut off = HEADER_SIZE;
    while off + size <= raw.len() {
        let low = BigEndian::read_u32(&raw[off..off + 4]) as u64;
        let checksum = BigEndian::read_u16(&raw[off + 4..off + 6]);
        let flags = BigEndian::read_u16(&raw[off + 6..off + 8]);
        let high = if large_block {
            BigEndian::read_u32(&raw[off + 8..off + 12]) as u64
        } else {
            0
        };
        off += size;

        if flags & JBD2_FLAG_SAME_UUID == 0 {
            if off + UUID_SIZE > raw.len() {
                return Err(JournalError::Corrupt("descriptor tag truncated uuid".to_string()));
            }
            off += UUID_SIZE;
        }

        let tag = BlockTag {
            target: (high << 32) | low,
            checksum,
            flags,
        };
        tags.push(tag);
        if tag.is_last() {
            break;
        }
    }

    if tags.is_empty() {
        return Err(JournalError::Corrupt("descriptor has no tags".to_string()));
    }
    Ok((header, tags))
}

/// Zero a leading magic number so replay cannot mistake the block for a
/// journal header. Returns whether the block was escaped.
pub fn escape_block(data: &mut [u8]) -> bool {
    if data.len() >= 4 && BigEndian::read_u32(&data[0..4]) == JBD2_MAGIC_NUMBER {
        data[0..4].fill(0);
        true
    } else {
        false
    }
}

pub fn unescape_block(data: &mut [u8]) {
    BigEndian::write_u32(&mut data[0..4], JBD2_MAGIC_NUMBER);
}

/// Terminating record of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitBlock {
    pub sequence: Tid,
    pub checksum_type: u8,
    pub checksum_size: u8,
    pub checksum: u32,
    pub commit_sec: u64,
    pub commit_nsec: u32,
}

impl CommitBlock {
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        JournalHeader::new(JBD2_COMMIT_BLOCK, self.sequence).encode(&mut buf);
        buf[COMMIT_CHKSUM_TYPE] = self.checksum_type;
        buf[COMMIT_CHKSUM_SIZE] = self.checksum_size;
        BigEndian::write_u32(&mut buf[COMMIT_CHKSUM..COMMIT_CHKSUM + 4], self.checksum);
        BigEndian::write_u64(&mut buf[COMMIT_SEC..COMMIT_SEC + 8], self.commit_sec);
        BigEndian::write_u32(&mut buf[COMMIT_NSEC..COMMIT_NSEC + 4], self.commit_nsec);
        buf
    }

    pub fn decode(raw: &[u8]) -> JournalResult<Self> {
        let header = JournalHeader::decode(raw)?;
        if !header.is_valid() || header.block_type != JBD2_COMMIT_BLOCK {
            return Err(JournalError::Corrupt("not a commit block".to_string()));
        }
        if raw.len() < COMMIT_HEADER_SIZE {
            return Err(JournalError::Corrupt("commit block truncated".to_string()));
        }
        Ok(Self {
            sequence: header.sequence,
            checksum_type: raw[COMMIT_CHKSUM_TYPE],
            checksum_size: raw[COMMIT_CHKSUM_SIZE],
            checksum: BigEndian::read_u32(&raw[COMMIT_CHKSUM..COMMIT_CHKSUM + 4]),
            commit_sec: BigEndian::read_u64(&raw[COMMIT_SEC..COMMIT_SEC + 8]),
            commit_nsec: BigEndian::read_u32(&raw[COMMIT_NSEC..COMMIT_NSEC + 4]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: [u8; 16] = [7u8; 16];

    #[test]
    fn test_header_layout() {
        let mut buf = [0u8; 12];
        JournalHeader::new(JBD2_COMMIT_BLOCK, 0x0102_0304).encode(&mut buf);
        assert_eq!(&buf[0..4], &[0xC0, 0x3B, 0x39, 0x98]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 2]);
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_uuid_only_after_first_tag() {
        let mut builder = DescriptorBuilder::new(1024, 9, UUID, false);
        builder.push(100, 0, false).unwrap();
        builder.push(200, 0, true).unwrap();
        let raw = builder.finish();

        // header, first tag, uuid, second tag
        assert_eq!(&raw[20..36], &UUID);
        assert_eq!(BigEndian::read_u32(&raw[36..40]), 200);

        let (header, tags) = parse_descriptor(&raw, false).unwrap();
        assert_eq!(header.sequence, 9);
        assert_eq!(tags.len(), 2);
        assert!(!tags[0].same_uuid());
        assert!(!tags[0].is_last());
        assert!(tags[1].same_uuid());
        assert!(tags[1].is_escaped());
        assert!(tags[1].is_last());
    }

    #[test]
    fn test_large_block_tags() {
        let mut builder = DescriptorBuilder::new(1024, 3, UUID, true);
        builder.push(0x1_0000_0001, 0xBEEF, false).unwrap();
        let (_, tags) = parse_descriptor(&builder.finish(), true).unwrap();
        assert_eq!(tags[0].target, 0x1_0000_0001);
        assert_eq!(tags[0].checksum, 0xBEEF);
    }

    #[test]
    fn test_small_tags_reject_high_blocks() {
        let mut builder = DescriptorBuilder::new(1024, 3, UUID, false);
        assert!(builder.push(1 << 33, 0, false).is_err());
    }

    #[test]
    fn test_descriptor_capacity() {
        // (1024 - 12 - 16) / 8 tags fit with small tags
        let mut builder = DescriptorBuilder::new(1024, 1, UUID, false);
        let mut count = 0;
        while builder.has_room() {
            builder.push(count, 0, false).unwrap();
            count += 1;
        }
        assert_eq!(count, 124);
        let (_, tags) = parse_descriptor(&builder.finish(), false).unwrap();
        assert_eq!(tags.len(), 124);
        assert!(tags[123].is_last());
    }

    #[test]
    fn test_escape() {
        let mut data = vec![0u8; 64];
        BigEndian::write_u32(&mut data[0..4], JBD2_MAGIC_NUMBER);
        data[4] = 0xAA;
        assert!(escape_block(&mut data));
        assert_eq!(&data[0..4], &[0, 0, 0, 0]);
        assert!(!escape_block(&mut data));
        unescape_block(&mut data);
        assert_eq!(BigEndian::read_u32(&data[0..4]), JBD2_MAGIC_NUMBER);
        assert_eq!(data[4], 0xAA);
    }

    #[test]
    fn test_commit_block_layout() {
        let record = CommitBlock {
            sequence: 5,
            checksum_type: JBD2_CRC32C_CHKSUM,
            checksum_size: JBD2_CRC32_CHKSUM_SIZE,
            checksum: 0xDEAD_BEEF,
            commit_sec: 1_700_000_000,
            commit_nsec: 42,
        };
        let raw = record.encode(1024);
        assert_eq!(raw[12], JBD2_CRC32C_CHKSUM);
        assert_eq!(raw[13], 4);
        assert_eq!(BigEndian::read_u32(&raw[16..20]), 0xDEAD_BEEF);
        assert_eq!(CommitBlock::decode(&raw).unwrap(), record);
    }

    #[test]
    fn test_wrong_block_type_rejected() {
        let record = CommitBlock {
            sequence: 1,
            checksum_type: 0,
            checksum_size: 0,
            checksum: 0,
            commit_sec: 0,
            commit_nsec: 0,
        };
        assert!(parse_descriptor(&record.encode(1024), false).is_err());
    }
}
