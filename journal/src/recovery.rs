// Journal Recovery
// Scans the log for complete transactions after a crash and replays them

use jcommit_core::{BlockNumber, ChecksumKind, JournalResult, Tid};

use crate::checksum::{commit_checksum_fields, tag_checksum, RunningChecksum};
use crate::device::{write_block_sync, BlockDevice};
use crate::format::{
    parse_descriptor, unescape_block, BlockTag, CommitBlock, JournalHeader, JBD2_COMMIT_BLOCK,
    JBD2_DESCRIPTOR_BLOCK, JBD2_REVOKE_BLOCK,
};
use crate::superblock::{JournalSuperblock, JBD2_FEATURE_INCOMPAT_64BIT};

/// Block info during recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryBlock {
    /// Destination block number
    pub target: BlockNumber,
    /// Log block holding the logged copy
    pub log_block: BlockNumber,
    pub escaped: bool,
}

/// A transaction whose commit record was found and verified
#[derive(Debug, Clone)]
pub struct ScannedTransaction {
    pub tid: Tid,
    pub log_start: BlockNumber,
    pub descriptors: usize,
    pub blocks: Vec<RecoveryBlock>,
    pub commit: CommitBlock,
}

/// Result of scanning (and possibly replaying) a log
#[derive(Debug, Clone, Default)]
pub struct RecoveryInfo {
    /// Sequence of the first transaction in the log
    pub start_tid: Tid,
    /// First sequence after the last complete transaction
    pub next_tid: Tid,
    pub transactions: Vec<ScannedTransaction>,
    /// Sequence of a trailing transaction that was dropped, if any
    pub discarded: Option<Tid>,
    pub replayed_blocks: u64,
}

/// Why the scan stopped
#[derive(Debug)]
enum ScanEnd {
    /// No header of the expected sequence
    EndOfLog,
    /// A transaction without a valid commit record
    Incomplete,
}

/// Walk the log from the superblock's start, collecting every transaction
/// that ends in a valid commit record.
pub fn scan_log(log: &dyn BlockDevice, sb: &JournalSuperblock) -> JournalResult<RecoveryInfo> {
    let mut info = RecoveryInfo {
        start_tid: sb.sequence,
        next_tid: sb.sequence,
        ..Default::default()
    };
    if sb.is_empty_log() {
        return Ok(info);
    }

    let first = sb.first as u64;
    let last = sb.maxlen as u64;
    let wrap = |block: BlockNumber| if block + 1 >= last { first } else { block + 1 };
    let capacity = last - first;
    let kind = sb.checksum_kind();
    let large_block = sb.has_incompat(JBD2_FEATURE_INCOMPAT_64BIT);

    let mut block = sb.start as u64;
    let mut scanned = 0u64;
    let mut expected = sb.sequence;

    let end = 'log: loop {
        // one transaction per iteration
        let log_start = block;
        let mut checksum = RunningChecksum::new(kind);
        let mut blocks = Vec::new();
        let mut descriptors = 0;
        let mut tags_ok = true;
        let mut started = false;

        loop {
            let stop = if started { ScanEnd::Incomplete } else { ScanEnd::EndOfLog };
            if scanned >= capacity {
                break 'log stop;
            }
            let raw = log.read_block(block)?;
            let header = match JournalHeader::decode(&raw) {
                Ok(header) if header.is_valid() && header.sequence == expected => header,
                _ => break 'log stop,
            };

            match header.block_type {
                JBD2_DESCRIPTOR_BLOCK => {
                    let tags: Vec<BlockTag> = match parse_descriptor(&raw, large_block) {
                        Ok((_, tags)) => tags,
                        Err(e) => {
                            log::warn!("Bad descriptor at log block {}: {}", block, e);
                            break 'log ScanEnd::Incomplete;
                        }
                    };
                    started = true;
                    descriptors += 1;
                    checksum.update(&raw);
                    block = wrap(block);
                    scanned += 1;

                    for tag in tags {
                        if scanned >= capacity {
                            break 'log ScanEnd::Incomplete;
                        }
                        let data = log.read_block(block)?;
                        checksum.update(&data);
                        if kind != ChecksumKind::None && tag_checksum(kind, &sb.uuid, expected, &data) != tag.checksum {
                            tags_ok = false;
                        }
                        blocks.push(RecoveryBlock {
                            target: tag.target,
                            log_block: block,
                            escaped: tag.is_escaped(),
                        });
                        block = wrap(block);
                        scanned += 1;
                    }
                }
                JBD2_COMMIT_BLOCK => {
                    let commit = CommitBlock::decode(&raw)?;
                    block = wrap(block);
                    scanned += 1;
                    if kind != ChecksumKind::None {
                        let (checksum_type, _) = commit_checksum_fields(kind);
                        if commit.checksum_type != checksum_type || commit.checksum != checksum.value() || !tags_ok {
                            log::warn!("Checksum mismatch in transaction {}", expected);
                            break 'log ScanEnd::Incomplete;
                        }
                    }
                    info.transactions.push(ScannedTransaction {
                        tid: expected,
                        log_start,
                        descriptors,
                        blocks,
                        commit,
                    });
                    expected = expected.wrapping_add(1);
                    break;
                }
                JBD2_REVOKE_BLOCK => {
                    // not replayed; skip over it
                    started = true;
                    block = wrap(block);
                    scanned += 1;
                }
                other => {
                    log::warn!("Unexpected block type {} at log block {}", other, block);
                    break 'log ScanEnd::Incomplete;
                }
            }
        }
    };

    if let ScanEnd::Incomplete = end {
        log::info!("Discarding incomplete transaction {}", expected);
        info.discarded = Some(expected);
    }
    info.next_tid = expected;
    Ok(info)
}

/// Copy every logged block of the scanned transactions to its home
/// location, oldest first, so later versions win.
pub fn replay(log: &dyn BlockDevice, fs: &dyn BlockDevice, info: &mut RecoveryInfo) -> JournalResult<u64> {
    let mut replayed = 0;
    for txn in &info.transactions {
        for entry in &txn.blocks {
            let mut data = log.read_block(entry.log_block)?;
            if entry.escaped {
                unescape_block(&mut data);
            }
            write_block_sync(fs, entry.target, data, false)?;
            replayed += 1;
        }
    }
    if replayed > 0 {
        fs.flush()?;
    }
    info.replayed_blocks = replayed;
    Ok(replayed)
}

/// Scan, replay and mark the log empty.
pub fn recover(log: &dyn BlockDevice, fs: &dyn BlockDevice) -> JournalResult<RecoveryInfo> {
    let mut sb = JournalSuperblock::decode(&log.read_block(0)?)?;
    if sb.errno != 0 {
        log::warn!("Journal was aborted (errno {}); recovering committed transactions", sb.errno);
    }

    let mut info = scan_log(log, &sb)?;
    replay(log, fs, &mut info)?;

    sb.set_start(None, info.next_tid);
    sb.errno = 0;
    write_block_sync(log, 0, sb.encode(log.block_size()), false)?;
    log.flush()?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::{escape_block, DescriptorBuilder, JBD2_MAGIC_NUMBER};
    use byteorder::{BigEndian, ByteOrder};
    use jcommit_core::JournalConfig;

    const BS: usize = 1024;

    fn config() -> JournalConfig {
        JournalConfig {
            block_size: BS,
            log_blocks: 32,
            ..Default::default()
        }
    }

    /// Lay out one transaction by hand: descriptor, blocks, commit.
    fn write_txn(log: &MemoryDevice, at: u64, tid: Tid, targets: &[(u64, Vec<u8>)], commit: bool) -> u64 {
        let mut builder = DescriptorBuilder::new(BS, tid, [1u8; 16], false);
        let mut block = at + 1;
        for (target, data) in targets {
            let mut data = data.clone();
            let escaped = escape_block(&mut data);
            builder.push(*target, 0, escaped).unwrap();
            log.poke(block, data);
            block += 1;
        }
        log.poke(at, builder.finish());
        if commit {
            let record = CommitBlock {
                sequence: tid,
                checksum_type: 0,
                checksum_size: 0,
                checksum: 0,
                commit_sec: 0,
                commit_nsec: 0,
            };
            log.poke(block, record.encode(BS));
            block += 1;
        }
        block
    }

    #[test]
    fn test_empty_log() {
        let log = MemoryDevice::new(BS);
        let sb = JournalSuperblock::new(&config(), [1u8; 16]);
        let info = scan_log(&log, &sb).unwrap();
        assert!(info.transactions.is_empty());
        assert_eq!(info.next_tid, 1);
    }

    #[test]
    fn test_scan_stops_at_incomplete_transaction() {
        let log = MemoryDevice::new(BS);
        let mut sb = JournalSuperblock::new(&config(), [1u8; 16]);
        sb.set_start(Some(1), 5);

        let next = write_txn(&log, 1, 5, &[(100, vec![1u8; BS])], true);
        write_txn(&log, next, 6, &[(101, vec![2u8; BS])], false);

        let info = scan_log(&log, &sb).unwrap();
        assert_eq!(info.transactions.len(), 1);
        assert_eq!(info.transactions[0].tid, 5);
        assert_eq!(info.discarded, Some(6));
        assert_eq!(info.next_tid, 6);
    }

    #[test]
    fn test_replay_unescapes() {
        let log = MemoryDevice::new(BS);
        let fs = MemoryDevice::new(BS);
        let mut sb = JournalSuperblock::new(&config(), [1u8; 16]);
        sb.set_start(Some(1), 1);
        log.poke(0, sb.encode(BS));

        let mut magic_block = vec![3u8; BS];
        BigEndian::write_u32(&mut magic_block[0..4], JBD2_MAGIC_NUMBER);
        write_txn(&log, 1, 1, &[(7, magic_block.clone()), (8, vec![4u8; BS])], true);

        let info = recover(&log, &fs).unwrap();
        assert_eq!(info.replayed_blocks, 2);
        assert_eq!(fs.block(7).unwrap(), magic_block);
        assert_eq!(fs.block(8).unwrap(), vec![4u8; BS]);

        let sb = JournalSuperblock::decode(&log.read_block(0).unwrap()).unwrap();
        assert!(sb.is_empty_log());
        assert_eq!(sb.sequence, 2);
    }

    #[test]
    fn test_later_transaction_wins() {
        let log = MemoryDevice::new(BS);
        let fs = MemoryDevice::new(BS);
        let mut sb = JournalSuperblock::new(&config(), [1u8; 16]);
        sb.set_start(Some(1), 1);
        log.poke(0, sb.encode(BS));

        let next = write_txn(&log, 1, 1, &[(9, vec![1u8; BS])], true);
        write_txn(&log, next, 2, &[(9, vec![2u8; BS])], true);

        let info = recover(&log, &fs).unwrap();
        assert_eq!(info.transactions.len(), 2);
        assert_eq!(fs.block(9).unwrap(), vec![2u8; BS]);
    }
}
