// Checkpoint Management
// Writes committed buffers to their home locations so log space can be reused

use jcommit_core::{JournalResult, Tid};
use std::thread;
use std::time::Instant;

use crate::buffer::{HeadId, LockAttempt, TxnRef};
use crate::device::write_block_sync;
use crate::journal::Journal;

/// Checkpoint statistics
#[derive(Debug, Default, Clone)]
pub struct CheckpointStats {
    /// Number of transactions whose checkpoint completed
    pub transactions_checkpointed: u64,
    /// Number of blocks written home
    pub blocks_written: u64,
    /// Log blocks released by advancing the tail
    pub log_blocks_released: u64,
    /// Time taken for checkpoint
    pub checkpoint_time_ms: u64,
}

/// Drop checkpoint entries whose buffers are clean and not owned by a
/// newer transaction, then drop finished transactions left with nothing
/// to checkpoint. Issues no I/O. Caller holds `checkpoint_lock`.
pub(crate) fn cleanup_checkpoint_locked(journal: &Journal) -> usize {
    let mut released: Vec<HeadId> = Vec::new();
    'rescan: loop {
        let mut lists = journal.lists.lock();
        let ring: Vec<TxnRef> = lists.checkpoint_ring.iter().copied().collect();
        for txn in ring {
            let entries: Vec<HeadId> = match lists.get(txn) {
                Some(t) => t.checkpoint.iter().copied().collect(),
                None => continue,
            };
            for id in entries {
                let Some(head) = journal.head(id) else {
                    if let Some(t) = lists.get_mut(txn) {
                        t.checkpoint.retain(|h| *h != id);
                    }
                    continue;
                };
                let mut hs = match head.try_lock() {
                    LockAttempt::Acquired(hs) => hs,
                    LockAttempt::Busy => {
                        drop(lists);
                        thread::yield_now();
                        continue 'rescan;
                    }
                };
                let buffer = head.buffer();
                if hs.transaction.is_none() && !buffer.is_dirty() && !buffer.is_io_locked() {
                    lists.remove_checkpoint(id, &mut hs);
                    released.push(id);
                }
            }
            if lists.get(txn).map_or(false, |t| t.checkpoint.is_empty()) {
                log::debug!("Checkpoint of transaction {} complete", lists.get(txn).map_or(0, |t| t.tid));
                lists.remove(txn);
            }
        }
        break;
    }

    let count = released.len();
    for id in released {
        journal.maybe_free_head(id);
    }
    count
}

enum Next {
    Done,
    /// Ring head transaction has nothing left; it was dropped
    Dropped,
    /// Buffer clean; entry removed
    Removed(HeadId),
    Write(HeadId),
    /// Buffer modified again by a transaction not yet committed
    WaitFor(Tid),
    Contended,
}

/// Walk the checkpoint ring from the oldest transaction, writing dirty
/// buffers home. With `wait` set, buffers re-journaled by a newer
/// transaction make the walker wait for that commit; otherwise the walk
/// stops there. Ends by advancing the log tail.
pub(crate) fn log_do_checkpoint(journal: &Journal, wait: bool) -> JournalResult<CheckpointStats> {
    let start = Instant::now();
    let _guard = journal.checkpoint_lock.lock();
    let mut stats = CheckpointStats::default();

    loop {
        journal.check_aborted()?;

        let next = {
            let mut lists = journal.lists.lock();
            match lists.checkpoint_ring.front().copied() {
                None => Next::Done,
                Some(txn) => match lists.get(txn).and_then(|t| t.checkpoint.front().copied()) {
                    None => {
                        lists.remove(txn);
                        Next::Dropped
                    }
                    Some(id) => match journal.head(id) {
                        None => {
                            lists.drop_checkpoint_entry(txn, id);
                            Next::Contended
                        }
                        Some(head) => match head.try_lock() {
                            LockAttempt::Busy => Next::Contended,
                            LockAttempt::Acquired(mut hs) => {
                                let buffer = head.buffer();
                                if let Some(owner) = hs.transaction {
                                    match lists.get(owner).map(|t| t.tid) {
                                        Some(tid) => Next::WaitFor(tid),
                                        None => Next::Contended,
                                    }
                                } else if buffer.is_dirty() || buffer.is_io_locked() {
                                    Next::Write(id)
                                } else {
                                    lists.remove_checkpoint(id, &mut hs);
                                    Next::Removed(id)
                                }
                            }
                        },
                    },
                },
            }
        };

        match next {
            Next::Done => break,
            Next::Dropped => stats.transactions_checkpointed += 1,
            Next::Removed(id) => journal.maybe_free_head(id),
            Next::Contended => thread::yield_now(),
            Next::WaitFor(tid) => {
                if !wait {
                    break;
                }
                journal.wait_for_transaction_durable(tid)?;
            }
            Next::Write(id) => {
                if write_home(journal, id)? {
                    stats.blocks_written += 1;
                }
            }
        }
    }

    if stats.blocks_written > 0 {
        journal.fs_device().flush()?;
        journal.stats.lock().checkpoint_writes += stats.blocks_written;
    }
    stats.log_blocks_released = update_log_tail(journal)?;
    stats.checkpoint_time_ms = start.elapsed().as_millis() as u64;
    if stats.blocks_written > 0 || stats.log_blocks_released > 0 {
        log::debug!(
            "Checkpoint: {} blocks written, {} transactions done, {} log blocks released",
            stats.blocks_written,
            stats.transactions_checkpointed,
            stats.log_blocks_released
        );
    }
    Ok(stats)
}

/// Write one checkpointed buffer to the filesystem device. Returns whether
/// a write was issued.
fn write_home(journal: &Journal, id: HeadId) -> JournalResult<bool> {
    let Some(head) = journal.head(id) else {
        return Ok(false);
    };
    let buffer = head.buffer().clone();
    buffer.lock_io();
    let data = {
        let hs = head.lock();
        let mut state = buffer.state();
        if hs.transaction.is_some() || !state.dirty {
            // journaled again since the scan, or already clean
            None
        } else {
            state.dirty = false;
            Some(state.data.clone())
        }
    };
    let Some(data) = data else {
        buffer.unlock_io();
        return Ok(false);
    };

    let result = write_block_sync(journal.fs_device(), buffer.blocknr(), data, false);
    buffer.unlock_io();
    if let Err(e) = result {
        buffer.mark_dirty();
        log::error!("Checkpoint write of block {} failed: {}", buffer.blocknr(), e);
        return Err(journal.abort_with(e));
    }
    Ok(true)
}

/// Move the log tail up to the oldest transaction still needed and record
/// it in the superblock. Returns the number of log blocks released.
pub(crate) fn update_log_tail(journal: &Journal) -> JournalResult<u64> {
    let state = journal.state.lock();
    let lists = journal.lists.lock();

    let oldest = lists
        .checkpoint_ring
        .front()
        .and_then(|t| lists.get(*t))
        .or_else(|| state.committing.and_then(|t| lists.get(t)))
        .and_then(|t| t.log_start.map(|start| (start, t.tid)));
    let next_sequence = state.commit_sequence.wrapping_add(1);
    drop(state);

    let mut sb = journal.superblock.lock();
    drop(lists);

    let (start, sequence) = match oldest {
        Some((start, tid)) => (Some(start), tid),
        None => (None, next_sequence),
    };
    let current = if sb.is_empty_log() { None } else { Some(sb.start as u64) };
    if current == start && sb.sequence == sequence {
        return Ok(0);
    }

    sb.set_start(start, sequence);
    journal.write_superblock(&sb)?;

    let released = {
        let mut log_space = journal.log_space.lock();
        match start {
            Some(tail) => log_space.release_to(tail),
            None => log_space.release_all(),
        }
    };
    log::debug!(
        "Log tail now {:?} (sequence {}), {} blocks released",
        start,
        sequence,
        released
    );
    Ok(released)
}
