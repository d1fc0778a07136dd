// JBD2 Commit Engine
// Writes the running transaction to the log: ordered data flush, metadata
// logging, commit record, completion and checkpoint hand-off

use jcommit_core::{BlockNumber, JournalError, JournalResult, Tid};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::buffer::{BlockBuffer, BufferList, HeadId, HeadState, JournalHead, LockAttempt, TxnRef};
use crate::checkpoint;
use crate::checksum::{commit_checksum_fields, tag_checksum, RunningChecksum};
use crate::device::{IoCompletion, IoStatus, WriteRequest};
use crate::format::{escape_block, CommitBlock, DescriptorBuilder};
use crate::journal::Journal;
use crate::transaction::{TransactionRunStats, TransactionState, TransactionTable};

/// A submitted log write
struct LogWrite {
    block: BlockNumber,
    done: IoCompletion,
    /// Buffer whose snapshot this is; `None` for descriptor blocks
    head: Option<HeadId>,
}

/// A submitted ordered-mode data write; the buffer's I/O lock is held
/// until the write is waited for.
struct DataWrite {
    buffer: Arc<BlockBuffer>,
    done: IoCompletion,
}

/// Snapshot waiting for its descriptor block to fill
struct PendingShadow {
    head: HeadId,
    log_block: BlockNumber,
    data: Vec<u8>,
}

struct OpenDescriptor {
    block: BlockNumber,
    builder: DescriptorBuilder,
    shadows: Vec<PendingShadow>,
}

struct PendingCommit {
    block: BlockNumber,
    raw: Vec<u8>,
    done: IoCompletion,
}

/// Commit the running transaction.
///
/// Returns the sequence number of the transaction made durable, `None` if
/// nothing was running, or the first error that aborted the journal. Once
/// the journal is aborted every call discards the running transaction
/// without logging it.
pub fn commit_transaction(journal: &Journal) -> JournalResult<Option<Tid>> {
    let _commit = journal.commit_lock.lock();

    let (txn, tid) = {
        let mut state = journal.state.lock();
        let lists = journal.lists.lock();
        let Some(txn) = state.running else {
            return Ok(None);
        };
        let Some(tid) = lists.get(txn).map(|t| t.tid) else {
            drop(lists);
            state.running = None;
            return Ok(None);
        };
        drop(lists);
        state.running = None;
        state.committing = Some(txn);
        (txn, tid)
    };

    log::debug!("JBD2: starting commit of transaction {}", tid);
    let mut commit = Commit::new(journal, txn, tid);
    commit.run();
    commit.finish()
}

struct Commit<'a> {
    journal: &'a Journal,
    txn: TxnRef,
    tid: Tid,
    checksum: RunningChecksum,
    data_writes: Vec<DataWrite>,
    shadow_writes: Vec<LogWrite>,
    ctl_writes: Vec<LogWrite>,
    commit_write: Option<PendingCommit>,
    error: Option<JournalError>,
    blocks_logged: u32,
    data_blocks: u32,
}

impl<'a> Commit<'a> {
    fn new(journal: &'a Journal, txn: TxnRef, tid: Tid) -> Self {
        Self {
            journal,
            txn,
            tid,
            checksum: RunningChecksum::new(journal.config().checksum),
            data_writes: Vec::new(),
            shadow_writes: Vec::new(),
            ctl_writes: Vec::new(),
            commit_write: None,
            error: None,
            blocks_logged: 0,
            data_blocks: 0,
        }
    }

    fn run(&mut self) {
        self.wait_for_updates();
        self.prepare_flush();
        self.flush_data();

        if !self.journal.is_aborted() {
            self.mark_log_start();
        }
        if !self.journal.is_aborted() {
            self.log_metadata();
        }

        let async_commit = self.journal.config().async_commit;
        if async_commit {
            self.submit_commit_record();
        }
        self.wait_log_io();
        if !async_commit {
            self.submit_commit_record();
        }
        self.wait_commit_record();

        if self.journal.is_aborted() {
            self.release_unlogged();
        }
        self.process_forget();
    }

    /// Keep the first error and abort the journal with it.
    fn fail(&mut self, err: JournalError) {
        log::error!("JBD2: commit of transaction {} failed: {}", self.tid, err);
        let errno = err.errno();
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.journal.abort(errno);
    }

    fn set_state(&self, state: TransactionState) {
        let mut lists = self.journal.lists.lock();
        if let Some(t) = lists.get_mut(self.txn) {
            t.state = state;
            let now = Some(Instant::now());
            match state {
                TransactionState::Running => {}
                TransactionState::Locked => t.times.locked = now,
                TransactionState::Flush => t.times.flush = now,
                TransactionState::Commit => t.times.logging = now,
                TransactionState::Finished => t.times.finished = now,
            }
        }
    }

    /// Lock the first head on `list` and run `f` with the list lock and
    /// the head lock held. A contended head makes the scan drop the list
    /// lock, yield and start over. Returns `None` once the list is empty.
    /// `f` must take the head off `list`.
    fn scan_front<R>(
        &self,
        list: BufferList,
        mut f: impl FnMut(&mut TransactionTable, HeadId, &JournalHead, &mut HeadState) -> R,
    ) -> Option<R> {
        loop {
            let mut lists = self.journal.lists.lock();
            let id = *lists.get(self.txn)?.list(list)?.front()?;
            let Some(head) = self.journal.head(id) else {
                lists.drop_entry(self.txn, list, id);
                continue;
            };
            let mut hs = match head.try_lock() {
                LockAttempt::Acquired(hs) => hs,
                LockAttempt::Busy => {
                    drop(lists);
                    thread::yield_now();
                    continue;
                }
            };
            return Some(f(&mut lists, id, &head, &mut hs));
        }
    }

    // Phase 1: no new handles; wait for the open ones to stop
    fn wait_for_updates(&mut self) {
        self.set_state(TransactionState::Locked);
        let mut lists = self.journal.lists.lock();
        while lists.get(self.txn).map_or(false, |t| t.updates > 0) {
            self.journal.updates_done.wait(&mut lists);
        }
    }

    // Phase 2: drop unused reservations and clean checkpoint entries,
    // then retire the revoke table
    fn prepare_flush(&mut self) {
        while let Some(id) = self.scan_front(BufferList::Reserved, |lists, id, head, hs| {
            lists.refile_head(id, hs, head.buffer());
            id
        }) {
            self.journal.maybe_free_head(id);
        }

        if let Some(_guard) = self.journal.checkpoint_lock.try_lock() {
            checkpoint::cleanup_checkpoint_locked(self.journal);
        }

        let revoked = self.journal.revoke_table().switch_table();
        self.set_state(TransactionState::Flush);
        log::debug!(
            "JBD2: transaction {} flushing ({} revoke records)",
            self.tid,
            revoked.len()
        );
    }

    // Ordered mode: data must be on disk before metadata naming it is logged
    fn flush_data(&mut self) {
        if !self.journal.config().mode.flushes_data() {
            return;
        }

        enum Step {
            Queued(Arc<BlockBuffer>),
            Released(HeadId),
            Contended(Arc<BlockBuffer>),
        }

        let max_batch = self.journal.config().max_data_batch;
        let txn = self.txn;
        let mut batch: Vec<Arc<BlockBuffer>> = Vec::new();
        loop {
            let aborted = self.journal.is_aborted();
            let step = self.scan_front(BufferList::SyncData, |lists, id, head, hs| {
                let buffer = head.buffer();
                if aborted || !buffer.is_dirty() {
                    lists.refile_head(id, hs, buffer);
                    return Step::Released(id);
                }
                if !buffer.try_lock_io() {
                    return Step::Contended(buffer.clone());
                }
                lists.file_head(id, hs, txn, BufferList::Locked);
                Step::Queued(buffer.clone())
            });

            match step {
                None => break,
                Some(Step::Queued(buffer)) => {
                    batch.push(buffer);
                    if batch.len() >= max_batch {
                        self.submit_data(&mut batch);
                    }
                }
                Some(Step::Released(id)) => self.journal.maybe_free_head(id),
                Some(Step::Contended(buffer)) => {
                    // someone else is writing it; push ours out, then wait
                    self.submit_data(&mut batch);
                    buffer.lock_io();
                    buffer.unlock_io();
                }
            }
        }
        self.submit_data(&mut batch);
        self.wait_data();
    }

    fn submit_data(&mut self, batch: &mut Vec<Arc<BlockBuffer>>) {
        for buffer in batch.drain(..) {
            let data = {
                let mut state = buffer.state();
                state.dirty = false;
                state.data.clone()
            };
            let done = IoCompletion::new();
            self.journal.fs_device().submit_write(
                WriteRequest {
                    block: buffer.blocknr(),
                    data,
                    barrier: false,
                },
                done.clone(),
            );
            self.data_writes.push(DataWrite { buffer, done });
        }
    }

    fn wait_data(&mut self) {
        let mut failed = None;
        for write in std::mem::take(&mut self.data_writes) {
            let status = write.done.wait();
            write.buffer.unlock_io();
            if status == IoStatus::Complete {
                self.data_blocks += 1;
            } else {
                write.buffer.mark_dirty();
                failed.get_or_insert(write.buffer.blocknr());
            }
        }

        while let Some(id) = self.scan_front(BufferList::Locked, |lists, id, head, hs| {
            lists.refile_head(id, hs, head.buffer());
            id
        }) {
            self.journal.maybe_free_head(id);
        }

        if let Some(block) = failed {
            self.fail(JournalError::IoFailed { block });
        }
    }

    /// Record where this transaction starts in the log. An empty log gets
    /// its superblock pointed here before anything is written.
    fn mark_log_start(&mut self) {
        let journal = self.journal;
        let mut lists = journal.lists.lock();
        let start = journal.log_space.lock().head();
        if let Some(t) = lists.get_mut(self.txn) {
            t.log_start = Some(start);
        }
        let mut sb = journal.superblock.lock();
        drop(lists);
        if !sb.is_empty_log() {
            return;
        }
        sb.set_start(Some(start), self.tid);
        let result = journal.write_superblock(&sb);
        drop(sb);
        if let Err(e) = result {
            self.fail(e);
        }
    }

    // Phase 3: shadow every metadata buffer into the log behind descriptor blocks
    fn log_metadata(&mut self) {
        self.set_state(TransactionState::Commit);

        let journal = self.journal;
        let config = journal.config();
        let kind = config.checksum;
        let uuid = journal.uuid();
        let (block_size, large_block, batch_size) = (config.block_size, config.large_block, config.batch_size);
        let (txn, tid) = (self.txn, self.tid);

        let mut open: Option<OpenDescriptor> = None;
        loop {
            if journal.is_aborted() {
                break;
            }
            let step = self.scan_front(BufferList::Metadata, |lists, id, head, hs| -> JournalResult<()> {
                let desc = match open.as_mut() {
                    Some(desc) => desc,
                    None => open.insert(OpenDescriptor {
                        block: journal.next_log_block()?,
                        builder: DescriptorBuilder::new(block_size, tid, uuid, large_block),
                        shadows: Vec::new(),
                    }),
                };
                let log_block = journal.next_log_block()?;

                let buffer = head.buffer();
                let mut data = match &hs.frozen_data {
                    Some(frozen) => frozen.clone(),
                    None => buffer.data(),
                };
                let escaped = escape_block(&mut data);
                let tag_csum = tag_checksum(kind, &uuid, tid, &data);
                desc.builder.push(buffer.blocknr(), tag_csum, escaped)?;

                lists.file_head(id, hs, txn, BufferList::Shadow);
                if let Some(t) = lists.get_mut(txn) {
                    t.outstanding_credits = t.outstanding_credits.saturating_sub(1);
                }
                desc.shadows.push(PendingShadow {
                    head: id,
                    log_block,
                    data,
                });
                Ok(())
            });

            match step {
                None => break,
                Some(Err(e)) => {
                    self.fail(e);
                    break;
                }
                Some(Ok(())) => {
                    let full = open
                        .as_ref()
                        .map_or(false, |d| d.shadows.len() >= batch_size || !d.builder.has_room());
                    if full {
                        if let Some(desc) = open.take() {
                            self.submit_descriptor(desc);
                        }
                    }
                }
            }
        }

        if let Some(desc) = open.take() {
            if !journal.is_aborted() {
                self.submit_descriptor(desc);
            }
        }
    }

    fn submit_log(&self, block: BlockNumber, data: Vec<u8>, barrier: bool) -> IoCompletion {
        let done = IoCompletion::new();
        self.journal
            .log_device()
            .submit_write(WriteRequest { block, data, barrier }, done.clone());
        done
    }

    fn submit_descriptor(&mut self, desc: OpenDescriptor) {
        let raw = desc.builder.finish();
        self.checksum.update(&raw);
        let done = self.submit_log(desc.block, raw, false);
        self.ctl_writes.push(LogWrite {
            block: desc.block,
            done,
            head: None,
        });
        self.blocks_logged += 1;

        for shadow in desc.shadows {
            self.checksum.update(&shadow.data);
            let done = self.submit_log(shadow.log_block, shadow.data, false);
            self.shadow_writes.push(LogWrite {
                block: shadow.log_block,
                done,
                head: Some(shadow.head),
            });
            self.blocks_logged += 1;
        }
    }

    // Phase 4: wait for the log writes, newest first
    fn wait_log_io(&mut self) {
        let mut failed = None;
        for write in std::mem::take(&mut self.shadow_writes).into_iter().rev() {
            if write.done.wait() != IoStatus::Complete {
                failed.get_or_insert(write.block);
            }
            if let Some(id) = write.head {
                self.unshadow(id);
            }
        }
        for write in std::mem::take(&mut self.ctl_writes).into_iter().rev() {
            if write.done.wait() != IoStatus::Complete {
                failed.get_or_insert(write.block);
            }
        }
        if let Some(block) = failed {
            self.fail(JournalError::IoFailed { block });
        }
    }

    /// The snapshot reached the log: move the buffer to Forget and wake
    /// writers waiting to modify it.
    fn unshadow(&self, id: HeadId) {
        let Some(head) = self.journal.head(id) else {
            return;
        };
        {
            let mut hs = head.lock();
            let mut lists = self.journal.lists.lock();
            if hs.transaction == Some(self.txn) && hs.jlist == BufferList::Shadow {
                lists.file_head(id, &mut hs, self.txn, BufferList::Forget);
            }
        }
        head.notify_changed();
    }

    // Phase 5: the commit record
    fn submit_commit_record(&mut self) {
        if self.journal.is_aborted() {
            return;
        }
        let block = match self.journal.next_log_block() {
            Ok(block) => block,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let (checksum_type, checksum_size) = commit_checksum_fields(self.checksum.kind());
        let now = chrono::Utc::now();
        let record = CommitBlock {
            sequence: self.tid,
            checksum_type,
            checksum_size,
            checksum: self.checksum.value(),
            commit_sec: now.timestamp().max(0) as u64,
            commit_nsec: now.timestamp_subsec_nanos(),
        };
        let raw = record.encode(self.journal.config().block_size);
        let done = self.submit_log(block, raw.clone(), self.journal.barrier_enabled());
        self.commit_write = Some(PendingCommit { block, raw, done });
        self.blocks_logged += 1;
    }

    fn wait_commit_record(&mut self) {
        let Some(pending) = self.commit_write.take() else {
            return;
        };
        let mut status = pending.done.wait();
        if status == IoStatus::BarrierNotSupported {
            if !self.journal.barrier_warned.swap(true, Ordering::SeqCst) {
                log::warn!("JBD2: barrier-based sync failed on log device - disabling barriers");
            }
            self.journal.disable_barrier();
            self.journal.stats.lock().barrier_downgrades += 1;
            status = self.submit_log(pending.block, pending.raw, false).wait();
        }
        if status != IoStatus::Complete {
            self.fail(JournalError::IoFailed { block: pending.block });
        }
    }

    /// After an abort: put back every buffer that never reached the log.
    fn release_unlogged(&mut self) {
        for list in [
            BufferList::Reserved,
            BufferList::SyncData,
            BufferList::Locked,
            BufferList::Metadata,
            BufferList::Shadow,
        ] {
            while let Some(id) = self.scan_front(list, |lists, id, head, hs| {
                let buffer = head.buffer();
                buffer.state().jdirty = false;
                hs.frozen_data = None;
                let was_shadow = hs.jlist == BufferList::Shadow;
                lists.refile_head(id, hs, buffer);
                if was_shadow {
                    // writers parked in get_write_access wait for this
                    head.notify_changed();
                }
                id
            }) {
                self.journal.maybe_free_head(id);
            }
        }
    }

    // Phase 6: hand logged buffers to the checkpoint list or release them
    fn process_forget(&mut self) {
        let aborted = self.journal.is_aborted();
        let txn = self.txn;
        while let Some(id) = self.scan_front(BufferList::Forget, |lists, id, head, hs| {
            let buffer = head.buffer();

            if hs.committed_data.is_some() {
                hs.committed_data = hs.frozen_data.take();
            } else {
                hs.frozen_data = None;
            }

            {
                let mut state = buffer.state();
                if state.freed && hs.next_transaction.is_none() {
                    // freed during this transaction: no write-back
                    state.freed = false;
                    state.jdirty = false;
                    state.dirty = false;
                }
                if aborted {
                    state.jdirty = false;
                }
            }

            // this commit supersedes any older checkpoint of the buffer
            lists.remove_checkpoint(id, hs);
            if buffer.is_jdirty() {
                lists.insert_checkpoint(id, hs, txn);
            }
            lists.refile_head(id, hs, buffer);
            id
        }) {
            self.journal.maybe_free_head(id);
        }
    }

    fn finish(mut self) -> JournalResult<Option<Tid>> {
        let journal = self.journal;
        let aborted = journal.is_aborted();
        let log_end = journal.log_space.lock().head();

        let run = {
            let mut state = journal.state.lock();
            let mut lists = journal.lists.lock();
            let (run, needs_checkpoint) = match lists.get_mut(self.txn) {
                Some(t) => {
                    t.state = TransactionState::Finished;
                    t.times.finished = Some(Instant::now());
                    t.log_end = Some(log_end);
                    (t.run_stats(self.blocks_logged, self.data_blocks), !t.checkpoint.is_empty())
                }
                None => (
                    TransactionRunStats {
                        tid: self.tid,
                        ..Default::default()
                    },
                    false,
                ),
            };
            if needs_checkpoint {
                lists.checkpoint_ring.push_back(self.txn);
            } else {
                lists.remove(self.txn);
            }
            state.committing = None;
            if !aborted {
                state.commit_sequence = self.tid;
            }
            journal.commit_done.notify_all();
            run
        };

        {
            let mut stats = journal.stats.lock();
            if aborted {
                stats.transactions_aborted += 1;
            } else {
                stats.transactions_committed += 1;
            }
            stats.blocks_logged += self.blocks_logged as u64;
            stats.data_blocks_flushed += self.data_blocks as u64;
        }
        journal.record_run(run);

        if aborted {
            log::warn!("JBD2: transaction {} discarded, journal aborted", self.tid);
            return Err(self
                .error
                .take()
                .unwrap_or(JournalError::Aborted(journal.errno())));
        }
        log::debug!(
            "JBD2: committed transaction {} ({} log blocks)",
            self.tid,
            self.blocks_logged
        );
        Ok(Some(self.tid))
    }
}
