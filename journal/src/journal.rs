// JBD2 Journal Implementation
// The journal context shared by handles, the commit engine and the
// checkpoint walker

use jcommit_core::{BlockNumber, JournalConfig, JournalError, JournalResult, Tid};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::allocator::LogAllocator;
use crate::arena::Arena;
use crate::buffer::{BlockBuffer, BufferCache, BufferList, HeadId, HeadSlot, JournalHead, LockAttempt, TxnRef};
use crate::checkpoint::{self, CheckpointStats};
use crate::commit;
use crate::device::{write_block_sync, BlockDevice};
use crate::format::UUID_SIZE;
use crate::recovery::{self, RecoveryInfo};
use crate::revoke::RevokeTable;
use crate::superblock::JournalSuperblock;
use crate::transaction::{Handle, Transaction, TransactionRunStats, TransactionTable};

/// Run statistics kept for the most recent commits
const HISTORY_LEN: usize = 32;

/// `a` is at or after `b` in wrapping sequence order.
pub fn tid_geq(a: Tid, b: Tid) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// `a` is strictly after `b` in wrapping sequence order.
pub fn tid_gt(a: Tid, b: Tid) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Journal statistics
#[derive(Debug, Default, Clone)]
pub struct JournalStats {
    /// Total transactions started
    pub transactions_started: u64,
    /// Total transactions committed
    pub transactions_committed: u64,
    /// Total transactions aborted
    pub transactions_aborted: u64,
    /// Total blocks logged, descriptor and commit blocks included
    pub blocks_logged: u64,
    /// Ordered-mode data blocks written before their metadata
    pub data_blocks_flushed: u64,
    /// Buffers written home by the checkpoint walker
    pub checkpoint_writes: u64,
    /// Times the device refused a barrier and barriers were turned off
    pub barrier_downgrades: u64,
    /// Current transaction ID
    pub current_tid: Tid,
    /// Oldest transaction ID in journal
    pub oldest_tid: Tid,
}

/// Snapshot of one buffer's journal bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub transaction: Option<Tid>,
    pub next_transaction: Option<Tid>,
    pub checkpoint: Option<Tid>,
    pub list: BufferList,
    pub frozen: bool,
    pub committed: bool,
}

/// Sequencing state, guarded by the state lock
pub(crate) struct JournalState {
    pub running: Option<TxnRef>,
    pub committing: Option<TxnRef>,
    pub next_tid: Tid,
    /// Last transaction whose commit record is durable
    pub commit_sequence: Tid,
    /// Highest transaction a caller asked to have committed
    pub commit_request: Tid,
    /// Tells the commit thread to exit
    pub shutdown: bool,
}

/// Write-ahead journal over a log device, protecting blocks of a
/// filesystem device.
///
/// Lock order, outermost first: `checkpoint_lock`, `commit_lock`, `state`,
/// `lists`, then the heads table. The commit only ever try-locks
/// `checkpoint_lock`. A buffer's I/O lock is taken before its head lock,
/// or try-locked under it. A journal head is locked either before `lists`
/// (blocking) or while holding it (`try_lock` only, restarting the scan on
/// [`LockAttempt::Busy`]). `superblock` nests inside `lists` and outside
/// `log_space`; `log_space`, `revoke`, `stats` and buffer state are leaves.
pub struct Journal {
    config: JournalConfig,
    uuid: [u8; UUID_SIZE],
    log: Arc<dyn BlockDevice>,
    fs: Arc<dyn BlockDevice>,

    pub(crate) state: Mutex<JournalState>,
    /// Signalled with `state` whenever a commit finishes or the journal aborts
    pub(crate) commit_done: Condvar,
    /// Signalled with `state` to wake the commit thread
    pub(crate) commit_wakeup: Condvar,

    pub(crate) lists: Mutex<TransactionTable>,
    /// Signalled with `lists` when a transaction's last handle stops
    pub(crate) updates_done: Condvar,

    heads: Mutex<Arena<HeadSlot>>,
    cache: BufferCache,
    pub(crate) log_space: Mutex<LogAllocator>,
    pub(crate) superblock: Mutex<JournalSuperblock>,
    revoke: Mutex<RevokeTable>,

    pub(crate) commit_lock: Mutex<()>,
    pub(crate) checkpoint_lock: Mutex<()>,

    aborted: AtomicBool,
    errno: AtomicI32,
    barrier: AtomicBool,
    pub(crate) barrier_warned: AtomicBool,
    commit_thread: AtomicBool,

    pub(crate) stats: Mutex<JournalStats>,
    history: Mutex<VecDeque<TransactionRunStats>>,
}

impl Journal {
    /// Format a new, empty log and open a journal on it.
    pub fn create(config: JournalConfig, log: Arc<dyn BlockDevice>, fs: Arc<dyn BlockDevice>) -> JournalResult<Arc<Self>> {
        config.validate()?;
        check_device(&config, log.as_ref(), "log")?;
        check_device(&config, fs.as_ref(), "filesystem")?;

        let uuid = *uuid::Uuid::new_v4().as_bytes();
        let superblock = JournalSuperblock::new(&config, uuid);
        write_block_sync(log.as_ref(), 0, superblock.encode(config.block_size), false)?;
        log.flush()?;
        log::info!(
            "Formatted journal: {} log blocks of {} bytes, first tid {}",
            config.log_blocks,
            config.block_size,
            config.first_tid
        );

        let next_tid = config.first_tid;
        Ok(Arc::new(Self::build(config, superblock, log, fs, next_tid)))
    }

    /// Open an existing log, replaying any committed transactions first.
    pub fn open(config: JournalConfig, log: Arc<dyn BlockDevice>, fs: Arc<dyn BlockDevice>) -> JournalResult<(Arc<Self>, RecoveryInfo)> {
        config.validate()?;
        check_device(&config, log.as_ref(), "log")?;
        check_device(&config, fs.as_ref(), "filesystem")?;

        JournalSuperblock::decode(&log.read_block(0)?)?.check_geometry(&config)?;
        let info = recovery::recover(log.as_ref(), fs.as_ref())?;
        let superblock = JournalSuperblock::decode(&log.read_block(0)?)?;
        if info.replayed_blocks > 0 {
            log::info!(
                "Recovered {} transactions ({} blocks), next tid {}",
                info.transactions.len(),
                info.replayed_blocks,
                info.next_tid
            );
        }

        let next_tid = info.next_tid;
        Ok((Arc::new(Self::build(config, superblock, log, fs, next_tid)), info))
    }

    fn build(
        config: JournalConfig,
        superblock: JournalSuperblock,
        log: Arc<dyn BlockDevice>,
        fs: Arc<dyn BlockDevice>,
        next_tid: Tid,
    ) -> Self {
        let last_committed = next_tid.wrapping_sub(1);
        Self {
            uuid: superblock.uuid,
            barrier: AtomicBool::new(config.barrier),
            log_space: Mutex::new(LogAllocator::new(config.log_first, config.log_blocks)),
            config,
            log,
            fs,
            state: Mutex::new(JournalState {
                running: None,
                committing: None,
                next_tid,
                commit_sequence: last_committed,
                commit_request: last_committed,
                shutdown: false,
            }),
            commit_done: Condvar::new(),
            commit_wakeup: Condvar::new(),
            lists: Mutex::new(TransactionTable::new()),
            updates_done: Condvar::new(),
            heads: Mutex::new(Arena::new()),
            cache: BufferCache::new(),
            superblock: Mutex::new(superblock),
            revoke: Mutex::new(RevokeTable::new()),
            commit_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            aborted: AtomicBool::new(false),
            errno: AtomicI32::new(0),
            barrier_warned: AtomicBool::new(false),
            commit_thread: AtomicBool::new(false),
            stats: Mutex::new(JournalStats::default()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn uuid(&self) -> [u8; UUID_SIZE] {
        self.uuid
    }

    pub fn log_device(&self) -> &dyn BlockDevice {
        self.log.as_ref()
    }

    pub fn fs_device(&self) -> &dyn BlockDevice {
        self.fs.as_ref()
    }

    /// Cached buffer for a filesystem block.
    pub fn buffer(&self, blocknr: BlockNumber) -> JournalResult<Arc<BlockBuffer>> {
        self.cache.get(self.fs.as_ref(), blocknr)
    }

    /// Join the running transaction, starting one if needed.
    pub fn start_handle(self: &Arc<Self>, credits: u32) -> JournalResult<Handle> {
        self.check_aborted()?;
        let max_credits = self.max_transaction_buffers();
        if credits as u64 > max_credits {
            return Err(JournalError::InvalidInput(format!(
                "handle wants {} credits, limit is {}",
                credits, max_credits
            )));
        }
        if !self.has_log_space(credits) {
            checkpoint::log_do_checkpoint(self, false)?;
            if !self.has_log_space(credits) {
                return Err(JournalError::LogFull);
            }
        }

        let mut state = self.state.lock();
        let mut lists = self.lists.lock();
        let txn = match state.running.filter(|t| lists.contains(*t)) {
            Some(txn) => txn,
            None => {
                let tid = state.next_tid;
                state.next_tid = tid.wrapping_add(1);
                let txn = lists.insert(Transaction::new(tid));
                state.running = Some(txn);
                self.stats.lock().transactions_started += 1;
                log::debug!("Started transaction {}", tid);
                txn
            }
        };
        let t = lists
            .get_mut(txn)
            .ok_or_else(|| JournalError::InvalidTransaction("running transaction vanished".to_string()))?;
        t.updates += 1;
        t.handle_count += 1;
        t.outstanding_credits += credits;
        let tid = t.tid;
        Ok(Handle::new(self.clone(), txn, tid, credits))
    }

    /// Largest number of buffers one transaction may reserve.
    pub fn max_transaction_buffers(&self) -> u64 {
        (self.config.log_blocks - self.config.log_first) / 4
    }

    /// Log blocks needed to commit `credits` buffers: the buffers, their
    /// descriptors and the commit record.
    fn blocks_for_credits(&self, credits: u64) -> u64 {
        let per_descriptor = crate::format::descriptor_capacity(self.config.block_size, self.config.large_block)
            .min(self.config.batch_size) as u64;
        credits + credits.div_ceil(per_descriptor.max(1)) + 1
    }

    fn has_log_space(&self, credits: u32) -> bool {
        let outstanding = {
            let state = self.state.lock();
            let lists = self.lists.lock();
            [state.committing, state.running]
                .iter()
                .flatten()
                .filter_map(|t| lists.get(*t))
                .map(|t| t.outstanding_credits as u64)
                .sum::<u64>()
        };
        let needed = self.blocks_for_credits(outstanding + credits as u64) + 1;
        self.log_space.lock().free_blocks() >= needed
    }

    pub(crate) fn handle_stopped(&self, txn: TxnRef) {
        let mut lists = self.lists.lock();
        if let Some(t) = lists.get_mut(txn) {
            t.updates = t.updates.saturating_sub(1);
            if t.updates == 0 {
                self.updates_done.notify_all();
            }
        }
    }

    pub(crate) fn lists(&self) -> MutexGuard<'_, TransactionTable> {
        self.lists.lock()
    }

    pub(crate) fn revoke_table(&self) -> MutexGuard<'_, RevokeTable> {
        self.revoke.lock()
    }

    /// Attach (or find) the journal head of `buffer` and pin it until the
    /// matching `release_head`.
    pub(crate) fn attach_head(&self, buffer: &Arc<BlockBuffer>) -> (HeadId, Arc<JournalHead>) {
        let mut heads = self.heads.lock();
        let mut bstate = buffer.state();
        if let Some(id) = bstate.head {
            if let Some(slot) = heads.get_mut(id) {
                slot.pins += 1;
                return (id, slot.head.clone());
            }
        }
        let head = Arc::new(JournalHead::new(buffer.clone()));
        let id = heads.insert(HeadSlot {
            head: head.clone(),
            pins: 1,
        });
        bstate.head = Some(id);
        (id, head)
    }

    pub(crate) fn head(&self, id: HeadId) -> Option<Arc<JournalHead>> {
        self.heads.lock().get(id).map(|slot| slot.head.clone())
    }

    /// Drop a pin taken by `attach_head` and free the head once nothing
    /// references it. Must be called without the head locked.
    pub(crate) fn release_head(&self, id: HeadId) {
        self.unpin_head(id, true);
    }

    /// Free the head if it became unused, without dropping a pin. Used
    /// after taking a head off a transaction list.
    pub(crate) fn maybe_free_head(&self, id: HeadId) {
        self.unpin_head(id, false);
    }

    fn unpin_head(&self, id: HeadId, unpin: bool) {
        let mut heads = self.heads.lock();
        let Some(slot) = heads.get_mut(id) else {
            return;
        };
        if unpin {
            slot.pins = slot.pins.saturating_sub(1);
        }
        if slot.pins > 0 {
            return;
        }
        let head = slot.head.clone();
        // a holder of the head lock calls back here once done with it
        let unused = match head.try_lock() {
            LockAttempt::Acquired(hs) => hs.is_unused(),
            LockAttempt::Busy => false,
        };
        if unused {
            head.buffer().state().head = None;
            heads.remove(id);
        }
    }

    /// Number of journal heads currently attached to buffers.
    pub fn head_count(&self) -> usize {
        self.heads.lock().len()
    }

    /// Transactions still alive: running, committing, or awaiting checkpoint.
    pub fn transaction_count(&self) -> usize {
        self.lists.lock().len()
    }

    pub fn head_info(&self, buffer: &BlockBuffer) -> Option<HeadInfo> {
        let head = self.head(buffer.head()?)?;
        let hs = head.lock();
        let lists = self.lists.lock();
        let tid = |txn: Option<TxnRef>| txn.and_then(|t| lists.get(t)).map(|t| t.tid);
        Some(HeadInfo {
            transaction: tid(hs.transaction),
            next_transaction: tid(hs.next_transaction),
            checkpoint: tid(hs.cp_transaction),
            list: hs.jlist,
            frozen: hs.frozen_data.is_some(),
            committed: hs.committed_data.is_some(),
        })
    }

    /// Contents as of the last commit, kept for buffers opened with
    /// undo access.
    pub fn committed_data(&self, buffer: &BlockBuffer) -> Option<Vec<u8>> {
        let head = self.head(buffer.head()?)?;
        let hs = head.lock();
        hs.committed_data.clone()
    }

    pub fn running_tid(&self) -> Option<Tid> {
        let state = self.state.lock();
        let lists = self.lists.lock();
        state.running.and_then(|t| lists.get(t)).map(|t| t.tid)
    }

    /// Last transaction known durable.
    pub fn commit_sequence(&self) -> Tid {
        self.state.lock().commit_sequence
    }

    /// Sequence numbers of committed transactions still awaiting checkpoint.
    pub fn checkpoint_transactions(&self) -> Vec<Tid> {
        let lists = self.lists.lock();
        lists
            .checkpoint_ring
            .iter()
            .filter_map(|t| lists.get(*t))
            .map(|t| t.tid)
            .collect()
    }

    pub fn superblock(&self) -> JournalSuperblock {
        self.superblock.lock().clone()
    }

    pub fn log_free_blocks(&self) -> u64 {
        self.log_space.lock().free_blocks()
    }

    pub(crate) fn next_log_block(&self) -> JournalResult<BlockNumber> {
        self.log_space.lock().next_log_block()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::SeqCst)
    }

    pub fn check_aborted(&self) -> JournalResult<()> {
        if self.is_aborted() {
            Err(JournalError::Aborted(self.errno()))
        } else {
            Ok(())
        }
    }

    /// Put the journal into the aborted state. No further log I/O is
    /// issued; the error is recorded in the superblock. Must be called
    /// without journal locks held.
    pub fn abort(&self, errno: i32) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.errno.store(errno, Ordering::SeqCst);
        log::error!("Journal aborted (errno {})", errno);

        {
            let mut sb = self.superblock.lock();
            sb.errno = errno;
            let raw = sb.encode(self.config.block_size);
            if let Err(e) = write_block_sync(self.log.as_ref(), 0, raw, false) {
                log::error!("Could not record abort in journal superblock: {}", e);
            }
        }

        // wake durability waiters and the commit thread
        let _state = self.state.lock();
        self.commit_done.notify_all();
        self.commit_wakeup.notify_all();
    }

    pub fn barrier_enabled(&self) -> bool {
        self.barrier.load(Ordering::SeqCst)
    }

    pub(crate) fn disable_barrier(&self) {
        self.barrier.store(false, Ordering::SeqCst);
    }

    pub(crate) fn attach_commit_thread(&self) -> JournalResult<()> {
        if self.commit_thread.swap(true, Ordering::SeqCst) {
            return Err(JournalError::Busy);
        }
        self.state.lock().shutdown = false;
        Ok(())
    }

    pub(crate) fn detach_commit_thread(&self) {
        self.commit_thread.store(false, Ordering::SeqCst);
        let _state = self.state.lock();
        self.commit_done.notify_all();
    }

    pub fn has_commit_thread(&self) -> bool {
        self.commit_thread.load(Ordering::SeqCst)
    }

    /// Commit the running transaction now, on the calling thread.
    pub fn commit(&self) -> JournalResult<Option<Tid>> {
        commit::commit_transaction(self)
    }

    /// Ask the commit thread to commit the running transaction. Returns
    /// its sequence number, if there is one.
    pub fn request_commit(&self) -> Option<Tid> {
        let mut state = self.state.lock();
        let lists = self.lists.lock();
        let tid = state.running.and_then(|t| lists.get(t)).map(|t| t.tid)?;
        drop(lists);
        if tid_gt(tid, state.commit_request) {
            state.commit_request = tid;
        }
        self.commit_wakeup.notify_all();
        Some(tid)
    }

    /// Block until transaction `tid` is durable. Without a commit thread
    /// the commit runs on the calling thread. Callers must not hold an open
    /// handle on `tid`.
    pub fn wait_for_transaction_durable(&self, tid: Tid) -> JournalResult<()> {
        {
            let state = self.state.lock();
            if tid_geq(tid, state.next_tid) {
                return Err(JournalError::InvalidTransaction(format!(
                    "transaction {} has not started",
                    tid
                )));
            }
        }

        loop {
            let mut state = self.state.lock();
            if tid_geq(state.commit_sequence, tid) {
                return Ok(());
            }
            self.check_aborted()?;

            if self.has_commit_thread() {
                if tid_gt(tid, state.commit_request) {
                    state.commit_request = tid;
                }
                self.commit_wakeup.notify_all();
                self.commit_done.wait(&mut state);
                continue;
            }

            drop(state);
            if commit::commit_transaction(self)?.is_none() {
                // another caller holds the commit; wait for it to finish
                let mut state = self.state.lock();
                if !tid_geq(state.commit_sequence, tid) {
                    self.commit_done.wait_for(&mut state, Duration::from_millis(10));
                }
            }
        }
    }

    /// Write checkpointed buffers home and advance the log tail, waiting
    /// for newer transactions that still hold some of them. Callers must
    /// not hold an open handle.
    pub fn checkpoint(&self) -> JournalResult<CheckpointStats> {
        checkpoint::log_do_checkpoint(self, true)
    }

    /// Drop checkpoint entries whose buffers are already clean, without
    /// issuing I/O.
    pub fn cleanup_checkpoint(&self) -> usize {
        let _guard = self.checkpoint_lock.lock();
        checkpoint::cleanup_checkpoint_locked(self)
    }

    /// Commit everything and checkpoint until the log is empty.
    pub fn flush(&self) -> JournalResult<()> {
        self.commit()?;
        self.checkpoint()?;
        if !self.checkpoint_transactions().is_empty() {
            return Err(JournalError::Busy);
        }
        Ok(())
    }

    pub fn stats(&self) -> JournalStats {
        let mut stats = self.stats.lock().clone();
        let state = self.state.lock();
        let lists = self.lists.lock();
        stats.current_tid = state.next_tid.wrapping_sub(1);
        stats.oldest_tid = lists
            .checkpoint_ring
            .front()
            .and_then(|t| lists.get(*t))
            .map_or(state.commit_sequence.wrapping_add(1), |t| t.tid);
        stats
    }

    /// Run statistics of recent commits, oldest first.
    pub fn history(&self) -> Vec<TransactionRunStats> {
        self.history.lock().iter().cloned().collect()
    }

    pub(crate) fn record_run(&self, run: TransactionRunStats) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(run);
    }

    /// Write the in-memory superblock to log block 0.
    pub(crate) fn write_superblock(&self, sb: &JournalSuperblock) -> JournalResult<()> {
        write_block_sync(self.log.as_ref(), 0, sb.encode(self.config.block_size), false)?;
        self.log.flush()
    }

    /// Abort with the errno of `err` and hand it back.
    pub(crate) fn abort_with(&self, err: JournalError) -> JournalError {
        self.abort(err.errno());
        err
    }
}

fn check_device(config: &JournalConfig, device: &dyn BlockDevice, what: &str) -> JournalResult<()> {
    if device.block_size() != config.block_size {
        return Err(JournalError::Configuration(format!(
            "{} device block size {} does not match {}",
            what,
            device.block_size(),
            config.block_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use jcommit_core::error::EIO;

    fn journal() -> Arc<Journal> {
        let config = JournalConfig {
            block_size: 1024,
            log_blocks: 64,
            ..Default::default()
        };
        Journal::create(
            config,
            Arc::new(MemoryDevice::new(1024)),
            Arc::new(MemoryDevice::new(1024)),
        )
        .unwrap()
    }

    #[test]
    fn test_tid_ordering_wraps() {
        assert!(tid_geq(5, 5));
        assert!(tid_gt(6, 5));
        assert!(tid_gt(2, u32::MAX - 1));
        assert!(!tid_geq(u32::MAX, 3));
    }

    #[test]
    fn test_handles_share_running_transaction() {
        let journal = journal();
        let a = journal.start_handle(1).unwrap();
        let b = journal.start_handle(1).unwrap();
        assert_eq!(a.tid(), b.tid());
        assert_eq!(journal.running_tid(), Some(a.tid()));
        drop(a);
        drop(b);
        assert_eq!(journal.transaction_count(), 1);
    }

    #[test]
    fn test_credit_limit() {
        let journal = journal();
        let limit = journal.max_transaction_buffers() as u32;
        assert!(matches!(
            journal.start_handle(limit + 1),
            Err(JournalError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_head_freed_when_unused() {
        let journal = journal();
        let buffer = journal.buffer(10).unwrap();
        let (id, _) = journal.attach_head(&buffer);
        assert_eq!(journal.head_count(), 1);
        assert_eq!(buffer.head(), Some(id));
        journal.release_head(id);
        assert_eq!(journal.head_count(), 0);
        assert_eq!(buffer.head(), None);
    }

    #[test]
    fn test_dirty_metadata_takes_one_credit_per_buffer() {
        let journal = journal();
        let mut handle = journal.start_handle(2).unwrap();
        let buffer = journal.buffer(12).unwrap();
        handle.get_write_access(&buffer).unwrap();
        handle.dirty_metadata(&buffer).unwrap();
        handle.dirty_metadata(&buffer).unwrap();
        assert_eq!(handle.credits(), 1);
        assert!(buffer.is_jdirty());
        assert_eq!(journal.head_info(&buffer).unwrap().list, BufferList::Metadata);
    }

    #[test]
    fn test_head_pins_are_counted() {
        let journal = journal();
        let buffer = journal.buffer(11).unwrap();
        let (first, head) = journal.attach_head(&buffer);
        let (second, again) = journal.attach_head(&buffer);
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&head, &again));
        assert!(journal.head(first).is_some());

        journal.release_head(first);
        assert_eq!(journal.head_count(), 1);
        journal.release_head(second);
        assert_eq!(journal.head_count(), 0);
        // a stale id no longer resolves
        assert!(journal.head(first).is_none());
    }

    #[test]
    fn test_abort_records_errno() {
        let journal = journal();
        journal.abort(EIO);
        assert!(journal.is_aborted());
        assert!(matches!(journal.start_handle(1), Err(JournalError::Aborted(EIO))));

        let raw = journal.log_device().read_block(0).unwrap();
        assert_eq!(JournalSuperblock::decode(&raw).unwrap().errno, EIO);
    }

    #[test]
    fn test_wait_for_unstarted_transaction() {
        let journal = journal();
        assert!(matches!(
            journal.wait_for_transaction_durable(7),
            Err(JournalError::InvalidTransaction(_))
        ));
    }
}
