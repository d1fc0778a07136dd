// Transaction Management for Journaling
// Transaction lists, the transaction table and the handles filesystems
// use to join the running transaction

use jcommit_core::{BlockNumber, JournalError, JournalMode, JournalResult, Tid};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arena::Arena;
use crate::buffer::{BlockBuffer, BufferList, HeadId, HeadState, JournalHead, TxnRef};
use crate::journal::Journal;

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting new handles
    Running,
    /// No new handles; waiting for open ones to stop
    Locked,
    /// Releasing reserved buffers and writing ordered data
    Flush,
    /// Writing metadata and the commit record
    Commit,
    /// Durable (or discarded after an abort)
    Finished,
}

/// Timestamps of each phase transition
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimes {
    pub start: Instant,
    pub locked: Option<Instant>,
    pub flush: Option<Instant>,
    pub logging: Option<Instant>,
    pub finished: Option<Instant>,
}

impl PhaseTimes {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            locked: None,
            flush: None,
            logging: None,
            finished: None,
        }
    }
}

/// Per-transaction commit statistics
#[derive(Debug, Clone, Default)]
pub struct TransactionRunStats {
    pub tid: Tid,
    /// Time spent running before the commit started
    pub running: Duration,
    /// Time waiting for open handles
    pub locked: Duration,
    /// Time writing ordered data
    pub flushing: Duration,
    /// Time writing the log and commit record
    pub logging: Duration,
    pub handle_count: u32,
    pub buffers: u32,
    pub blocks_logged: u32,
    pub data_blocks: u32,
}

fn span(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => Duration::ZERO,
    }
}

pub struct Transaction {
    pub tid: Tid,
    pub state: TransactionState,
    /// First log block of this transaction
    pub log_start: Option<BlockNumber>,
    /// Log head after the commit record
    pub log_end: Option<BlockNumber>,

    pub reserved: VecDeque<HeadId>,
    pub metadata: VecDeque<HeadId>,
    pub sync_data: VecDeque<HeadId>,
    pub locked: VecDeque<HeadId>,
    pub shadow: VecDeque<HeadId>,
    pub forget: VecDeque<HeadId>,
    /// Committed buffers not yet written home
    pub checkpoint: VecDeque<HeadId>,

    /// Open handles
    pub updates: u32,
    pub handle_count: u32,
    pub outstanding_credits: u32,
    pub nr_buffers: u32,
    pub times: PhaseTimes,
}

impl Transaction {
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            state: TransactionState::Running,
            log_start: None,
            log_end: None,
            reserved: VecDeque::new(),
            metadata: VecDeque::new(),
            sync_data: VecDeque::new(),
            locked: VecDeque::new(),
            shadow: VecDeque::new(),
            forget: VecDeque::new(),
            checkpoint: VecDeque::new(),
            updates: 0,
            handle_count: 0,
            outstanding_credits: 0,
            nr_buffers: 0,
            times: PhaseTimes::new(),
        }
    }

    pub fn list(&self, list: BufferList) -> Option<&VecDeque<HeadId>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&self.reserved),
            BufferList::Metadata => Some(&self.metadata),
            BufferList::SyncData => Some(&self.sync_data),
            BufferList::Locked => Some(&self.locked),
            BufferList::Shadow => Some(&self.shadow),
            BufferList::Forget => Some(&self.forget),
        }
    }

    fn list_mut(&mut self, list: BufferList) -> Option<&mut VecDeque<HeadId>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&mut self.reserved),
            BufferList::Metadata => Some(&mut self.metadata),
            BufferList::SyncData => Some(&mut self.sync_data),
            BufferList::Locked => Some(&mut self.locked),
            BufferList::Shadow => Some(&mut self.shadow),
            BufferList::Forget => Some(&mut self.forget),
        }
    }

    pub fn list_len(&self, list: BufferList) -> usize {
        self.list(list).map_or(0, |l| l.len())
    }

    /// No buffer remains on any commit list.
    pub fn lists_empty(&self) -> bool {
        self.reserved.is_empty()
            && self.metadata.is_empty()
            && self.sync_data.is_empty()
            && self.locked.is_empty()
            && self.shadow.is_empty()
            && self.forget.is_empty()
    }

    pub fn run_stats(&self, blocks_logged: u32, data_blocks: u32) -> TransactionRunStats {
        TransactionRunStats {
            tid: self.tid,
            running: span(Some(self.times.start), self.times.locked),
            locked: span(self.times.locked, self.times.flush),
            flushing: span(self.times.flush, self.times.logging),
            logging: span(self.times.logging, self.times.finished),
            handle_count: self.handle_count,
            buffers: self.nr_buffers,
            blocks_logged,
            data_blocks,
        }
    }
}

/// All live transactions plus the checkpoint ring. Guarded by the
/// journal's list lock.
#[derive(Default)]
pub struct TransactionTable {
    txns: Arena<Transaction>,
    /// Finished transactions with buffers awaiting checkpoint, oldest first
    pub checkpoint_ring: VecDeque<TxnRef>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, txn: Transaction) -> TxnRef {
        self.txns.insert(txn)
    }

    pub fn get(&self, txn: TxnRef) -> Option<&Transaction> {
        self.txns.get(txn)
    }

    pub fn get_mut(&mut self, txn: TxnRef) -> Option<&mut Transaction> {
        self.txns.get_mut(txn)
    }

    pub fn contains(&self, txn: TxnRef) -> bool {
        self.txns.contains(txn)
    }

    pub fn remove(&mut self, txn: TxnRef) -> Option<Transaction> {
        self.checkpoint_ring.retain(|t| *t != txn);
        self.txns.remove(txn)
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    /// Put the head on `list` of `txn`, taking it off any list it was on.
    pub fn file_head(&mut self, head_id: HeadId, hs: &mut HeadState, txn: TxnRef, list: BufferList) {
        if hs.transaction == Some(txn) && hs.jlist == list {
            return;
        }
        self.unfile_head(head_id, hs);
        if let Some(t) = self.txns.get_mut(txn) {
            if list == BufferList::Metadata {
                t.nr_buffers += 1;
            }
            if let Some(entries) = t.list_mut(list) {
                entries.push_back(head_id);
            }
        }
        hs.transaction = Some(txn);
        hs.jlist = list;
    }

    /// Take the head off its current list. The transaction pointer stays.
    pub fn unfile_head(&mut self, head_id: HeadId, hs: &mut HeadState) {
        if let Some(t) = hs.transaction.and_then(|txn| self.txns.get_mut(txn)) {
            if let Some(entries) = t.list_mut(hs.jlist) {
                entries.retain(|h| *h != head_id);
            }
        }
        hs.jlist = BufferList::None;
    }

    /// Drop a list entry whose head no longer exists.
    pub fn drop_entry(&mut self, txn: TxnRef, list: BufferList, head_id: HeadId) {
        if let Some(entries) = self.txns.get_mut(txn).and_then(|t| t.list_mut(list)) {
            entries.retain(|h| *h != head_id);
        }
    }

    /// Release the head from its transaction, handing it to the next
    /// transaction if one took write access meanwhile. Without a next
    /// transaction a journaled-dirty buffer becomes an ordinary dirty buffer.
    pub fn refile_head(&mut self, head_id: HeadId, hs: &mut HeadState, buffer: &BlockBuffer) {
        self.unfile_head(head_id, hs);
        hs.transaction = None;
        match hs.next_transaction.take() {
            Some(next) => {
                let list = hs.next_list;
                hs.next_list = BufferList::Reserved;
                self.file_head(head_id, hs, next, list);
            }
            None => {
                let mut state = buffer.state();
                if state.jdirty {
                    state.jdirty = false;
                    state.dirty = true;
                }
            }
        }
    }

    /// Record that `txn` must checkpoint this buffer, replacing any older
    /// checkpoint owner.
    pub fn insert_checkpoint(&mut self, head_id: HeadId, hs: &mut HeadState, txn: TxnRef) {
        self.remove_checkpoint(head_id, hs);
        if let Some(t) = self.txns.get_mut(txn) {
            t.checkpoint.push_back(head_id);
            hs.cp_transaction = Some(txn);
        }
    }

    /// Drop a checkpoint entry whose head no longer exists.
    pub fn drop_checkpoint_entry(&mut self, txn: TxnRef, head_id: HeadId) {
        if let Some(t) = self.txns.get_mut(txn) {
            t.checkpoint.retain(|h| *h != head_id);
        }
    }

    pub fn remove_checkpoint(&mut self, head_id: HeadId, hs: &mut HeadState) {
        if let Some(cp) = hs.cp_transaction.take() {
            if let Some(t) = self.txns.get_mut(cp) {
                t.checkpoint.retain(|h| *h != head_id);
            }
        }
    }
}

/// Transaction handle for filesystem operations.
///
/// A handle pins the running transaction: it cannot start committing
/// until every handle on it has stopped.
pub struct Handle {
    journal: Arc<Journal>,
    txn: TxnRef,
    tid: Tid,
    credits: u32,
    sync: bool,
    active: bool,
}

impl Handle {
    pub(crate) fn new(journal: Arc<Journal>, txn: TxnRef, tid: Tid, credits: u32) -> Self {
        Self {
            journal,
            txn,
            tid,
            credits,
            sync: false,
            active: true,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// Make `stop` wait until the transaction is durable.
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    fn check_active(&self) -> JournalResult<()> {
        if !self.active {
            return Err(JournalError::InvalidHandle("handle already stopped".to_string()));
        }
        self.journal.check_aborted()
    }

    /// Declare intent to modify a metadata buffer.
    pub fn get_write_access(&self, buffer: &Arc<BlockBuffer>) -> JournalResult<()> {
        self.check_active()?;
        let (head_id, head) = self.journal.attach_head(buffer);
        let result = self.do_get_write_access(head_id, &head, false);
        self.journal.release_head(head_id);
        result
    }

    /// Write access for a freshly allocated block. Clears a pending
    /// free of the same block from this transaction.
    pub fn get_create_access(&self, buffer: &Arc<BlockBuffer>) -> JournalResult<()> {
        self.check_active()?;
        let (head_id, head) = self.journal.attach_head(buffer);
        let result = self.do_get_write_access(head_id, &head, false);
        if result.is_ok() {
            let hs = head.lock();
            if hs.transaction == Some(self.txn) {
                buffer.state().freed = false;
            }
        }
        self.journal.release_head(head_id);
        result
    }

    /// Write access that also keeps the last committed contents available
    /// through [`Journal::committed_data`].
    pub fn get_undo_access(&self, buffer: &Arc<BlockBuffer>) -> JournalResult<()> {
        self.check_active()?;
        let (head_id, head) = self.journal.attach_head(buffer);
        let result = self.do_get_write_access(head_id, &head, true);
        self.journal.release_head(head_id);
        result
    }

    fn do_get_write_access(&self, head_id: HeadId, head: &JournalHead, undo: bool) -> JournalResult<()> {
        let mut hs = head.lock();
        hs.refcount += 1;
        let result = loop {
            if hs.transaction == Some(self.txn) || hs.next_transaction == Some(self.txn) {
                break Ok(());
            }
            match hs.transaction {
                Some(_) if hs.jlist == BufferList::Shadow => {
                    // snapshot is on its way to the log
                    head.wait_changed(&mut hs);
                }
                Some(_) => {
                    // committing transaction still owns it
                    if hs.jlist == BufferList::Metadata && hs.frozen_data.is_none() {
                        hs.frozen_data = Some(head.buffer().data());
                    }
                    hs.next_transaction = Some(self.txn);
                    hs.next_list = BufferList::Reserved;
                    break Ok(());
                }
                None => {
                    let mut lists = self.journal.lists();
                    if !lists.contains(self.txn) {
                        break Err(JournalError::InvalidHandle(format!(
                            "transaction {} is gone",
                            self.tid
                        )));
                    }
                    lists.file_head(head_id, &mut hs, self.txn, BufferList::Reserved);
                    break Ok(());
                }
            }
        };
        if result.is_ok() && undo && hs.committed_data.is_none() {
            hs.committed_data = Some(head.buffer().data());
        }
        hs.refcount -= 1;
        result
    }

    /// Mark a buffer obtained through write access as modified.
    pub fn dirty_metadata(&mut self, buffer: &Arc<BlockBuffer>) -> JournalResult<()> {
        self.check_active()?;
        let (head_id, head) = match buffer.head().and_then(|id| self.journal.head(id).map(|h| (id, h))) {
            Some(found) => found,
            None => {
                return Err(JournalError::InvalidHandle(format!(
                    "block {} has no write access",
                    buffer.blocknr()
                )))
            }
        };

        let mut hs = head.lock();
        if hs.transaction == Some(self.txn) {
            {
                let mut state = buffer.state();
                state.jdirty = true;
                state.dirty = false;
            }
            if hs.jlist != BufferList::Metadata {
                self.journal
                    .lists()
                    .file_head(head_id, &mut hs, self.txn, BufferList::Metadata);
                self.consume_credit();
            }
        } else if hs.next_transaction == Some(self.txn) {
            buffer.state().jdirty = true;
            if hs.next_list != BufferList::Metadata {
                hs.next_list = BufferList::Metadata;
                self.consume_credit();
            }
        } else {
            return Err(JournalError::InvalidHandle(format!(
                "block {} not part of transaction {}",
                buffer.blocknr(),
                self.tid
            )));
        }
        Ok(())
    }

    fn consume_credit(&mut self) {
        if self.credits == 0 {
            log::warn!("Handle on transaction {} ran out of credits", self.tid);
        }
        self.credits = self.credits.saturating_sub(1);
    }

    /// Mark a data block dirty. In ordered mode it is written before the
    /// transaction's metadata; in journal mode it is logged as metadata.
    pub fn dirty_data(&mut self, buffer: &Arc<BlockBuffer>) -> JournalResult<()> {
        match self.journal.config().mode {
            JournalMode::Writeback => {
                self.check_active()?;
                buffer.mark_dirty();
                Ok(())
            }
            JournalMode::Journal => {
                self.get_write_access(buffer)?;
                self.dirty_metadata(buffer)
            }
            JournalMode::Ordered => {
                self.check_active()?;
                let (head_id, head) = self.journal.attach_head(buffer);
                {
                    let mut hs = head.lock();
                    buffer.mark_dirty();
                    if hs.transaction != Some(self.txn) && hs.next_transaction != Some(self.txn) {
                        if hs.transaction.is_some() {
                            hs.next_transaction = Some(self.txn);
                            hs.next_list = BufferList::SyncData;
                        } else {
                            let mut lists = self.journal.lists();
                            lists.file_head(head_id, &mut hs, self.txn, BufferList::SyncData);
                        }
                    }
                }
                self.journal.release_head(head_id);
                Ok(())
            }
        }
    }

    /// The filesystem freed this block.
    pub fn forget(&mut self, buffer: &Arc<BlockBuffer>) -> JournalResult<()> {
        self.check_active()?;
        let found = buffer.head().and_then(|id| self.journal.head(id).map(|h| (id, h)));
        let (head_id, head) = match found {
            Some(found) => found,
            None => {
                buffer.state().dirty = false;
                return Ok(());
            }
        };

        {
            let mut hs = head.lock();
            if hs.transaction == Some(self.txn) {
                {
                    let mut state = buffer.state();
                    state.dirty = false;
                    state.jdirty = false;
                }
                hs.frozen_data = None;
                let mut lists = self.journal.lists();
                if hs.cp_transaction.is_some() {
                    // an older commit still expects to checkpoint it
                    lists.file_head(head_id, &mut hs, self.txn, BufferList::Forget);
                } else {
                    lists.unfile_head(head_id, &mut hs);
                    hs.transaction = None;
                }
            } else if hs.transaction.is_some() {
                // freed while committing: the commit must not checkpoint it
                if hs.next_transaction == Some(self.txn) {
                    hs.next_transaction = None;
                }
                buffer.state().freed = true;
            } else {
                buffer.state().dirty = false;
            }
        }
        self.journal.maybe_free_head(head_id);
        Ok(())
    }

    /// Record that earlier logged contents of `block` must not be replayed.
    pub fn revoke(&mut self, block: BlockNumber) -> JournalResult<()> {
        self.check_active()?;
        self.journal.revoke_table().revoke(block, self.tid);
        Ok(())
    }

    /// Release the handle. With `set_sync(true)` this waits for the
    /// transaction to become durable.
    pub fn stop(mut self) -> JournalResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> JournalResult<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.journal.handle_stopped(self.txn);
        if self.sync {
            self.journal.wait_for_transaction_durable(self.tid)
        } else {
            Ok(())
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.finish() {
                log::warn!("Stopping handle on transaction {} failed: {}", self.tid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{HeadSlot, JournalHead};

    fn head() -> (Arc<BlockBuffer>, JournalHead) {
        let buffer = Arc::new(BlockBuffer::new(10, vec![0u8; 16]));
        let head = JournalHead::new(buffer.clone());
        (buffer, head)
    }

    #[test]
    fn test_file_moves_between_lists() {
        let mut table = TransactionTable::new();
        let txn = table.insert(Transaction::new(1));
        let mut heads = Arena::new();
        let (_, jh) = head();
        let id = heads.insert(HeadSlot { head: Arc::new(jh), pins: 1 });
        let jh = &heads.get(id).unwrap().head;
        let mut hs = jh.lock();

        table.file_head(id, &mut hs, txn, BufferList::Reserved);
        assert_eq!(table.get(txn).unwrap().list_len(BufferList::Reserved), 1);

        table.file_head(id, &mut hs, txn, BufferList::Metadata);
        let t = table.get(txn).unwrap();
        assert_eq!(t.list_len(BufferList::Reserved), 0);
        assert_eq!(t.list_len(BufferList::Metadata), 1);
        assert_eq!(t.nr_buffers, 1);
        assert_eq!(hs.jlist, BufferList::Metadata);
    }

    #[test]
    fn test_refile_hands_to_next_transaction() {
        let mut table = TransactionTable::new();
        let committing = table.insert(Transaction::new(1));
        let running = table.insert(Transaction::new(2));
        let mut heads = Arena::new();
        let (buffer, jh) = head();
        let id = heads.insert(HeadSlot { head: Arc::new(jh), pins: 1 });
        let jh = &heads.get(id).unwrap().head;
        let mut hs = jh.lock();

        buffer.state().jdirty = true;
        table.file_head(id, &mut hs, committing, BufferList::Forget);
        hs.next_transaction = Some(running);
        hs.next_list = BufferList::Metadata;

        table.refile_head(id, &mut hs, &buffer);
        assert_eq!(hs.transaction, Some(running));
        assert_eq!(hs.next_transaction, None);
        assert_eq!(hs.jlist, BufferList::Metadata);
        assert_eq!(hs.next_list, BufferList::Reserved);
        assert!(table.get(committing).unwrap().lists_empty());
        assert!(buffer.is_jdirty());
    }

    #[test]
    fn test_refile_without_next_makes_buffer_dirty() {
        let mut table = TransactionTable::new();
        let txn = table.insert(Transaction::new(1));
        let mut heads = Arena::new();
        let (buffer, jh) = head();
        let id = heads.insert(HeadSlot { head: Arc::new(jh), pins: 1 });
        let jh = &heads.get(id).unwrap().head;
        let mut hs = jh.lock();

        buffer.state().jdirty = true;
        table.file_head(id, &mut hs, txn, BufferList::Forget);
        table.refile_head(id, &mut hs, &buffer);
        assert_eq!(hs.transaction, None);
        assert!(!buffer.is_jdirty());
        assert!(buffer.is_dirty());
    }

    #[test]
    fn test_checkpoint_owner_replaced() {
        let mut table = TransactionTable::new();
        let old = table.insert(Transaction::new(1));
        let new = table.insert(Transaction::new(2));
        let mut heads = Arena::new();
        let (_, jh) = head();
        let id = heads.insert(HeadSlot { head: Arc::new(jh), pins: 1 });
        let jh = &heads.get(id).unwrap().head;
        let mut hs = jh.lock();

        table.insert_checkpoint(id, &mut hs, old);
        table.insert_checkpoint(id, &mut hs, new);
        assert!(table.get(old).unwrap().checkpoint.is_empty());
        assert_eq!(table.get(new).unwrap().checkpoint.len(), 1);
        assert_eq!(hs.cp_transaction, Some(new));
    }

    #[test]
    fn test_removed_transaction_leaves_ring() {
        let mut table = TransactionTable::new();
        let txn = table.insert(Transaction::new(1));
        table.checkpoint_ring.push_back(txn);
        assert!(table.remove(txn).is_some());
        assert!(table.checkpoint_ring.is_empty());
        assert!(!table.contains(txn));
    }
}
