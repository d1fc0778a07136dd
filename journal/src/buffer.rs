// Buffer Descriptor Table
// Cached blocks and the journal heads that attach them to transactions

use jcommit_core::{BlockNumber, JournalResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::Index;
use crate::device::BlockDevice;
use crate::transaction::Transaction;

pub type HeadId = Index<HeadSlot>;
pub type TxnRef = Index<Transaction>;

/// Mutable state of a cached block
#[derive(Debug, Default)]
pub struct BufferState {
    pub data: Vec<u8>,
    /// Needs writing to its home location
    pub dirty: bool,
    /// Modified under a journal transaction; must not be written home
    /// until that transaction commits
    pub jdirty: bool,
    /// Freed by the filesystem while a transaction still referenced it
    pub freed: bool,
    /// Attached journal head, if any
    pub head: Option<HeadId>,
}

/// One cached filesystem block.
pub struct BlockBuffer {
    blocknr: BlockNumber,
    state: Mutex<BufferState>,
    io_locked: Mutex<bool>,
    io_unlocked: Condvar,
}

impl BlockBuffer {
    pub fn new(blocknr: BlockNumber, data: Vec<u8>) -> Self {
        Self {
            blocknr,
            state: Mutex::new(BufferState {
                data,
                ..Default::default()
            }),
            io_locked: Mutex::new(false),
            io_unlocked: Condvar::new(),
        }
    }

    pub fn blocknr(&self) -> BlockNumber {
        self.blocknr
    }

    pub fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    /// Copy of the current contents.
    pub fn data(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Modify the contents in place. Callers hold write access through a
    /// transaction handle.
    pub fn modify<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.state.lock().data)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_jdirty(&self) -> bool {
        self.state.lock().jdirty
    }

    pub fn is_freed(&self) -> bool {
        self.state.lock().freed
    }

    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    pub fn head(&self) -> Option<HeadId> {
        self.state.lock().head
    }

    /// Take the I/O lock without blocking.
    pub fn try_lock_io(&self) -> bool {
        let mut locked = self.io_locked.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    pub fn lock_io(&self) {
        let mut locked = self.io_locked.lock();
        while *locked {
            self.io_unlocked.wait(&mut locked);
        }
        *locked = true;
    }

    pub fn unlock_io(&self) {
        *self.io_locked.lock() = false;
        self.io_unlocked.notify_all();
    }

    pub fn is_io_locked(&self) -> bool {
        *self.io_locked.lock()
    }
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockBuffer")
            .field("blocknr", &self.blocknr)
            .field("dirty", &state.dirty)
            .field("jdirty", &state.jdirty)
            .field("freed", &state.freed)
            .field("head", &state.head)
            .finish()
    }
}

/// Block cache in front of the filesystem device
#[derive(Default)]
pub struct BufferCache {
    buffers: Mutex<HashMap<BlockNumber, Arc<BlockBuffer>>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached buffer, reading it from `device` on a miss.
    pub fn get(&self, device: &dyn BlockDevice, blocknr: BlockNumber) -> JournalResult<Arc<BlockBuffer>> {
        if let Some(buffer) = self.buffers.lock().get(&blocknr) {
            return Ok(buffer.clone());
        }
        let data = device.read_block(blocknr)?;
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(blocknr)
            .or_insert_with(|| Arc::new(BlockBuffer::new(blocknr, data)));
        Ok(buffer.clone())
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

/// Which transaction list a journal head is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferList {
    None,
    /// Write access taken, not (yet) modified
    Reserved,
    /// Modified metadata awaiting log I/O
    Metadata,
    /// Ordered-mode data to write before the metadata
    SyncData,
    /// Data write in flight
    Locked,
    /// Snapshot being written to the log
    Shadow,
    /// Logged, or released by the filesystem before commit
    Forget,
}

/// State guarded by the per-head lock
#[derive(Debug)]
pub struct HeadState {
    /// Transaction holding this buffer on one of its lists
    pub transaction: Option<TxnRef>,
    /// Running transaction that modified the buffer while `transaction`
    /// was committing
    pub next_transaction: Option<TxnRef>,
    /// List to join on `next_transaction` if not journaled dirty
    pub next_list: BufferList,
    /// Committed transaction whose checkpoint still needs this buffer
    pub cp_transaction: Option<TxnRef>,
    pub jlist: BufferList,
    /// Contents as of the committing transaction, taken when a newer
    /// transaction modified the buffer before it was logged
    pub frozen_data: Option<Vec<u8>>,
    /// Last committed contents, kept for undo access
    pub committed_data: Option<Vec<u8>>,
    /// Users currently operating on the head outside any list
    pub refcount: u32,
}

impl HeadState {
    fn new() -> Self {
        Self {
            transaction: None,
            next_transaction: None,
            next_list: BufferList::Reserved,
            cp_transaction: None,
            jlist: BufferList::None,
            frozen_data: None,
            committed_data: None,
            refcount: 0,
        }
    }

    /// Nothing references the head any more; it may be freed.
    pub fn is_unused(&self) -> bool {
        self.transaction.is_none()
            && self.next_transaction.is_none()
            && self.cp_transaction.is_none()
            && self.refcount == 0
    }
}

/// Result of a non-blocking head lock request
pub enum LockAttempt<'a> {
    Acquired(MutexGuard<'a, HeadState>),
    Busy,
}

/// Entry of the journal's head table
pub struct HeadSlot {
    pub head: Arc<JournalHead>,
    /// Callers between `attach_head` and `release_head`
    pub pins: u32,
}

/// Journal head: binds one cached block to its transactions.
pub struct JournalHead {
    buffer: Arc<BlockBuffer>,
    state: Mutex<HeadState>,
    changed: Condvar,
}

impl JournalHead {
    pub fn new(buffer: Arc<BlockBuffer>) -> Self {
        Self {
            buffer,
            state: Mutex::new(HeadState::new()),
            changed: Condvar::new(),
        }
    }

    pub fn buffer(&self) -> &Arc<BlockBuffer> {
        &self.buffer
    }

    pub fn lock(&self) -> MutexGuard<'_, HeadState> {
        self.state.lock()
    }

    /// Used while holding the list lock, where blocking on the head would
    /// invert the lock order.
    pub fn try_lock(&self) -> LockAttempt<'_> {
        match self.state.try_lock() {
            Some(guard) => LockAttempt::Acquired(guard),
            None => LockAttempt::Busy,
        }
    }

    /// Sleep until another thread moves the head, releasing the lock meanwhile.
    pub fn wait_changed(&self, guard: &mut MutexGuard<'_, HeadState>) {
        self.changed.wait(guard);
    }

    pub fn notify_changed(&self) {
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn test_cache_reads_once() {
        let dev = MemoryDevice::new(1024);
        dev.poke(4, vec![9u8; 1024]);
        let cache = BufferCache::new();
        let a = cache.get(&dev, 4).unwrap();
        let b = cache.get(&dev, 4).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.data(), vec![9u8; 1024]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_io_lock() {
        let buffer = BlockBuffer::new(1, vec![0u8; 16]);
        assert!(buffer.try_lock_io());
        assert!(!buffer.try_lock_io());
        buffer.unlock_io();
        buffer.lock_io();
        assert!(buffer.is_io_locked());
        buffer.unlock_io();
    }

    #[test]
    fn test_try_lock_reports_busy() {
        let head = JournalHead::new(Arc::new(BlockBuffer::new(1, vec![0u8; 16])));
        let guard = head.lock();
        assert!(matches!(head.try_lock(), LockAttempt::Busy));
        drop(guard);
        assert!(matches!(head.try_lock(), LockAttempt::Acquired(_)));
    }

    #[test]
    fn test_new_head_is_unused() {
        let head = JournalHead::new(Arc::new(BlockBuffer::new(1, vec![0u8; 16])));
        assert!(head.lock().is_unused());
        head.lock().refcount += 1;
        assert!(!head.lock().is_unused());
    }
}
