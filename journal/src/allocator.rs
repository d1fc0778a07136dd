// Log Block Allocator
// Hands out sequential blocks of the circular log between head and tail

use jcommit_core::{BlockNumber, JournalError, JournalResult};

/// Circular log space `[first, last)`.
///
/// `head` is the next block to write, `tail` the oldest block still needed
/// for recovery. `free` disambiguates the full and empty cases where
/// `head == tail`.
#[derive(Debug, Clone)]
pub struct LogAllocator {
    first: BlockNumber,
    last: BlockNumber,
    head: BlockNumber,
    tail: BlockNumber,
    free: u64,
}

impl LogAllocator {
    pub fn new(first: BlockNumber, last: BlockNumber) -> Self {
        Self {
            first,
            last,
            head: first,
            tail: first,
            free: last - first,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.last - self.first
    }

    pub fn head(&self) -> BlockNumber {
        self.head
    }

    pub fn tail(&self) -> BlockNumber {
        self.tail
    }

    pub fn free_blocks(&self) -> u64 {
        self.free
    }

    pub fn is_empty(&self) -> bool {
        self.free == self.capacity()
    }

    /// Next block after `block`, wrapping at the end of the log.
    pub fn wrap(&self, block: BlockNumber) -> BlockNumber {
        if block + 1 >= self.last {
            self.first
        } else {
            block + 1
        }
    }

    /// Blocks from `from` up to (not including) `to`, going forward.
    fn distance(&self, from: BlockNumber, to: BlockNumber) -> u64 {
        if to >= from {
            to - from
        } else {
            to + self.capacity() - from
        }
    }

    pub fn next_log_block(&mut self) -> JournalResult<BlockNumber> {
        if self.free == 0 {
            return Err(JournalError::LogFull);
        }
        let block = self.head;
        self.head = self.wrap(block);
        self.free -= 1;
        Ok(block)
    }

    /// Move the tail forward to `new_tail`, returning the blocks released.
    pub fn release_to(&mut self, new_tail: BlockNumber) -> u64 {
        if new_tail < self.first || new_tail >= self.last {
            return 0;
        }
        let used = self.capacity() - self.free;
        let released = self.distance(self.tail, new_tail).min(used);
        self.tail = new_tail;
        self.free += released;
        released
    }

    /// Nothing before the head is needed any more.
    pub fn release_all(&mut self) -> u64 {
        let released = self.capacity() - self.free;
        self.tail = self.head;
        self.free = self.capacity();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut log = LogAllocator::new(1, 5);
        assert_eq!(log.next_log_block().unwrap(), 1);
        assert_eq!(log.next_log_block().unwrap(), 2);
        assert_eq!(log.free_blocks(), 2);
        assert_eq!(log.head(), 3);
    }

    #[test]
    fn test_full_log() {
        let mut log = LogAllocator::new(1, 4);
        for _ in 0..3 {
            log.next_log_block().unwrap();
        }
        assert!(matches!(log.next_log_block(), Err(JournalError::LogFull)));
        assert_eq!(log.head(), log.tail());
        assert!(!log.is_empty());
    }

    #[test]
    fn test_wraps_after_release() {
        let mut log = LogAllocator::new(1, 4);
        assert_eq!(log.next_log_block().unwrap(), 1);
        assert_eq!(log.next_log_block().unwrap(), 2);
        assert_eq!(log.next_log_block().unwrap(), 3);

        assert_eq!(log.release_to(3), 2);
        assert_eq!(log.next_log_block().unwrap(), 1);
        assert_eq!(log.next_log_block().unwrap(), 2);
        assert!(log.next_log_block().is_err());
    }

    #[test]
    fn test_release_to_head_empties_log() {
        let mut log = LogAllocator::new(1, 8);
        log.next_log_block().unwrap();
        log.next_log_block().unwrap();
        let head = log.head();
        assert_eq!(log.release_to(head), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_release_all_from_full_log() {
        let mut log = LogAllocator::new(1, 4);
        for _ in 0..3 {
            log.next_log_block().unwrap();
        }
        assert_eq!(log.release_all(), 3);
        assert!(log.is_empty());
        assert_eq!(log.tail(), log.head());
    }
}
