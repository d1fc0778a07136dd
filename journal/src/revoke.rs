// Revoke Tables
// Blocks whose earlier logged contents must not be replayed

use jcommit_core::{BlockNumber, Tid};
use std::collections::HashMap;

/// Two hash tables: handles add to the current one while the committing
/// transaction owns the other. The commit switches them at the start of
/// its flush phase so revokes of the next transaction do not blend in.
#[derive(Debug, Default)]
pub struct RevokeTable {
    tables: [HashMap<BlockNumber, Tid>; 2],
    current: usize,
}

impl RevokeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revoke of `block` by transaction `tid`.
    pub fn revoke(&mut self, block: BlockNumber, tid: Tid) {
        self.tables[self.current].insert(block, tid);
    }

    /// Drop a pending revoke, e.g. when the block is journaled again.
    pub fn cancel(&mut self, block: BlockNumber) -> bool {
        self.tables[self.current].remove(&block).is_some()
    }

    pub fn is_revoked(&self, block: BlockNumber) -> Option<Tid> {
        self.tables[self.current]
            .get(&block)
            .or_else(|| self.tables[1 - self.current].get(&block))
            .copied()
    }

    /// Make the other table current and return the records gathered in the
    /// one just retired, sorted by block. The new current table starts empty.
    pub fn switch_table(&mut self) -> Vec<(BlockNumber, Tid)> {
        let retired = self.current;
        self.current = 1 - self.current;
        self.tables[self.current].clear();
        let mut records: Vec<_> = self.tables[retired].iter().map(|(b, t)| (*b, *t)).collect();
        records.sort_unstable();
        records
    }

    pub fn pending(&self) -> usize {
        self.tables[self.current].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_separates_transactions() {
        let mut table = RevokeTable::new();
        table.revoke(10, 1);
        table.revoke(4, 1);

        let retired = table.switch_table();
        assert_eq!(retired, vec![(4, 1), (10, 1)]);
        assert_eq!(table.pending(), 0);

        table.revoke(11, 2);
        assert_eq!(table.is_revoked(10), Some(1));
        assert_eq!(table.is_revoked(11), Some(2));

        // the table retired earlier is reused and cleared
        assert_eq!(table.switch_table(), vec![(11, 2)]);
        assert_eq!(table.is_revoked(10), None);
    }

    #[test]
    fn test_cancel() {
        let mut table = RevokeTable::new();
        table.revoke(3, 1);
        assert!(table.cancel(3));
        assert!(!table.cancel(3));
        assert_eq!(table.is_revoked(3), None);
    }
}
