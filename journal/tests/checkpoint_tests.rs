// Checkpoint tests
// Writing committed buffers home and moving the log tail

mod common;

#[cfg(test)]
mod checkpoint_tests {
    use super::common::{config, write_metadata, Rig, BS};
    use jcommit_journal::{JournalConfig, JournalSuperblock};

    fn commit_one(rig: &Rig, blocknr: u64, fill: u8) -> u32 {
        let mut handle = rig.journal.start_handle(1).unwrap();
        let tid = handle.tid();
        write_metadata(&rig.journal, &mut handle, blocknr, fill);
        handle.stop().unwrap();
        rig.journal.commit().unwrap();
        tid
    }

    #[test]
    fn test_checkpoint_empties_log() {
        let rig = Rig::new(config());
        let journal = &rig.journal;
        let first = commit_one(&rig, 100, 0x01);
        let second = commit_one(&rig, 101, 0x02);

        let sb = JournalSuperblock::decode(&rig.log.block(0).unwrap()).unwrap();
        assert_eq!((sb.start, sb.sequence), (1, first));
        assert_eq!(journal.checkpoint_transactions(), vec![first, second]);
        assert_eq!(journal.log_free_blocks(), 63 - 6);

        let stats = journal.checkpoint().unwrap();
        assert_eq!(stats.blocks_written, 2);
        assert_eq!(stats.transactions_checkpointed, 2);
        assert_eq!(stats.log_blocks_released, 6);

        assert_eq!(rig.fs.block(100).unwrap(), vec![0x01; BS]);
        assert_eq!(rig.fs.block(101).unwrap(), vec![0x02; BS]);
        let sb = JournalSuperblock::decode(&rig.log.block(0).unwrap()).unwrap();
        assert!(sb.is_empty_log());
        assert_eq!(sb.sequence, second + 1);
        assert_eq!(journal.log_free_blocks(), 63);
        assert_eq!(journal.head_count(), 0);
        assert_eq!(journal.transaction_count(), 0);
        assert_eq!(journal.stats().checkpoint_writes, 2);
    }

    #[test]
    fn test_checkpoint_waits_for_newer_owner() {
        let rig = Rig::new(config());
        let journal = &rig.journal;
        commit_one(&rig, 100, 0x01);

        // journaled again but not committed yet
        let mut handle = journal.start_handle(1).unwrap();
        let tid = handle.tid();
        write_metadata(journal, &mut handle, 100, 0x02);
        handle.stop().unwrap();

        journal.checkpoint().unwrap();
        assert_eq!(journal.commit_sequence(), tid);
        assert_eq!(rig.fs.block(100).unwrap(), vec![0x02; BS]);
        assert!(journal.checkpoint_transactions().is_empty());
        assert!(journal.superblock().is_empty_log());
    }

    #[test]
    fn test_cleanup_drops_superseded_transaction() {
        let rig = Rig::new(config());
        let journal = &rig.journal;
        let first = commit_one(&rig, 100, 0x01);
        let second = commit_one(&rig, 100, 0x02);

        // the second commit took over the only buffer of the first
        assert_eq!(journal.checkpoint_transactions(), vec![first, second]);
        assert_eq!(journal.cleanup_checkpoint(), 0);
        assert_eq!(journal.checkpoint_transactions(), vec![second]);
        assert!(rig.fs.block(100).is_none());
    }

    #[test]
    fn test_cleanup_releases_clean_buffers() {
        let rig = Rig::new(config());
        let journal = &rig.journal;
        commit_one(&rig, 100, 0x01);

        // written home behind the journal's back
        let buffer = journal.buffer(100).unwrap();
        buffer.state().dirty = false;

        assert_eq!(journal.cleanup_checkpoint(), 1);
        assert!(journal.checkpoint_transactions().is_empty());
        assert_eq!(journal.head_count(), 0);
    }

    #[test]
    fn test_full_log_checkpoints_to_make_room() {
        let config = JournalConfig {
            log_blocks: 16,
            ..config()
        };
        let rig = Rig::new(config);
        let journal = &rig.journal;
        assert_eq!(journal.max_transaction_buffers(), 3);

        for round in 0..8u64 {
            let mut handle = journal.start_handle(3).unwrap();
            for i in 0..3 {
                write_metadata(journal, &mut handle, 1000 + round * 3 + i, round as u8 + 1);
            }
            handle.stop().unwrap();
            journal.commit().unwrap();
        }
        assert!(journal.stats().checkpoint_writes > 0);

        // whatever was not checkpointed yet comes back from the wrapped log
        let (rig, _) = rig.reopen();
        for round in 0..8u64 {
            for i in 0..3 {
                assert_eq!(
                    rig.fs.block(1000 + round * 3 + i).unwrap(),
                    vec![round as u8 + 1; BS]
                );
            }
        }
    }

    #[test]
    fn test_flush_leaves_nothing_behind() {
        let rig = Rig::new(config());
        let journal = &rig.journal;
        let mut handle = journal.start_handle(2).unwrap();
        write_metadata(journal, &mut handle, 100, 0x01);
        write_metadata(journal, &mut handle, 101, 0x02);
        handle.stop().unwrap();

        journal.flush().unwrap();
        assert_eq!(rig.fs.block(100).unwrap(), vec![0x01; BS]);
        assert_eq!(rig.fs.block(101).unwrap(), vec![0x02; BS]);
        assert!(journal.superblock().is_empty_log());
        assert_eq!(journal.transaction_count(), 0);
    }

    #[test]
    fn test_forget_drops_older_checkpoint_entry() {
        let rig = Rig::new(config());
        let journal = &rig.journal;
        let first = commit_one(&rig, 100, 0x01);

        // modified again, then freed within the same transaction
        let mut handle = journal.start_handle(1).unwrap();
        let buffer = write_metadata(journal, &mut handle, 100, 0x02);
        handle.forget(&buffer).unwrap();
        handle.stop().unwrap();
        journal.commit().unwrap();

        // nothing still pins the freed buffer to the first transaction
        assert!(journal.head_info(&buffer).is_none());
        assert_eq!(journal.head_count(), 0);
        assert_eq!(journal.checkpoint_transactions(), vec![first]);

        let stats = journal.checkpoint().unwrap();
        assert_eq!(stats.blocks_written, 0);
        assert_eq!(stats.transactions_checkpointed, 1);
        assert!(rig.fs.block(100).is_none());
        assert!(journal.superblock().is_empty_log());
    }
}
