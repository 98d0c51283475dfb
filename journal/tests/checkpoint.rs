// Checkpoint tests
// Write-back of committed buffers and reuse of log space

mod common;

use common::*;
use jbd_journal::format::JournalSuperblock;
use std::collections::HashMap;

#[test]
fn test_writeback_releases_checkpoint() {
    let (device, cache, journal) = setup(config());
    let tid = commit_blocks(&journal, &cache, &[30], 0x30);
    let buffer = cache.bread(30).unwrap();

    assert_eq!(journal.buffer_checkpoint(&buffer), Some(tid));
    assert!(buffer.is_dirty());
    let pending = journal.checkpoint_transactions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].checkpoint_buffers, 1);

    assert_eq!(cache.sync_dirty().unwrap(), 1);
    assert!(device.block(30).iter().all(|&b| b == 0x30));
    assert!(journal.checkpoint_transactions().is_empty());
    assert_eq!(journal.buffer_checkpoint(&buffer), None);
    assert!(!journal.is_journaled(&buffer));
}

#[test]
fn test_do_checkpoint_writes_oldest() {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[30, 31, 32], 0x0C);

    let stats = journal.do_checkpoint().unwrap();
    assert_eq!(stats.written, 3);
    assert_eq!(stats.released, 0);
    for block in 30..33 {
        assert!(device.block(block).iter().all(|&b| b == 0x0C));
    }
    assert!(journal.checkpoint_transactions().is_empty());

    let log = journal.log_state();
    assert_eq!(log.tail, log.head);
    assert_eq!(log.free, log.capacity());
    assert_eq!(journal.stats().checkpoints, 1);
}

#[test]
fn test_rejournaled_buffer_moves_checkpoint() {
    let (_device, cache, journal) = setup(config());
    let t1 = commit_blocks(&journal, &cache, &[30, 31], 1);
    let t2 = commit_blocks(&journal, &cache, &[31, 32], 2);

    let b30 = cache.bread(30).unwrap();
    let b31 = cache.bread(31).unwrap();
    assert_eq!(journal.buffer_checkpoint(&b30), Some(t1));
    assert_eq!(journal.buffer_checkpoint(&b31), Some(t2));

    let pending = journal.checkpoint_transactions();
    let sizes: Vec<(u32, usize)> = pending.iter().map(|t| (t.tid, t.checkpoint_buffers)).collect();
    assert_eq!(sizes, vec![(t1, 1), (t2, 2)]);
}

#[test]
fn test_tail_advances_monotonically() {
    let (device, cache, journal) = setup(config());
    let t1 = commit_blocks(&journal, &cache, &[30, 31], 1);
    let t2 = commit_blocks(&journal, &cache, &[31, 32], 2);
    assert_eq!(journal.log_state().tail_sequence, t1);

    let t2_start = journal.checkpoint_transactions()[1].log_start.unwrap();
    journal.do_checkpoint().unwrap();
    let log = journal.log_state();
    assert_eq!(log.tail_sequence, t2);
    assert_eq!(log.tail, t2_start);

    let sb = JournalSuperblock::decode(&device.block(JOURNAL_START)).unwrap();
    assert_eq!(sb.sequence, t2);
    assert_eq!(sb.start, t2_start);

    journal.do_checkpoint().unwrap();
    let after = journal.log_state();
    assert_eq!(after.tail_sequence, t2 + 1);
    assert_eq!(after.tail, after.head);
    assert_eq!(after.free, after.capacity());
}

#[test]
fn test_checkpoint_waits_for_newer_owner() {
    let (_device, cache, journal) = setup(config());
    let t1 = commit_blocks(&journal, &cache, &[40], 1);

    let mut handle = journal.start(1).unwrap();
    let t2 = handle.tid();
    modify(&journal, &mut handle, &cache, 40, 2);
    journal.stop(handle).unwrap();

    let stats = journal.do_checkpoint().unwrap();
    assert_eq!(stats.commits_waited, 1);
    assert_eq!(stats.written, 0);
    assert_eq!(journal.log_state().commit_sequence, t2);

    let pending = journal.checkpoint_transactions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tid, t2);
    assert_ne!(pending[0].tid, t1);
}

#[test]
fn test_log_space_reused() {
    let (device, cache, journal) = setup(config());
    let mut expected = HashMap::new();

    for i in 0..50u32 {
        let first = 10 + (i as u64 % 40) * 4;
        let blocks: Vec<u64> = (first..first + 4).collect();
        let value = (i + 1) as u8;
        commit_blocks(&journal, &cache, &blocks, value);
        for b in blocks {
            expected.insert(b, value);
        }
    }

    let stats = journal.stats();
    assert_eq!(stats.transactions_committed, 50);
    assert!(stats.checkpoints > 0);

    journal.flush().unwrap();
    for (block, value) in &expected {
        assert!(
            device.block(*block).iter().all(|b| b == value),
            "block {} lost its last value {}",
            block,
            value
        );
    }
}

#[test]
fn test_flush_leaves_clean_log() {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[30, 31], 5);
    let sb = JournalSuperblock::decode(&device.block(JOURNAL_START)).unwrap();
    assert_ne!(sb.start, 0);

    let mut handle = journal.start(1).unwrap();
    modify(&journal, &mut handle, &cache, 33, 6);
    journal.stop(handle).unwrap();

    journal.flush().unwrap();
    let sb = JournalSuperblock::decode(&device.block(JOURNAL_START)).unwrap();
    assert_eq!(sb.start, 0);
    assert_eq!(sb.sequence, journal.log_state().transaction_sequence);
    assert!(device.block(33).iter().all(|&b| b == 6));
    assert!(journal.running_transaction().is_none());
    assert!(journal.checkpoint_transactions().is_empty());

    // A clean log needs no recovery and keeps the sequence going
    let (_image, reopened) = remount(&device, config());
    let handle = reopened.start(1).unwrap();
    assert_eq!(handle.tid(), sb.sequence);
}

#[test]
fn test_destroy_refuses_new_handles() {
    let (_device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[30], 1);
    journal.destroy().unwrap();
    assert!(journal.start(1).is_err());
}
