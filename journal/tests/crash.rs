// Crash consistency tests
// Cut the power at every write of a commit and check what recovery makes of it

mod common;

use common::*;
use jbd_core::{BlockDevice, CrashDevice, MemoryDevice};
use jbd_journal::format::JournalSuperblock;
use jbd_journal::recovery::recover;
use jbd_journal::{BufferCache, Journal};
use std::sync::Arc;

const BLOCKS: [u64; 3] = [30, 31, 32];
const OLD: u8 = 0x11;
const NEW: u8 = 0x22;

/// A device whose blocks hold OLD, with a clean log.
fn baseline() -> Arc<MemoryDevice> {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &BLOCKS, OLD);
    journal.flush().unwrap();
    device
}

fn contents(device: &MemoryDevice) -> Vec<u8> {
    BLOCKS
        .iter()
        .map(|&b| {
            let block = device.block(b);
            assert!(
                block.iter().all(|&x| x == block[0]),
                "block {} is torn",
                b
            );
            block[0]
        })
        .collect()
}

#[test]
fn test_commit_is_atomic_at_every_crash_point() {
    let base = baseline();

    for budget in 0..=12u64 {
        let disk = Arc::new(base.snapshot());
        let crashy = Arc::new(CrashDevice::new(disk.clone(), budget));
        let cache = Arc::new(BufferCache::new(crashy.clone()));
        let journal = Journal::load(cache.clone(), config()).unwrap();

        let mut handle = journal.start(BLOCKS.len() as u32).unwrap();
        for &b in &BLOCKS {
            modify(&journal, &mut handle, &cache, b, NEW);
        }
        journal.stop(handle).unwrap();
        let committed = journal.commit().is_ok();
        let _ = journal.flush();
        drop(journal);

        let (image, _reopened) = remount(&disk, config());
        let after = contents(&image);
        if committed {
            assert_eq!(after, vec![NEW; 3], "budget {}: committed data lost", budget);
        } else {
            assert!(
                after == vec![OLD; 3] || after == vec![NEW; 3],
                "budget {}: mixed contents {:?}",
                budget,
                after
            );
        }
        if budget >= 12 {
            assert!(!crashy.crashed());
        }
    }
}

#[test]
fn test_recovery_is_idempotent() {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[30, 31], 0x5C);
    commit_blocks(&journal, &cache, &[31, 33], 0x6D);

    let image = device.snapshot();
    let sb = JournalSuperblock::decode(&image.block(JOURNAL_START)).unwrap();
    assert_ne!(sb.start, 0);

    let first = recover(&image, JOURNAL_START, &sb).unwrap();
    let once: Vec<Vec<u8>> = (30..34).map(|b| image.block(b)).collect();

    // Power lost again before the superblock was cleaned
    let second = recover(&image, JOURNAL_START, &sb).unwrap();
    let twice: Vec<Vec<u8>> = (30..34).map(|b| image.block(b)).collect();

    assert_eq!(first, second);
    assert_eq!(once, twice);
    assert_eq!(first.nr_replays, 4);
    assert_eq!(image.block(30)[0], 0x5C);
    assert_eq!(image.block(31)[0], 0x6D);
    assert_eq!(image.block(33)[0], 0x6D);
}

#[test]
fn test_relogged_block_survives_older_revoke() {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[60], 0x11);

    let mut handle = journal.start(1).unwrap();
    journal.revoke(&mut handle, 60, None).unwrap();
    journal.stop(handle).unwrap();
    journal.commit().unwrap();

    commit_blocks(&journal, &cache, &[60], 0x33);

    let (image, _journal) = remount(&device, config());
    assert!(image.block(60).iter().all(|&b| b == 0x33));
}

#[test]
fn test_write_access_cancels_own_revoke() {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[61], 0x11);

    let mut handle = journal.start(2).unwrap();
    journal.revoke(&mut handle, 61, None).unwrap();
    modify(&journal, &mut handle, &cache, 61, 0x44);
    journal.stop(handle).unwrap();
    journal.commit().unwrap();

    let log = read_log(&*device, journal.config(), 1);
    assert!(log.iter().all(|e| !matches!(e, LogEntry::Revoke { .. })));

    let (image, _journal) = remount(&device, config());
    assert!(image.block(61).iter().all(|&b| b == 0x44));
}

#[test]
fn test_sequence_continues_after_recovery() {
    let (device, cache, journal) = setup(config());
    let t1 = commit_blocks(&journal, &cache, &[30], 1);
    let t2 = commit_blocks(&journal, &cache, &[31], 2);
    assert_eq!(t2, t1 + 1);

    let (image, reopened) = remount(&device, config());
    let sb = JournalSuperblock::decode(&image.block(JOURNAL_START)).unwrap();
    assert_eq!(sb.start, 0);
    assert_eq!(sb.sequence, t2 + 2);
    assert_eq!(image.block(30)[0], 1);
    assert_eq!(image.block(31)[0], 2);

    let handle = reopened.start(1).unwrap();
    assert_eq!(handle.tid(), t2 + 2);
}

#[test]
fn test_uncommitted_tail_not_replayed() {
    let (device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[30], 1);

    let mut handle = journal.start(1).unwrap();
    modify(&journal, &mut handle, &cache, 31, 2);
    journal.stop(handle).unwrap();
    let head = journal.log_state().head;
    journal.commit().unwrap();
    // The commit record never reached the platter
    device.write_block(JOURNAL_START + head as u64 + 2, &vec![0u8; BS]).unwrap();

    let (image, _journal) = remount(&device, config());
    assert_eq!(image.block(30)[0], 1);
    assert_eq!(image.block(31)[0], 0);
}

#[test]
fn test_revoke_keeps_older_commit_checkpointed() {
    let (device, cache, journal) = setup(config());
    let t1 = commit_blocks(&journal, &cache, &[40], 0xAA);
    let buffer = cache.lookup(40).unwrap();
    assert!(buffer.is_dirty());
    assert_eq!(journal.buffer_checkpoint(&buffer), Some(t1));

    // Freed again by a transaction that never commits
    let mut handle = journal.start(1).unwrap();
    journal.revoke(&mut handle, 40, Some(&buffer)).unwrap();
    assert!(buffer.is_dirty());
    assert_eq!(journal.buffer_owner(&buffer), None);
    assert_eq!(journal.buffer_checkpoint(&buffer), Some(t1));

    let stats = journal.do_checkpoint().unwrap();
    assert_eq!(stats.written, 1);
    assert_eq!(journal.buffer_checkpoint(&buffer), None);
    journal.stop(handle).unwrap();

    let (image, _journal) = remount(&device, config());
    assert!(image.block(40).iter().all(|&b| b == 0xAA));
}
