// Handle lifecycle tests
// Credits, extend/restart, write access rules and abort behavior

mod common;

use common::*;
use jbd_journal::{BufferList, JournalConfig, JournalError};

#[test]
fn test_start_rejects_oversized_request() {
    let (_device, _cache, journal) = setup(config());
    let max = journal.config().max_transaction();
    assert_eq!(max, 32);
    match journal.start(max + 1) {
        Err(JournalError::TransactionTooLarge { requested, max: m }) => {
            assert_eq!(requested, 33);
            assert_eq!(m, 32);
        }
        other => panic!("expected TransactionTooLarge, got {:?}", other),
    }
    assert!(journal.running_transaction().is_none());
}

#[test]
fn test_handles_share_running_transaction() {
    let (_device, _cache, journal) = setup(config());
    let a = journal.start(3).unwrap();
    let b = journal.start(4).unwrap();
    assert_eq!(a.tid(), b.tid());

    let info = journal.running_transaction().unwrap();
    assert_eq!(info.updates, 2);
    assert_eq!(info.handle_count, 2);
    assert_eq!(info.outstanding_credits, 7);
    journal.stop(a).unwrap();
    journal.stop(b).unwrap();
}

#[test]
fn test_credits_exhausted() {
    let (_device, cache, journal) = setup(config());
    let mut handle = journal.start(1).unwrap();
    modify(&journal, &mut handle, &cache, 10, 1);
    assert_eq!(handle.credits(), 0);

    // Dirtying the same buffer again is free
    journal.dirty_metadata(&mut handle, &cache.bread(10).unwrap()).unwrap();

    let other = cache.bread(11).unwrap();
    journal.get_write_access(&mut handle, &other).unwrap();
    assert!(matches!(
        journal.dirty_metadata(&mut handle, &other),
        Err(JournalError::CreditsExhausted)
    ));
    journal.stop(handle).unwrap();
}

#[test]
fn test_stop_returns_unused_credits() {
    let (_device, cache, journal) = setup(config());
    let mut handle = journal.start(10).unwrap();
    modify(&journal, &mut handle, &cache, 10, 1);
    modify(&journal, &mut handle, &cache, 11, 1);
    assert_eq!(journal.running_transaction().unwrap().outstanding_credits, 10);

    journal.stop(handle).unwrap();
    let info = journal.running_transaction().unwrap();
    assert_eq!(info.outstanding_credits, 2);
    assert_eq!(info.updates, 0);
    assert_eq!(info.nr_buffers, 2);
}

#[test]
fn test_extend_within_headroom() {
    let (_device, _cache, journal) = setup(config());
    let mut handle = journal.start(10).unwrap();

    assert!(journal.extend(&mut handle, 5).unwrap());
    assert_eq!(handle.credits(), 15);
    assert_eq!(journal.running_transaction().unwrap().outstanding_credits, 15);

    // 17 credits of headroom cannot cover 10 more plus the reserve
    assert!(!journal.extend(&mut handle, 10).unwrap());
    assert_eq!(handle.credits(), 15);
    journal.stop(handle).unwrap();
}

#[test]
fn test_restart_moves_to_new_transaction() {
    let (_device, cache, journal) = setup(config());
    let mut handle = journal.start(2).unwrap();
    let old = handle.tid();
    modify(&journal, &mut handle, &cache, 10, 1);

    journal.restart(&mut handle, 4).unwrap();
    assert!(handle.is_active());
    assert_eq!(handle.tid(), old + 1);
    assert_eq!(handle.credits(), 4);
    assert_eq!(journal.log_state().commit_sequence, old);

    let info = journal.running_transaction().unwrap();
    assert_eq!(info.tid, old + 1);
    assert_eq!(info.updates, 1);
    journal.stop(handle).unwrap();
}

#[test]
fn test_dirty_without_write_access() {
    let (_device, cache, journal) = setup(config());
    let mut handle = journal.start(1).unwrap();
    let buffer = cache.bread(10).unwrap();
    assert!(matches!(
        journal.dirty_metadata(&mut handle, &buffer),
        Err(JournalError::Other(_))
    ));
    journal.stop(handle).unwrap();
}

#[test]
fn test_write_access_files_reserved() {
    let (_device, cache, journal) = setup(config());
    let mut handle = journal.start(1).unwrap();
    let tid = handle.tid();
    let buffer = cache.bread(10).unwrap();
    journal.get_write_access(&mut handle, &buffer).unwrap();
    assert_eq!(journal.buffer_owner(&buffer), Some((tid, BufferList::Reserved)));
    assert!(buffer.is_journaled());
    journal.stop(handle).unwrap();

    // Never modified: the commit lets it go
    journal.commit().unwrap();
    assert_eq!(journal.buffer_owner(&buffer), None);
    assert!(!buffer.is_journaled());
}

#[test]
fn test_read_only_journal_refuses_handles() {
    let (device, _cache, journal) = setup(config());
    drop(journal);
    let read_only = JournalConfig {
        read_only: true,
        ..config()
    };
    let (_image, journal) = remount(&device, read_only);
    assert!(matches!(journal.start(1), Err(JournalError::ReadOnly)));
}

#[test]
fn test_undo_access_keeps_committed_copy() {
    let (_device, cache, journal) = setup(config());
    commit_blocks(&journal, &cache, &[20], 0x11);

    let mut handle = journal.start(1).unwrap();
    let buffer = cache.bread(20).unwrap();
    journal.get_undo_access(&mut handle, &buffer).unwrap();
    buffer.data_mut().fill(0x22);
    journal.dirty_metadata(&mut handle, &buffer).unwrap();
    assert_eq!(journal.committed_data(&buffer), Some(vec![0x11; BS]));
    assert_eq!(buffer.data()[0], 0x22);
    journal.stop(handle).unwrap();

    journal.commit().unwrap();
    assert_eq!(journal.committed_data(&buffer), None);
}

#[test]
fn test_dropped_handle_is_stopped() {
    let (_device, _cache, journal) = setup(config());
    {
        let _handle = journal.start(3).unwrap();
        assert_eq!(journal.running_transaction().unwrap().updates, 1);
    }
    let info = journal.running_transaction().unwrap();
    assert_eq!(info.updates, 0);
    assert_eq!(info.outstanding_credits, 0);
}

#[test]
fn test_abort_fails_everything_after() {
    let (device, cache, journal) = setup(config());
    let mut handle = journal.start(2).unwrap();
    modify(&journal, &mut handle, &cache, 10, 1);

    journal.abort();
    assert!(journal.is_aborted());
    assert_eq!(journal.errno(), -5);

    let buffer = cache.bread(11).unwrap();
    assert!(matches!(
        journal.get_write_access(&mut handle, &buffer),
        Err(JournalError::Aborted)
    ));
    assert!(matches!(journal.stop(handle), Err(JournalError::Aborted)));
    assert!(matches!(journal.start(1), Err(JournalError::Aborted)));

    // The aborted transaction never reaches the log
    let writes = device.write_count();
    assert!(journal.commit().is_err());
    assert_eq!(device.write_count(), writes);
    assert!(read_log(&*device, journal.config(), 1).is_empty());
    assert!(matches!(journal.flush(), Err(JournalError::Aborted)));
}

#[test]
fn test_sync_handle_waits_for_commit() {
    let (device, cache, journal) = setup(config());
    let mut handle = journal.start(1).unwrap();
    let tid = handle.tid();
    modify(&journal, &mut handle, &cache, 10, 9);
    handle.set_sync(true);
    journal.stop(handle).unwrap();

    assert_eq!(journal.log_state().commit_sequence, tid);
    assert!(journal.running_transaction().is_none());
    assert_eq!(
        read_log(&*device, journal.config(), 1).last(),
        Some(&LogEntry::Commit { tid })
    );
}

#[test]
fn test_restarted_handle_keeps_working() {
    let (_device, cache, journal) = setup(config());
    let mut handle = journal.start(2).unwrap();
    let first = handle.tid();
    journal.restart(&mut handle, 1).unwrap();
    assert_ne!(handle.tid(), first);

    let buffer = cache.bread(10).unwrap();
    journal.get_write_access(&mut handle, &buffer).unwrap();
    journal.stop(handle).unwrap();
}

#[test]
fn test_full_transaction_restarts_and_commits_prior_writes() {
    let config = JournalConfig {
        max_transaction_buffers: 8,
        reserve_credits: 2,
        ..config()
    };
    config.validate().unwrap();
    let (device, cache, journal) = setup(config);

    let mut handle = journal.start(8).unwrap();
    let old = handle.tid();
    assert!(!journal.extend(&mut handle, 1).unwrap());
    modify(&journal, &mut handle, &cache, 50, 0x5A);

    journal.restart(&mut handle, 2).unwrap();
    assert_ne!(handle.tid(), old);
    assert_eq!(handle.credits(), 2);
    assert_eq!(journal.log_state().commit_sequence, old);

    let log = read_log(&*device, journal.config(), 1);
    let logged = log.iter().position(|e| match e {
        LogEntry::Descriptor { tid, tags, copies } => {
            *tid == old
                && tags.iter().zip(copies).any(|(tag, copy)| {
                    tag.blocknr == 50 && copy.iter().all(|&b| b == 0x5A)
                })
        }
        _ => false,
    });
    let logged = logged.expect("block 50 missing from the restarted transaction");
    assert!(log[logged + 1..].contains(&LogEntry::Commit { tid: old }));

    modify(&journal, &mut handle, &cache, 51, 0x5B);
    journal.stop(handle).unwrap();
}
