// Shared helpers for journal integration tests

#![allow(dead_code)]

use jbd_core::{BlockDevice, MemoryDevice};
use jbd_journal::format::{
    parse_descriptor, parse_revoke_block, BlockTag, JournalHeader, JBD_COMMIT_BLOCK,
    JBD_DESCRIPTOR_BLOCK, JBD_REVOKE_BLOCK,
};
use jbd_journal::{BufferCache, BufferRef, Handle, Journal, JournalConfig};
use std::sync::Arc;

pub const BS: usize = 1024;
pub const JOURNAL_START: u64 = 256;
pub const JOURNAL_BLOCKS: u32 = 128;
pub const DEVICE_BLOCKS: u64 = JOURNAL_START + JOURNAL_BLOCKS as u64;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 1 KiB blocks, a 128 block log after 256 filesystem blocks, 32 credits
/// per transaction.
pub fn config() -> JournalConfig {
    JournalConfig {
        block_size: BS,
        journal_start: JOURNAL_START,
        journal_blocks: JOURNAL_BLOCKS,
        commit_interval_ms: 20,
        ..Default::default()
    }
}

pub fn setup(config: JournalConfig) -> (Arc<MemoryDevice>, Arc<BufferCache>, Arc<Journal>) {
    init_logging();
    let device = Arc::new(MemoryDevice::new(BS, DEVICE_BLOCKS));
    let cache = Arc::new(BufferCache::new(device.clone()));
    let journal = Journal::create(cache.clone(), config).unwrap();
    (device, cache, journal)
}

/// Open the journal on a copy of `device`, running recovery if needed.
pub fn remount(device: &MemoryDevice, config: JournalConfig) -> (Arc<MemoryDevice>, Arc<Journal>) {
    let image = Arc::new(device.snapshot());
    let cache = Arc::new(BufferCache::new(image.clone()));
    let journal = Journal::load(cache, config).unwrap();
    (image, journal)
}

/// Journal a whole-block write of `value` to `blocknr`.
pub fn modify(
    journal: &Arc<Journal>,
    handle: &mut Handle,
    cache: &BufferCache,
    blocknr: u64,
    value: u8,
) -> BufferRef {
    let buffer = cache.bread(blocknr).unwrap();
    journal.get_write_access(handle, &buffer).unwrap();
    buffer.data_mut().fill(value);
    journal.dirty_metadata(handle, &buffer).unwrap();
    buffer
}

/// One transaction touching `blocks`, committed before returning its tid.
pub fn commit_blocks(journal: &Arc<Journal>, cache: &BufferCache, blocks: &[u64], value: u8) -> u32 {
    let mut handle = journal.start(blocks.len() as u32).unwrap();
    let tid = handle.tid();
    for &b in blocks {
        modify(journal, &mut handle, cache, b, value);
    }
    journal.stop(handle).unwrap();
    journal.commit().unwrap();
    tid
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Descriptor {
        tid: u32,
        tags: Vec<BlockTag>,
        copies: Vec<Vec<u8>>,
    },
    Commit {
        tid: u32,
    },
    Revoke {
        tid: u32,
        blocks: Vec<u64>,
    },
}

/// Walk the log from `from` until the first block that is not a log
/// control block.
pub fn read_log(device: &dyn BlockDevice, config: &JournalConfig, from: u32) -> Vec<LogEntry> {
    let last = config.journal_blocks;
    let advance = |b: u32| if b + 1 >= last { 1 } else { b + 1 };
    let read = |b: u32| {
        let mut buf = vec![0u8; config.block_size];
        device
            .read_block(config.journal_start + b as u64, &mut buf)
            .unwrap();
        buf
    };

    let mut entries = Vec::new();
    let mut at = from;
    for _ in 0..last {
        let block = read(at);
        at = advance(at);
        let header = match JournalHeader::read_from(&block) {
            Some(h) if h.is_valid() => h,
            _ => break,
        };
        match header.blocktype {
            JBD_DESCRIPTOR_BLOCK => {
                let tags = parse_descriptor(&block);
                let mut copies = Vec::new();
                for _ in &tags {
                    copies.push(read(at));
                    at = advance(at);
                }
                entries.push(LogEntry::Descriptor {
                    tid: header.sequence,
                    tags,
                    copies,
                });
            }
            JBD_COMMIT_BLOCK => entries.push(LogEntry::Commit {
                tid: header.sequence,
            }),
            JBD_REVOKE_BLOCK => entries.push(LogEntry::Revoke {
                tid: header.sequence,
                blocks: parse_revoke_block(&block).unwrap(),
            }),
            _ => break,
        }
    }
    entries
}
