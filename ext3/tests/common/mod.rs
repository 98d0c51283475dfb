// Shared helpers for ext3 integration tests

#![allow(dead_code)]

use jbd_core::{BlockDevice, MemoryDevice};
use jbd_ext3::{Ext3Fs, Layout};
use jbd_journal::{BufferCache, Journal, JournalConfig, JournalMode};
use std::sync::Arc;

pub const BS: usize = 1024;
pub const DEVICE_BLOCKS: u64 = 640;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Eight inodes, a bitmap and 500 data blocks ahead of a 128 block log.
pub fn layout() -> Layout {
    Layout {
        inode_table: 1,
        inode_count: 8,
        bitmap: 9,
        first_data: 10,
        data_blocks: 500,
    }
}

/// Small transactions so long truncates have to restart.
pub fn config() -> JournalConfig {
    JournalConfig {
        block_size: BS,
        journal_start: 512,
        journal_blocks: 128,
        max_transaction_buffers: 16,
        reserve_credits: 4,
        commit_interval_ms: 20,
        ..Default::default()
    }
}

pub fn journal_config() -> JournalConfig {
    JournalConfig {
        mode: JournalMode::Journal,
        ..config()
    }
}

/// A freshly formatted filesystem on `device`.
pub fn format_on(device: Arc<dyn BlockDevice>, config: JournalConfig) -> Ext3Fs {
    init_logging();
    let cache = Arc::new(BufferCache::new(device));
    let journal = Journal::create(cache, config).unwrap();
    Ext3Fs::format(journal, layout()).unwrap()
}

pub fn setup(config: JournalConfig) -> (Arc<MemoryDevice>, Ext3Fs) {
    let device = Arc::new(MemoryDevice::new(BS, DEVICE_BLOCKS));
    let fs = format_on(device.clone(), config);
    (device, fs)
}

/// Mount an existing filesystem, replaying its log if needed.
pub fn mount(device: Arc<dyn BlockDevice>, config: JournalConfig) -> Ext3Fs {
    init_logging();
    let cache = Arc::new(BufferCache::new(device));
    let journal = Journal::load(cache, config).unwrap();
    Ext3Fs::open(journal, layout()).unwrap()
}

/// Mount a copy of `device`, as if the machine lost power right now.
pub fn crash_and_mount(device: &MemoryDevice, config: JournalConfig) -> (Arc<MemoryDevice>, Ext3Fs) {
    let image = Arc::new(device.snapshot());
    let fs = mount(image.clone(), config);
    (image, fs)
}

pub fn block_of(value: u8) -> Vec<u8> {
    vec![value; BS]
}

/// Every block reachable from an inode is allocated and nothing else is.
pub fn assert_consistent(fs: &Ext3Fs) {
    let mut mapped = Vec::new();
    for ino in 1..=fs.layout().inode_count {
        mapped.extend(fs.mapped_blocks(ino).unwrap());
    }
    mapped.sort_unstable();
    let before = mapped.len();
    mapped.dedup();
    assert_eq!(before, mapped.len(), "a block is mapped twice");
    assert_eq!(mapped, fs.allocated_blocks().unwrap());
}
