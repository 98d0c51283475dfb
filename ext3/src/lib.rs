// Ext3-style Client Filesystem
// Inodes with indirect block trees, updated through journal handles

pub mod balloc;
pub mod inode;
pub mod truncate;

pub use inode::{Ext3Inode, INODE_ORPHAN, N_BLOCKS};
pub use truncate::TruncateReport;

use inode::INODE_SIZE;
use jbd_core::{JournalError, Result};
use jbd_journal::{BufferCache, Handle, Journal, JournalConfig, JournalMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Credits of a single block write: bitmap, three tree levels, data, inode
/// and headroom
pub const WRITE_CREDITS: u32 = 8;

/// Where the filesystem keeps its metadata on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// First block of the inode table, one inode per block
    pub inode_table: u64,
    pub inode_count: u32,
    /// The block bitmap, one bit per data block
    pub bitmap: u64,
    /// First block handed out by the allocator
    pub first_data: u64,
    pub data_blocks: u64,
}

impl Layout {
    /// Check the layout against the block size and the journal's area.
    pub fn validate(&self, block_size: usize, journal: &JournalConfig) -> Result<()> {
        if self.inode_count == 0 || self.data_blocks == 0 {
            return Err(JournalError::InvalidConfig(
                "layout needs at least one inode and one data block".to_string(),
            ));
        }
        if self.data_blocks > block_size as u64 * 8 {
            return Err(JournalError::InvalidConfig(format!(
                "{} data blocks do not fit a bitmap of one {} byte block",
                self.data_blocks, block_size
            )));
        }
        if self.first_data + self.data_blocks > u32::MAX as u64 {
            return Err(JournalError::InvalidConfig(
                "data blocks must be addressable by 32-bit pointers".to_string(),
            ));
        }

        let regions = [
            ("inode table", self.inode_table, self.inode_count as u64),
            ("bitmap", self.bitmap, 1),
            ("data area", self.first_data, self.data_blocks),
            ("journal", journal.journal_start, journal.journal_blocks as u64),
        ];
        for (i, &(name, start, len)) in regions.iter().enumerate() {
            for &(other, other_start, other_len) in &regions[i + 1..] {
                if start < other_start + other_len && other_start < start + len {
                    return Err(JournalError::InvalidConfig(format!(
                        "{} overlaps the {}",
                        name, other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Block holding inode `ino`. Inodes are numbered from 1.
    pub fn inode_block(&self, ino: u32) -> Result<u64> {
        if ino == 0 || ino > self.inode_count {
            return Err(JournalError::OutOfRange {
                block: ino as u64,
                len: self.inode_count as u64,
            });
        }
        Ok(self.inode_table + (ino - 1) as u64)
    }

    pub fn is_data_block(&self, blocknr: u64) -> bool {
        blocknr >= self.first_data && blocknr < self.first_data + self.data_blocks
    }
}

/// A mounted filesystem: the journal plus the layout it journals for.
pub struct Ext3Fs {
    journal: Arc<Journal>,
    cache: Arc<BufferCache>,
    layout: Layout,
    block_size: usize,
}

impl Ext3Fs {
    /// Zero the inode table and the bitmap, then mount.
    pub fn format(journal: Arc<Journal>, layout: Layout) -> Result<Self> {
        let fs = Self::open(journal, layout)?;
        let blocks = (0..fs.layout.inode_count as u64)
            .map(|i| fs.layout.inode_table + i)
            .chain(std::iter::once(fs.layout.bitmap));
        for blocknr in blocks {
            let buffer = fs.cache.getblk(blocknr);
            buffer.data_mut().fill(0);
            buffer.mark_uptodate();
            buffer.mark_dirty();
        }
        fs.cache.sync_dirty()?;
        log::info!(
            "formatted {} inodes and {} data blocks",
            fs.layout.inode_count,
            fs.layout.data_blocks
        );
        Ok(fs)
    }

    pub fn open(journal: Arc<Journal>, layout: Layout) -> Result<Self> {
        let block_size = journal.config().block_size;
        layout.validate(block_size, journal.config())?;
        if block_size < INODE_SIZE {
            return Err(JournalError::InvalidBlockSize {
                expected: INODE_SIZE,
                actual: block_size,
            });
        }
        Ok(Self {
            cache: journal.cache().clone(),
            journal,
            layout,
            block_size,
        })
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn read_inode(&self, ino: u32) -> Result<Ext3Inode> {
        let buffer = self.cache.bread(self.layout.inode_block(ino)?)?;
        let inode = Ext3Inode::decode(&buffer.data());
        Ok(inode)
    }

    pub(crate) fn write_inode(
        &self,
        handle: &mut Handle,
        ino: u32,
        inode: &Ext3Inode,
    ) -> Result<()> {
        let buffer = self.cache.bread(self.layout.inode_block(ino)?)?;
        self.journal.get_write_access(handle, &buffer)?;
        inode.encode_into(&mut buffer.data_mut());
        self.journal.dirty_metadata(handle, &buffer)
    }

    /// Write one logical block of a file, mapping it first if needed.
    /// Short data is zero-padded. Returns the physical block.
    pub fn write_block(&self, ino: u32, logical: u64, data: &[u8]) -> Result<u64> {
        if data.len() > self.block_size {
            return Err(JournalError::InvalidBlockSize {
                expected: self.block_size,
                actual: data.len(),
            });
        }
        let mut inode = self.read_inode(ino)?;
        let mut handle = self.journal.start(WRITE_CREDITS)?;

        let blocknr = self.map_block(&mut handle, &mut inode, logical)?;
        let buffer = self.cache.getblk(blocknr);
        if self.journal.config().mode == JournalMode::Journal {
            self.journal.get_write_access(&mut handle, &buffer)?;
        }
        {
            let mut block = buffer.data_mut();
            block[..data.len()].copy_from_slice(data);
            block[data.len()..].fill(0);
        }
        buffer.mark_uptodate();
        self.journal.dirty_data(&mut handle, &buffer)?;

        let end = logical * self.block_size as u64 + data.len() as u64;
        inode.size = inode.size.max(end);
        self.write_inode(&mut handle, ino, &inode)?;
        self.journal.stop(handle)?;
        log::trace!("inode {}: logical block {} -> {}", ino, logical, blocknr);
        Ok(blocknr)
    }

    /// Contents of one logical block, or `None` for a hole.
    pub fn read_block(&self, ino: u32, logical: u64) -> Result<Option<Vec<u8>>> {
        let inode = self.read_inode(ino)?;
        let Some(blocknr) = self.lookup_block(&inode, logical)? else {
            return Ok(None);
        };
        let buffer = self.cache.bread(blocknr)?;
        let data = buffer.data().to_vec();
        Ok(Some(data))
    }

    /// Finish every truncate a crash interrupted. Returns the inodes that
    /// were still flagged.
    pub fn recover_orphans(&self) -> Result<Vec<u32>> {
        let mut recovered = Vec::new();
        for ino in 1..=self.layout.inode_count {
            let inode = self.read_inode(ino)?;
            if !inode.is_orphan() {
                continue;
            }
            log::info!("finishing interrupted truncate of inode {}", ino);
            self.truncate(ino, inode.size)?;
            recovered.push(ino);
        }
        Ok(recovered)
    }
}
