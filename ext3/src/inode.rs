// Inode Layout and Block Mapping
// One little-endian inode per block, 12 direct pointers plus indirect and double indirect

use crate::Ext3Fs;
use byteorder::{ByteOrder, LittleEndian};
use jbd_core::{JournalError, Result};
use jbd_journal::{BufferRef, Handle};

pub const NDIR_BLOCKS: usize = 12;
pub const IND_BLOCK: usize = 12;
pub const DIND_BLOCK: usize = 13;
pub const N_BLOCKS: usize = 14;

/// Inode flag: a truncate was in progress and must be finished after a crash
pub const INODE_ORPHAN: u32 = 0x1;

const SIZE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 8;
const NR_BLOCKS_OFFSET: usize = 12;
const BLOCKS_OFFSET: usize = 16;
pub const INODE_SIZE: usize = BLOCKS_OFFSET + N_BLOCKS * 4;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ext3Inode {
    /// File size in bytes
    pub size: u64,
    pub flags: u32,
    /// Blocks allocated to the file, indirect blocks included
    pub nr_blocks: u32,
    pub blocks: [u32; N_BLOCKS],
}

impl Ext3Inode {
    pub fn decode(block: &[u8]) -> Self {
        let mut blocks = [0u32; N_BLOCKS];
        for (i, slot) in blocks.iter_mut().enumerate() {
            *slot = read_ptr(&block[BLOCKS_OFFSET..], i);
        }
        Self {
            size: LittleEndian::read_u64(&block[SIZE_OFFSET..SIZE_OFFSET + 8]),
            flags: LittleEndian::read_u32(&block[FLAGS_OFFSET..FLAGS_OFFSET + 4]),
            nr_blocks: LittleEndian::read_u32(&block[NR_BLOCKS_OFFSET..NR_BLOCKS_OFFSET + 4]),
            blocks,
        }
    }

    pub fn encode_into(&self, block: &mut [u8]) {
        LittleEndian::write_u64(&mut block[SIZE_OFFSET..SIZE_OFFSET + 8], self.size);
        LittleEndian::write_u32(&mut block[FLAGS_OFFSET..FLAGS_OFFSET + 4], self.flags);
        LittleEndian::write_u32(&mut block[NR_BLOCKS_OFFSET..NR_BLOCKS_OFFSET + 4], self.nr_blocks);
        for (i, &ptr) in self.blocks.iter().enumerate() {
            write_ptr(&mut block[BLOCKS_OFFSET..], i, ptr);
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.flags & INODE_ORPHAN != 0
    }
}

/// Where a logical block's pointer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPath {
    Direct(usize),
    Indirect(usize),
    DoubleIndirect(usize, usize),
}

/// Resolve a logical block number for blocks holding `per_block` pointers.
pub fn block_path(logical: u64, per_block: u64) -> Result<BlockPath> {
    if logical < NDIR_BLOCKS as u64 {
        return Ok(BlockPath::Direct(logical as usize));
    }
    let rest = logical - NDIR_BLOCKS as u64;
    if rest < per_block {
        return Ok(BlockPath::Indirect(rest as usize));
    }
    let rest = rest - per_block;
    if rest < per_block * per_block {
        return Ok(BlockPath::DoubleIndirect(
            (rest / per_block) as usize,
            (rest % per_block) as usize,
        ));
    }
    Err(JournalError::Other(format!(
        "logical block {} is beyond the double indirect range",
        logical
    )))
}

pub fn read_ptr(block: &[u8], index: usize) -> u32 {
    LittleEndian::read_u32(&block[index * 4..index * 4 + 4])
}

pub fn write_ptr(block: &mut [u8], index: usize, value: u32) {
    LittleEndian::write_u32(&mut block[index * 4..index * 4 + 4], value);
}

impl Ext3Fs {
    /// Pointers per indirect block
    pub(crate) fn per_block(&self) -> u64 {
        (self.block_size / 4) as u64
    }

    /// Physical block of `logical`, if mapped.
    pub(crate) fn lookup_block(&self, inode: &Ext3Inode, logical: u64) -> Result<Option<u64>> {
        let ptr = match block_path(logical, self.per_block())? {
            BlockPath::Direct(i) => inode.blocks[i],
            BlockPath::Indirect(i) => self.follow(inode.blocks[IND_BLOCK], i)?,
            BlockPath::DoubleIndirect(i, j) => {
                let ind = self.follow(inode.blocks[DIND_BLOCK], i)?;
                self.follow(ind, j)?
            }
        };
        Ok((ptr != 0).then_some(ptr as u64))
    }

    fn follow(&self, blocknr: u32, index: usize) -> Result<u32> {
        if blocknr == 0 {
            return Ok(0);
        }
        let buffer = self.cache.bread(blocknr as u64)?;
        let ptr = read_ptr(&buffer.data(), index);
        Ok(ptr)
    }

    /// Physical block of `logical`, allocating it and any missing indirect
    /// blocks on the way.
    pub(crate) fn map_block(
        &self,
        handle: &mut Handle,
        inode: &mut Ext3Inode,
        logical: u64,
    ) -> Result<u64> {
        match block_path(logical, self.per_block())? {
            BlockPath::Direct(i) => {
                if inode.blocks[i] == 0 {
                    inode.blocks[i] = self.new_block(handle)? as u32;
                    inode.nr_blocks += 1;
                }
                Ok(inode.blocks[i] as u64)
            }
            BlockPath::Indirect(i) => {
                let ind = self.ensure_indirect(handle, inode, IND_BLOCK)?;
                self.map_in(handle, inode, &ind, i, false)
            }
            BlockPath::DoubleIndirect(i, j) => {
                let dind = self.ensure_indirect(handle, inode, DIND_BLOCK)?;
                let ind = self.map_in(handle, inode, &dind, i, true)?;
                let ind = self.cache.bread(ind)?;
                self.map_in(handle, inode, &ind, j, false)
            }
        }
    }

    fn ensure_indirect(
        &self,
        handle: &mut Handle,
        inode: &mut Ext3Inode,
        slot: usize,
    ) -> Result<BufferRef> {
        if inode.blocks[slot] == 0 {
            let buffer = self.new_indirect(handle)?;
            inode.blocks[slot] = buffer.blocknr() as u32;
            inode.nr_blocks += 1;
            return Ok(buffer);
        }
        self.cache.bread(inode.blocks[slot] as u64)
    }

    /// Follow slot `index` of an indirect block, filling it if empty.
    fn map_in(
        &self,
        handle: &mut Handle,
        inode: &mut Ext3Inode,
        parent: &BufferRef,
        index: usize,
        indirect: bool,
    ) -> Result<u64> {
        let existing = read_ptr(&parent.data(), index);
        if existing != 0 {
            return Ok(existing as u64);
        }

        let child = if indirect {
            self.new_indirect(handle)?.blocknr()
        } else {
            self.new_block(handle)?
        };
        inode.nr_blocks += 1;
        self.set_ptr(handle, parent, index, child as u32)?;
        Ok(child)
    }

    /// Allocate a zeroed indirect block.
    fn new_indirect(&self, handle: &mut Handle) -> Result<BufferRef> {
        let blocknr = self.new_block(handle)?;
        let buffer = self.cache.getblk(blocknr);
        self.journal.get_write_access(handle, &buffer)?;
        buffer.data_mut().fill(0);
        buffer.mark_uptodate();
        self.journal.dirty_metadata(handle, &buffer)?;
        Ok(buffer)
    }

    /// Journaled update of one pointer in an indirect block.
    pub(crate) fn set_ptr(
        &self,
        handle: &mut Handle,
        parent: &BufferRef,
        index: usize,
        value: u32,
    ) -> Result<()> {
        self.journal.get_write_access(handle, parent)?;
        write_ptr(&mut parent.data_mut(), index, value);
        self.journal.dirty_metadata(handle, parent)
    }

    /// Every block the inode owns, indirect blocks included.
    pub fn mapped_blocks(&self, ino: u32) -> Result<Vec<u64>> {
        let inode = self.read_inode(ino)?;
        let mut blocks: Vec<u64> = inode.blocks[..NDIR_BLOCKS]
            .iter()
            .filter(|&&b| b != 0)
            .map(|&b| b as u64)
            .collect();
        self.collect_tree(inode.blocks[IND_BLOCK], 1, &mut blocks)?;
        self.collect_tree(inode.blocks[DIND_BLOCK], 2, &mut blocks)?;
        blocks.sort_unstable();
        Ok(blocks)
    }

    fn collect_tree(&self, blocknr: u32, depth: u32, out: &mut Vec<u64>) -> Result<()> {
        if blocknr == 0 {
            return Ok(());
        }
        out.push(blocknr as u64);
        let buffer = self.cache.bread(blocknr as u64)?;
        let children: Vec<u32> = (0..self.per_block() as usize)
            .map(|i| read_ptr(&buffer.data(), i))
            .filter(|&p| p != 0)
            .collect();
        for child in children {
            if depth > 1 {
                self.collect_tree(child, depth - 1, out)?;
            } else {
                out.push(child as u64);
            }
        }
        Ok(())
    }
}
