// Truncate
// Frees the tail of a file across as many transactions as it takes

use crate::inode::{read_ptr, Ext3Inode, DIND_BLOCK, IND_BLOCK, INODE_ORPHAN, NDIR_BLOCKS};
use crate::Ext3Fs;
use jbd_core::Result;
use jbd_journal::{BufferRef, Handle, JournalMode};

/// Fixed credits of a truncate transaction on top of the blocks it frees
pub const TRUNCATE_BASE_CREDITS: u32 = 8;
/// Most freed blocks a truncate reserves credits for up front
pub const MAX_TRUNCATE_DATA: u32 = 64;
/// Credits one freed block can cost: bitmap, parent block and inode
const TRUNCATE_STEP_CREDITS: u32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TruncateReport {
    /// Data and indirect blocks returned to the bitmap
    pub freed_blocks: u64,
    /// Times the truncate had to continue in a new transaction
    pub restarts: u32,
    /// The inode was flagged for orphan recovery while blocks were freed
    pub orphaned: bool,
}

/// Where a freed block's pointer lives
enum Parent<'a> {
    Inode(usize),
    Block(&'a BufferRef, usize),
}

struct Truncation {
    handle: Handle,
    ino: u32,
    inode: Ext3Inode,
    /// Logical blocks below this survive
    keep: u64,
    report: TruncateReport,
}

impl Ext3Fs {
    /// Credits a truncate of `inode` asks for per transaction.
    fn blocks_for_truncate(&self, inode: &Ext3Inode) -> u32 {
        let needed = inode.nr_blocks.clamp(2, MAX_TRUNCATE_DATA);
        (TRUNCATE_BASE_CREDITS + needed).min(self.journal.config().max_transaction())
    }

    /// Cut the file at `new_size` bytes, freeing every block past the new end.
    pub fn truncate(&self, ino: u32, new_size: u64) -> Result<TruncateReport> {
        let mut inode = self.read_inode(ino)?;
        let credits = self.blocks_for_truncate(&inode);
        let handle = self.journal.start(credits)?;

        let shrinking = new_size < inode.size || inode.is_orphan();
        inode.size = new_size;
        if shrinking {
            inode.flags |= INODE_ORPHAN;
        }

        let mut t = Truncation {
            handle,
            ino,
            inode,
            keep: new_size.div_ceil(self.block_size as u64),
            report: TruncateReport {
                orphaned: shrinking,
                ..Default::default()
            },
        };
        // The new size is on disk before anything is freed
        self.write_inode(&mut t.handle, ino, &t.inode)?;
        log::debug!(
            "truncating inode {} to {} bytes ({} blocks kept)",
            ino,
            new_size,
            t.keep
        );

        if shrinking {
            self.free_tail(&mut t)?;
            t.inode.flags &= !INODE_ORPHAN;
            self.write_inode(&mut t.handle, ino, &t.inode)?;
        }

        let Truncation { handle, report, .. } = t;
        self.journal.stop(handle)?;
        log::info!(
            "truncated inode {}: {} blocks freed over {} restarts",
            ino,
            report.freed_blocks,
            report.restarts
        );
        Ok(report)
    }

    /// Free from the end of the file backwards: the double indirect tree,
    /// the indirect tree, then the direct blocks.
    fn free_tail(&self, t: &mut Truncation) -> Result<()> {
        let per = self.per_block();
        let dind_base = NDIR_BLOCKS as u64 + per;
        self.free_top(t, DIND_BLOCK, 2, dind_base)?;
        self.free_top(t, IND_BLOCK, 1, NDIR_BLOCKS as u64)?;

        for slot in (0..NDIR_BLOCKS).rev() {
            if (slot as u64) < t.keep {
                break;
            }
            let blocknr = t.inode.blocks[slot];
            if blocknr != 0 {
                self.release_block(t, blocknr as u64, false, Parent::Inode(slot))?;
            }
        }
        Ok(())
    }

    /// Trim the tree hanging off inode slot `slot`, and free its root too
    /// when the whole tree lies past the new end.
    fn free_top(&self, t: &mut Truncation, slot: usize, depth: u32, base: u64) -> Result<()> {
        let root = t.inode.blocks[slot];
        if root == 0 {
            return Ok(());
        }
        match self.free_branches(t, root as u64, depth, base)? {
            Some(true) => self.release_block(t, root as u64, true, Parent::Inode(slot)),
            Some(false) => Ok(()),
            None => {
                t.inode.blocks[slot] = 0;
                Ok(())
            }
        }
    }

    /// Free everything at or past `keep` below the indirect block
    /// `blocknr`, which maps logical blocks from `base`. Returns whether the
    /// block itself is now unneeded, or `None` if it could not be read.
    fn free_branches(
        &self,
        t: &mut Truncation,
        blocknr: u64,
        depth: u32,
        base: u64,
    ) -> Result<Option<bool>> {
        let span = self.per_block().pow(depth - 1);
        let buffer = match self.cache.bread(blocknr) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!(
                    "inode {}: cannot read indirect block {} ({}), dropping it",
                    t.ino,
                    blocknr,
                    e
                );
                return Ok(None);
            }
        };

        for index in (0..self.per_block() as usize).rev() {
            let child_base = base + index as u64 * span;
            if child_base + span <= t.keep {
                break;
            }
            let child = read_ptr(&buffer.data(), index);
            if child == 0 {
                continue;
            }

            if depth == 1 {
                self.release_block(t, child as u64, false, Parent::Block(&buffer, index))?;
                continue;
            }
            match self.free_branches(t, child as u64, depth - 1, child_base)? {
                Some(true) => {
                    self.release_block(t, child as u64, true, Parent::Block(&buffer, index))?
                }
                Some(false) => {}
                None => {
                    self.try_to_extend(t)?;
                    self.set_ptr(&mut t.handle, &buffer, index, 0)?;
                }
            }
        }
        Ok(Some(base >= t.keep))
    }

    /// Drop one block: make sure there are credits, forget or revoke it,
    /// clear its bitmap bit and its pointer.
    fn release_block(
        &self,
        t: &mut Truncation,
        blocknr: u64,
        metadata: bool,
        parent: Parent<'_>,
    ) -> Result<()> {
        self.try_to_extend(t)?;
        self.forget_block(&mut t.handle, blocknr, metadata)?;
        self.free_block(&mut t.handle, blocknr)?;
        match parent {
            Parent::Inode(slot) => t.inode.blocks[slot] = 0,
            Parent::Block(buffer, index) => self.set_ptr(&mut t.handle, buffer, index, 0)?,
        }
        t.inode.nr_blocks = t.inode.nr_blocks.saturating_sub(1);
        t.report.freed_blocks += 1;
        Ok(())
    }

    /// Keep enough credits for the next free. When the transaction cannot
    /// grow, write the inode as it stands and continue in a new one.
    fn try_to_extend(&self, t: &mut Truncation) -> Result<()> {
        let reserve = self.journal.config().reserve_credits.max(TRUNCATE_STEP_CREDITS);
        if t.handle.credits() > reserve {
            return Ok(());
        }
        let needed = self.blocks_for_truncate(&t.inode);
        if self.journal.extend(&mut t.handle, needed)? {
            return Ok(());
        }

        self.write_inode(&mut t.handle, t.ino, &t.inode)?;
        log::debug!(
            "inode {}: truncate restarts after transaction {}",
            t.ino,
            t.handle.tid()
        );
        self.journal.restart(&mut t.handle, needed)?;
        t.report.restarts += 1;
        Ok(())
    }

    /// Stop the journal from writing back or replaying a freed block.
    /// Unjournaled data only needs its pending write dropped; metadata
    /// needs a revoke so an older logged copy is not replayed over the
    /// block's next owner.
    fn forget_block(&self, handle: &mut Handle, blocknr: u64, metadata: bool) -> Result<()> {
        let buffer = self.cache.lookup(blocknr);
        if self.journal.config().mode == JournalMode::Journal || !metadata {
            return match buffer {
                Some(buffer) => self.journal.forget(handle, &buffer),
                None => Ok(()),
            };
        }
        self.journal.revoke(handle, blocknr, buffer.as_ref())
    }
}
