// Block Allocator
// One bitmap block; freed blocks stay reserved until their free commits

use crate::Ext3Fs;
use jbd_core::{JournalError, Result};
use jbd_journal::Handle;

fn test_bit(bitmap: &[u8], bit: u64) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], bit: u64, value: bool) {
    let byte = &mut bitmap[(bit / 8) as usize];
    if value {
        *byte |= 1 << (bit % 8);
    } else {
        *byte &= !(1 << (bit % 8));
    }
}

impl Ext3Fs {
    /// Allocate one data-area block.
    ///
    /// A block freed by a transaction that has not committed yet is still
    /// set in the last committed bitmap and is skipped, so a crash can never
    /// leave it owned twice.
    pub(crate) fn new_block(&self, handle: &mut Handle) -> Result<u64> {
        let bitmap = self.cache.bread(self.layout.bitmap)?;
        self.journal.get_undo_access(handle, &bitmap)?;
        let committed = self.journal.committed_data(&bitmap);

        let bit = {
            let data = bitmap.data();
            (0..self.layout.data_blocks).find(|&bit| {
                !test_bit(&data, bit) && committed.as_ref().map_or(true, |c| !test_bit(c, bit))
            })
        };
        let Some(bit) = bit else {
            return Err(JournalError::Other("no free data blocks".to_string()));
        };

        set_bit(&mut bitmap.data_mut(), bit, true);
        self.journal.dirty_metadata(handle, &bitmap)?;
        let blocknr = self.layout.first_data + bit;
        log::trace!("allocated block {}", blocknr);
        Ok(blocknr)
    }

    pub(crate) fn free_block(&self, handle: &mut Handle, blocknr: u64) -> Result<()> {
        if !self.layout.is_data_block(blocknr) {
            return Err(JournalError::OutOfRange {
                block: blocknr,
                len: self.layout.first_data + self.layout.data_blocks,
            });
        }
        let bit = blocknr - self.layout.first_data;
        let bitmap = self.cache.bread(self.layout.bitmap)?;
        self.journal.get_undo_access(handle, &bitmap)?;
        if !test_bit(&bitmap.data(), bit) {
            log::warn!("freeing block {} which is not in use", blocknr);
        }
        set_bit(&mut bitmap.data_mut(), bit, false);
        self.journal.dirty_metadata(handle, &bitmap)
    }

    pub fn is_allocated(&self, blocknr: u64) -> Result<bool> {
        if !self.layout.is_data_block(blocknr) {
            return Ok(false);
        }
        let bitmap = self.cache.bread(self.layout.bitmap)?;
        let set = test_bit(&bitmap.data(), blocknr - self.layout.first_data);
        Ok(set)
    }

    /// Every block the bitmap marks in use.
    pub fn allocated_blocks(&self) -> Result<Vec<u64>> {
        let bitmap = self.cache.bread(self.layout.bitmap)?;
        let data = bitmap.data();
        Ok((0..self.layout.data_blocks)
            .filter(|&bit| test_bit(&data, bit))
            .map(|bit| self.layout.first_data + bit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_helpers() {
        let mut bitmap = vec![0u8; 4];
        set_bit(&mut bitmap, 9, true);
        assert_eq!(bitmap[1], 0b10);
        assert!(test_bit(&bitmap, 9));
        assert!(!test_bit(&bitmap, 8));
        set_bit(&mut bitmap, 9, false);
        assert_eq!(bitmap, vec![0u8; 4]);
    }
}
