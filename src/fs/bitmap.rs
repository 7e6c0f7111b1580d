//! Bitmap allocator.
//!
//! The free list is the block range starting at block 2, resident in the
//! cache window like any other blocks, so `block_is_free` is direct bit
//! indexing into mapped pages. Bit value 1 means free. The bitmap is striped
//! in 32-bit little-endian words.

use crate::error::{Error, Result};
use crate::param::{BIT2BLK, NINDIRECT};

use super::layout;
use super::FsServer;

impl<'k> FsServer<'k> {
    /// Check whether the bitmap says the block is free.
    ///
    /// Before the superblock and bitmap are loaded, and for block numbers
    /// beyond the disk, every block counts as in-use.
    pub fn block_is_free(&self, blockno: u32) -> bool {
        let nblocks = match self.nblocks {
            Some(n) => n,
            None => return false,
        };
        if self.nbitmap.is_none() || blockno >= nblocks {
            return false;
        }
        let pg = self
            .block_page(2 + blockno / BIT2BLK as u32)
            .expect("bitmap block not resident");
        let words = layout::words_at(&pg);
        words[blockno as usize % BIT2BLK / 32] & (1 << (blockno % 32)) != 0
    }

    /// Mark a block free in the bitmap. The change reaches the disk through
    /// a later alloc_block on the same bitmap block, or through fs_sync.
    ///
    /// Block 0 is the null pointer of block numbers; freeing it is fatal.
    pub fn free_block(&mut self, blockno: u32) {
        assert!(blockno != 0, "attempt to free zero block");
        let mut pg = self
            .block_page_mut(2 + blockno / BIT2BLK as u32)
            .expect("bitmap block not resident");
        let words = layout::words_at_mut(&mut pg);
        words[blockno as usize % BIT2BLK / 32] |= 1 << (blockno % 32);
    }

    /// Search the bitmap for a free block and claim its bit. The updated
    /// bitmap block goes to disk before the number is returned, so a crash
    /// can lose a free block but never shows an allocated block as free.
    fn alloc_block_num(&mut self) -> Result<u32> {
        let nblocks = self.nblocks.expect("alloc_block_num: superblock not loaded");
        let nbitmap = self.nbitmap.expect("alloc_block_num: bitmap not loaded");

        for i in 0..nbitmap {
            let mut claimed = None;
            {
                let mut pg = self.block_page_mut(2 + i)?;
                let words = layout::words_at_mut(&mut pg);
                let base = i as usize * BIT2BLK;
                'scan: for w in 0..NINDIRECT {
                    if words[w] == 0 {
                        continue;
                    }
                    for bit in 0..32 {
                        let blockno = (base + w * 32 + bit) as u32;
                        // Blocks 0..3 are the boot record, the superblock
                        // and the first bitmap block.
                        if blockno < 3 || blockno >= nblocks {
                            continue;
                        }
                        if words[w] & (1 << bit) != 0 {
                            words[w] &= !(1 << bit);
                            claimed = Some(blockno);
                            break 'scan;
                        }
                    }
                }
            }
            if let Some(blockno) = claimed {
                if let Err(e) = self.flush_bitmap(blockno) {
                    // Allocation metadata must hit the disk ahead of use.
                    self.free_block(blockno);
                    return Err(e);
                }
                return Ok(blockno);
            }
        }
        Err(Error::NoDisk)
    }

    /// Write the bitmap block holding `blockno`'s bit back to disk.
    fn flush_bitmap(&mut self, blockno: u32) -> Result<()> {
        self.write_block(2 + blockno / BIT2BLK as u32)
    }

    /// Allocate a block: claim a free bit, then make sure the block has a
    /// page. No promise is made about the page's contents.
    pub fn alloc_block(&mut self) -> Result<u32> {
        let blockno = self.alloc_block_num()?;
        if let Err(e) = self.map_block(blockno) {
            self.free_block(blockno);
            return Err(e);
        }
        Ok(blockno)
    }
}
