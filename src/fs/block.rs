//! Block cache.
//!
//! The cache is the server's address space: each disk block has a fixed
//! virtual address, `DISKMAP + blockno * BY2BLK`, so residency is a
//! page-table lookup and block numbers stored in an indirect block can be
//! followed without translation tables.
//!
//! Interface:
//! * To make a block resident, call read_block.
//! * After changing a block, it stays resident and is flushed by a later
//!   write_block, file flush, or fs_sync.
//! * unmap_block drops a page; it refuses blocks that are allocated and
//!   potentially dirty.
//!
//! The platform exposes no dirty bit the server could read, so "potentially
//! dirty" means "resident and allocated".

use crate::error::Result;
use crate::param::{BY2BLK, DISKMAP, SECT2BLK};
use crate::sys::{PageMut, PageRef, Perm};

use super::FsServer;

/// The disk the file system lives on.
const DISKNO: u32 = 1;

impl<'k> FsServer<'k> {
    /// The virtual address of a disk block: a pure function of its number.
    ///
    /// Once the superblock is loaded, blockno must be within the disk.
    pub fn diskaddr(&self, blockno: u32) -> usize {
        if let Some(nblocks) = self.nblocks {
            if blockno >= nblocks {
                panic!("bad block number {:#010x} in diskaddr", blockno);
            }
        }
        DISKMAP + blockno as usize * BY2BLK
    }

    /// Is the block resident? A page-table lookup.
    pub fn block_is_mapped(&self, blockno: u32) -> bool {
        self.kern
            .va_perm(self.env, self.diskaddr(blockno))
            .contains(Perm::VALID)
    }

    /// Without a dirty bit, every resident allocated block may have been
    /// scribbled on, by the server or by a client holding a mapping of it.
    pub fn block_is_dirty(&self, blockno: u32) -> bool {
        self.block_is_mapped(blockno) && !self.block_is_free(blockno)
    }

    /// Back the block's address with a page, without reading the disk.
    pub(crate) fn map_block(&mut self, blockno: u32) -> Result<()> {
        if self.block_is_mapped(blockno) {
            return Ok(());
        }
        self.kern.mem_alloc(
            self.env,
            self.diskaddr(blockno),
            Perm::VALID | Perm::WRITE,
        )
    }

    /// Make the block resident and return its address, plus whether this
    /// call brought it in (letting callers clear memory-only state when a
    /// block first arrives from disk).
    ///
    /// Once the bitmap is loaded, reading a free block is a fatal error.
    pub fn read_block(&mut self, blockno: u32) -> Result<(usize, bool)> {
        if let Some(nblocks) = self.nblocks {
            if blockno >= nblocks {
                panic!("reading non-existent block {:#010x}", blockno);
            }
        }
        if self.nbitmap.is_some() && self.block_is_free(blockno) {
            panic!("reading free block {:#010x}", blockno);
        }

        let va = self.diskaddr(blockno);
        if self.block_is_mapped(blockno) {
            return Ok((va, false));
        }

        self.kern
            .mem_alloc(self.env, va, Perm::VALID | Perm::WRITE)?;
        if let Err(e) = self.kern.ide_read(
            DISKNO,
            blockno * SECT2BLK as u32,
            self.env,
            va,
            SECT2BLK as u32,
        ) {
            // Do not retain a half-initialized block.
            let _ = self.kern.mem_unmap(self.env, va);
            log::warn!("disk read of block {} failed", blockno);
            return Err(e);
        }
        Ok((va, true))
    }

    /// Flush the block's current contents out to the disk.
    ///
    /// The block must be resident.
    pub fn write_block(&mut self, blockno: u32) -> Result<()> {
        if !self.block_is_mapped(blockno) {
            panic!("write unmapped block {:#010x}", blockno);
        }
        let va = self.diskaddr(blockno);
        self.kern.ide_write(
            DISKNO,
            blockno * SECT2BLK as u32,
            self.env,
            va,
            SECT2BLK as u32,
        )?;
        // Re-assert the mapping; a platform with a readable dirty bit would
        // clear it here.
        self.kern.mem_map(
            self.env,
            va,
            self.env,
            va,
            Perm::VALID | Perm::WRITE | Perm::LIBRARY,
        )?;
        Ok(())
    }

    /// Drop the block's page. The block must be free or not dirty.
    pub fn unmap_block(&mut self, blockno: u32) -> Result<()> {
        if !self.block_is_mapped(blockno) {
            return Ok(());
        }
        assert!(
            self.block_is_free(blockno) || !self.block_is_dirty(blockno),
            "unmap_block: block {:#010x} is allocated and dirty",
            blockno
        );
        self.kern.mem_unmap(self.env, self.diskaddr(blockno))
    }

    /// Read view of a resident block.
    pub(crate) fn block_page(&self, blockno: u32) -> Result<PageRef<'k>> {
        self.kern.page(self.env, self.diskaddr(blockno))
    }

    /// Write view of a resident block.
    pub(crate) fn block_page_mut(&self, blockno: u32) -> Result<PageMut<'k>> {
        self.kern.page_mut(self.env, self.diskaddr(blockno))
    }
}
