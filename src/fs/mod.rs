//! File system implementation. Five layers:
//!   + Blocks: the page-mapped cache over raw disk blocks (block.rs).
//!   + Bitmap: persistent free-list, one bit per block (bitmap.rs).
//!   + Files: record layout, direct/indirect indexing, sizing (file.rs).
//!   + Directories: files whose content is an array of records (file.rs).
//!   + Names: path resolution starting at the embedded root (path.rs).
//!
//! The open-file table and the request loop over these layers are in serv.rs.
//!
//! The server owns the whole disk through a fixed virtual window: block `n`
//! lives at `DISKMAP + n * BY2BLK`, populated on first reference. There is no
//! page-granularity dirty tracking on this platform, so every resident
//! allocated block is treated as potentially dirty and `fs_sync` writes all
//! of them back.

mod bitmap;
mod block;
pub mod file;
pub mod format;
pub mod layout;
pub mod path;
pub mod serv;

pub use layout::{File, FileRef, RecordLoc, Super, FTYPE_DIR, FTYPE_REG};

use array_macro::array;

use crate::error::Result;
use crate::param::{BIT2BLK, BY2BLK, DISKMAX, FS_MAGIC, MAXOPEN};
use crate::sys::{Envid, Syscalls};

use serv::Open;

/// The file system server. One per system; the loaded superblock state, the
/// bitmap bookkeeping and the open-file table all hang off it, and every
/// operation takes it explicitly.
pub struct FsServer<'k> {
    kern: &'k dyn Syscalls,
    env: Envid,
    /// Total blocks, known once the superblock has been read and validated.
    nblocks: Option<u32>,
    /// Number of bitmap blocks, known once the bitmap has been loaded.
    nbitmap: Option<u32>,
    opentab: Box<[Open; MAXOPEN]>,
}

impl<'k> FsServer<'k> {
    pub fn new(kern: &'k dyn Syscalls, env: Envid) -> FsServer<'k> {
        FsServer {
            kern,
            env,
            nblocks: None,
            nbitmap: None,
            opentab: Box::new(array![i => Open::new(i); MAXOPEN]),
        }
    }

    pub fn env(&self) -> Envid {
        self.env
    }

    /// Total number of blocks on disk. Panics before `fs_init`.
    pub fn nblocks(&self) -> u32 {
        self.nblocks.expect("nblocks: superblock not loaded")
    }

    /// Initialize the file system: validate the superblock, self-test the
    /// write path, load the bitmap.
    pub fn fs_init(&mut self) -> Result<()> {
        self.read_super()?;
        self.check_write_block()?;
        self.read_bitmap()?;
        log::info!("file system is good");
        Ok(())
    }

    /// Read and validate the superblock, block 1.
    fn read_super(&mut self) -> Result<()> {
        let (va, _) = self.read_block(1)?;
        let nblocks = {
            let pg = self.kern.page(self.env, va)?;
            let sb = layout::super_at(&pg);
            assert_eq!(sb.magic, FS_MAGIC, "bad file system magic number");
            assert!(
                (sb.nblocks as usize) <= DISKMAX / BY2BLK,
                "file system is too large"
            );
            sb.nblocks
        };
        self.nblocks = Some(nblocks);
        log::debug!("superblock is good: {} blocks", nblocks);
        Ok(())
    }

    /// Test that write_block works, by smashing the superblock and reading
    /// it back. Block 0's page serves as scratch space for the backup.
    fn check_write_block(&mut self) -> Result<()> {
        // Hide the superblock so the reserved blocks pass the cache
        // preconditions.
        let nblocks = self.nblocks.take();

        // Back up the superblock.
        self.read_block(0)?;
        {
            let src = self.kern.page(self.env, self.diskaddr(1))?;
            let mut dst = self.kern.page_mut(self.env, self.diskaddr(0))?;
            dst.copy_from_slice(&src[..]);
        }

        // Smash it.
        {
            let mut pg = self.kern.page_mut(self.env, self.diskaddr(1))?;
            pg[..7].copy_from_slice(b"OOPS!\n\0");
        }
        self.write_block(1)?;
        assert!(self.block_is_mapped(1));

        // Clear it out.
        self.kern.mem_unmap(self.env, self.diskaddr(1))?;
        assert!(!self.block_is_mapped(1));

        // Read it back in.
        self.read_block(1)?;
        {
            let pg = self.kern.page(self.env, self.diskaddr(1))?;
            assert_eq!(&pg[..7], b"OOPS!\n\0", "write_block did not reach disk");
        }

        // Fix it.
        {
            let src = self.kern.page(self.env, self.diskaddr(0))?;
            let mut dst = self.kern.page_mut(self.env, self.diskaddr(1))?;
            dst.copy_from_slice(&src[..]);
        }
        self.write_block(1)?;

        // The scratch copy must never reach the boot block through a later
        // sync; the cache has no dirty bit to say otherwise.
        self.kern.mem_unmap(self.env, self.diskaddr(0))?;

        self.nblocks = nblocks;
        log::debug!("write_block is good");
        Ok(())
    }

    /// Read the bitmap blocks and check that the reserved blocks are marked
    /// in-use.
    fn read_bitmap(&mut self) -> Result<()> {
        let nblocks = self.nblocks.expect("read_bitmap: superblock not loaded");
        let nbitmap = (nblocks as usize + BIT2BLK - 1) / BIT2BLK;
        for i in 0..nbitmap {
            self.read_block(2 + i as u32)?;
        }
        self.nbitmap = Some(nbitmap as u32);

        assert!(!self.block_is_free(0), "boot block marked free");
        assert!(!self.block_is_free(1), "superblock marked free");
        for i in 0..nbitmap {
            assert!(
                !self.block_is_free(2 + i as u32),
                "bitmap block {} marked free",
                2 + i
            );
        }
        log::debug!("read_bitmap is good: {} bitmap blocks", nbitmap);
        Ok(())
    }

    /// Sync the entire file system. A big hammer: every resident block is
    /// potentially dirty and goes back to disk, the superblock and the
    /// bitmap included.
    pub fn fs_sync(&mut self) -> Result<()> {
        for blockno in 0..self.nblocks() {
            if self.block_is_dirty(blockno) {
                self.write_block(blockno)?;
            }
        }
        Ok(())
    }
}
