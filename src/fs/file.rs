//! File layer: records, block indexing, directories and path resolution.
//!
//! A file record holds ten direct block slots and one indirect block whose
//! entries are indexed by file block number directly (its first NDIRECT
//! entries stay unused), so a file spans at most NINDIRECT blocks.
//!
//! Records live inside cache pages and are addressed by `RecordLoc` handles,
//! never by pointer. A resolved file carries the handle of the directory it
//! was found in (`FileRef::dir`); that is the only parent tracking, and it is
//! never persisted.

use crate::error::{Error, Result};
use crate::param::{BY2BLK, BY2FILE, FILE2BLK, NDIRECT, NINDIRECT};

use super::layout::{self, File, FileRef, RecordLoc, FILE_DIRECT_OFF};
use super::path::{FileName, Path};
use super::FsServer;

/// Handle to one block-number slot: either a direct slot inside a record or
/// an entry of an indirect block.
#[derive(Clone, Copy)]
struct SlotLoc {
    blockno: u32,
    offset: usize,
}

impl<'k> FsServer<'k> {
    /// Copy of the record at `loc`, faulting its block in if needed.
    pub fn record(&mut self, loc: RecordLoc) -> Result<File> {
        self.read_block(loc.blockno)?;
        let pg = self.block_page(loc.blockno)?;
        Ok(*layout::record_at(&pg, loc.offset))
    }

    fn with_record_mut<R>(&mut self, loc: RecordLoc, f: impl FnOnce(&mut File) -> R) -> Result<R> {
        self.read_block(loc.blockno)?;
        let mut pg = self.block_page_mut(loc.blockno)?;
        Ok(f(layout::record_at_mut(&mut pg, loc.offset)))
    }

    fn slot_read(&self, slot: SlotLoc) -> Result<u32> {
        let pg = self.block_page(slot.blockno)?;
        Ok(layout::words_at(&pg)[slot.offset / 4])
    }

    fn slot_write(&self, slot: SlotLoc, value: u32) -> Result<()> {
        let mut pg = self.block_page_mut(slot.blockno)?;
        layout::words_at_mut(&mut pg)[slot.offset / 4] = value;
        Ok(())
    }

    /// Find the block-number slot for the `filebno`'th block of file `f`.
    ///
    /// Needing an indirect block without `alloc` fails with `NotFound`;
    /// `filebno` beyond NINDIRECT fails with `Invalid`.
    fn file_block_walk(&mut self, f: RecordLoc, filebno: u32, alloc: bool) -> Result<SlotLoc> {
        if (filebno as usize) < NDIRECT {
            self.read_block(f.blockno)?;
            return Ok(SlotLoc {
                blockno: f.blockno,
                offset: f.offset + FILE_DIRECT_OFF + 4 * filebno as usize,
            });
        }
        if filebno as usize >= NINDIRECT {
            return Err(Error::Invalid);
        }

        let mut indirect = self.record(f)?.indirect;
        if indirect == 0 {
            if !alloc {
                return Err(Error::NotFound);
            }
            let blockno = self.alloc_block()?;
            {
                // A fresh indirect table must start out empty.
                let mut pg = self.block_page_mut(blockno)?;
                pg.fill(0);
            }
            self.with_record_mut(f, |rec| rec.indirect = blockno)?;
            indirect = blockno;
        } else {
            self.read_block(indirect)?;
        }

        Ok(SlotLoc {
            blockno: indirect,
            offset: 4 * filebno as usize,
        })
    }

    /// Disk block number backing the `filebno`'th block of `f`, allocating
    /// one if `alloc` is set and the slot is empty.
    pub fn file_map_block(&mut self, f: RecordLoc, filebno: u32, alloc: bool) -> Result<u32> {
        let slot = self.file_block_walk(f, filebno, alloc)?;
        let mut blockno = self.slot_read(slot)?;
        if blockno == 0 {
            if !alloc {
                return Err(Error::NotFound);
            }
            blockno = self.alloc_block()?;
            self.slot_write(slot, blockno)?;
        }
        Ok(blockno)
    }

    /// Make the `filebno`'th block of `f` resident, allocating it if absent.
    /// Returns the disk block number and whether this call brought it in.
    ///
    /// A freshly allocated block keeps whatever the disk held there; callers
    /// that care must clear it.
    pub fn file_get_block(&mut self, f: RecordLoc, filebno: u32) -> Result<(u32, bool)> {
        let blockno = self.file_map_block(f, filebno, true)?;
        let (_va, isnew) = self.read_block(blockno)?;
        Ok((blockno, isnew))
    }

    /// Remove the `filebno`'th block from `f`. Absent blocks succeed
    /// silently.
    pub fn file_clear_block(&mut self, f: RecordLoc, filebno: u32) -> Result<()> {
        let slot = match self.file_block_walk(f, filebno, false) {
            Err(Error::NotFound) => return Ok(()),
            r => r?,
        };
        let blockno = self.slot_read(slot)?;
        if blockno != 0 {
            self.free_block(blockno);
            self.slot_write(slot, 0)?;
        }
        Ok(())
    }

    /// Mark the block containing `offset` dirty by writing its first byte to
    /// itself. With no dirty bit to set, the real effect is faulting the
    /// block in; resident allocated blocks are flushed regardless.
    pub fn file_dirty(&mut self, f: RecordLoc, offset: u32) -> Result<()> {
        let (blockno, _) = self.file_get_block(f, offset / BY2BLK as u32)?;
        let mut pg = self.block_page_mut(blockno)?;
        let first = pg[0];
        pg[0] = first;
        Ok(())
    }

    /// Truncate file `f` down to `newsize` bytes, freeing the blocks the
    /// smaller file no longer needs. A shrunken file never keeps its
    /// indirect block.
    pub fn file_truncate(&mut self, f: RecordLoc, newsize: u32) -> Result<()> {
        let size = self.record(f)?.size;
        let old_nblocks = (size as usize + BY2BLK - 1) / BY2BLK;
        let new_nblocks = (newsize as usize + BY2BLK - 1) / BY2BLK;

        for bno in new_nblocks..old_nblocks {
            self.file_clear_block(f, bno as u32)?;
        }

        let indirect = self.record(f)?.indirect;
        if indirect != 0 {
            self.free_block(indirect);
            self.with_record_mut(f, |rec| rec.indirect = 0)?;
        }

        self.with_record_mut(f, |rec| rec.size = newsize)?;
        Ok(())
    }

    /// Set `f`'s size. Shrinking truncates; growing just records the size,
    /// leaving the new tail to materialize block by block on access. The
    /// containing directory, when known, is flushed so the size change
    /// persists.
    pub fn file_set_size(&mut self, f: FileRef, newsize: u32) -> Result<()> {
        let size = self.record(f.rec)?.size;
        if size > newsize {
            self.file_truncate(f.rec, newsize)?;
        }
        self.with_record_mut(f.rec, |rec| rec.size = newsize)?;
        if let Some(dir) = f.dir {
            self.file_flush(dir)?;
        }
        Ok(())
    }

    /// Write all of `f`'s resident blocks back to disk. Holes are skipped.
    pub fn file_flush(&mut self, f: RecordLoc) -> Result<()> {
        let size = self.record(f)?.size;
        let nblocks = (size as usize + BY2BLK - 1) / BY2BLK;
        for bno in 0..nblocks {
            let diskbno = match self.file_map_block(f, bno as u32, false) {
                Err(Error::NotFound) => continue,
                r => r?,
            };
            if self.block_is_dirty(diskbno) {
                self.write_block(diskbno)?;
            }
        }
        Ok(())
    }

    /// Flush `f` and, when its containing directory is known, the directory
    /// too, so the record itself reaches the disk.
    pub fn file_close(&mut self, f: FileRef) -> Result<()> {
        self.file_flush(f.rec)?;
        if let Some(dir) = f.dir {
            self.file_flush(dir)?;
        }
        Ok(())
    }

    /// Look for a record named `name` in the directory `dir`.
    pub fn dir_lookup(&mut self, dir: RecordLoc, name: &FileName) -> Result<RecordLoc> {
        let size = self.record(dir)?.size;
        let nblock = (size as usize + BY2BLK - 1) / BY2BLK;
        for i in 0..nblock {
            let (blockno, _) = self.file_get_block(dir, i as u32)?;
            let found = {
                let pg = self.block_page(blockno)?;
                (0..FILE2BLK).find(|&j| {
                    let f = layout::record_at(&pg, j * BY2FILE);
                    f.in_use() && f.name_bytes() == name.as_bytes()
                })
            };
            if let Some(j) = found {
                return Ok(RecordLoc {
                    blockno,
                    offset: j * BY2FILE,
                });
            }
        }
        Err(Error::NotFound)
    }

    /// Find a free record slot in `dir`, growing the directory by one block
    /// when every slot is taken.
    pub fn dir_alloc_file(&mut self, dir: RecordLoc) -> Result<RecordLoc> {
        let size = self.record(dir)?.size;
        let nblock = (size as usize + BY2BLK - 1) / BY2BLK;
        for i in 0..nblock {
            let (blockno, _) = self.file_get_block(dir, i as u32)?;
            let free = {
                let pg = self.block_page(blockno)?;
                (0..FILE2BLK).find(|&j| !layout::record_at(&pg, j * BY2FILE).in_use())
            };
            if let Some(j) = free {
                return Ok(RecordLoc {
                    blockno,
                    offset: j * BY2FILE,
                });
            }
        }

        self.with_record_mut(dir, |rec| rec.size += BY2BLK as u32)?;
        let (blockno, _) = self.file_get_block(dir, nblock as u32)?;
        Ok(RecordLoc { blockno, offset: 0 })
    }

    /// Walk `path` starting at the root. `stop_at_parent` stops one level
    /// early, returning the would-be parent and the final component.
    fn namex<'p>(
        &mut self,
        mut path: &'p Path,
        stop_at_parent: bool,
    ) -> Result<(FileRef, Option<&'p FileName>)> {
        let mut cur = FileRef::ROOT;
        while let Some((rest, raw)) = path.skipelem() {
            path = rest;
            let name = FileName::from_bytes(raw)?;
            if !self.record(cur.rec)?.is_dir() {
                return Err(Error::NotFound);
            }
            if stop_at_parent && path.is_empty_string() {
                return Ok((cur, Some(name)));
            }
            let next = self.dir_lookup(cur.rec, name)?;
            cur = FileRef {
                rec: next,
                dir: Some(cur.rec),
            };
        }
        if stop_at_parent {
            // The path had no final component to split off.
            return Err(Error::NotFound);
        }
        Ok((cur, None))
    }

    /// Resolve `path` to a file. An empty path (after slash skipping)
    /// resolves to the root.
    pub fn walk(&mut self, path: &Path) -> Result<FileRef> {
        Ok(self.namex(path, false)?.0)
    }

    /// Resolve everything but the last component of `path`, returning the
    /// directory and the final name.
    pub fn walk_parent<'p>(&mut self, path: &'p Path) -> Result<(FileRef, &'p FileName)> {
        let (dir, name) = self.namex(path, true)?;
        Ok((dir, name.ok_or(Error::NotFound)?))
    }

    /// Open the file at `path`.
    pub fn file_open(&mut self, path: &Path) -> Result<FileRef> {
        self.walk(path)
    }

    /// Create the file at `path`: resolve the containing directory in one
    /// pass, then the final component must miss; a hit is `FileExists`.
    pub fn file_create(&mut self, path: &Path) -> Result<FileRef> {
        let (dir, name) = self.walk_parent(path)?;
        match self.dir_lookup(dir.rec, name) {
            Ok(_) => return Err(Error::FileExists),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        let rec = self.dir_alloc_file(dir.rec)?;
        self.with_record_mut(rec, |f| {
            *f = File::zeroed();
            f.set_name(name);
        })?;
        Ok(FileRef {
            rec,
            dir: Some(dir.rec),
        })
    }

    /// Remove the file at `path`: truncate it, zero the first byte of its
    /// name so the slot becomes reusable, and flush.
    pub fn file_remove(&mut self, path: &Path) -> Result<()> {
        let f = self.walk(path)?;
        self.file_truncate(f.rec, 0)?;
        self.with_record_mut(f.rec, |rec| rec.name[0] = 0)?;
        self.file_flush(f.rec)?;
        if let Some(dir) = f.dir {
            self.file_flush(dir)?;
        }
        Ok(())
    }
}
