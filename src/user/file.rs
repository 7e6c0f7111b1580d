//! The file device driver.
//!
//! Client-side half of the protocol: every operation becomes one request
//! page sent to the server. Open lands the server's Filefd page on the fd
//! slot; reads and writes map file blocks into the descriptor's data region
//! on demand and then copy bytes to or from the shared pages, so file data
//! moves between the processes without ever being re-sent over IPC.

use core::cmp;

use zerocopy::AsBytes;

use crate::error::{Error, Result};
use crate::fcntl::OMode;
use crate::fs::serv::{
    FsreqClose, FsreqDirty, FsreqMap, FsreqOpen, FsreqRemove, FsreqSetSize, FSREQ_CLOSE,
    FSREQ_DIRTY, FSREQ_MAP, FSREQ_OPEN, FSREQ_REMOVE, FSREQ_SET_SIZE, FSREQ_SYNC,
};
use crate::param::{BY2BLK, BY2PG, FSIPCBUF, MAXPATHLEN, PDMAP};
use crate::sys::{Ipc, Perm};

use super::fd::{self, Dev, Filefd, Stat, DEVFILE_ID};
use super::ipc;
use super::Process;

pub struct DevFile;

pub static DEVFILE: DevFile = DevFile;

/// Send one request to the server and wait for its reply. The arguments are
/// written into this process's argument page, which the kernel then lends to
/// the server for the duration of the request. A page attached to the reply
/// is mapped at `dstva`.
fn fsipc(proc: &Process<'_>, code: i32, req: &[u8], dstva: usize) -> Result<Ipc> {
    let kern = proc.kern();
    let env = proc.env();

    if !kern.va_perm(env, FSIPCBUF).contains(Perm::VALID) {
        kern.mem_alloc(env, FSIPCBUF, Perm::VALID | Perm::WRITE)?;
    }
    {
        let mut pg = kern.page_mut(env, FSIPCBUF)?;
        pg.fill(0);
        pg[..req.len()].copy_from_slice(req);
    }

    ipc::send(kern, env, proc.fsenv(), code, FSIPCBUF, Perm::VALID | Perm::WRITE)?;
    let msg = kern.ipc_recv(env, dstva)?;
    if msg.value < 0 {
        return Err(Error::from_code(msg.value).unwrap_or(Error::Invalid));
    }
    Ok(msg)
}

fn path_bytes(path: &[u8]) -> Result<[u8; MAXPATHLEN]> {
    if path.len() >= MAXPATHLEN || path.contains(&0) {
        return Err(Error::BadPath);
    }
    let mut buf = [0u8; MAXPATHLEN];
    buf[..path.len()].copy_from_slice(path);
    Ok(buf)
}

/// Open (or create) `path`. On success the server's Filefd page sits on the
/// freshly picked fd slot and the slot number is returned.
pub fn open(proc: &Process<'_>, path: &[u8], omode: OMode) -> Result<usize> {
    let fdnum = fd::fd_alloc(proc)?;
    let req = FsreqOpen {
        path: path_bytes(path)?,
        omode: omode.bits(),
    };
    fsipc(proc, FSREQ_OPEN, req.as_bytes(), fd::index2fd(fdnum))?;
    Ok(fdnum)
}

/// Remove the file at `path`.
pub fn remove(proc: &Process<'_>, path: &[u8]) -> Result<()> {
    let req = FsreqRemove {
        path: path_bytes(path)?,
    };
    fsipc(proc, FSREQ_REMOVE, req.as_bytes(), 0)?;
    Ok(())
}

/// Write every dirty block in the server's cache back to disk.
pub fn sync(proc: &Process<'_>) -> Result<()> {
    fsipc(proc, FSREQ_SYNC, &[], 0)?;
    Ok(())
}

/// Cut the file under an open descriptor down to `size` bytes.
pub fn ftruncate(proc: &Process<'_>, fdnum: usize, size: u32) -> Result<()> {
    let ff = fd::filefd(proc, fdnum)?;
    if !OMode::from_raw(ff.fd.omode).writable() {
        return Err(Error::Invalid);
    }
    let req = FsreqSetSize {
        fileid: ff.fileid as i32,
        size,
    };
    fsipc(proc, FSREQ_SET_SIZE, req.as_bytes(), 0)?;
    fd::with_filefd_mut(proc, fdnum, |ff| ff.file.size = size)?;

    // Drop data pages past the new end; their blocks may now belong to
    // someone else.
    let base = fd::index2data(fdnum);
    let mut off = (size as usize + BY2BLK - 1) / BY2BLK * BY2BLK;
    while off < PDMAP {
        let _ = proc.kern().mem_unmap(proc.env(), base + off);
        off += BY2PG;
    }
    Ok(())
}

/// Map the block containing byte `off` of the open file into the
/// descriptor's data region, unless it already is, and return its address.
fn map_block(proc: &Process<'_>, ff: &Filefd, fdnum: usize, off: usize) -> Result<usize> {
    let va = fd::index2data(fdnum) + off / BY2BLK * BY2BLK;
    if !proc.kern().va_perm(proc.env(), va).contains(Perm::VALID) {
        let req = FsreqMap {
            fileid: ff.fileid as i32,
            offset: off as u32,
        };
        fsipc(proc, FSREQ_MAP, req.as_bytes(), va)?;
    }
    Ok(va)
}

impl Dev for DevFile {
    fn id(&self) -> u32 {
        DEVFILE_ID
    }

    fn name(&self) -> &'static str {
        "file"
    }

    fn read(
        &self,
        proc: &Process<'_>,
        fdnum: usize,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<usize> {
        let ff = fd::filefd(proc, fdnum)?;
        let size = ff.file.size;
        if offset >= size {
            return Ok(0);
        }
        let n = cmp::min(buf.len(), (size - offset) as usize);

        let mut tot = 0;
        while tot < n {
            let off = offset as usize + tot;
            let va = map_block(proc, &ff, fdnum, off)?;
            let m = cmp::min(n - tot, BY2BLK - off % BY2BLK);
            let pg = proc.kern().page(proc.env(), va)?;
            buf[tot..tot + m].copy_from_slice(&pg[off % BY2BLK..off % BY2BLK + m]);
            tot += m;
        }
        Ok(tot)
    }

    fn write(&self, proc: &Process<'_>, fdnum: usize, buf: &[u8], offset: u32) -> Result<usize> {
        let mut ff = fd::filefd(proc, fdnum)?;
        let n = buf.len();
        let end = offset as usize + n;

        if end > ff.file.size as usize {
            // Extend before writing; blocks past the old end materialize as
            // the writes below map them.
            let req = FsreqSetSize {
                fileid: ff.fileid as i32,
                size: end as u32,
            };
            fsipc(proc, FSREQ_SET_SIZE, req.as_bytes(), 0)?;
            fd::with_filefd_mut(proc, fdnum, |ff| ff.file.size = end as u32)?;
            ff.file.size = end as u32;
        }

        let mut tot = 0;
        while tot < n {
            let off = offset as usize + tot;
            let va = map_block(proc, &ff, fdnum, off)?;
            let m = cmp::min(n - tot, BY2BLK - off % BY2BLK);
            {
                let mut pg = proc.kern().page_mut(proc.env(), va)?;
                pg[off % BY2BLK..off % BY2BLK + m].copy_from_slice(&buf[tot..tot + m]);
            }
            // The server has no way to see our scribbles in its page
            // tables; tell it explicitly.
            let req = FsreqDirty {
                fileid: ff.fileid as i32,
                offset: off as u32,
            };
            fsipc(proc, FSREQ_DIRTY, req.as_bytes(), 0)?;
            tot += m;
        }
        Ok(tot)
    }

    fn close(&self, proc: &Process<'_>, fdnum: usize) -> Result<()> {
        let ff = fd::filefd(proc, fdnum)?;
        let req = FsreqClose {
            fileid: ff.fileid as i32,
        };
        fsipc(proc, FSREQ_CLOSE, req.as_bytes(), 0)?;

        // Drop the data-region mappings; the descriptor page itself is the
        // caller's to unmap.
        let base = fd::index2data(fdnum);
        if proc.kern().pde_perm(proc.env(), base).contains(Perm::VALID) {
            let mut off = 0;
            while off < PDMAP {
                let _ = proc.kern().mem_unmap(proc.env(), base + off);
                off += BY2PG;
            }
        }
        Ok(())
    }

    fn stat(&self, proc: &Process<'_>, fdnum: usize, stat: &mut Stat) -> Result<()> {
        let ff = fd::filefd(proc, fdnum)?;
        stat.name.copy_from_slice(&ff.file.name);
        stat.size = ff.file.size;
        stat.isdir = ff.file.is_dir();
        Ok(())
    }
}
