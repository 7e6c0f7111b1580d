//! Open-file table and the request loop.
//!
//! Every request is one IPC message whose value is the request code and
//! whose attached page carries the arguments; it lands at REQVA. Each slot
//! of the open-file table owns a fixed page (`FILEVA + slot * BY2PG`) that
//! holds the `Filefd` handed to the client on open. The kernel's reference
//! count on that page is the slot's state:
//!
//! * 0 - unused, the page was never allocated (or fully released);
//! * 1 - only the server still maps it: clean and available for reuse;
//! * >= 2 - live, some client holds a mapping.
//!
//! The server never unmaps its side on close; the slot falls back to state 1
//! by itself when the last client lets go.

use core::mem;
use core::slice;

use cstr_core::CStr;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::fcntl::OMode;
use crate::param::{BY2BLK, BY2PG, FILEVA, MAXOPEN, MAXPATHLEN, REQVA};
use crate::sys::{Envid, Perm};
use crate::user::fd::{filefd_at_mut, DEVFILE_ID};
use crate::user::ipc;

use super::layout::FileRef;
use super::path::Path;
use super::FsServer;

pub const FSREQ_OPEN: i32 = 1;
pub const FSREQ_MAP: i32 = 2;
pub const FSREQ_SET_SIZE: i32 = 3;
pub const FSREQ_CLOSE: i32 = 4;
pub const FSREQ_DIRTY: i32 = 5;
pub const FSREQ_REMOVE: i32 = 6;
pub const FSREQ_SYNC: i32 = 7;

// The two path-carrying requests are viewed in and out of raw pages by
// hand; like every request they are repr(C) with no implicit padding and no
// invalid bit patterns.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FsreqOpen {
    pub path: [u8; MAXPATHLEN],
    pub omode: u32,
}

impl FsreqOpen {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C), no implicit padding.
        unsafe { slice::from_raw_parts(self as *const FsreqOpen as *const u8, mem::size_of::<FsreqOpen>()) }
    }
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct FsreqMap {
    pub fileid: i32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct FsreqSetSize {
    pub fileid: i32,
    pub size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct FsreqClose {
    pub fileid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct FsreqDirty {
    pub fileid: i32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FsreqRemove {
    pub path: [u8; MAXPATHLEN],
}

impl FsreqRemove {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C), no implicit padding.
        unsafe {
            slice::from_raw_parts(self as *const FsreqRemove as *const u8, mem::size_of::<FsreqRemove>())
        }
    }
}

const_assert!(mem::size_of::<FsreqOpen>() <= BY2PG);
const_assert!(mem::size_of::<FsreqRemove>() <= BY2PG);

/// One open-file slot. `fileid % MAXOPEN` is the slot index; the high bits
/// count generations so a stale fileid can never match a reused slot.
pub(crate) struct Open {
    fileid: u32,
    mode: OMode,
    file: Option<FileRef>,
    /// Fixed address of this slot's Filefd page.
    ff: usize,
}

impl Open {
    pub(crate) fn new(slot: usize) -> Open {
        Open {
            fileid: slot as u32,
            mode: OMode::O_RDONLY,
            file: None,
            ff: FILEVA + slot * BY2PG,
        }
    }
}

/// NUL-terminate and borrow a wire path. A path that fills the whole buffer
/// is cut at MAXPATHLEN - 1.
fn wire_path(buf: &mut [u8; MAXPATHLEN]) -> Result<&Path> {
    buf[MAXPATHLEN - 1] = 0;
    let nul = buf.iter().position(|b| *b == 0).expect("wire_path");
    let cstr = CStr::from_bytes_with_nul(&buf[..=nul]).map_err(|_| Error::BadPath)?;
    Ok(Path::new(cstr))
}

impl<'k> FsServer<'k> {
    /// Allocate an open-file slot: the first unused one gets its Filefd page
    /// allocated, the first clean one is reused as is. Either way the fileid
    /// moves to the next generation and the page starts out zeroed.
    fn open_alloc(&mut self) -> Result<usize> {
        for i in 0..MAXOPEN {
            let ff = self.opentab[i].ff;
            match self.kern.pageref(self.env, ff) {
                0 => {
                    self.kern.mem_alloc(
                        self.env,
                        ff,
                        Perm::VALID | Perm::WRITE | Perm::LIBRARY,
                    )?;
                }
                1 => {}
                _ => continue,
            }
            self.opentab[i].fileid += MAXOPEN as u32;
            let mut pg = self.kern.page_mut(self.env, ff)?;
            pg.fill(0);
            return Ok(i);
        }
        Err(Error::MaxOpen)
    }

    /// Look up a live open-file slot by fileid. A slot nobody maps, or a
    /// fileid from a past generation, is `Invalid`.
    fn open_lookup(&self, fileid: u32) -> Result<usize> {
        let i = (fileid as usize) % MAXOPEN;
        let o = &self.opentab[i];
        if self.kern.pageref(self.env, o.ff) <= 1 || o.fileid != fileid {
            return Err(Error::Invalid);
        }
        Ok(i)
    }

    fn serve_open(&mut self, whom: Envid, req: &FsreqOpen) -> Result<(usize, Perm)> {
        let mut buf = req.path;
        let omode = OMode::from_raw(req.omode);

        let slot = self.open_alloc()?;

        let path = wire_path(&mut buf)?;
        log::debug!(
            "serve_open {:08x} {} {:#x}",
            whom,
            String::from_utf8_lossy(path.as_bytes()),
            req.omode
        );
        let f = if omode.contains(OMode::O_CREAT) {
            match self.file_create(path) {
                Err(Error::FileExists) if !omode.contains(OMode::O_EXCL) => self.file_open(path)?,
                r => r?,
            }
        } else {
            self.file_open(path)?
        };
        if omode.contains(OMode::O_TRUNC) {
            self.file_set_size(f, 0)?;
        }

        let rec = self.record(f.rec)?;
        let o = &mut self.opentab[slot];
        o.file = Some(f);
        o.mode = omode;
        let fileid = o.fileid;
        let mode = o.mode;
        let ff_va = o.ff;
        {
            let mut pg = self.kern.page_mut(self.env, ff_va)?;
            let ff = filefd_at_mut(&mut pg);
            ff.fd.dev_id = DEVFILE_ID;
            ff.fd.offset = 0;
            ff.fd.omode = mode.bits();
            ff.fileid = fileid;
            ff.file = rec;
        }
        Ok((ff_va, Perm::VALID | Perm::WRITE | Perm::LIBRARY))
    }

    fn serve_map(&mut self, whom: Envid, req: &FsreqMap) -> Result<(usize, Perm)> {
        log::debug!("serve_map {:08x} {:08x} {:08x}", whom, req.fileid, req.offset);
        let slot = self.open_lookup(req.fileid as u32)?;
        let f = self.opentab[slot].file.expect("live open slot without file");
        let (blockno, _) = self.file_get_block(f.rec, req.offset / BY2BLK as u32)?;
        Ok((self.diskaddr(blockno), Perm::VALID | Perm::WRITE | Perm::LIBRARY))
    }

    fn serve_set_size(&mut self, whom: Envid, req: &FsreqSetSize) -> Result<()> {
        log::debug!(
            "serve_set_size {:08x} {:08x} {:08x}",
            whom,
            req.fileid,
            req.size
        );
        let slot = self.open_lookup(req.fileid as u32)?;
        let f = self.opentab[slot].file.expect("live open slot without file");
        self.file_set_size(f, req.size)
    }

    fn serve_close(&mut self, whom: Envid, req: &FsreqClose) -> Result<()> {
        log::debug!("serve_close {:08x} {:08x}", whom, req.fileid);
        let slot = self.open_lookup(req.fileid as u32)?;
        let f = self.opentab[slot].file.expect("live open slot without file");
        // The server keeps its own mapping of the Filefd page; the slot
        // turns clean when the client side unmaps.
        self.file_close(f)
    }

    fn serve_dirty(&mut self, whom: Envid, req: &FsreqDirty) -> Result<()> {
        log::debug!(
            "serve_dirty {:08x} {:08x} {:08x}",
            whom,
            req.fileid,
            req.offset
        );
        let slot = self.open_lookup(req.fileid as u32)?;
        let f = self.opentab[slot].file.expect("live open slot without file");
        self.file_dirty(f.rec, req.offset)
    }

    fn serve_remove(&mut self, whom: Envid, req: &FsreqRemove) -> Result<()> {
        let mut buf = req.path;
        let path = wire_path(&mut buf)?;
        log::debug!(
            "serve_remove {:08x} {}",
            whom,
            String::from_utf8_lossy(path.as_bytes())
        );
        self.file_remove(path)
    }

    fn serve_sync(&mut self, whom: Envid) -> Result<()> {
        log::debug!("serve_sync {:08x}", whom);
        self.fs_sync()
    }

    /// Copy the typed arguments out of the request page.
    fn req<T: Copy>(&self) -> T {
        let pg = self
            .kern
            .page(self.env, REQVA)
            .expect("request page vanished");
        assert!(mem::size_of::<T>() <= BY2PG && mem::align_of::<T>() <= 4);
        // SAFETY: request types have no invalid bit patterns and the page is
        // 4096-aligned.
        unsafe { *(pg.as_ptr() as *const T) }
    }

    /// Handle one request and send exactly one reply: the status, plus a
    /// page for successful OPEN and MAP.
    fn dispatch(&mut self, whom: Envid, code: i32) {
        let reply = match code {
            FSREQ_OPEN => {
                let req: FsreqOpen = self.req();
                self.serve_open(whom, &req).map(Some)
            }
            FSREQ_MAP => {
                let req: FsreqMap = self.req();
                self.serve_map(whom, &req).map(Some)
            }
            FSREQ_SET_SIZE => {
                let req: FsreqSetSize = self.req();
                self.serve_set_size(whom, &req).map(|_| None)
            }
            FSREQ_CLOSE => {
                let req: FsreqClose = self.req();
                self.serve_close(whom, &req).map(|_| None)
            }
            FSREQ_DIRTY => {
                let req: FsreqDirty = self.req();
                self.serve_dirty(whom, &req).map(|_| None)
            }
            FSREQ_REMOVE => {
                let req: FsreqRemove = self.req();
                self.serve_remove(whom, &req).map(|_| None)
            }
            FSREQ_SYNC => self.serve_sync(whom).map(|_| None),
            _ => {
                log::warn!("invalid request code {} from {:08x}", code, whom);
                return;
            }
        };

        let sent = match reply {
            Ok(Some((va, perm))) => ipc::send(self.kern, self.env, whom, 0, va, perm),
            Ok(None) => ipc::send(self.kern, self.env, whom, 0, 0, Perm::empty()),
            Err(e) => {
                log::debug!("request {} from {:08x} failed: {}", code, whom, e);
                ipc::send(self.kern, self.env, whom, e.code(), 0, Perm::empty())
            }
        };
        if let Err(e) = sent {
            log::warn!("reply to {:08x} failed: {}", whom, e);
        }
    }

    /// Serve requests forever. Malformed requests (no argument page) are
    /// ignored; the argument page is unmapped after every handled request so
    /// the next receive can map a fresh one.
    pub fn serve(&mut self) -> ! {
        loop {
            let msg = match self.kern.ipc_recv(self.env, REQVA) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("ipc_recv failed: {}", e);
                    continue;
                }
            };

            if !msg.perm.contains(Perm::VALID) {
                log::warn!(
                    "invalid request from {:08x}: no argument page",
                    msg.from
                );
                // Just leave the sender hanging.
                continue;
            }

            self.dispatch(msg.from, msg.value);
            let _ = self.kern.mem_unmap(self.env, REQVA);
        }
    }
}
