//! The descriptor table.
//!
//! A process's descriptors live at fixed virtual addresses: slot `i`'s `Fd`
//! page at `FDTABLE + i * BY2PG`, and its data region, big enough for the
//! largest file, at `FILEBASE + i * PDMAP`. A slot is open iff its `Fd` page
//! is mapped, so allocation and lookup are page-table probes and fork's
//! library-shared pages carry open files to the child for free.

use core::mem;

use scopeguard::ScopeGuard;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::fcntl::OMode;
use crate::fs::layout::File;
use crate::param::{BY2PG, FDTABLE, FILEBASE, MAXFD, MAXNAMELEN, PDMAP};
use crate::sys::{PageData, Perm};

use super::Process;

/// Device id of the file device.
pub const DEVFILE_ID: u32 = b'f' as u32;

/// Device id reserved for a console back-end.
pub const DEVCONS_ID: u32 = b'c' as u32;

/// Device id reserved for a pipe back-end.
pub const DEVPIPE_ID: u32 = b'p' as u32;

/// The descriptor proper, at the head of every Fd page.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Fd {
    pub dev_id: u32,
    pub offset: u32,
    pub omode: u32,
}

/// What the server hands out on open: the descriptor, the server-side
/// fileid, and a copy of the file record. Viewed in and out of raw pages by
/// hand, like the record it embeds.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Filefd {
    pub fd: Fd,
    pub fileid: u32,
    pub file: File,
}

const_assert!(mem::size_of::<Filefd>() <= BY2PG);

/// Result of fstat.
#[derive(Clone, Copy)]
pub struct Stat {
    pub name: [u8; MAXNAMELEN],
    pub size: u32,
    pub isdir: bool,
    pub dev: u32,
}

impl Stat {
    pub fn zeroed() -> Stat {
        Stat {
            name: [0; MAXNAMELEN],
            size: 0,
            isdir: false,
            dev: 0,
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|ch| *ch == 0)
            .unwrap_or(MAXNAMELEN);
        &self.name[..len]
    }
}

/// A device back-end, dispatched by the id stored in each Fd.
pub trait Dev: Sync {
    fn id(&self) -> u32;
    fn name(&self) -> &'static str;
    fn read(&self, proc: &Process<'_>, fdnum: usize, buf: &mut [u8], offset: u32)
        -> Result<usize>;
    fn write(&self, proc: &Process<'_>, fdnum: usize, buf: &[u8], offset: u32) -> Result<usize>;
    fn close(&self, proc: &Process<'_>, fdnum: usize) -> Result<()>;
    fn stat(&self, proc: &Process<'_>, fdnum: usize, stat: &mut Stat) -> Result<()>;
}

/// Address of slot `i`'s Fd page.
pub fn index2fd(i: usize) -> usize {
    FDTABLE + i * BY2PG
}

/// Address of slot `i`'s data region.
pub fn index2data(i: usize) -> usize {
    FILEBASE + i * PDMAP
}

/// View a page as a Filefd.
pub fn filefd_at(page: &PageData) -> &Filefd {
    // SAFETY: no bit pattern makes a Filefd invalid and PageData is
    // 4096-aligned.
    unsafe { &*(page.0.as_ptr() as *const Filefd) }
}

pub fn filefd_at_mut(page: &mut PageData) -> &mut Filefd {
    // SAFETY: as in filefd_at; the page is borrowed exclusively.
    unsafe { &mut *(page.0.as_mut_ptr() as *mut Filefd) }
}

/// Pick the lowest slot whose Fd page is unmapped. The page itself is the
/// caller's to allocate; calling fd_alloc twice without doing so returns the
/// same slot twice.
pub fn fd_alloc(proc: &Process<'_>) -> Result<usize> {
    for i in 0..MAXFD {
        if !proc
            .kern()
            .va_perm(proc.env(), index2fd(i))
            .contains(Perm::VALID)
        {
            return Ok(i);
        }
    }
    Err(Error::MaxOpen)
}

/// Close a slot locally by unmapping its Fd page. Device-specific shutdown
/// is the caller's business.
pub fn fd_close(proc: &Process<'_>, fdnum: usize) {
    let _ = proc.kern().mem_unmap(proc.env(), index2fd(fdnum));
}

/// Copy the Filefd out of an open slot.
pub(crate) fn filefd(proc: &Process<'_>, fdnum: usize) -> Result<Filefd> {
    if fdnum >= MAXFD {
        return Err(Error::Invalid);
    }
    let va = index2fd(fdnum);
    if !proc.kern().va_perm(proc.env(), va).contains(Perm::VALID) {
        return Err(Error::Invalid);
    }
    let pg = proc.kern().page(proc.env(), va)?;
    Ok(*filefd_at(&pg))
}

/// Update an open slot's Filefd in place (the page may be shared with a
/// forked relative, so updates go read-modify-write through the mapping).
pub(crate) fn with_filefd_mut<R>(
    proc: &Process<'_>,
    fdnum: usize,
    f: impl FnOnce(&mut Filefd) -> R,
) -> Result<R> {
    if fdnum >= MAXFD {
        return Err(Error::Invalid);
    }
    let mut pg = proc.kern().page_mut(proc.env(), index2fd(fdnum))?;
    Ok(f(filefd_at_mut(&mut pg)))
}

/// Close one descriptor: device shutdown first, then drop the Fd page.
pub fn close(proc: &Process<'_>, fdnum: usize) -> Result<()> {
    let ff = filefd(proc, fdnum)?;
    let dev = proc.dev_lookup(ff.fd.dev_id)?;
    let r = dev.close(proc, fdnum);
    fd_close(proc, fdnum);
    r
}

/// Close every descriptor the process has open.
pub fn close_all(proc: &Process<'_>) {
    for i in 0..MAXFD {
        let _ = close(proc, i);
    }
}

/// Duplicate `oldfdnum` onto `newfdnum`: close the destination, then alias
/// the source's Fd page and every resident page of its data region. Both
/// descriptors end up sharing offset and file state. On failure everything
/// mapped so far is unwound.
pub fn dup(proc: &Process<'_>, oldfdnum: usize, newfdnum: usize) -> Result<usize> {
    filefd(proc, oldfdnum)?;
    if oldfdnum == newfdnum {
        return Ok(newfdnum);
    }
    let _ = close(proc, newfdnum);

    let kern = proc.kern();
    let env = proc.env();
    let ova = index2data(oldfdnum);
    let nva = index2data(newfdnum);
    let keep = Perm::VALID | Perm::WRITE | Perm::LIBRARY;

    let unwind = scopeguard::guard((), |_| {
        let _ = kern.mem_unmap(env, index2fd(newfdnum));
        let mut i = 0;
        while i < PDMAP {
            let _ = kern.mem_unmap(env, nva + i);
            i += BY2PG;
        }
    });

    if kern.pde_perm(env, ova).contains(Perm::VALID) {
        let mut i = 0;
        while i < PDMAP {
            let perm = kern.va_perm(env, ova + i);
            if perm.contains(Perm::VALID) {
                kern.mem_map(env, ova + i, env, nva + i, perm & keep)?;
            }
            i += BY2PG;
        }
    }
    let perm = kern.va_perm(env, index2fd(oldfdnum));
    kern.mem_map(env, index2fd(oldfdnum), env, index2fd(newfdnum), perm & keep)?;

    ScopeGuard::into_inner(unwind);
    Ok(newfdnum)
}

/// Read up to `buf.len()` bytes at the descriptor's current offset and
/// advance it. Write-only descriptors refuse.
pub fn read(proc: &Process<'_>, fdnum: usize, buf: &mut [u8]) -> Result<usize> {
    let ff = filefd(proc, fdnum)?;
    let dev = proc.dev_lookup(ff.fd.dev_id)?;
    if !OMode::from_raw(ff.fd.omode).readable() {
        log::warn!("[{:08x}] read {} -- bad mode", proc.env(), fdnum);
        return Err(Error::Invalid);
    }
    let n = dev.read(proc, fdnum, buf, ff.fd.offset)?;
    with_filefd_mut(proc, fdnum, |ff| ff.fd.offset += n as u32)?;
    Ok(n)
}

/// Keep reading until `buf` is full or the device reports end of input.
/// Meant for char-like devices that return short counts.
pub fn readn(proc: &Process<'_>, fdnum: usize, buf: &mut [u8]) -> Result<usize> {
    let mut tot = 0;
    while tot < buf.len() {
        let m = read(proc, fdnum, &mut buf[tot..])?;
        if m == 0 {
            break;
        }
        tot += m;
    }
    Ok(tot)
}

/// Write `buf` at the descriptor's current offset and advance it. Read-only
/// descriptors refuse.
pub fn write(proc: &Process<'_>, fdnum: usize, buf: &[u8]) -> Result<usize> {
    let ff = filefd(proc, fdnum)?;
    let dev = proc.dev_lookup(ff.fd.dev_id)?;
    if !OMode::from_raw(ff.fd.omode).writable() {
        log::warn!("[{:08x}] write {} -- bad mode", proc.env(), fdnum);
        return Err(Error::Invalid);
    }
    let n = dev.write(proc, fdnum, buf, ff.fd.offset)?;
    with_filefd_mut(proc, fdnum, |ff| ff.fd.offset += n as u32)?;
    Ok(n)
}

/// Set the descriptor's offset.
pub fn seek(proc: &Process<'_>, fdnum: usize, offset: u32) -> Result<()> {
    with_filefd_mut(proc, fdnum, |ff| ff.fd.offset = offset)
}

/// Status of an open descriptor.
pub fn fstat(proc: &Process<'_>, fdnum: usize, stat: &mut Stat) -> Result<()> {
    let ff = filefd(proc, fdnum)?;
    let dev = proc.dev_lookup(ff.fd.dev_id)?;
    *stat = Stat::zeroed();
    stat.dev = dev.id();
    dev.stat(proc, fdnum, stat)
}

/// Status of a path: open read-only, fstat, close.
pub fn stat(proc: &Process<'_>, path: &[u8]) -> Result<Stat> {
    let fdnum = super::file::open(proc, path, OMode::O_RDONLY)?;
    let mut st = Stat::zeroed();
    let r = fstat(proc, fdnum, &mut st);
    let _ = close(proc, fdnum);
    r?;
    Ok(st)
}
