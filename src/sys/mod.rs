//! The kernel contract.
//!
//! Everything the file system consumes from the microkernel is behind the
//! [`Syscalls`] trait: page allocation and mapping, the per-page reference
//! count, synchronous IPC that carries at most one page per message, and raw
//! disk sector I/O. The service itself never touches memory it has not been
//! handed through this interface.
//!
//! [`emu::EmuKernel`] is an in-memory implementation of the whole contract,
//! shipped with the crate so the service can be exercised on a host.

pub mod emu;

use core::ops::{Deref, DerefMut};

use bitflags::bitflags;

use crate::error::Result;
use crate::param::BY2PG;

/// Environment (process) identifier.
pub type Envid = u32;

bitflags! {
    /// Page permission bits.
    ///
    /// LIBRARY is preserved across fork without copy-on-write; COW is the
    /// marker consumed by the user-level page-fault handler.
    pub struct Perm: u32 {
        const VALID = 0x0001;
        const WRITE = 0x0002;
        const LIBRARY = 0x0004;
        const COW = 0x0008;
    }
}

/// One page worth of memory. The alignment allows u32 views (the bitmap, the
/// indirect block) to be taken anywhere inside it.
#[repr(C, align(4096))]
pub struct PageData(pub [u8; BY2PG]);

impl PageData {
    pub const fn zeroed() -> Self {
        PageData([0; BY2PG])
    }
}

impl Deref for PageData {
    type Target = [u8; BY2PG];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Shared borrow of a mapped page's contents.
pub trait PageAccess {
    fn data(&self) -> &PageData;
}

/// Exclusive borrow of a mapped page's contents.
pub trait PageAccessMut: PageAccess {
    fn data_mut(&mut self) -> &mut PageData;
}

/// A read view of the page mapped at some virtual address. Holds the page
/// exclusively until dropped; keep it short-lived.
pub struct PageRef<'a>(Box<dyn PageAccess + Send + 'a>);

impl<'a> PageRef<'a> {
    pub fn new(inner: Box<dyn PageAccess + Send + 'a>) -> Self {
        PageRef(inner)
    }
}

impl Deref for PageRef<'_> {
    type Target = PageData;

    fn deref(&self) -> &PageData {
        self.0.data()
    }
}

/// A write view of the page mapped at some virtual address.
pub struct PageMut<'a>(Box<dyn PageAccessMut + Send + 'a>);

impl<'a> PageMut<'a> {
    pub fn new(inner: Box<dyn PageAccessMut + Send + 'a>) -> Self {
        PageMut(inner)
    }
}

impl Deref for PageMut<'_> {
    type Target = PageData;

    fn deref(&self) -> &PageData {
        self.0.data()
    }
}

impl DerefMut for PageMut<'_> {
    fn deref_mut(&mut self) -> &mut PageData {
        self.0.data_mut()
    }
}

/// A received IPC message. If `perm` has no bits set, no page accompanied the
/// message; otherwise the page is now mapped at the receive address with
/// these permissions.
#[derive(Clone, Copy, Debug)]
pub struct Ipc {
    pub from: Envid,
    pub value: i32,
    pub perm: Perm,
}

/// User-level page-fault handler, invoked on a write to a copy-on-write page.
pub type PgfaultFn = fn(&dyn Syscalls, Envid, usize);

/// The kernel primitives consumed by the file system service and its client
/// library. Virtual addresses are page-aligned unless stated otherwise; a
/// `srcva` of `0` in [`Syscalls::ipc_send`] means "no page attached".
pub trait Syscalls: Sync {
    /// Back `va` in `env` with a fresh zeroed physical page.
    fn mem_alloc(&self, env: Envid, va: usize, perm: Perm) -> Result<()>;

    /// Alias the physical page mapped at `src_va` in `src_env` into `dst_env`
    /// at `dst_va` with permissions `perm`.
    fn mem_map(
        &self,
        src_env: Envid,
        src_va: usize,
        dst_env: Envid,
        dst_va: usize,
        perm: Perm,
    ) -> Result<()>;

    /// Drop the mapping at `va`; succeeds silently when nothing is mapped.
    fn mem_unmap(&self, env: Envid, va: usize) -> Result<()>;

    /// Page-table lookup: permissions of the page mapped at `va`, or empty.
    fn va_perm(&self, env: Envid, va: usize) -> Perm;

    /// Page-directory lookup: VALID iff any page is mapped in the PDMAP-sized
    /// chunk containing `va`.
    fn pde_perm(&self, env: Envid, va: usize) -> Perm;

    /// Reference count of the physical page mapped at `va`; `0` if unmapped.
    fn pageref(&self, env: Envid, va: usize) -> usize;

    /// Read access to the page mapped at `va`.
    fn page(&self, env: Envid, va: usize) -> Result<PageRef<'_>>;

    /// Write access to the page mapped at `va`. A copy-on-write page is
    /// privatized through the environment's page-fault handler first.
    fn page_mut(&self, env: Envid, va: usize) -> Result<PageMut<'_>>;

    /// Block until a message arrives for `env`. An attached page is mapped at
    /// `dstva`; pass `0` to refuse page transfers.
    fn ipc_recv(&self, env: Envid, dstva: usize) -> Result<Ipc>;

    /// Deliver `value` (and the page at `srcva`, unless `0`) to `to`. Fails
    /// with `IpcNotRecv` when the target is not blocked in `ipc_recv`.
    fn ipc_send(&self, env: Envid, to: Envid, value: i32, srcva: usize, perm: Perm) -> Result<()>;

    /// Create a new, empty environment. The child inherits the parent's
    /// page-fault handler and nothing else.
    fn env_alloc(&self, parent: Envid) -> Result<Envid>;

    fn set_env_status(&self, env: Envid, runnable: bool) -> Result<()>;

    fn set_pgfault_handler(&self, env: Envid, handler: PgfaultFn);

    /// Read `nsecs` sectors starting at `secno` into the pages mapped at
    /// `dstva`.
    fn ide_read(&self, diskno: u32, secno: u32, env: Envid, dstva: usize, nsecs: u32) -> Result<()>;

    /// Write `nsecs` sectors starting at `secno` from the pages mapped at
    /// `srcva`.
    fn ide_write(&self, diskno: u32, secno: u32, env: Envid, srcva: usize, nsecs: u32)
        -> Result<()>;

    /// Give up the CPU to other environments.
    fn yield_now(&self);
}
