//! In-memory reference kernel.
//!
//! `EmuKernel` implements the whole [`Syscalls`](super::Syscalls) contract on
//! the host: physical pages with mapping reference counts, one page table per
//! environment, rendezvous IPC (a send fails with `IpcNotRecv` unless the
//! receiver is already blocked), a RAM disk behind
//! the IDE interface, and delivery of the user-level page-fault handler on
//! writes to copy-on-write pages.
//!
//! Used mainly for tests, although it is a complete enough platform to run
//! the server and several client environments on ordinary threads.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use spin::Mutex;

use super::{Envid, Ipc, PageAccess, PageAccessMut, PageData, PageMut, PageRef, Perm, PgfaultFn};
use crate::error::{Error, Result};
use crate::param::{BY2PG, BY2SECT, PDMAP};

/// One physical page, lockable independently of the kernel state so that
/// page contents can be held across syscalls without holding the kernel.
///
/// The lock is a bare spin flag; guards are exclusive and expected to be
/// short-lived.
struct PageCell {
    locked: AtomicBool,
    data: UnsafeCell<PageData>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl Sync for PageCell {}
unsafe impl Send for PageCell {}

impl PageCell {
    fn new() -> Arc<PageCell> {
        Arc::new(PageCell {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(PageData::zeroed()),
        })
    }

    fn acquire(self: &Arc<PageCell>) -> CellGuard {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::yield_now();
        }
        CellGuard {
            cell: Arc::clone(self),
        }
    }
}

/// Owned lock guard over one physical page.
struct CellGuard {
    cell: Arc<PageCell>,
}

impl PageAccess for CellGuard {
    fn data(&self) -> &PageData {
        // SAFETY: the cell lock is held.
        unsafe { &*self.cell.data.get() }
    }
}

impl PageAccessMut for CellGuard {
    fn data_mut(&mut self) -> &mut PageData {
        // SAFETY: the cell lock is held and `self` is borrowed exclusively.
        unsafe { &mut *self.cell.data.get() }
    }
}

impl Drop for CellGuard {
    fn drop(&mut self) {
        self.cell.locked.store(false, Ordering::Release);
    }
}

struct PhysPage {
    /// Number of mappings across all environments.
    refs: usize,
    cell: Arc<PageCell>,
}

#[derive(Clone, Copy)]
struct Mapping {
    phys: usize,
    perm: Perm,
}

struct EnvState {
    /// Virtual page number -> mapping.
    pages: BTreeMap<usize, Mapping>,
    /// Receive address of a blocked `ipc_recv`, if any.
    recving: Option<usize>,
    /// Message posted by a sender, not yet picked up.
    mailbox: Option<(Envid, i32, Perm)>,
    pgfault: Option<PgfaultFn>,
    runnable: bool,
}

impl EnvState {
    fn new() -> EnvState {
        EnvState {
            pages: BTreeMap::new(),
            recving: None,
            mailbox: None,
            pgfault: None,
            runnable: false,
        }
    }
}

struct KernState {
    envs: Vec<EnvState>,
    pages: Vec<Option<PhysPage>>,
    free_pages: Vec<usize>,
}

impl KernState {
    fn env(&mut self, id: Envid) -> Result<&mut EnvState> {
        if id == 0 {
            return Err(Error::Invalid);
        }
        self.envs.get_mut(id as usize - 1).ok_or(Error::Invalid)
    }

    fn page_alloc(&mut self) -> usize {
        if let Some(idx) = self.free_pages.pop() {
            self.pages[idx] = Some(PhysPage {
                refs: 0,
                cell: PageCell::new(),
            });
            return idx;
        }
        self.pages.push(Some(PhysPage {
            refs: 0,
            cell: PageCell::new(),
        }));
        self.pages.len() - 1
    }

    fn page_incref(&mut self, phys: usize) {
        self.pages[phys].as_mut().expect("page_incref: free page").refs += 1;
    }

    fn page_decref(&mut self, phys: usize) {
        let page = self.pages[phys].as_mut().expect("page_decref: free page");
        page.refs -= 1;
        if page.refs == 0 {
            self.pages[phys] = None;
            self.free_pages.push(phys);
        }
    }

    /// Install `mapping` at `vpn`, replacing and releasing any old mapping.
    fn insert(&mut self, env: Envid, vpn: usize, mapping: Mapping) -> Result<()> {
        let old = self.env(env)?.pages.insert(vpn, mapping);
        self.page_incref(mapping.phys);
        if let Some(old) = old {
            self.page_decref(old.phys);
        }
        Ok(())
    }

    fn lookup(&mut self, env: Envid, va: usize) -> Result<Mapping> {
        self.env(env)?
            .pages
            .get(&(va / BY2PG))
            .copied()
            .ok_or(Error::Invalid)
    }

    fn cell(&mut self, phys: usize) -> Arc<PageCell> {
        Arc::clone(&self.pages[phys].as_ref().expect("cell: free page").cell)
    }
}

/// The in-memory kernel. See the module documentation.
pub struct EmuKernel {
    state: Mutex<KernState>,
    disk: Mutex<Vec<u8>>,
}

impl EmuKernel {
    /// Boot with the given disk image. The image length must be a whole
    /// number of sectors.
    pub fn new(disk: Vec<u8>) -> EmuKernel {
        assert_eq!(disk.len() % BY2SECT, 0, "EmuKernel::new: ragged disk image");
        EmuKernel {
            state: Mutex::new(KernState {
                envs: Vec::new(),
                pages: Vec::new(),
                free_pages: Vec::new(),
            }),
            disk: Mutex::new(disk),
        }
    }

    /// Create a fresh environment, as the boot loader would.
    pub fn env_create(&self) -> Envid {
        let mut st = self.state.lock();
        st.envs.push(EnvState::new());
        st.envs.len() as Envid
    }

    /// Copy of the current disk image.
    pub fn disk_contents(&self) -> Vec<u8> {
        self.disk.lock().clone()
    }

    /// Whether an environment has been marked runnable.
    pub fn is_runnable(&self, env: Envid) -> bool {
        match self.state.lock().env(env) {
            Ok(e) => e.runnable,
            Err(_) => false,
        }
    }

    fn locked_cell(&self, env: Envid, va: usize) -> Result<(Arc<PageCell>, Perm)> {
        let mut st = self.state.lock();
        let mapping = st.lookup(env, va)?;
        Ok((st.cell(mapping.phys), mapping.perm))
    }
}

impl super::Syscalls for EmuKernel {
    fn mem_alloc(&self, env: Envid, va: usize, perm: Perm) -> Result<()> {
        if !perm.contains(Perm::VALID) {
            return Err(Error::Invalid);
        }
        let mut st = self.state.lock();
        let phys = st.page_alloc();
        st.insert(env, va / BY2PG, Mapping { phys, perm })
    }

    fn mem_map(
        &self,
        src_env: Envid,
        src_va: usize,
        dst_env: Envid,
        dst_va: usize,
        perm: Perm,
    ) -> Result<()> {
        if !perm.contains(Perm::VALID) {
            return Err(Error::Invalid);
        }
        let mut st = self.state.lock();
        let mapping = st.lookup(src_env, src_va)?;
        st.insert(
            dst_env,
            dst_va / BY2PG,
            Mapping {
                phys: mapping.phys,
                perm,
            },
        )
    }

    fn mem_unmap(&self, env: Envid, va: usize) -> Result<()> {
        let mut st = self.state.lock();
        if let Some(old) = st.env(env)?.pages.remove(&(va / BY2PG)) {
            st.page_decref(old.phys);
        }
        Ok(())
    }

    fn va_perm(&self, env: Envid, va: usize) -> Perm {
        let mut st = self.state.lock();
        match st.lookup(env, va) {
            Ok(mapping) => mapping.perm,
            Err(_) => Perm::empty(),
        }
    }

    fn pde_perm(&self, env: Envid, va: usize) -> Perm {
        let chunk = va / PDMAP * (PDMAP / BY2PG);
        let mut st = self.state.lock();
        let env = match st.env(env) {
            Ok(env) => env,
            Err(_) => return Perm::empty(),
        };
        if env
            .pages
            .range(chunk..chunk + PDMAP / BY2PG)
            .next()
            .is_some()
        {
            Perm::VALID
        } else {
            Perm::empty()
        }
    }

    fn pageref(&self, env: Envid, va: usize) -> usize {
        let mut st = self.state.lock();
        match st.lookup(env, va) {
            Ok(mapping) => st.pages[mapping.phys]
                .as_ref()
                .expect("pageref: free page")
                .refs,
            Err(_) => 0,
        }
    }

    fn page(&self, env: Envid, va: usize) -> Result<PageRef<'_>> {
        let (cell, _) = self.locked_cell(env, va)?;
        Ok(PageRef::new(Box::new(cell.acquire())))
    }

    fn page_mut(&self, env: Envid, va: usize) -> Result<PageMut<'_>> {
        for _ in 0..2 {
            let (cell, perm) = self.locked_cell(env, va)?;
            if perm.contains(Perm::COW) {
                // Deliver the user-level page fault and retry the access.
                let handler = self
                    .state
                    .lock()
                    .env(env)?
                    .pgfault
                    .ok_or(Error::Invalid)?;
                handler(self, env, va / BY2PG * BY2PG);
                continue;
            }
            if !perm.contains(Perm::WRITE) {
                return Err(Error::Invalid);
            }
            return Ok(PageMut::new(Box::new(cell.acquire())));
        }
        Err(Error::Invalid)
    }

    fn ipc_recv(&self, env: Envid, dstva: usize) -> Result<Ipc> {
        {
            let mut st = self.state.lock();
            let e = st.env(env)?;
            e.recving = Some(dstva);
            e.mailbox = None;
        }
        loop {
            {
                let mut st = self.state.lock();
                if let Some((from, value, perm)) = st.env(env)?.mailbox.take() {
                    return Ok(Ipc { from, value, perm });
                }
            }
            thread::sleep(Duration::from_micros(50));
        }
    }

    fn ipc_send(&self, env: Envid, to: Envid, value: i32, srcva: usize, perm: Perm) -> Result<()> {
        let mut st = self.state.lock();
        let dstva = match st.env(to)?.recving {
            Some(dstva) => dstva,
            None => return Err(Error::IpcNotRecv),
        };
        let mut delivered = Perm::empty();
        if srcva != 0 && dstva != 0 {
            let mapping = st.lookup(env, srcva)?;
            st.insert(
                to,
                dstva / BY2PG,
                Mapping {
                    phys: mapping.phys,
                    perm,
                },
            )?;
            delivered = perm;
        }
        let e = st.env(to)?;
        e.recving = None;
        e.mailbox = Some((env, value, delivered));
        Ok(())
    }

    fn env_alloc(&self, parent: Envid) -> Result<Envid> {
        let mut st = self.state.lock();
        let pgfault = st.env(parent)?.pgfault;
        let mut child = EnvState::new();
        child.pgfault = pgfault;
        st.envs.push(child);
        Ok(st.envs.len() as Envid)
    }

    fn set_env_status(&self, env: Envid, runnable: bool) -> Result<()> {
        self.state.lock().env(env)?.runnable = runnable;
        Ok(())
    }

    fn set_pgfault_handler(&self, env: Envid, handler: PgfaultFn) {
        if let Ok(e) = self.state.lock().env(env) {
            e.pgfault = Some(handler);
        }
    }

    fn ide_read(
        &self,
        _diskno: u32,
        secno: u32,
        env: Envid,
        dstva: usize,
        nsecs: u32,
    ) -> Result<()> {
        let disk = self.disk.lock();
        for i in 0..nsecs as usize {
            let off = (secno as usize + i) * BY2SECT;
            if off + BY2SECT > disk.len() {
                return Err(Error::Io);
            }
            let va = dstva + i * BY2SECT;
            let (cell, _) = self.locked_cell(env, va)?;
            let mut guard = cell.acquire();
            let page_off = va % BY2PG;
            guard.data_mut()[page_off..page_off + BY2SECT]
                .copy_from_slice(&disk[off..off + BY2SECT]);
        }
        Ok(())
    }

    fn ide_write(
        &self,
        _diskno: u32,
        secno: u32,
        env: Envid,
        srcva: usize,
        nsecs: u32,
    ) -> Result<()> {
        let mut disk = self.disk.lock();
        for i in 0..nsecs as usize {
            let off = (secno as usize + i) * BY2SECT;
            if off + BY2SECT > disk.len() {
                return Err(Error::Io);
            }
            let va = srcva + i * BY2SECT;
            let (cell, _) = self.locked_cell(env, va)?;
            let guard = cell.acquire();
            let page_off = va % BY2PG;
            disk[off..off + BY2SECT].copy_from_slice(&guard.data()[page_off..page_off + BY2SECT]);
        }
        Ok(())
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::Syscalls;

    fn boot() -> EmuKernel {
        EmuKernel::new(vec![0; 64 * BY2PG])
    }

    #[test]
    fn alloc_map_refcount() {
        let kern = boot();
        let a = kern.env_create();
        let b = kern.env_create();

        kern.mem_alloc(a, 0x1000, Perm::VALID | Perm::WRITE).unwrap();
        assert_eq!(kern.pageref(a, 0x1000), 1);

        kern.mem_map(a, 0x1000, b, 0x5000, Perm::VALID).unwrap();
        assert_eq!(kern.pageref(a, 0x1000), 2);
        assert_eq!(kern.pageref(b, 0x5000), 2);

        // Writes through one mapping are visible through the other.
        kern.page_mut(a, 0x1000).unwrap()[0] = 0xd1;
        assert_eq!(kern.page(b, 0x5000).unwrap()[0], 0xd1);
        assert!(kern.page_mut(b, 0x5000).is_err());

        kern.mem_unmap(a, 0x1000).unwrap();
        assert_eq!(kern.pageref(b, 0x5000), 1);
        assert_eq!(kern.pageref(a, 0x1000), 0);
    }

    #[test]
    fn map_over_existing_mapping_releases_old_page() {
        let kern = boot();
        let a = kern.env_create();
        kern.mem_alloc(a, 0x1000, Perm::VALID | Perm::WRITE).unwrap();
        kern.mem_alloc(a, 0x2000, Perm::VALID | Perm::WRITE).unwrap();
        kern.mem_map(a, 0x1000, a, 0x2000, Perm::VALID).unwrap();
        assert_eq!(kern.pageref(a, 0x1000), 2);
    }

    #[test]
    fn ipc_requires_receiver() {
        let kern = boot();
        let a = kern.env_create();
        let b = kern.env_create();
        assert_eq!(
            kern.ipc_send(a, b, 7, 0, Perm::empty()),
            Err(Error::IpcNotRecv)
        );
    }

    #[test]
    fn ide_round_trip() {
        let kern = boot();
        let a = kern.env_create();
        kern.mem_alloc(a, 0x3000, Perm::VALID | Perm::WRITE).unwrap();
        kern.page_mut(a, 0x3000).unwrap()[..4].copy_from_slice(b"disk");
        kern.ide_write(0, 8, a, 0x3000, 8).unwrap();

        kern.mem_alloc(a, 0x4000, Perm::VALID | Perm::WRITE).unwrap();
        kern.ide_read(0, 8, a, 0x4000, 8).unwrap();
        assert_eq!(&kern.page(a, 0x4000).unwrap()[..4], b"disk");
    }

    #[test]
    fn ide_out_of_range_fails() {
        let kern = boot();
        let a = kern.env_create();
        kern.mem_alloc(a, 0x3000, Perm::VALID | Perm::WRITE).unwrap();
        assert_eq!(kern.ide_read(0, 1 << 20, a, 0x3000, 8), Err(Error::Io));
    }
}
