//! User-space fork with copy-on-write.
//!
//! The child gets the parent's whole address space below USTACKTOP, one page
//! at a time: library-shared pages (the descriptor table and the file data
//! regions) are aliased as they are, so open files stay shared; every other
//! writable page is remapped copy-on-write in both processes and privatized
//! lazily by the page-fault handler on first write.

use core::cmp;

use crate::error::Result;
use crate::param::{BY2PG, PDMAP, PFTEMP, USTACKTOP};
use crate::sys::{Envid, Perm, Syscalls};

use super::Process;

/// The page-fault handler: on a write to a copy-on-write page, copy it into
/// a private page via the PFTEMP scratch slot and swing the mapping over.
/// Faults on anything else are fatal.
pub(crate) fn pgfault(kern: &dyn Syscalls, env: Envid, va: usize) {
    let perm = kern.va_perm(env, va);
    assert!(
        perm.contains(Perm::COW),
        "pgfault: {:#010x} not a copy-on-write page",
        va
    );
    let perm = perm & !Perm::COW;

    kern.mem_alloc(env, PFTEMP, perm).expect("pgfault: mem_alloc");
    {
        let src = kern.page(env, va).expect("pgfault: source unmapped");
        let mut dst = kern.page_mut(env, PFTEMP).expect("pgfault: scratch unmapped");
        dst.copy_from_slice(&src[..]);
    }
    kern.mem_map(env, PFTEMP, env, va, perm)
        .expect("pgfault: mem_map");
    kern.mem_unmap(env, PFTEMP).expect("pgfault: mem_unmap");
}

/// Share one page with the child at the same address. Writable and
/// already-CoW pages turn copy-on-write for both sides, unless the page is
/// library-shared, which is inherited as is.
fn duppage(kern: &dyn Syscalls, parent: Envid, child: Envid, va: usize) -> Result<()> {
    let mut perm = kern.va_perm(parent, va);
    if (perm.contains(Perm::COW) || perm.contains(Perm::WRITE)) && !perm.contains(Perm::LIBRARY) {
        perm |= Perm::COW;
    }
    kern.mem_map(parent, va, child, va, perm)?;
    kern.mem_map(parent, va, parent, va, perm)?;
    Ok(())
}

/// Create a child environment sharing this process's address space
/// copy-on-write and mark it runnable. Returns the child's envid.
pub fn fork(proc: &Process<'_>) -> Result<Envid> {
    let kern = proc.kern();
    let env = proc.env();

    kern.set_pgfault_handler(env, pgfault);
    let child = kern.env_alloc(env)?;

    let mut va = 0;
    while va < USTACKTOP {
        // Skip whole chunks whose directory entry is empty.
        if !kern.pde_perm(env, va).contains(Perm::VALID) {
            va += PDMAP;
            continue;
        }
        let chunk_end = cmp::min(va + PDMAP, USTACKTOP);
        while va < chunk_end {
            if kern.va_perm(env, va).contains(Perm::VALID) {
                duppage(kern, env, child, va)?;
            }
            va += BY2PG;
        }
    }

    kern.set_env_status(child, true)?;
    Ok(child)
}
