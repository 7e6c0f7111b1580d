//! IPC convenience wrappers.
//!
//! The kernel's send is try-send: it fails with `IpcNotRecv` unless the
//! target is already blocked in `ipc_recv`. `send` turns that into the
//! blocking call everybody wants by yielding and retrying.

use crate::error::{Error, Result};
use crate::sys::{Envid, Ipc, Perm, Syscalls};

/// Send `value` (and the page at `srcva`, unless 0) to `to`, waiting for the
/// receiver to show up.
pub fn send(
    kern: &dyn Syscalls,
    env: Envid,
    to: Envid,
    value: i32,
    srcva: usize,
    perm: Perm,
) -> Result<()> {
    loop {
        match kern.ipc_send(env, to, value, srcva, perm) {
            Err(Error::IpcNotRecv) => kern.yield_now(),
            r => return r,
        }
    }
}

/// Block until a message arrives. An attached page lands at `dstva`; pass 0
/// to refuse pages.
pub fn recv(kern: &dyn Syscalls, env: Envid, dstva: usize) -> Result<Ipc> {
    kern.ipc_recv(env, dstva)
}
