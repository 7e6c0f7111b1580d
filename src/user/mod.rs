//! Client library: the per-process descriptor table, the device multiplexer,
//! the file device driver and copy-on-write fork. Everything a process needs
//! to talk to the file system server.

pub mod fd;
pub mod file;
pub mod fork;
pub mod ipc;

use arrayvec::ArrayVec;

use crate::error::{Error, Result};
use crate::param::NDEV;
use crate::sys::{Envid, Syscalls};

use fd::Dev;

/// A process's view of the world: its kernel handle, its environment id and
/// the id of the file system server, plus the device table the descriptor
/// layer dispatches through. The file device is always installed; console
/// and pipe back-ends register themselves.
pub struct Process<'k> {
    kern: &'k dyn Syscalls,
    env: Envid,
    fsenv: Envid,
    devtab: ArrayVec<&'k dyn Dev, NDEV>,
}

impl<'k> Process<'k> {
    pub fn new(kern: &'k dyn Syscalls, env: Envid, fsenv: Envid) -> Process<'k> {
        let mut devtab = ArrayVec::new();
        devtab.push(&file::DEVFILE as &dyn Dev);
        Process {
            kern,
            env,
            fsenv,
            devtab,
        }
    }

    pub fn kern(&self) -> &'k dyn Syscalls {
        self.kern
    }

    pub fn env(&self) -> Envid {
        self.env
    }

    pub fn fsenv(&self) -> Envid {
        self.fsenv
    }

    pub fn register_device(&mut self, dev: &'k dyn Dev) {
        self.devtab.push(dev);
    }

    /// Find a device back-end by id.
    pub fn dev_lookup(&self, dev_id: u32) -> Result<&'k dyn Dev> {
        match self.devtab.iter().copied().find(|d| d.id() == dev_id) {
            Some(dev) => Ok(dev),
            None => {
                log::warn!("[{:08x}] unknown device type {}", self.env, dev_id);
                Err(Error::Invalid)
            }
        }
    }
}
