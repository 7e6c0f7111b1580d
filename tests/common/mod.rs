//! Shared test harness: a formatted RAM disk behind the in-memory kernel,
//! with the server either driven directly on the test thread or running on
//! its own thread behind the IPC protocol.

#![allow(dead_code)]

use std::thread;

use pagefs::fs::format::format;
use pagefs::fs::path::Path;
use pagefs::fs::FsServer;
use pagefs::sys::emu::EmuKernel;
use pagefs::sys::Envid;

pub const NBLOCKS: u32 = 1024;

/// Boot a kernel on a freshly formatted disk. Leaked so server threads can
/// borrow it for the rest of the process.
pub fn boot(nblocks: u32) -> &'static EmuKernel {
    Box::leak(Box::new(EmuKernel::new(format(nblocks))))
}

/// Kernel plus an initialized server driven directly by the test.
pub fn boot_server(nblocks: u32) -> (&'static EmuKernel, FsServer<'static>) {
    let kern = boot(nblocks);
    let env = kern.env_create();
    let mut srv = FsServer::new(kern, env);
    srv.fs_init().unwrap();
    (kern, srv)
}

/// Kernel plus a server loop running on its own thread; returns the
/// server's environment id for clients to talk to.
pub fn boot_served(nblocks: u32) -> (&'static EmuKernel, Envid) {
    let kern = boot(nblocks);
    let fsenv = kern.env_create();
    thread::spawn(move || {
        let mut srv = FsServer::new(kern, fsenv);
        srv.fs_init().unwrap();
        srv.serve();
    });
    (kern, fsenv)
}

/// Borrow a str as a resolver path.
pub fn p(s: &str) -> &Path {
    // SAFETY: test paths contain no NUL bytes.
    unsafe { Path::from_bytes(s.as_bytes()) }
}
