//! pagefs: a user-space file system service for a microkernel platform.
//!
//! The server process maps the whole disk into a fixed virtual window and
//! serves seven request types over single-page IPC; clients go through a
//! descriptor table whose pages the kernel shares across fork, and read or
//! write file data through block pages mapped straight out of the server's
//! cache. The kernel primitives everything rests on are the `sys::Syscalls`
//! trait; `sys::emu` is an in-memory kernel good enough to run the whole
//! system on a host.

// The on-disk format is pinned little-endian; no byte swapping is done
// anywhere.
#[cfg(target_endian = "big")]
compile_error!("pagefs supports little-endian targets only");

pub mod error;
pub mod fcntl;
pub mod fs;
pub mod param;
pub mod sys;
pub mod user;
