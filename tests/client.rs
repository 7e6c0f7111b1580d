//! End-to-end tests through the descriptor layer: open/read/write/seek,
//! dup, stat, truncate, the size limits, and fork with inherited
//! descriptors.

mod common;

use std::thread;

use common::{boot_served, NBLOCKS};

use pagefs::error::Error;
use pagefs::fcntl::OMode;
use pagefs::param::{BY2BLK, MAXFD, MAXFILESIZE, MAXPATHLEN};
use pagefs::sys::emu::EmuKernel;
use pagefs::sys::{Perm, Syscalls};
use pagefs::user::fd::{self, Stat, DEVFILE_ID};
use pagefs::user::{file, fork, Process};

fn setup() -> (&'static EmuKernel, Process<'static>) {
    let (kern, fsenv) = boot_served(NBLOCKS);
    let env = kern.env_create();
    (kern, Process::new(kern, env, fsenv))
}

#[test]
fn write_then_read_back() {
    let (kern, proc) = setup();

    let fdnum = file::open(&proc, b"/a", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    assert_eq!(fd::write(&proc, fdnum, b"hello").unwrap(), 5);
    fd::seek(&proc, fdnum, 0).unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(fd::read(&proc, fdnum, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    let mut st = Stat::zeroed();
    fd::fstat(&proc, fdnum, &mut st).unwrap();
    assert_eq!(st.size, 5);
    assert!(!st.isdir);
    assert_eq!(st.name_bytes(), b"a");
    assert_eq!(st.dev, DEVFILE_ID);

    // After a sync, exactly one data block carries the bytes and its bitmap
    // bit says in-use.
    file::sync(&proc).unwrap();
    let disk = kern.disk_contents();
    let blockno = disk
        .chunks(BY2BLK)
        .position(|c| c.starts_with(b"hello"))
        .unwrap();
    assert_eq!(disk[2 * BY2BLK + blockno / 8] & (1 << (blockno % 8)), 0);
}

#[test]
fn eleven_block_file_round_trips() {
    let (_kern, proc) = setup();

    let n = 11 * BY2BLK;
    let data = vec![0xaau8; n];
    let fdnum = file::open(&proc, b"/big", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    assert_eq!(fd::write(&proc, fdnum, &data).unwrap(), n);

    let mut st = Stat::zeroed();
    fd::fstat(&proc, fdnum, &mut st).unwrap();
    assert_eq!(st.size, n as u32);

    fd::seek(&proc, fdnum, 0).unwrap();
    let mut back = vec![0u8; n];
    assert_eq!(fd::readn(&proc, fdnum, &mut back).unwrap(), n);
    assert_eq!(back, data);
}

#[test]
fn reads_and_writes_cross_block_boundaries() {
    let (_kern, proc) = setup();

    let fdnum = file::open(&proc, b"/span", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    fd::seek(&proc, fdnum, BY2BLK as u32 - 3).unwrap();
    assert_eq!(fd::write(&proc, fdnum, b"straddle").unwrap(), 8);

    fd::seek(&proc, fdnum, BY2BLK as u32 - 3).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fd::read(&proc, fdnum, &mut buf).unwrap(), 8);
    assert_eq!(&buf, b"straddle");

    let mut st = Stat::zeroed();
    fd::fstat(&proc, fdnum, &mut st).unwrap();
    assert_eq!(st.size, BY2BLK as u32 + 5);
}

#[test]
fn dup_aliases_descriptor_state() {
    let (_kern, proc) = setup();

    let fdnum = file::open(&proc, b"/d", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    assert_eq!(fd::write(&proc, fdnum, b"abcdef").unwrap(), 6);
    fd::seek(&proc, fdnum, 2).unwrap();

    assert_eq!(fd::dup(&proc, fdnum, 9).unwrap(), 9);

    // The Fd page is aliased, so the offset is one shared cursor.
    let mut buf = [0u8; 2];
    assert_eq!(fd::read(&proc, 9, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"cd");
    assert_eq!(fd::read(&proc, fdnum, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"ef");

    fd::close(&proc, 9).unwrap();
    // The original still works after closing the duplicate.
    fd::seek(&proc, fdnum, 0).unwrap();
    assert_eq!(fd::read(&proc, fdnum, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"ab");
}

#[test]
fn access_mode_is_enforced_client_side() {
    let (_kern, proc) = setup();

    let w = file::open(&proc, b"/m", OMode::O_WRONLY | OMode::O_CREAT).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(fd::read(&proc, w, &mut buf).err(), Some(Error::Invalid));
    assert_eq!(fd::write(&proc, w, b"x").unwrap(), 1);

    let r = file::open(&proc, b"/m", OMode::O_RDONLY).unwrap();
    assert_eq!(fd::write(&proc, r, b"y").err(), Some(Error::Invalid));
    assert_eq!(fd::read(&proc, r, &mut buf).unwrap(), 1);
    assert_eq!(&buf, b"x");
}

#[test]
fn truncate_then_size() {
    let (_kern, proc) = setup();

    let fdnum = file::open(&proc, b"/t", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    let data = vec![7u8; 2 * BY2BLK];
    assert_eq!(fd::write(&proc, fdnum, &data).unwrap(), data.len());

    file::ftruncate(&proc, fdnum, BY2BLK as u32).unwrap();
    let mut st = Stat::zeroed();
    fd::fstat(&proc, fdnum, &mut st).unwrap();
    assert_eq!(st.size, BY2BLK as u32);

    // Reads stop at the new end.
    fd::seek(&proc, fdnum, 0).unwrap();
    let mut back = vec![0u8; 2 * BY2BLK];
    assert_eq!(fd::read(&proc, fdnum, &mut back).unwrap(), BY2BLK);
    assert_eq!(fd::read(&proc, fdnum, &mut back).unwrap(), 0);

    // O_TRUNC does the same at open time.
    let again = file::open(&proc, b"/t", OMode::O_RDWR | OMode::O_TRUNC).unwrap();
    fd::fstat(&proc, again, &mut st).unwrap();
    assert_eq!(st.size, 0);
}

#[test]
fn file_size_limit() {
    let (_kern, proc) = setup();

    let fdnum = file::open(&proc, b"/edge", OMode::O_RDWR | OMode::O_CREAT).unwrap();

    // The last addressable block works...
    fd::seek(&proc, fdnum, (MAXFILESIZE - BY2BLK) as u32).unwrap();
    let tail = vec![0x5au8; BY2BLK];
    assert_eq!(fd::write(&proc, fdnum, &tail).unwrap(), BY2BLK);
    let mut st = Stat::zeroed();
    fd::fstat(&proc, fdnum, &mut st).unwrap();
    assert_eq!(st.size, MAXFILESIZE as u32);

    fd::seek(&proc, fdnum, (MAXFILESIZE - BY2BLK) as u32).unwrap();
    let mut back = vec![0u8; BY2BLK];
    assert_eq!(fd::read(&proc, fdnum, &mut back).unwrap(), BY2BLK);
    assert_eq!(back, tail);

    // ...one byte past it does not.
    fd::seek(&proc, fdnum, MAXFILESIZE as u32).unwrap();
    assert_eq!(fd::write(&proc, fdnum, b"x").err(), Some(Error::Invalid));
}

#[test]
fn remove_then_open_is_notfound() {
    let (_kern, proc) = setup();

    let fdnum = file::open(&proc, b"/r", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    fd::write(&proc, fdnum, b"bye").unwrap();
    fd::close(&proc, fdnum).unwrap();

    file::remove(&proc, b"/r").unwrap();
    assert_eq!(
        file::open(&proc, b"/r", OMode::O_RDONLY).err(),
        Some(Error::NotFound)
    );
}

#[test]
fn stat_by_path() {
    let (_kern, proc) = setup();

    let fdnum = file::open(&proc, b"/st", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    fd::write(&proc, fdnum, b"data").unwrap();
    fd::close(&proc, fdnum).unwrap();

    let st = fd::stat(&proc, b"/st").unwrap();
    assert_eq!(st.size, 4);
    assert_eq!(st.name_bytes(), b"st");
    assert!(!st.isdir);

    // Root stats as a directory.
    let st = fd::stat(&proc, b"/").unwrap();
    assert!(st.isdir);
}

#[test]
fn descriptor_table_fills_up() {
    let (_kern, proc) = setup();

    for _ in 0..MAXFD {
        file::open(&proc, b"/x", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    }
    assert_eq!(
        file::open(&proc, b"/x", OMode::O_RDONLY).err(),
        Some(Error::MaxOpen)
    );

    fd::close_all(&proc);
    assert_eq!(file::open(&proc, b"/x", OMode::O_RDONLY).unwrap(), 0);
}

#[test]
fn client_path_limits() {
    let (_kern, proc) = setup();

    let ok = format!("/{}", "x".repeat(127));
    let fdnum = file::open(&proc, ok.as_bytes(), OMode::O_RDWR | OMode::O_CREAT).unwrap();
    fd::close(&proc, fdnum).unwrap();

    let long_component = format!("/{}", "y".repeat(128));
    assert_eq!(
        file::open(&proc, long_component.as_bytes(), OMode::O_RDWR | OMode::O_CREAT).err(),
        Some(Error::BadPath)
    );

    let long_path = vec![b'z'; MAXPATHLEN];
    assert_eq!(
        file::open(&proc, &long_path, OMode::O_RDONLY).err(),
        Some(Error::BadPath)
    );
}

#[test]
fn fork_preserves_descriptors_and_cow() {
    let (kern, proc) = setup();
    let prog_va = 0x0040_0000;

    let fdnum = file::open(&proc, b"/f", OMode::O_RDWR | OMode::O_CREAT).unwrap();
    assert_eq!(fd::write(&proc, fdnum, b"xyz").unwrap(), 3);
    fd::seek(&proc, fdnum, 0).unwrap();

    // A private "program" page that must not leak into the child.
    kern.mem_alloc(proc.env(), prog_va, Perm::VALID | Perm::WRITE)
        .unwrap();
    kern.page_mut(proc.env(), prog_va).unwrap()[0] = 7;

    let child = fork::fork(&proc).unwrap();
    assert!(kern.is_runnable(child));

    // The Fd page is library-shared: server + parent + child all map it.
    assert_eq!(kern.pageref(proc.env(), fd::index2fd(fdnum)), 3);
    // The program page went copy-on-write on both sides.
    assert!(kern.va_perm(proc.env(), prog_va).contains(Perm::COW));
    assert!(kern.va_perm(child, prog_va).contains(Perm::COW));

    let fsenv = proc.fsenv();
    let handle = thread::spawn(move || {
        let cproc = Process::new(kern, child, fsenv);
        let mut buf = [0u8; 3];
        let n = fd::read(&cproc, fdnum, &mut buf).unwrap();
        // Writing privatizes the CoW page in the child only.
        kern.page_mut(child, prog_va).unwrap()[0] = 9;
        (n, buf)
    });
    let (n, buf) = handle.join().unwrap();
    assert_eq!(n, 3);
    assert_eq!(&buf, b"xyz");

    // The parent's copy of the program page is untouched.
    assert_eq!(kern.page(proc.env(), prog_va).unwrap()[0], 7);
    assert_eq!(kern.page(child, prog_va).unwrap()[0], 9);

    // The offset lives in the shared Fd page, so the child's read moved the
    // parent to end of file.
    let mut buf2 = [0u8; 3];
    assert_eq!(fd::read(&proc, fdnum, &mut buf2).unwrap(), 0);
}
