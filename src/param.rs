//! Layout constants shared by the server, the client library and the disk
//! format. Block size equals the hardware page size, so every cache operation
//! is a page-table operation.

/// Bytes per page.
pub const BY2PG: usize = 4096;

/// Bytes per file system block - same as page size.
pub const BY2BLK: usize = BY2PG;

/// Bits per bitmap block.
pub const BIT2BLK: usize = BY2BLK * 8;

/// Bytes per disk sector.
pub const BY2SECT: usize = 512;

/// Sectors per block.
pub const SECT2BLK: usize = BY2BLK / BY2SECT;

/// Maximum size of a filename (a single path component), including null.
pub const MAXNAMELEN: usize = 128;

/// Maximum size of a complete pathname, including null.
pub const MAXPATHLEN: usize = 1024;

/// Number of direct block slots in a file record.
pub const NDIRECT: usize = 10;

/// Number of block slots addressable through the indirect block. The first
/// NDIRECT entries of the indirect block are kept unused so that a file block
/// number indexes the table uniformly.
pub const NINDIRECT: usize = BY2BLK / 4;

/// Maximum size of a file.
pub const MAXFILESIZE: usize = NINDIRECT * BY2BLK;

/// Bytes of a file record.
pub const BY2FILE: usize = 256;

/// File records per directory block.
pub const FILE2BLK: usize = BY2BLK / BY2FILE;

/// File system magic number.
pub const FS_MAGIC: u32 = 0x6828_6097;

/// Base of the server's disk-mapping window. Block `n` lives at
/// `DISKMAP + n * BY2BLK`.
pub const DISKMAP: usize = 0x1000_0000;

/// Size of the disk-mapping window; bounds the usable disk size.
pub const DISKMAX: usize = 0x4000_0000;

/// Max number of open files in the file system at once.
pub const MAXOPEN: usize = 1024;

/// Base address of the per-slot Filefd pages in the server.
pub const FILEVA: usize = 0x6000_0000;

/// Virtual address at which the server receives request argument pages.
pub const REQVA: usize = 0x0fff_f000;

/// Virtual address of a client's request argument page.
pub const FSIPCBUF: usize = 0x0fff_e000;

/// Scratch page used by the copy-on-write page-fault handler.
pub const PFTEMP: usize = 0x0fff_d000;

/// Maximum number of file descriptors per process.
pub const MAXFD: usize = 32;

/// Bytes mapped by one page-directory entry; also the size of one
/// descriptor's data region (enough for MAXFILESIZE).
pub const PDMAP: usize = 0x0040_0000;

/// Base address of the per-descriptor file data regions.
pub const FILEBASE: usize = 0x6000_0000;

/// Base address of the descriptor table; one page per descriptor, directly
/// below the data regions.
pub const FDTABLE: usize = FILEBASE - PDMAP;

/// Top of the user stack; user-level fork duplicates every mapping below it.
pub const USTACKTOP: usize = 0x7000_0000;

/// Maximum number of device back-ends a process can dispatch to.
pub const NDEV: usize = 8;
