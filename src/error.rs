//! The closed error set shared by the server and its clients. Every variant
//! crosses IPC as a distinct negative integer; `0` is success.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    /// Bad fileid, wrong mode for the operation, or malformed request.
    Invalid = 3,
    /// Page allocation failed.
    NoMem = 4,
    /// The receiver was not waiting on its IPC endpoint.
    IpcNotRecv = 6,
    /// No free block left on disk.
    NoDisk = 7,
    /// All open-file or descriptor slots are in use.
    MaxOpen = 8,
    /// Path lookup failed.
    NotFound = 9,
    /// A path component exceeds MAXNAMELEN.
    BadPath = 10,
    /// Creation target already exists.
    FileExists = 11,
    /// Disk I/O failed.
    Io = 12,
}

impl Error {
    /// Wire representation: the negative status carried in an IPC reply.
    pub fn code(self) -> i32 {
        -(self as i32)
    }

    /// Decode a wire status. `None` for `0` and for unknown codes.
    pub fn from_code(code: i32) -> Option<Error> {
        match -code {
            3 => Some(Error::Invalid),
            4 => Some(Error::NoMem),
            6 => Some(Error::IpcNotRecv),
            7 => Some(Error::NoDisk),
            8 => Some(Error::MaxOpen),
            9 => Some(Error::NotFound),
            10 => Some(Error::BadPath),
            11 => Some(Error::FileExists),
            12 => Some(Error::Io),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Invalid => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::IpcNotRecv => "receiver not ready",
            Error::NoDisk => "no free space on disk",
            Error::MaxOpen => "too many open files",
            Error::NotFound => "file or block not found",
            Error::BadPath => "bad path",
            Error::FileExists => "file already exists",
            Error::Io => "disk I/O error",
        };
        write!(f, "{}", msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
