//! Open-mode flags, shared by clients and the server.

use bitflags::bitflags;

bitflags! {
    pub struct OMode: u32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_ACCMODE = 0x3;
        const O_CREAT = 0x100;
        const O_TRUNC = 0x200;
        const O_EXCL = 0x400;
    }
}

impl OMode {
    pub fn from_raw(bits: u32) -> OMode {
        OMode::from_bits_truncate(bits)
    }

    fn accmode(self) -> u32 {
        self.bits() & OMode::O_ACCMODE.bits()
    }

    pub fn readable(self) -> bool {
        self.accmode() != OMode::O_WRONLY.bits()
    }

    pub fn writable(self) -> bool {
        self.accmode() != OMode::O_RDONLY.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::OMode;

    #[test]
    fn access_modes() {
        assert!(OMode::O_RDONLY.readable() && !OMode::O_RDONLY.writable());
        assert!(!OMode::O_WRONLY.readable() && OMode::O_WRONLY.writable());
        assert!(OMode::O_RDWR.readable() && OMode::O_RDWR.writable());

        let m = OMode::from_raw(OMode::O_RDWR.bits() | OMode::O_CREAT.bits());
        assert!(m.contains(OMode::O_CREAT));
        assert!(m.readable() && m.writable());
    }
}
