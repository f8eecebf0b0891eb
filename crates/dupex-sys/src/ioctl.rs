//! Request-code composition for the ioctl interface.
//!
//! A request code packs the transfer direction, the argument size, a type
//! byte and a sequence number into 32 bits, mirroring the kernel's `_IOC`
//! macro family.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

const NR_BITS: u32 = 8;
const TYPE_BITS: u32 = 8;
const SIZE_BITS: u32 = 14;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = NR_SHIFT + NR_BITS;
const SIZE_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;
const DIR_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;

pub const DIR_WRITE: u32 = 1;
pub const DIR_READ: u32 = 2;

pub const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u64 {
    ((dir as u64) << DIR_SHIFT)
        | ((size as u64) << SIZE_SHIFT)
        | ((ty as u64) << TYPE_SHIFT)
        | ((nr as u64) << NR_SHIFT)
}

/// Read-write request code: the kernel both reads and fills the argument
/// block in place.
pub const fn iowr(ty: u32, nr: u32, size: usize) -> u64 {
    ioc(DIR_READ | DIR_WRITE, ty, nr, size as u32)
}

/// Issues `op` on `fd` with `arg` pointing at the request block.
///
/// # Safety
///
/// `arg` must point at a block matching the layout the request code was
/// derived from, valid for reads and writes for the duration of the call.
pub unsafe fn ioctl<T>(fd: BorrowedFd<'_>, op: u64, arg: *mut T) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), op as libc::c_ulong, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_map_request_code() {
        // FS_IOC_FIEMAP, verified against the kernel headers.
        assert_eq!(iowr(0x66, 0x0b, 32), 0xc020660b);
    }

    #[test]
    fn same_extent_request_code() {
        // BTRFS_IOC_FILE_EXTENT_SAME; the size covers the header only,
        // the kernel derives the tail length from dest_count.
        assert_eq!(iowr(0x94, 54, 24), 0xc0189436);
    }

    #[test]
    fn direction_bits_are_distinct() {
        assert_eq!(ioc(DIR_READ, 0, 0, 0) >> DIR_SHIFT, 2);
        assert_eq!(ioc(DIR_WRITE, 0, 0, 0) >> DIR_SHIFT, 1);
        assert_eq!(ioc(DIR_READ | DIR_WRITE, 0, 0, 0) >> DIR_SHIFT, 3);
    }
}
