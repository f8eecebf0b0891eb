//! The fragment-map request (`FS_IOC_FIEMAP`).

use std::fs::File;
use std::os::fd::AsFd;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::ioctl::{self, iowr};

/// `_IOWR('f', 11, struct fiemap)`; the size covers the 32-byte header,
/// the extent array follows it in memory.
const FS_IOC_FIEMAP: u64 = iowr(0x66, 0x0b, 32);

/// Extents fetched per call; files with more fragments loop.
const EXTENT_BATCH: usize = 20;

/// Logical window requested per call.
const MAP_WINDOW: u64 = 1024 * 1024 * 1024;

bitflags! {
    /// Per-extent flags reported by the fragment map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiemapExtentFlags: u32 {
        /// Final extent of the file; terminates the mapping loop.
        const LAST = 0x0000_0001;
        /// The extent location is unknown to the filesystem.
        const UNKNOWN = 0x0000_0002;
        /// Data is buffered but not yet allocated on the device.
        const DELALLOC = 0x0000_0004;
        /// Data is compressed or otherwise encoded on the device.
        const ENCODED = 0x0000_0008;
        /// Allocated but unwritten space.
        const UNWRITTEN = 0x0000_0800;
        /// The reported extent was merged from smaller ones.
        const MERGED = 0x0000_1000;
        /// The extent is already shared with other files.
        const SHARED = 0x0000_2000;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FiemapExtent {
    logical: u64,
    physical: u64,
    length: u64,
    reserved64: [u64; 2],
    flags: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FiemapRequest {
    start: u64,
    length: u64,
    flags: u32,
    mapped_extents: u32,
    extent_count: u32,
    reserved: u32,
    extents: [FiemapExtent; EXTENT_BATCH],
}

/// A contiguous run of device bytes backing a logical file range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fragment {
    /// Absolute device byte offset.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FragmentMapError {
    /// The kernel mapped no extents although the end of the file was not
    /// reached yet.
    #[error("no further extents mapped at logical offset {0}")]
    NoMoreExtents(u64),
    /// A hole in the logical range; holes carry no physical storage that
    /// could be shared.
    #[error("sparse files are not supported")]
    SparseFile,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Maps every fragment of `file`, in logical order.
///
/// Logical offsets must be contiguous from zero, so the fragment list
/// alone determines the logical layout; a file with holes is rejected.
pub fn fragments(file: &File) -> Result<Vec<Fragment>, FragmentMapError> {
    let mut result = Vec::new();
    let mut start = 0u64;
    let mut last = false;
    while !last {
        let mut request = FiemapRequest::zeroed();
        request.start = start;
        request.length = MAP_WINDOW;
        request.extent_count = EXTENT_BATCH as u32;

        unsafe { ioctl::ioctl(file.as_fd(), FS_IOC_FIEMAP, &mut request)? };

        if request.mapped_extents == 0 {
            return Err(FragmentMapError::NoMoreExtents(start));
        }
        for extent in &request.extents[..request.mapped_extents as usize] {
            let flags = FiemapExtentFlags::from_bits_truncate(extent.flags);
            last = last || flags.contains(FiemapExtentFlags::LAST);
            if extent.logical != start {
                return Err(FragmentMapError::SparseFile);
            }
            result.push(Fragment {
                start: extent.physical,
                length: extent.length,
            });
            start += extent.length;
        }
    }
    Ok(result)
}
