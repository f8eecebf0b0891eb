//! The same-extent request (`BTRFS_IOC_FILE_EXTENT_SAME`).
//!
//! The kernel compares the source region against every destination and
//! replaces the destinations' extents with shared references where the
//! bytes are equal. The comparison is the kernel's, not ours; callers
//! only propose candidates.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd};

use bytemuck::{Pod, Zeroable};

use crate::ioctl::{self, iowr};

/// `_IOWR(0x94, 54, 24)`; the size covers the header only, the kernel
/// derives the tail length from `dest_count`.
const FILE_EXTENT_SAME: u64 = iowr(0x94, 54, 24);

/// Destination status for byte-inequality.
const SAME_DATA_DIFFERS: i32 = 1;

/// The kernel caps a single request at this many destinations.
pub const MAX_DEST_COUNT: usize = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SameExtentInfo {
    /// Destination file descriptor.
    fd: i64,
    /// Start of the candidate region in the destination.
    logical_offset: u64,
    /// Filled by the kernel: bytes it managed to share.
    bytes_deduped: u64,
    /// Filled by the kernel: 0 ok, 1 data differs, negative errno.
    status: i32,
    reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SameExtentRequest {
    /// Start of the source region; the request is issued on the source fd.
    logical_offset: u64,
    length: u64,
    dest_count: u16,
    reserved1: u16,
    reserved2: u32,
    info: [SameExtentInfo; MAX_DEST_COUNT],
}

/// One member of a same-extent batch: an open file and the logical
/// offset at which its candidate region starts.
#[derive(Debug)]
pub struct ExtentRange<'a> {
    pub file: &'a File,
    pub logical_offset: u64,
}

/// Per-destination outcome of a same-extent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameStatus {
    /// The kernel verified equality and now shares this many bytes.
    Deduped(u64),
    /// The byte comparison failed; nothing was shared.
    DataDiffers,
    /// The kernel rejected this destination with the given errno.
    Failed(i32),
}

impl fmt::Display for SameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameStatus::Deduped(bytes) => write!(f, "ok, {bytes} bytes deduplicated"),
            SameStatus::DataDiffers => f.write_str("data was different"),
            SameStatus::Failed(errno) => {
                write!(f, "error: {}", io::Error::from_raw_os_error(*errno))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SameExtentError {
    #[error("deduplication is supported for at most {MAX_DEST_COUNT} destinations, got {0}")]
    TooManyDestinations(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn status_of(info: &SameExtentInfo) -> SameStatus {
    match info.status {
        status if status < 0 => SameStatus::Failed(-status),
        SAME_DATA_DIFFERS => SameStatus::DataDiffers,
        _ => SameStatus::Deduped(info.bytes_deduped),
    }
}

/// Submits one same-extent batch.
///
/// `batch[0]` is the source; the request is issued on its descriptor and
/// the remaining members are destinations. Returns one status per
/// destination, in batch order.
///
/// Panics when the batch holds fewer than two files; that is a caller
/// bug, not a runtime condition.
pub fn extent_same(
    batch: &[ExtentRange<'_>],
    length: u64,
) -> Result<Vec<SameStatus>, SameExtentError> {
    assert!(
        batch.len() >= 2,
        "a same-extent batch needs a source and at least one destination"
    );
    let dest_count = batch.len() - 1;
    if dest_count > MAX_DEST_COUNT {
        return Err(SameExtentError::TooManyDestinations(dest_count));
    }

    let mut request: Box<SameExtentRequest> = Box::new(Zeroable::zeroed());
    request.logical_offset = batch[0].logical_offset;
    request.length = length;
    request.dest_count = dest_count as u16;
    for (slot, dest) in request.info.iter_mut().zip(&batch[1..]) {
        slot.fd = dest.file.as_raw_fd() as i64;
        slot.logical_offset = dest.logical_offset;
    }

    unsafe { ioctl::ioctl(batch[0].file.as_fd(), FILE_EXTENT_SAME, request.as_mut())? };

    Ok(request.info[..dest_count].iter().map(status_of).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn header_is_24_bytes() {
        assert_eq!(offset_of!(SameExtentRequest, info), 24);
        assert_eq!(
            size_of::<SameExtentRequest>(),
            24 + MAX_DEST_COUNT * size_of::<SameExtentInfo>()
        );
    }

    #[test]
    fn info_entry_is_32_bytes() {
        assert_eq!(size_of::<SameExtentInfo>(), 32);
        assert_eq!(offset_of!(SameExtentInfo, bytes_deduped), 16);
        assert_eq!(offset_of!(SameExtentInfo, status), 24);
    }

    #[test]
    fn request_code_matches_kernel_header() {
        assert_eq!(FILE_EXTENT_SAME, 0xc0189436);
    }

    fn info(status: i32, bytes: u64) -> SameExtentInfo {
        SameExtentInfo {
            fd: 3,
            logical_offset: 0,
            bytes_deduped: bytes,
            status,
            reserved: 0,
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_of(&info(0, 4096)), SameStatus::Deduped(4096));
        assert_eq!(status_of(&info(1, 0)), SameStatus::DataDiffers);
        assert_eq!(status_of(&info(-libc::EINVAL, 0)), SameStatus::Failed(libc::EINVAL));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let file = tempfile::tempfile().unwrap();
        let batch: Vec<ExtentRange<'_>> = (0..MAX_DEST_COUNT + 2)
            .map(|_| ExtentRange {
                file: &file,
                logical_offset: 0,
            })
            .collect();
        match extent_same(&batch, 4096) {
            Err(SameExtentError::TooManyDestinations(n)) => assert_eq!(n, MAX_DEST_COUNT + 1),
            other => panic!("expected a destination-count error, got {other:?}"),
        }
    }
}
