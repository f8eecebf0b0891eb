//! The per-file record carried through the passes.

use nix::unistd::AccessFlags;

use dupex_sys::Fragment;

use crate::pathstore::PathStore;

/// Granularity of hashing, offset scanning and request chunking.
pub const BLOCK_SIZE: u64 = 4096;

/// Everything the pipeline keeps about one scanned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Handle into the file table of the [`PathStore`].
    pub path: i32,
    /// Set when hashing the first block failed; excludes the record from
    /// submission.
    pub error: bool,
    /// Total file size in bytes, as reported by stat.
    pub size: i64,
    /// Physical fragments in logical order, contiguous from offset zero.
    pub fragments: Vec<Fragment>,
    /// MD5 of the first 4 KiB, filled during the hashing pass.
    pub first_block_sum: Option<[u8; 16]>,
}

impl FileInfo {
    pub fn new(path: i32, size: i64, fragments: Vec<Fragment>) -> Self {
        assert!(!fragments.is_empty(), "a file record needs at least one fragment");
        Self {
            path,
            error: false,
            size,
            fragments,
            first_block_sum: None,
        }
    }

    /// Device offset of the first fragment; the pass-1 grouping key.
    /// Files sharing it already share storage.
    pub fn physical_offset(&self) -> u64 {
        self.fragments[0].start
    }

    /// Device offset backing logical byte `offset`, or `None` past the
    /// fragment span.
    pub fn physical_offset_at(&self, offset: u64) -> Option<u64> {
        let mut logical = 0u64;
        for fragment in &self.fragments {
            if offset < logical + fragment.length {
                return Some(fragment.start + (offset - logical));
            }
            logical += fragment.length;
        }
        None
    }

    /// Whether the process may write the file; decides which group member
    /// can be defragmented.
    pub fn writable(&self, paths: &PathStore) -> bool {
        nix::unistd::access(&paths.file_path(self.path), AccessFlags::W_OK).is_ok()
    }
}
