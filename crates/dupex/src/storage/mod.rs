//! Scan state between the passes: "ingest records, then deliver them in
//! groups sharing a key".
//!
//! Two interchangeable implementations: [`MemoryStore`] keeps everything
//! in one vector, [`SpillStore`] serialises records to externally sorted
//! temporary files and streams partitions back. The pipeline picks one
//! at startup and only ever talks to the [`GroupStore`] trait.

mod file;
mod memory;

pub use file::{SPILL_PREFIX, SpillStore};
pub use memory::MemoryStore;

use std::path::PathBuf;
use std::process::ExitStatus;

use crate::fileinfo::FileInfo;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("external sort of {path} failed with {status}")]
    Sort { path: PathBuf, status: ExitStatus },
    #[error("corrupt spill record: {0}")]
    Corrupt(String),
    #[error("invalid base64 in spill record: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// The grouping primitive behind the three passes.
///
/// Records are ingested during pass 1 keyed by physical start, delivered
/// as offset groups and re-ingested keyed by first-block hash during
/// pass 2, and delivered as hash groups during pass 3. Within one
/// partitioning call every receiver invocation sees a maximal, non-empty
/// run of records sharing the key, in sorted-key order; no record is
/// delivered twice, and the union over invocations is the ingested
/// multiset net of the pass-2 filter.
///
/// The store owns its records between the start and end of a pass and
/// lends them out for the duration of a receiver call only. Calling an
/// operation outside its pass is a caller bug and panics.
pub trait GroupStore {
    fn start_pass1(&mut self) -> Result<(), StorageError>;
    /// Pass 1 only: takes ownership of a freshly collected record.
    fn add_file(&mut self, file: FileInfo) -> Result<(), StorageError>;
    /// Orders the ingested records by physical start.
    fn end_pass1(&mut self) -> Result<(), StorageError>;

    fn start_pass2(&mut self) -> Result<(), StorageError>;
    /// Delivers maximal groups sharing a physical start.
    ///
    /// The receiver stamps the first-block hash on the group's records
    /// and returns whether to keep it; kept records whose error flag is
    /// clear flow into pass 3.
    fn partition_on_offset(
        &mut self,
        receiver: &mut dyn FnMut(&mut [FileInfo]) -> bool,
    ) -> Result<(), StorageError>;
    /// Orders the kept records by first-block hash.
    fn end_pass2(&mut self) -> Result<(), StorageError>;

    fn start_pass3(&mut self) -> Result<(), StorageError>;
    /// Delivers maximal groups sharing a first-block hash.
    fn partition_on_hash(
        &mut self,
        receiver: &mut dyn FnMut(&mut [FileInfo]),
    ) -> Result<(), StorageError>;
    /// Discards all remaining state.
    fn end_pass3(&mut self) -> Result<(), StorageError>;
}

/// Pass progression shared by both store implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    InPass1,
    SortedByOffset,
    InPass2,
    SortedByHash,
    InPass3,
}

impl Phase {
    /// Asserts the store is in `from` and moves it to `to`.
    pub(crate) fn advance(&mut self, from: Phase, to: Phase) {
        assert_eq!(
            *self, from,
            "store operation out of order: expected phase {from:?}, in {self:?}"
        );
        *self = to;
    }

    pub(crate) fn expect(&self, want: Phase) {
        assert_eq!(
            *self, want,
            "store operation out of order: expected phase {want:?}, in {self:?}"
        );
    }
}
