//! Offline block-level deduplication for copy-on-write filesystems.
//!
//! The pipeline makes three passes over the scanned files:
//!
//! 1. collect each file's fragment map and index it by the physical
//!    offset of its first fragment,
//! 2. partition by shared physical start and hash the first block of
//!    each partition once,
//! 3. partition by first-block hash and submit same-extent batches to
//!    the kernel, which verifies byte-equality before sharing anything.
//!
//! Scan state between the passes lives in a [`storage::GroupStore`]:
//! either in memory or spilled to externally sorted temporary files, so
//! the tool scales to filesystems whose metadata does not fit in RAM.

mod dedup;
mod defrag;

pub mod fileinfo;
pub mod partition;
pub mod pathstore;
pub mod pipeline;
pub mod stats;
pub mod storage;
pub mod walk;

pub use fileinfo::{BLOCK_SIZE, FileInfo};
pub use pipeline::{Config, Context, Summary, run};
