//! The three-pass deduplication pipeline.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

use dupex_sys::FragmentMapError;

use crate::dedup::{self, Kernel, SameExtentSink};
use crate::fileinfo::FileInfo;
use crate::pathstore::PathStore;
use crate::stats::StatsHandle;
use crate::storage::{GroupStore, StorageError};
use crate::walk::{self, WalkOptions};

/// Bytes hashed per file: the first block.
const FIRST_BLOCK: usize = 4096;

/// Behaviour knobs, filled from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// When false, report what would be deduplicated without touching
    /// the kernel.
    pub act: bool,
    /// Minimum file size in 4096-byte blocks.
    pub min_blocks: u64,
    /// Absolute path prefixes whose subtrees are not scanned.
    pub exclude: Vec<String>,
    /// Defragment badly fragmented group leaders before submission.
    pub defrag: bool,
    /// Blocks-per-fragment floor below which a leader counts as badly
    /// fragmented.
    pub blocks_per_fragment: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            act: true,
            min_blocks: 1,
            exclude: Vec::new(),
            defrag: false,
            blocks_per_fragment: 1024,
        }
    }
}

/// Everything the passes share; replaces ambient global state.
pub struct Context<'a> {
    pub paths: &'a PathStore,
    pub stats: StatsHandle,
    pub store: &'a mut dyn GroupStore,
    pub config: Config,
}

/// What a run accomplished.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub files_scanned: usize,
    pub groups_considered: usize,
    pub calls_issued: usize,
    pub bytes_deduped: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Walks `roots` and drives the three passes to completion.
pub fn run(ctx: &mut Context<'_>, roots: &[impl AsRef<Path>]) -> Result<Summary, PipelineError> {
    ctx.stats.start();
    let options = WalkOptions {
        min_blocks: ctx.config.min_blocks,
        exclude: ctx.config.exclude.clone(),
    };
    walk::collect_files(roots, &options, ctx.paths, &ctx.stats);
    ctx.stats.set_file_count(ctx.paths.file_count());
    log::info!("found {} files to scan", ctx.paths.file_count());

    pass1(ctx)?;
    pass2(ctx)?;
    pass3(ctx, &mut Kernel)
}

/// Pass 1: read each file's fragment map and ingest the records, keyed
/// by physical start.
fn pass1(ctx: &mut Context<'_>) -> Result<(), PipelineError> {
    ctx.stats.start_fileinfo_progress();
    ctx.store.start_pass1()?;
    let stats = ctx.stats.clone();
    let store = &mut *ctx.store;
    ctx.paths.process_files(|handle, path| {
        stats.file_info_read();
        match read_file_info(handle, &path) {
            Ok(file) => store.add_file(file)?,
            Err(err) => log::warn!("skipping {}: {err}", path.display()),
        }
        Ok::<_, StorageError>(())
    })?;
    ctx.store.end_pass1()?;
    ctx.stats.stop_progress();
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum FileInfoError {
    /// The fragments cover less than the file; there is a hole somewhere.
    #[error("sparse file")]
    Sparse,
    #[error(transparent)]
    FragmentMap(#[from] FragmentMapError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn read_file_info(handle: i32, path: &Path) -> Result<FileInfo, FileInfoError> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let fragments = dupex_sys::fragments(&file)?;
    build_file_info(handle, metadata.len(), fragments)
}

fn build_file_info(
    handle: i32,
    size: u64,
    fragments: Vec<dupex_sys::Fragment>,
) -> Result<FileInfo, FileInfoError> {
    let covered: u64 = fragments.iter().map(|fragment| fragment.length).sum();
    if covered < size {
        return Err(FileInfoError::Sparse);
    }
    Ok(FileInfo::new(handle, size as i64, fragments))
}

/// Pass 2: hash the first block of every offset group once and re-ingest
/// keyed by the hash. All group members share their physical start and
/// with it their first block, so one read covers the group.
fn pass2(ctx: &mut Context<'_>) -> Result<(), PipelineError> {
    ctx.stats.start_hash_progress();
    ctx.store.start_pass2()?;
    let stats = ctx.stats.clone();
    let paths = ctx.paths;
    ctx.store.partition_on_offset(&mut |group| {
        stats.hashes_calculated(group.len());
        let path = paths.file_path(group[0].path);
        match first_block_sum(&path) {
            Ok(sum) => {
                for file in group.iter_mut() {
                    file.first_block_sum = Some(sum);
                }
                true
            }
            Err(err) => {
                log::warn!("hashing the first block of {} failed: {err}", path.display());
                for file in group.iter_mut() {
                    file.error = true;
                }
                false
            }
        }
    })?;
    ctx.store.end_pass2()?;
    ctx.stats.stop_progress();
    Ok(())
}

fn first_block_sum(path: &Path) -> io::Result<[u8; 16]> {
    let mut file = File::open(path)?;
    let mut block = [0u8; FIRST_BLOCK];
    // Anything shorter than a block cannot be a candidate; the walk's
    // size floor guarantees this only fails on truncation races.
    file.read_exact(&mut block)?;
    let mut hasher = Md5::new();
    hasher.update(block);
    Ok(hasher.finalize().into())
}

/// Pass 3: hand every hash group to the dedup logic and aggregate the
/// outcomes. Failures inside a group are logged and do not stop the run.
fn pass3(ctx: &mut Context<'_>, sink: &mut dyn SameExtentSink) -> Result<Summary, PipelineError> {
    ctx.stats.start_dedup_progress();
    ctx.store.start_pass3()?;
    let mut summary = Summary {
        files_scanned: ctx.paths.file_count(),
        ..Default::default()
    };
    let stats = ctx.stats.clone();
    let paths = ctx.paths;
    let config = ctx.config.clone();
    ctx.store.partition_on_hash(&mut |group| {
        stats.deduplicating(group.len());
        if group.len() < 2 {
            return;
        }
        summary.groups_considered += 1;
        let outcome = dedup::dedup_group(paths, &config, group, sink);
        summary.calls_issued += outcome.calls;
        summary.bytes_deduped += outcome.bytes_deduped;
    })?;
    ctx.store.end_pass3()?;
    ctx.stats.stop_progress();
    Ok(summary)
}
