//! Filesystem walk: interns candidate files into the path store.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::fileinfo::BLOCK_SIZE;
use crate::pathstore::{NO_PARENT, PathStore};
use crate::stats::StatsHandle;

pub struct WalkOptions {
    /// Minimum file size in 4096-byte blocks.
    pub min_blocks: u64,
    /// Absolute path prefixes whose subtrees are skipped entirely.
    pub exclude: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            min_blocks: 1,
            exclude: Vec::new(),
        }
    }
}

/// Walks `roots` depth-first, interning directories and files that pass
/// the size filter. Unreadable entries are logged and skipped; symlinks
/// and special files are never followed.
pub fn collect_files(
    roots: &[impl AsRef<Path>],
    options: &WalkOptions,
    paths: &PathStore,
    stats: &StatsHandle,
) {
    for root in roots {
        walk_root(root.as_ref(), options, paths, stats);
    }
}

fn walk_root(root: &Path, options: &WalkOptions, paths: &PathStore, stats: &StatsHandle) {
    if excluded(root, options) {
        log::debug!("excluding {}", root.display());
        return;
    }
    let metadata = match fs::symlink_metadata(root) {
        Ok(metadata) => metadata,
        Err(err) => {
            log::warn!("skipping {}: {err}", root.display());
            return;
        }
    };
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        log::debug!("skipping symlink {}", root.display());
        return;
    }
    if file_type.is_dir() {
        let dir = paths.add_dir(NO_PARENT, &root.display().to_string());
        walk_dir(dir, root, options, paths, stats);
    } else if file_type.is_file() {
        // A plain file given on the command line; intern its parent as a
        // root directory so the record can reconstruct the full path.
        let parent = root.parent().unwrap_or_else(|| Path::new("."));
        let Some(name) = root.file_name() else {
            return;
        };
        let dir = paths.add_dir(NO_PARENT, &parent.display().to_string());
        consider_file(dir, &name.to_string_lossy(), metadata.len(), options, paths, stats);
    } else {
        log::debug!("skipping special file {}", root.display());
    }
}

fn walk_dir(dir: i32, path: &Path, options: &WalkOptions, paths: &PathStore, stats: &StatsHandle) {
    let reader = match fs::read_dir(path) {
        Ok(reader) => reader,
        Err(err) => {
            log::warn!("skipping directory {}: {err}", path.display());
            return;
        }
    };
    let mut entries: Vec<_> = reader
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("while reading {}: {err}", path.display());
                None
            }
        })
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let entry_path = path.join(entry.file_name());
        if excluded(&entry_path, options) {
            log::debug!("excluding {}", entry_path.display());
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                log::warn!("skipping {}: {err}", entry_path.display());
                continue;
            }
        };
        if file_type.is_symlink() || file_type.is_fifo() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if file_type.is_dir() {
            let child = paths.add_dir(dir, &name);
            walk_dir(child, &entry_path, options, paths, stats);
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(metadata) => {
                    consider_file(dir, &name, metadata.len(), options, paths, stats)
                }
                Err(err) => log::warn!("skipping {}: {err}", entry_path.display()),
            }
        }
    }
}

fn consider_file(
    dir: i32,
    name: &str,
    size: u64,
    options: &WalkOptions,
    paths: &PathStore,
    stats: &StatsHandle,
) {
    if size / BLOCK_SIZE < options.min_blocks {
        return;
    }
    paths.add_file(dir, name);
    stats.file_added();
}

fn excluded(path: &Path, options: &WalkOptions) -> bool {
    let path = path.to_string_lossy();
    options.exclude.iter().any(|prefix| path.starts_with(prefix.as_str()))
}
