//! Defragmentation of badly fragmented deduplication sources.
//!
//! A heavily fragmented leader would impose its layout on every
//! destination, so the group is better served by defragmenting it first.
//! The work is delegated to the filesystem's own tooling.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::Command;

use dupex_sys::{Fragment, FragmentMapError};

use crate::fileinfo::FileInfo;
use crate::pathstore::PathStore;

const DEFRAG_PROGRAM: &str = "btrfs";

/// Defragments the group leader, swapping a writable member into the
/// leader slot first if needed.
///
/// Returns `false` when the leader could not be defragmented; the caller
/// then retries with the remaining candidates. A group with no writable
/// member at all is left as it is and submission proceeds.
pub(crate) fn defragment_leader(paths: &PathStore, group: &mut [FileInfo]) -> bool {
    if !group[0].writable(paths) {
        match group.iter().position(|file| file.writable(paths)) {
            Some(index) => group.swap(0, index),
            None => {
                log::debug!(
                    "no writable member in the group of {}, skipping defragmentation",
                    paths.file_path(group[0].path).display()
                );
                return true;
            }
        }
    }

    let path = paths.file_path(group[0].path);
    log::info!("defragmenting {}", path.display());
    if let Err(err) = run_defragmenter(&path) {
        log::warn!("defragmentation of {} failed: {err}", path.display());
        return false;
    }
    // The on-disk layout changed; the stale fragment list must not be
    // used for offset comparisons or submission.
    match reread_fragments(&path) {
        Ok(fragments) => {
            group[0].fragments = fragments;
            true
        }
        Err(err) => {
            log::warn!(
                "re-reading fragments of {} after defragmentation failed: {err}",
                path.display()
            );
            false
        }
    }
}

fn run_defragmenter(path: &Path) -> io::Result<()> {
    let output = Command::new(DEFRAG_PROGRAM)
        .args(["filesystem", "defragment", "-f"])
        .arg(path)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::other(format!(
            "{} exited with {}: {}",
            DEFRAG_PROGRAM,
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

fn reread_fragments(path: &Path) -> Result<Vec<Fragment>, FragmentMapError> {
    let file = File::open(path)?;
    dupex_sys::fragments(&file)
}
