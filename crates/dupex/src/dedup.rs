//! Pass-3 group handling: leader choice, shared-prefix detection and
//! chunked same-extent submission.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use dupex_sys::{ExtentRange, MAX_DEST_COUNT, SameExtentError, SameStatus};

use crate::defrag;
use crate::fileinfo::{BLOCK_SIZE, FileInfo};
use crate::pathstore::PathStore;
use crate::pipeline::Config;

/// Upper bound on the bytes covered by one same-extent call, shared by
/// all batch members; keeps individual kernel calls short.
const MAX_CALL_BYTES: u64 = 64 * 1024 * 1024;

/// Narrow seam over the kernel same-extent call so the submission loop
/// can be exercised without a copy-on-write filesystem underneath.
pub(crate) trait SameExtentSink {
    fn extent_same(
        &mut self,
        batch: &[ExtentRange<'_>],
        length: u64,
    ) -> Result<Vec<SameStatus>, SameExtentError>;
}

/// The production sink; forwards to the kernel.
pub(crate) struct Kernel;

impl SameExtentSink for Kernel {
    fn extent_same(
        &mut self,
        batch: &[ExtentRange<'_>],
        length: u64,
    ) -> Result<Vec<SameStatus>, SameExtentError> {
        dupex_sys::extent_same(batch, length)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupOutcome {
    pub calls: usize,
    pub bytes_deduped: u64,
}

#[derive(Debug, thiserror::Error)]
enum SubmitError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Same(#[from] SameExtentError),
}

/// Handles one hash group end to end. Failures are local: they are
/// logged and the rest of the groups continue.
pub(crate) fn dedup_group(
    paths: &PathStore,
    config: &Config,
    group: &mut [FileInfo],
    sink: &mut dyn SameExtentSink,
) -> GroupOutcome {
    if group.len() < 2 {
        return GroupOutcome::default();
    }
    debug_assert!(group.iter().all(|file| !file.error));

    reorder_least_fragmented(group);
    let length = common_length(group);
    let Some(start) = start_unshared(group, length) else {
        log::debug!(
            "{} and {} other files already share their extents",
            paths.file_path(group[0].path).display(),
            group.len() - 1
        );
        return GroupOutcome::default();
    };

    if config.defrag
        && too_fragmented(&group[0], config.blocks_per_fragment)
        && !defrag::defragment_leader(paths, group)
    {
        // The leader is a lost cause; the rest may still share.
        return dedup_group(paths, config, &mut group[1..], sink);
    }

    match submit(paths, config, group, start, length, per_call_cap(group.len()), sink) {
        Ok(outcome) => outcome,
        Err(err) => {
            log::error!(
                "deduplication of {} and {} other files failed: {err}",
                paths.file_path(group[0].path).display(),
                group.len() - 1
            );
            GroupOutcome::default()
        }
    }
}

/// Moves a record with strictly fewer fragments than the current leader
/// into the leader slot. One walk, not a sort; the leader becomes the
/// same-extent source and keeps its extents.
fn reorder_least_fragmented(group: &mut [FileInfo]) {
    for i in 1..group.len() {
        if group[i].fragments.len() < group[0].fragments.len() {
            group.swap(0, i);
        }
    }
}

/// The region every member can cover.
fn common_length(group: &[FileInfo]) -> u64 {
    group.iter().map(|file| file.size).min().unwrap_or(0) as u64
}

/// First block-aligned offset below `length` at which the members stop
/// sharing physical storage, or `None` when the whole region is shared
/// and there is nothing left to submit.
fn start_unshared(group: &[FileInfo], length: u64) -> Option<u64> {
    let leader = &group[0];
    let mut offset = 0;
    while offset < length {
        let reference = leader.physical_offset_at(offset);
        let shared = reference.is_some()
            && group[1..]
                .iter()
                .all(|file| file.physical_offset_at(offset) == reference);
        if !shared {
            return Some(offset);
        }
        offset += BLOCK_SIZE;
    }
    None
}

/// Whether the leader's extents are shorter on average than the
/// configured blocks-per-fragment floor.
fn too_fragmented(file: &FileInfo, blocks_per_fragment: u64) -> bool {
    let max_fragments = (file.size as u64).div_ceil(BLOCK_SIZE * blocks_per_fragment);
    file.fragments.len() as u64 > max_fragments
}

/// Per-call byte cap for a batch of `batch_len` files, rounded down to a
/// whole number of blocks.
fn per_call_cap(batch_len: usize) -> u64 {
    (MAX_CALL_BYTES / batch_len as u64) & !(BLOCK_SIZE - 1)
}

fn submit(
    paths: &PathStore,
    config: &Config,
    group: &[FileInfo],
    start: u64,
    length: u64,
    cap: u64,
    sink: &mut dyn SameExtentSink,
) -> Result<GroupOutcome, SubmitError> {
    if group.len() - 1 > MAX_DEST_COUNT {
        return Err(SameExtentError::TooManyDestinations(group.len() - 1).into());
    }
    let group_paths: Vec<PathBuf> = group.iter().map(|file| paths.file_path(file.path)).collect();
    if !config.act {
        log::info!(
            "would deduplicate {} bytes across {} files led by {}",
            length - start,
            group.len(),
            group_paths[0].display()
        );
        return Ok(GroupOutcome::default());
    }

    let files = group_paths
        .iter()
        .map(File::open)
        .collect::<io::Result<Vec<File>>>()?;

    let mut outcome = GroupOutcome::default();
    let mut offset = start;
    let mut progressing = true;
    while progressing && offset < length {
        let call_length = (length - offset).min(cap);
        let batch: Vec<ExtentRange<'_>> = files
            .iter()
            .map(|file| ExtentRange {
                file,
                logical_offset: offset,
            })
            .collect();
        let statuses = sink.extent_same(&batch, call_length)?;
        outcome.calls += 1;

        let mut differs = false;
        let mut deduped = 0u64;
        for (status, path) in statuses.iter().zip(&group_paths[1..]) {
            match status {
                SameStatus::Deduped(bytes) => deduped = deduped.max(*bytes),
                SameStatus::DataDiffers => differs = true,
                SameStatus::Failed(errno) => log::warn!(
                    "deduplication of {} failed: {}",
                    path.display(),
                    io::Error::from_raw_os_error(*errno)
                ),
            }
        }
        log::debug!(
            "range [{offset}, {}): same={}, deduped={deduped}",
            offset + call_length,
            !differs
        );
        outcome.bytes_deduped += deduped;
        progressing = !differs && deduped > 0;
        offset += call_length;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathstore::NO_PARENT;
    use dupex_sys::Fragment;

    fn fragment(start: u64, length: u64) -> Fragment {
        Fragment { start, length }
    }

    fn file_with(path: i32, fragments: Vec<Fragment>) -> FileInfo {
        let size: u64 = fragments.iter().map(|f| f.length).sum();
        FileInfo::new(path, size as i64, fragments)
    }

    /// Scripted sink: pops one canned response per call, records the
    /// submitted (offset, length) pairs.
    #[derive(Default)]
    struct ScriptedSink {
        responses: Vec<Vec<SameStatus>>,
        calls: Vec<(u64, u64)>,
    }

    impl SameExtentSink for ScriptedSink {
        fn extent_same(
            &mut self,
            batch: &[ExtentRange<'_>],
            length: u64,
        ) -> Result<Vec<SameStatus>, SameExtentError> {
            self.calls.push((batch[0].logical_offset, length));
            if self.responses.is_empty() {
                return Ok(vec![SameStatus::Deduped(length); batch.len() - 1]);
            }
            Ok(self.responses.remove(0))
        }
    }

    /// Backs each record with a real (content-free) file so submission
    /// can open descriptors.
    fn fixture(records: usize) -> (tempfile::TempDir, PathStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathStore::new();
        let parent = paths.add_dir(NO_PARENT, &dir.path().display().to_string());
        for i in 0..records {
            let name = format!("f{i}");
            std::fs::write(dir.path().join(&name), b"x").unwrap();
            paths.add_file(parent, &name);
        }
        (dir, paths)
    }

    #[test]
    fn reorder_swaps_in_a_less_fragmented_leader() {
        let mut group = vec![
            file_with(0, vec![fragment(0, 4096), fragment(8192, 4096)]),
            file_with(1, vec![fragment(40960, 8192)]),
            file_with(2, vec![fragment(81920, 4096), fragment(90112, 4096)]),
        ];
        reorder_least_fragmented(&mut group);
        assert_eq!(group[0].path, 1);
        assert!(
            group
                .iter()
                .all(|f| f.fragments.len() >= group[0].fragments.len())
        );
    }

    #[test]
    fn reorder_keeps_an_already_minimal_leader() {
        let mut group = vec![
            file_with(0, vec![fragment(0, 8192)]),
            file_with(1, vec![fragment(40960, 8192)]),
        ];
        reorder_least_fragmented(&mut group);
        assert_eq!(group[0].path, 0);
    }

    #[test]
    fn unshared_scan_finds_the_first_diverging_block() {
        // Both files share their first block but not the second.
        let group = vec![
            file_with(0, vec![fragment(0, 4096), fragment(8192, 4096)]),
            file_with(1, vec![fragment(0, 4096), fragment(16384, 4096)]),
        ];
        assert_eq!(start_unshared(&group, 8192), Some(4096));
    }

    #[test]
    fn unshared_scan_reports_nothing_for_fully_shared_groups() {
        let group = vec![
            file_with(0, vec![fragment(0, 8192)]),
            file_with(1, vec![fragment(0, 8192)]),
        ];
        assert_eq!(start_unshared(&group, 8192), None);
    }

    #[test]
    fn fully_shared_groups_issue_no_calls() {
        let (_dir, paths) = fixture(2);
        let mut group = vec![
            file_with(0, vec![fragment(0, 8192)]),
            file_with(1, vec![fragment(0, 8192)]),
        ];
        let mut sink = ScriptedSink::default();
        let outcome = dedup_group(&paths, &Config::default(), &mut group, &mut sink);
        assert!(sink.calls.is_empty());
        assert_eq!(outcome, GroupOutcome::default());
    }

    #[test]
    fn three_identical_files_make_one_call() {
        let (_dir, paths) = fixture(3);
        let mut group = vec![
            file_with(0, vec![fragment(0, 8192)]),
            file_with(1, vec![fragment(16384, 8192)]),
            file_with(2, vec![fragment(32768, 8192)]),
        ];
        let mut sink = ScriptedSink::default();
        let outcome = dedup_group(&paths, &Config::default(), &mut group, &mut sink);
        assert_eq!(sink.calls, vec![(0, 8192)]);
        assert_eq!(outcome, GroupOutcome { calls: 1, bytes_deduped: 8192 });
    }

    #[test]
    fn submission_halts_when_data_differs() {
        let (_dir, paths) = fixture(2);
        let group = vec![
            file_with(0, vec![fragment(0, 16384)]),
            file_with(1, vec![fragment(32768, 16384)]),
        ];
        let mut sink = ScriptedSink {
            responses: vec![vec![SameStatus::DataDiffers]],
            calls: Vec::new(),
        };
        // The cap splits the region into four calls; the differing first
        // call must stop the loop before the second.
        let outcome =
            submit(&paths, &Config::default(), &group, 0, 16384, 4096, &mut sink).unwrap();
        assert_eq!(sink.calls, vec![(0, 4096)]);
        assert_eq!(outcome, GroupOutcome { calls: 1, bytes_deduped: 0 });
    }

    #[test]
    fn submission_halts_when_nothing_was_deduped() {
        let (_dir, paths) = fixture(2);
        let group = vec![
            file_with(0, vec![fragment(0, 16384)]),
            file_with(1, vec![fragment(32768, 16384)]),
        ];
        let mut sink = ScriptedSink {
            responses: vec![vec![SameStatus::Deduped(0)]],
            calls: Vec::new(),
        };
        let outcome =
            submit(&paths, &Config::default(), &group, 0, 16384, 4096, &mut sink).unwrap();
        assert_eq!(sink.calls.len(), 1);
        assert_eq!(outcome, GroupOutcome { calls: 1, bytes_deduped: 0 });
    }

    #[test]
    fn a_failed_destination_does_not_halt_the_others() {
        let (_dir, paths) = fixture(3);
        let group = vec![
            file_with(0, vec![fragment(0, 8192)]),
            file_with(1, vec![fragment(16384, 8192)]),
            file_with(2, vec![fragment(32768, 8192)]),
        ];
        let mut sink = ScriptedSink {
            responses: vec![vec![
                SameStatus::Failed(nix::libc::EACCES),
                SameStatus::Deduped(8192),
            ]],
            calls: Vec::new(),
        };
        let cap = per_call_cap(group.len());
        let outcome =
            submit(&paths, &Config::default(), &group, 0, 8192, cap, &mut sink).unwrap();
        assert_eq!(outcome, GroupOutcome { calls: 1, bytes_deduped: 8192 });
    }

    #[test]
    fn oversized_groups_are_rejected_before_submission() {
        let (_dir, paths) = fixture(2);
        let group: Vec<FileInfo> = (0..1200)
            .map(|i| file_with(i % 2, vec![fragment(i as u64 * 8192, 8192)]))
            .collect();
        let mut sink = ScriptedSink::default();
        let result = submit(&paths, &Config::default(), &group, 0, 8192, 8192, &mut sink);
        assert!(matches!(
            result,
            Err(SubmitError::Same(SameExtentError::TooManyDestinations(1199)))
        ));
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn no_act_mode_never_opens_or_submits() {
        let paths = PathStore::new();
        let parent = paths.add_dir(NO_PARENT, "/nonexistent");
        for name in ["a", "b"] {
            paths.add_file(parent, name);
        }
        let group = vec![
            file_with(0, vec![fragment(0, 8192)]),
            file_with(1, vec![fragment(16384, 8192)]),
        ];
        let config = Config {
            act: false,
            ..Default::default()
        };
        let mut sink = ScriptedSink::default();
        // Paths do not exist; succeeding proves nothing was opened.
        let outcome = submit(&paths, &config, &group, 0, 8192, 8192, &mut sink).unwrap();
        assert!(sink.calls.is_empty());
        assert_eq!(outcome, GroupOutcome::default());
    }

    #[test]
    fn per_call_cap_is_block_aligned() {
        assert_eq!(per_call_cap(2), 32 * 1024 * 1024);
        assert_eq!(per_call_cap(1025) % BLOCK_SIZE, 0);
        assert_eq!(per_call_cap(1025), 61440);
    }

    #[test]
    fn long_regions_are_submitted_in_chunks() {
        let (_dir, paths) = fixture(2);
        let group = vec![
            file_with(0, vec![fragment(0, 20480)]),
            file_with(1, vec![fragment(40960, 20480)]),
        ];
        let mut sink = ScriptedSink::default();
        let outcome =
            submit(&paths, &Config::default(), &group, 0, 20480, 8192, &mut sink).unwrap();
        assert_eq!(sink.calls, vec![(0, 8192), (8192, 8192), (16384, 4096)]);
        assert_eq!(outcome, GroupOutcome { calls: 3, bytes_deduped: 20480 });
    }

    #[test]
    fn submission_resumes_at_the_unshared_offset() {
        let (_dir, paths) = fixture(2);
        let group = vec![
            file_with(0, vec![fragment(0, 16384)]),
            file_with(1, vec![fragment(32768, 16384)]),
        ];
        let mut sink = ScriptedSink::default();
        let outcome =
            submit(&paths, &Config::default(), &group, 8192, 16384, 65536, &mut sink).unwrap();
        assert_eq!(sink.calls, vec![(8192, 8192)]);
        assert_eq!(outcome.bytes_deduped, 8192);
    }

    #[test]
    fn fragmentation_threshold() {
        // 8 MiB file, bpf 1024 allows two 4 MiB fragments.
        let coarse = file_with(0, vec![fragment(0, 4 << 20), fragment(8 << 20, 4 << 20)]);
        assert!(!too_fragmented(&coarse, 1024));
        let fine = file_with(
            1,
            (0..4).map(|i| fragment(i * (4 << 20), 2 << 20)).collect(),
        );
        assert!(too_fragmented(&fine, 1024));
    }
}
