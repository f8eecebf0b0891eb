//! In-memory grouping: one contiguous vector, sorted per pass.

use crate::fileinfo::FileInfo;
use crate::partition::runs;

use super::{GroupStore, Phase, StorageError};

/// Keeps every record in memory; the default store.
#[derive(Debug)]
pub struct MemoryStore {
    files: Vec<FileInfo>,
    phase: Phase,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            phase: Phase::Idle,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupStore for MemoryStore {
    fn start_pass1(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::Idle, Phase::InPass1);
        Ok(())
    }

    fn add_file(&mut self, file: FileInfo) -> Result<(), StorageError> {
        self.phase.expect(Phase::InPass1);
        self.files.push(file);
        Ok(())
    }

    fn end_pass1(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::InPass1, Phase::SortedByOffset);
        // Stable, so records sharing an offset keep their ingest order.
        self.files.sort_by_key(|file| file.physical_offset());
        Ok(())
    }

    fn start_pass2(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::SortedByOffset, Phase::InPass2);
        Ok(())
    }

    fn partition_on_offset(
        &mut self,
        receiver: &mut dyn FnMut(&mut [FileInfo]) -> bool,
    ) -> Result<(), StorageError> {
        self.phase.expect(Phase::InPass2);
        let mut files = std::mem::take(&mut self.files);
        let ranges: Vec<_> = runs(files.len(), |i, j| {
            files[i].physical_offset() == files[j].physical_offset()
        })
        .collect();

        let mut kept = Vec::with_capacity(files.len());
        for range in ranges {
            if receiver(&mut files[range.clone()]) {
                kept.extend(files[range].iter().filter(|f| !f.error).cloned());
            }
        }
        self.files = kept;
        Ok(())
    }

    fn end_pass2(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::InPass2, Phase::SortedByHash);
        self.files.sort_by(|a, b| a.first_block_sum.cmp(&b.first_block_sum));
        Ok(())
    }

    fn start_pass3(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::SortedByHash, Phase::InPass3);
        Ok(())
    }

    fn partition_on_hash(
        &mut self,
        receiver: &mut dyn FnMut(&mut [FileInfo]),
    ) -> Result<(), StorageError> {
        self.phase.expect(Phase::InPass3);
        let files = &mut self.files;
        let ranges: Vec<_> = runs(files.len(), |i, j| {
            files[i].first_block_sum == files[j].first_block_sum
        })
        .collect();
        for range in ranges {
            let group = &mut files[range];
            if group[0].first_block_sum.is_some() {
                receiver(group);
            }
        }
        Ok(())
    }

    fn end_pass3(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::InPass3, Phase::Idle);
        self.files.clear();
        Ok(())
    }
}
