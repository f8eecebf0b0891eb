//! Spill-to-disk grouping: records become sorted lines in a temporary
//! file, partitions are streamed back per run of equal key prefixes.
//!
//! Each line is `<base64 key> <base64 payload>`. Keys are fixed-width
//! byte encodings (the big-endian physical offset, or the raw 16-byte
//! digest), so equal keys form contiguous runs once the operating
//! system's `sort` has ordered the file byte-lexicographically. The
//! payload is a little-endian field layout, not the in-memory struct.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::Command;

use tempfile::NamedTempFile;

use dupex_sys::Fragment;

use crate::fileinfo::FileInfo;

use super::{GroupStore, Phase, StorageError};

/// Name prefix of the spill files in the system temp directory.
pub const SPILL_PREFIX: &str = "dupex";

/// Spills scan state to externally sorted temporary files; selected for
/// scans whose metadata does not fit in memory.
pub struct SpillStore {
    /// Write side of the pass that is currently ingesting.
    writer: Option<BufWriter<NamedTempFile>>,
    /// Sorted output of the previous ingest, read side of partitioning.
    current: Option<NamedTempFile>,
    phase: Phase,
}

impl SpillStore {
    pub fn new() -> Self {
        Self {
            writer: None,
            current: None,
            phase: Phase::Idle,
        }
    }

    fn open_spill(&mut self) -> Result<(), StorageError> {
        let file = tempfile::Builder::new().prefix(SPILL_PREFIX).tempfile()?;
        log::debug!("writing spill file {}", file.path().display());
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Flushes the ingest file and sorts it in place; it becomes the
    /// read side for the next partitioning.
    fn seal_and_sort(&mut self) -> Result<(), StorageError> {
        let writer = self.writer.take().expect("no spill file open");
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        sort_in_place(file.path())?;
        self.current = Some(file);
        Ok(())
    }

    fn write_record(&mut self, key: &str, file: &FileInfo) -> Result<(), StorageError> {
        let writer = self.writer.as_mut().expect("no spill file open");
        writeln!(writer, "{} {}", key, base64::encode(serialize(file)))?;
        Ok(())
    }
}

impl Default for SpillStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupStore for SpillStore {
    fn start_pass1(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::Idle, Phase::InPass1);
        self.open_spill()
    }

    fn add_file(&mut self, file: FileInfo) -> Result<(), StorageError> {
        self.phase.expect(Phase::InPass1);
        self.write_record(&offset_key(file.physical_offset()), &file)
    }

    fn end_pass1(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::InPass1, Phase::SortedByOffset);
        self.seal_and_sort()
    }

    fn start_pass2(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::SortedByOffset, Phase::InPass2);
        self.open_spill()
    }

    fn partition_on_offset(
        &mut self,
        receiver: &mut dyn FnMut(&mut [FileInfo]) -> bool,
    ) -> Result<(), StorageError> {
        self.phase.expect(Phase::InPass2);
        let source = self.current.take().expect("no sorted spill file");
        partition_lines(source.path(), |_key, mut group| {
            if receiver(&mut group) {
                for file in group.iter().filter(|f| !f.error) {
                    let Some(sum) = file.first_block_sum else {
                        debug_assert!(false, "kept record without a hash");
                        continue;
                    };
                    self.write_record(&hash_key(&sum), file)?;
                }
            }
            Ok(())
        })
    }

    fn end_pass2(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::InPass2, Phase::SortedByHash);
        self.seal_and_sort()
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
        let source = self.current.take().expect("no sorted spill file");
        partition_lines(source.path(), |key, mut group| {
            // The hash travelled in the key; put it back on the records.
            let sum = decode_hash_key(key)?;
            for file in group.iter_mut() {
                file.first_block_sum = Some(sum);
            }
            receiver(&mut group);
            Ok(())
        })
    }

    fn end_pass3(&mut self) -> Result<(), StorageError> {
        self.phase.advance(Phase::InPass3, Phase::Idle);
        self.current = None;
        Ok(())
    }
}

/// Runs the operating-system sort utility on the spill file, in place.
/// `LC_ALL=C` keeps the ordering byte-lexicographic.
fn sort_in_place(path: &Path) -> Result<(), StorageError> {
    log::debug!("sorting {}", path.display());
    let status = Command::new("sort")
        .arg(path)
        .arg("-o")
        .arg(path)
        .env("LC_ALL", "C")
        .status()?;
    if !status.success() {
        return Err(StorageError::Sort {
            path: path.to_owned(),
            status,
        });
    }
    Ok(())
}

fn offset_key(offset: u64) -> String {
    base64::encode(offset.to_be_bytes())
}

fn hash_key(sum: &[u8; 16]) -> String {
    base64::encode(sum)
}

fn decode_hash_key(key: &str) -> Result<[u8; 16], StorageError> {
    let bytes = base64::decode(key)?;
    bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("hash key {key:?} has the wrong length")))
}

/// Streams the sorted file and hands every run of lines sharing a key
/// prefix to `visit` as one decoded group.
fn partition_lines(
    path: &Path,
    mut visit: impl FnMut(&str, Vec<FileInfo>) -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    let reader = BufReader::new(File::open(path)?);
    let mut last_key: Option<String> = None;
    let mut group: Vec<FileInfo> = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let (key, payload) = line
            .split_once(' ')
            .ok_or_else(|| StorageError::Corrupt(line.clone()))?;
        let record = deserialize(payload)?;
        if last_key.as_deref() != Some(key) {
            if let Some(last) = last_key.take() {
                visit(&last, std::mem::take(&mut group))?;
            }
            last_key = Some(key.to_owned());
        }
        group.push(record);
    }
    if let Some(last) = last_key {
        visit(&last, group)?;
    }
    Ok(())
}

/// Little-endian payload:
/// `path:i32 error:u8 size:i64 frag_count:i32 [start:u64 length:u64]*`.
/// The hash is carried by the line key, not the payload.
fn serialize(file: &FileInfo) -> Vec<u8> {
    let mut payload = Vec::with_capacity(17 + file.fragments.len() * 16);
    payload.extend_from_slice(&file.path.to_le_bytes());
    payload.push(file.error as u8);
    payload.extend_from_slice(&file.size.to_le_bytes());
    payload.extend_from_slice(&(file.fragments.len() as i32).to_le_bytes());
    for fragment in &file.fragments {
        payload.extend_from_slice(&fragment.start.to_le_bytes());
        payload.extend_from_slice(&fragment.length.to_le_bytes());
    }
    payload
}

fn deserialize(payload: &str) -> Result<FileInfo, StorageError> {
    let data = base64::decode(payload)?;
    let mut fields = Fields { data: &data };
    let path = i32::from_le_bytes(fields.take()?);
    let error = fields.take::<1>()?[0] != 0;
    let size = i64::from_le_bytes(fields.take()?);
    let frag_count = i32::from_le_bytes(fields.take()?);
    if frag_count <= 0 {
        return Err(StorageError::Corrupt(format!(
            "record with fragment count {frag_count}"
        )));
    }
    let mut fragments = Vec::with_capacity(frag_count as usize);
    for _ in 0..frag_count {
        let start = u64::from_le_bytes(fields.take()?);
        let length = u64::from_le_bytes(fields.take()?);
        fragments.push(Fragment { start, length });
    }
    let mut file = FileInfo::new(path, size, fragments);
    file.error = error;
    Ok(file)
}

struct Fields<'a> {
    data: &'a [u8],
}

impl Fields<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], StorageError> {
        if self.data.len() < N {
            return Err(StorageError::Corrupt("truncated record".into()));
        }
        let (head, tail) = self.data.split_at(N);
        self.data = tail;
        Ok(head.try_into().unwrap())
    }
}
