//! Chunk files
//!
//! A chunk is one bounded, file-backed segment of the global log covering
//! `[number * chunk_size, (number + 1) * chunk_size)`. It is append-only
//! while active and immutable once completed.
//!
//! Positions passed to the read methods are chunk-local logical
//! positions. For ordinary chunks logical and physical offsets coincide;
//! scavenged chunks store their records densely and translate through a
//! position map, so every record keeps the log position it was written at.

mod format;
mod io;

pub use format::{ChunkFooter, ChunkHeader, PosMapEntry, FOOTER_SIZE, HASH_SIZE, HEADER_SIZE};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use chunklog_core::codec::{self, LENGTH_SIZE};
use chunklog_core::{LogPosition, LogRecord};

use crate::checkpoint::sync_parent_dir;
use crate::error::StorageError;
use crate::results::{ReadFailure, RecordReadResult, RecordWriteResult};
use format::POS_MAP_ENTRY_SIZE;
use io::{read_exact_at, write_all_at};

/// Block size used when streaming chunk data through the hasher
const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// A record read from a chunk with its chunk-local bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRead {
    pub record: LogRecord,
    /// Local logical position of the record
    pub pre: i64,
    /// Local logical position just past the record
    pub post: i64,
}

/// Result of probing a chunk: a record or the reason there is none
pub type ChunkProbe = Result<ChunkRead, ReadFailure>;

struct SealedState {
    footer: ChunkFooter,
    pos_map: Vec<PosMapEntry>,
}

struct AppendState {
    hasher: blake3::Hasher,
    physical_position: i64,
    pos_map: Vec<PosMapEntry>,
}

/// A single chunk file
pub struct Chunk {
    path: PathBuf,
    header: ChunkHeader,
    file: File,
    /// Set once, when the chunk is completed or opened completed
    sealed: OnceLock<SealedState>,
    /// Present only while the chunk accepts appends
    append: Mutex<Option<AppendState>>,
    /// Physical end of written data while active
    write_position: AtomicI64,
    delete_on_drop: AtomicBool,
}

impl Chunk {
    /// Create a new active chunk file
    ///
    /// Ordinary chunks are pre-allocated to their full size. Scavenged
    /// chunks grow as records are copied in and are truncated when
    /// completed.
    pub fn create_new(
        path: impl Into<PathBuf>,
        chunk_size: i32,
        chunk_number: i32,
        chunk_version: i32,
        is_scavenged: bool,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let header = ChunkHeader::new(chunk_size, chunk_number, chunk_version, is_scavenged);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        if !is_scavenged {
            file.set_len((HEADER_SIZE + chunk_size as usize + FOOTER_SIZE) as u64)?;
        }
        let header_bytes = header.encode();
        write_all_at(&file, &header_bytes, 0)?;
        file.sync_all()?;
        sync_parent_dir(&path)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&header_bytes);

        debug!(
            chunk = chunk_number,
            version = chunk_version,
            scavenged = is_scavenged,
            path = %path.display(),
            "Created chunk"
        );

        Ok(Self {
            path,
            header,
            file,
            sealed: OnceLock::new(),
            append: Mutex::new(Some(AppendState {
                hasher,
                physical_position: 0,
                pos_map: Vec::new(),
            })),
            write_position: AtomicI64::new(0),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Open a completed chunk read-only
    pub fn open_completed(path: impl Into<PathBuf>, verify_hash: bool) -> Result<Self, StorageError> {
        let path = path.into();
        let file = File::open(&path)?;
        let header = read_header(&file, &path)?;
        let number = header.chunk_number;

        let file_len = file.metadata()?.len();
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(StorageError::chunk_corrupt(
                number,
                format!("file of {} bytes cannot hold header and footer", file_len),
            ));
        }

        let footer = read_footer(&file, number, file_len)?;
        if !footer.is_completed {
            return Err(StorageError::chunk_corrupt(number, "chunk is not completed"));
        }

        let expected_len = if footer.has_map {
            HEADER_SIZE as u64 + footer.physical_data_size as u64 + footer.map_size as u64 + FOOTER_SIZE as u64
        } else {
            HEADER_SIZE as u64 + header.chunk_size as u64 + FOOTER_SIZE as u64
        };
        if file_len != expected_len {
            return Err(StorageError::chunk_corrupt(
                number,
                format!("file is {} bytes, footer implies {}", file_len, expected_len),
            ));
        }
        if footer.logical_data_size > header.chunk_size as i64
            || footer.physical_data_size as i64 > header.chunk_size as i64
        {
            return Err(StorageError::chunk_corrupt(number, "data size exceeds chunk size"));
        }

        let pos_map = if footer.has_map {
            let mut map_bytes = vec![0u8; footer.map_size as usize];
            read_exact_at(
                &file,
                &mut map_bytes,
                (HEADER_SIZE + footer.physical_data_size as usize) as u64,
            )?;
            PosMapEntry::decode_all(&map_bytes)
        } else {
            Vec::new()
        };

        let chunk = Self {
            path,
            header,
            file,
            sealed: OnceLock::new(),
            append: Mutex::new(None),
            write_position: AtomicI64::new(footer.physical_data_size as i64),
            delete_on_drop: AtomicBool::new(false),
        };
        let _ = chunk.sealed.set(SealedState { footer, pos_map });

        if verify_hash {
            chunk.verify_hash()?;
        }

        debug!(
            chunk = number,
            version = header.chunk_version,
            logical_size = footer.logical_data_size,
            "Opened completed chunk"
        );
        Ok(chunk)
    }

    /// Reopen an active chunk, resuming appends at `write_position`
    pub fn open_ongoing(path: impl Into<PathBuf>, write_position: i64) -> Result<Self, StorageError> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = read_header(&file, &path)?;
        let number = header.chunk_number;

        if header.is_scavenged {
            return Err(StorageError::chunk_corrupt(
                number,
                "scavenged chunk cannot be reopened for appends",
            ));
        }
        if write_position < 0 || write_position > header.chunk_size as i64 {
            return Err(StorageError::corrupt_database(format!(
                "write position {} outside chunk {} of size {}",
                write_position, number, header.chunk_size
            )));
        }

        let file_len = file.metadata()?.len();
        let full_len = (HEADER_SIZE + header.chunk_size as usize + FOOTER_SIZE) as u64;
        if file_len != full_len {
            return Err(StorageError::chunk_corrupt(
                number,
                format!("active chunk is {} bytes, expected {}", file_len, full_len),
            ));
        }
        if read_footer(&file, number, file_len)?.is_completed {
            return Err(StorageError::invalid_state(format!(
                "chunk {} is already completed",
                number
            )));
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(&header.encode());
        hash_range(&file, &mut hasher, HEADER_SIZE as u64, write_position as u64)?;

        debug!(chunk = number, write_position, "Opened ongoing chunk");

        Ok(Self {
            path,
            header,
            file,
            sealed: OnceLock::new(),
            append: Mutex::new(Some(AppendState {
                hasher,
                physical_position: write_position,
                pos_map: Vec::new(),
            })),
            write_position: AtomicI64::new(write_position),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Whether the chunk file at `path` carries a completed footer
    pub fn is_completed_file(path: &Path) -> Result<bool, StorageError> {
        let file = File::open(path)?;
        let header = read_header(&file, path)?;
        let file_len = file.metadata()?.len();
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Ok(false);
        }
        Ok(read_footer(&file, header.chunk_number, file_len)?.is_completed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        self.sealed.get().map(|s| s.footer)
    }

    pub fn number(&self) -> i32 {
        self.header.chunk_number
    }

    pub fn version(&self) -> i32 {
        self.header.chunk_version
    }

    pub fn chunk_size(&self) -> i32 {
        self.header.chunk_size
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn is_completed(&self) -> bool {
        self.sealed.get().is_some()
    }

    pub fn chunk_start_position(&self) -> LogPosition {
        self.header.chunk_start_position()
    }

    pub fn chunk_end_position(&self) -> LogPosition {
        self.header.chunk_end_position()
    }

    /// Local logical end of the records, `[0, logical_data_size)`
    pub fn logical_data_size(&self) -> i64 {
        match self.sealed.get() {
            Some(sealed) => sealed.footer.logical_data_size,
            None => self.write_position.load(Ordering::Acquire),
        }
    }

    /// Bytes of record data stored in the file
    pub fn physical_data_size(&self) -> i64 {
        match self.sealed.get() {
            Some(sealed) => sealed.footer.physical_data_size as i64,
            None => self.write_position.load(Ordering::Acquire),
        }
    }

    /// Number of records in a scavenged chunk's position map
    pub fn pos_map_len(&self) -> usize {
        self.sealed.get().map_or(0, |s| s.pos_map.len())
    }

    /// Append a record if it fits, never writing part of it
    ///
    /// Returns a failed result without mutating the chunk when the record
    /// does not fit in the remaining space; the caller completes this
    /// chunk and retries on the next one. Scavenged chunks record the
    /// record's own log position in the position map.
    pub fn try_append(&self, record: &LogRecord) -> Result<RecordWriteResult, StorageError> {
        let mut guard = self.append.lock();
        let state = guard.as_mut().ok_or_else(|| {
            StorageError::invalid_state(format!("chunk {} is completed", self.number()))
        })?;

        let mut frame = BytesMut::with_capacity(record.size_on_disk() as usize);
        codec::encode_into(record, &mut frame)?;

        let old_position = state.physical_position;
        let new_position = old_position + frame.len() as i64;
        if new_position > self.header.chunk_size as i64 {
            return Ok(RecordWriteResult::failed(old_position));
        }

        if self.header.is_scavenged {
            let local = record.log_position() - self.chunk_start_position();
            if local < 0 || local >= self.header.chunk_size as i64 {
                return Err(StorageError::invalid_state(format!(
                    "record at {} does not belong to chunk {}",
                    record.log_position(),
                    self.number()
                )));
            }
            if state.pos_map.last().is_some_and(|last| last.log_pos as i64 >= local) {
                return Err(StorageError::invalid_state(format!(
                    "record at {} appended out of order to scavenged chunk {}",
                    record.log_position(),
                    self.number()
                )));
            }
            state.pos_map.push(PosMapEntry {
                log_pos: local as i32,
                actual_pos: old_position as i32,
            });
        } else if record.log_position() != self.chunk_start_position() + old_position {
            return Err(StorageError::invalid_state(format!(
                "record at {} appended at {} of chunk {}",
                record.log_position(),
                self.chunk_start_position() + old_position,
                self.number()
            )));
        }

        write_all_at(&self.file, &frame, HEADER_SIZE as u64 + old_position as u64)?;
        state.hasher.update(&frame);
        state.physical_position = new_position;
        self.write_position.store(new_position, Ordering::Release);

        Ok(RecordWriteResult::successful(old_position, new_position))
    }

    /// Force written bytes to stable storage
    pub fn flush(&self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Seal the chunk; no appends are accepted afterwards
    pub fn complete(&self) -> Result<(), StorageError> {
        if self.header.is_scavenged {
            return Err(StorageError::invalid_state(format!(
                "scavenged chunk {} must be completed with its logical size",
                self.number()
            )));
        }
        self.seal(None)
    }

    /// Seal a scavenged chunk, covering the logical range of the chunk it replaces
    pub fn complete_scavenged(&self, logical_data_size: i64) -> Result<(), StorageError> {
        if !self.header.is_scavenged {
            return Err(StorageError::invalid_state(format!(
                "chunk {} is not a scavenged chunk",
                self.number()
            )));
        }
        self.seal(Some(logical_data_size))
    }

    fn seal(&self, scavenged_logical_size: Option<i64>) -> Result<(), StorageError> {
        let mut guard = self.append.lock();
        let state = guard.take().ok_or_else(|| {
            StorageError::invalid_state(format!("chunk {} is already completed", self.number()))
        })?;

        let physical = state.physical_position;
        let mut map_bytes = Vec::with_capacity(state.pos_map.len() * POS_MAP_ENTRY_SIZE);
        for entry in &state.pos_map {
            entry.put(&mut map_bytes);
        }

        let mut hasher = state.hasher;
        hasher.update(&map_bytes);

        let footer = ChunkFooter {
            is_completed: true,
            has_map: scavenged_logical_size.is_some(),
            physical_data_size: physical as i32,
            logical_data_size: scavenged_logical_size.unwrap_or(physical),
            map_size: map_bytes.len() as i32,
            hash: *hasher.finalize().as_bytes(),
        };

        let footer_offset = if footer.has_map {
            let map_offset = HEADER_SIZE as u64 + physical as u64;
            write_all_at(&self.file, &map_bytes, map_offset)?;
            let footer_offset = map_offset + map_bytes.len() as u64;
            self.file.set_len(footer_offset + FOOTER_SIZE as u64)?;
            footer_offset
        } else {
            (HEADER_SIZE + self.header.chunk_size as usize) as u64
        };
        write_all_at(&self.file, &footer.encode(), footer_offset)?;
        self.file.sync_all()?;

        let _ = self.sealed.set(SealedState {
            footer,
            pos_map: state.pos_map,
        });

        info!(
            chunk = self.number(),
            version = self.version(),
            physical_size = physical,
            logical_size = footer.logical_data_size,
            "Completed chunk"
        );
        Ok(())
    }

    /// Recompute the content hash of a completed chunk and compare it to the footer
    pub fn verify_hash(&self) -> Result<(), StorageError> {
        let sealed = self.sealed.get().ok_or_else(|| {
            StorageError::invalid_state(format!("chunk {} is not completed", self.number()))
        })?;
        let footer = sealed.footer;

        let mut hasher = blake3::Hasher::new();
        let mut header_bytes = [0u8; HEADER_SIZE];
        read_exact_at(&self.file, &mut header_bytes, 0)?;
        hasher.update(&header_bytes);
        hash_range(
            &self.file,
            &mut hasher,
            HEADER_SIZE as u64,
            footer.physical_data_size as u64 + footer.map_size as u64,
        )?;

        if hasher.finalize().as_bytes() != &footer.hash {
            return Err(StorageError::chunk_corrupt(self.number(), "content hash mismatch"));
        }
        Ok(())
    }

    /// Read the record starting exactly at a local position
    pub fn try_read_at(&self, local: i64) -> Result<RecordReadResult, StorageError> {
        let physical = match self.sealed.get() {
            Some(sealed) if sealed.footer.has_map => {
                match sealed.pos_map.binary_search_by_key(&local, |e| e.log_pos as i64) {
                    Ok(idx) => sealed.pos_map[idx].actual_pos as i64,
                    Err(_) => return Ok(RecordReadResult::out_of_bounds()),
                }
            }
            _ => {
                if local < 0 || local >= self.logical_data_size() {
                    return Ok(RecordReadResult::out_of_bounds());
                }
                local
            }
        };

        Ok(match self.read_forward(physical)? {
            Ok((record, _)) => RecordReadResult::found(record),
            Err(failure) => RecordReadResult::failed(failure),
        })
    }

    /// First record of the chunk
    pub fn try_read_first(&self) -> Result<ChunkProbe, StorageError> {
        self.try_read_closest_forward(0)
    }

    /// First record starting at or after a local position
    pub fn try_read_closest_forward(&self, local: i64) -> Result<ChunkProbe, StorageError> {
        if local < 0 {
            return Ok(Err(ReadFailure::OutOfBounds));
        }
        match self.sealed.get() {
            Some(sealed) if sealed.footer.has_map => {
                let idx = sealed.pos_map.partition_point(|e| (e.log_pos as i64) < local);
                let Some(entry) = sealed.pos_map.get(idx) else {
                    return Ok(Err(ReadFailure::OutOfBounds));
                };
                let pre = entry.log_pos as i64;
                Ok(self
                    .read_forward(entry.actual_pos as i64)?
                    .map(|(record, size)| ChunkRead { record, pre, post: pre + size }))
            }
            _ => {
                if local >= self.logical_data_size() {
                    return Ok(Err(ReadFailure::OutOfBounds));
                }
                Ok(self
                    .read_forward(local)?
                    .map(|(record, size)| ChunkRead { record, pre: local, post: local + size }))
            }
        }
    }

    /// Last record ending at or before a local position
    pub fn try_read_closest_backward(&self, local: i64) -> Result<ChunkProbe, StorageError> {
        match self.sealed.get() {
            Some(sealed) if sealed.footer.has_map => {
                let idx = sealed.pos_map.partition_point(|e| (e.log_pos as i64) < local);
                if idx == 0 {
                    return Ok(Err(ReadFailure::OutOfBounds));
                }
                let entry = sealed.pos_map[idx - 1];
                let pre = entry.log_pos as i64;
                Ok(self
                    .read_forward(entry.actual_pos as i64)?
                    .map(|(record, size)| ChunkRead { record, pre, post: pre + size }))
            }
            _ => {
                let local = local.min(self.logical_data_size());
                Ok(self
                    .read_backward(local)?
                    .map(|(record, size)| ChunkRead { record, pre: local - size, post: local }))
            }
        }
    }

    /// Last record of the chunk
    pub fn try_read_last(&self) -> Result<ChunkProbe, StorageError> {
        self.try_read_closest_backward(self.logical_data_size())
    }

    /// Iterate the chunk's records in log order
    pub fn records(&self) -> ChunkRecords<'_> {
        ChunkRecords {
            chunk: self,
            next: 0,
            done: false,
        }
    }

    /// Copy `len` bytes of stored record data starting at a physical offset
    pub fn read_raw(&self, physical: i64, len: usize) -> Result<Vec<u8>, StorageError> {
        let end = self.physical_data_size();
        if physical < 0 || physical + len as i64 > end {
            return Err(StorageError::invalid_state(format!(
                "raw read of {} bytes at {} outside chunk {} data of {} bytes",
                len,
                physical,
                self.number(),
                end
            )));
        }
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, HEADER_SIZE as u64 + physical as u64)?;
        Ok(buf)
    }

    /// Retire the chunk: its file is deleted once the last handle drops
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    /// Parse the frame starting at a physical data offset
    fn read_forward(&self, physical: i64) -> Result<Result<(LogRecord, i64), ReadFailure>, StorageError> {
        let end = self.physical_data_size();
        if physical < 0 || physical >= end {
            return Ok(Err(ReadFailure::OutOfBounds));
        }
        if end - physical < LENGTH_SIZE as i64 {
            return Ok(Err(corrupt("length prefix truncated by end of data")));
        }

        let mut len_buf = [0u8; LENGTH_SIZE];
        if let Err(failure) = self.read_data(&mut len_buf, physical)? {
            return Ok(Err(failure));
        }
        let length = i32::from_le_bytes(len_buf);
        let size = match codec::frame_size(length) {
            Ok(size) => size as i64,
            Err(e) => return Ok(Err(corrupt(e.to_string()))),
        };
        if physical + size > end {
            return Ok(Err(corrupt(format!(
                "record of {} bytes at {} runs past end of data {}",
                size, physical, end
            ))));
        }

        Ok(self.read_frame(physical, size)?.map(|record| (record, size)))
    }

    /// Parse the frame ending at a physical data offset
    fn read_backward(&self, physical_end: i64) -> Result<Result<(LogRecord, i64), ReadFailure>, StorageError> {
        if physical_end <= 0 {
            return Ok(Err(ReadFailure::OutOfBounds));
        }
        if physical_end < (2 * LENGTH_SIZE) as i64 {
            return Ok(Err(corrupt("length suffix truncated by start of data")));
        }

        let mut len_buf = [0u8; LENGTH_SIZE];
        if let Err(failure) = self.read_data(&mut len_buf, physical_end - LENGTH_SIZE as i64)? {
            return Ok(Err(failure));
        }
        let length = i32::from_le_bytes(len_buf);
        let size = match codec::frame_size(length) {
            Ok(size) => size as i64,
            Err(e) => return Ok(Err(corrupt(e.to_string()))),
        };
        let start = physical_end - size;
        if start < 0 {
            return Ok(Err(corrupt(format!(
                "record of {} bytes ending at {} starts before the chunk",
                size, physical_end
            ))));
        }

        Ok(self.read_frame(start, size)?.map(|record| (record, size)))
    }

    fn read_frame(&self, physical: i64, size: i64) -> Result<Result<LogRecord, ReadFailure>, StorageError> {
        let mut frame = vec![0u8; size as usize];
        if let Err(failure) = self.read_data(&mut frame, physical)? {
            return Ok(Err(failure));
        }
        Ok(codec::decode(&frame).map_err(|e| corrupt(e.to_string())))
    }

    /// Read data bytes; a short file is damage, not an I/O failure
    fn read_data(&self, buf: &mut [u8], physical: i64) -> Result<Result<(), ReadFailure>, StorageError> {
        match read_exact_at(&self.file, buf, HEADER_SIZE as u64 + physical as u64) {
            Ok(()) => Ok(Ok(())),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Ok(Err(corrupt("chunk file shorter than its data")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("number", &self.number())
            .field("version", &self.version())
            .field("scavenged", &self.is_scavenged())
            .field("completed", &self.is_completed())
            .field("logical_data_size", &self.logical_data_size())
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(
                    chunk = self.number(),
                    version = self.version(),
                    "Deleted retired chunk file"
                ),
                Err(e) => warn!(
                    chunk = self.number(),
                    path = %self.path.display(),
                    error = %e,
                    "Failed to delete retired chunk file"
                ),
            }
        }
    }
}

/// Iterator over a chunk's records in log order
pub struct ChunkRecords<'a> {
    chunk: &'a Chunk,
    next: i64,
    done: bool,
}

impl Iterator for ChunkRecords<'_> {
    type Item = Result<ChunkRead, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.chunk.try_read_closest_forward(self.next) {
            Ok(Ok(read)) => {
                self.next = read.post;
                Some(Ok(read))
            }
            Ok(Err(ReadFailure::OutOfBounds)) => {
                self.done = true;
                None
            }
            Ok(Err(ReadFailure::Corrupt { reason })) => {
                self.done = true;
                Some(Err(StorageError::chunk_corrupt(
                    self.chunk.number(),
                    format!("at local position {}: {}", self.next, reason),
                )))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn corrupt(reason: impl Into<String>) -> ReadFailure {
    ReadFailure::Corrupt {
        reason: reason.into(),
    }
}

fn read_header(file: &File, path: &Path) -> Result<ChunkHeader, StorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    match read_exact_at(file, &mut bytes, 0) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(StorageError::corrupt_database(format!(
                "chunk file {} is too short for a header",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    }
    ChunkHeader::decode(&bytes).map_err(|reason| {
        StorageError::corrupt_database(format!("bad header in {}: {}", path.display(), reason))
    })
}

fn read_footer(file: &File, number: i32, file_len: u64) -> Result<ChunkFooter, StorageError> {
    let mut bytes = [0u8; FOOTER_SIZE];
    read_exact_at(file, &mut bytes, file_len - FOOTER_SIZE as u64)?;
    ChunkFooter::decode(&bytes).map_err(|reason| StorageError::chunk_corrupt(number, reason))
}

fn hash_range(file: &File, hasher: &mut blake3::Hasher, offset: u64, len: u64) -> Result<(), StorageError> {
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(HASH_BLOCK_SIZE as u64) as usize;
        read_exact_at(file, &mut buf[..n], offset + done)?;
        hasher.update(&buf[..n]);
        done += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklog_core::ExpectedVersion;
    use tempfile::TempDir;
    use uuid::Uuid;

    const CHUNK_SIZE: i32 = 4096;

    fn record_at(position: i64) -> LogRecord {
        LogRecord::single_write(
            position,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "es1",
            ExpectedVersion::ANY,
            "et1",
            vec![0u8; 1200],
            vec![5u8, 7],
        )
    }

    fn new_chunk(temp: &TempDir, number: i32) -> Chunk {
        let path = temp.path().join(format!("chunk-{:06}.000000", number));
        Chunk::create_new(path, CHUNK_SIZE, number, 0, false).unwrap()
    }

    #[test]
    fn test_append_positions_accumulate() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);

        let mut pos = 0;
        for _ in 0..3 {
            let record = record_at(pos);
            let res = chunk.try_append(&record).unwrap();
            assert!(res.success);
            assert_eq!(res.old_position, pos);
            pos += record.size_on_disk();
            assert_eq!(res.new_position, pos);
        }
        assert_eq!(chunk.logical_data_size(), pos);
    }

    #[test]
    fn test_append_fails_without_mutation_when_full() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        for i in 0..3 {
            assert!(chunk.try_append(&record_at(i * 1300)).unwrap().success);
        }
        let before = chunk.logical_data_size();
        let res = chunk.try_append(&record_at(before)).unwrap();
        assert!(!res.success);
        assert_eq!(chunk.logical_data_size(), before);
    }

    #[test]
    fn test_append_rejects_record_at_other_position() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 1);
        assert!(matches!(
            chunk.try_append(&record_at(0)),
            Err(StorageError::InvalidChunkState(_))
        ));

        let first = record_at(CHUNK_SIZE as i64);
        chunk.try_append(&first).unwrap();
        assert!(chunk.try_append(&record_at(CHUNK_SIZE as i64 + 8)).is_err());
        assert_eq!(chunk.logical_data_size(), first.size_on_disk());
    }

    #[test]
    fn test_read_at_and_misaligned_position() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        let first = record_at(0);
        let second = record_at(first.size_on_disk());
        chunk.try_append(&first).unwrap();
        chunk.try_append(&second).unwrap();

        let res = chunk.try_read_at(first.size_on_disk()).unwrap();
        assert!(res.success);
        assert_eq!(res.record.unwrap(), second);

        let res = chunk.try_read_at(10).unwrap();
        assert!(!res.success);
        assert!(res.is_corrupt());

        let res = chunk.try_read_at(chunk.logical_data_size()).unwrap();
        assert!(!res.success);
        assert!(!res.is_corrupt());
    }

    #[test]
    fn test_backward_reads_from_end() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        let records: Vec<_> = (0..3).map(|i| record_at(i * 1300)).collect();
        for r in &records {
            chunk.try_append(r).unwrap();
        }
        chunk.complete().unwrap();

        let last = chunk.try_read_last().unwrap().unwrap();
        assert_eq!(last.record, records[2]);
        assert_eq!(last.pre, 2600);

        let prev = chunk.try_read_closest_backward(last.pre).unwrap().unwrap();
        assert_eq!(prev.record, records[1]);

        // positions inside the padding clamp to the end of data
        let clamped = chunk.try_read_closest_backward(CHUNK_SIZE as i64).unwrap().unwrap();
        assert_eq!(clamped.record, records[2]);

        assert_eq!(
            chunk.try_read_closest_backward(0).unwrap(),
            Err(ReadFailure::OutOfBounds)
        );
    }

    #[test]
    fn test_completed_chunk_rejects_appends_and_reopens() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 2);
        let record = record_at(2 * CHUNK_SIZE as i64);
        chunk.try_append(&record).unwrap();
        chunk.complete().unwrap();

        assert!(chunk.is_completed());
        assert!(chunk.try_append(&record).is_err());
        assert!(chunk.complete().is_err());

        let path = chunk.path().to_path_buf();
        drop(chunk);
        assert!(Chunk::is_completed_file(&path).unwrap());

        let reopened = Chunk::open_completed(&path, true).unwrap();
        assert_eq!(reopened.number(), 2);
        assert_eq!(reopened.logical_data_size(), record.size_on_disk());
        assert_eq!(reopened.try_read_at(0).unwrap().record.unwrap(), record);
    }

    #[test]
    fn test_ongoing_chunk_resumes_and_hash_matches() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        let first = record_at(0);
        chunk.try_append(&first).unwrap();
        chunk.flush().unwrap();
        let path = chunk.path().to_path_buf();
        let written = chunk.logical_data_size();
        drop(chunk);

        let chunk = Chunk::open_ongoing(&path, written).unwrap();
        let second = record_at(written);
        let res = chunk.try_append(&second).unwrap();
        assert_eq!(res.old_position, written);
        chunk.complete().unwrap();
        chunk.verify_hash().unwrap();
    }

    #[test]
    fn test_corrupted_data_is_reported_distinctly() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        let record = record_at(0);
        chunk.try_append(&record).unwrap();
        chunk.complete().unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        // flip the length suffix of the only record
        let mut bytes = fs::read(&path).unwrap();
        let suffix_at = HEADER_SIZE + record.size_on_disk() as usize - 1;
        bytes[suffix_at] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Chunk::open_completed(&path, true),
            Err(StorageError::ChunkCorrupt { .. })
        ));

        let chunk = Chunk::open_completed(&path, false).unwrap();
        let res = chunk.try_read_at(0).unwrap();
        assert!(res.is_corrupt());
        assert!(chunk.records().next().unwrap().is_err());
    }

    #[test]
    fn test_scavenged_chunk_keeps_log_positions() {
        let temp = TempDir::new().unwrap();
        let records: Vec<_> = (0..3).map(|i| record_at(CHUNK_SIZE as i64 + i * 1300)).collect();

        let path = temp.path().join("scavenged.tmp");
        let chunk = Chunk::create_new(&path, CHUNK_SIZE, 1, 1, true).unwrap();
        chunk.try_append(&records[0]).unwrap();
        let res = chunk.try_append(&records[2]).unwrap();
        assert_eq!(res.old_position, 1300);
        chunk.complete_scavenged(3900).unwrap();
        drop(chunk);

        let chunk = Chunk::open_completed(&path, true).unwrap();
        assert!(chunk.is_scavenged());
        assert_eq!(chunk.logical_data_size(), 3900);
        assert_eq!(chunk.physical_data_size(), 2600);
        assert_eq!(chunk.pos_map_len(), 2);

        assert_eq!(chunk.try_read_at(2600).unwrap().record.unwrap(), records[2]);
        assert!(!chunk.try_read_at(1300).unwrap().success);

        let next = chunk.try_read_closest_forward(1).unwrap().unwrap();
        assert_eq!(next.record, records[2]);
        assert_eq!((next.pre, next.post), (2600, 3900));

        let prev = chunk.try_read_closest_backward(2600).unwrap().unwrap();
        assert_eq!(prev.record, records[0]);

        let all: Vec<_> = chunk.records().map(|r| r.unwrap().record).collect();
        assert_eq!(all, vec![records[0].clone(), records[2].clone()]);
    }

    #[test]
    fn test_scavenged_chunk_rejects_out_of_order_records() {
        let temp = TempDir::new().unwrap();
        let chunk = Chunk::create_new(temp.path().join("s.tmp"), CHUNK_SIZE, 0, 1, true).unwrap();
        chunk.try_append(&record_at(1300)).unwrap();
        assert!(chunk.try_append(&record_at(0)).is_err());
        assert!(chunk.complete().is_err());
    }

    #[test]
    fn test_raw_read_sees_symmetric_frame_lengths() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        let record = record_at(0);
        chunk.try_append(&record).unwrap();

        let size = record.size_on_disk();
        let prefix = chunk.read_raw(0, LENGTH_SIZE).unwrap();
        let suffix = chunk.read_raw(size - LENGTH_SIZE as i64, LENGTH_SIZE).unwrap();
        assert_eq!(prefix, suffix);
        assert_eq!(i32::from_le_bytes(prefix.try_into().unwrap()) as i64, size - 8);

        assert!(chunk.read_raw(size - 2, LENGTH_SIZE).is_err());
        assert!(chunk.read_raw(-1, 1).is_err());
    }

    #[test]
    fn test_retired_chunk_file_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let chunk = new_chunk(&temp, 0);
        let path = chunk.path().to_path_buf();
        chunk.mark_for_deletion();
        assert!(path.exists());
        drop(chunk);
        assert!(!path.exists());
    }
}
