//! Checkpoints
//!
//! A checkpoint is a named 64-bit position with a two-step update:
//! [`Checkpoint::write`] is a cheap in-memory store visible to every
//! reader in the process, [`Checkpoint::flush`] is the durability barrier.
//! Callers batch writes and flush once.

use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::StorageError;

/// Size of a persisted checkpoint: value plus truncated hash
const CHECKPOINT_FILE_SIZE: usize = 16;

/// A persisted monotonic position marker
pub trait Checkpoint: Send + Sync + fmt::Debug {
    /// Name of the checkpoint (also its file stem when persisted)
    fn name(&self) -> &str;

    /// Last written value
    fn read(&self) -> i64;

    /// Last value made durable by [`Checkpoint::flush`]
    fn flushed(&self) -> i64;

    /// Update the value in memory; not durable until flushed
    fn write(&self, position: i64);

    /// Make the last written value durable
    fn flush(&self) -> Result<(), StorageError>;
}

/// Checkpoint held only in memory, lost on restart
#[derive(Debug)]
pub struct InMemoryCheckpoint {
    name: String,
    value: AtomicI64,
    flushed: AtomicI64,
}

impl InMemoryCheckpoint {
    pub fn new(name: impl Into<String>, initial: i64) -> Self {
        Self {
            name: name.into(),
            value: AtomicI64::new(initial),
            flushed: AtomicI64::new(initial),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    fn flushed(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn write(&self, position: i64) {
        self.value.store(position, Ordering::Release);
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.flushed.store(self.read(), Ordering::Release);
        Ok(())
    }
}

/// Checkpoint persisted as `{name}.chk` in a directory
///
/// Each flush writes a sibling temp file, syncs it and renames it over the
/// checkpoint file, so the file on disk always holds a complete value. A
/// hash of the value guards against bit rot being read back as a position.
pub struct FileCheckpoint {
    name: String,
    path: PathBuf,
    value: AtomicI64,
    flushed: AtomicI64,
    flush_lock: Mutex<()>,
}

impl FileCheckpoint {
    /// Open the checkpoint, creating it with `initial` if absent
    pub fn open(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        initial: i64,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.chk", name));

        let (value, existed) = if path.exists() {
            (read_checkpoint_file(&name, &path)?, true)
        } else {
            (initial, false)
        };

        let checkpoint = Self {
            name,
            path,
            value: AtomicI64::new(value),
            flushed: AtomicI64::new(value),
            flush_lock: Mutex::new(()),
        };

        if !existed {
            checkpoint.persist(value)?;
            debug!(name = %checkpoint.name, value, "Created checkpoint file");
        }

        Ok(checkpoint)
    }

    /// Path of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, value: i64) -> Result<(), StorageError> {
        let tmp_path = self.path.with_extension("chk.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&encode_checkpoint(value))?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

impl fmt::Debug for FileCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCheckpoint")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("value", &self.read())
            .field("flushed", &self.flushed())
            .finish()
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    fn flushed(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn write(&self, position: i64) {
        self.value.store(position, Ordering::Release);
    }

    fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.flush_lock.lock();
        let value = self.read();
        if value == self.flushed() {
            return Ok(());
        }
        self.persist(value)?;
        self.flushed.store(value, Ordering::Release);
        trace!(name = %self.name, value, "Flushed checkpoint");
        Ok(())
    }
}

fn encode_checkpoint(value: i64) -> [u8; CHECKPOINT_FILE_SIZE] {
    let value_bytes = value.to_le_bytes();
    let hash = blake3::hash(&value_bytes);
    let mut out = [0u8; CHECKPOINT_FILE_SIZE];
    out[..8].copy_from_slice(&value_bytes);
    out[8..].copy_from_slice(&hash.as_bytes()[..8]);
    out
}

fn read_checkpoint_file(name: &str, path: &Path) -> Result<i64, StorageError> {
    let mut bytes = Vec::with_capacity(CHECKPOINT_FILE_SIZE);
    File::open(path)?.read_to_end(&mut bytes)?;

    let corrupt = |reason: String| StorageError::CheckpointCorrupt {
        name: name.to_string(),
        reason,
    };

    if bytes.len() != CHECKPOINT_FILE_SIZE {
        return Err(corrupt(format!(
            "expected {} bytes, found {}",
            CHECKPOINT_FILE_SIZE,
            bytes.len()
        )));
    }

    let mut value_bytes = [0u8; 8];
    value_bytes.copy_from_slice(&bytes[..8]);
    let hash = blake3::hash(&value_bytes);
    if hash.as_bytes()[..8] != bytes[8..] {
        return Err(corrupt("hash mismatch".to_string()));
    }
    Ok(i64::from_le_bytes(value_bytes))
}

#[cfg(unix)]
pub(crate) fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}
