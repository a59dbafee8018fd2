//! Chunk registry
//!
//! The manager owns the ordered list of chunks. Lookups hand out
//! `Arc<Chunk>` handles; a switch replaces the handle registered under a
//! number while readers holding the previous one keep reading it. The old
//! file goes away when the last of those handles drops.

use std::path::Path;
use std::sync::Arc;

use chunklog_core::LogPosition;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::checkpoint::sync_parent_dir;
use crate::chunk::Chunk;
use crate::config::ChunkDbConfig;
use crate::error::StorageError;
use crate::naming::FileNamingStrategy;

/// Ordered, contiguous set of chunks
#[derive(Debug)]
pub struct ChunkManager {
    chunk_size: i32,
    chunk_number_offset: i32,
    naming: Arc<dyn FileNamingStrategy>,
    /// Index `i` holds chunk number `chunk_number_offset + i`
    chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Serialises chunk creation and replacement
    mutation: Mutex<()>,
}

impl ChunkManager {
    pub fn new(config: &ChunkDbConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_number_offset: config.chunk_number_offset,
            naming: config.naming.clone(),
            chunks: RwLock::new(Vec::new()),
            mutation: Mutex::new(()),
        }
    }

    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Chunk registered under a number
    pub fn get_chunk(&self, number: i32) -> Option<Arc<Chunk>> {
        let index = number.checked_sub(self.chunk_number_offset)?;
        if index < 0 {
            return None;
        }
        self.chunks.read().get(index as usize).cloned()
    }

    /// Chunk whose range covers a global position
    pub fn get_chunk_for(&self, position: LogPosition) -> Option<Arc<Chunk>> {
        if position < 0 {
            return None;
        }
        let number = position / self.chunk_size as i64;
        i32::try_from(number).ok().and_then(|n| self.get_chunk(n))
    }

    /// The highest-numbered chunk
    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().last().cloned()
    }

    /// Snapshot of every registered chunk in number order
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().clone()
    }

    /// Register an opened chunk as the next one in sequence
    pub(crate) fn add_chunk(&self, chunk: Chunk) -> Result<Arc<Chunk>, StorageError> {
        let _guard = self.mutation.lock();
        let mut chunks = self.chunks.write();
        self.check_next(&chunks, &chunk)?;
        if let Some(last) = chunks.last() {
            if !last.is_completed() {
                return Err(StorageError::corrupt_database(format!(
                    "chunk {} follows incomplete chunk {}",
                    chunk.number(),
                    last.number()
                )));
            }
        }
        let chunk = Arc::new(chunk);
        chunks.push(chunk.clone());
        Ok(chunk)
    }

    /// Create and register the next chunk, version 0, in the active state
    ///
    /// The current last chunk must already be completed.
    pub fn add_new_chunk(&self) -> Result<Arc<Chunk>, StorageError> {
        let _guard = self.mutation.lock();
        let number = {
            let chunks = self.chunks.read();
            match chunks.last() {
                Some(last) if !last.is_completed() => {
                    return Err(StorageError::invalid_state(format!(
                        "cannot add a chunk after active chunk {}",
                        last.number()
                    )));
                }
                Some(last) => last.number() + 1,
                None => self.chunk_number_offset,
            }
        };

        let path = self.naming.filename_for(number, 0);
        let chunk = Arc::new(Chunk::create_new(path, self.chunk_size, number, 0, false)?);
        self.chunks.write().push(chunk.clone());

        info!(chunk = number, "Added new chunk");
        Ok(chunk)
    }

    /// Replace a completed chunk with a scavenged copy
    ///
    /// The work file at `temp_path` is validated, renamed to its versioned
    /// name and swapped into the registry. The replaced chunk is marked for
    /// deletion; its file disappears once no reader holds it.
    pub fn switch_chunk(
        &self,
        temp_path: &Path,
        verify_hash: bool,
    ) -> Result<Arc<Chunk>, StorageError> {
        let _guard = self.mutation.lock();

        let (number, version, logical_size) = {
            let candidate = Chunk::open_completed(temp_path, verify_hash)?;
            (candidate.number(), candidate.version(), candidate.logical_data_size())
        };
        let old = self
            .get_chunk(number)
            .ok_or(StorageError::ChunkNotFound(number))?;

        if !old.is_completed() {
            return Err(StorageError::invalid_state(format!(
                "chunk {} is still active",
                number
            )));
        }
        if version <= old.version() {
            return Err(StorageError::invalid_state(format!(
                "replacement version {} of chunk {} is not newer than {}",
                version,
                number,
                old.version()
            )));
        }
        if logical_size != old.logical_data_size() {
            return Err(StorageError::invalid_state(format!(
                "replacement for chunk {} covers {} bytes, original covers {}",
                number,
                logical_size,
                old.logical_data_size()
            )));
        }

        let final_path = self.naming.filename_for(number, version);
        std::fs::rename(temp_path, &final_path)?;
        sync_parent_dir(&final_path)?;
        let new_chunk = Arc::new(Chunk::open_completed(&final_path, false)?);

        {
            let mut chunks = self.chunks.write();
            let index = (number - self.chunk_number_offset) as usize;
            let Some(slot) = chunks.get_mut(index) else {
                drop(chunks);
                new_chunk.mark_for_deletion();
                return Err(StorageError::ChunkNotFound(number));
            };
            *slot = new_chunk.clone();
        }
        old.mark_for_deletion();

        info!(
            chunk = number,
            old_version = old.version(),
            new_version = version,
            "Switched chunk"
        );
        Ok(new_chunk)
    }

    /// Drop every registered chunk
    pub(crate) fn clear(&self) {
        let _guard = self.mutation.lock();
        let dropped = std::mem::take(&mut *self.chunks.write());
        debug!(chunks = dropped.len(), "Released chunks");
    }

    fn check_next(&self, chunks: &[Arc<Chunk>], chunk: &Chunk) -> Result<(), StorageError> {
        let expected = self.chunk_number_offset + chunks.len() as i32;
        if chunk.number() != expected {
            return Err(StorageError::corrupt_database(format!(
                "expected chunk {}, found chunk {}",
                expected,
                chunk.number()
            )));
        }
        if chunk.chunk_size() != self.chunk_size {
            return Err(StorageError::corrupt_database(format!(
                "chunk {} has size {}, database uses {}",
                chunk.number(),
                chunk.chunk_size(),
                self.chunk_size
            )));
        }
        Ok(())
    }
}
