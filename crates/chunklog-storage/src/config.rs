//! Database configuration
//!
//! [`ChunkDbConfig`] is the in-process configuration handed to
//! [`crate::ChunkDb::open`]. [`DbSettings`] is its serialisable
//! counterpart, read from the `[database]` table of a TOML settings file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, FileCheckpoint, InMemoryCheckpoint};
use crate::error::StorageError;
use crate::naming::{FileNamingStrategy, VersionedPatternFileNamingStrategy};

/// Default chunk size: 256 MiB
pub const DEFAULT_CHUNK_SIZE: i32 = 256 * 1024 * 1024;

/// Default chunk file prefix
pub const DEFAULT_FILE_PREFIX: &str = "chunk-";

pub const WRITER_CHECKPOINT: &str = "writer";
pub const REPLICATION_CHECKPOINT: &str = "replication";
pub const CHASER_CHECKPOINT: &str = "chaser";
pub const EPOCH_CHECKPOINT: &str = "epoch";

/// Configuration of a chunk database
#[derive(Clone)]
pub struct ChunkDbConfig {
    /// Directory holding chunk and checkpoint files
    pub path: PathBuf,
    pub naming: Arc<dyn FileNamingStrategy>,
    /// Capacity of one chunk in bytes
    pub chunk_size: i32,
    /// Number of the first chunk present; earlier chunks were truncated away
    pub chunk_number_offset: i32,
    /// Exclusive end of the durably written log
    pub writer_checkpoint: Arc<dyn Checkpoint>,
    /// Pre-position of the last replicated record, -1 when unknown
    pub replication_checkpoint: Arc<dyn Checkpoint>,
    /// Position up to which downstream consumers have read
    pub chaser_checkpoint: Arc<dyn Checkpoint>,
    /// Position of the last epoch record, -1 when none
    pub epoch_checkpoint: Arc<dyn Checkpoint>,
    /// Recompute chunk checksums when opening completed chunks
    pub verify_hashes: bool,
}

impl ChunkDbConfig {
    /// Start a builder for a database in `path`
    pub fn builder(path: impl Into<PathBuf>) -> ChunkDbConfigBuilder {
        ChunkDbConfigBuilder::new(path)
    }

    /// First global position the database covers
    pub fn start_position(&self) -> i64 {
        self.chunk_number_offset as i64 * self.chunk_size as i64
    }

    /// Every checkpoint, for flushing together
    pub fn checkpoints(&self) -> [&Arc<dyn Checkpoint>; 4] {
        [
            &self.writer_checkpoint,
            &self.replication_checkpoint,
            &self.chaser_checkpoint,
            &self.epoch_checkpoint,
        ]
    }
}

impl fmt::Debug for ChunkDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkDbConfig")
            .field("path", &self.path)
            .field("naming", &self.naming)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_number_offset", &self.chunk_number_offset)
            .field("writer_checkpoint", &self.writer_checkpoint.read())
            .field("replication_checkpoint", &self.replication_checkpoint.read())
            .field("verify_hashes", &self.verify_hashes)
            .finish()
    }
}

/// Builder for [`ChunkDbConfig`]
///
/// Checkpoints not supplied explicitly are created by [`build`](Self::build):
/// file-backed in the database directory by default, in memory after
/// [`in_memory_checkpoints`](Self::in_memory_checkpoints).
#[derive(Debug)]
pub struct ChunkDbConfigBuilder {
    path: PathBuf,
    chunk_size: i32,
    chunk_number_offset: i32,
    file_prefix: String,
    naming: Option<Arc<dyn FileNamingStrategy>>,
    in_memory_checkpoints: bool,
    writer_checkpoint: Option<Arc<dyn Checkpoint>>,
    replication_checkpoint: Option<Arc<dyn Checkpoint>>,
    chaser_checkpoint: Option<Arc<dyn Checkpoint>>,
    epoch_checkpoint: Option<Arc<dyn Checkpoint>>,
    verify_hashes: bool,
}

impl ChunkDbConfigBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_number_offset: 0,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            naming: None,
            in_memory_checkpoints: false,
            writer_checkpoint: None,
            replication_checkpoint: None,
            chaser_checkpoint: None,
            epoch_checkpoint: None,
            verify_hashes: false,
        }
    }

    pub fn chunk_size(mut self, chunk_size: i32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn chunk_number_offset(mut self, offset: i32) -> Self {
        self.chunk_number_offset = offset;
        self
    }

    /// Prefix for the default versioned naming strategy
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    pub fn naming(mut self, naming: Arc<dyn FileNamingStrategy>) -> Self {
        self.naming = Some(naming);
        self
    }

    /// Keep generated checkpoints in memory only
    pub fn in_memory_checkpoints(mut self) -> Self {
        self.in_memory_checkpoints = true;
        self
    }

    pub fn writer_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.writer_checkpoint = Some(checkpoint);
        self
    }

    pub fn replication_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.replication_checkpoint = Some(checkpoint);
        self
    }

    pub fn chaser_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.chaser_checkpoint = Some(checkpoint);
        self
    }

    pub fn epoch_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.epoch_checkpoint = Some(checkpoint);
        self
    }

    pub fn verify_hashes(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ChunkDbConfig, StorageError> {
        if self.chunk_size <= 0 {
            return Err(StorageError::invalid_config(format!(
                "chunk size must be positive, got {}",
                self.chunk_size
            )));
        }
        if self.chunk_number_offset < 0 {
            return Err(StorageError::invalid_config(format!(
                "chunk number offset must not be negative, got {}",
                self.chunk_number_offset
            )));
        }
        if self.naming.is_none() && self.file_prefix.is_empty() {
            return Err(StorageError::invalid_config("file prefix must not be empty"));
        }

        let start = self.chunk_number_offset as i64 * self.chunk_size as i64;
        let naming = match self.naming {
            Some(naming) => naming,
            None => Arc::new(VersionedPatternFileNamingStrategy::new(
                &self.path,
                self.file_prefix,
            )),
        };

        let make = |name: &str, initial: i64| -> Result<Arc<dyn Checkpoint>, StorageError> {
            if self.in_memory_checkpoints {
                Ok(Arc::new(InMemoryCheckpoint::new(name, initial)))
            } else {
                Ok(Arc::new(FileCheckpoint::open(&self.path, name, initial)?))
            }
        };

        let writer_checkpoint = match self.writer_checkpoint {
            Some(chk) => chk,
            None => make(WRITER_CHECKPOINT, start)?,
        };
        let replication_checkpoint = match self.replication_checkpoint {
            Some(chk) => chk,
            None => make(REPLICATION_CHECKPOINT, -1)?,
        };
        let chaser_checkpoint = match self.chaser_checkpoint {
            Some(chk) => chk,
            None => make(CHASER_CHECKPOINT, start)?,
        };
        let epoch_checkpoint = match self.epoch_checkpoint {
            Some(chk) => chk,
            None => make(EPOCH_CHECKPOINT, -1)?,
        };

        Ok(ChunkDbConfig {
            path: self.path,
            naming,
            chunk_size: self.chunk_size,
            chunk_number_offset: self.chunk_number_offset,
            writer_checkpoint,
            replication_checkpoint,
            chaser_checkpoint,
            epoch_checkpoint,
            verify_hashes: self.verify_hashes,
        })
    }
}

/// How checkpoints are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    #[default]
    File,
    Memory,
}

/// Serialisable database settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub path: PathBuf,
    pub chunk_size: i32,
    pub chunk_number_offset: i32,
    pub file_prefix: String,
    pub verify_hashes: bool,
    pub checkpoints: CheckpointMode,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_number_offset: 0,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            verify_hashes: false,
            checkpoints: CheckpointMode::File,
        }
    }
}

impl DbSettings {
    /// Parse settings from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, StorageError> {
        Ok(toml::from_str(text)?)
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Build the in-process configuration these settings describe
    pub fn to_config(&self) -> Result<ChunkDbConfig, StorageError> {
        let mut builder = ChunkDbConfig::builder(&self.path)
            .chunk_size(self.chunk_size)
            .chunk_number_offset(self.chunk_number_offset)
            .file_prefix(self.file_prefix.clone())
            .verify_hashes(self.verify_hashes);
        if self.checkpoints == CheckpointMode::Memory {
            builder = builder.in_memory_checkpoints();
        }
        builder.build()
    }
}
