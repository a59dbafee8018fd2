//! Error types for chunklog-storage
//!
//! Expected misses (capacity exhaustion, reads past the visible end of the
//! log, corrupt records) are reported through the result value objects in
//! [`crate::results`]. The variants here are the conditions a caller cannot
//! route around: storage failures and structural damage to the database.

use thiserror::Error;

use chunklog_core::CodecError;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// A record could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration rejected at build or open time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A chunk file is structurally damaged
    #[error("Chunk {chunk} is corrupt: {reason}")]
    ChunkCorrupt { chunk: i32, reason: String },

    /// The chunk set or checkpoints are inconsistent
    #[error("Corrupt database: {0}")]
    CorruptDatabase(String),

    /// A checkpoint file could not be trusted
    #[error("Checkpoint {name} is corrupt: {reason}")]
    CheckpointCorrupt { name: String, reason: String },

    /// Operation not allowed in the chunk's current state
    #[error("Invalid chunk state: {0}")]
    InvalidChunkState(String),

    /// No chunk is registered under the number
    #[error("Chunk not found: {0}")]
    ChunkNotFound(i32),

    /// The record can never fit in a chunk
    #[error("Record of {size} bytes does not fit in a chunk of {chunk_size} bytes")]
    RecordTooLarge { size: i64, chunk_size: i32 },

    /// A scavenge was cancelled before it finished
    #[error("Scavenge cancelled")]
    Cancelled,

    /// A background task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),

    /// Settings file could not be parsed
    #[error("Settings error: {0}")]
    Settings(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for StorageError {
    fn from(err: toml::de::Error) -> Self {
        StorageError::Settings(err.to_string())
    }
}

impl StorageError {
    /// Create a new ChunkCorrupt error
    pub fn chunk_corrupt(chunk: i32, reason: impl Into<String>) -> Self {
        Self::ChunkCorrupt {
            chunk,
            reason: reason.into(),
        }
    }

    /// Create a new CorruptDatabase error
    pub fn corrupt_database(message: impl Into<String>) -> Self {
        Self::CorruptDatabase(message.into())
    }

    /// Create a new InvalidChunkState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidChunkState(message.into())
    }

    /// Create a new InvalidConfig error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
