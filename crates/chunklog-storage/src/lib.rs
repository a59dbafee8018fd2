//! # Chunklog Storage
//!
//! Chunked, append-only transaction log.
//!
//! The log is a single sequence of framed records addressed by global byte
//! position and split across fixed-size chunk files. Readers are gated by
//! checkpoints so they only ever observe durably written (and optionally
//! replicated) records. The scavenger rewrites completed chunks to drop
//! records that stream retention rules no longer require.
//!
//! ## Components
//!
//! - [`Checkpoint`]: named position with separate write and flush steps
//! - [`Chunk`]: one chunk file, active or completed, ordinary or scavenged
//! - [`ChunkManager`]: ordered chunk registry with atomic chunk switching
//! - [`ChunkDb`]: opens the chunk set against the writer checkpoint
//! - [`ChunkWriter`]: single-writer append path with chunk rollover
//! - [`LogReader`]: checkpoint-gated cursor for random and sequential reads
//! - [`Scavenger`]: retention-driven chunk compaction
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chunklog_core::{ExpectedVersion, LogRecord};
//! use chunklog_storage::{ChunkDb, ChunkDbConfig, ChunkWriter};
//! use uuid::Uuid;
//!
//! let config = ChunkDbConfig::builder("./data").chunk_size(1 << 20).build()?;
//! let db = Arc::new(ChunkDb::open(config)?);
//!
//! let mut writer = ChunkWriter::new(db.clone())?;
//! let written = writer.append(|pos| {
//!     LogRecord::single_write(pos, Uuid::new_v4(), Uuid::new_v4(), "orders",
//!         ExpectedVersion::ANY, "OrderPlaced", &b"{}"[..], &b""[..])
//! })?;
//! writer.flush()?;
//!
//! let reader = db.reader(0);
//! assert!(reader.try_read_at(written.old_position)?.success);
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod naming;
pub mod reader;
pub mod results;
pub mod scavenge;
pub mod writer;

// Re-exports
pub use checkpoint::{Checkpoint, FileCheckpoint, InMemoryCheckpoint};
pub use chunk::{Chunk, ChunkRead};
pub use config::{CheckpointMode, ChunkDbConfig, ChunkDbConfigBuilder, DbSettings};
pub use db::ChunkDb;
pub use error::StorageError;
pub use manager::ChunkManager;
pub use naming::{FileNamingStrategy, VersionedPatternFileNamingStrategy};
pub use reader::LogReader;
pub use results::{ReadFailure, RecordReadResult, RecordWriteResult, SeqReadResult};
pub use scavenge::{
    ChunkScavengeFailure, RetentionPlan, ScavengeCancel, ScavengeHandle, ScavengeResult, Scavenger,
};
pub use writer::ChunkWriter;
