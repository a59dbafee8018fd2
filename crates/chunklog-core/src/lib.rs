//! # Chunklog Core
//!
//! Record model and binary codec shared by the chunklog storage engine.
//!
//! The transaction log is a single, ever-growing sequence of framed
//! records addressed by a global byte offset ([`LogPosition`]). This
//! crate defines what a record is and how it is laid out on disk; the
//! `chunklog-storage` crate decides where the bytes live.
//!
//! ## Key Types
//!
//! - [`LogRecord`]: tagged union over [`PrepareLogRecord`], [`CommitLogRecord`]
//!   and [`SystemLogRecord`]
//! - [`PrepareFlags`]: bit set describing a prepare (transaction bounds, tombstone, ...)
//! - [`StreamMetadata`]: per-stream retention policy carried by stream-created prepares
//! - [`EpochRecord`]: payload of the epoch system record
//!
//! ## Framing
//!
//! ```text
//! [len: i32][record_type: u8][version: u8][log_position: i64][fields...][len: i32]
//! ```
//!
//! The length is repeated after the payload so a reader positioned at the
//! end of a record can walk backwards as cheaply as forwards.

pub mod codec;
pub mod error;
pub mod metadata;
pub mod record;
pub mod system;

pub use codec::{FRAME_OVERHEAD, MAX_RECORD_SIZE, RECORD_FORMAT_VERSION};
pub use error::CodecError;
pub use metadata::StreamMetadata;
pub use record::{
    CommitLogRecord, ExpectedVersion, LogPosition, LogRecord, PrepareFlags, PrepareLogRecord,
    RecordType, SystemLogRecord,
};
pub use system::{EpochRecord, SystemRecordType};
