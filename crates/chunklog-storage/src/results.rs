//! Read and write result value objects
//!
//! Reads never raise for boundary misses or damaged records; they return
//! one of these with `success == false` and a [`ReadFailure`] saying which.

use chunklog_core::{LogPosition, LogRecord};

/// Why a read produced no record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// No record at the position, or the record lies past the visible end
    OutOfBounds,
    /// The bytes at the position failed framing or field validation
    Corrupt { reason: String },
}

/// Outcome of a random-access read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReadResult {
    pub success: bool,
    pub record: Option<LogRecord>,
    pub failure: Option<ReadFailure>,
}

impl RecordReadResult {
    pub fn found(record: LogRecord) -> Self {
        Self {
            success: true,
            record: Some(record),
            failure: None,
        }
    }

    pub fn out_of_bounds() -> Self {
        Self::failed(ReadFailure::OutOfBounds)
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::failed(ReadFailure::Corrupt {
            reason: reason.into(),
        })
    }

    pub fn failed(failure: ReadFailure) -> Self {
        Self {
            success: false,
            record: None,
            failure: Some(failure),
        }
    }

    /// Whether the read failed on damaged data rather than a boundary
    pub fn is_corrupt(&self) -> bool {
        matches!(self.failure, Some(ReadFailure::Corrupt { .. }))
    }
}

/// Outcome of a sequential read, with the record's global bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqReadResult {
    pub success: bool,
    pub record: Option<LogRecord>,
    pub record_pre_position: LogPosition,
    pub record_post_position: LogPosition,
    pub failure: Option<ReadFailure>,
}

impl SeqReadResult {
    pub fn found(record: LogRecord, pre: LogPosition, post: LogPosition) -> Self {
        Self {
            success: true,
            record: Some(record),
            record_pre_position: pre,
            record_post_position: post,
            failure: None,
        }
    }

    pub fn failed(failure: ReadFailure) -> Self {
        Self {
            success: false,
            record: None,
            record_pre_position: -1,
            record_post_position: -1,
            failure: Some(failure),
        }
    }

    pub fn out_of_bounds() -> Self {
        Self::failed(ReadFailure::OutOfBounds)
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self.failure, Some(ReadFailure::Corrupt { .. }))
    }
}

/// Outcome of appending to a chunk, in chunk-local positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordWriteResult {
    pub success: bool,
    pub old_position: i64,
    pub new_position: i64,
}

impl RecordWriteResult {
    pub fn successful(old_position: i64, new_position: i64) -> Self {
        Self {
            success: true,
            old_position,
            new_position,
        }
    }

    /// The record did not fit; nothing was written
    pub fn failed(position: i64) -> Self {
        Self {
            success: false,
            old_position: position,
            new_position: position,
        }
    }
}
