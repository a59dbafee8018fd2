//! Log record variants
//!
//! Every record carries its own pre-position (`log_position`). The
//! post-position is derived: `log_position + size_on_disk()`.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, FRAME_OVERHEAD};
use crate::system::{EpochRecord, SystemRecordType};

/// Global byte offset into the logical transaction log
pub type LogPosition = i64;

/// Record type tag written after the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    Prepare = 0,
    Commit = 1,
    System = 2,
}

impl RecordType {
    /// Parse a record type tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Prepare),
            1 => Some(Self::Commit),
            2 => Some(Self::System),
            _ => None,
        }
    }
}

/// Well-known expected version sentinels
pub struct ExpectedVersion;

impl ExpectedVersion {
    /// Append without an optimistic concurrency check
    pub const ANY: i64 = -2;
    /// The stream must not exist yet
    pub const NO_STREAM: i64 = -1;
}

/// Bit set describing a prepare record
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    pub const NONE: Self = Self(0);
    /// The prepare carries an event
    pub const DATA: Self = Self(0x01);
    /// First prepare of its transaction
    pub const TRANSACTION_BEGIN: Self = Self(0x02);
    /// Last prepare of its transaction
    pub const TRANSACTION_END: Self = Self(0x04);
    /// Delete tombstone for the stream
    pub const STREAM_DELETE: Self = Self(0x08);
    /// First event of the stream; its metadata holds the stream's [`StreamMetadata`](crate::StreamMetadata)
    pub const STREAM_CREATED: Self = Self(0x10);
    /// Committed in one step, no separate commit record follows
    pub const IS_COMMITTED: Self = Self(0x20);
    pub const IS_JSON: Self = Self(0x40);

    /// Flags of a single-event, self-committing write
    pub const SINGLE_WRITE: Self = Self(0x01 | 0x02 | 0x04 | 0x20);

    /// Wrap raw bits
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for PrepareFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PrepareFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PrepareFlags, &str); 7] = [
            (PrepareFlags::DATA, "DATA"),
            (PrepareFlags::TRANSACTION_BEGIN, "TRANSACTION_BEGIN"),
            (PrepareFlags::TRANSACTION_END, "TRANSACTION_END"),
            (PrepareFlags::STREAM_DELETE, "STREAM_DELETE"),
            (PrepareFlags::STREAM_CREATED, "STREAM_CREATED"),
            (PrepareFlags::IS_COMMITTED, "IS_COMMITTED"),
            (PrepareFlags::IS_JSON, "IS_JSON"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "PrepareFlags(NONE)")
        } else {
            write!(f, "PrepareFlags({})", names.join(" | "))
        }
    }
}

/// A single proposed event within a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareLogRecord {
    pub log_position: LogPosition,
    pub flags: PrepareFlags,
    /// Position of the first prepare of the transaction
    pub transaction_position: LogPosition,
    /// Index of this prepare within its transaction
    pub transaction_offset: i32,
    /// Event number the writer expects, or an [`ExpectedVersion`] sentinel
    pub expected_version: i64,
    pub event_stream_id: String,
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp_millis: i64,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl PrepareLogRecord {
    /// Whether this prepare is a delete tombstone
    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }

    /// Whether this prepare created its stream
    pub fn is_stream_created(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_CREATED)
    }

    /// Whether this prepare needs no separate commit record
    pub fn is_self_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }
}

/// Finalizes the transaction that starts at `transaction_position`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogRecord {
    pub log_position: LogPosition,
    pub transaction_position: LogPosition,
    /// Event number assigned to the first prepare of the transaction
    pub first_event_number: i64,
    pub correlation_id: Uuid,
    pub timestamp_millis: i64,
}

/// Control record, exempt from stream retention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemLogRecord {
    pub log_position: LogPosition,
    pub timestamp_millis: i64,
    pub system_record_type: SystemRecordType,
    pub data: Bytes,
}

impl SystemLogRecord {
    /// Decode the epoch payload of an epoch record
    pub fn epoch(&self) -> Option<EpochRecord> {
        match self.system_record_type {
            SystemRecordType::Epoch => EpochRecord::decode(&self.data).ok(),
        }
    }
}

/// A record of the transaction log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Prepare(PrepareLogRecord),
    Commit(CommitLogRecord),
    System(SystemLogRecord),
}

impl LogRecord {
    /// A self-committing prepare holding a single event
    #[allow(clippy::too_many_arguments)]
    pub fn single_write(
        log_position: LogPosition,
        correlation_id: Uuid,
        event_id: Uuid,
        event_stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: impl Into<Bytes>,
        metadata: impl Into<Bytes>,
    ) -> Self {
        Self::Prepare(PrepareLogRecord {
            log_position,
            flags: PrepareFlags::SINGLE_WRITE,
            transaction_position: log_position,
            transaction_offset: 0,
            expected_version,
            event_stream_id: event_stream_id.into(),
            event_id,
            correlation_id,
            timestamp_millis: now_millis(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: metadata.into(),
        })
    }

    /// A commit for the transaction starting at `transaction_position`
    pub fn commit(
        log_position: LogPosition,
        correlation_id: Uuid,
        transaction_position: LogPosition,
        first_event_number: i64,
    ) -> Self {
        Self::Commit(CommitLogRecord {
            log_position,
            transaction_position,
            first_event_number,
            correlation_id,
            timestamp_millis: now_millis(),
        })
    }

    /// An epoch system record
    pub fn epoch(log_position: LogPosition, epoch: &EpochRecord) -> Self {
        Self::System(SystemLogRecord {
            log_position,
            timestamp_millis: now_millis(),
            system_record_type: SystemRecordType::Epoch,
            data: epoch.encode(),
        })
    }

    /// Pre-position of the record
    pub fn log_position(&self) -> LogPosition {
        match self {
            Self::Prepare(p) => p.log_position,
            Self::Commit(c) => c.log_position,
            Self::System(s) => s.log_position,
        }
    }

    /// Type tag of the record
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Prepare(_) => RecordType::Prepare,
            Self::Commit(_) => RecordType::Commit,
            Self::System(_) => RecordType::System,
        }
    }

    /// Encoded size including the length prefix and suffix
    pub fn size_on_disk(&self) -> i64 {
        (codec::payload_len(self) + FRAME_OVERHEAD) as i64
    }

    /// Post-position of the record
    pub fn next_position(&self) -> LogPosition {
        self.log_position() + self.size_on_disk()
    }

    pub fn as_prepare(&self) -> Option<&PrepareLogRecord> {
        match self {
            Self::Prepare(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CommitLogRecord> {
        match self {
            Self::Commit(c) => Some(c),
            _ => None,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
