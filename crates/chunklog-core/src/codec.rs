//! Binary record codec
//!
//! ```text
//! [len: i32][payload: len bytes][len: i32]
//! payload = [record_type: u8][version: u8][log_position: i64][variant fields]
//! ```
//!
//! All integers are little-endian. Strings are UTF-8 with a `u16` length,
//! byte blobs carry an `i32` length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::CodecError;
use crate::record::{
    CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord, RecordType, SystemLogRecord,
};
use crate::system::SystemRecordType;

/// Bytes taken by the length prefix and suffix together
pub const FRAME_OVERHEAD: usize = 8;

/// Size of one length field
pub const LENGTH_SIZE: usize = 4;

/// Current record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Upper bound on a frame's payload length accepted when reading
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

const COMMON_HEADER_LEN: usize = 1 + 1 + 8;
const UUID_LEN: usize = 16;

/// Payload length of a record, excluding prefix and suffix
pub(crate) fn payload_len(record: &LogRecord) -> usize {
    COMMON_HEADER_LEN
        + match record {
            LogRecord::Prepare(p) => {
                2 + 8
                    + 4
                    + 8
                    + (2 + p.event_stream_id.len())
                    + UUID_LEN * 2
                    + 8
                    + (2 + p.event_type.len())
                    + (4 + p.data.len())
                    + (4 + p.metadata.len())
            }
            LogRecord::Commit(_) => 8 + 8 + UUID_LEN + 8,
            LogRecord::System(s) => 8 + 1 + (4 + s.data.len()),
        }
}

/// Encode a record into a standalone frame
pub fn encode(record: &LogRecord) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(payload_len(record) + FRAME_OVERHEAD);
    encode_into(record, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the frame of a record to `buf`
pub fn encode_into(record: &LogRecord, buf: &mut BytesMut) -> Result<(), CodecError> {
    let len = payload_len(record);
    if len > MAX_RECORD_SIZE {
        return Err(CodecError::FieldTooLong {
            field: "record",
            len,
            max: MAX_RECORD_SIZE,
        });
    }
    let len = len as i32;

    buf.reserve(len as usize + FRAME_OVERHEAD);
    buf.put_i32_le(len);
    buf.put_u8(record.record_type() as u8);
    buf.put_u8(RECORD_FORMAT_VERSION);
    buf.put_i64_le(record.log_position());

    match record {
        LogRecord::Prepare(p) => {
            buf.put_u16_le(p.flags.bits());
            buf.put_i64_le(p.transaction_position);
            buf.put_i32_le(p.transaction_offset);
            buf.put_i64_le(p.expected_version);
            put_str(buf, "event_stream_id", &p.event_stream_id)?;
            buf.put_slice(p.event_id.as_bytes());
            buf.put_slice(p.correlation_id.as_bytes());
            buf.put_i64_le(p.timestamp_millis);
            put_str(buf, "event_type", &p.event_type)?;
            put_blob(buf, &p.data);
            put_blob(buf, &p.metadata);
        }
        LogRecord::Commit(c) => {
            buf.put_i64_le(c.transaction_position);
            buf.put_i64_le(c.first_event_number);
            buf.put_slice(c.correlation_id.as_bytes());
            buf.put_i64_le(c.timestamp_millis);
        }
        LogRecord::System(s) => {
            buf.put_i64_le(s.timestamp_millis);
            buf.put_u8(s.system_record_type as u8);
            put_blob(buf, &s.data);
        }
    }

    buf.put_i32_le(len);
    Ok(())
}

/// Validate a length prefix/suffix and return the full frame size
pub fn frame_size(length: i32) -> Result<usize, CodecError> {
    if length <= 0 || length as usize > MAX_RECORD_SIZE {
        return Err(CodecError::InvalidLength(length));
    }
    Ok(length as usize + FRAME_OVERHEAD)
}

/// Read a little-endian length field
pub fn read_length(bytes: &[u8]) -> Result<i32, CodecError> {
    if bytes.len() < LENGTH_SIZE {
        return Err(CodecError::truncated(LENGTH_SIZE, bytes.len()));
    }
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode exactly one frame
///
/// Fails when the prefix and suffix disagree, when the frame is shorter
/// or longer than its prefix claims, or when a field is malformed.
pub fn decode(frame: &[u8]) -> Result<LogRecord, CodecError> {
    let prefix = read_length(frame)?;
    let size = frame_size(prefix)?;
    if frame.len() < size {
        return Err(CodecError::truncated(size, frame.len()));
    }
    if frame.len() > size {
        return Err(CodecError::TrailingBytes(frame.len() - size));
    }
    let suffix = read_length(&frame[size - LENGTH_SIZE..])?;
    if prefix != suffix {
        return Err(CodecError::LengthMismatch { prefix, suffix });
    }
    decode_payload(&frame[LENGTH_SIZE..size - LENGTH_SIZE])
}

/// Decode a payload stripped of its length prefix and suffix
pub fn decode_payload(payload: &[u8]) -> Result<LogRecord, CodecError> {
    let mut reader = PayloadReader::new(payload);

    let tag = reader.u8()?;
    let record_type = RecordType::from_u8(tag).ok_or(CodecError::UnknownRecordType(tag))?;
    let version = reader.u8()?;
    if version != RECORD_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion {
            record_type: tag,
            version,
        });
    }
    let log_position = reader.i64()?;

    let record = match record_type {
        RecordType::Prepare => LogRecord::Prepare(PrepareLogRecord {
            log_position,
            flags: PrepareFlags::from_bits(reader.u16()?),
            transaction_position: reader.i64()?,
            transaction_offset: reader.i32()?,
            expected_version: reader.i64()?,
            event_stream_id: reader.string("event_stream_id")?,
            event_id: reader.uuid()?,
            correlation_id: reader.uuid()?,
            timestamp_millis: reader.i64()?,
            event_type: reader.string("event_type")?,
            data: reader.blob()?,
            metadata: reader.blob()?,
        }),
        RecordType::Commit => LogRecord::Commit(CommitLogRecord {
            log_position,
            transaction_position: reader.i64()?,
            first_event_number: reader.i64()?,
            correlation_id: reader.uuid()?,
            timestamp_millis: reader.i64()?,
        }),
        RecordType::System => LogRecord::System(SystemLogRecord {
            log_position,
            timestamp_millis: reader.i64()?,
            system_record_type: SystemRecordType::from_u8(reader.u8()?)?,
            data: reader.blob()?,
        }),
    };

    reader.finish()?;
    Ok(record)
}

fn put_str(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.len() > u16::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field,
            len: value.len(),
            max: u16::MAX as usize,
        });
    }
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, value: &[u8]) {
    buf.put_i32_le(value.len() as i32);
    buf.put_slice(value);
}

/// Bounds-checked cursor over a record payload
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::truncated(n, self.buf.remaining()));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn uuid(&mut self) -> Result<Uuid, CodecError> {
        self.need(UUID_LEN)?;
        let mut bytes = [0u8; UUID_LEN];
        self.buf.copy_to_slice(&mut bytes);
        Ok(Uuid::from_bytes(bytes))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8(field))
    }

    fn blob(&mut self) -> Result<Bytes, CodecError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(CodecError::InvalidLength(len));
        }
        Ok(Bytes::copy_from_slice(self.take(len as usize)?))
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.buf.len()))
        }
    }
}
