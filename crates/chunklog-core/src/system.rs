//! System records
//!
//! System records mark control points in the log (currently only epochs)
//! and are never subject to stream retention.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::record::LogPosition;

/// Kind of a system record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemRecordType {
    Epoch = 0,
}

impl SystemRecordType {
    pub fn from_u8(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Epoch),
            other => Err(CodecError::UnknownSystemRecordType(other)),
        }
    }
}

/// Leadership epoch marker written by the node that owns the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch_number: i32,
    pub epoch_id: Uuid,
    /// Position of the previous epoch record, -1 for the first epoch
    pub prev_epoch_position: LogPosition,
}

impl EpochRecord {
    /// Encoded size of an epoch payload
    pub const SIZE: usize = 4 + 16 + 8;

    pub fn new(epoch_number: i32, prev_epoch_position: LogPosition) -> Self {
        Self {
            epoch_number,
            epoch_id: Uuid::new_v4(),
            prev_epoch_position,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_i32_le(self.epoch_number);
        buf.put_slice(self.epoch_id.as_bytes());
        buf.put_i64_le(self.prev_epoch_position);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != Self::SIZE {
            return Err(CodecError::truncated(Self::SIZE, data.len()));
        }
        let epoch_number = data.get_i32_le();
        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);
        let prev_epoch_position = data.get_i64_le();
        Ok(Self {
            epoch_number,
            epoch_id: Uuid::from_bytes(id),
            prev_epoch_position,
        })
    }
}
