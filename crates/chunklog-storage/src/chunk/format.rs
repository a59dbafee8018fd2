//! Chunk header, footer and position map layouts
//!
//! ```text
//! [header: 128][data ...][position map (scavenged only)][footer: 128]
//! ```
//!
//! The footer is always the last [`FOOTER_SIZE`] bytes of the file.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use chunklog_core::LogPosition;

pub const HEADER_SIZE: usize = 128;
pub const FOOTER_SIZE: usize = 128;
pub const POS_MAP_ENTRY_SIZE: usize = 8;
pub const HASH_SIZE: usize = 32;

const FILE_TYPE_CHUNK: u8 = 1;
const CHUNK_FORMAT_VERSION: u8 = 1;

const FOOTER_FLAG_COMPLETED: u8 = 0x01;
const FOOTER_FLAG_HAS_MAP: u8 = 0x02;

/// Fixed chunk header written at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_size: i32,
    pub chunk_number: i32,
    pub chunk_version: i32,
    pub is_scavenged: bool,
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    pub fn new(chunk_size: i32, chunk_number: i32, chunk_version: i32, is_scavenged: bool) -> Self {
        Self {
            chunk_size,
            chunk_number,
            chunk_version,
            is_scavenged,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// First global position covered by the chunk
    pub fn chunk_start_position(&self) -> LogPosition {
        self.chunk_number as i64 * self.chunk_size as i64
    }

    /// Global position one past the chunk's coverage
    pub fn chunk_end_position(&self) -> LogPosition {
        (self.chunk_number as i64 + 1) * self.chunk_size as i64
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(FILE_TYPE_CHUNK);
        buf.put_u8(CHUNK_FORMAT_VERSION);
        buf.put_i32_le(self.chunk_size);
        buf.put_i32_le(self.chunk_number);
        buf.put_i32_le(self.chunk_version);
        buf.put_u8(self.is_scavenged as u8);
        buf.put_slice(self.chunk_id.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("header truncated to {} bytes", bytes.len()));
        }
        let mut buf = &bytes[..HEADER_SIZE];
        let file_type = buf.get_u8();
        if file_type != FILE_TYPE_CHUNK {
            return Err(format!("unexpected file type {}", file_type));
        }
        let version = buf.get_u8();
        if version != CHUNK_FORMAT_VERSION {
            return Err(format!("unsupported chunk format version {}", version));
        }
        let chunk_size = buf.get_i32_le();
        let chunk_number = buf.get_i32_le();
        let chunk_version = buf.get_i32_le();
        let is_scavenged = buf.get_u8() != 0;
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);

        if chunk_size <= 0 || chunk_number < 0 || chunk_version < 0 {
            return Err(format!(
                "invalid header values: size {}, number {}, version {}",
                chunk_size, chunk_number, chunk_version
            ));
        }

        Ok(Self {
            chunk_size,
            chunk_number,
            chunk_version,
            is_scavenged,
            chunk_id: Uuid::from_bytes(id),
        })
    }
}

/// Footer written when a chunk is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    pub has_map: bool,
    /// Bytes of record data actually stored
    pub physical_data_size: i32,
    /// Local position range covered by the records, `[0, logical_data_size)`
    pub logical_data_size: i64,
    pub map_size: i32,
    pub hash: [u8; HASH_SIZE],
}

impl ChunkFooter {
    pub fn map_count(&self) -> usize {
        self.map_size as usize / POS_MAP_ENTRY_SIZE
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut flags = 0u8;
        if self.is_completed {
            flags |= FOOTER_FLAG_COMPLETED;
        }
        if self.has_map {
            flags |= FOOTER_FLAG_HAS_MAP;
        }

        let mut out = [0u8; FOOTER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(flags);
        buf.put_i32_le(self.physical_data_size);
        buf.put_i64_le(self.logical_data_size);
        buf.put_i32_le(self.map_size);
        buf.put_slice(&self.hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < FOOTER_SIZE {
            return Err(format!("footer truncated to {} bytes", bytes.len()));
        }
        let mut buf = &bytes[..FOOTER_SIZE];
        let flags = buf.get_u8();
        let physical_data_size = buf.get_i32_le();
        let logical_data_size = buf.get_i64_le();
        let map_size = buf.get_i32_le();
        let mut hash = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut hash);

        let footer = Self {
            is_completed: flags & FOOTER_FLAG_COMPLETED != 0,
            has_map: flags & FOOTER_FLAG_HAS_MAP != 0,
            physical_data_size,
            logical_data_size,
            map_size,
            hash,
        };

        if footer.is_completed
            && (physical_data_size < 0
                || logical_data_size < 0
                || map_size < 0
                || map_size as usize % POS_MAP_ENTRY_SIZE != 0)
        {
            return Err(format!("invalid footer values: {:?}", footer));
        }
        Ok(footer)
    }
}

/// Maps a record's chunk-local log position to its offset in a scavenged chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMapEntry {
    pub log_pos: i32,
    pub actual_pos: i32,
}

impl PosMapEntry {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.log_pos);
        buf.put_i32_le(self.actual_pos);
    }

    pub fn decode_all(mut bytes: &[u8]) -> Vec<Self> {
        let mut entries = Vec::with_capacity(bytes.len() / POS_MAP_ENTRY_SIZE);
        while bytes.remaining() >= POS_MAP_ENTRY_SIZE {
            entries.push(Self {
                log_pos: bytes.get_i32_le(),
                actual_pos: bytes.get_i32_le(),
            });
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ChunkHeader::new(4096, 7, 2, true);
        let decoded = ChunkHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.chunk_start_position(), 7 * 4096);
        assert_eq!(decoded.chunk_end_position(), 8 * 4096);
    }

    #[test]
    fn test_header_rejects_foreign_bytes() {
        assert!(ChunkHeader::decode(&[0u8; HEADER_SIZE]).is_err());
        assert!(ChunkHeader::decode(&[1u8; 10]).is_err());
    }

    #[test]
    fn test_unwritten_footer_is_not_completed() {
        let footer = ChunkFooter::decode(&[0u8; FOOTER_SIZE]).unwrap();
        assert!(!footer.is_completed);
    }

    #[test]
    fn test_footer_layout() {
        let footer = ChunkFooter {
            is_completed: true,
            has_map: true,
            physical_data_size: 1000,
            logical_data_size: 3900,
            map_size: 24,
            hash: [9u8; HASH_SIZE],
        };
        let decoded = ChunkFooter::decode(&footer.encode()).unwrap();
        assert_eq!(decoded, footer);
        assert_eq!(decoded.map_count(), 3);
    }

    #[test]
    fn test_pos_map_entries() {
        let mut buf = Vec::new();
        PosMapEntry { log_pos: 0, actual_pos: 0 }.put(&mut buf);
        PosMapEntry { log_pos: 2600, actual_pos: 1300 }.put(&mut buf);
        let entries = PosMapEntry::decode_all(&buf);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].log_pos, 2600);
        assert_eq!(entries[1].actual_pos, 1300);
    }
}
