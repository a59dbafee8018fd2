//! Checkpoint-gated log reader
//!
//! A [`LogReader`] is a cursor over the whole log. It is bound to the
//! writer checkpoint and optionally to the replication checkpoint:
//!
//! - a record is inside the writer gate when its post-position does not
//!   exceed the writer checkpoint;
//! - a record is inside the replication gate when its pre-position does
//!   not exceed the replication checkpoint. A replication checkpoint of
//!   `-1` leaves the gate open.
//!
//! Reads past either gate report [`ReadFailure::OutOfBounds`], the same as
//! reading past the end of the log.

use std::sync::Arc;

use chunklog_core::LogPosition;
use tracing::trace;

use crate::checkpoint::Checkpoint;
use crate::chunk::Chunk;
use crate::db::ChunkDb;
use crate::error::StorageError;
use crate::results::{ReadFailure, RecordReadResult, SeqReadResult};

/// Resumable cursor over the log
#[derive(Debug)]
pub struct LogReader {
    db: Arc<ChunkDb>,
    writer_checkpoint: Arc<dyn Checkpoint>,
    replication_checkpoint: Option<Arc<dyn Checkpoint>>,
    position: LogPosition,
}

impl LogReader {
    pub fn new(
        db: Arc<ChunkDb>,
        writer_checkpoint: Arc<dyn Checkpoint>,
        replication_checkpoint: Option<Arc<dyn Checkpoint>>,
        start: LogPosition,
    ) -> Self {
        Self {
            db,
            writer_checkpoint,
            replication_checkpoint,
            position: start,
        }
    }

    /// Current cursor position
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Move the cursor to an arbitrary position
    pub fn reposition(&mut self, position: LogPosition) {
        self.position = position;
    }

    fn is_visible(&self, pre: LogPosition, post: LogPosition) -> bool {
        if post > self.writer_checkpoint.read() {
            return false;
        }
        match &self.replication_checkpoint {
            Some(chk) => {
                let replicated = chk.read();
                replicated < 0 || pre <= replicated
            }
            None => true,
        }
    }

    fn chunk_for(&self, position: LogPosition) -> Option<Arc<Chunk>> {
        self.db.manager().get_chunk_for(position)
    }

    /// Read the record starting exactly at `position`
    pub fn try_read_at(&self, position: LogPosition) -> Result<RecordReadResult, StorageError> {
        if position < 0 || position >= self.writer_checkpoint.read() {
            return Ok(RecordReadResult::out_of_bounds());
        }
        let Some(chunk) = self.chunk_for(position) else {
            return Ok(RecordReadResult::out_of_bounds());
        };

        let result = chunk.try_read_at(position - chunk.chunk_start_position())?;
        if let Some(record) = &result.record {
            if !self.is_visible(position, position + record.size_on_disk()) {
                return Ok(RecordReadResult::out_of_bounds());
            }
        }
        Ok(result)
    }

    /// Read the record at the cursor and advance past it
    ///
    /// Reaching the end of a completed chunk continues at the next chunk.
    /// A failed read leaves the cursor where it was.
    pub fn try_read_next(&mut self) -> Result<SeqReadResult, StorageError> {
        let mut position = self.position;
        loop {
            if position < 0 || position >= self.writer_checkpoint.read() {
                return Ok(SeqReadResult::out_of_bounds());
            }
            let Some(chunk) = self.chunk_for(position) else {
                return Ok(SeqReadResult::out_of_bounds());
            };
            let start = chunk.chunk_start_position();

            match chunk.try_read_closest_forward(position - start)? {
                Ok(read) => {
                    let (pre, post) = (start + read.pre, start + read.post);
                    if !self.is_visible(pre, post) {
                        return Ok(SeqReadResult::out_of_bounds());
                    }
                    self.position = post;
                    return Ok(SeqReadResult::found(read.record, pre, post));
                }
                Err(ReadFailure::OutOfBounds) if chunk.is_completed() => {
                    trace!(chunk = chunk.number(), "Forward read crossing chunk end");
                    position = chunk.chunk_end_position();
                }
                Err(failure) => return Ok(SeqReadResult::failed(failure)),
            }
        }
    }

    /// Read the record ending at the cursor and step back onto its start
    ///
    /// The cursor steps over every record it parses, including records
    /// outside the gates; those are reported as failures. A corrupt record
    /// or the start of the log leaves the cursor where it was.
    pub fn try_read_prev(&mut self) -> Result<SeqReadResult, StorageError> {
        loop {
            let position = self.position;
            if position <= 0 {
                return Ok(SeqReadResult::out_of_bounds());
            }
            let Some(chunk) = self.chunk_for(position - 1) else {
                return Ok(SeqReadResult::out_of_bounds());
            };
            let start = chunk.chunk_start_position();

            match chunk.try_read_closest_backward(position - start)? {
                Ok(read) => {
                    let (pre, post) = (start + read.pre, start + read.post);
                    self.position = pre;
                    if !self.is_visible(pre, post) {
                        return Ok(SeqReadResult::out_of_bounds());
                    }
                    return Ok(SeqReadResult::found(read.record, pre, post));
                }
                Err(ReadFailure::OutOfBounds) => {
                    trace!(chunk = chunk.number(), "Backward read crossing chunk start");
                    self.position = start;
                }
                Err(failure) => return Ok(SeqReadResult::failed(failure)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkDbConfig;
    use chunklog_core::{ExpectedVersion, LogRecord};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_db(temp: &TempDir) -> Arc<ChunkDb> {
        let config = ChunkDbConfig::builder(temp.path())
            .chunk_size(4096)
            .in_memory_checkpoints()
            .build()
            .unwrap();
        Arc::new(ChunkDb::open(config).unwrap())
    }

    fn record(position: i64) -> LogRecord {
        LogRecord::single_write(
            position,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "es1",
            ExpectedVersion::ANY,
            "et1",
            vec![0u8; 100],
            Vec::new(),
        )
    }

    fn write_two(db: &ChunkDb) -> (LogRecord, LogRecord) {
        let chunk = db.manager().get_chunk(0).unwrap();
        let first = record(0);
        let second = record(first.next_position());
        chunk.try_append(&first).unwrap();
        chunk.try_append(&second).unwrap();
        (first, second)
    }

    #[test]
    fn test_writer_gate_hides_unflushed_records() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp);
        let (first, second) = write_two(&db);
        db.writer_checkpoint().write(first.next_position());

        let reader = db.reader(0);
        assert!(reader.try_read_at(0).unwrap().success);
        assert!(!reader.try_read_at(second.log_position()).unwrap().success);
    }

    #[test]
    fn test_failed_forward_read_keeps_cursor() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp);
        let (first, _) = write_two(&db);
        db.writer_checkpoint().write(first.next_position());

        let mut reader = db.reader(0);
        assert!(reader.try_read_next().unwrap().success);
        assert_eq!(reader.position(), first.next_position());
        assert!(!reader.try_read_next().unwrap().success);
        assert_eq!(reader.position(), first.next_position());
    }

    #[test]
    fn test_unset_replication_checkpoint_leaves_gate_open() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp);
        let (_, second) = write_two(&db);
        db.writer_checkpoint().write(second.next_position());
        assert_eq!(db.replication_checkpoint().read(), -1);

        let reader = db.replicated_reader(0);
        assert!(reader.try_read_at(second.log_position()).unwrap().success);

        db.replication_checkpoint().write(0);
        assert!(reader.try_read_at(0).unwrap().success);
        assert!(!reader.try_read_at(second.log_position()).unwrap().success);
    }

    #[test]
    fn test_backward_read_stops_at_log_start() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp);
        let (_, second) = write_two(&db);
        db.writer_checkpoint().write(second.next_position());

        let mut reader = db.reader(second.next_position());
        assert_eq!(reader.try_read_prev().unwrap().record.unwrap(), second);
        assert!(reader.try_read_prev().unwrap().success);
        assert_eq!(reader.position(), 0);
        assert!(!reader.try_read_prev().unwrap().success);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_reposition_resumes_mid_log() {
        let temp = TempDir::new().unwrap();
        let db = open_db(&temp);
        let (_, second) = write_two(&db);
        db.writer_checkpoint().write(second.next_position());

        let mut reader = db.reader(0);
        reader.reposition(second.log_position());
        let res = reader.try_read_next().unwrap();
        assert_eq!(res.record.unwrap(), second);
        assert_eq!(res.record_pre_position, second.log_position());
        assert_eq!(res.record_post_position, second.next_position());
    }
}
