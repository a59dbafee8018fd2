//! Append path
//!
//! A [`ChunkWriter`] is the single writer of a database. It appends to the
//! active chunk, rolls over to a new chunk when a record does not fit, and
//! advances the writer checkpoint. The checkpoint is only made durable by
//! [`ChunkWriter::flush`], after the chunk data itself.

use std::sync::Arc;

use chunklog_core::{EpochRecord, LogPosition, LogRecord};
use tracing::{debug, info};

use crate::chunk::Chunk;
use crate::db::ChunkDb;
use crate::error::StorageError;
use crate::results::RecordWriteResult;

/// The single writer of a [`ChunkDb`]
#[derive(Debug)]
pub struct ChunkWriter {
    db: Arc<ChunkDb>,
    active: Arc<Chunk>,
}

impl ChunkWriter {
    /// Claim the database's writer slot
    pub fn new(db: Arc<ChunkDb>) -> Result<Self, StorageError> {
        db.claim_writer()?;
        let active = match db.manager().last_chunk() {
            Some(chunk) if !chunk.is_completed() => chunk,
            _ => {
                db.release_writer();
                return Err(StorageError::invalid_state("database has no active chunk"));
            }
        };
        Ok(Self { db, active })
    }

    /// Global position the next record will be written at
    pub fn position(&self) -> LogPosition {
        self.db.writer_checkpoint().read()
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    /// Write a record built for the current position
    ///
    /// When the record does not fit, the active chunk is completed and a new
    /// one opened; the result is unsuccessful and its `new_position` is where
    /// the caller must rebuild the record.
    pub fn write(&mut self, record: &LogRecord) -> Result<RecordWriteResult, StorageError> {
        let position = self.position();
        if record.log_position() != position {
            return Err(StorageError::invalid_state(format!(
                "record positioned at {} but writer is at {}",
                record.log_position(),
                position
            )));
        }
        let chunk_size = self.active.chunk_size();
        if record.size_on_disk() > chunk_size as i64 {
            return Err(StorageError::RecordTooLarge {
                size: record.size_on_disk(),
                chunk_size,
            });
        }

        let start = self.active.chunk_start_position();
        let local = self.active.try_append(record)?;
        if local.success {
            let post = start + local.new_position;
            self.db.writer_checkpoint().write(post);
            return Ok(RecordWriteResult::successful(position, post));
        }

        debug!(
            chunk = self.active.number(),
            size = record.size_on_disk(),
            "Record does not fit, rolling over"
        );
        self.complete_chunk()?;
        Ok(RecordWriteResult {
            success: false,
            old_position: position,
            new_position: self.position(),
        })
    }

    /// Append a record built at the writer position, rolling over if needed
    ///
    /// `build` is called with the position the record will occupy, and
    /// called again with the next chunk's start after a rollover.
    pub fn append<F>(&mut self, build: F) -> Result<RecordWriteResult, StorageError>
    where
        F: Fn(LogPosition) -> LogRecord,
    {
        let result = self.write(&build(self.position()))?;
        if result.success {
            return Ok(result);
        }
        let record = build(result.new_position);
        let retry = self.write(&record)?;
        if !retry.success {
            return Err(StorageError::RecordTooLarge {
                size: record.size_on_disk(),
                chunk_size: self.active.chunk_size(),
            });
        }
        Ok(retry)
    }

    /// Make appended records and the writer checkpoint durable
    pub fn flush(&self) -> Result<(), StorageError> {
        self.active.flush()?;
        self.db.writer_checkpoint().flush()
    }

    /// Seal the active chunk and continue in a new one
    pub fn complete_chunk(&mut self) -> Result<(), StorageError> {
        self.active.complete()?;
        self.db
            .writer_checkpoint()
            .write(self.active.chunk_end_position());
        self.db.writer_checkpoint().flush()?;
        self.active = self.db.manager().add_new_chunk()?;
        Ok(())
    }

    /// Append an epoch record and point the epoch checkpoint at it
    pub fn write_epoch(&mut self, epoch_number: i32) -> Result<(LogPosition, EpochRecord), StorageError> {
        let epoch_checkpoint = self.db.config().epoch_checkpoint.clone();
        let epoch = EpochRecord::new(epoch_number, epoch_checkpoint.read());
        let result = self.append(|position| LogRecord::epoch(position, &epoch))?;
        self.flush()?;
        epoch_checkpoint.write(result.old_position);
        epoch_checkpoint.flush()?;

        info!(epoch = epoch_number, position = result.old_position, "Wrote epoch");
        Ok((result.old_position, epoch))
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.db.release_writer();
    }
}
