//! Chunk database
//!
//! Opening a database reconciles the chunk files on disk with the writer
//! checkpoint: every chunk below the checkpoint must be present and
//! completed, the chunk holding the checkpoint is reopened for appends,
//! and anything written past the checkpoint is discarded.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chunklog_core::LogPosition;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::chunk::Chunk;
use crate::config::ChunkDbConfig;
use crate::error::StorageError;
use crate::manager::ChunkManager;
use crate::reader::LogReader;

/// An open chunk database
#[derive(Debug)]
pub struct ChunkDb {
    config: ChunkDbConfig,
    manager: ChunkManager,
    writer_claimed: AtomicBool,
    closed: AtomicBool,
}

impl ChunkDb {
    /// Open (or create) the database described by `config`
    ///
    /// On failure every chunk opened so far is released before returning.
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub fn open(config: ChunkDbConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.path)?;

        for temp in config.naming.all_temp_files()? {
            warn!(path = %temp.display(), "Removing leftover scavenge file");
            fs::remove_file(&temp)?;
        }

        let chunk_size = config.chunk_size as i64;
        let writer_position = config.writer_checkpoint.read();
        if writer_position < config.start_position() {
            return Err(StorageError::corrupt_database(format!(
                "writer checkpoint {} is before the first chunk at {}",
                writer_position,
                config.start_position()
            )));
        }

        let manager = ChunkManager::new(&config);
        let last_number = i32::try_from(writer_position / chunk_size).map_err(|_| {
            StorageError::corrupt_database(format!(
                "writer checkpoint {} is beyond the addressable chunk range",
                writer_position
            ))
        })?;

        for number in config.chunk_number_offset..last_number {
            let path = latest_version(&config, number)?.ok_or_else(|| {
                StorageError::corrupt_database(format!(
                    "chunk {} is missing below writer checkpoint {}",
                    number, writer_position
                ))
            })?;
            let chunk = Chunk::open_completed(&path, config.verify_hashes)?;
            manager.add_chunk(chunk)?;
        }

        let mut next_free = last_number + 1;
        match latest_version(&config, last_number)? {
            Some(path) if Chunk::is_completed_file(&path)? => {
                let chunk = Chunk::open_completed(&path, config.verify_hashes)?;
                manager.add_chunk(chunk)?;
                let fresh = manager.add_new_chunk()?;
                next_free += 1;
                config.writer_checkpoint.write(fresh.chunk_start_position());
                config.writer_checkpoint.flush()?;
                info!(
                    position = fresh.chunk_start_position(),
                    "Writer checkpoint moved past completed chunk"
                );
            }
            Some(path) => {
                let chunk = Chunk::open_ongoing(&path, writer_position % chunk_size)?;
                manager.add_chunk(chunk)?;
            }
            None => {
                if writer_position % chunk_size != 0 {
                    return Err(StorageError::corrupt_database(format!(
                        "chunk {} holding writer checkpoint {} is missing",
                        last_number, writer_position
                    )));
                }
                manager.add_new_chunk()?;
            }
        }

        remove_chunks_from(&config, next_free)?;

        let writer_position = config.writer_checkpoint.read();
        for checkpoint in [&config.replication_checkpoint, &config.chaser_checkpoint] {
            if checkpoint.read() > writer_position {
                warn!(
                    name = checkpoint.name(),
                    value = checkpoint.read(),
                    writer = writer_position,
                    "Checkpoint ahead of writer checkpoint, clamping"
                );
                checkpoint.write(writer_position);
                checkpoint.flush()?;
            }
        }

        info!(
            chunks = manager.chunk_count(),
            writer_checkpoint = writer_position,
            "Opened chunk database"
        );

        Ok(Self {
            config,
            manager,
            writer_claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ChunkDbConfig {
        &self.config
    }

    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    pub fn writer_checkpoint(&self) -> &Arc<dyn Checkpoint> {
        &self.config.writer_checkpoint
    }

    pub fn replication_checkpoint(&self) -> &Arc<dyn Checkpoint> {
        &self.config.replication_checkpoint
    }

    /// Reader bounded by the writer checkpoint alone
    pub fn reader(self: &Arc<Self>, start: LogPosition) -> LogReader {
        LogReader::new(self.clone(), self.config.writer_checkpoint.clone(), None, start)
    }

    /// Reader bounded by both the writer and replication checkpoints
    pub fn replicated_reader(self: &Arc<Self>, start: LogPosition) -> LogReader {
        LogReader::new(
            self.clone(),
            self.config.writer_checkpoint.clone(),
            Some(self.config.replication_checkpoint.clone()),
            start,
        )
    }

    /// Claim the single writer slot
    pub(crate) fn claim_writer(&self) -> Result<(), StorageError> {
        if self.writer_claimed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::invalid_state("a writer is already open"));
        }
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        self.writer_claimed.store(false, Ordering::Release);
    }

    /// Flush the active chunk and every checkpoint, then release the chunks
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(last) = self.manager.last_chunk() {
            if !last.is_completed() {
                last.flush()?;
            }
        }
        for checkpoint in self.config.checkpoints() {
            checkpoint.flush()?;
        }
        self.manager.clear();
        info!(path = %self.config.path.display(), "Closed chunk database");
        Ok(())
    }
}

impl Drop for ChunkDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close chunk database cleanly");
        }
    }
}

fn latest_version(config: &ChunkDbConfig, number: i32) -> Result<Option<PathBuf>, StorageError> {
    let mut versions = config.naming.all_versions_for(number)?.into_iter();
    let latest = versions.next();
    for stale in versions {
        debug!(chunk = number, path = %stale.display(), "Removing superseded chunk version");
        fs::remove_file(&stale)?;
    }
    Ok(latest)
}

/// Delete chunk files at or past `number`; they hold no checkpointed data
fn remove_chunks_from(config: &ChunkDbConfig, number: i32) -> Result<(), StorageError> {
    for path in config.naming.all_present_files()? {
        if let Some((n, _)) = config.naming.parse(&path) {
            if n >= number {
                warn!(chunk = n, path = %path.display(), "Removing chunk beyond writer checkpoint");
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklog_core::{ExpectedVersion, LogRecord};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn config(temp: &TempDir) -> ChunkDbConfig {
        ChunkDbConfig::builder(temp.path())
            .chunk_size(4096)
            .verify_hashes(true)
            .build()
            .unwrap()
    }

    fn record(position: i64) -> LogRecord {
        LogRecord::single_write(
            position,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "es1",
            ExpectedVersion::ANY,
            "et1",
            vec![0u8; 1200],
            vec![5u8, 7],
        )
    }

    #[test]
    fn test_fresh_database_has_one_active_chunk() {
        let temp = TempDir::new().unwrap();
        let db = ChunkDb::open(config(&temp)).unwrap();
        assert_eq!(db.manager().chunk_count(), 1);
        let chunk = db.manager().get_chunk(0).unwrap();
        assert!(!chunk.is_completed());
        assert!(temp.path().join("chunk-000000.000000").exists());
    }

    #[test]
    fn test_reopen_resumes_active_chunk() {
        let temp = TempDir::new().unwrap();
        let first = record(0);
        {
            let db = ChunkDb::open(config(&temp)).unwrap();
            let chunk = db.manager().get_chunk(0).unwrap();
            let res = chunk.try_append(&first).unwrap();
            chunk.flush().unwrap();
            db.writer_checkpoint().write(res.new_position);
            db.close().unwrap();
        }

        let db = ChunkDb::open(config(&temp)).unwrap();
        let chunk = db.manager().get_chunk(0).unwrap();
        assert!(!chunk.is_completed());
        assert_eq!(chunk.logical_data_size(), first.size_on_disk());
        assert_eq!(chunk.try_read_at(0).unwrap().record.unwrap(), first);
    }

    #[test]
    fn test_reopen_after_completed_chunk_starts_fresh_chunk() {
        let temp = TempDir::new().unwrap();
        {
            let db = ChunkDb::open(config(&temp)).unwrap();
            let chunk = db.manager().get_chunk(0).unwrap();
            let res = chunk.try_append(&record(0)).unwrap();
            chunk.complete().unwrap();
            db.writer_checkpoint().write(res.new_position);
        }

        let db = ChunkDb::open(config(&temp)).unwrap();
        assert_eq!(db.manager().chunk_count(), 2);
        assert!(db.manager().get_chunk(0).unwrap().is_completed());
        assert_eq!(db.writer_checkpoint().read(), 4096);
    }

    #[test]
    fn test_missing_chunk_below_checkpoint_is_corruption() {
        let temp = TempDir::new().unwrap();
        {
            let db = ChunkDb::open(config(&temp)).unwrap();
            db.manager().get_chunk(0).unwrap().complete().unwrap();
            db.manager().add_new_chunk().unwrap();
            db.writer_checkpoint().write(4096 + 100);
        }
        fs::remove_file(temp.path().join("chunk-000000.000000")).unwrap();

        let err = ChunkDb::open(config(&temp)).unwrap_err();
        assert!(matches!(err, StorageError::CorruptDatabase(_)));
    }

    #[test]
    fn test_open_cleans_leftovers() {
        let temp = TempDir::new().unwrap();
        {
            let db = ChunkDb::open(config(&temp)).unwrap();
            db.manager().get_chunk(0).unwrap().complete().unwrap();
            db.manager().add_new_chunk().unwrap();
            db.writer_checkpoint().write(4096);
        }
        let leftover_temp = temp.path().join("abc.scavenge.tmp");
        fs::write(&leftover_temp, b"partial").unwrap();
        let beyond = temp.path().join("chunk-000007.000000");
        fs::write(&beyond, b"").unwrap();

        let db = ChunkDb::open(config(&temp)).unwrap();
        assert_eq!(db.manager().chunk_count(), 2);
        assert!(!leftover_temp.exists());
        assert!(!beyond.exists());
    }

    #[test]
    fn test_replication_checkpoint_clamped_to_writer() {
        let temp = TempDir::new().unwrap();
        let config = ChunkDbConfig::builder(temp.path())
            .chunk_size(4096)
            .in_memory_checkpoints()
            .build()
            .unwrap();
        config.replication_checkpoint.write(10_000);
        let db = ChunkDb::open(config).unwrap();
        assert_eq!(db.replication_checkpoint().read(), 0);
    }

    #[test]
    fn test_single_writer_slot() {
        let temp = TempDir::new().unwrap();
        let db = ChunkDb::open(config(&temp)).unwrap();
        db.claim_writer().unwrap();
        assert!(db.claim_writer().is_err());
        db.release_writer();
        db.claim_writer().unwrap();
    }
}
