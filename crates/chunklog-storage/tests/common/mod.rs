//! Shared helpers for chunklog-storage integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chunklog_core::{
    ExpectedVersion, LogPosition, LogRecord, PrepareFlags, PrepareLogRecord, StreamMetadata,
};
use chunklog_storage::{ChunkDb, ChunkDbConfig, ChunkWriter};
use tempfile::TempDir;
use uuid::Uuid;

pub const CHUNK_SIZE: i32 = 4096;

/// Open a database with in-memory checkpoints in a fresh directory
pub fn open_db(chunk_size: i32) -> (TempDir, Arc<ChunkDb>) {
    let temp = TempDir::new().unwrap();
    let db = open_db_in(&temp, chunk_size);
    (temp, db)
}

pub fn open_db_in(temp: &TempDir, chunk_size: i32) -> Arc<ChunkDb> {
    let config = ChunkDbConfig::builder(temp.path())
        .chunk_size(chunk_size)
        .in_memory_checkpoints()
        .build()
        .unwrap();
    Arc::new(ChunkDb::open(config).unwrap())
}

/// The 1300-byte single-write event used by the read tests
pub fn sample_event(position: LogPosition) -> LogRecord {
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

/// A record to lay out, with transactions named by small test-local ids
#[derive(Debug, Clone)]
pub enum Rec {
    Create {
        tx: u32,
        stream: &'static str,
        metadata: Option<StreamMetadata>,
    },
    Prepare {
        tx: u32,
        stream: &'static str,
    },
    Delete {
        tx: u32,
        stream: &'static str,
    },
    Commit {
        tx: u32,
        stream: &'static str,
    },
}

impl Rec {
    pub fn create(tx: u32, stream: &'static str) -> Self {
        Rec::Create {
            tx,
            stream,
            metadata: None,
        }
    }

    pub fn create_with(tx: u32, stream: &'static str, metadata: StreamMetadata) -> Self {
        Rec::Create {
            tx,
            stream,
            metadata: Some(metadata),
        }
    }

    pub fn prepare(tx: u32, stream: &'static str) -> Self {
        Rec::Prepare { tx, stream }
    }

    pub fn delete(tx: u32, stream: &'static str) -> Self {
        Rec::Delete { tx, stream }
    }

    pub fn commit(tx: u32, stream: &'static str) -> Self {
        Rec::Commit { tx, stream }
    }
}

/// Lays records out chunk by chunk, tracking transaction positions
pub struct DbCreationHelper {
    temp: TempDir,
    db: Arc<ChunkDb>,
    chunks: Vec<Vec<Rec>>,
}

/// A populated database and the records written to each chunk
pub struct DbResult {
    pub temp: TempDir,
    pub db: Arc<ChunkDb>,
    pub recs: Vec<Vec<LogRecord>>,
}

impl DbCreationHelper {
    pub fn new(chunk_size: i32) -> Self {
        let (temp, db) = open_db(chunk_size);
        Self {
            temp,
            db,
            chunks: Vec::new(),
        }
    }

    pub fn chunk(mut self, recs: &[Rec]) -> Self {
        self.chunks.push(recs.to_vec());
        self
    }

    /// Write every chunk; all but the last are completed
    pub fn create_db(self) -> DbResult {
        let mut writer = ChunkWriter::new(self.db.clone()).unwrap();
        let mut tx_positions: HashMap<u32, LogPosition> = HashMap::new();
        let mut tx_first_event: HashMap<u32, i64> = HashMap::new();
        let mut tx_offsets: HashMap<u32, i32> = HashMap::new();
        let mut stream_versions: HashMap<&'static str, i64> = HashMap::new();
        let mut recs = Vec::new();

        let chunk_count = self.chunks.len();
        for (i, chunk) in self.chunks.into_iter().enumerate() {
            let mut written = Vec::new();
            for rec in chunk {
                let position = writer.position();
                let record = match rec {
                    Rec::Create { tx, stream, metadata } => {
                        let mut flags = PrepareFlags::STREAM_CREATED;
                        flags |= begin_flag(&tx_positions, tx);
                        let mut prepare = prepare_at(position, &mut tx_positions, &mut tx_offsets, tx, stream, flags);
                        if let Some(metadata) = metadata {
                            prepare.metadata = metadata.to_json_bytes().into();
                            prepare.flags |= PrepareFlags::IS_JSON;
                        }
                        next_event(&mut stream_versions, &mut tx_first_event, tx, stream);
                        LogRecord::Prepare(prepare)
                    }
                    Rec::Prepare { tx, stream } => {
                        let flags = PrepareFlags::DATA | begin_flag(&tx_positions, tx);
                        let prepare = prepare_at(position, &mut tx_positions, &mut tx_offsets, tx, stream, flags);
                        next_event(&mut stream_versions, &mut tx_first_event, tx, stream);
                        LogRecord::Prepare(prepare)
                    }
                    Rec::Delete { tx, stream } => {
                        let flags = PrepareFlags::STREAM_DELETE
                            | PrepareFlags::TRANSACTION_END
                            | begin_flag(&tx_positions, tx);
                        let prepare = prepare_at(position, &mut tx_positions, &mut tx_offsets, tx, stream, flags);
                        next_event(&mut stream_versions, &mut tx_first_event, tx, stream);
                        LogRecord::Prepare(prepare)
                    }
                    Rec::Commit { tx, stream } => {
                        let tx_position = *tx_positions
                            .get(&tx)
                            .unwrap_or_else(|| panic!("commit for unknown transaction {} on {}", tx, stream));
                        let first = tx_first_event.get(&tx).copied().unwrap_or(0);
                        LogRecord::commit(position, Uuid::new_v4(), tx_position, first)
                    }
                };
                let result = writer.write(&record).unwrap();
                assert!(result.success, "record does not fit in its chunk");
                written.push(record);
            }
            if i + 1 < chunk_count {
                writer.complete_chunk().unwrap();
            }
            recs.push(written);
        }
        writer.flush().unwrap();
        drop(writer);

        DbResult {
            temp: self.temp,
            db: self.db,
            recs,
        }
    }
}

fn begin_flag(tx_positions: &HashMap<u32, LogPosition>, tx: u32) -> PrepareFlags {
    if tx_positions.contains_key(&tx) {
        PrepareFlags::NONE
    } else {
        PrepareFlags::TRANSACTION_BEGIN
    }
}

fn prepare_at(
    position: LogPosition,
    tx_positions: &mut HashMap<u32, LogPosition>,
    tx_offsets: &mut HashMap<u32, i32>,
    tx: u32,
    stream: &str,
    flags: PrepareFlags,
) -> PrepareLogRecord {
    let transaction_position = *tx_positions.entry(tx).or_insert(position);
    let offset = tx_offsets.entry(tx).or_insert(0);
    let transaction_offset = *offset;
    *offset += 1;

    PrepareLogRecord {
        log_position: position,
        flags,
        transaction_position,
        transaction_offset,
        expected_version: ExpectedVersion::ANY,
        event_stream_id: stream.to_string(),
        event_id: Uuid::new_v4(),
        correlation_id: Uuid::new_v4(),
        timestamp_millis: chrono::Utc::now().timestamp_millis(),
        event_type: "et".to_string(),
        data: vec![7u8; 16].into(),
        metadata: Default::default(),
    }
}

fn next_event(
    stream_versions: &mut HashMap<&'static str, i64>,
    tx_first_event: &mut HashMap<u32, i64>,
    tx: u32,
    stream: &'static str,
) {
    let version = stream_versions.entry(stream).or_insert(0);
    tx_first_event.entry(tx).or_insert(*version);
    *version += 1;
}

impl DbResult {
    /// Every record currently readable, in log order
    pub fn read_all(&self) -> Vec<LogRecord> {
        let mut reader = self.db.reader(0);
        let mut records = Vec::new();
        loop {
            let res = reader.try_read_next().unwrap();
            match res.record {
                Some(record) => records.push(record),
                None => break,
            }
        }
        records
    }

    /// Records of one chunk as currently stored
    pub fn chunk_records(&self, number: i32) -> Vec<LogRecord> {
        let chunk = self.db.manager().get_chunk(number).unwrap();
        chunk.records().map(|r| r.unwrap().record).collect()
    }
}
