//! Subcommand implementations
//!
//! Each command works against an open [`ChunkDb`] and returns a serialisable
//! report; `main` decides how to print it.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use chunklog_core::{ExpectedVersion, LogPosition, LogRecord, RecordType};
use chunklog_storage::{
    ChunkDb, ChunkWriter, LogReader, ReadFailure, ScavengeResult, Scavenger, SeqReadResult,
    StorageError,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;

/// Open the database the settings describe
pub fn open(settings: &Settings) -> anyhow::Result<Arc<ChunkDb>> {
    let config = settings.database.to_config()?;
    let db = ChunkDb::open(config)
        .with_context(|| format!("failed to open {}", settings.database.path.display()))?;
    Ok(Arc::new(db))
}

#[derive(Debug, Clone, Serialize)]
pub struct DbInfo {
    pub path: String,
    pub chunk_size: i32,
    pub writer_checkpoint: LogPosition,
    pub replication_checkpoint: LogPosition,
    pub chaser_checkpoint: LogPosition,
    pub epoch_checkpoint: LogPosition,
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub number: i32,
    pub version: i32,
    pub start_position: LogPosition,
    pub completed: bool,
    pub scavenged: bool,
    pub logical_data_size: i64,
    pub physical_data_size: i64,
    /// Footer hash, completed chunks only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

pub fn info(db: &ChunkDb) -> DbInfo {
    let config = db.config();
    let chunks = db
        .manager()
        .chunks()
        .iter()
        .map(|chunk| ChunkInfo {
            number: chunk.number(),
            version: chunk.version(),
            start_position: chunk.chunk_start_position(),
            completed: chunk.is_completed(),
            scavenged: chunk.is_scavenged(),
            logical_data_size: chunk.logical_data_size(),
            physical_data_size: chunk.physical_data_size(),
            hash: chunk.footer().map(|footer| hex::encode(footer.hash)),
        })
        .collect();

    DbInfo {
        path: config.path.display().to_string(),
        chunk_size: config.chunk_size,
        writer_checkpoint: config.writer_checkpoint.read(),
        replication_checkpoint: config.replication_checkpoint.read(),
        chaser_checkpoint: config.chaser_checkpoint.read(),
        epoch_checkpoint: config.epoch_checkpoint.read(),
        chunks,
    }
}

/// One line of `chunklog dump`
#[derive(Debug, Clone, Serialize)]
pub struct DumpLine {
    pub position: LogPosition,
    pub next_position: LogPosition,
    pub record_type: RecordType,
    pub timestamp_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_position: Option<LogPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch_number: Option<i32>,
}

impl DumpLine {
    fn new(res: &SeqReadResult, record: &LogRecord) -> Self {
        let mut line = Self {
            position: res.record_pre_position,
            next_position: res.record_post_position,
            record_type: record.record_type(),
            timestamp_millis: 0,
            stream: None,
            event_type: None,
            event_id: None,
            flags: None,
            transaction_position: None,
            first_event_number: None,
            data_len: None,
            epoch_number: None,
        };
        match record {
            LogRecord::Prepare(p) => {
                line.timestamp_millis = p.timestamp_millis;
                line.stream = Some(p.event_stream_id.clone());
                line.event_type = Some(p.event_type.clone());
                line.event_id = Some(p.event_id);
                line.flags = Some(p.flags.bits());
                line.transaction_position = Some(p.transaction_position);
                line.data_len = Some(p.data.len());
            }
            LogRecord::Commit(c) => {
                line.timestamp_millis = c.timestamp_millis;
                line.transaction_position = Some(c.transaction_position);
                line.first_event_number = Some(c.first_event_number);
            }
            LogRecord::System(s) => {
                line.timestamp_millis = s.timestamp_millis;
                line.epoch_number = s.epoch().map(|epoch| epoch.epoch_number);
            }
        }
        line
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    pub from: Option<LogPosition>,
    pub limit: Option<usize>,
    pub reverse: bool,
    pub replicated: bool,
}

/// Write visible records as JSON lines, returning how many were written
pub fn dump(db: &Arc<ChunkDb>, options: DumpOptions, out: &mut impl Write) -> anyhow::Result<usize> {
    let start = match (options.from, options.reverse) {
        (Some(from), _) => from,
        (None, false) => db.config().start_position(),
        (None, true) => db.writer_checkpoint().read(),
    };
    let mut reader = if options.replicated {
        db.replicated_reader(start)
    } else {
        db.reader(start)
    };

    let limit = options.limit.unwrap_or(usize::MAX);
    let mut written = 0;
    while written < limit {
        let Some(res) = next_visible(&mut reader, options.reverse)? else {
            break;
        };
        if let Some(record) = &res.record {
            serde_json::to_writer(&mut *out, &DumpLine::new(&res, record))?;
            writeln!(out)?;
            written += 1;
        }
    }
    out.flush()?;
    Ok(written)
}

/// Next visible record in scan order; a backward scan steps over records the gate hides
fn next_visible(reader: &mut LogReader, reverse: bool) -> anyhow::Result<Option<SeqReadResult>> {
    loop {
        let before = reader.position();
        let res = if reverse {
            reader.try_read_prev()?
        } else {
            reader.try_read_next()?
        };
        match &res.failure {
            None => return Ok(Some(res)),
            Some(ReadFailure::Corrupt { reason }) => {
                bail!("corrupt record near position {}: {}", before, reason)
            }
            Some(ReadFailure::OutOfBounds) if reverse && reader.position() != before => continue,
            Some(ReadFailure::OutOfBounds) => return Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkCheck {
    pub number: i32,
    pub version: i32,
    pub completed: bool,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub chunks: Vec<ChunkCheck>,
}

impl VerifyReport {
    pub fn failed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.error.is_some()).count()
    }

    pub fn is_ok(&self) -> bool {
        self.failed_chunks() == 0
    }
}

/// Recompute every completed chunk's hash and parse every record
///
/// Damage is reported per chunk; only I/O errors abort the run.
pub fn verify(db: &ChunkDb) -> anyhow::Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for chunk in db.manager().chunks() {
        let mut check = ChunkCheck {
            number: chunk.number(),
            version: chunk.version(),
            completed: chunk.is_completed(),
            records: 0,
            hash: chunk.footer().map(|footer| hex::encode(footer.hash)),
            error: None,
        };

        if chunk.is_completed() {
            match chunk.verify_hash() {
                Ok(()) => {}
                Err(e @ StorageError::ChunkCorrupt { .. }) => check.error = Some(e.to_string()),
                Err(e) => return Err(e.into()),
            }
        }
        for read in chunk.records() {
            match read {
                Ok(_) => check.records += 1,
                Err(e @ StorageError::ChunkCorrupt { .. }) => {
                    check.error.get_or_insert_with(|| e.to_string());
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match &check.error {
            Some(error) => warn!(chunk = check.number, error = %error, "Chunk failed verification"),
            None => info!(chunk = check.number, records = check.records, "Chunk verified"),
        }
        report.chunks.push(check);
    }
    Ok(report)
}

/// Run a scavenge on the blocking pool; Ctrl-C cancels it
pub async fn scavenge(db: &Arc<ChunkDb>) -> anyhow::Result<ScavengeResult> {
    let scavenger = Scavenger::new(db.clone());
    let cancel = scavenger.cancel_handle();
    let wait = scavenger.spawn().wait();
    tokio::pin!(wait);

    let result = tokio::select! {
        result = &mut wait => result,
        signal = tokio::signal::ctrl_c() => {
            if signal.is_ok() {
                warn!("Interrupted, cancelling scavenge");
                cancel.cancel();
            }
            wait.await
        }
    };
    Ok(result?)
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendReport {
    pub stream: String,
    pub count: usize,
    pub first_position: LogPosition,
    pub end_position: LogPosition,
}

/// Append `count` single-write events and flush them
pub fn append(
    db: &Arc<ChunkDb>,
    stream: &str,
    event_type: &str,
    data: &str,
    count: usize,
) -> anyhow::Result<AppendReport> {
    let mut writer = ChunkWriter::new(db.clone())?;
    let mut first_position = writer.position();
    let mut end_position = first_position;

    for i in 0..count {
        let res = writer.append(|position| {
            LogRecord::single_write(
                position,
                Uuid::new_v4(),
                Uuid::new_v4(),
                stream,
                ExpectedVersion::ANY,
                event_type,
                data.as_bytes().to_vec(),
                Vec::new(),
            )
        })?;
        if i == 0 {
            first_position = res.old_position;
        }
        end_position = res.new_position;
    }
    writer.flush()?;
    info!(stream, count, end_position, "Appended events");

    Ok(AppendReport {
        stream: stream.to_string(),
        count,
        first_position,
        end_position,
    })
}
