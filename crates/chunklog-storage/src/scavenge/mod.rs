//! Scavenging
//!
//! The scavenger compacts completed chunks. It first reads the visible log
//! once to build a [`RetentionPlan`], then rewrites each completed chunk
//! that holds a record the plan drops. A rewrite copies the kept records,
//! at their original log positions, into a scavenged chunk with the next
//! version and switches it in through the [`ChunkManager`](crate::ChunkManager).
//!
//! Chunks are independent. A chunk that cannot be read is reported and
//! left as it is, and a failure while rewriting one deletes the half built
//! replacement and keeps the original. Either way the scavenge moves on to
//! the next chunk. The active chunk is never touched.

mod retention;

pub use retention::RetentionPlan;

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::chunk::Chunk;
use crate::db::ChunkDb;
use crate::error::StorageError;
use retention::RetentionAnalysis;

/// Records read or copied between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Cooperative cancellation flag shared with a running scavenge
#[derive(Debug, Clone, Default)]
pub struct ScavengeCancel(Arc<AtomicBool>);

impl ScavengeCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

/// A chunk whose scavenge failed; the original stayed authoritative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkScavengeFailure {
    pub chunk_number: i32,
    pub reason: String,
}

/// Summary of a scavenge run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeResult {
    /// Chunks replaced by a scavenged version
    pub chunks_scavenged: usize,
    /// Completed chunks with nothing to drop
    pub chunks_skipped: usize,
    pub records_kept: usize,
    pub records_dropped: usize,
    /// Reduction in chunk data bytes across replaced chunks
    pub bytes_saved: i64,
    pub failures: Vec<ChunkScavengeFailure>,
    pub elapsed_millis: u64,
    pub scavenged_at_millis: i64,
}

impl ScavengeResult {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum ChunkOutcome {
    Skipped { kept: usize },
    Replaced { kept: usize, dropped: usize, bytes_saved: i64 },
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Compacts the completed chunks of a database
pub struct Scavenger {
    db: Arc<ChunkDb>,
    clock: Clock,
    cancel: ScavengeCancel,
}

impl fmt::Debug for Scavenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scavenger")
            .field("db", &self.db.config().path)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Scavenger {
    pub fn new(db: Arc<ChunkDb>) -> Self {
        Self {
            db,
            clock: Arc::new(Utc::now),
            cancel: ScavengeCancel::new(),
        }
    }

    /// Replace the clock max-age retention is measured against
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Handle that cancels this scavenger
    pub fn cancel_handle(&self) -> ScavengeCancel {
        self.cancel.clone()
    }

    /// Run a full scavenge on the calling thread
    ///
    /// Returns `Err(StorageError::Cancelled)` if cancelled; chunks already
    /// switched stay switched.
    pub fn scavenge(&self) -> Result<ScavengeResult, StorageError> {
        let started = Instant::now();
        self.cancel.check()?;

        let chunks = self.db.manager().chunks();
        let completed: Vec<&Arc<Chunk>> = chunks.iter().filter(|c| c.is_completed()).collect();
        info!(chunks = completed.len(), "Starting scavenge");

        let (plan, unreadable) = self.analyse(&chunks)?;

        let mut result = ScavengeResult::default();
        for chunk in completed {
            if let Some(failure) = unreadable.iter().find(|f| f.chunk_number == chunk.number()) {
                result.failures.push(failure.clone());
                continue;
            }
            match self.scavenge_chunk(chunk, &plan) {
                Ok(ChunkOutcome::Skipped { kept }) => {
                    result.chunks_skipped += 1;
                    result.records_kept += kept;
                }
                Ok(ChunkOutcome::Replaced {
                    kept,
                    dropped,
                    bytes_saved,
                }) => {
                    result.chunks_scavenged += 1;
                    result.records_kept += kept;
                    result.records_dropped += dropped;
                    result.bytes_saved += bytes_saved;
                }
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
                Err(e) => {
                    warn!(chunk = chunk.number(), error = %e, "Chunk scavenge failed, original kept");
                    result.failures.push(ChunkScavengeFailure {
                        chunk_number: chunk.number(),
                        reason: e.to_string(),
                    });
                }
            }
            self.cancel.check()?;
        }

        result.elapsed_millis = started.elapsed().as_millis() as u64;
        result.scavenged_at_millis = Utc::now().timestamp_millis();
        info!(
            scavenged = result.chunks_scavenged,
            skipped = result.chunks_skipped,
            dropped = result.records_dropped,
            failures = result.failures.len(),
            elapsed_ms = result.elapsed_millis,
            "Scavenge finished"
        );
        Ok(result)
    }

    /// Run the scavenge on Tokio's blocking pool
    pub fn spawn(self) -> ScavengeHandle {
        let cancel = self.cancel.clone();
        let join = tokio::task::spawn_blocking(move || self.scavenge());
        ScavengeHandle { cancel, join }
    }

    /// Read the visible log into a retention plan
    ///
    /// A chunk holding an unreadable record is returned as a failure and its
    /// whole range is marked unreadable; analysis resumes at the next chunk.
    fn analyse(
        &self,
        chunks: &[Arc<Chunk>],
    ) -> Result<(RetentionPlan, Vec<ChunkScavengeFailure>), StorageError> {
        let start = self.db.config().start_position();
        let visible = self.db.writer_checkpoint().read();
        let mut analysis = RetentionAnalysis::new();
        let mut unreadable = Vec::new();

        'chunks: for chunk in chunks {
            let chunk_start = chunk.chunk_start_position();
            for read in chunk.records() {
                let read = match read {
                    Ok(read) => read,
                    Err(e @ StorageError::ChunkCorrupt { .. }) => {
                        warn!(chunk = chunk.number(), error = %e, "Unreadable chunk left out of scavenge");
                        analysis.mark_unreadable(chunk_start, chunk.chunk_end_position());
                        unreadable.push(ChunkScavengeFailure {
                            chunk_number: chunk.number(),
                            reason: e.to_string(),
                        });
                        continue 'chunks;
                    }
                    Err(e) => return Err(e),
                };
                if chunk_start + read.post > visible {
                    break 'chunks;
                }
                if chunk_start + read.pre < start {
                    continue;
                }
                analysis.observe(&read.record);
                if analysis.records_observed() % CANCEL_CHECK_INTERVAL == 0 {
                    self.cancel.check()?;
                }
            }
        }

        debug!(
            records = analysis.records_observed(),
            unreadable = unreadable.len(),
            "Scavenge analysis complete"
        );
        Ok((analysis.decide((self.clock)()), unreadable))
    }

    #[instrument(skip_all, fields(chunk = chunk.number(), version = chunk.version()))]
    fn scavenge_chunk(&self, chunk: &Arc<Chunk>, plan: &RetentionPlan) -> Result<ChunkOutcome, StorageError> {
        let mut kept = 0;
        let mut dropped = 0;
        for read in chunk.records() {
            if plan.keeps(&read?.record) {
                kept += 1;
            } else {
                dropped += 1;
            }
        }
        if dropped == 0 {
            debug!(records = kept, "Nothing to drop, skipping chunk");
            return Ok(ChunkOutcome::Skipped { kept });
        }

        let temp_path = self.db.config().naming.temp_filename();
        let switched = self
            .write_replacement(chunk, plan, &temp_path)
            .and_then(|()| {
                self.db
                    .manager()
                    .switch_chunk(&temp_path, self.db.config().verify_hashes)
            });
        let replacement = match switched {
            Ok(replacement) => replacement,
            Err(e) => {
                discard_temp(&temp_path);
                return Err(e);
            }
        };

        let bytes_saved = chunk.physical_data_size() - replacement.physical_data_size();
        info!(kept, dropped, bytes_saved, "Scavenged chunk");
        Ok(ChunkOutcome::Replaced {
            kept,
            dropped,
            bytes_saved,
        })
    }

    fn write_replacement(
        &self,
        chunk: &Chunk,
        plan: &RetentionPlan,
        temp_path: &Path,
    ) -> Result<(), StorageError> {
        let replacement = Chunk::create_new(
            temp_path,
            chunk.chunk_size(),
            chunk.number(),
            chunk.version() + 1,
            true,
        )?;

        let mut written = 0;
        for read in chunk.records() {
            let record = read?.record;
            if !plan.keeps(&record) {
                continue;
            }
            if !replacement.try_append(&record)?.success {
                return Err(StorageError::invalid_state(format!(
                    "record at {} does not fit in scavenged chunk {}",
                    record.log_position(),
                    chunk.number()
                )));
            }
            written += 1;
            if written % CANCEL_CHECK_INTERVAL == 0 {
                self.cancel.check()?;
            }
        }

        replacement.complete_scavenged(chunk.logical_data_size())
    }
}

fn discard_temp(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Discarded scavenge work file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard scavenge work file"),
    }
}

/// A scavenge running in the background
#[derive(Debug)]
pub struct ScavengeHandle {
    cancel: ScavengeCancel,
    join: tokio::task::JoinHandle<Result<ScavengeResult, StorageError>>,
}

impl ScavengeHandle {
    /// Ask the scavenge to stop at its next check
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the scavenge to finish
    pub async fn wait(self) -> Result<ScavengeResult, StorageError> {
        self.join
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}
