//! Retention analysis
//!
//! One pass over the visible log collects, per stream, its creation and
//! tombstone prepares, its retention metadata and its committed events in
//! log order. [`RetentionPlan::decide`] then turns that into the set of
//! prepares to drop. Commits are judged per transaction: a commit survives
//! only if its transaction still has a prepare.
//!
//! Ranges that could not be read are marked unreadable. Prepares there were
//! never counted, so a commit whose transaction begins in such a range is
//! always kept.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use chunklog_core::{LogPosition, LogRecord, PrepareLogRecord, StreamMetadata};

#[derive(Debug, Default)]
struct StreamInfo {
    metadata: Option<StreamMetadata>,
    tombstone: Option<LogPosition>,
    /// Prepares other than creation and tombstone, in log order
    events: Vec<EventRef>,
}

#[derive(Debug, Clone, Copy)]
struct EventRef {
    position: LogPosition,
    transaction: LogPosition,
    timestamp_millis: i64,
}

/// Accumulates log records for a retention decision
#[derive(Debug, Default)]
pub(crate) struct RetentionAnalysis {
    streams: HashMap<String, StreamInfo>,
    /// Prepare count per transaction position
    transactions: HashMap<LogPosition, usize>,
    committed: HashSet<LogPosition>,
    /// `[start, end)` log ranges skipped as unreadable
    unreadable: Vec<(LogPosition, LogPosition)>,
    records: usize,
}

impl RetentionAnalysis {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn observe(&mut self, record: &LogRecord) {
        self.records += 1;
        match record {
            LogRecord::Prepare(prepare) => self.observe_prepare(prepare),
            LogRecord::Commit(commit) => {
                self.committed.insert(commit.transaction_position);
            }
            LogRecord::System(_) => {}
        }
    }

    fn observe_prepare(&mut self, prepare: &PrepareLogRecord) {
        *self
            .transactions
            .entry(prepare.transaction_position)
            .or_default() += 1;
        if prepare.is_self_committed() {
            self.committed.insert(prepare.transaction_position);
        }

        let stream = self
            .streams
            .entry(prepare.event_stream_id.clone())
            .or_default();
        if prepare.is_stream_created() {
            stream.metadata = StreamMetadata::from_json_bytes(&prepare.metadata);
        } else if prepare.is_tombstone() {
            stream.tombstone = Some(prepare.log_position);
        } else {
            stream.events.push(EventRef {
                position: prepare.log_position,
                transaction: prepare.transaction_position,
                timestamp_millis: prepare.timestamp_millis,
            });
        }
    }

    pub(crate) fn records_observed(&self) -> usize {
        self.records
    }

    pub(crate) fn mark_unreadable(&mut self, start: LogPosition, end: LogPosition) {
        self.unreadable.push((start, end));
    }

    /// Decide which prepares and commits to drop
    pub(crate) fn decide(self, now: DateTime<Utc>) -> RetentionPlan {
        let mut dropped = HashSet::new();

        for info in self.streams.values() {
            if info.tombstone.is_some() {
                dropped.extend(info.events.iter().map(|e| e.position));
                continue;
            }
            let Some(metadata) = info.metadata else {
                continue;
            };

            let live: Vec<&EventRef> = info
                .events
                .iter()
                .filter(|e| self.committed.contains(&e.transaction))
                .collect();

            if let Some(max_count) = metadata.max_count {
                let keep = usize::try_from(max_count.max(0)).unwrap_or(usize::MAX);
                let excess = live.len().saturating_sub(keep);
                dropped.extend(live[..excess].iter().map(|e| e.position));
            }
            if let Some(max_age) = metadata.max_age() {
                let max_age_millis = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
                let cutoff = now.timestamp_millis().saturating_sub(max_age_millis);
                dropped.extend(
                    live.iter()
                        .filter(|e| e.timestamp_millis < cutoff)
                        .map(|e| e.position),
                );
            }
        }

        let mut surviving = self.transactions;
        for info in self.streams.values() {
            for event in &info.events {
                if dropped.contains(&event.position) {
                    if let Some(count) = surviving.get_mut(&event.transaction) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
        surviving.retain(|_, count| *count > 0);

        RetentionPlan {
            dropped_prepares: dropped,
            live_transactions: surviving.into_keys().collect(),
            unreadable: self.unreadable,
        }
    }
}

/// Outcome of retention analysis: what a scavenged chunk may omit
#[derive(Debug, Default)]
pub struct RetentionPlan {
    dropped_prepares: HashSet<LogPosition>,
    /// Transactions with at least one surviving prepare
    live_transactions: HashSet<LogPosition>,
    unreadable: Vec<(LogPosition, LogPosition)>,
}

impl RetentionPlan {
    /// Whether a record must be carried into the scavenged chunk
    pub fn keeps(&self, record: &LogRecord) -> bool {
        match record {
            LogRecord::Prepare(prepare) => !self.dropped_prepares.contains(&prepare.log_position),
            LogRecord::Commit(commit) => {
                self.live_transactions.contains(&commit.transaction_position)
                    || self.is_unreadable(commit.transaction_position)
            }
            LogRecord::System(_) => true,
        }
    }

    fn is_unreadable(&self, position: LogPosition) -> bool {
        self.unreadable
            .iter()
            .any(|&(start, end)| position >= start && position < end)
    }

    pub fn dropped_prepare_count(&self) -> usize {
        self.dropped_prepares.len()
    }
}
