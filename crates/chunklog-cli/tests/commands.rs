//! Commands driven against a database in a temporary directory

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use chunklog_cli::commands::{self, DumpOptions};
use chunklog_cli::Settings;
use chunklog_storage::{CheckpointMode, DbSettings};
use tempfile::TempDir;

const CHUNK_SIZE: i32 = 4096;

fn settings(temp: &TempDir) -> Settings {
    Settings {
        database: DbSettings {
            path: temp.path().to_path_buf(),
            chunk_size: CHUNK_SIZE,
            checkpoints: CheckpointMode::File,
            ..DbSettings::default()
        },
        ..Settings::default()
    }
}

fn dump_lines(settings: &Settings, options: DumpOptions) -> Vec<serde_json::Value> {
    let db = commands::open(settings).unwrap();
    let mut out = Vec::new();
    let written = commands::dump(&db, options, &mut out).unwrap();
    let lines: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), written);
    lines
}

#[test]
fn appended_events_are_dumped_in_order() {
    let temp = TempDir::new().unwrap();
    let settings = settings(&temp);
    {
        let db = commands::open(&settings).unwrap();
        let report = commands::append(&db, "orders", "placed", "{\"id\":1}", 3).unwrap();
        assert_eq!(report.count, 3);
        assert_eq!(report.first_position, 0);
    }

    let lines = dump_lines(&settings, DumpOptions::default());
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["position"], 0);
    assert_eq!(lines[0]["stream"], "orders");
    assert_eq!(lines[0]["event_type"], "placed");
    assert_eq!(lines[0]["data_len"], 8);
    assert_eq!(lines[1]["position"], lines[0]["next_position"]);
}

#[test]
fn reverse_dump_with_limit_starts_at_the_end() {
    let temp = TempDir::new().unwrap();
    let settings = settings(&temp);
    let end = {
        let db = commands::open(&settings).unwrap();
        commands::append(&db, "s", "e", "payload", 5).unwrap().end_position
    };

    let lines = dump_lines(
        &settings,
        DumpOptions {
            reverse: true,
            limit: Some(2),
            ..DumpOptions::default()
        },
    );
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["next_position"], end);
    assert_eq!(lines[1]["next_position"], lines[0]["position"]);
}

#[test]
fn info_lists_chunks_and_checkpoints() {
    let temp = TempDir::new().unwrap();
    let settings = settings(&temp);
    let db = commands::open(&settings).unwrap();
    // 1000-byte payloads: three fit in a chunk, the fourth rolls over
    let data = "x".repeat(1000);
    let report = commands::append(&db, "big", "e", &data, 4).unwrap();

    let info = commands::info(&db);
    assert_eq!(info.chunk_size, CHUNK_SIZE);
    assert_eq!(info.writer_checkpoint, report.end_position);
    assert_eq!(info.replication_checkpoint, -1);
    assert_eq!(info.chunks.len(), 2);
    assert!(info.chunks[0].completed);
    assert_eq!(info.chunks[0].hash.as_ref().map(|h| h.len()), Some(64));
    assert!(!info.chunks[1].completed);
    assert!(info.chunks[1].hash.is_none());
    assert_eq!(info.chunks[1].start_position, CHUNK_SIZE as i64);
}

#[test]
fn verify_reports_a_damaged_chunk() {
    let temp = TempDir::new().unwrap();
    let settings = settings(&temp);
    let data = "x".repeat(1000);
    {
        let db = commands::open(&settings).unwrap();
        commands::append(&db, "big", "e", &data, 4).unwrap();
        let report = commands::verify(&db).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.chunks[0].records, 3);
        assert_eq!(report.chunks[1].records, 1);
    }

    // flip a byte inside the first event's payload
    let mut file = OpenOptions::new()
        .write(true)
        .open(temp.path().join("chunk-000000.000000"))
        .unwrap();
    file.seek(SeekFrom::Start(128 + 500)).unwrap();
    file.write_all(b"y").unwrap();
    drop(file);

    let db = commands::open(&settings).unwrap();
    let report = commands::verify(&db).unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.failed_chunks(), 1);
    assert!(report.chunks[0].error.as_ref().unwrap().contains("hash"));
    assert!(report.chunks[1].error.is_none());
}

#[tokio::test]
async fn scavenge_without_retention_rules_keeps_everything() {
    let temp = TempDir::new().unwrap();
    let settings = settings(&temp);
    let db = commands::open(&settings).unwrap();
    let data = "x".repeat(1000);
    commands::append(&db, "big", "e", &data, 7).unwrap();

    let result = commands::scavenge(&db).await.unwrap();
    assert!(result.is_clean());
    assert_eq!(result.chunks_scavenged, 0);
    assert_eq!(result.chunks_skipped, 2);
    assert_eq!(result.records_dropped, 0);
}
