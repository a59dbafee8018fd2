//! Command line arguments and the settings file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chunklog_logging::LogConfig;
use chunklog_storage::{CheckpointMode, DbSettings};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser)]
#[command(name = "chunklog", about = "Inspect and maintain a chunked transaction log")]
pub struct Cli {
    /// Settings file with [database] and [logging] tables
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Database directory (overrides the settings file)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Chunk size in bytes (overrides the settings file)
    #[arg(long, global = true)]
    pub chunk_size: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Human-readable log output instead of JSON lines
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show checkpoints and the chunk set
    Info,
    /// Print records as JSON lines
    Dump {
        /// Position to start reading from (log start, or log end with `--reverse`)
        #[arg(long)]
        from: Option<i64>,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
        /// Walk backwards
        #[arg(long)]
        reverse: bool,
        /// Only show records acknowledged by replication
        #[arg(long)]
        replicated: bool,
    },
    /// Check chunk hashes and record framing
    Verify,
    /// Compact completed chunks according to stream retention
    Scavenge,
    /// Append single-write events to a stream
    Append {
        /// Target stream
        #[arg(long)]
        stream: String,
        /// Event type
        #[arg(long, default_value = "event")]
        event_type: String,
        /// Event payload (UTF-8)
        #[arg(long, default_value = "")]
        data: String,
        /// Number of events to append
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

/// Contents of the settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DbSettings,
    pub logging: LogConfig,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("failed to parse settings")
    }

    /// Load the settings file, or defaults when none is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::from_toml_str(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply command line overrides
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(db) = &cli.db {
            self.database.path = db.clone();
        }
        if let Some(chunk_size) = cli.chunk_size {
            self.database.chunk_size = chunk_size;
        }
        if let Some(level) = &cli.log_level {
            self.logging.default_level = level.clone();
        }
        if cli.pretty {
            self.logging.console.pretty = true;
        }
    }

    /// Whether checkpoint values survive the process
    pub fn is_persistent(&self) -> bool {
        self.database.checkpoints == CheckpointMode::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_file_sections() {
        let settings = Settings::from_toml_str(
            r#"
            [database]
            path = "/var/lib/chunklog"
            chunk_size = 1048576
            verify_hashes = true

            [logging]
            default_level = "debug"

            [logging.targets]
            "chunklog_storage::scavenge" = "trace"
            "#,
        )
        .unwrap();
        assert_eq!(settings.database.path, PathBuf::from("/var/lib/chunklog"));
        assert_eq!(settings.database.chunk_size, 1_048_576);
        assert!(settings.database.verify_hashes);
        assert_eq!(settings.database.file_prefix, "chunk-");
        assert_eq!(settings.logging.default_level, "debug");
        assert_eq!(
            settings.logging.targets.get("chunklog_storage::scavenge"),
            Some(&"trace".to_string())
        );
        assert!(settings.is_persistent());
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::parse_from([
            "chunklog",
            "--db",
            "/tmp/other",
            "--chunk-size",
            "4096",
            "--log-level",
            "warn",
            "info",
        ]);
        let mut settings = Settings::default();
        settings.apply(&cli);
        assert_eq!(settings.database.path, PathBuf::from("/tmp/other"));
        assert_eq!(settings.database.chunk_size, 4096);
        assert_eq!(settings.logging.default_level, "warn");
        assert!(matches!(cli.command, Command::Info));
    }

    #[test]
    fn test_dump_arguments() {
        let cli = Cli::parse_from(["chunklog", "dump", "--from", "128", "--limit", "5", "--reverse"]);
        match cli.command {
            Command::Dump {
                from,
                limit,
                reverse,
                replicated,
            } => {
                assert_eq!(from, Some(128));
                assert_eq!(limit, Some(5));
                assert!(reverse);
                assert!(!replicated);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_mistyped_setting_is_rejected() {
        assert!(Settings::from_toml_str("[database]\nchunk_size = \"big\"").is_err());
    }
}
