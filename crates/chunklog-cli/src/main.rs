use std::io::{self, Write};

use anyhow::bail;
use chunklog_cli::commands::{self, DumpOptions};
use chunklog_cli::{Cli, Command, Settings};
use chunklog_logging::SubscriberBuilder;
use clap::Parser;
use serde::Serialize;

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply(&cli);

    let _log_guard = SubscriberBuilder::new()
        .with_config(settings.logging.clone())
        .init()?;

    let db = commands::open(&settings)?;

    match cli.command {
        Command::Info => print_json(&commands::info(&db))?,

        Command::Dump {
            from,
            limit,
            reverse,
            replicated,
        } => {
            let options = DumpOptions {
                from,
                limit,
                reverse,
                replicated,
            };
            let stdout = io::stdout();
            commands::dump(&db, options, &mut stdout.lock())?;
        }

        Command::Verify => {
            let report = commands::verify(&db)?;
            print_json(&report)?;
            if !report.is_ok() {
                bail!("{} chunk(s) failed verification", report.failed_chunks());
            }
        }

        Command::Scavenge => {
            let result = commands::scavenge(&db).await?;
            print_json(&result)?;
        }

        Command::Append {
            stream,
            event_type,
            data,
            count,
        } => {
            if !settings.is_persistent() {
                tracing::warn!("Checkpoints are in memory; appended events will not be found on reopen");
            }
            let report = commands::append(&db, &stream, &event_type, &data, count)?;
            print_json(&report)?;
        }
    }

    Ok(())
}
