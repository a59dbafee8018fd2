//! Library side of the `chunklog` binary
//!
//! Kept separate from `main.rs` so the commands can be driven from tests.

pub mod commands;
pub mod config;

pub use config::{Cli, Command, Settings};
