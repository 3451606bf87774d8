//! # forkchat
//!
//! Command-line front end for the branching history engine. Replies come
//! from a local echo generator so every flow can be tried without a model.

#![deny(unsafe_code)]

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, Level};

use forkchat_engine::HistoryEngine;
use forkchat_settings::{expand_home, ForkchatSettings, LoggingSettings, StoreBackend};
use forkchat_store::{Database, MemoryStore, MessageStore, SqliteStore};
use forkchat_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Branching conversation history.
#[derive(Parser, Debug)]
#[command(name = "forkchat", about = "Branching conversation history")]
struct Cli {
    /// Settings file (defaults to `~/.forkchat/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// SQLite database path, overriding settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Keep history in memory for this run only.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn telemetry_config(logging: &LoggingSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: parse_level(&logging.level).unwrap_or(Level::INFO),
        module_levels: logging
            .module_levels
            .iter()
            .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
            .collect(),
        json: logging.json,
        journal_path: logging.journal.then(|| expand_home(&logging.journal_path)),
    }
}

fn open_store(cli: &Cli, settings: &ForkchatSettings) -> Result<Arc<dyn MessageStore>> {
    if cli.memory || (cli.db.is_none() && settings.store.backend == StoreBackend::Memory) {
        debug!("using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = cli
        .db
        .clone()
        .unwrap_or_else(|| expand_home(&settings.store.path));
    let db = Database::open(&path).with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(Arc::new(SqliteStore::new(db)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => forkchat_settings::load_settings_from_path(path),
        None => forkchat_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let _telemetry = init_telemetry(telemetry_config(&settings.logging)).context("failed to initialize logging")?;

    let store = open_store(&cli, &settings)?;
    let engine = Arc::new(HistoryEngine::new(store).with_preview_chars(settings.tree.preview_chars));

    commands::run(cli.command, engine, &settings).await
}
