mod journal;

pub use journal::{JournalLayer, JournalQuery, JournalRecord, WarnJournal};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("subscriber init failed: {0}")]
    Init(String),
    #[error("journal open failed: {0}")]
    Journal(#[from] rusqlite::Error),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "forkchat_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of compact text on stderr.
    pub json: bool,
    /// Where to persist warn+ events; `None` disables the journal.
    pub journal_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            journal_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Directive string handed to `EnvFilter` when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the journal reachable for queries after init.
pub struct TelemetryGuard {
    journal: Option<Arc<WarnJournal>>,
}

impl TelemetryGuard {
    pub fn journal(&self) -> Option<&WarnJournal> {
        self.journal.as_deref()
    }
}

/// Parse a level name, accepting any case.
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let journal = match &config.journal_path {
        Some(path) => Some(Arc::new(WarnJournal::open(path)?)),
        None => None,
    };
    let journal_layer = journal.clone().map(JournalLayer::new);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(journal_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    Ok(TelemetryGuard { journal })
}
