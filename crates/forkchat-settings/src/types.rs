//! Settings types. Every struct is camelCase on the wire and fills missing
//! fields from its `Default`, so a partial file is always valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForkchatSettings {
    pub store: StoreSettings,
    pub tree: TreeSettings,
    pub generation: GenerationSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Database file; a leading `~` expands to `$HOME`.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: "~/.forkchat/database/forkchat.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TreeSettings {
    /// Characters of content kept in a branch-tree preview.
    pub preview_chars: usize,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self { preview_chars: 80 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    /// Upper bound on one streamed reply, in milliseconds.
    pub reply_timeout_ms: u64,
    /// Appended to the partial content of a cancelled reply.
    pub cancel_marker: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 120_000,
            cancel_marker: "[cancelled]".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Persist warn+ events to a SQLite journal.
    pub journal: bool,
    pub journal_path: String,
    /// Per-target level overrides, e.g. `{"forkchat_store": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            journal: true,
            journal_path: "~/.forkchat/database/journal.db".to_string(),
            module_levels: BTreeMap::new(),
        }
    }
}
