//! Settings loading.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ForkchatSettings, StoreBackend};

/// `~/.forkchat`, falling back to `/tmp/.forkchat` without `$HOME`.
pub fn forkchat_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".forkchat")
}

pub fn settings_path() -> PathBuf {
    forkchat_home().join("settings.json")
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(raw),
    }
}

pub fn load_settings() -> Result<ForkchatSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides applied.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ForkchatSettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<ForkchatSettings> {
    let defaults = serde_json::to_value(ForkchatSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `FORKCHAT_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut ForkchatSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Empty, malformed, and
/// out-of-range values are ignored.
pub fn apply_overrides_from<F>(settings: &mut ForkchatSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(raw) = read("FORKCHAT_STORE_BACKEND") {
        match raw.parse::<StoreBackend>() {
            Ok(backend) => settings.store.backend = backend,
            Err(_) => warn!(key = "FORKCHAT_STORE_BACKEND", value = %raw, "invalid backend env var, ignoring"),
        }
    }
    if let Some(v) = read("FORKCHAT_DB_PATH") {
        settings.store.path = v;
    }
    if let Some(v) = read_ranged(&read, "FORKCHAT_PREVIEW_CHARS", 1, 10_000) {
        settings.tree.preview_chars = v as usize;
    }
    if let Some(v) = read_ranged(&read, "FORKCHAT_REPLY_TIMEOUT_MS", 100, 3_600_000) {
        settings.generation.reply_timeout_ms = v;
    }
    if let Some(v) = read("FORKCHAT_CANCEL_MARKER") {
        settings.generation.cancel_marker = v;
    }
    if let Some(v) = read("FORKCHAT_LOG_LEVEL") {
        settings.logging.level = v.trim().to_lowercase();
    }
    if let Some(v) = read_flag(&read, "FORKCHAT_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = read_flag(&read, "FORKCHAT_JOURNAL") {
        settings.logging.journal = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_ranged(read: &impl Fn(&str) -> Option<String>, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = read(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

fn read_flag(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let val = read(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;

    fn overrides(pairs: &[(&str, &str)]) -> ForkchatSettings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut settings = ForkchatSettings::default();
        apply_overrides_from(&mut settings, |name| env.get(name).cloned());
        settings
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"tree": {"previewChars": 80}, "store": {"path": "a"}});
        let source = serde_json::json!({"tree": {"previewChars": 40}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["tree"]["previewChars"], 40);
        assert_eq!(merged["store"]["path"], "a");
    }

    #[test]
    fn merge_skips_null_and_replaces_arrays() {
        let target = serde_json::json!({"a": 1, "list": [1, 2, 3]});
        let source = serde_json::json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = read_layered(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, ForkchatSettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"generation": {"cancelMarker": "[stopped]"}, "logging": {"moduleLevels": {"forkchat_store": "debug"}}}"#,
        )
        .unwrap();
        let settings = read_layered(&path).unwrap();
        assert_eq!(settings.generation.cancel_marker, "[stopped]");
        assert_eq!(settings.generation.reply_timeout_ms, 120_000);
        assert_eq!(
            settings.logging.module_levels.get("forkchat_store").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(read_layered(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let settings = overrides(&[
            ("FORKCHAT_STORE_BACKEND", "memory"),
            ("FORKCHAT_DB_PATH", "/var/lib/forkchat.db"),
            ("FORKCHAT_PREVIEW_CHARS", "120"),
            ("FORKCHAT_REPLY_TIMEOUT_MS", "5000"),
            ("FORKCHAT_CANCEL_MARKER", "[aborted]"),
            ("FORKCHAT_LOG_LEVEL", "DEBUG"),
            ("FORKCHAT_LOG_JSON", "yes"),
            ("FORKCHAT_JOURNAL", "off"),
        ]);
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.path, "/var/lib/forkchat.db");
        assert_eq!(settings.tree.preview_chars, 120);
        assert_eq!(settings.generation.reply_timeout_ms, 5000);
        assert_eq!(settings.generation.cancel_marker, "[aborted]");
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
        assert!(!settings.logging.journal);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let settings = overrides(&[
            ("FORKCHAT_STORE_BACKEND", "postgres"),
            ("FORKCHAT_PREVIEW_CHARS", "0"),
            ("FORKCHAT_REPLY_TIMEOUT_MS", "99"),
            ("FORKCHAT_LOG_JSON", "maybe"),
            ("FORKCHAT_DB_PATH", "  "),
        ]);
        assert_eq!(settings, ForkchatSettings::default());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let settings = overrides(&[
            ("FORKCHAT_PREVIEW_CHARS", "10000"),
            ("FORKCHAT_REPLY_TIMEOUT_MS", "100"),
        ]);
        assert_eq!(settings.tree.preview_chars, 10_000);
        assert_eq!(settings.generation.reply_timeout_ms, 100);
    }

    #[test]
    fn parse_bool_forms() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
    }

    #[test]
    fn expand_home_only_touches_tilde_prefix() {
        assert_eq!(expand_home("/abs/path.db"), PathBuf::from("/abs/path.db"));
        assert!(!expand_home("~/x.db").starts_with("~"));
    }
}
