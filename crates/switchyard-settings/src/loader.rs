//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply environment variable overrides
//! 4. Validate
//!
//! Command-line flags are applied by the binary after this returns.
//!
//! Environment values that fail to parse are ignored. [`load_settings_with`]
//! logs them right away. [`load_settings_with_report`] hands them back
//! instead, for callers that install logging only after settings are known.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::GatewaySettings;

/// Resolve the default settings file (`~/.switchyard/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchyard").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields the defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// An environment override ignored because its value did not parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedOverride {
    /// Environment variable name.
    pub key: &'static str,
    /// Value as found in the environment.
    pub value: String,
    /// What a valid value looks like.
    pub expected: String,
}

impl RejectedOverride {
    /// Emit the warning for this override.
    pub fn log(&self) {
        warn!(key = self.key, value = %self.value, expected = %self.expected, "invalid env var, ignoring");
    }
}

/// Load settings from `path`, reading overrides through `lookup`.
pub fn load_settings_with<F>(path: &Path, lookup: F) -> Result<GatewaySettings>
where
    F: Fn(&str) -> Option<String>,
{
    let (settings, rejected) = load_settings_with_report(path, lookup)?;
    rejected.iter().for_each(RejectedOverride::log);
    Ok(settings)
}

/// Like [`load_settings_with`], but return ignored overrides instead of logging them.
pub fn load_settings_with_report<F>(
    path: &Path,
    lookup: F,
) -> Result<(GatewaySettings, Vec<RejectedOverride>)>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: GatewaySettings = serde_json::from_value(merged)?;
    let mut env = EnvReader::new(lookup);
    apply_env_overrides(&mut settings, &mut env);
    settings.validate()?;
    Ok((settings, env.rejected))
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are collected in `env` and ignored, leaving the file or
/// default value.
fn apply_env_overrides<F>(settings: &mut GatewaySettings, env: &mut EnvReader<F>)
where
    F: Fn(&str) -> Option<String>,
{
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHYARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("MCP_SSE_PORT", 0, 65_535) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = env.u64("MCP_TIMEOUT", 1, u64::MAX) {
        settings.server.request_timeout_ms = v;
    }
    if let Some(v) = env.u64("SSE_TIMEOUT", 1, u64::MAX) {
        settings.server.stream_timeout_ms = v;
    }
    if let Some(v) = env.string("CORS_ALLOW_ORIGIN") {
        settings.server.cors_allow_origin = v;
    }

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = env.u64("SWITCHYARD_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.transport.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("SWITCHYARD_SINK_CAPACITY", 1, 1_048_576) {
        settings.transport.sink_capacity = usize::try_from(v).unwrap_or(settings.transport.sink_capacity);
    }
    if let Some(v) = env.enumeration("SWITCHYARD_ORPHANED_REPLIES") {
        settings.transport.orphaned_replies = v;
    }
    if let Some(v) = env.enumeration("SWITCHYARD_DUPLICATE_SESSIONS") {
        settings.transport.duplicate_sessions = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("LOG_LEVEL") {
        settings.logging.level = v.to_lowercase();
    }
    if let Some(v) = env.enumeration("LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a lowercase serde enum variant, case-insensitively.
pub fn parse_enum<T: DeserializeOwned>(val: &str) -> Option<T> {
    serde_json::from_value(Value::String(val.trim().to_lowercase())).ok()
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
    rejected: Vec<RejectedOverride>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            rejected: Vec::new(),
        }
    }

    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&mut self, name: &'static str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            self.reject(name, val, format!("integer in {min}..={max}"));
        }
        result
    }

    fn enumeration<T: DeserializeOwned>(&mut self, name: &'static str) -> Option<T> {
        let val = self.string(name)?;
        let result = parse_enum(&val);
        if result.is_none() {
            self.reject(name, val, "a known variant".to_owned());
        }
        result
    }

    fn reject(&mut self, key: &'static str, value: String, expected: String) {
        self.rejected.push(RejectedOverride {
            key,
            value,
            expected,
        });
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::errors::SettingsError;
    use crate::types::{DuplicateSessionPolicy, LogFormat, OrphanReplyPolicy};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = json!({"server": {"port": 8080, "host": "localhost"}});
        let source = json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1, "b": 2}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(json!({"items": [1, 2, 3]}), json!({"items": [4]}));
        assert_eq!(merged["items"], json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(json!({"a": {"nested": true}}), json!({"a": 42}));
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(json!({"a": 1}), json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    // ── load_settings_with ──────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_with(Path::new("/nonexistent/settings.json"), no_env).unwrap();
        assert_eq!(settings.server.port, 3200);
        assert_eq!(settings.transport.sink_capacity, 1024);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 4000}, "transport": {"orphanedReplies": "drop"}}"#,
        )
        .unwrap();

        let settings = load_settings_with(&path, no_env).unwrap();
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.server.port_attempts, 10);
        assert_eq!(settings.transport.orphaned_replies, OrphanReplyPolicy::Drop);
        assert_eq!(settings.transport.heartbeat_interval_ms, 20_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let err = load_settings_with(&path, no_env).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"transport": {"sinkCapacity": 0}}"#).unwrap();

        let err = load_settings_with(&path, no_env).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 4000}}"#).unwrap();

        let env = env_from(&[
            ("MCP_SSE_PORT", "5000"),
            ("MCP_TIMEOUT", "1000"),
            ("SSE_TIMEOUT", "60000"),
            ("CORS_ALLOW_ORIGIN", "https://example.com"),
            ("LOG_LEVEL", "DEBUG"),
            ("LOG_FORMAT", "json"),
            ("SWITCHYARD_HOST", "127.0.0.1"),
            ("SWITCHYARD_HEARTBEAT_INTERVAL_MS", "5000"),
            ("SWITCHYARD_SINK_CAPACITY", "16"),
            ("SWITCHYARD_ORPHANED_REPLIES", "Drop"),
            ("SWITCHYARD_DUPLICATE_SESSIONS", "overwrite"),
        ]);
        let settings = load_settings_with(&path, env).unwrap();
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.server.request_timeout_ms, 1000);
        assert_eq!(settings.server.stream_timeout_ms, 60_000);
        assert_eq!(settings.server.cors_allow_origin, "https://example.com");
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.transport.heartbeat_interval_ms, 5000);
        assert_eq!(settings.transport.sink_capacity, 16);
        assert_eq!(settings.transport.orphaned_replies, OrphanReplyPolicy::Drop);
        assert_eq!(
            settings.transport.duplicate_sessions,
            DuplicateSessionPolicy::Overwrite
        );
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let env = env_from(&[
            ("MCP_SSE_PORT", "99999"),
            ("MCP_TIMEOUT", "soon"),
            ("SWITCHYARD_ORPHANED_REPLIES", "maybe"),
            ("LOG_LEVEL", ""),
        ]);
        let settings = load_settings_with(Path::new("/nonexistent/settings.json"), env).unwrap();
        assert_eq!(settings.server.port, 3200);
        assert_eq!(settings.server.request_timeout_ms, 180_000);
        assert_eq!(settings.transport.orphaned_replies, OrphanReplyPolicy::Broadcast);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn rejected_env_values_are_reported() {
        let env = env_from(&[
            ("MCP_SSE_PORT", "99999"),
            ("SWITCHYARD_DUPLICATE_SESSIONS", "sometimes"),
            ("SWITCHYARD_SINK_CAPACITY", "32"),
        ]);
        let (settings, rejected) =
            load_settings_with_report(Path::new("/nonexistent/settings.json"), env).unwrap();
        assert_eq!(settings.transport.sink_capacity, 32);

        let keys: Vec<&str> = rejected.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["MCP_SSE_PORT", "SWITCHYARD_DUPLICATE_SESSIONS"]);
        assert_eq!(rejected[0].value, "99999");
        assert_eq!(rejected[0].expected, "integer in 0..=65535");
    }

    #[test]
    fn valid_env_values_report_nothing() {
        let env = env_from(&[("MCP_SSE_PORT", "4100")]);
        let (_, rejected) =
            load_settings_with_report(Path::new("/nonexistent/settings.json"), env).unwrap();
        assert!(rejected.is_empty());
    }

    #[test]
    fn port_zero_is_allowed() {
        let env = env_from(&[("MCP_SSE_PORT", "0")]);
        let settings = load_settings_with(Path::new("/nonexistent/settings.json"), env).unwrap();
        assert_eq!(settings.server.port, 0);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("1000", 1000, 2000), Some(1000));
        assert_eq!(parse_u64_range("2000", 1000, 2000), Some(2000));
        assert_eq!(parse_u64_range("999", 1000, 2000), None);
        assert_eq!(parse_u64_range(" 1500 ", 1000, 2000), Some(1500));
        assert_eq!(parse_u64_range("abc", 1000, 2000), None);
    }

    #[test]
    fn parse_enum_is_case_insensitive() {
        assert_eq!(parse_enum::<LogFormat>("JSON"), Some(LogFormat::Json));
        assert_eq!(parse_enum::<LogFormat>("yaml"), None);
    }

    #[test]
    fn default_path_under_home() {
        let path = settings_path();
        assert!(path.ends_with(".switchyard/settings.json"));
    }
}
