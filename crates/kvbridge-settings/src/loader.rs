//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BridgeSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `KVBRIDGE_*` environment overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::BridgeSettings;

/// Resolve the settings file path.
///
/// `KVBRIDGE_CONFIG` wins; otherwise `~/.kvbridge/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("KVBRIDGE_CONFIG").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".kvbridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<BridgeSettings> {
    let defaults = serde_json::to_value(BridgeSettings::default())?;

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

/// Apply `KVBRIDGE_*` environment overrides.
pub fn apply_env_overrides(settings: &mut BridgeSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_overrides<F>(settings: &mut BridgeSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── IPC ─────────────────────────────────────────────────────────
    if let Some(v) = env.string("KVBRIDGE_SOCKET_PATH") {
        settings.ipc.socket_path = PathBuf::from(v);
    }
    if let Some(v) = env.string("KVBRIDGE_TCP_ADDR") {
        settings.ipc.tcp_addr = Some(v);
    }
    if let Some(v) = env.u64("KVBRIDGE_RECONNECT_DELAY_MS", 10, 600_000) {
        settings.ipc.reconnect_delay_ms = v;
    }
    if let Some(v) = env.u64("KVBRIDGE_MAX_RECONNECT_ATTEMPTS", 0, 1_000_000) {
        settings.ipc.max_reconnect_attempts = v as u32;
    }
    if let Some(v) = env.u64("KVBRIDGE_REQUEST_TIMEOUT_MS", 1, 600_000) {
        settings.ipc.request_timeout_ms = v;
    }
    if let Some(v) = env.u64("KVBRIDGE_IDLE_TIMEOUT_MS", 0, 86_400_000) {
        settings.ipc.idle_timeout_ms = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("KVBRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("KVBRIDGE_PORT", 0, 65535) {
        settings.server.port = v;
    }

    // ── Misc ────────────────────────────────────────────────────────
    if let Some(v) = env.string("KVBRIDGE_SCHEMA_PATH") {
        settings.schema_path = PathBuf::from(v);
    }
    if let Some(v) = env.string("KVBRIDGE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("KVBRIDGE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Reject combinations the runtime cannot work with.
pub fn validate(settings: &BridgeSettings) -> Result<()> {
    if settings.ipc.request_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "ipc.request_timeout_ms must be positive".into(),
        ));
    }
    if settings.server.send_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "server.send_buffer must be positive".into(),
        ));
    }
    if settings.server.ping_interval_secs == 0 || settings.registry.cleanup_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "intervals must be positive".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"ipc": {"request_timeout_ms": 5000, "socket_path": "/a"}});
        let source = serde_json::json!({"ipc": {"request_timeout_ms": 100}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["ipc"]["request_timeout_ms"], 100);
        assert_eq!(merged["ipc"]["socket_path"], "/a");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(
            serde_json::json!({"a": {"nested": true}}),
            serde_json::json!({"a": 42}),
        );
        assert_eq!(merged["a"], 42);
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s, BridgeSettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ipc": {{"max_reconnect_attempts": 3}}, "server": {{"port": 9000}}}}"#
        )
        .unwrap();
        let s = load_file_layer(file.path()).unwrap();
        assert_eq!(s.ipc.max_reconnect_attempts, 3);
        assert_eq!(s.ipc.reconnect_delay_ms, 5_000);
        assert_eq!(s.server.port, 9000);
    }

    #[test]
    fn malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = load_file_layer(file.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn wrong_type_in_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"port": "eighty"}}}}"#).unwrap();
        assert!(load_file_layer(file.path()).is_err());
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut s = BridgeSettings::default();
        apply_overrides(
            &mut s,
            lookup_from(&[
                ("KVBRIDGE_SOCKET_PATH", "/run/ds.sock"),
                ("KVBRIDGE_PORT", "8081"),
                ("KVBRIDGE_REQUEST_TIMEOUT_MS", "250"),
                ("KVBRIDGE_LOG_JSON", "yes"),
                ("KVBRIDGE_TCP_ADDR", "127.0.0.1:7000"),
            ]),
        );
        assert_eq!(s.ipc.socket_path, PathBuf::from("/run/ds.sock"));
        assert_eq!(s.server.port, 8081);
        assert_eq!(s.ipc.request_timeout_ms, 250);
        assert!(s.logging.json);
        assert_eq!(s.ipc.tcp_addr.as_deref(), Some("127.0.0.1:7000"));
    }

    #[test]
    fn invalid_overrides_ignored() {
        let mut s = BridgeSettings::default();
        apply_overrides(
            &mut s,
            lookup_from(&[
                ("KVBRIDGE_PORT", "99999"),
                ("KVBRIDGE_REQUEST_TIMEOUT_MS", "soon"),
                ("KVBRIDGE_LOG_JSON", "maybe"),
                ("KVBRIDGE_HOST", ""),
            ]),
        );
        assert_eq!(s, BridgeSettings::default());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut s = BridgeSettings::default();
        s.ipc.request_timeout_ms = 0;
        assert!(matches!(validate(&s), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(validate(&BridgeSettings::default()).is_ok());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for t in ["true", "TRUE", "1", "yes", "on"] {
            assert_eq!(parse_bool(t), Some(true), "{t}");
        }
        for f in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(f), Some(false), "{f}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("5000", 10, 600_000), Some(5000));
        assert_eq!(parse_u64_range("5", 10, 600_000), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }
}
