//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`KgateSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `KGATE_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::KgateSettings;

/// Default settings file, `~/.kgate/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".kgate").join("settings.json")
}

/// Load from the default path with env overrides.
pub fn load_settings() -> Result<KgateSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<KgateSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file(path: &Path) -> Result<KgateSettings> {
    let defaults = serde_json::to_value(KgateSettings::default())?;

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

/// Apply `KGATE_*` overrides.
///
/// Invalid values are logged and ignored, keeping the file/default value.
pub fn apply_env_overrides(settings: &mut KgateSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup; `apply_env_overrides` passes
/// the process environment.
pub fn apply_overrides(settings: &mut KgateSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let millis = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid millisecond env var, ignoring");
        }
        parsed
    };

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = string("KGATE_GATEWAY_URL") {
        settings.gateway.base_url = v;
    }
    if let Some(v) = string("KGATE_WS_URL") {
        settings.gateway.ws_url = Some(v);
    }
    if let Some(v) = string("KGATE_AUTH_TOKEN") {
        settings.gateway.auth_token = Some(v);
    }

    // ── Kernel ──────────────────────────────────────────────────────
    if let Some(v) = string("KGATE_DEFAULT_SPEC") {
        settings.kernel.default_spec = v;
    }
    if let Some(v) = millis("KGATE_LAUNCH_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.kernel.launch_timeout_ms = v;
    }
    if let Some(v) = millis("KGATE_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.kernel.connect_timeout_ms = v;
    }
    if let Some(v) = millis("KGATE_KEEPALIVE_INTERVAL_MS", 1_000, 3_600_000) {
        settings.kernel.keepalive_interval_ms = v;
    }
    if let Some(v) = millis("KGATE_EXECUTE_TIMEOUT_MS", 100, 86_400_000) {
        settings.kernel.execute_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("KGATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(val) = lookup("KGATE_LOG_JSON") {
        match parse_bool(&val) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "KGATE_LOG_JSON", value = %val, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
