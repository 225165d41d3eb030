//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a config file is given, deep-merge its JSON over the defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use beacon_telemetry::{LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Configuration for the Beacon server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Upgrades beyond this many live sockets are refused with 503.
    pub max_connections: usize,
    /// Per-connection outbound queue depth.
    pub send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// A socket that has not answered a ping for this long is closed.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// SQLite file. `None` means in-memory.
    pub database_path: Option<PathBuf>,
    /// `development`, `production`, `test`, ...
    pub environment: String,
    /// Service name reported by `/health`.
    pub name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub logging_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            max_connections: 1024,
            send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            database_path: None,
            environment: "development".into(),
            name: "beacon".into(),
            log_level: "info".into(),
            log_format: LogFormat::Json,
            logging_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_production() && self.database_path.is_none() {
            return Err(ConfigError::Invalid(
                "database_path is required in production".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.send_queue == 0 {
            return Err(ConfigError::Invalid("send_queue must be at least 1".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_secs must not be shorter than heartbeat_interval_secs".into(),
            ));
        }
        Ok(())
    }

    /// Logging settings derived from this config.
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            enabled: self.logging_enabled,
            ..TelemetryConfig::default()
        }
        .with_level_name(&self.log_level)
    }
}

/// Load configuration from an optional JSON file plus the process environment.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`], reading overrides through `lookup` instead of the
/// process environment.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> Result<ServerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading config file");
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?;
            let file: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, file)
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, lookup);
    config.validate()?;
    Ok(config)
}

/// Recursive merge of two JSON values.
///
/// - Objects are merged per key (source wins)
/// - Arrays and primitives are replaced by source
/// - Null values in source are skipped
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

/// Apply environment overrides. Invalid values are logged and ignored.
///
/// | variable | field |
/// |---|---|
/// | `BEACON_HOST` | `host` |
/// | `BEACON_PORT`, then `PORT` | `port` |
/// | `BEACON_DATABASE` | `database_path` |
/// | `BEACON_MAX_CONNECTIONS` | `max_connections` |
/// | `BEACON_ENV` | `environment` |
/// | `LOG_LEVEL` | `log_level` |
/// | `LOGGING_ENABLED` | `logging_enabled` |
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("BEACON_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u16("BEACON_PORT").or_else(|| env.u16("PORT")) {
        config.port = v;
    }
    if let Some(v) = env.string("BEACON_DATABASE") {
        config.database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env.usize("BEACON_MAX_CONNECTIONS", 1, 1_000_000) {
        config.max_connections = v;
    }
    if let Some(v) = env.string("BEACON_ENV") {
        config.environment = v;
    }
    if let Some(v) = env.string("LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = env.bool("LOGGING_ENABLED") {
        config.logging_enabled = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

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
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str) -> Option<u16> {
        let val = self.string(name)?;
        let result = val.parse::<u16>().ok();
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid port env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
