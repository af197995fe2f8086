//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.kiot/config.json`) and environment.
//! Every field has a default, so an empty `{}` (or a missing file) is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Connection, heartbeat and routing settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Bounded retry for create-or-replace flows of the device facade.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Server address, liveness timers and routing options for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Server host (default "localhost"). Overridden by KIOT_HOST env.
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port for both WebSocket and HTTP (default 7512).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Idle window before a heartbeat ping is sent (default 60s).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Window for the ping acknowledgment before the connection is declared dead (default 10s).
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Fixed delay between reconnection attempts (default 5s).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Default deadline for awaited requests. `null` disables the deadline.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: Option<u64>,

    /// Replay standing subscriptions after a reconnect (default true).
    #[serde(default = "default_resubscribe")]
    pub resubscribe_on_reconnect: bool,

    /// Field of a notification's `_source` used as subscription subject key.
    #[serde(default = "default_subject_field")]
    pub subject_field: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7512
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_ping_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_resubscribe() -> bool {
    true
}

fn default_subject_field() -> String {
    "device_id".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            resubscribe_on_reconnect: default_resubscribe(),
            subject_field: default_subject_field(),
        }
    }
}

impl GatewayConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:7512`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host.trim(), self.port)
    }

    /// HTTP base URL, e.g. `http://localhost:7512`.
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host.trim(), self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Retry settings: attempts include the first try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Resolve the server host: env KIOT_HOST overrides config.
pub fn resolve_host(config: &Config) -> String {
    std::env::var("KIOT_HOST")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .unwrap_or_else(|| config.gateway.host.trim().to_string())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("KIOT_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".kiot").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or KIOT_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.gateway.host = resolve_host(&config);
    Ok((config, path))
}
