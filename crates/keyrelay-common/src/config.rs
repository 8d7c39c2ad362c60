use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config field {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > file > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub queue: QueueConfig,
    pub keys: KeysConfig,
    pub checks: CheckConfig,
    pub upstream: UpstreamConfig,
    /// Permit AWS keys whose account has model invocation logging enabled.
    pub allow_aws_logging: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            proxy: None,
            queue: QueueConfig::default(),
            keys: KeysConfig::default(),
            checks: CheckConfig::default(),
            upstream: UpstreamConfig::default(),
            allow_aws_logging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Requests one identifier may have queued or in flight at once.
    pub concurrency_limit: usize,
    /// Load above which non-streaming requests are refused and heartbeats grow.
    pub load_threshold: usize,
    /// Milliseconds of queue priority lost per token already consumed by the caller.
    pub tokens_punishment_factor: f64,
    pub tick_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub min_heartbeat_size: usize,
    pub max_heartbeat_size: usize,
    pub payload_scale_factor: f64,
    pub stall_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub wait_estimate_interval_ms: u64,
    pub ema_alpha: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            load_threshold: 150,
            tokens_punishment_factor: 0.0,
            tick_ms: 50,
            heartbeat_interval_ms: 5_000,
            min_heartbeat_size: 512,
            max_heartbeat_size: 1024 * 1024,
            payload_scale_factor: 6.0,
            stall_timeout_ms: 5 * 60 * 1000,
            sweep_interval_ms: 20_000,
            wait_estimate_interval_ms: 3_000,
            ema_alpha: 0.3,
        }
    }
}

impl QueueConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn wait_estimate_interval(&self) -> Duration {
        Duration::from_millis(self.wait_estimate_interval_ms)
    }
}

/// Upstream secrets per vendor.
///
/// Composite credentials use `:` separated fields:
/// * aws: `access_key_id:secret_access_key:region`
/// * gcp: `project_id:client_email:region:base64(private_key_pem)`
/// * azure: `resource_name:deployment_id:api_key`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub openai: Vec<String>,
    pub anthropic: Vec<String>,
    pub google_ai: Vec<String>,
    pub mistral_ai: Vec<String>,
    pub aws: Vec<String>,
    pub gcp: Vec<String>,
    pub azure: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Check every key once at startup.
    pub enabled: bool,
    /// Keep re-probing keys after the initial pass.
    pub recurring: bool,
    pub period_ms: u64,
    pub min_interval_ms: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recurring: false,
            period_ms: 60 * 60 * 1000,
            min_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 5 * 60 * 1000,
            stream_idle_timeout_ms: 120_000,
        }
    }
}

impl GatewayConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = &self.queue;
        if queue.concurrency_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.concurrency_limit",
                reason: "must be at least 1",
            });
        }
        if queue.min_heartbeat_size > queue.max_heartbeat_size {
            return Err(ConfigError::Invalid {
                field: "queue.min_heartbeat_size",
                reason: "must not exceed max_heartbeat_size",
            });
        }
        if !(queue.ema_alpha > 0.0 && queue.ema_alpha <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "queue.ema_alpha",
                reason: "must be in (0, 1]",
            });
        }
        if queue.tokens_punishment_factor < 0.0 {
            return Err(ConfigError::Invalid {
                field: "queue.tokens_punishment_factor",
                reason: "must not be negative",
            });
        }
        if queue.tick_ms == 0 || queue.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.tick_ms",
                reason: "timer periods must be positive",
            });
        }
        Ok(())
    }

    pub fn apply(&mut self, patch: GatewayConfigPatch) {
        if let Some(host) = patch.host {
            self.host = host;
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if patch.proxy.is_some() {
            self.proxy = patch.proxy;
        }
        if let Some(limit) = patch.concurrency_limit {
            self.queue.concurrency_limit = limit;
        }
        if let Some(enabled) = patch.check_keys {
            self.checks.enabled = enabled;
        }
        if let Some(allow) = patch.allow_aws_logging {
            self.allow_aws_logging = allow;
        }
    }
}

/// Optional layer used for merging CLI and ENV values over the file config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub concurrency_limit: Option<usize>,
    pub check_keys: Option<bool>,
    pub allow_aws_logging: Option<bool>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.concurrency_limit.is_some() {
            self.concurrency_limit = other.concurrency_limit;
        }
        if other.check_keys.is_some() {
            self.check_keys = other.check_keys;
        }
        if other.allow_aws_logging.is_some() {
            self.allow_aws_logging = other.allow_aws_logging;
        }
    }
}
