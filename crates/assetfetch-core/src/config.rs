use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use assetfetch_throttle::{FairnessPolicy, RegistryConfig};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tunables for the fetch pipeline. Every field has a default; a TOML file
/// only needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Concurrent HTTP requests allowed per destination host.
    pub concurrency_per_destination: usize,
    /// Concurrent HTTP requests allowed across all destinations.
    pub max_http_connections: usize,
    /// Workers allowed in the HTTP stage at once.
    pub http_max_requests: usize,
    /// HTTP stage floor kept even while over the bandwidth throttle.
    pub http_min_requests: usize,
    /// Bandwidth (kbit/s) above which new HTTP requests are held back.
    pub http_throttle_kbps: f64,
    /// Extra attempts after a failed HTTP request.
    pub http_max_retries: u32,
    /// Seconds to wait for an HTTP response before giving up on the asset.
    pub fetch_timeout_secs: u64,
    /// Prefer HTTP when an origin can be resolved.
    pub use_http: bool,
    /// Minimum gap between packet request flushes.
    pub request_interval_ms: u64,
    /// Requests per outbound packet message.
    pub images_per_request: usize,
    /// Re-send an outstanding packet request after this many seconds.
    pub lazy_flush_secs: u64,
    /// Minimum age before a priority change re-sends a packet request.
    pub min_request_secs: u64,
    /// Priority change that warrants re-sending a packet request.
    pub min_delta_priority: f32,
    /// Caller priority mapped to the top of the scheduling range.
    pub max_decode_priority: f32,
    /// Processing loop housekeeping period.
    pub tick_ms: u64,
    /// How long a failing origin stays on the fail-list.
    pub fail_list_ttl_secs: u64,
    /// Errors after which a listed origin is skipped.
    pub fail_list_max_errors: u32,
    pub fairness: FairnessConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency_per_destination: 8,
            max_http_connections: 64,
            http_max_requests: 8,
            http_min_requests: 2,
            http_throttle_kbps: 2000.0,
            http_max_retries: 3,
            fetch_timeout_secs: 15,
            use_http: true,
            request_interval_ms: 100,
            images_per_request: 50,
            lazy_flush_secs: 10,
            min_request_secs: 1,
            min_delta_priority: 1000.0,
            max_decode_priority: 2_000_000.0,
            tick_ms: 50,
            fail_list_ttl_secs: 60,
            fail_list_max_errors: 20,
            fairness: FairnessConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct FairnessConfig {
    /// Alternate between approved classes when their queues are equally deep.
    pub alternate_on_tie: bool,
    /// Rotate best-effort classes on every dequeue.
    pub rotate_best_effort: bool,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        let policy = FairnessPolicy::default();
        Self {
            alternate_on_tie: policy.alternate_on_tie,
            rotate_best_effort: policy.rotate_best_effort,
        }
    }
}

impl From<FairnessConfig> for FairnessPolicy {
    fn from(cfg: FairnessConfig) -> Self {
        FairnessPolicy {
            alternate_on_tie: cfg.alternate_on_tie,
            rotate_best_effort: cfg.rotate_best_effort,
        }
    }
}

impl FetchConfig {
    /// Defaults overridden by `ASSETFETCH_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        self.concurrency_per_destination = env_usize(
            "ASSETFETCH_CONCURRENCY_PER_DESTINATION",
            self.concurrency_per_destination,
        )
        .clamp(1, 256);
        self.max_http_connections =
            env_usize("ASSETFETCH_MAX_HTTP_CONNECTIONS", self.max_http_connections).clamp(1, 4096);
        self.http_max_requests =
            env_usize("ASSETFETCH_HTTP_MAX_REQUESTS", self.http_max_requests).clamp(1, 1024);
        self.http_min_requests =
            env_usize("ASSETFETCH_HTTP_MIN_REQUESTS", self.http_min_requests)
                .min(self.http_max_requests);
        self.http_throttle_kbps =
            env_f64("ASSETFETCH_HTTP_THROTTLE_KBPS", self.http_throttle_kbps).max(0.0);
        self.http_max_retries =
            env_u64("ASSETFETCH_HTTP_MAX_RETRIES", self.http_max_retries as u64).min(32) as u32;
        self.fetch_timeout_secs =
            env_u64("ASSETFETCH_FETCH_TIMEOUT_SECS", self.fetch_timeout_secs).clamp(1, 3600);
        self.use_http = env_flag("ASSETFETCH_USE_HTTP").unwrap_or(self.use_http);
        self.request_interval_ms =
            env_u64("ASSETFETCH_REQUEST_INTERVAL_MS", self.request_interval_ms).clamp(10, 10_000);
        self.images_per_request =
            env_usize("ASSETFETCH_IMAGES_PER_REQUEST", self.images_per_request).clamp(1, 255);
        self.tick_ms = env_u64("ASSETFETCH_TICK_MS", self.tick_ms).clamp(5, 1_000);
        self.fail_list_ttl_secs =
            env_u64("ASSETFETCH_FAIL_LIST_TTL_SECS", self.fail_list_ttl_secs);
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            concurrency_per_destination: self.concurrency_per_destination.max(1),
            fairness: self.fairness.into(),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn lazy_flush(&self) -> Duration {
        Duration::from_secs(self.lazy_flush_secs)
    }

    pub fn min_request_time(&self) -> Duration {
        Duration::from_secs(self.min_request_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn fail_list_ttl(&self) -> Duration {
        Duration::from_secs(self.fail_list_ttl_secs)
    }

    /// Attempts allowed for a generic HTTP failure, first try included.
    pub fn http_max_attempts(&self) -> u32 {
        self.http_max_retries + 1
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(FetchConfig);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing [`FetchConfig`].
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(FetchConfig);
    serde_json::to_value(&schema).expect("schema json")
}

/// Load a TOML config, validate it against the schema, then apply
/// environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<FetchConfig> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let raw: toml::Value = toml::from_str(&content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let mut cfg: FetchConfig = toml::from_str(&content)?;
    cfg.apply_env();
    Ok(cfg)
}
