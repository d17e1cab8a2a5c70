//! Configuration
//!
//! One JSON document. Every section has defaults, so a partial file (or
//! none at all) is valid. Profiles are kept as raw JSON values here and
//! validated one by one when the catalog is built, so a malformed entry
//! does not take the rest down with it.

use crate::dispatcher::SinkConfig;
use crate::emitter::EmitterConfig;
use crate::error::{ConfigError, ValidationError};
use crate::monitor::MonitorConfig;
use crate::orchestrator::DEFAULT_RETAINED_CAMPAIGNS;
use crate::profile::ProfileCatalog;
use crate::telemetry::DEFAULT_BUFFER_CAPACITY;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
    pub buffer_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SurgeConfig {
    pub sink: SinkConfig,
    pub telemetry: TelemetryConfig,
    pub emitter: EmitterConfig,
    pub monitor: MonitorConfig,
    /// Bound on the final telemetry flush at shutdown.
    pub shutdown_timeout_ms: u64,
    /// Finished campaigns kept for status queries.
    pub retained_campaigns: usize,
    /// Profile name -> profile fields. Empty means the built-in set.
    pub profiles: BTreeMap<String, Value>,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            telemetry: TelemetryConfig::default(),
            emitter: EmitterConfig::default(),
            monitor: MonitorConfig::default(),
            shutdown_timeout_ms: 10_000,
            retained_campaigns: DEFAULT_RETAINED_CAMPAIGNS,
            profiles: BTreeMap::new(),
        }
    }
}

impl SurgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: SurgeConfig = serde_json::from_str(raw)?;
        config.sink.resolve_token();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sink = &self.sink;
        if sink.batch_size == 0 {
            return Err(ConfigError::Invalid("sink.batchSize must be > 0".into()));
        }
        if sink.max_attempts == 0 {
            return Err(ConfigError::Invalid("sink.maxAttempts must be > 0".into()));
        }
        if sink.flush_interval_ms == 0 || sink.summary_interval_ms == 0 {
            return Err(ConfigError::Invalid("sink intervals must be > 0".into()));
        }
        if sink.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sink.attemptTimeoutMs must be > 0".into()));
        }
        if sink.max_delay_ms < sink.base_delay_ms {
            return Err(ConfigError::Invalid(
                "sink.maxDelayMs must be >= sink.baseDelayMs".into(),
            ));
        }
        if let Some(url) = &sink.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("sink.url is not http(s): {url}")));
            }
        }
        if self.telemetry.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("telemetry.bufferCapacity must be > 0".into()));
        }
        let monitor = &self.monitor;
        if monitor.interval_ms == 0 || monitor.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("monitor intervals must be > 0".into()));
        }
        if monitor.ports.is_empty() || monitor.ports.contains(&0) {
            return Err(ConfigError::Invalid(
                "monitor.ports must list ports within 1..=65535".into(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Build the catalog. Rejected entries are returned alongside it.
    pub fn catalog(&self) -> (ProfileCatalog, Vec<(String, ValidationError)>) {
        if self.profiles.is_empty() {
            ProfileCatalog::from_entries(builtin_profiles())
        } else {
            ProfileCatalog::from_entries(self.profiles.clone())
        }
    }
}

/// Profiles available without any configuration.
pub fn builtin_profiles() -> BTreeMap<String, Value> {
    BTreeMap::from([
        (
            "baseline".to_string(),
            json!({
                "protocolMix": {"TCP": 0.7, "UDP": 0.3},
                "targetRatePerSecond": 50.0,
                "burstiness": 0.2,
                "payloadSizeRange": [64, 1500],
                "anomalyRate": 0.1,
                "count": 1000
            }),
        ),
        (
            "steady-tcp".to_string(),
            json!({
                "protocolMix": {"TCP": 1.0},
                "targetRatePerSecond": 100.0,
                "burstiness": 0.0,
                "payloadSizeRange": [1024, 1024],
                "anomalyRate": 0.0,
                "durationSecs": 30.0
            }),
        ),
        (
            "web-mix".to_string(),
            json!({
                "protocolMix": {"HTTP": 0.5, "HTTPS": 0.3, "ICMP": 0.2},
                "targetRatePerSecond": 20.0,
                "burstiness": 0.5,
                "payloadSizeRange": [0, 4096],
                "anomalyRate": 0.05,
                "durationSecs": 60.0
            }),
        ),
        (
            "hostile".to_string(),
            json!({
                "protocolMix": {"TCP": 0.3, "UDP": 0.3, "ICMP": 0.2, "HTTP": 0.2},
                "targetRatePerSecond": 200.0,
                "burstiness": 1.5,
                "payloadSizeRange": [0, 9000],
                "anomalyRate": 0.6,
                "count": 5000,
                "ports": [22, 23, 445, 3389, 5900]
            }),
        ),
    ])
}
