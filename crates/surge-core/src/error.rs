//! Error taxonomy
//!
//! Each failure class has its own type because each one propagates
//! differently:
//! - [`ValidationError`] rejects a profile before any campaign can use it.
//! - [`TransmissionError`] is per-unit data, folded into a failed
//!   [`EmissionEvent`](crate::telemetry::EmissionEvent).
//! - [`DeliveryError`] is retried by the dispatcher and eventually counted.
//! - [`CampaignError`] stops a campaign from ever emitting.
//! - [`MonitorError`] keeps a target monitor from starting.

use std::io;
use thiserror::Error;

/// A profile failed validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("profile name must not be empty")]
    EmptyName,
    #[error("protocol mix is empty")]
    EmptyProtocolMix,
    #[error("weight for {protocol} is not a finite non-negative number: {weight}")]
    InvalidWeight { protocol: String, weight: f64 },
    #[error("protocol weights sum to {sum}, expected 1.0")]
    WeightSum { sum: f64 },
    #[error("target rate must be finite and > 0, got {0}")]
    NonPositiveRate(f64),
    #[error("burstiness must be within [0, {max}], got {0}", max = crate::profile::MAX_BURSTINESS)]
    BurstinessOutOfRange(f64),
    #[error("payload size range is inverted: min {min} > max {max}")]
    InvertedPayloadRange { min: u32, max: u32 },
    #[error("payload size max {max} exceeds limit {limit}")]
    PayloadTooLarge { max: u32, limit: u32 },
    #[error("anomaly rate must be within [0, 1], got {0}")]
    AnomalyRateOutOfRange(f64),
    #[error("exactly one of count or duration must be set")]
    RunLimitAmbiguous,
    #[error("count must be > 0")]
    ZeroCount,
    #[error("duration must be finite and > 0 seconds, got {0}")]
    InvalidDuration(f64),
    #[error("port list is empty")]
    EmptyPorts,
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u16),
    #[error("mutator list is empty")]
    EmptyMutators,
    #[error("malformed profile entry: {0}")]
    Malformed(String),
}

/// Lookup failures in the profile catalog.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CatalogError {
    #[error("profile not found: {0}")]
    NotFound(String),
}

/// A single unit could not be put on the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransmissionError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("destination unreachable: {0}")]
    Unreachable(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("send timed out")]
    Timeout,
    #[error("packet encoding failed: {0}")]
    Encode(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("http error: {0}")]
    Http(String),
}

impl TransmissionError {
    /// Short machine-readable tag carried in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::Unreachable(_) => "unreachable",
            Self::InvalidAddress(_) => "invalid_address",
            Self::Timeout => "timeout",
            Self::Encode(_) => "encode",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
        }
    }
}

impl From<io::Error> for TransmissionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                Self::InvalidAddress(e.to_string())
            }
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable => Self::Unreachable(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for TransmissionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Unreachable(e.to_string())
        } else if e.is_builder() {
            Self::InvalidAddress(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// A telemetry push to the notification sink failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery attempt timed out after {0} ms")]
    Timeout(u64),
    #[error("sink rejected batch with status {0}")]
    Rejected(u16),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("payload could not be serialized: {0}")]
    Serialize(String),
    #[error("batch of {events} events lost after {attempts} attempts")]
    Exhausted { events: usize, attempts: u32 },
}

/// Unrecoverable fault that keeps a campaign from starting.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CampaignError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("target {target} is invalid: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("target {target} could not be resolved: {reason}")]
    Unresolvable { target: String, reason: String },
    #[error("campaign not found: {0}")]
    UnknownCampaign(String),
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// A target monitor could not be started or found.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MonitorError {
    /// Malformed or unresolvable target, or the engine is shutting down.
    #[error(transparent)]
    Target(#[from] CampaignError),
    #[error("invalid monitor settings: {0}")]
    Invalid(String),
    #[error("monitor not found: {0}")]
    UnknownMonitor(String),
}

/// Configuration file problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure to assemble the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("emitter setup failed: {0}")]
    Emitter(#[from] TransmissionError),
    #[error("sink setup failed: {0}")]
    Sink(#[from] DeliveryError),
}

/// Process exit codes for the core's operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    ValidationError,
    TargetUnreachable,
    PartialDeliveryLoss,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::ValidationError => 2,
            Self::TargetUnreachable => 3,
            Self::PartialDeliveryLoss => 4,
        }
    }
}

impl From<&CampaignError> for ExitStatus {
    fn from(e: &CampaignError) -> Self {
        match e {
            CampaignError::Catalog(_)
            | CampaignError::Validation(_)
            | CampaignError::InvalidTarget { .. } => Self::ValidationError,
            CampaignError::Unresolvable { .. } => Self::TargetUnreachable,
            CampaignError::UnknownCampaign(_) | CampaignError::ShuttingDown => Self::Failure,
        }
    }
}

impl From<&MonitorError> for ExitStatus {
    fn from(e: &MonitorError) -> Self {
        match e {
            MonitorError::Target(e) => Self::from(e),
            MonitorError::Invalid(_) => Self::ValidationError,
            MonitorError::UnknownMonitor(_) => Self::Failure,
        }
    }
}
