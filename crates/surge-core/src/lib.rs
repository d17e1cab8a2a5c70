//! Surge Core - profile-driven traffic generation
//!
//! Builds TCP/UDP/ICMP/HTTP(S) traffic from named profiles, paces it, puts it
//! on the wire and streams per-unit telemetry to a notification sink with
//! at-least-once delivery. Targets can also be watched with periodic port
//! checks whose reports travel the same delivery path.
//!
//! Data flow per tick:
//! `Orchestrator -> RateScheduler -> PacketFactory -> Emitter -> TelemetryRecorder -> ReportDispatcher`

pub mod config;
pub mod dispatcher;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod packet;
pub mod profile;
pub mod scheduler;
pub mod target;
pub mod telemetry;

pub use config::SurgeConfig;
pub use dispatcher::{
    CampaignNotice, HttpSink, LogSink, NotificationSink, ReportDispatcher, RetryPolicy,
    SinkConfig, SinkPayload,
};
pub use emitter::{DryRunEmitter, Emitter, EmitterConfig, NetworkEmitter};
pub use engine::{Engine, ShutdownReport};
pub use error::{
    CampaignError, CatalogError, ConfigError, DeliveryError, EngineError, ExitStatus,
    MonitorError, TransmissionError, ValidationError,
};
pub use factory::PacketFactory;
pub use metrics::SurgeMetrics;
pub use monitor::{
    HealthReport, MonitorConfig, MonitorRegistry, MonitorRequest, MonitorStatus, PortCheck,
    PortState,
};
pub use orchestrator::{CampaignRequest, CampaignState, CampaignStatus, Orchestrator};
pub use packet::TrafficUnit;
pub use profile::{Mutator, Profile, ProfileCatalog, ProfileSpec, Protocol, RunLimit};
pub use scheduler::RateScheduler;
pub use target::{Endpoint, Target};
pub use telemetry::{EmissionEvent, Outcome, TelemetryRecorder, TelemetrySummary};
