//! Engine
//!
//! Process-scoped wiring: one catalog, one recorder/dispatcher pair, one
//! orchestrator and one monitor registry, created once at startup and torn
//! down once at shutdown.

use crate::config::SurgeConfig;
use crate::dispatcher::{
    DispatcherSnapshot, FlushReport, NotificationSink, ReportDispatcher, sink_from_config,
};
use crate::emitter::{self, Emitter};
use crate::error::{CampaignError, EngineError, ExitStatus, ValidationError};
use crate::metrics::SurgeMetrics;
use crate::monitor::{MonitorRegistry, MonitorStatus};
use crate::orchestrator::{CampaignRequest, CampaignStatus, Orchestrator};
use crate::profile::ProfileCatalog;
use crate::telemetry::TelemetryRecorder;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of [`Engine::shutdown`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub campaigns: Vec<CampaignStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub monitors: Vec<MonitorStatus>,
    pub delivery: DispatcherSnapshot,
    pub final_flush: FlushReport,
    pub evicted: u64,
    #[serde(skip)]
    pub status: ExitStatus,
}

pub struct Engine {
    config: SurgeConfig,
    catalog: Arc<ProfileCatalog>,
    rejected: Vec<(String, ValidationError)>,
    recorder: Arc<TelemetryRecorder>,
    dispatcher: Arc<ReportDispatcher>,
    orchestrator: Arc<Orchestrator>,
    monitors: Arc<MonitorRegistry>,
    metrics: Arc<SurgeMetrics>,
    token: CancellationToken,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build everything and start the dispatcher loop. Must be called inside
    /// a tokio runtime.
    pub fn start(
        config: SurgeConfig,
        emitter: Arc<dyn Emitter>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let metrics = Arc::new(SurgeMetrics::new()?);

        let (catalog, rejected) = config.catalog();
        let catalog = Arc::new(catalog);
        let recorder = Arc::new(
            TelemetryRecorder::new(config.telemetry.buffer_capacity)
                .with_metrics(Arc::clone(&metrics)),
        );
        let dispatcher = Arc::new(
            ReportDispatcher::new(sink, &config.sink).with_metrics(Arc::clone(&metrics)),
        );
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&catalog),
                emitter,
                Arc::clone(&recorder),
                Arc::clone(&dispatcher),
            )
            .with_metrics(Arc::clone(&metrics))
            .with_retention(config.retained_campaigns),
        );
        let monitors = Arc::new(
            MonitorRegistry::new(config.monitor.clone(), Arc::clone(&dispatcher))
                .with_metrics(Arc::clone(&metrics)),
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dispatcher).run(Arc::clone(&recorder), token.clone()));

        info!(
            profiles = catalog.len(),
            rejected = rejected.len(),
            sink = config.sink.url.as_deref().unwrap_or("log"),
            dry_run = config.emitter.dry_run,
            "Engine started"
        );

        Ok(Self {
            config,
            catalog,
            rejected,
            recorder,
            dispatcher,
            orchestrator,
            monitors,
            metrics,
            token,
            dispatcher_task: Mutex::new(Some(task)),
        })
    }

    /// Emitter and sink chosen by the configuration.
    pub fn from_config(config: SurgeConfig) -> Result<Self, EngineError> {
        let emitter = emitter::from_config(&config.emitter)?;
        let sink = sink_from_config(&config.sink)?;
        Self::start(config, emitter, sink)
    }

    pub fn config(&self) -> &SurgeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    /// Profile entries that failed to load.
    pub fn rejected_profiles(&self) -> &[(String, ValidationError)] {
        &self.rejected
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    pub fn recorder(&self) -> &Arc<TelemetryRecorder> {
        &self.recorder
    }

    pub fn dispatcher(&self) -> &Arc<ReportDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<SurgeMetrics> {
        &self.metrics
    }

    /// Start a campaign and wait for it to finish.
    pub async fn run_campaign(&self, request: CampaignRequest) -> Result<CampaignStatus, CampaignError> {
        let id = self.orchestrator.start(request).await?;
        self.orchestrator.wait(id).await
    }

    /// Cancel campaigns and monitors, stop the dispatcher loop and flush
    /// what is left within `shutdownTimeoutMs`.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Engine shutting down");
        self.orchestrator.shutdown().await;
        self.monitors.shutdown().await;

        let deadline = Instant::now() + self.config.shutdown_timeout();
        self.token.cancel();
        let task = self.dispatcher_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("Dispatcher loop did not stop before the deadline, aborting it");
                task.abort();
                let _ = task.await;
            }
        }

        let final_flush = self.dispatcher.shutdown_flush(&self.recorder, deadline).await;
        let delivery = self.dispatcher.stats();
        let evicted = self.recorder.evicted();
        let status = if delivery.lost_events > 0 || evicted > 0 {
            ExitStatus::PartialDeliveryLoss
        } else {
            ExitStatus::Success
        };

        info!(
            delivered = delivery.delivered_events,
            lost = delivery.lost_events,
            evicted,
            exit_code = status.code(),
            "Engine stopped"
        );

        ShutdownReport {
            campaigns: self.orchestrator.status_all(),
            monitors: self.monitors.status_all(),
            delivery,
            final_flush,
            evicted,
            status,
        }
    }
}
