//! Target Monitor
//!
//! Periodic health checks against a target, independent of any campaign.
//! Every round opens a TCP connection to each watched port with a short
//! deadline and classifies the port as open, closed (refused) or filtered
//! (no answer). A host that answers on any port, even with a refusal, is
//! reachable. Each round is pushed to the sink as a health report.

use crate::dispatcher::ReportDispatcher;
use crate::error::{CampaignError, MonitorError};
use crate::metrics::SurgeMetrics;
use crate::profile::DEFAULT_PORTS;
use crate::target::Target;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Pause between rounds.
    pub interval_ms: u64,
    /// Deadline for a single port connect.
    pub connect_timeout_ms: u64,
    /// Ports checked when a request names none.
    pub ports: Vec<u16>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            connect_timeout_ms: 1_000,
            ports: DEFAULT_PORTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortCheck {
    pub port: u16,
    pub state: PortState,
    /// Connect time for ports that answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_millis: Option<f64>,
}

/// One monitoring round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub monitor_id: Uuid,
    pub target: String,
    pub address: IpAddr,
    pub round: u64,
    pub reachable: bool,
    pub ports: Vec<PortCheck>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn open_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .filter(|c| c.state == PortState::Open)
            .map(|c| c.port)
    }
}

fn classify(result: Result<io::Result<TcpStream>, tokio::time::error::Elapsed>) -> PortState {
    match result {
        Ok(Ok(_)) => PortState::Open,
        Ok(Err(e)) => match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => PortState::Closed,
            io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable => PortState::Filtered,
            _ => PortState::Error,
        },
        Err(_) => PortState::Filtered,
    }
}

/// Connect to one port within `timeout`.
pub async fn check_port(address: IpAddr, port: u16, timeout: Duration) -> PortCheck {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(address, port))).await;
    let state = classify(result);
    let latency_millis = matches!(state, PortState::Open | PortState::Closed)
        .then(|| started.elapsed().as_secs_f64() * 1000.0);
    PortCheck {
        port,
        state,
        latency_millis,
    }
}

/// Check every port concurrently. Results are ordered by port.
pub async fn check_ports(address: IpAddr, ports: &[u16], timeout: Duration) -> Vec<PortCheck> {
    let mut set = JoinSet::new();
    for &port in ports {
        set.spawn(check_port(address, port, timeout));
    }
    let mut checks = Vec::with_capacity(ports.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(check) => checks.push(check),
            Err(e) => warn!(error = %e, "Port check task failed"),
        }
    }
    checks.sort_by_key(|c| c.port);
    checks
}

/// Start request from the control surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRequest {
    pub target: String,
    /// Overrides the configured port list. A port in the target string wins
    /// over both.
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub id: Uuid,
    pub target: String,
    pub ports: Vec<u16>,
    pub interval_ms: u64,
    pub active: bool,
    pub rounds: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<HealthReport>,
}

struct Monitor {
    id: Uuid,
    target: String,
    address: IpAddr,
    ports: Vec<u16>,
    interval: Duration,
    connect_timeout: Duration,
    token: CancellationToken,
    rounds: AtomicU64,
    last: Mutex<Option<HealthReport>>,
    started_at: DateTime<Utc>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
}

impl Monitor {
    fn status(&self) -> MonitorStatus {
        let ended_at = *self.ended_at.lock();
        MonitorStatus {
            id: self.id,
            target: self.target.clone(),
            ports: self.ports.clone(),
            interval_ms: self.interval.as_millis() as u64,
            active: ended_at.is_none() && !self.token.is_cancelled(),
            rounds: self.rounds.load(Ordering::Relaxed),
            started_at: self.started_at,
            ended_at,
            last: self.last.lock().clone(),
        }
    }

    async fn round(&self) -> HealthReport {
        let ports = check_ports(self.address, &self.ports, self.connect_timeout).await;
        let reachable = ports
            .iter()
            .any(|c| matches!(c.state, PortState::Open | PortState::Closed));
        HealthReport {
            monitor_id: self.id,
            target: self.target.clone(),
            address: self.address,
            round: self.rounds.fetch_add(1, Ordering::Relaxed),
            reachable,
            ports,
            timestamp: Utc::now(),
        }
    }
}

/// Owns every target monitor. Monitors run until stopped or until the
/// registry shuts down.
pub struct MonitorRegistry {
    config: MonitorConfig,
    dispatcher: Arc<ReportDispatcher>,
    metrics: Option<Arc<SurgeMetrics>>,
    monitors: RwLock<HashMap<Uuid, Arc<Monitor>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    root: CancellationToken,
}

impl MonitorRegistry {
    pub fn new(config: MonitorConfig, dispatcher: Arc<ReportDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            metrics: None,
            monitors: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve the target and start checking it on an interval.
    pub async fn start(&self, request: MonitorRequest) -> Result<Uuid, MonitorError> {
        if self.root.is_cancelled() {
            return Err(CampaignError::ShuttingDown.into());
        }
        let target = Target::parse(&request.target)?;
        let ports = match (target.port, request.ports) {
            (Some(port), _) => vec![port],
            (None, Some(ports)) => ports,
            (None, None) => self.config.ports.clone(),
        };
        if ports.is_empty() {
            return Err(MonitorError::Invalid("port list is empty".to_string()));
        }
        if ports.contains(&0) {
            return Err(MonitorError::Invalid("port 0 cannot be checked".to_string()));
        }
        let interval_ms = request.interval_ms.unwrap_or(self.config.interval_ms);
        if interval_ms == 0 {
            return Err(MonitorError::Invalid("interval must be > 0".to_string()));
        }
        let address = target.resolve().await?;

        let monitor = Arc::new(Monitor {
            id: Uuid::new_v4(),
            target: target.to_string(),
            address,
            ports,
            interval: Duration::from_millis(interval_ms),
            connect_timeout: Duration::from_millis(self.config.connect_timeout_ms.max(1)),
            token: self.root.child_token(),
            rounds: AtomicU64::new(0),
            last: Mutex::new(None),
            started_at: Utc::now(),
            ended_at: Mutex::new(None),
        });
        let id = monitor.id;

        let mut tasks = self.tasks.lock();
        if self.root.is_cancelled() {
            return Err(CampaignError::ShuttingDown.into());
        }
        self.monitors.write().insert(id, Arc::clone(&monitor));
        info!(
            monitor = %id,
            target = %monitor.target,
            %address,
            ports = ?monitor.ports,
            interval_ms,
            "Monitor started"
        );
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(run_monitor(
            monitor,
            Arc::clone(&self.dispatcher),
            self.metrics.clone(),
        )));
        Ok(id)
    }

    fn monitor(&self, id: Uuid) -> Result<Arc<Monitor>, MonitorError> {
        self.monitors
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| MonitorError::UnknownMonitor(id.to_string()))
    }

    /// Stop a monitor. Stopping one that already ended is a no-op.
    pub fn stop(&self, id: Uuid) -> Result<MonitorStatus, MonitorError> {
        let monitor = self.monitor(id)?;
        monitor.token.cancel();
        Ok(monitor.status())
    }

    pub fn status(&self, id: Uuid) -> Result<MonitorStatus, MonitorError> {
        Ok(self.monitor(id)?.status())
    }

    /// All monitors, oldest first.
    pub fn status_all(&self) -> Vec<MonitorStatus> {
        let mut all: Vec<MonitorStatus> =
            self.monitors.read().values().map(|m| m.status()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Stop every monitor and wait for its task.
    pub async fn shutdown(&self) {
        let handles = {
            let mut tasks = self.tasks.lock();
            self.root.cancel();
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }
}

async fn run_monitor(
    monitor: Arc<Monitor>,
    dispatcher: Arc<ReportDispatcher>,
    metrics: Option<Arc<SurgeMetrics>>,
) {
    let mut ticker = tokio::time::interval(monitor.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = monitor.token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = tokio::select! {
            biased;
            _ = monitor.token.cancelled() => break,
            report = monitor.round() => report,
        };

        if let Some(m) = &metrics {
            for check in &report.ports {
                m.port_checks_total
                    .with_label_values(&[port_state_label(check.state)])
                    .inc();
            }
        }
        debug!(
            monitor = %monitor.id,
            round = report.round,
            reachable = report.reachable,
            "Monitor round finished"
        );
        *monitor.last.lock() = Some(report.clone());
        dispatcher.report_health(report);
    }

    *monitor.ended_at.lock() = Some(Utc::now());
    info!(
        monitor = %monitor.id,
        target = %monitor.target,
        rounds = monitor.rounds.load(Ordering::Relaxed),
        "Monitor stopped"
    );
}

fn port_state_label(state: PortState) -> &'static str {
    match state {
        PortState::Open => "open",
        PortState::Closed => "closed",
        PortState::Filtered => "filtered",
        PortState::Error => "error",
    }
}
