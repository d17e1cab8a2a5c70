//! Report Dispatcher
//!
//! Delivers telemetry to the notification sink at least once. Each attempt
//! has a hard deadline; failed attempts back off exponentially
//! (`base * 2^attempt`, capped) for a bounded number of attempts. A batch
//! that exhausts its attempts is dropped and counted, so an unreachable sink
//! never grows memory without bound.
//!
//! Besides event batches the dispatcher pushes a cumulative summary on its
//! own interval, plus campaign lifecycle notices and target health reports as
//! they happen. Event batches run on their own loop so a sink that keeps
//! rejecting them cannot hold back summaries or notices.

use crate::error::DeliveryError;
use crate::metrics::SurgeMetrics;
use crate::monitor::HealthReport;
use crate::telemetry::{EmissionEvent, TelemetryRecorder, TelemetrySummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Environment variable consulted when the config carries no sink token.
pub const SINK_TOKEN_ENV: &str = "SURGE_SINK_TOKEN";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkConfig {
    /// Push endpoint. Without one, batches go to the log.
    pub url: Option<String>,
    pub token: Option<String>,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub summary_interval_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            batch_size: 100,
            flush_interval_ms: 1000,
            summary_interval_ms: 30_000,
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            attempt_timeout_ms: 5000,
        }
    }
}

impl SinkConfig {
    /// Fill a missing token from [`SINK_TOKEN_ENV`].
    pub fn resolve_token(&mut self) {
        if self.token.as_deref().is_none_or(str::is_empty) {
            self.token = std::env::var(SINK_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
    }
}

fn redact(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}...{tail}")
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_deref().map(redact))
            .field("batch_size", &self.batch_size)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("summary_interval_ms", &self.summary_interval_ms)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("attempt_timeout_ms", &self.attempt_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Backoff after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every backoff a fully failing delivery goes through.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|a| self.delay_for(a))
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SinkConfig::default())
    }
}

impl From<&SinkConfig> for RetryPolicy {
    fn from(config: &SinkConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Started,
    Stopped,
    Completed,
    Failed,
}

/// Campaign lifecycle message for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignNotice {
    pub kind: NoticeKind,
    pub campaign_id: Uuid,
    pub profile: String,
    pub target: String,
    pub units_emitted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Body pushed to the sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkPayload {
    pub events: Vec<EmissionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TelemetrySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<CampaignNotice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
}

impl SinkPayload {
    pub fn events(events: Vec<EmissionEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn notice(notice: CampaignNotice) -> Self {
        Self {
            notice: Some(notice),
            ..Self::default()
        }
    }

    pub fn health(report: HealthReport) -> Self {
        Self {
            health: Some(report),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// One delivery attempt. The dispatcher owns timeouts and retries.
    async fn push(&self, payload: &SinkPayload) -> Result<(), DeliveryError>;
}

/// Authenticated HTTP push endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    timeout_ms: u64,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

#[async_trait]
impl NotificationSink for HttpSink {
    async fn push(&self, payload: &SinkPayload) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout_ms)
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(status.as_u16()))
        }
    }
}

/// Writes payloads to the log. Used when no sink URL is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn push(&self, payload: &SinkPayload) -> Result<(), DeliveryError> {
        if let Some(notice) = &payload.notice {
            info!(
                kind = ?notice.kind,
                campaign = %notice.campaign_id,
                profile = %notice.profile,
                target = %notice.target,
                units = notice.units_emitted,
                "Campaign notice"
            );
        }
        if let Some(summary) = &payload.summary {
            info!(
                total = summary.total,
                sent = summary.sent,
                failed = summary.failed,
                anomalous = summary.anomalous,
                evicted = summary.evicted,
                lost = summary.lost_events,
                "Telemetry summary"
            );
        }
        if let Some(health) = &payload.health {
            let open: Vec<u16> = health.open_ports().collect();
            info!(
                monitor = %health.monitor_id,
                target = %health.target,
                reachable = health.reachable,
                round = health.round,
                open = ?open,
                "Target health"
            );
        }
        if !payload.events.is_empty() {
            debug!(count = payload.events.len(), "Telemetry batch");
        }
        Ok(())
    }
}

/// Sink selected by configuration.
pub fn sink_from_config(config: &SinkConfig) -> Result<Arc<dyn NotificationSink>, DeliveryError> {
    match &config.url {
        Some(url) => Ok(Arc::new(HttpSink::new(
            url.clone(),
            config.token.clone(),
            Duration::from_millis(config.attempt_timeout_ms.max(1)),
        )?)),
        None => Ok(Arc::new(LogSink)),
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub delivered_events: AtomicU64,
    pub delivered_batches: AtomicU64,
    pub lost_events: AtomicU64,
    pub lost_batches: AtomicU64,
    pub attempts: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub retries: AtomicU64,
    pub summaries: AtomicU64,
    pub notices: AtomicU64,
    pub health_reports: AtomicU64,
    /// Events drained but not yet delivered or counted lost.
    in_flight: AtomicU64,
    in_flight_batches: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSnapshot {
    pub delivered_events: u64,
    pub delivered_batches: u64,
    pub lost_events: u64,
    pub lost_batches: u64,
    pub attempts: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub summaries: u64,
    pub notices: u64,
    pub health_reports: u64,
}

/// What the shutdown flush achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub delivered_events: u64,
    /// Events abandoned because the deadline passed.
    pub abandoned_events: u64,
    pub timed_out: bool,
}

pub struct ReportDispatcher {
    sink: Arc<dyn NotificationSink>,
    policy: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    summary_interval: Duration,
    /// Notices and health reports waiting for the next outbox tick.
    outbox: Mutex<VecDeque<SinkPayload>>,
    stats: DispatcherStats,
    metrics: Option<Arc<SurgeMetrics>>,
}

impl ReportDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, config: &SinkConfig) -> Self {
        Self {
            sink,
            policy: RetryPolicy::from(config),
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            summary_interval: Duration::from_millis(config.summary_interval_ms.max(1)),
            outbox: Mutex::new(VecDeque::new()),
            stats: DispatcherStats::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> DispatcherSnapshot {
        let s = &self.stats;
        DispatcherSnapshot {
            delivered_events: s.delivered_events.load(Ordering::Relaxed),
            delivered_batches: s.delivered_batches.load(Ordering::Relaxed),
            lost_events: s.lost_events.load(Ordering::Relaxed),
            lost_batches: s.lost_batches.load(Ordering::Relaxed),
            attempts: s.attempts.load(Ordering::Relaxed),
            failed_attempts: s.failed_attempts.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            summaries: s.summaries.load(Ordering::Relaxed),
            notices: s.notices.load(Ordering::Relaxed),
            health_reports: s.health_reports.load(Ordering::Relaxed),
        }
    }

    /// Push one payload with timeout, backoff and bounded attempts.
    async fn deliver(&self, payload: &SinkPayload) -> Result<u32, DeliveryError> {
        let timeout_ms = self.policy.attempt_timeout.as_millis() as u64;

        for attempt in 0..self.policy.max_attempts {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            let result = tokio::time::timeout(self.policy.attempt_timeout, self.sink.push(payload))
                .await
                .unwrap_or(Err(DeliveryError::Timeout(timeout_ms)));

            match result {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.delivery_attempts_total.with_label_values(&["ok"]).inc();
                    }
                    return Ok(attempt + 1);
                }
                Err(e) => {
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.delivery_attempts_total.with_label_values(&["error"]).inc();
                    }
                    warn!(attempt, events = payload.events.len(), error = %e, "Sink delivery failed");
                }
            }

            if attempt + 1 < self.policy.max_attempts {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                let delay = self.policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }
        }

        Err(DeliveryError::Exhausted {
            events: payload.events.len(),
            attempts: self.policy.max_attempts,
        })
    }

    /// Deliver one batch of events. On exhaustion the batch is counted as
    /// lost and the error returned.
    pub async fn dispatch(&self, batch: Vec<EmissionEvent>) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len() as u64;
        self.stats.in_flight.fetch_add(count, Ordering::Relaxed);
        self.stats.in_flight_batches.fetch_add(1, Ordering::Relaxed);
        let payload = SinkPayload::events(batch);
        let result = self.deliver(&payload).await;
        self.stats.in_flight.fetch_sub(count, Ordering::Relaxed);
        self.stats.in_flight_batches.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(attempts) => {
                self.stats.delivered_events.fetch_add(count, Ordering::Relaxed);
                self.stats.delivered_batches.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.events_delivered_total.inc_by(count);
                }
                debug!(count, attempts, "Delivered telemetry batch");
                Ok(())
            }
            Err(e) => {
                self.count_lost(count, 1);
                error!(count, error = %e, "Dropped telemetry batch after max attempts");
                Err(e)
            }
        }
    }

    fn count_lost(&self, events: u64, batches: u64) {
        self.stats.lost_events.fetch_add(events, Ordering::Relaxed);
        self.stats.lost_batches.fetch_add(batches, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.events_lost_total.inc_by(events);
            metrics.batches_lost_total.inc_by(batches);
        }
    }

    /// Recorder counters plus this dispatcher's loss counters.
    pub fn summary(&self, recorder: &TelemetryRecorder) -> TelemetrySummary {
        TelemetrySummary {
            lost_events: self.stats.lost_events.load(Ordering::Relaxed),
            lost_batches: self.stats.lost_batches.load(Ordering::Relaxed),
            ..recorder.summary()
        }
    }

    pub async fn push_summary(&self, recorder: &TelemetryRecorder) -> Result<(), DeliveryError> {
        let payload = SinkPayload {
            summary: Some(self.summary(recorder)),
            ..SinkPayload::default()
        };
        self.deliver(&payload).await?;
        self.stats.summaries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a lifecycle notice for the next outbox tick.
    pub fn notify(&self, notice: CampaignNotice) {
        self.outbox.lock().push_back(SinkPayload::notice(notice));
    }

    /// Queue a target health report for the next outbox tick.
    pub fn report_health(&self, report: HealthReport) {
        self.outbox.lock().push_back(SinkPayload::health(report));
    }

    async fn flush_outbox(&self) {
        loop {
            let Some(payload) = self.outbox.lock().pop_front() else {
                break;
            };
            let counter = if payload.health.is_some() {
                &self.stats.health_reports
            } else {
                &self.stats.notices
            };
            match self.deliver(&payload).await {
                Ok(_) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "Dropped notice"),
            }
        }
    }

    /// Drain the recorder batch by batch until it is empty or `token` fires.
    pub async fn flush(&self, recorder: &TelemetryRecorder, token: Option<&CancellationToken>) {
        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                break;
            }
            let batch = recorder.drain_batch(self.batch_size);
            if batch.is_empty() {
                break;
            }
            // failures are counted inside dispatch
            let _ = self.dispatch(batch).await;
        }
    }

    /// Background loops until cancelled: event batches on the flush
    /// interval, and independently the outbox plus periodic summaries.
    pub async fn run(self: Arc<Self>, recorder: Arc<TelemetryRecorder>, token: CancellationToken) {
        info!(
            batch_size = self.batch_size,
            flush_ms = self.flush_interval.as_millis() as u64,
            summary_ms = self.summary_interval.as_millis() as u64,
            max_attempts = self.policy.max_attempts,
            "Report dispatcher started"
        );

        tokio::join!(
            self.event_loop(&recorder, &token),
            self.report_loop(&recorder, &token)
        );

        info!("Report dispatcher stopped");
    }

    async fn event_loop(&self, recorder: &TelemetryRecorder, token: &CancellationToken) {
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = flush.tick() => self.flush(recorder, Some(token)).await,
            }
        }
    }

    async fn report_loop(&self, recorder: &TelemetryRecorder, token: &CancellationToken) {
        let mut outbox = tokio::time::interval(self.flush_interval);
        outbox.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary =
            tokio::time::interval_at(Instant::now() + self.summary_interval, self.summary_interval);
        summary.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = outbox.tick() => self.flush_outbox().await,
                _ = summary.tick() => {
                    if let Err(e) = self.push_summary(recorder).await {
                        warn!(error = %e, "Summary not delivered");
                    }
                }
            }
        }
    }

    /// Best-effort final flush: notices, remaining events, one last summary.
    /// Whatever is still undelivered at `deadline` is counted as lost.
    pub async fn shutdown_flush(&self, recorder: &TelemetryRecorder, deadline: Instant) -> FlushReport {
        let before = self.stats.delivered_events.load(Ordering::Relaxed);

        let work = async {
            self.flush_outbox().await;
            self.flush(recorder, None).await;
            if let Err(e) = self.push_summary(recorder).await {
                warn!(error = %e, "Final summary not delivered");
            }
        };
        let timed_out = tokio::time::timeout_at(deadline, work).await.is_err();

        let abandoned = self.abandon_remaining(recorder);
        let delivered = self.stats.delivered_events.load(Ordering::Relaxed) - before;
        if timed_out {
            warn!(abandoned, "Final telemetry flush hit its deadline");
        }
        info!(delivered, abandoned, "Final telemetry flush finished");

        FlushReport {
            delivered_events: delivered,
            abandoned_events: abandoned,
            timed_out,
        }
    }

    /// Count everything still buffered or mid-delivery as lost. Buffered
    /// events count as the batches they would have been sent in.
    fn abandon_remaining(&self, recorder: &TelemetryRecorder) -> u64 {
        let in_flight = self.stats.in_flight.swap(0, Ordering::Relaxed);
        let in_flight_batches = self.stats.in_flight_batches.swap(0, Ordering::Relaxed);
        let buffered = recorder.drain_batch(usize::MAX).len() as u64;
        let abandoned = in_flight + buffered;
        if abandoned > 0 {
            let batches = in_flight_batches + buffered.div_ceil(self.batch_size as u64);
            self.count_lost(abandoned, batches);
            error!(in_flight, buffered, batches, "Telemetry abandoned at shutdown");
        }
        let dropped = {
            let mut outbox = self.outbox.lock();
            let n = outbox.len();
            outbox.clear();
            n
        };
        if dropped > 0 {
            warn!(count = dropped, "Notices dropped at shutdown");
        }
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Protocol;
    use crate::telemetry::tests::event;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` pushes, then accepts.
    #[derive(Default)]
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        pushes: Mutex<Vec<(Instant, SinkPayload)>>,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn push(&self, payload: &SinkPayload) -> Result<(), DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.pushes.lock().push((Instant::now(), payload.clone()));
            if n < self.failures {
                Err(DeliveryError::Rejected(503))
            } else {
                Ok(())
            }
        }
    }

    struct HangingSink;

    #[async_trait]
    impl NotificationSink for HangingSink {
        async fn push(&self, _payload: &SinkPayload) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    fn config() -> SinkConfig {
        SinkConfig {
            batch_size: 10,
            max_attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            attempt_timeout_ms: 500,
            ..SinkConfig::default()
        }
    }

    fn batch(n: u64) -> Vec<EmissionEvent> {
        (0..n).map(|seq| event(seq, Protocol::Tcp)).collect()
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = RetryPolicy::from(&config());
        let schedule: Vec<u64> = policy.schedule().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(schedule, vec![100, 200, 400, 800, 1000]);
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_token_redacted_in_debug() {
        let cfg = SinkConfig {
            token: Some("abcdef123456xyz".to_string()),
            ..SinkConfig::default()
        };
        let rendered = format!("{cfg:?}");
        assert!(rendered.contains("abc...xyz"));
        assert!(!rendered.contains("abcdef123456xyz"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_backs_off_and_counts_loss() {
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            ..FlakySink::default()
        });
        let dispatcher = ReportDispatcher::new(sink.clone(), &config());

        let err = dispatcher.dispatch(batch(7)).await.unwrap_err();
        assert_eq!(err, DeliveryError::Exhausted { events: 7, attempts: 6 });

        let pushes = sink.pushes.lock();
        assert_eq!(pushes.len(), 6);
        let gaps: Vec<Duration> = pushes.windows(2).map(|w| w[1].0 - w[0].0).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] > pair[0] || pair[1] == Duration::from_millis(1000));
        }
        assert_eq!(gaps.last(), Some(&Duration::from_millis(1000)));

        let stats = dispatcher.stats();
        assert_eq!(stats.lost_events, 7);
        assert_eq!(stats.lost_batches, 1);
        assert_eq!(stats.attempts, 6);
        assert_eq!(stats.delivered_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let sink = Arc::new(FlakySink {
            failures: 2,
            ..FlakySink::default()
        });
        let dispatcher = ReportDispatcher::new(sink.clone(), &config());
        dispatcher.dispatch(batch(5)).await.unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.delivered_events, 5);
        assert_eq!(stats.failed_attempts, 2);
        assert_eq!(stats.lost_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let dispatcher = ReportDispatcher::new(Arc::new(HangingSink), &config());
        let start = Instant::now();
        assert!(dispatcher.dispatch(batch(1)).await.is_err());
        // 6 timeouts of 500ms plus backoff 100+200+400+800+1000
        assert_eq!(start.elapsed(), Duration::from_millis(6 * 500 + 2500));
        assert_eq!(dispatcher.stats().lost_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_reported_in_next_summary() {
        let sink = Arc::new(FlakySink {
            failures: 6,
            ..FlakySink::default()
        });
        let dispatcher = ReportDispatcher::new(sink.clone(), &config());
        let recorder = TelemetryRecorder::new(100);
        let _ = dispatcher.dispatch(batch(3)).await;

        dispatcher.push_summary(&recorder).await.unwrap();
        let pushes = sink.pushes.lock();
        let summary = pushes.last().and_then(|(_, p)| p.summary.clone()).unwrap();
        assert_eq!(summary.lost_events, 3);
        assert_eq!(summary.lost_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flush_abandons_at_deadline() {
        let dispatcher = ReportDispatcher::new(Arc::new(HangingSink), &config());
        let recorder = TelemetryRecorder::new(100);
        for seq in 0..25 {
            recorder.record(event(seq, Protocol::Udp));
        }

        let report = dispatcher
            .shutdown_flush(&recorder, Instant::now() + Duration::from_secs(1))
            .await;
        assert!(report.timed_out);
        assert_eq!(report.abandoned_events, 25);
        let stats = dispatcher.stats();
        assert_eq!(stats.lost_events, 25);
        // one batch of 10 stuck mid-delivery, 15 buffered events in 2 batches
        assert_eq!(stats.lost_batches, 3);
        assert!(recorder.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_shutdown_counts_no_batches() {
        let dispatcher = ReportDispatcher::new(Arc::new(FlakySink::default()), &config());
        let recorder = TelemetryRecorder::new(100);
        let report = dispatcher
            .shutdown_flush(&recorder, Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(report.abandoned_events, 0);
        assert_eq!(dispatcher.stats().lost_batches, 0);
    }

    /// Rejects every payload carrying events, accepts everything else.
    #[derive(Default)]
    struct EventRejectingSink {
        summaries: Mutex<Vec<TelemetrySummary>>,
    }

    #[async_trait]
    impl NotificationSink for EventRejectingSink {
        async fn push(&self, payload: &SinkPayload) -> Result<(), DeliveryError> {
            if !payload.events.is_empty() {
                return Err(DeliveryError::Rejected(500));
            }
            if let Some(summary) = &payload.summary {
                self.summaries.lock().push(summary.clone());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_summaries_keep_flowing_while_events_fail() {
        let sink = Arc::new(EventRejectingSink::default());
        let cfg = SinkConfig {
            summary_interval_ms: 1000,
            ..config()
        };
        let dispatcher = Arc::new(ReportDispatcher::new(sink.clone(), &cfg));
        let recorder = Arc::new(TelemetryRecorder::new(1000));
        // 50 batches, each failing for 2.5s of backoff
        for seq in 0..500 {
            recorder.record(event(seq, Protocol::Udp));
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(Arc::clone(&recorder), token.clone()));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        dispatcher.notify(CampaignNotice {
            kind: NoticeKind::Completed,
            campaign_id: Uuid::new_v4(),
            profile: "fast".to_string(),
            target: "192.0.2.1".to_string(),
            units_emitted: 500,
            reason: None,
            timestamp: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        handle.abort();
        let _ = handle.await;

        let summaries = sink.summaries.lock();
        assert!(summaries.len() >= 9, "only {} summaries", summaries.len());
        let last = summaries.last().unwrap();
        assert!(last.lost_events > 0);
        assert_eq!(last.lost_events, last.lost_batches * 10);
        assert_eq!(dispatcher.stats().notices, 1);
        assert!(!recorder.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notices_delivered_on_flush_tick() {
        let sink = Arc::new(FlakySink::default());
        let dispatcher = Arc::new(ReportDispatcher::new(sink.clone(), &config()));
        let recorder = Arc::new(TelemetryRecorder::new(100));
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(Arc::clone(&recorder), token.clone()));

        dispatcher.notify(CampaignNotice {
            kind: NoticeKind::Started,
            campaign_id: Uuid::new_v4(),
            profile: "baseline".to_string(),
            target: "192.0.2.1".to_string(),
            units_emitted: 0,
            reason: None,
            timestamp: Utc::now(),
        });
        for seq in 0..15 {
            recorder.record(event(seq, Protocol::Tcp));
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        handle.await.unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.notices, 1);
        assert_eq!(stats.delivered_events, 15);
        assert_eq!(stats.delivered_batches, 2);
    }
}
