//! Telemetry Recorder
//!
//! Bounded, process-wide buffer of [`EmissionEvent`]s. When full, the oldest
//! unflushed event is evicted and counted. [`TelemetryRecorder::drain_batch`]
//! is the only way events leave the buffer; it runs under the same lock as
//! `record`, so a drained batch never overlaps a later one.

use crate::error::TransmissionError;
use crate::metrics::SurgeMetrics;
use crate::packet::TrafficUnit;
use crate::profile::{Mutator, Protocol};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Sent,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Sent => "sent",
            Outcome::Failed => "failed",
        }
    }
}

/// Outcome record for one traffic unit. Field names follow the sink's wire
/// format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionEvent {
    pub seq: u64,
    pub protocol: Protocol,
    pub size_bytes: u64,
    pub anomalous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<Mutator>,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    /// `None` when the unit failed before reaching the OS.
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Short [`TransmissionError`] kind for failed units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmissionEvent {
    fn from_unit(unit: &TrafficUnit, timestamp: DateTime<Utc>, outcome: Outcome) -> Self {
        Self {
            seq: unit.sequence_number,
            protocol: unit.protocol,
            size_bytes: unit.wire_size() as u64,
            anomalous: unit.is_anomalous,
            anomaly: unit.anomaly,
            timestamp,
            outcome,
            latency_ms: None,
            campaign_id: None,
            target: None,
            error: None,
        }
    }

    pub fn sent(unit: &TrafficUnit, timestamp: DateTime<Utc>, latency: Duration) -> Self {
        Self {
            latency_ms: Some(latency.as_secs_f64() * 1000.0),
            ..Self::from_unit(unit, timestamp, Outcome::Sent)
        }
    }

    pub fn failed(
        unit: &TrafficUnit,
        timestamp: DateTime<Utc>,
        latency: Option<Duration>,
        error: &TransmissionError,
    ) -> Self {
        Self {
            latency_ms: latency.map(|l| l.as_secs_f64() * 1000.0),
            error: Some(error.kind().to_string()),
            ..Self::from_unit(unit, timestamp, Outcome::Failed)
        }
    }

    pub fn with_campaign(mut self, id: Uuid, target: impl Into<String>) -> Self {
        self.campaign_id = Some(id);
        self.target = Some(target.into());
        self
    }
}

/// Cumulative counters since process start, pushed periodically to the sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySummary {
    pub counts: BTreeMap<Protocol, u64>,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub anomalous: u64,
    /// Events dropped from a full buffer.
    pub evicted: u64,
    /// Events dropped after delivery retries were exhausted.
    pub lost_events: u64,
    pub lost_batches: u64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tallies {
    counts: BTreeMap<Protocol, u64>,
    sent: u64,
    failed: u64,
    anomalous: u64,
    evicted: u64,
}

struct Inner {
    events: VecDeque<EmissionEvent>,
    tallies: Tallies,
}

pub struct TelemetryRecorder {
    inner: Mutex<Inner>,
    capacity: usize,
    metrics: Option<Arc<SurgeMetrics>>,
}

impl TelemetryRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                tallies: Tallies::default(),
            }),
            capacity,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, event: EmissionEvent) {
        if let Some(metrics) = &self.metrics {
            metrics
                .units_total
                .with_label_values(&[event.protocol.as_str(), event.outcome.as_str()])
                .inc();
            if event.anomalous {
                metrics.anomalous_units_total.inc();
            }
            if let Some(ms) = event.latency_ms {
                metrics.emission_latency.observe(ms / 1000.0);
            }
        }

        let evicted = {
            let mut inner = self.inner.lock();
            let tallies = &mut inner.tallies;
            *tallies.counts.entry(event.protocol).or_default() += 1;
            match event.outcome {
                Outcome::Sent => tallies.sent += 1,
                Outcome::Failed => tallies.failed += 1,
            }
            if event.anomalous {
                tallies.anomalous += 1;
            }

            let evicted = if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.tallies.evicted += 1;
                true
            } else {
                false
            };
            inner.events.push_back(event);
            evicted
        };

        if evicted {
            if let Some(metrics) = &self.metrics {
                metrics.telemetry_evicted_total.inc();
            }
            debug!(capacity = self.capacity, "Telemetry buffer full, evicted oldest event");
        }
    }

    /// Remove and return up to `max` of the oldest buffered events.
    pub fn drain_batch(&self, max: usize) -> Vec<EmissionEvent> {
        let mut inner = self.inner.lock();
        let n = max.min(inner.events.len());
        inner.events.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.inner.lock().tallies.evicted
    }

    /// Snapshot of cumulative counters. Delivery loss fields are filled in by
    /// the dispatcher.
    pub fn summary(&self) -> TelemetrySummary {
        let inner = self.inner.lock();
        let t = &inner.tallies;
        TelemetrySummary {
            counts: t.counts.clone(),
            total: t.sent + t.failed,
            sent: t.sent,
            failed: t.failed,
            anomalous: t.anomalous,
            evicted: t.evicted,
            lost_events: 0,
            lost_batches: 0,
            generated_at: Utc::now(),
        }
    }
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    pub(crate) fn event(seq: u64, protocol: Protocol) -> EmissionEvent {
        EmissionEvent {
            seq,
            protocol,
            size_bytes: 100,
            anomalous: seq % 10 == 0,
            anomaly: None,
            timestamp: Utc::now(),
            outcome: Outcome::Sent,
            latency_ms: Some(0.2),
            campaign_id: None,
            target: None,
            error: None,
        }
    }

    #[test]
    fn test_drain_in_order() {
        let recorder = TelemetryRecorder::new(100);
        for seq in 0..25 {
            recorder.record(event(seq, Protocol::Tcp));
        }
        let first = recorder.drain_batch(10);
        assert_eq!(first.iter().map(|e| e.seq).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert_eq!(recorder.drain_batch(100).len(), 15);
        assert!(recorder.is_empty());
        assert!(recorder.drain_batch(10).is_empty());
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let recorder = TelemetryRecorder::new(5);
        for seq in 0..8 {
            recorder.record(event(seq, Protocol::Udp));
        }
        assert_eq!(recorder.len(), 5);
        assert_eq!(recorder.evicted(), 3);
        let seqs: Vec<u64> = recorder.drain_batch(10).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6, 7]);

        let summary = recorder.summary();
        assert_eq!(summary.total, 8);
        assert_eq!(summary.evicted, 3);
        assert_eq!(summary.counts.get(&Protocol::Udp), Some(&8));
    }

    #[test]
    fn test_concurrent_record_and_drain_accounts_for_everything() {
        let recorder = Arc::new(TelemetryRecorder::new(1_000_000));
        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || {
                    for i in 0..5_000 {
                        recorder.record(event(w * 100_000 + i, Protocol::Icmp));
                    }
                })
            })
            .collect();

        let mut drained = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            drained.extend(recorder.drain_batch(128));
        }
        for w in writers {
            w.join().unwrap();
        }
        drained.extend(recorder.drain_batch(usize::MAX));

        let mut seqs: Vec<u64> = drained.iter().map(|e| e.seq).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 20_000);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(event(10, Protocol::Tcp)).unwrap();
        assert_eq!(json["seq"], 10);
        assert_eq!(json["protocol"], "TCP");
        assert_eq!(json["sizeBytes"], 100);
        assert_eq!(json["anomalous"], true);
        assert_eq!(json["outcome"], "Sent");
        assert!(json.get("latencyMs").is_some());
        assert!(json.get("campaignId").is_none());
    }

    #[test]
    fn test_metrics_follow_records() {
        let metrics = Arc::new(SurgeMetrics::new().unwrap());
        let recorder = TelemetryRecorder::new(2).with_metrics(Arc::clone(&metrics));
        for seq in 0..3 {
            recorder.record(event(seq, Protocol::Tcp));
        }
        assert_eq!(metrics.units_total.with_label_values(&["TCP", "sent"]).get(), 3);
        assert_eq!(metrics.telemetry_evicted_total.get(), 1);
    }
}
