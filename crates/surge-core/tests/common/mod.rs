#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use surge_core::dispatcher::{CampaignNotice, NoticeKind};
use surge_core::{
    DeliveryError, DryRunEmitter, EmissionEvent, Engine, HealthReport, NotificationSink,
    SinkConfig, SinkPayload, SurgeConfig, TelemetrySummary,
};

/// Records every payload. Fails calls matching `fail` (by 0-based call index).
pub struct CollectingSink {
    payloads: Mutex<Vec<SinkPayload>>,
    calls: AtomicU32,
    fail: Box<dyn Fn(u32) -> bool + Send + Sync>,
}

impl CollectingSink {
    pub fn healthy() -> Arc<Self> {
        Self::failing_when(|_| false)
    }

    pub fn down() -> Arc<Self> {
        Self::failing_when(|_| true)
    }

    pub fn failing_when(fail: impl Fn(u32) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            fail: Box::new(fail),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<EmissionEvent> {
        self.payloads
            .lock()
            .iter()
            .flat_map(|p| p.events.iter().cloned())
            .collect()
    }

    pub fn notices(&self) -> Vec<CampaignNotice> {
        self.payloads
            .lock()
            .iter()
            .filter_map(|p| p.notice.clone())
            .collect()
    }

    pub fn notice_kinds(&self) -> Vec<NoticeKind> {
        self.notices().iter().map(|n| n.kind).collect()
    }

    pub fn health_reports(&self) -> Vec<HealthReport> {
        self.payloads
            .lock()
            .iter()
            .filter_map(|p| p.health.clone())
            .collect()
    }

    pub fn last_summary(&self) -> Option<TelemetrySummary> {
        self.payloads
            .lock()
            .iter()
            .rev()
            .find_map(|p| p.summary.clone())
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn push(&self, payload: &SinkPayload) -> Result<(), DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if (self.fail)(n) {
            return Err(DeliveryError::Rejected(503));
        }
        self.payloads.lock().push(payload.clone());
        Ok(())
    }
}

pub fn profiles() -> BTreeMap<String, serde_json::Value> {
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
            "fast".to_string(),
            json!({
                "protocolMix": {"TCP": 0.4, "UDP": 0.3, "ICMP": 0.2, "HTTP": 0.1},
                "targetRatePerSecond": 1000.0,
                "burstiness": 0.5,
                "payloadSizeRange": [0, 512],
                "anomalyRate": 0.2,
                "count": 100
            }),
        ),
        (
            "endless".to_string(),
            json!({
                "protocolMix": {"UDP": 1.0},
                "targetRatePerSecond": 10.0,
                "payloadSizeRange": [32, 64],
                "durationSecs": 3600.0
            }),
        ),
    ])
}

pub fn config(sink: SinkConfig) -> SurgeConfig {
    SurgeConfig {
        sink,
        profiles: profiles(),
        shutdown_timeout_ms: 5_000,
        ..SurgeConfig::default()
    }
}

pub fn fast_sink() -> SinkConfig {
    SinkConfig {
        batch_size: 50,
        flush_interval_ms: 200,
        summary_interval_ms: 1_000,
        max_attempts: 4,
        base_delay_ms: 50,
        max_delay_ms: 400,
        attempt_timeout_ms: 500,
        ..SinkConfig::default()
    }
}

pub fn engine(sink: Arc<CollectingSink>, sink_config: SinkConfig) -> Engine {
    Engine::start(config(sink_config), Arc::new(DryRunEmitter::new()), sink).unwrap()
}
