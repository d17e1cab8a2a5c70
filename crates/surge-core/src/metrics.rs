//! Prometheus collectors for the engine.
//!
//! Held in an explicit handle with its own [`Registry`] so several engines
//! (and tests) can coexist in one process.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct SurgeMetrics {
    registry: Registry,
    /// Labels: `protocol`, `outcome`
    pub units_total: IntCounterVec,
    pub anomalous_units_total: IntCounter,
    pub emission_latency: Histogram,
    pub telemetry_evicted_total: IntCounter,
    pub events_delivered_total: IntCounter,
    pub events_lost_total: IntCounter,
    pub batches_lost_total: IntCounter,
    /// Labels: `result` (`ok` | `error`)
    pub delivery_attempts_total: IntCounterVec,
    pub campaigns_running: IntGauge,
    /// Labels: `state` (`open` | `closed` | `filtered` | `error`)
    pub port_checks_total: IntCounterVec,
}

impl SurgeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let units_total = IntCounterVec::new(
            Opts::new("surge_units_total", "Traffic units emitted"),
            &["protocol", "outcome"],
        )?;
        let anomalous_units_total =
            IntCounter::new("surge_anomalous_units_total", "Anomalous traffic units emitted")?;
        let emission_latency = Histogram::with_opts(
            HistogramOpts::new(
                "surge_emission_latency_seconds",
                "Time from send start to local handoff",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let telemetry_evicted_total = IntCounter::new(
            "surge_telemetry_evicted_total",
            "Events evicted from a full telemetry buffer",
        )?;
        let events_delivered_total =
            IntCounter::new("surge_events_delivered_total", "Events accepted by the sink")?;
        let events_lost_total = IntCounter::new(
            "surge_events_lost_total",
            "Events dropped after delivery retries were exhausted",
        )?;
        let batches_lost_total =
            IntCounter::new("surge_batches_lost_total", "Batches dropped after retries")?;
        let delivery_attempts_total = IntCounterVec::new(
            Opts::new("surge_delivery_attempts_total", "Sink delivery attempts"),
            &["result"],
        )?;
        let campaigns_running =
            IntGauge::new("surge_campaigns_running", "Campaigns currently emitting")?;
        let port_checks_total = IntCounterVec::new(
            Opts::new("surge_port_checks_total", "Monitor port checks by result"),
            &["state"],
        )?;

        registry.register(Box::new(units_total.clone()))?;
        registry.register(Box::new(anomalous_units_total.clone()))?;
        registry.register(Box::new(emission_latency.clone()))?;
        registry.register(Box::new(telemetry_evicted_total.clone()))?;
        registry.register(Box::new(events_delivered_total.clone()))?;
        registry.register(Box::new(events_lost_total.clone()))?;
        registry.register(Box::new(batches_lost_total.clone()))?;
        registry.register(Box::new(delivery_attempts_total.clone()))?;
        registry.register(Box::new(campaigns_running.clone()))?;
        registry.register(Box::new(port_checks_total.clone()))?;

        Ok(Self {
            registry,
            units_total,
            anomalous_units_total,
            emission_latency,
            telemetry_evicted_total,
            events_delivered_total,
            events_lost_total,
            batches_lost_total,
            delivery_attempts_total,
            campaigns_running,
            port_checks_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
