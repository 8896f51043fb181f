//! Pipeline counters exposed on the pull-based metrics endpoint.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges for the ingest/pairing/eviction pipeline, registered
/// on a collector-owned registry (nothing global).
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    pub events_processed: IntCounter,
    pub events_dropped: IntCounter,
    pub flow_pairs_formed: IntCounter,
    pub flow_pairs_active: IntGauge,
    pub flows_evicted: IntCounter,
    pub pending_pairings: IntGauge,
    pub pending_attributions: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_processed = IntCounter::new(
            "collector_events_processed_total",
            "Router events applied to the entity store",
        )?;
        let events_dropped = IntCounter::new(
            "collector_events_dropped_total",
            "Router events dropped as malformed or unknown",
        )?;
        let flow_pairs_formed = IntCounter::new(
            "collector_flow_pairs_formed_total",
            "Bidirectional flow pairs correlated",
        )?;
        let flow_pairs_active = IntGauge::new(
            "collector_flow_pairs_active",
            "Flow pairs currently held in the store",
        )?;
        let flows_evicted = IntCounter::new(
            "collector_flows_evicted_total",
            "Completed flows removed by the retention sweep",
        )?;
        let pending_pairings = IntGauge::new(
            "collector_pending_pairings",
            "Flows waiting for their counterflow leg",
        )?;
        let pending_attributions = IntGauge::new(
            "collector_pending_attributions",
            "Flow pairs waiting for process attribution",
        )?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(flow_pairs_formed.clone()))?;
        registry.register(Box::new(flow_pairs_active.clone()))?;
        registry.register(Box::new(flows_evicted.clone()))?;
        registry.register(Box::new(pending_pairings.clone()))?;
        registry.register(Box::new(pending_attributions.clone()))?;

        Ok(Self {
            registry,
            events_processed,
            events_dropped,
            flow_pairs_formed,
            flow_pairs_active,
            flows_evicted,
            pending_pairings,
            pending_attributions,
        })
    }

    /// Text exposition of every registered metric.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
