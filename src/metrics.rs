//! Prometheus metrics for the settlement engine.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Counters and histograms exported at `GET /metrics`.
pub struct WagerMetrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub fulfillments_total: IntCounterVec,
    pub integrity_alerts_total: IntCounter,
    pub resolutions_total: IntCounterVec,
    pub treasury_entries_total: IntCounterVec,
    pub expiries_total: IntCounter,
    pub refunds_total: IntCounter,
    pub settlement_retries_total: IntCounter,
    pub fulfillment_latency_seconds: Histogram,
}

impl WagerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("fairwager".to_string()), None)?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Randomness requests by category, variant and state reached"),
            &["category", "variant", "state"],
        )?;
        let fulfillments_total = IntCounterVec::new(
            Opts::new("fulfillments_total", "Fulfillments received by outcome"),
            &["outcome"],
        )?;
        let integrity_alerts_total =
            IntCounter::new("integrity_alerts_total", "Fulfillments whose seed failed its commitment")?;
        let resolutions_total = IntCounterVec::new(
            Opts::new("resolutions_total", "Handle and sequence resolutions by subject and strategy"),
            &["subject", "strategy"],
        )?;
        let treasury_entries_total = IntCounterVec::new(
            Opts::new("treasury_entries_total", "Ledger entries written by kind and status"),
            &["kind", "status"],
        )?;
        let expiries_total = IntCounter::new("expiries_total", "Requests expired by the sweep")?;
        let refunds_total = IntCounter::new("refunds_total", "Stake refunds issued for expired requests")?;
        let settlement_retries_total =
            IntCounter::new("settlement_retries_total", "Payout credits deferred to the retry queue")?;
        let fulfillment_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "fulfillment_latency_seconds",
                "Time from request creation to verified fulfillment",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(fulfillments_total.clone()))?;
        registry.register(Box::new(integrity_alerts_total.clone()))?;
        registry.register(Box::new(resolutions_total.clone()))?;
        registry.register(Box::new(treasury_entries_total.clone()))?;
        registry.register(Box::new(expiries_total.clone()))?;
        registry.register(Box::new(refunds_total.clone()))?;
        registry.register(Box::new(settlement_retries_total.clone()))?;
        registry.register(Box::new(fulfillment_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            fulfillments_total,
            integrity_alerts_total,
            resolutions_total,
            treasury_entries_total,
            expiries_total,
            refunds_total,
            settlement_retries_total,
            fulfillment_latency_seconds,
        })
    }

    pub fn record_request(&self, category: &str, variant: &str, state: &str) {
        self.requests_total.with_label_values(&[category, variant, state]).inc();
    }

    pub fn record_fulfillment(&self, outcome: &str) {
        self.fulfillments_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_resolution(&self, subject: &str, strategy: &str) {
        self.resolutions_total.with_label_values(&[subject, strategy]).inc();
    }

    pub fn record_entry(&self, kind: &str, status: &str) {
        self.treasury_entries_total.with_label_values(&[kind, status]).inc();
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
