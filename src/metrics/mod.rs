use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Outbox delivery (throughput, latency, failures, lease recovery, GC)
// - Outbox change stream restarts
// - Inbox deduplication
// - Command dispatch outcomes and version conflicts
// - Circuit breaker state
//
// Rendered in the Prometheus text format by `encode_text`.
// ============================================================================

/// Central metrics registry shared by the event sourcing and messaging layers
pub struct Metrics {
    registry: Registry,

    // Outbox Metrics
    pub outbox_published: IntCounterVec,
    pub outbox_failed: IntCounterVec,
    pub outbox_publish_duration: HistogramVec,
    pub outbox_leases_reclaimed: IntCounter,
    pub outbox_entries_removed: IntCounter,
    pub outbox_failed_entries: IntGauge,
    pub change_stream_restarts: IntCounter,

    // Inbox Metrics
    pub inbox_accepted: IntCounter,
    pub inbox_duplicates: IntCounter,

    // Command Metrics
    pub commands_dispatched: IntCounterVec,
    pub version_conflicts: IntCounterVec,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Outbox Metrics
        let outbox_published = IntCounterVec::new(
            Opts::new("outbox_published_total", "Outbox entries delivered to the broker"),
            &["target"],
        )?;
        registry.register(Box::new(outbox_published.clone()))?;

        let outbox_failed = IntCounterVec::new(
            Opts::new("outbox_failed_total", "Outbox delivery attempts that failed"),
            &["target"],
        )?;
        registry.register(Box::new(outbox_failed.clone()))?;

        let outbox_publish_duration = HistogramVec::new(
            HistogramOpts::new("outbox_publish_duration_seconds", "Broker publish duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["target"],
        )?;
        registry.register(Box::new(outbox_publish_duration.clone()))?;

        let outbox_leases_reclaimed = IntCounter::new(
            "outbox_leases_reclaimed_total",
            "Outbox entries unlocked after their lease expired",
        )?;
        registry.register(Box::new(outbox_leases_reclaimed.clone()))?;

        let outbox_entries_removed = IntCounter::new(
            "outbox_entries_removed_total",
            "Acknowledged outbox entries removed after retention",
        )?;
        registry.register(Box::new(outbox_entries_removed.clone()))?;

        let outbox_failed_entries = IntGauge::new(
            "outbox_failed_entries",
            "Outbox entries still failing past the alert age",
        )?;
        registry.register(Box::new(outbox_failed_entries.clone()))?;

        let change_stream_restarts = IntCounter::new(
            "outbox_change_stream_restarts_total",
            "Times the outbox change stream was re-subscribed",
        )?;
        registry.register(Box::new(change_stream_restarts.clone()))?;

        // Inbox Metrics
        let inbox_accepted = IntCounter::new(
            "inbox_messages_accepted_total",
            "Incoming messages seen for the first time",
        )?;
        registry.register(Box::new(inbox_accepted.clone()))?;

        let inbox_duplicates = IntCounter::new(
            "inbox_messages_duplicate_total",
            "Incoming messages rejected as already seen",
        )?;
        registry.register(Box::new(inbox_duplicates.clone()))?;

        // Command Metrics
        let commands_dispatched = IntCounterVec::new(
            Opts::new("commands_dispatched_total", "Commands dispatched to aggregates"),
            &["aggregate_type", "outcome"],
        )?;
        registry.register(Box::new(commands_dispatched.clone()))?;

        let version_conflicts = IntCounterVec::new(
            Opts::new("aggregate_version_conflicts_total", "Appends rejected by the head version check"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(version_conflicts.clone()))?;

        // Circuit Breaker Metrics
        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            outbox_published,
            outbox_failed,
            outbox_publish_duration,
            outbox_leases_reclaimed,
            outbox_entries_removed,
            outbox_failed_entries,
            change_stream_restarts,
            inbox_accepted,
            inbox_duplicates,
            commands_dispatched,
            version_conflicts,
            circuit_breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Helper to record one broker publish attempt
    pub fn record_outbox_publish(&self, target: &str, duration_secs: f64, success: bool) {
        if success {
            self.outbox_published.with_label_values(&[target]).inc();
        } else {
            self.outbox_failed.with_label_values(&[target]).inc();
        }
        self.outbox_publish_duration
            .with_label_values(&[target])
            .observe(duration_secs);
    }

    pub fn record_leases_reclaimed(&self, count: u64) {
        self.outbox_leases_reclaimed.inc_by(count);
    }

    pub fn record_entries_removed(&self, count: u64) {
        self.outbox_entries_removed.inc_by(count);
    }

    pub fn set_failed_entries(&self, count: usize) {
        self.outbox_failed_entries.set(count as i64);
    }

    pub fn record_change_stream_restart(&self) {
        self.change_stream_restarts.inc();
    }

    /// Helper to record an inbox check
    pub fn record_inbox_message(&self, accepted: bool) {
        if accepted {
            self.inbox_accepted.inc();
        } else {
            self.inbox_duplicates.inc();
        }
    }

    /// Helper to record a command dispatch outcome (`ok`, `rejected`, `conflict`, `error`)
    pub fn record_command(&self, aggregate_type: &str, outcome: &str) {
        self.commands_dispatched
            .with_label_values(&[aggregate_type, outcome])
            .inc();
        if outcome == "conflict" {
            self.version_conflicts.with_label_values(&[aggregate_type]).inc();
        }
    }

    /// Helper to update circuit breaker state
    pub fn update_circuit_breaker_state(&self, state: u8) {
        self.circuit_breaker_state.set(state as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_outbox_publish() {
        let metrics = Metrics::new().unwrap();
        metrics.record_outbox_publish("offer", 0.01, true);
        metrics.record_outbox_publish("offer", 0.02, true);
        metrics.record_outbox_publish("offer", 0.5, false);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("outbox_published_total{target=\"offer\"} 2"));
        assert!(text.contains("outbox_failed_total{target=\"offer\"} 1"));
        assert!(text.contains("outbox_publish_duration_seconds_count{target=\"offer\"} 3"));
    }

    #[test]
    fn test_record_command_conflict() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("OFFER", "ok");
        metrics.record_command("OFFER", "conflict");

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("commands_dispatched_total{aggregate_type=\"OFFER\",outcome=\"ok\"} 1"));
        assert!(text.contains("aggregate_version_conflicts_total{aggregate_type=\"OFFER\"} 1"));
    }

    #[test]
    fn test_inbox_and_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.record_inbox_message(true);
        metrics.record_inbox_message(false);
        metrics.record_inbox_message(false);
        metrics.set_failed_entries(4);
        metrics.update_circuit_breaker_state(1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("inbox_messages_accepted_total 1"));
        assert!(text.contains("inbox_messages_duplicate_total 2"));
        assert!(text.contains("outbox_failed_entries 4"));
        assert!(text.contains("circuit_breaker_state 1"));
    }
}
