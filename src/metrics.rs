use prometheus::{
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, IntGaugeVec, Registry, TextEncoder,
    histogram_opts, opts,
};

use crate::model::{QueueStatus, SigningReason};

/// Prometheus metrics registry and collectors for the zone signer
pub struct SignerMetrics {
    registry: Registry,

    // Queue metrics
    sign_requests: CounterVec,
    sign_completed: IntCounter,
    sign_failed: IntCounter,
    sign_reclaimed: IntCounter,
    sign_cancelled: IntCounter,
    queue_entries: IntGaugeVec,
    sign_duration: HistogramVec,

    // Key metrics
    keys_generated: CounterVec,
    keys_deactivated: IntCounter,
    active_keys: IntGauge,
    signed_zones: IntGauge,

    // Signature output
    signatures_created: IntCounter,
}

impl SignerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sign_requests = CounterVec::new(
            opts!(
                "zonesign_sign_requests_total",
                "Total number of signing requests enqueued, including merged requests"
            ),
            &["reason", "merged"],
        )?;

        let sign_completed = IntCounter::with_opts(opts!(
            "zonesign_sign_completed_total",
            "Total number of signing entries completed"
        ))?;

        let sign_failed = IntCounter::with_opts(opts!(
            "zonesign_sign_failed_total",
            "Total number of signing entries failed"
        ))?;

        let sign_reclaimed = IntCounter::with_opts(opts!(
            "zonesign_sign_reclaimed_total",
            "Total number of stale processing entries returned to pending"
        ))?;

        let sign_cancelled = IntCounter::with_opts(opts!(
            "zonesign_sign_cancelled_total",
            "Total number of pending entries purged by DNSSEC disable"
        ))?;

        let queue_entries = IntGaugeVec::new(
            opts!(
                "zonesign_queue_entries",
                "Current number of queue entries by status"
            ),
            &["status"],
        )?;

        let sign_duration = HistogramVec::new(
            histogram_opts!(
                "zonesign_sign_duration_seconds",
                "Time spent signing a zone in seconds"
            ),
            &["scope"],
        )?;

        let keys_generated = CounterVec::new(
            opts!("zonesign_keys_generated_total", "Total number of keys generated"),
            &["algorithm", "role"],
        )?;

        let keys_deactivated = IntCounter::with_opts(opts!(
            "zonesign_keys_deactivated_total",
            "Total number of keys deactivated"
        ))?;

        let active_keys = IntGauge::with_opts(opts!(
            "zonesign_active_keys",
            "Current number of active keys across all zones"
        ))?;

        let signed_zones = IntGauge::with_opts(opts!(
            "zonesign_dnssec_zones",
            "Current number of zones with DNSSEC enabled"
        ))?;

        let signatures_created = IntCounter::with_opts(opts!(
            "zonesign_signatures_created_total",
            "Total number of RRSIG records computed"
        ))?;

        registry.register(Box::new(sign_requests.clone()))?;
        registry.register(Box::new(sign_completed.clone()))?;
        registry.register(Box::new(sign_failed.clone()))?;
        registry.register(Box::new(sign_reclaimed.clone()))?;
        registry.register(Box::new(sign_cancelled.clone()))?;
        registry.register(Box::new(queue_entries.clone()))?;
        registry.register(Box::new(sign_duration.clone()))?;
        registry.register(Box::new(keys_generated.clone()))?;
        registry.register(Box::new(keys_deactivated.clone()))?;
        registry.register(Box::new(active_keys.clone()))?;
        registry.register(Box::new(signed_zones.clone()))?;
        registry.register(Box::new(signatures_created.clone()))?;

        Ok(Self {
            registry,
            sign_requests,
            sign_completed,
            sign_failed,
            sign_reclaimed,
            sign_cancelled,
            queue_entries,
            sign_duration,
            keys_generated,
            keys_deactivated,
            active_keys,
            signed_zones,
            signatures_created,
        })
    }

    pub fn record_enqueue(&self, reason: SigningReason, merged: bool) {
        self.sign_requests
            .with_label_values(&[reason.as_str(), if merged { "true" } else { "false" }])
            .inc();
    }

    pub fn record_completed(&self, scope: &str, duration: std::time::Duration, signatures: usize) {
        self.sign_completed.inc();
        self.sign_duration
            .with_label_values(&[scope])
            .observe(duration.as_secs_f64());
        self.signatures_created.inc_by(signatures as u64);
    }

    pub fn record_failed(&self) {
        self.sign_failed.inc();
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.sign_reclaimed.inc_by(count as u64);
    }

    pub fn record_cancelled(&self, count: usize) {
        self.sign_cancelled.inc_by(count as u64);
    }

    pub fn record_key_generated(&self, algorithm: &str, is_ksk: bool) {
        self.keys_generated
            .with_label_values(&[algorithm, if is_ksk { "ksk" } else { "zsk" }])
            .inc();
    }

    pub fn record_key_deactivated(&self, count: usize) {
        self.keys_deactivated.inc_by(count as u64);
    }

    /// Refresh gauges from current state, called before export
    pub fn update_state(
        &self,
        queue_counts: &[(QueueStatus, usize)],
        active_keys: usize,
        dnssec_zones: usize,
    ) {
        for (status, count) in queue_counts {
            self.queue_entries
                .with_label_values(&[status.as_str()])
                .set(*count as i64);
        }
        self.active_keys.set(active_keys as i64);
        self.signed_zones.set(dnssec_zones as i64);
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = SignerMetrics::new().unwrap();
        metrics.record_enqueue(SigningReason::Manual, false);
        metrics.record_key_generated("ECDSAP256SHA256", true);
        metrics.update_state(&[(QueueStatus::Pending, 3)], 2, 1);

        let text = metrics.export().unwrap();
        assert!(text.contains("zonesign_sign_requests_total{merged=\"false\",reason=\"manual\"} 1"));
        assert!(text.contains("zonesign_queue_entries{status=\"pending\"} 3"));
        assert!(text.contains("zonesign_active_keys 2"));
    }
}
