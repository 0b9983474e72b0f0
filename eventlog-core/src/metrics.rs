//! Prometheus metrics for the message pipeline.
//!
//! Metrics are registered into a caller-supplied registry so several nodes can
//! live in one process (integration tests do exactly that).

use crate::error::Result;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    /// Messages accepted by a store, by store name
    pub store_messages: IntCounterVec,

    /// Messages dropped, by store and reason
    pub store_dropped: IntCounterVec,

    /// Live barrels per store
    pub store_barrels: IntGaugeVec,

    /// Flush attempts by store and result
    pub store_flush: IntCounterVec,

    pub ingress_messages: IntCounterVec,
    pub ingress_dropped: IntCounterVec,

    /// Peer frames by direction (in/out) and topic
    pub cluster_frames: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new(registry: Registry) -> Result<Self> {
        let store_messages = IntCounterVec::new(
            Opts::new(
                "eventlog_store_messages_total",
                "Total number of messages accepted by a store",
            ),
            &["store"],
        )?;
        let store_dropped = IntCounterVec::new(
            Opts::new(
                "eventlog_store_dropped_total",
                "Total number of messages dropped by a store",
            ),
            &["store", "reason"],
        )?;
        let store_barrels = IntGaugeVec::new(
            Opts::new("eventlog_store_barrels", "Number of live barrels"),
            &["store"],
        )?;
        let store_flush = IntCounterVec::new(
            Opts::new("eventlog_store_flush_total", "Total number of barrel flushes"),
            &["store", "result"],
        )?;
        let ingress_messages = IntCounterVec::new(
            Opts::new(
                "eventlog_ingress_messages_total",
                "Total number of messages received by an ingress listener",
            ),
            &["listener"],
        )?;
        let ingress_dropped = IntCounterVec::new(
            Opts::new(
                "eventlog_ingress_dropped_total",
                "Total number of ingress messages dropped on a full channel",
            ),
            &["listener"],
        )?;
        let cluster_frames = IntCounterVec::new(
            Opts::new("eventlog_cluster_frames_total", "Total number of peer frames"),
            &["direction", "topic"],
        )?;

        registry.register(Box::new(store_messages.clone()))?;
        registry.register(Box::new(store_dropped.clone()))?;
        registry.register(Box::new(store_barrels.clone()))?;
        registry.register(Box::new(store_flush.clone()))?;
        registry.register(Box::new(ingress_messages.clone()))?;
        registry.register(Box::new(ingress_dropped.clone()))?;
        registry.register(Box::new(cluster_frames.clone()))?;

        Ok(Self {
            registry,
            store_messages,
            store_dropped,
            store_barrels,
            store_flush,
            ingress_messages,
            ingress_dropped,
            cluster_frames,
        })
    }

    /// Metrics bound to a fresh private registry.
    pub fn unregistered() -> Result<Self> {
        Self::new(Registry::new())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dropped(&self, store: &str, reason: &str) {
        self.store_dropped.with_label_values(&[store, reason]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once_per_registry() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new(registry.clone()).unwrap();
        metrics.dropped("event", "over_cap");
        assert_eq!(
            metrics
                .store_dropped
                .with_label_values(&["event", "over_cap"])
                .get(),
            1
        );
        assert!(PipelineMetrics::new(registry).is_err());
    }
}
