//! Prometheus metrics for one server instance.
//!
//! Each server owns its own [`Registry`], so several servers can run in
//! one process (tests, upstream chains) without colliding.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::protocol::packet::PacketType;

pub struct ServerMetrics {
    registry: Registry,
    pub requests: IntCounterVec,
    pub malformed_packets: IntCounter,
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub upstream_fetches: IntCounter,
    pub items_added: IntCounter,
    pub adds_rejected: IntCounter,
    pub evictions: IntCounter,
    pub relays_completed: IntCounter,
    pub relays_failed: IntCounter,
    pub used_bytes: IntGauge,
    pub items: IntGauge,
    pub clients: IntGauge,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("asset_cache".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests received, by packet type"),
            &["kind"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let malformed_packets = counter("malformed_packets_total", "Undecodable packets received")?;
        let hits = counter("hits_total", "Gets served from the local store")?;
        let misses = counter("misses_total", "Gets answered with a miss")?;
        let upstream_fetches = counter("upstream_fetches_total", "Gets forwarded to upstream")?;
        let items_added = counter("items_added_total", "Values stored after a complete add")?;
        let adds_rejected = counter("adds_rejected_total", "Announces or chunks rejected")?;
        let evictions = counter("evictions_total", "Values evicted to make room")?;
        let relays_completed = counter("relays_completed_total", "Values relayed to upstream")?;
        let relays_failed = counter("relays_failed_total", "Relays refused or aborted")?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let used_bytes = gauge("used_bytes", "Bytes held by the store")?;
        let items = gauge("items", "Values held by the store")?;
        let clients = gauge("clients", "Open client channels")?;

        Ok(Self {
            registry,
            requests,
            malformed_packets,
            hits,
            misses,
            upstream_fetches,
            items_added,
            adds_rejected,
            evictions,
            relays_completed,
            relays_failed,
            used_bytes,
            items,
            clients,
        })
    }

    pub fn record_request(&self, kind: PacketType) {
        self.requests.with_label_values(&[kind.name()]).inc();
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
