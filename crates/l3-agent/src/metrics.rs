//! Prometheus metrics for the L3 agent.

use ha::HaMetrics;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Metrics registry with all agent metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// HA metrics, shared with the HA controller
    ha: Arc<HaMetrics>,

    /// 1 while a full resync has been requested and not yet taken
    full_sync_needed: Gauge,
    /// Routers currently managed
    routers: Gauge,
    /// Floating IPs currently bound
    floating_ips: Gauge,
    /// Resync requests taken by the resync loop
    resyncs_total: Counter,
    /// Supervised processes respawned after dying
    respawns_total: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let ha = Arc::new(HaMetrics::new(&mut registry));

        let full_sync_needed = Gauge::default();
        registry.register(
            "l3_agent_full_sync_needed",
            "Whether a full resync of router state is pending",
            full_sync_needed.clone(),
        );

        let routers = Gauge::default();
        registry.register("l3_agent_routers", "Routers managed by the agent", routers.clone());

        let floating_ips = Gauge::default();
        registry.register(
            "l3_agent_floating_ips",
            "Floating IPs bound on distributed routers",
            floating_ips.clone(),
        );

        let resyncs_total = Counter::default();
        registry.register(
            "l3_agent_resyncs",
            "Full resyncs taken by the resync loop",
            resyncs_total.clone(),
        );

        let respawns_total = Counter::default();
        registry.register(
            "l3_agent_process_respawns",
            "Supervised processes respawned after exiting",
            respawns_total.clone(),
        );

        Self {
            registry,
            ha,
            full_sync_needed,
            routers,
            floating_ips,
            resyncs_total,
            respawns_total,
        }
    }

    pub fn ha(&self) -> Arc<HaMetrics> {
        self.ha.clone()
    }

    pub fn set_full_sync_needed(&self, needed: bool) {
        self.full_sync_needed.set(i64::from(needed));
    }

    pub fn set_router_count(&self, count: usize) {
        self.routers.set(count as i64);
    }

    /// Add `delta` (possibly negative) to the bound floating IP gauge.
    pub fn adjust_floating_ips(&self, delta: i64) {
        self.floating_ips.inc_by(delta);
    }

    pub fn record_resync(&self) {
        self.resyncs_total.inc();
    }

    pub fn record_respawns(&self, count: usize) {
        self.respawns_total.inc_by(count as u64);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
