//! Prometheus metrics for HA state handling.

use crate::types::HaState;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    /// Target state (master, backup, fault)
    pub state: String,
}

/// HA metrics, registered into a shared registry.
#[derive(Debug, Default)]
pub struct HaMetrics {
    transitions_total: Family<StateLabels, Counter>,
    events_dropped_total: Counter,
    proxy_running: Gauge,
}

impl HaMetrics {
    /// Create the metrics and register them in `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "l3_agent_ha_transitions",
            "HA state transitions applied",
            metrics.transitions_total.clone(),
        );
        registry.register(
            "l3_agent_ha_events_dropped",
            "HA notifications dropped for unmanaged routers",
            metrics.events_dropped_total.clone(),
        );
        registry.register(
            "l3_agent_ha_proxy_running",
            "Metadata proxies currently running",
            metrics.proxy_running.clone(),
        );
        metrics
    }

    pub fn record_transition(&self, state: HaState) {
        self.transitions_total
            .get_or_create(&StateLabels {
                state: state.to_string(),
            })
            .inc();
    }

    pub fn record_dropped(&self) {
        self.events_dropped_total.inc();
    }

    pub fn proxy_started(&self) {
        self.proxy_running.inc();
    }

    pub fn proxy_stopped(&self) {
        self.proxy_running.dec();
    }

    pub fn proxies_running(&self) -> i64 {
        self.proxy_running.get()
    }

    pub fn dropped(&self) -> u64 {
        self.events_dropped_total.get()
    }
}
