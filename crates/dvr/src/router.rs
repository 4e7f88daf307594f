//! Per-router state owned by this agent.

use crate::allocator::LinkLocalLease;
use crate::fip_ns::FipNamespaceHandle;
use crate::primitives::IptablesOps;
use crate::types::{Port, Router, router_ns_name};
use common::Result;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Rule priority and source address bound to one distributed floating IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FipBinding {
    pub priority: u32,
    pub fixed_ip: IpAddr,
}

/// Handle on the iptables ruleset of a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesHandle {
    pub namespace: String,
}

/// Whether FIP NAT rules are installed or only flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatAction {
    AddRules,
    RemoveRules,
}

/// State of one logical router on this host.
#[derive(Debug)]
pub struct RouterState {
    pub router: Router,
    pub ns_name: String,
    /// Floating address to its rule binding. The distributed floating IP
    /// count is the size of this table.
    pub floating_ips: BTreeMap<IpAddr, FipBinding>,
    /// Link-local subnet of the router-to-FIP-namespace link.
    pub rtr_fip_subnet: Option<LinkLocalLease>,
    pub fip_ns: Option<FipNamespaceHandle>,
    /// External network the router is subscribed to through `fip_ns`.
    pub fip_ext_net_id: Option<String>,
    pub ha_port: Option<Port>,
    pub snat_iptables: Option<IptablesHandle>,
}

impl RouterState {
    pub fn new(router: Router) -> Self {
        Self {
            ns_name: router_ns_name(&router.id),
            router,
            floating_ips: BTreeMap::new(),
            rtr_fip_subnet: None,
            fip_ns: None,
            fip_ext_net_id: None,
            ha_port: None,
            snat_iptables: None,
        }
    }

    pub fn router_id(&self) -> &str {
        &self.router.id
    }

    pub fn is_distributed(&self) -> bool {
        self.router.distributed
    }

    pub fn dist_fip_count(&self) -> usize {
        self.floating_ips.len()
    }

    /// Router internal port attached to `subnet_id`.
    pub fn internal_port(&self, subnet_id: &str) -> Option<&Port> {
        self.router
            .interfaces
            .iter()
            .find(|port| port.fixed_ips.iter().any(|f| f.subnet_id == subnet_id))
    }

    /// Reset the floating IP NAT chains of the router namespace.
    ///
    /// The router owns its namespace, so both chains are emptied wholesale
    /// before the `float-snat` jump and, for [`NatAction::AddRules`], the
    /// rule exempting traffic that stays on `interface_name` are added back.
    pub async fn handle_fip_nat_rules(
        &self,
        iptables: &dyn IptablesOps,
        interface_name: Option<&str>,
        action: NatAction,
    ) -> Result<()> {
        let ns = &self.ns_name;
        iptables.empty_chain(ns, "nat", "POSTROUTING").await?;
        iptables.empty_chain(ns, "nat", "snat").await?;
        iptables.add_rule(ns, "nat", "snat", "-j $float-snat").await?;

        if let (NatAction::AddRules, Some(interface)) = (action, interface_name) {
            let rule = format!(
                "! -i {0} ! -o {0} -m conntrack ! --ctstate DNAT -j ACCEPT",
                interface
            );
            iptables.add_rule(ns, "nat", "POSTROUTING", &rule).await?;
        }

        debug!(router_id = %self.router.id, ?action, "FIP NAT rules updated");
        iptables.apply(ns).await
    }
}

/// Lock-protected handle on one router's state.
pub type RouterHandle = Arc<Mutex<RouterState>>;

/// Routers managed by this agent, each behind its own lock.
#[derive(Debug, Default)]
pub struct RouterRegistry {
    routers: DashMap<String, RouterHandle>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing `router`. An already managed router keeps its state.
    pub fn add(&self, router: Router) -> RouterHandle {
        let id = router.id.clone();
        self.routers
            .entry(id.clone())
            .or_insert_with(|| {
                info!(router_id = %id, "Managing router");
                Arc::new(Mutex::new(RouterState::new(router)))
            })
            .clone()
    }

    pub fn get(&self, router_id: &str) -> Option<RouterHandle> {
        self.routers.get(router_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, router_id: &str) -> Option<RouterHandle> {
        self.routers.remove(router_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, router_id: &str) -> bool {
        self.routers.contains_key(router_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.routers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}
