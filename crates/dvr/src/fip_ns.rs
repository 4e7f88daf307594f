//! Shared floating IP namespaces.
//!
//! One namespace exists per external network while at least one distributed
//! router on this host has a floating IP on it. The namespace is created on
//! the first subscription and destroyed when the last subscriber leaves.
//! Every lifecycle step for a network runs under that network's lock, so two
//! routers can never both observe "last" and a subscriber can never attach
//! to a namespace that is being torn down.

use crate::allocator::{LinkLocalLease, RulePriorityAllocator};
use crate::primitives::{PlugRequest, Primitives};
use crate::types::{
    FIP_2_ROUTER_DEV_PREFIX, FIP_EXT_DEV_PREFIX, FIP_NS_PREFIX, Port, ROUTER_2_FIP_DEV_PREFIX,
    device_name,
};
use common::Result;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Routing table holding floating IP default routes in router namespaces.
pub const FIP_RT_TBL: u32 = 16;

/// Settings shared by all FIP namespaces.
#[derive(Debug, Clone)]
pub struct FipSettings {
    pub rule_priority_start: u32,
    pub rule_priority_end: u32,
    pub rule_table: u32,
    pub device_name_len: usize,
}

impl Default for FipSettings {
    fn default() -> Self {
        Self {
            rule_priority_start: crate::allocator::FIP_PR_START,
            rule_priority_end: crate::allocator::FIP_PR_END,
            rule_table: FIP_RT_TBL,
            device_name_len: crate::types::DEV_NAME_LEN,
        }
    }
}

/// Lock-protected handle to one network's FIP namespace.
pub type FipNamespaceHandle = Arc<Mutex<FipNamespace>>;

/// State of the floating IP namespace of one external network.
#[derive(Debug)]
pub struct FipNamespace {
    ext_net_id: String,
    name: String,
    subscribers: BTreeSet<String>,
    agent_gateway_port: Option<Port>,
    created: bool,
    rule_priorities: RulePriorityAllocator,
    settings: FipSettings,
}

impl FipNamespace {
    pub fn new(ext_net_id: &str, settings: FipSettings) -> Self {
        Self {
            ext_net_id: ext_net_id.to_string(),
            name: format!("{}{}", FIP_NS_PREFIX, ext_net_id),
            subscribers: BTreeSet::new(),
            agent_gateway_port: None,
            created: false,
            rule_priorities: RulePriorityAllocator::new(
                settings.rule_priority_start,
                settings.rule_priority_end,
            ),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ext_net_id(&self) -> &str {
        &self.ext_net_id
    }

    pub fn rule_table(&self) -> u32 {
        self.settings.rule_table
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn subscribers(&self) -> &BTreeSet<String> {
        &self.subscribers
    }

    pub fn agent_gateway_port(&self) -> Option<&Port> {
        self.agent_gateway_port.as_ref()
    }

    /// External gateway device of the namespace.
    pub fn ext_device_name(&self, port_id: &str) -> String {
        device_name(FIP_EXT_DEV_PREFIX, port_id, self.settings.device_name_len)
    }

    /// FIP-namespace end of the link to `router_id`.
    pub fn int_device_name(&self, router_id: &str) -> String {
        device_name(FIP_2_ROUTER_DEV_PREFIX, router_id, self.settings.device_name_len)
    }

    /// Router-namespace end of the link of `router_id`.
    pub fn rtr_ext_device_name(&self, router_id: &str) -> String {
        device_name(ROUTER_2_FIP_DEV_PREFIX, router_id, self.settings.device_name_len)
    }

    pub fn allocate_rule_priority(&self) -> Result<u32> {
        self.rule_priorities.allocate()
    }

    pub fn deallocate_rule_priority(&self, priority: u32) {
        self.rule_priorities.deallocate(priority)
    }

    pub fn rule_priorities_in_use(&self) -> usize {
        self.rule_priorities.in_use()
    }

    /// Add `router_id` to the subscribers; true if it is the first one.
    pub fn subscribe(&mut self, router_id: &str) -> bool {
        let is_first = self.subscribers.is_empty();
        self.subscribers.insert(router_id.to_string());
        is_first
    }

    /// Remove `router_id` from the subscribers; true if none are left.
    pub fn unsubscribe(&mut self, router_id: &str) -> bool {
        self.subscribers.remove(router_id);
        self.subscribers.is_empty()
    }

    /// Create the namespace and plug the agent gateway port, resuming after
    /// a partial failure.
    pub async fn ensure_created(&mut self, prims: &Primitives, gw_port: &Port) -> Result<()> {
        if !self.created {
            info!(namespace = %self.name, ext_net_id = %self.ext_net_id, "Creating FIP namespace");
            prims.namespaces.create(&self.name).await?;
            self.created = true;
        }
        if self.agent_gateway_port.is_none() {
            prims
                .namespaces
                .set_sysctl(&self.name, "net.ipv4.ip_forward", "1")
                .await?;
            self.create_gateway_port(prims, gw_port).await?;
        }
        Ok(())
    }

    async fn create_gateway_port(&mut self, prims: &Primitives, port: &Port) -> Result<()> {
        let interface_name = self.ext_device_name(&port.id);
        prims
            .devices
            .plug(&PlugRequest::for_port(
                port,
                &interface_name,
                &self.name,
                FIP_EXT_DEV_PREFIX,
            ))
            .await?;

        if let Some(cidr) = port.ip_cidr() {
            prims
                .devices
                .add_address(&interface_name, &self.name, cidr)
                .await?;
        }
        if let Some(gateway) = port.subnet.as_ref().and_then(|s| s.gateway_ip) {
            prims
                .routes
                .add_gateway(&self.name, &interface_name, gateway, None)
                .await?;
        }

        debug!(namespace = %self.name, device = %interface_name, "Agent gateway port plugged");
        self.agent_gateway_port = Some(port.clone());
        Ok(())
    }

    /// Link `router_ns` to this namespace over the leased /31 and point the
    /// router's FIP table at the far end.
    pub async fn create_rtr_2_fip_link(
        &self,
        prims: &Primitives,
        router_id: &str,
        router_ns: &str,
        lease: &LinkLocalLease,
    ) -> Result<()> {
        let rtr_2_fip_name = self.rtr_ext_device_name(router_id);
        let fip_2_rtr_name = self.int_device_name(router_id);
        let (rtr_2_fip, fip_2_rtr) = lease.pair();

        prims
            .devices
            .create_veth(&rtr_2_fip_name, router_ns, &fip_2_rtr_name, &self.name)
            .await?;
        prims
            .devices
            .add_address(&rtr_2_fip_name, router_ns, IpNetwork::V4(rtr_2_fip))
            .await?;
        prims
            .devices
            .add_address(&fip_2_rtr_name, &self.name, IpNetwork::V4(fip_2_rtr))
            .await?;
        prims
            .routes
            .add_gateway(
                router_ns,
                &rtr_2_fip_name,
                fip_2_rtr.ip().into(),
                Some(self.settings.rule_table),
            )
            .await?;

        info!(
            router_id,
            namespace = %self.name,
            link = %lease.subnet,
            "Router linked to FIP namespace"
        );
        Ok(())
    }

    /// Tear the namespace down.
    ///
    /// Refuses while routers are still subscribed.
    pub async fn destroy(&mut self, prims: &Primitives) -> Result<()> {
        if !self.subscribers.is_empty() {
            warn!(
                namespace = %self.name,
                subscribers = self.subscribers.len(),
                "Not destroying FIP namespace with subscribers"
            );
            return Ok(());
        }
        if !self.created {
            debug!(namespace = %self.name, "FIP namespace already gone");
            return Ok(());
        }

        info!(namespace = %self.name, "Destroying FIP namespace");
        for device in prims.namespaces.list_devices(&self.name).await? {
            if device.starts_with(FIP_EXT_DEV_PREFIX) {
                prims
                    .devices
                    .unplug(&device, &self.name, FIP_EXT_DEV_PREFIX)
                    .await?;
            } else if device.starts_with(FIP_2_ROUTER_DEV_PREFIX) {
                prims.devices.delete(&device, &self.name).await?;
            }
        }
        prims.namespaces.delete(&self.name).await?;

        self.created = false;
        self.agent_gateway_port = None;
        Ok(())
    }
}

/// Registry of FIP namespaces keyed by external network.
///
/// Handles are never removed from the registry, so every caller for a given
/// network serializes on the same lock even across destroy and re-create.
#[derive(Debug, Default)]
pub struct FipNamespaceManager {
    namespaces: DashMap<String, FipNamespaceHandle>,
    settings: FipSettings,
}

impl FipNamespaceManager {
    pub fn new(settings: FipSettings) -> Self {
        Self {
            namespaces: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &FipSettings {
        &self.settings
    }

    /// Handle for `ext_net_id`, memoized on its normalized form.
    pub fn get_or_create(&self, ext_net_id: &str) -> FipNamespaceHandle {
        let key = normalize_net_id(ext_net_id);
        self.namespaces
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FipNamespace::new(&key, self.settings.clone()))))
            .clone()
    }

    /// Handle for `ext_net_id` if one was ever requested.
    pub fn get(&self, ext_net_id: &str) -> Option<FipNamespaceHandle> {
        self.namespaces
            .get(&normalize_net_id(ext_net_id))
            .map(|entry| entry.clone())
    }

    /// Subscribe `router_id`, creating the namespace on first use.
    ///
    /// A failed creation leaves the router unsubscribed.
    pub async fn subscribe(
        &self,
        prims: &Primitives,
        ext_net_id: &str,
        router_id: &str,
        gw_port: &Port,
    ) -> Result<FipNamespaceHandle> {
        let handle = self.get_or_create(ext_net_id);
        {
            let mut fip_ns = handle.lock().await;
            let is_first = fip_ns.subscribe(router_id);
            if let Err(e) = fip_ns.ensure_created(prims, gw_port).await {
                if fip_ns.unsubscribe(router_id) {
                    if let Err(cleanup) = fip_ns.destroy(prims).await {
                        warn!(
                            namespace = %fip_ns.name(),
                            error = %cleanup,
                            "Cleanup of FIP namespace failed"
                        );
                    }
                }
                return Err(e);
            }
            debug!(router_id, namespace = %fip_ns.name(), is_first, "Subscribed to FIP namespace");
        }
        Ok(handle)
    }

    /// Unsubscribe `router_id` and destroy the namespace if it was the last
    /// subscriber. Returns whether it was the last.
    pub async fn unsubscribe(
        &self,
        prims: &Primitives,
        ext_net_id: &str,
        router_id: &str,
    ) -> Result<bool> {
        let Some(handle) = self.get(ext_net_id) else {
            warn!(ext_net_id, router_id, "Unsubscribe from unknown FIP namespace");
            return Ok(false);
        };
        let mut fip_ns = handle.lock().await;
        let is_last = fip_ns.unsubscribe(router_id);
        if is_last {
            fip_ns.destroy(prims).await?;
        }
        Ok(is_last)
    }
}

fn normalize_net_id(ext_net_id: &str) -> String {
    ext_net_id.trim().to_ascii_lowercase()
}
