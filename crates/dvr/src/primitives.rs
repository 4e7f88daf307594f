//! Collaborator interfaces for the kernel-facing primitives.
//!
//! This crate decides which namespaces, devices, rules, routes and neighbor
//! entries must exist. Applying them is delegated to implementations of the
//! traits below, which are expected to be synchronous in effect and fast.

use crate::types::Port;
use async_trait::async_trait;
use common::Result;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;

/// Network namespace primitive.
#[async_trait]
pub trait NamespaceOps: Send + Sync {
    async fn create(&self, name: &str) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Devices in the namespace, loopback excluded.
    async fn list_devices(&self, name: &str) -> Result<Vec<String>>;

    /// Set a sysctl inside the namespace.
    async fn set_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
}

/// Parameters for plugging a port's device into a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugRequest {
    pub network_id: String,
    pub port_id: String,
    pub device_name: String,
    pub mac_address: String,
    pub namespace: String,
    pub prefix: String,
}

impl PlugRequest {
    /// Request for plugging `port` as `device_name`.
    pub fn for_port(port: &Port, device_name: &str, namespace: &str, prefix: &str) -> Self {
        Self {
            network_id: port.network_id.clone(),
            port_id: port.id.clone(),
            device_name: device_name.to_string(),
            mac_address: port.mac_address.clone(),
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
        }
    }
}

/// Device and link primitive.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Create a veth pair with `near` in `near_ns` and `far` in `far_ns`.
    async fn create_veth(&self, near: &str, near_ns: &str, far: &str, far_ns: &str) -> Result<()>;

    async fn delete(&self, name: &str, namespace: &str) -> Result<()>;

    async fn plug(&self, request: &PlugRequest) -> Result<()>;

    async fn unplug(&self, name: &str, namespace: &str, prefix: &str) -> Result<()>;

    async fn add_address(&self, name: &str, namespace: &str, cidr: IpNetwork) -> Result<()>;
}

/// Source selector of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleSelector {
    Ip(IpAddr),
    Cidr(IpNetwork),
}

impl std::fmt::Display for RuleSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSelector::Ip(ip) => write!(f, "{}", ip),
            RuleSelector::Cidr(cidr) => write!(f, "{}", cidr),
        }
    }
}

/// Policy routing rule primitive.
#[async_trait]
pub trait RuleOps: Send + Sync {
    async fn add(&self, namespace: &str, from: RuleSelector, table: u32, priority: u32)
    -> Result<()>;

    async fn delete(&self, namespace: &str, from: RuleSelector, table: u32, priority: u32)
    -> Result<()>;
}

/// Route primitive. `table` of `None` means the main table.
#[async_trait]
pub trait RouteOps: Send + Sync {
    async fn add_route(&self, namespace: &str, device: &str, dst: IpNetwork, via: IpAddr)
    -> Result<()>;

    async fn delete_route(
        &self,
        namespace: &str,
        device: &str,
        dst: IpNetwork,
        via: IpAddr,
    ) -> Result<()>;

    async fn add_gateway(
        &self,
        namespace: &str,
        device: &str,
        via: IpAddr,
        table: Option<u32>,
    ) -> Result<()>;

    /// Delete the default route of `table`; `via` narrows the match when known.
    async fn delete_gateway(
        &self,
        namespace: &str,
        device: &str,
        via: Option<IpAddr>,
        table: Option<u32>,
    ) -> Result<()>;
}

/// Neighbor (ARP/NDP) primitive. The IP version follows from `ip`.
#[async_trait]
pub trait NeighborOps: Send + Sync {
    async fn add(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str) -> Result<()>;

    async fn delete(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str) -> Result<()>;
}

/// Gratuitous ARP / proxy ARP announcement primitive.
#[async_trait]
pub trait ArpAnnouncer: Send + Sync {
    async fn send(&self, namespace: &str, device: &str, ip: IpAddr, count: u32) -> Result<()>;
}

/// iptables ruleset primitive, addressed by namespace.
#[async_trait]
pub trait IptablesOps: Send + Sync {
    async fn empty_chain(&self, namespace: &str, table: &str, chain: &str) -> Result<()>;

    async fn add_rule(&self, namespace: &str, table: &str, chain: &str, rule: &str) -> Result<()>;

    async fn apply(&self, namespace: &str) -> Result<()>;
}

/// Control-plane lookup of ports on a subnet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortSource: Send + Sync {
    async fn get_ports_by_subnet(&self, subnet_id: &str) -> Result<Vec<Port>>;
}

/// Bundle of primitive implementations shared by the controllers.
#[derive(Clone)]
pub struct Primitives {
    pub namespaces: Arc<dyn NamespaceOps>,
    pub devices: Arc<dyn DeviceOps>,
    pub rules: Arc<dyn RuleOps>,
    pub routes: Arc<dyn RouteOps>,
    pub neighbors: Arc<dyn NeighborOps>,
    pub arp: Arc<dyn ArpAnnouncer>,
    pub iptables: Arc<dyn IptablesOps>,
}

impl Primitives {
    /// Use a single backend for every primitive.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: NamespaceOps
            + DeviceOps
            + RuleOps
            + RouteOps
            + NeighborOps
            + ArpAnnouncer
            + IptablesOps
            + 'static,
    {
        Self {
            namespaces: backend.clone(),
            devices: backend.clone(),
            rules: backend.clone(),
            routes: backend.clone(),
            neighbors: backend.clone(),
            arp: backend.clone(),
            iptables: backend,
        }
    }
}
