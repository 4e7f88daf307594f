//! Router, port and floating IP records supplied by the control plane.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Router identifier as handed out by the control plane.
pub type RouterId = String;

/// Prefix of router namespaces.
pub const ROUTER_NS_PREFIX: &str = "qrouter-";
/// Prefix of centralized SNAT namespaces.
pub const SNAT_NS_PREFIX: &str = "snat-";
/// Prefix of shared floating IP namespaces.
pub const FIP_NS_PREFIX: &str = "fip-";

/// Router internal device.
pub const INTERNAL_DEV_PREFIX: &str = "qr-";
/// External gateway device.
pub const EXTERNAL_DEV_PREFIX: &str = "qg-";
/// SNAT-side device of an internal subnet.
pub const SNAT_INT_DEV_PREFIX: &str = "sg-";
/// FIP namespace external gateway device.
pub const FIP_EXT_DEV_PREFIX: &str = "fg-";
/// FIP namespace end of the router link.
pub const FIP_2_ROUTER_DEV_PREFIX: &str = "fpr-";
/// Router namespace end of the FIP link.
pub const ROUTER_2_FIP_DEV_PREFIX: &str = "rfp-";
/// HA network device.
pub const HA_DEV_PREFIX: &str = "ha-";

/// Kernel limit on interface names, less the terminating NUL.
pub const DEV_NAME_LEN: usize = 14;

/// Device owners of router-owned ports. Neighbor entries are never installed
/// for these.
pub const ROUTER_INTERFACE_OWNERS: &[&str] = &[
    "network:router_interface",
    "network:router_interface_distributed",
    "network:router_centralized_snat",
];

/// Build a device name from `prefix` and `id`, truncated to `max_len`.
pub fn device_name(prefix: &str, id: &str, max_len: usize) -> String {
    let mut name = format!("{}{}", prefix, id);
    name.truncate(max_len);
    name
}

/// Name of the namespace owned by a router.
pub fn router_ns_name(router_id: &str) -> String {
    format!("{}{}", ROUTER_NS_PREFIX, router_id)
}

/// Name of the centralized SNAT namespace of a router.
pub fn snat_ns_name(router_id: &str) -> String {
    format!("{}{}", SNAT_NS_PREFIX, router_id)
}

/// Fixed IP of a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: IpAddr,
}

/// Subnet details attached to router ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub id: String,
    pub cidr: IpNetwork,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
}

/// A port record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub mac_address: String,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub subnet: Option<SubnetInfo>,
}

impl Port {
    /// Address of the first fixed IP with the subnet's prefix length.
    pub fn ip_cidr(&self) -> Option<IpNetwork> {
        let fixed = self.fixed_ips.first()?;
        let prefix = self.subnet.as_ref()?.cidr.prefix();
        IpNetwork::new(fixed.ip_address, prefix).ok()
    }

    /// Subnet of the first fixed IP.
    pub fn subnet_id(&self) -> Option<&str> {
        self.fixed_ips.first().map(|f| f.subnet_id.as_str())
    }

    /// Whether the port is owned by a router.
    pub fn is_router_owned(&self) -> bool {
        ROUTER_INTERFACE_OWNERS.contains(&self.device_owner.as_str())
    }
}

/// A router record as scheduled to this agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    #[serde(default)]
    pub distributed: bool,
    #[serde(default)]
    pub ha: bool,
    #[serde(default)]
    pub gw_port: Option<Port>,
    #[serde(default)]
    pub interfaces: Vec<Port>,
    #[serde(default)]
    pub snat_interfaces: Vec<Port>,
    #[serde(default)]
    pub ha_interface: Option<Port>,
    /// Agent gateway port for the router's external network on this host.
    #[serde(default)]
    pub fip_agent_gw_port: Option<Port>,
}

/// A floating IP association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub floating_ip_address: IpAddr,
    pub fixed_ip_address: IpAddr,
    pub floating_network_id: String,
}

/// Neighbor update carried by ARP RPC payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub ip_address: IpAddr,
    pub mac_address: String,
    pub subnet_id: String,
}

/// Operation applied to a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArpOperation {
    Add,
    Delete,
}

impl fmt::Display for ArpOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArpOperation::Add => write!(f, "add"),
            ArpOperation::Delete => write!(f, "delete"),
        }
    }
}
