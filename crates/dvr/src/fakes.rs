//! In-memory primitives for tests.
//!
//! [`FakeKernel`] implements every primitive trait without touching the host.
//! It records each call in order and keeps a small model of namespaces,
//! devices, rules, routes and neighbors so tests can assert on the resulting
//! state as well as the call sequence. Operations can be made to fail by name
//! (`"namespace.create"`, `"rule.add"`, ...).

use crate::primitives::{
    ArpAnnouncer, DeviceOps, IptablesOps, NamespaceOps, NeighborOps, PlugRequest, PortSource,
    Primitives, RouteOps, RuleOps, RuleSelector,
};
use crate::types::{FixedIp, Port, SubnetInfo};
use async_trait::async_trait;
use common::{Error, Result};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A recorded primitive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NamespaceCreate(String),
    NamespaceDelete(String),
    Sysctl { namespace: String, key: String, value: String },
    CreateVeth { near: String, near_ns: String, far: String, far_ns: String },
    DeviceDelete { name: String, namespace: String },
    Plug(PlugRequest),
    Unplug { name: String, namespace: String },
    AddAddress { name: String, namespace: String, cidr: IpNetwork },
    RuleAdd { namespace: String, from: RuleSelector, table: u32, priority: u32 },
    RuleDelete { namespace: String, from: RuleSelector, table: u32, priority: u32 },
    RouteAdd { namespace: String, device: String, dst: IpNetwork, via: IpAddr },
    RouteDelete { namespace: String, device: String, dst: IpNetwork, via: IpAddr },
    GatewayAdd { namespace: String, device: String, via: IpAddr, table: Option<u32> },
    GatewayDelete { namespace: String, device: String, table: Option<u32> },
    NeighborAdd { namespace: String, device: String, ip: IpAddr, mac: String },
    NeighborDelete { namespace: String, device: String, ip: IpAddr, mac: String },
    Garp { namespace: String, device: String, ip: IpAddr },
    IptablesEmptyChain { namespace: String, table: String, chain: String },
    IptablesAddRule { namespace: String, table: String, chain: String, rule: String },
    IptablesApply(String),
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    failures: HashSet<String>,
    namespaces: BTreeSet<String>,
    devices: BTreeMap<String, BTreeSet<String>>,
    rules: HashSet<(String, RuleSelector, u32, u32)>,
    routes: HashSet<(String, IpNetwork)>,
    gateways: HashSet<(String, Option<u32>)>,
    neighbors: HashSet<(String, String, IpAddr)>,
}

/// Recording in-memory kernel.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Primitives bundle backed by this kernel.
    pub fn primitives(self: &Arc<Self>) -> Primitives {
        Primitives::from_backend(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call of `op` fail until cleared.
    pub fn fail_on(&self, op: &str) {
        self.state().failures.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.state().namespaces.contains(name)
    }

    pub fn devices_in(&self, namespace: &str) -> Vec<String> {
        self.state()
            .devices
            .get(namespace)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `(selector, table, priority)` of the rules in `namespace`.
    pub fn rules_in(&self, namespace: &str) -> Vec<(RuleSelector, u32, u32)> {
        self.state()
            .rules
            .iter()
            .filter(|(ns, ..)| ns == namespace)
            .map(|(_, from, table, priority)| (*from, *table, *priority))
            .collect()
    }

    pub fn routes_in(&self, namespace: &str) -> Vec<IpNetwork> {
        self.state()
            .routes
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, dst)| *dst)
            .collect()
    }

    /// Tables holding a default route in `namespace`.
    pub fn gateways_in(&self, namespace: &str) -> Vec<Option<u32>> {
        self.state()
            .gateways
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, table)| *table)
            .collect()
    }

    pub fn neighbors_in(&self, namespace: &str) -> Vec<(String, IpAddr)> {
        self.state()
            .neighbors
            .iter()
            .filter(|(ns, ..)| ns == namespace)
            .map(|(_, dev, ip)| (dev.clone(), *ip))
            .collect()
    }

    /// Record `call`, failing first if `op` was armed.
    fn record(&self, op: &str, call: Call) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        if state.failures.contains(op) {
            return Err(Error::primitive(op, "injected failure"));
        }
        state.calls.push(call);
        Ok(state)
    }
}

fn missing(op: &str, what: impl std::fmt::Display) -> Error {
    Error::primitive(op, format!("{} does not exist", what))
}

#[async_trait]
impl NamespaceOps for FakeKernel {
    async fn create(&self, name: &str) -> Result<()> {
        let mut state = self.record("namespace.create", Call::NamespaceCreate(name.to_string()))?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(Error::primitive("namespace.create", format!("{} exists", name)));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.record("namespace.delete", Call::NamespaceDelete(name.to_string()))?;
        if !state.namespaces.remove(name) {
            return Err(missing("namespace.delete", name));
        }
        state.devices.remove(name);
        Ok(())
    }

    async fn list_devices(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.devices_in(name))
    }

    async fn set_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.record(
            "namespace.sysctl",
            Call::Sysctl {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl DeviceOps for FakeKernel {
    async fn create_veth(&self, near: &str, near_ns: &str, far: &str, far_ns: &str) -> Result<()> {
        let mut state = self.record(
            "device.create_veth",
            Call::CreateVeth {
                near: near.to_string(),
                near_ns: near_ns.to_string(),
                far: far.to_string(),
                far_ns: far_ns.to_string(),
            },
        )?;
        state
            .devices
            .entry(near_ns.to_string())
            .or_default()
            .insert(near.to_string());
        state
            .devices
            .entry(far_ns.to_string())
            .or_default()
            .insert(far.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        let mut state = self.record(
            "device.delete",
            Call::DeviceDelete {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
        )?;
        let removed = state
            .devices
            .get_mut(namespace)
            .is_some_and(|devices| devices.remove(name));
        if !removed {
            return Err(missing("device.delete", name));
        }
        Ok(())
    }

    async fn plug(&self, request: &PlugRequest) -> Result<()> {
        let mut state = self.record("device.plug", Call::Plug(request.clone()))?;
        state
            .devices
            .entry(request.namespace.clone())
            .or_default()
            .insert(request.device_name.clone());
        Ok(())
    }

    async fn unplug(&self, name: &str, namespace: &str, _prefix: &str) -> Result<()> {
        let mut state = self.record(
            "device.unplug",
            Call::Unplug {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
        )?;
        if let Some(devices) = state.devices.get_mut(namespace) {
            devices.remove(name);
        }
        Ok(())
    }

    async fn add_address(&self, name: &str, namespace: &str, cidr: IpNetwork) -> Result<()> {
        self.record(
            "device.add_address",
            Call::AddAddress {
                name: name.to_string(),
                namespace: namespace.to_string(),
                cidr,
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl RuleOps for FakeKernel {
    async fn add(
        &self,
        namespace: &str,
        from: RuleSelector,
        table: u32,
        priority: u32,
    ) -> Result<()> {
        let mut state = self.record(
            "rule.add",
            Call::RuleAdd {
                namespace: namespace.to_string(),
                from,
                table,
                priority,
            },
        )?;
        state
            .rules
            .insert((namespace.to_string(), from, table, priority));
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        from: RuleSelector,
        table: u32,
        priority: u32,
    ) -> Result<()> {
        let mut state = self.record(
            "rule.delete",
            Call::RuleDelete {
                namespace: namespace.to_string(),
                from,
                table,
                priority,
            },
        )?;
        if !state
            .rules
            .remove(&(namespace.to_string(), from, table, priority))
        {
            return Err(missing("rule.delete", format!("rule from {} prio {}", from, priority)));
        }
        Ok(())
    }
}

#[async_trait]
impl RouteOps for FakeKernel {
    async fn add_route(
        &self,
        namespace: &str,
        device: &str,
        dst: IpNetwork,
        via: IpAddr,
    ) -> Result<()> {
        let mut state = self.record(
            "route.add",
            Call::RouteAdd {
                namespace: namespace.to_string(),
                device: device.to_string(),
                dst,
                via,
            },
        )?;
        state.routes.insert((namespace.to_string(), dst));
        Ok(())
    }

    async fn delete_route(
        &self,
        namespace: &str,
        device: &str,
        dst: IpNetwork,
        via: IpAddr,
    ) -> Result<()> {
        let mut state = self.record(
            "route.delete",
            Call::RouteDelete {
                namespace: namespace.to_string(),
                device: device.to_string(),
                dst,
                via,
            },
        )?;
        if !state.routes.remove(&(namespace.to_string(), dst)) {
            return Err(missing("route.delete", dst));
        }
        Ok(())
    }

    async fn add_gateway(
        &self,
        namespace: &str,
        device: &str,
        via: IpAddr,
        table: Option<u32>,
    ) -> Result<()> {
        let mut state = self.record(
            "route.add_gateway",
            Call::GatewayAdd {
                namespace: namespace.to_string(),
                device: device.to_string(),
                via,
                table,
            },
        )?;
        state.gateways.insert((namespace.to_string(), table));
        Ok(())
    }

    async fn delete_gateway(
        &self,
        namespace: &str,
        device: &str,
        _via: Option<IpAddr>,
        table: Option<u32>,
    ) -> Result<()> {
        let mut state = self.record(
            "route.delete_gateway",
            Call::GatewayDelete {
                namespace: namespace.to_string(),
                device: device.to_string(),
                table,
            },
        )?;
        if !state.gateways.remove(&(namespace.to_string(), table)) {
            return Err(missing("route.delete_gateway", format!("default route in {:?}", table)));
        }
        Ok(())
    }
}

#[async_trait]
impl NeighborOps for FakeKernel {
    async fn add(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let mut state = self.record(
            "neighbor.add",
            Call::NeighborAdd {
                namespace: namespace.to_string(),
                device: device.to_string(),
                ip,
                mac: mac.to_string(),
            },
        )?;
        state
            .neighbors
            .insert((namespace.to_string(), device.to_string(), ip));
        Ok(())
    }

    async fn delete(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let mut state = self.record(
            "neighbor.delete",
            Call::NeighborDelete {
                namespace: namespace.to_string(),
                device: device.to_string(),
                ip,
                mac: mac.to_string(),
            },
        )?;
        state
            .neighbors
            .remove(&(namespace.to_string(), device.to_string(), ip));
        Ok(())
    }
}

#[async_trait]
impl ArpAnnouncer for FakeKernel {
    async fn send(&self, namespace: &str, device: &str, ip: IpAddr, _count: u32) -> Result<()> {
        self.record(
            "arp.send",
            Call::Garp {
                namespace: namespace.to_string(),
                device: device.to_string(),
                ip,
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl IptablesOps for FakeKernel {
    async fn empty_chain(&self, namespace: &str, table: &str, chain: &str) -> Result<()> {
        self.record(
            "iptables.empty_chain",
            Call::IptablesEmptyChain {
                namespace: namespace.to_string(),
                table: table.to_string(),
                chain: chain.to_string(),
            },
        )?;
        Ok(())
    }

    async fn add_rule(&self, namespace: &str, table: &str, chain: &str, rule: &str) -> Result<()> {
        self.record(
            "iptables.add_rule",
            Call::IptablesAddRule {
                namespace: namespace.to_string(),
                table: table.to_string(),
                chain: chain.to_string(),
                rule: rule.to_string(),
            },
        )?;
        Ok(())
    }

    async fn apply(&self, namespace: &str) -> Result<()> {
        self.record("iptables.apply", Call::IptablesApply(namespace.to_string()))?;
        Ok(())
    }
}

/// Port source answering from a fixed port list.
#[derive(Debug, Default)]
pub struct StaticPorts {
    ports: Mutex<Vec<Port>>,
    fail: Mutex<bool>,
}

impl StaticPorts {
    pub fn new(ports: Vec<Port>) -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(ports),
            fail: Mutex::new(false),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }
}

#[async_trait]
impl PortSource for StaticPorts {
    async fn get_ports_by_subnet(&self, subnet_id: &str) -> Result<Vec<Port>> {
        if *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(Error::primitive("ports.get_by_subnet", "injected failure"));
        }
        Ok(self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.fixed_ips.iter().any(|f| f.subnet_id == subnet_id))
            .cloned()
            .collect())
    }
}

/// A port on `subnet_cidr` holding `ip`.
pub fn port(id: &str, network_id: &str, subnet_id: &str, subnet_cidr: &str, ip: &str) -> Port {
    let cidr: IpNetwork = subnet_cidr
        .parse()
        .unwrap_or_else(|_| IpNetwork::from(IpAddr::from([0, 0, 0, 0])));
    Port {
        id: id.to_string(),
        network_id: network_id.to_string(),
        mac_address: format!("fa:16:3e:{:02x}:00:01", id.len()),
        device_owner: String::new(),
        fixed_ips: vec![FixedIp {
            subnet_id: subnet_id.to_string(),
            ip_address: ip.parse().unwrap_or(cidr.ip()),
        }],
        subnet: Some(SubnetInfo {
            id: subnet_id.to_string(),
            cidr,
            gateway_ip: None,
        }),
    }
}

/// Agent gateway port on the `ext-net` external network.
pub fn agent_gateway_port() -> Port {
    let mut gw = port("gw-port-1", "ext-net", "ext-subnet", "203.0.113.0/24", "203.0.113.2");
    gw.device_owner = "network:floatingip_agent_gateway".to_string();
    if let Some(subnet) = gw.subnet.as_mut() {
        subnet.gateway_ip = "203.0.113.1".parse().ok();
    }
    gw
}
