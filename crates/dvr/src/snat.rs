//! Centralized SNAT namespace and per-subnet redirection.
//!
//! Redirection is best effort: a router with partially installed SNAT
//! redirection keeps working for everything else, so failures are logged
//! and never returned.

use crate::allocator::snat_table_index;
use crate::primitives::{PlugRequest, Primitives, RuleSelector};
use crate::router::{IptablesHandle, RouterState};
use crate::types::{EXTERNAL_DEV_PREFIX, Port, SNAT_INT_DEV_PREFIX, device_name, snat_ns_name};
use common::{Error, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::{debug, error, info};

/// Manages SNAT namespaces and redirection rules of distributed routers.
#[derive(Clone)]
pub struct SnatManager {
    prims: Primitives,
    device_name_len: usize,
    delete_namespaces: bool,
}

impl SnatManager {
    pub fn new(prims: Primitives, device_name_len: usize, delete_namespaces: bool) -> Self {
        Self {
            prims,
            device_name_len,
            delete_namespaces,
        }
    }

    pub fn snat_int_device_name(&self, port_id: &str) -> String {
        device_name(SNAT_INT_DEV_PREFIX, port_id, self.device_name_len)
    }

    /// Create the SNAT namespace of the router, plug one `sg-` device per
    /// SNAT port plus the external gateway, and attach the iptables handle.
    pub async fn create_gateway(
        &self,
        state: &mut RouterState,
        ex_gw_port: &Port,
        gw_interface_name: &str,
        snat_ports: &[Port],
    ) -> Result<()> {
        let ns = snat_ns_name(state.router_id());
        self.prims.namespaces.create(&ns).await?;

        for port in snat_ports {
            let interface_name = self.snat_int_device_name(&port.id);
            self.plug(port, &interface_name, &ns, SNAT_INT_DEV_PREFIX)
                .await?;
        }

        self.plug(ex_gw_port, gw_interface_name, &ns, EXTERNAL_DEV_PREFIX)
            .await?;
        if let Some(gateway) = ex_gw_port.subnet.as_ref().and_then(|s| s.gateway_ip) {
            self.prims
                .routes
                .add_gateway(&ns, gw_interface_name, gateway, None)
                .await?;
        }

        state.snat_iptables = Some(IptablesHandle {
            namespace: ns.clone(),
        });
        info!(
            router_id = %state.router_id(),
            namespace = %ns,
            ports = snat_ports.len(),
            "SNAT gateway created"
        );
        Ok(())
    }

    async fn plug(&self, port: &Port, name: &str, namespace: &str, prefix: &str) -> Result<()> {
        self.prims
            .devices
            .plug(&PlugRequest::for_port(port, name, namespace, prefix))
            .await?;
        if let Some(cidr) = port.ip_cidr() {
            self.prims.devices.add_address(name, namespace, cidr).await?;
        }
        Ok(())
    }

    /// Unplug the `sg-` devices of the router's SNAT namespace and delete it
    /// when namespace deletion is enabled.
    pub async fn destroy_snat_namespace(&self, state: &mut RouterState) -> Result<()> {
        let ns = snat_ns_name(state.router_id());
        for device in self.prims.namespaces.list_devices(&ns).await? {
            if device.starts_with(SNAT_INT_DEV_PREFIX) {
                debug!(namespace = %ns, device = %device, "Unplugging SNAT device");
                self.prims
                    .devices
                    .unplug(&device, &ns, SNAT_INT_DEV_PREFIX)
                    .await?;
            }
        }

        state.snat_iptables = None;
        if self.delete_namespaces {
            self.prims.namespaces.delete(&ns).await?;
        }
        info!(router_id = %state.router_id(), namespace = %ns, "SNAT namespace destroyed");
        Ok(())
    }

    /// Send traffic of `sn_port`'s subnet leaving through `sn_int` to
    /// `gateway` via the subnet's own table.
    pub async fn redirect_add(
        &self,
        state: &RouterState,
        gateway: IpAddr,
        sn_port: &Port,
        sn_int: &str,
    ) {
        if let Err(e) = self.try_redirect_add(state, gateway, sn_port, sn_int).await {
            error!(
                router_id = %state.router_id(),
                device = sn_int,
                error = %e,
                "Error adding SNAT redirection"
            );
        }
    }

    async fn try_redirect_add(
        &self,
        state: &RouterState,
        gateway: IpAddr,
        sn_port: &Port,
        sn_int: &str,
    ) -> Result<()> {
        let cidr = subnet_cidr(sn_port)?;
        let index = snat_table_index(&cidr);
        let ns = &state.ns_name;

        self.prims
            .routes
            .add_gateway(ns, sn_int, gateway, Some(index))
            .await?;
        self.prims
            .rules
            .add(ns, RuleSelector::Cidr(cidr), index, index)
            .await?;
        self.prims
            .namespaces
            .set_sysctl(ns, &send_redirects_key(sn_int), "0")
            .await?;

        debug!(router_id = %state.router_id(), %cidr, table = index, "SNAT redirection added");
        Ok(())
    }

    /// Undo [`SnatManager::redirect_add`] for `sn_port`.
    pub async fn redirect_remove(&self, state: &RouterState, sn_port: &Port, sn_int: &str) {
        if let Err(e) = self.try_redirect_remove(state, sn_port, sn_int).await {
            error!(
                router_id = %state.router_id(),
                device = sn_int,
                error = %e,
                "Error removing SNAT redirection"
            );
        }
    }

    async fn try_redirect_remove(
        &self,
        state: &RouterState,
        sn_port: &Port,
        sn_int: &str,
    ) -> Result<()> {
        let cidr = subnet_cidr(sn_port)?;
        let index = snat_table_index(&cidr);
        let ns = &state.ns_name;

        self.prims
            .routes
            .delete_gateway(ns, sn_int, None, Some(index))
            .await?;
        self.prims
            .rules
            .delete(ns, RuleSelector::Cidr(cidr), index, index)
            .await?;
        self.prims
            .namespaces
            .set_sysctl(ns, &send_redirects_key(sn_int), "1")
            .await?;

        debug!(router_id = %state.router_id(), %cidr, table = index, "SNAT redirection removed");
        Ok(())
    }
}

/// SNAT port on the same subnet as `int_port`.
pub fn map_internal_interface<'a>(int_port: &Port, snat_ports: &'a [Port]) -> Option<&'a Port> {
    let subnet_id = int_port.subnet_id()?;
    let found = snat_ports
        .iter()
        .find(|port| port.subnet_id() == Some(subnet_id));
    if found.is_none() {
        error!(port_id = %int_port.id, subnet_id, "No SNAT port matches internal port");
    }
    found
}

/// Canonical network of the port's subnet.
fn subnet_cidr(port: &Port) -> Result<IpNetwork> {
    let cidr = port
        .ip_cidr()
        .ok_or_else(|| Error::not_found(format!("subnet of port {}", port.id)))?;
    IpNetwork::new(cidr.network(), cidr.prefix())
        .map_err(|e| Error::primitive("snat.redirect", e.to_string()))
}

fn send_redirects_key(device: &str) -> String {
    format!("net.ipv4.conf.{}.send_redirects", device)
}
