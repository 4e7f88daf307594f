//! Static neighbor entries for distributed routers.

use crate::primitives::{NeighborOps, PortSource};
use crate::router::RouterState;
use crate::types::{ArpOperation, INTERNAL_DEV_PREFIX, Port, device_name};
use common::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Installs neighbor entries of subnet siblings into router namespaces.
///
/// Failures are not retried: they raise the shared full-resync flag and are
/// repaired by the next resync pass.
#[derive(Clone)]
pub struct ArpSynchronizer {
    neighbors: Arc<dyn NeighborOps>,
    ports: Arc<dyn PortSource>,
    full_sync: Arc<AtomicBool>,
    device_name_len: usize,
}

impl ArpSynchronizer {
    pub fn new(
        neighbors: Arc<dyn NeighborOps>,
        ports: Arc<dyn PortSource>,
        full_sync: Arc<AtomicBool>,
        device_name_len: usize,
    ) -> Self {
        Self {
            neighbors,
            ports,
            full_sync,
            device_name_len,
        }
    }

    pub fn full_sync_flag(&self) -> &Arc<AtomicBool> {
        &self.full_sync
    }

    /// Add an entry for every non-router port on the subnet of `port`.
    pub async fn sync_subnet_arp(&self, state: &RouterState, port: &Port) {
        let Some(subnet_id) = port.subnet.as_ref().map(|s| s.id.clone()) else {
            return;
        };
        if !state.is_distributed() {
            return;
        }

        let subnet_ports = match self.ports.get_ports_by_subnet(&subnet_id).await {
            Ok(ports) => ports,
            Err(e) => {
                error!(
                    router_id = %state.router_id(),
                    subnet_id = %subnet_id,
                    error = %e,
                    "Failed to fetch subnet ports"
                );
                self.full_sync.store(true, Ordering::SeqCst);
                return;
            }
        };

        for sibling in subnet_ports.iter().filter(|p| !p.is_router_owned()) {
            for fixed_ip in &sibling.fixed_ips {
                self.update(
                    state,
                    fixed_ip.ip_address,
                    &sibling.mac_address,
                    &subnet_id,
                    ArpOperation::Add,
                )
                .await;
            }
        }
    }

    /// Apply one neighbor change on the router's device for `subnet_id`.
    ///
    /// Does nothing when the router has no port on the subnet.
    pub async fn update(
        &self,
        state: &RouterState,
        ip: IpAddr,
        mac: &str,
        subnet_id: &str,
        operation: ArpOperation,
    ) {
        let Some(port) = state.internal_port(subnet_id) else {
            debug!(router_id = %state.router_id(), subnet_id, "Subnet not attached to router");
            return;
        };
        let interface_name = device_name(INTERNAL_DEV_PREFIX, &port.id, self.device_name_len);

        if let Err(e) = self
            .apply(&state.ns_name, &interface_name, ip, mac, operation)
            .await
        {
            error!(
                router_id = %state.router_id(),
                %ip,
                mac,
                %operation,
                error = %e,
                "Failed updating arp entry"
            );
            self.full_sync.store(true, Ordering::SeqCst);
        }
    }

    async fn apply(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
        mac: &str,
        operation: ArpOperation,
    ) -> Result<()> {
        match operation {
            ArpOperation::Add => self.neighbors.add(namespace, device, ip, mac).await,
            ArpOperation::Delete => self.neighbors.delete(namespace, device, ip, mac).await,
        }
    }
}
