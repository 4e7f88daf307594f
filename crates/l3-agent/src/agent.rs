//! The agent facade: entry points called by the router lifecycle orchestrator.
//!
//! Every router-scoped call takes the router's lock for its whole duration,
//! so calls for one router are serialized while different routers proceed in
//! parallel. Calls naming a router the agent does not manage are logged and
//! return successfully.

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use common::{Error, Result};
use dvr::primitives::PlugRequest;
use dvr::router::RouterHandle;
use dvr::types::{HA_DEV_PREFIX, device_name};
use dvr::{
    ArpEntry, ArpOperation, ArpSynchronizer, FipNamespaceManager, FloatingIp,
    FloatingIpController, LocalSubnetPool, NatAction, Port, PortSource, Primitives, Router,
    RouterRegistry, RouterState, SnatManager,
};
use ha::{HaController, HaRouterStatus, HaState, MetadataProxy, StateChangeMonitor};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// External collaborators of the agent.
pub struct Collaborators {
    pub prims: Primitives,
    pub ports: Arc<dyn PortSource>,
    pub proxy: Arc<dyn MetadataProxy>,
    pub monitor: Option<Arc<dyn StateChangeMonitor>>,
}

/// DVR and HA control for the routers hosted on this node.
pub struct L3Agent {
    routers: RouterRegistry,
    floating_ips: FloatingIpController,
    snat: SnatManager,
    arp: ArpSynchronizer,
    ha: Arc<HaController>,
    monitor: Option<Arc<dyn StateChangeMonitor>>,
    prims: Primitives,
    device_name_len: usize,
    full_sync: Arc<AtomicBool>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl L3Agent {
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let Collaborators {
            prims,
            ports,
            proxy,
            monitor,
        } = collaborators;

        let link_local = config.link_local_network().map_err(Error::config)?;
        let local_subnets = Arc::new(LocalSubnetPool::new(
            link_local,
            Some(config.link_local_state_file()),
        )?);
        let fip_namespaces = Arc::new(FipNamespaceManager::new(config.fip_settings()));
        let device_name_len = config.dvr.device_name_len;
        let full_sync = Arc::new(AtomicBool::new(false));

        let ha = Arc::new(HaController::new(
            proxy,
            config.ha.metadata_port,
            metrics.as_ref().map(|m| m.ha()),
        ));

        Ok(Self {
            routers: RouterRegistry::new(),
            floating_ips: FloatingIpController::new(
                fip_namespaces,
                local_subnets,
                prims.clone(),
                config.agent.send_arp_count,
            ),
            snat: SnatManager::new(
                prims.clone(),
                device_name_len,
                config.agent.router_delete_namespaces,
            ),
            arp: ArpSynchronizer::new(
                prims.neighbors.clone(),
                ports,
                full_sync.clone(),
                device_name_len,
            ),
            ha,
            monitor,
            prims,
            device_name_len,
            full_sync,
            metrics,
        })
    }

    // Router lifecycle

    /// Start managing `router`. An already managed router keeps its state.
    pub fn add_router(&self, router: Router) -> RouterHandle {
        let handle = self.routers.add(router);
        self.update_router_gauge();
        handle
    }

    /// Tear down everything the agent set up for `router_id` and forget it.
    ///
    /// On failure the router stays managed so the removal can be retried.
    pub async fn remove_router(&self, router_id: &str) -> Result<()> {
        let Some(handle) = self.routers.get(router_id) else {
            debug!(router_id, "Router not managed, nothing to remove");
            return Ok(());
        };
        {
            let mut state = handle.lock().await;
            let floating: Vec<IpAddr> = state.floating_ips.keys().copied().collect();
            for ip in floating {
                self.remove_fip_locked(&mut state, IpNetwork::from(ip)).await?;
            }
            self.floating_ips.finish_teardown(&mut state).await?;
            if state.ha_port.is_some() {
                self.ha_teardown(&mut state).await?;
            }
            if state.snat_iptables.is_some() {
                self.snat.destroy_snat_namespace(&mut state).await?;
            }
        }
        self.routers.remove(router_id);
        self.update_router_gauge();
        info!(router_id, "Router removed");
        Ok(())
    }

    pub fn router(&self, router_id: &str) -> Option<RouterHandle> {
        self.routers.get(router_id)
    }

    pub fn router_ids(&self) -> Vec<String> {
        self.routers.ids()
    }

    fn managed(&self, router_id: &str, operation: &str) -> Option<RouterHandle> {
        let handle = self.routers.get(router_id);
        if handle.is_none() {
            warn!(router_id, operation, "Router is not managed by this agent");
        }
        handle
    }

    fn update_router_gauge(&self) {
        if let Some(ref m) = self.metrics {
            m.set_router_count(self.routers.len());
        }
    }

    // Floating IPs

    /// Associate `fip` with the router on the distributed path.
    pub async fn add_floating_ip(
        &self,
        router_id: &str,
        fip: &FloatingIp,
        fip_cidr: IpNetwork,
    ) -> Result<()> {
        let Some(handle) = self.managed(router_id, "add_floating_ip") else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        let before = state.dist_fip_count();
        let result = self.floating_ips.add(&mut state, fip, fip_cidr).await;
        self.record_fip_delta(before, state.dist_fip_count());
        result
    }

    /// Dissociate the floating IP of `fip_cidr` from the router.
    pub async fn remove_floating_ip(&self, router_id: &str, fip_cidr: IpNetwork) -> Result<()> {
        let Some(handle) = self.managed(router_id, "remove_floating_ip") else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        self.remove_fip_locked(&mut state, fip_cidr).await
    }

    async fn remove_fip_locked(&self, state: &mut RouterState, fip_cidr: IpNetwork) -> Result<()> {
        let before = state.dist_fip_count();
        let result = self.floating_ips.remove(state, fip_cidr).await;
        self.record_fip_delta(before, state.dist_fip_count());
        result
    }

    fn record_fip_delta(&self, before: usize, after: usize) {
        if let Some(ref m) = self.metrics {
            m.adjust_floating_ips(after as i64 - before as i64);
        }
    }

    /// Reset the floating IP NAT chains of the router namespace.
    pub async fn handle_fip_nat_rules(
        &self,
        router_id: &str,
        interface_name: Option<&str>,
        action: NatAction,
    ) -> Result<()> {
        let Some(handle) = self.managed(router_id, "handle_fip_nat_rules") else {
            return Ok(());
        };
        let state = handle.lock().await;
        state
            .handle_fip_nat_rules(self.prims.iptables.as_ref(), interface_name, action)
            .await
    }

    // Centralized SNAT

    pub async fn create_snat_gateway(
        &self,
        router_id: &str,
        ex_gw_port: &Port,
        gw_interface_name: &str,
        snat_ports: &[Port],
    ) -> Result<()> {
        let Some(handle) = self.managed(router_id, "create_snat_gateway") else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        self.snat
            .create_gateway(&mut state, ex_gw_port, gw_interface_name, snat_ports)
            .await
    }

    pub async fn destroy_snat_namespace(&self, router_id: &str) -> Result<()> {
        let Some(handle) = self.managed(router_id, "destroy_snat_namespace") else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        self.snat.destroy_snat_namespace(&mut state).await
    }

    /// Failures are logged and swallowed.
    pub async fn redirect_add(
        &self,
        router_id: &str,
        gateway: IpAddr,
        sn_port: &Port,
        sn_int: &str,
    ) {
        let Some(handle) = self.managed(router_id, "redirect_add") else {
            return;
        };
        let state = handle.lock().await;
        self.snat.redirect_add(&state, gateway, sn_port, sn_int).await;
    }

    /// Failures are logged and swallowed.
    pub async fn redirect_remove(&self, router_id: &str, sn_port: &Port, sn_int: &str) {
        let Some(handle) = self.managed(router_id, "redirect_remove") else {
            return;
        };
        let state = handle.lock().await;
        self.snat.redirect_remove(&state, sn_port, sn_int).await;
    }

    pub fn snat_int_device_name(&self, port_id: &str) -> String {
        self.snat.snat_int_device_name(port_id)
    }

    // ARP

    /// Install neighbor entries for every port on the subnet of `port`.
    pub async fn sync_subnet_arp(&self, router_id: &str, port: &Port) {
        let Some(handle) = self.managed(router_id, "sync_subnet_arp") else {
            return;
        };
        let state = handle.lock().await;
        self.arp.sync_subnet_arp(&state, port).await;
    }

    pub async fn update_arp_entry(
        &self,
        router_id: &str,
        ip: IpAddr,
        mac: &str,
        subnet_id: &str,
        operation: ArpOperation,
    ) {
        let Some(handle) = self.managed(router_id, "update_arp_entry") else {
            return;
        };
        let state = handle.lock().await;
        self.arp.update(&state, ip, mac, subnet_id, operation).await;
    }

    pub async fn add_arp_entry(&self, router_id: &str, entry: &ArpEntry) {
        self.update_arp_entry(
            router_id,
            entry.ip_address,
            &entry.mac_address,
            &entry.subnet_id,
            ArpOperation::Add,
        )
        .await;
    }

    pub async fn del_arp_entry(&self, router_id: &str, entry: &ArpEntry) {
        self.update_arp_entry(
            router_id,
            entry.ip_address,
            &entry.mac_address,
            &entry.subnet_id,
            ArpOperation::Delete,
        )
        .await;
    }

    /// Read and clear the full-resync request.
    pub fn take_full_sync(&self) -> bool {
        let needed = self.full_sync.swap(false, Ordering::SeqCst);
        if let Some(ref m) = self.metrics {
            m.set_full_sync_needed(false);
            if needed {
                m.record_resync();
            }
        }
        needed
    }

    pub fn full_sync_needed(&self) -> bool {
        let needed = self.full_sync.load(Ordering::SeqCst);
        if let Some(ref m) = self.metrics {
            m.set_full_sync_needed(needed);
        }
        needed
    }

    // HA

    /// Plug the HA device and start tracking the router's VRRP state.
    ///
    /// A router without an HA port is logged and left alone.
    pub async fn process_ha_router_added(&self, router_id: &str) -> Result<()> {
        let Some(handle) = self.managed(router_id, "process_ha_router_added") else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        let Some(ha_port) = state.router.ha_interface.clone() else {
            error!(router_id, "Unable to process HA router without HA port");
            return Ok(());
        };

        let interface_name = device_name(HA_DEV_PREFIX, &ha_port.id, self.device_name_len);
        let ns = state.ns_name.clone();
        self.prims
            .devices
            .plug(&PlugRequest::for_port(&ha_port, &interface_name, &ns, HA_DEV_PREFIX))
            .await?;
        if let Some(cidr) = ha_port.ip_cidr() {
            self.prims
                .devices
                .add_address(&interface_name, &ns, cidr)
                .await?;
        }
        state.ha_port = Some(ha_port);

        self.ha.register(router_id, &ns);
        if let Some(ref monitor) = self.monitor {
            monitor.spawn(router_id, &ns).await?;
        }
        info!(router_id, device = %interface_name, "HA router added");
        Ok(())
    }

    /// Stop tracking the router's VRRP state and unplug its HA device.
    pub async fn process_ha_router_removed(&self, router_id: &str) -> Result<()> {
        let Some(handle) = self.managed(router_id, "process_ha_router_removed") else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        self.ha_teardown(&mut state).await
    }

    async fn ha_teardown(&self, state: &mut RouterState) -> Result<()> {
        let router_id = state.router_id().to_string();
        if let Some(ref monitor) = self.monitor {
            monitor.destroy(&router_id, &state.ns_name).await?;
        }
        self.ha.unregister(&router_id).await;

        if let Some(ha_port) = state.ha_port.take() {
            let interface_name = device_name(HA_DEV_PREFIX, &ha_port.id, self.device_name_len);
            self.prims
                .devices
                .unplug(&interface_name, &state.ns_name, HA_DEV_PREFIX)
                .await?;
        }
        info!(router_id = %router_id, "HA router removed");
        Ok(())
    }

    /// Queue a VRRP transition; returns whether the router is managed.
    pub async fn enqueue_ha_state_change(&self, router_id: &str, state: HaState) -> bool {
        self.ha.enqueue(router_id, state).await
    }

    pub async fn ha_status(&self, router_id: &str) -> Option<HaRouterStatus> {
        self.ha.status(router_id).await
    }

    pub fn ha_controller(&self) -> &Arc<HaController> {
        &self.ha
    }

    pub fn fip_namespaces(&self) -> &Arc<FipNamespaceManager> {
        self.floating_ips.fip_namespaces()
    }

    /// Stop every HA worker, destroying running proxies.
    pub async fn shutdown(&self) {
        self.ha.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dvr::fakes::{FakeKernel, StaticPorts, agent_gateway_port, port};

    struct NoProxy;

    #[async_trait]
    impl MetadataProxy for NoProxy {
        async fn spawn(&self, _namespace: &str, _port: u16, _router_id: &str) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self, _router_id: &str, _namespace: &str) -> Result<()> {
            Ok(())
        }
    }

    fn agent(name: &str, kernel: &Arc<FakeKernel>) -> L3Agent {
        let mut config = Config::default();
        let state_path =
            std::env::temp_dir().join(format!("l3-agent-unit-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&state_path);
        config.agent.state_path = state_path;
        config.agent.send_arp_count = 0;

        let collaborators = Collaborators {
            prims: kernel.primitives(),
            ports: StaticPorts::new(Vec::new()),
            proxy: Arc::new(NoProxy),
            monitor: None,
        };
        L3Agent::new(&config, collaborators, Some(Arc::new(MetricsRegistry::new()))).unwrap()
    }

    fn router(id: &str) -> Router {
        Router {
            id: id.to_string(),
            distributed: true,
            fip_agent_gw_port: Some(agent_gateway_port()),
            ..Default::default()
        }
    }

    fn fip(floating: &str, fixed: &str) -> FloatingIp {
        FloatingIp {
            floating_ip_address: floating.parse().unwrap(),
            fixed_ip_address: fixed.parse().unwrap(),
            floating_network_id: "ext-net".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unmanaged_router_calls_are_noops() {
        let kernel = FakeKernel::new();
        let agent = agent("unmanaged", &kernel);

        let f = fip("203.0.113.10", "10.0.0.5");
        agent
            .add_floating_ip("ghost", &f, "203.0.113.10/32".parse().unwrap())
            .await
            .unwrap();
        agent
            .remove_floating_ip("ghost", "203.0.113.10/32".parse().unwrap())
            .await
            .unwrap();
        agent.process_ha_router_added("ghost").await.unwrap();
        agent.remove_router("ghost").await.unwrap();
        assert!(!agent.enqueue_ha_state_change("ghost", HaState::Master).await);
        assert!(kernel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_router_releases_floating_ips() {
        let kernel = FakeKernel::new();
        let agent = agent("remove-router", &kernel);
        agent.add_router(router("r1"));

        agent
            .add_floating_ip(
                "r1",
                &fip("203.0.113.10", "10.0.0.5"),
                "203.0.113.10/32".parse().unwrap(),
            )
            .await
            .unwrap();
        agent
            .add_floating_ip(
                "r1",
                &fip("203.0.113.11", "10.0.0.6"),
                "203.0.113.11/32".parse().unwrap(),
            )
            .await
            .unwrap();
        assert!(kernel.namespace_exists("fip-ext-net"));

        agent.remove_router("r1").await.unwrap();
        assert!(agent.router("r1").is_none());
        assert!(!kernel.namespace_exists("fip-ext-net"));
        assert!(kernel.rules_in("qrouter-r1").is_empty());
    }

    #[tokio::test]
    async fn test_ha_router_without_port_is_skipped() {
        let kernel = FakeKernel::new();
        let agent = agent("ha-no-port", &kernel);
        agent.add_router(router("r1"));

        agent.process_ha_router_added("r1").await.unwrap();
        assert!(!agent.ha_controller().is_managed("r1"));
        assert!(kernel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_take_full_sync_clears_flag() {
        let kernel = FakeKernel::new();
        let agent = agent("full-sync", &kernel);
        assert!(!agent.take_full_sync());

        agent.full_sync.store(true, Ordering::SeqCst);
        assert!(agent.full_sync_needed());
        assert!(agent.take_full_sync());
        assert!(!agent.full_sync_needed());
    }

    #[tokio::test]
    async fn test_arp_entry_helpers_target_internal_device() {
        let kernel = FakeKernel::new();
        let agent = agent("arp", &kernel);
        let mut r = router("r1");
        r.interfaces.push(port("int-port-1", "net-1", "subnet-1", "10.0.0.0/24", "10.0.0.1"));
        agent.add_router(r);

        let entry = ArpEntry {
            ip_address: "10.0.0.7".parse().unwrap(),
            mac_address: "fa:16:3e:00:00:07".to_string(),
            subnet_id: "subnet-1".to_string(),
        };
        agent.add_arp_entry("r1", &entry).await;
        assert_eq!(kernel.neighbors_in("qrouter-r1").len(), 1);

        agent.del_arp_entry("r1", &entry).await;
        assert!(kernel.neighbors_in("qrouter-r1").is_empty());
        assert!(!agent.full_sync_needed());
    }
}
