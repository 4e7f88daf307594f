//! Distributed floating IP controller.
//!
//! A router's first floating IP subscribes it to the FIP namespace of the
//! external network and links the two namespaces over a leased /31. Each
//! floating IP then adds a source rule in the router namespace and a host
//! route in the FIP namespace. Removing the last floating IP undoes the link
//! and the subscription.

use crate::allocator::{LinkLocalLease, LocalSubnetPool};
use crate::fip_ns::{FipNamespaceHandle, FipNamespaceManager};
use crate::primitives::{Primitives, RuleSelector};
use crate::router::{FipBinding, RouterState};
use crate::types::{FloatingIp, Port};
use common::{Error, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Device and namespace names of one router's FIP link.
struct LinkNames {
    fip_ns: String,
    fip_2_rtr: String,
    rtr_2_fip: String,
    ext_device: Option<String>,
    table: u32,
}

impl LinkNames {
    async fn resolve(handle: &FipNamespaceHandle, router_id: &str) -> Self {
        let fip_ns = handle.lock().await;
        Self {
            fip_ns: fip_ns.name().to_string(),
            fip_2_rtr: fip_ns.int_device_name(router_id),
            rtr_2_fip: fip_ns.rtr_ext_device_name(router_id),
            ext_device: fip_ns
                .agent_gateway_port()
                .map(|port| fip_ns.ext_device_name(&port.id)),
            table: fip_ns.rule_table(),
        }
    }
}

/// Adds and removes floating IPs on the distributed path.
///
/// Callers hold the router's lock for the duration of each call; the FIP
/// namespace lock is only taken underneath it.
pub struct FloatingIpController {
    fip_namespaces: Arc<FipNamespaceManager>,
    local_subnets: Arc<LocalSubnetPool>,
    prims: Primitives,
    send_arp_count: u32,
}

impl FloatingIpController {
    pub fn new(
        fip_namespaces: Arc<FipNamespaceManager>,
        local_subnets: Arc<LocalSubnetPool>,
        prims: Primitives,
        send_arp_count: u32,
    ) -> Self {
        Self {
            fip_namespaces,
            local_subnets,
            prims,
            send_arp_count,
        }
    }

    pub fn fip_namespaces(&self) -> &Arc<FipNamespaceManager> {
        &self.fip_namespaces
    }

    pub fn local_subnets(&self) -> &Arc<LocalSubnetPool> {
        &self.local_subnets
    }

    /// Associate `fip` with the router.
    ///
    /// Priority and link subnet are allocated before anything is applied,
    /// so an exhausted pool leaves the host untouched. The rule, the route
    /// and the GARP are applied in that order; a failure undoes the steps
    /// already taken and the binding is only recorded once all succeeded.
    pub async fn add(
        &self,
        state: &mut RouterState,
        fip: &FloatingIp,
        fip_cidr: IpNetwork,
    ) -> Result<()> {
        let router_id = state.router_id().to_string();
        let floating_ip = fip.floating_ip_address;

        if state.floating_ips.contains_key(&floating_ip) {
            debug!(router_id = %router_id, fip = %floating_ip, "Floating IP already associated");
            return Ok(());
        }
        let gw_port = state
            .router
            .fip_agent_gw_port
            .clone()
            .ok_or_else(|| {
                Error::not_found(format!("agent gateway port of router {}", router_id))
            })?;

        self.finish_teardown(state).await?;

        let ext_net_id = state
            .fip_ext_net_id
            .clone()
            .unwrap_or_else(|| fip.floating_network_id.clone());
        let handle = match &state.fip_ns {
            Some(handle) => handle.clone(),
            None => self.fip_namespaces.get_or_create(&ext_net_id),
        };

        let priority = handle.lock().await.allocate_rule_priority()?;

        if state.fip_ns.is_none() {
            if let Err(e) = self.attach(state, &handle, &ext_net_id, &gw_port).await {
                handle.lock().await.deallocate_rule_priority(priority);
                return Err(e);
            }
        }
        let names = LinkNames::resolve(&handle, &router_id).await;
        let lease = match self.current_lease(state) {
            Ok(lease) => lease,
            Err(e) => {
                self.abandon_add(state, &handle, priority).await;
                return Err(e);
            }
        };
        let (rtr_2_fip, _) = lease.pair();
        let via = IpAddr::V4(rtr_2_fip.ip());
        let selector = RuleSelector::Ip(fip.fixed_ip_address);

        let added = self
            .prims
            .rules
            .add(&state.ns_name, selector, names.table, priority)
            .await;
        if let Err(e) = added {
            self.abandon_add(state, &handle, priority).await;
            return Err(e);
        }

        let routed = self
            .prims
            .routes
            .add_route(&names.fip_ns, &names.fip_2_rtr, fip_cidr, via)
            .await;
        if let Err(e) = routed {
            self.undo_rule(state, selector, names.table, priority).await;
            self.abandon_add(state, &handle, priority).await;
            return Err(e);
        }

        if self.send_arp_count > 0 {
            if let Some(ext_device) = &names.ext_device {
                let sent = self
                    .prims
                    .arp
                    .send(&names.fip_ns, ext_device, floating_ip, self.send_arp_count)
                    .await;
                if let Err(e) = sent {
                    let unrouted = self
                        .prims
                        .routes
                        .delete_route(&names.fip_ns, &names.fip_2_rtr, fip_cidr, via)
                        .await;
                    if let Err(cleanup) = unrouted {
                        warn!(
                            router_id = %router_id,
                            fip = %floating_ip,
                            error = %cleanup,
                            "Failed to undo floating IP route"
                        );
                    }
                    self.undo_rule(state, selector, names.table, priority).await;
                    self.abandon_add(state, &handle, priority).await;
                    return Err(e);
                }
            }
        }

        state.floating_ips.insert(
            floating_ip,
            FipBinding {
                priority,
                fixed_ip: fip.fixed_ip_address,
            },
        );
        info!(
            router_id = %router_id,
            fip = %floating_ip,
            fixed_ip = %fip.fixed_ip_address,
            priority,
            count = state.dist_fip_count(),
            "Floating IP added"
        );
        Ok(())
    }

    async fn undo_rule(
        &self,
        state: &RouterState,
        selector: RuleSelector,
        table: u32,
        priority: u32,
    ) {
        let deleted = self
            .prims
            .rules
            .delete(&state.ns_name, selector, table, priority)
            .await;
        if let Err(e) = deleted {
            warn!(
                router_id = %state.router_id(),
                priority,
                error = %e,
                "Failed to undo floating IP rule"
            );
        }
    }

    /// Return the priority of a failed add and drop the link if nothing
    /// else uses it.
    async fn abandon_add(
        &self,
        state: &mut RouterState,
        handle: &FipNamespaceHandle,
        priority: u32,
    ) {
        handle.lock().await.deallocate_rule_priority(priority);
        if state.floating_ips.is_empty() {
            if let Err(e) = self.detach(state).await {
                warn!(router_id = %state.router_id(), error = %e, "Failed to undo FIP link");
            }
        }
    }

    /// Dissociate the floating IP of `fip_cidr` from the router.
    ///
    /// Unknown floating IPs are ignored.
    pub async fn remove(&self, state: &mut RouterState, fip_cidr: IpNetwork) -> Result<()> {
        let router_id = state.router_id().to_string();
        let floating_ip = fip_cidr.ip();

        let Some(binding) = state.floating_ips.get(&floating_ip).copied() else {
            warn!(
                router_id = %router_id,
                fip = %floating_ip,
                "Floating IP not associated, nothing to remove"
            );
            return Ok(());
        };
        let Some(handle) = state.fip_ns.clone() else {
            error!(
                router_id = %router_id,
                fip = %floating_ip,
                "Floating IP bound without FIP namespace"
            );
            state.floating_ips.remove(&floating_ip);
            return Ok(());
        };
        let names = LinkNames::resolve(&handle, &router_id).await;

        let lease = match state.rtr_fip_subnet {
            Some(lease) => lease,
            None => {
                error!(
                    router_id = %router_id,
                    "Router has floating IPs but no link subnet, re-leasing"
                );
                let lease = self.local_subnets.lease(&router_id)?;
                state.rtr_fip_subnet = Some(lease);
                lease
            }
        };

        self.prims
            .rules
            .delete(
                &state.ns_name,
                RuleSelector::Ip(binding.fixed_ip),
                names.table,
                binding.priority,
            )
            .await?;
        state.floating_ips.remove(&floating_ip);
        handle.lock().await.deallocate_rule_priority(binding.priority);

        let (rtr_2_fip, _) = lease.pair();
        self.prims
            .routes
            .delete_route(
                &names.fip_ns,
                &names.fip_2_rtr,
                fip_cidr,
                IpAddr::V4(rtr_2_fip.ip()),
            )
            .await?;

        info!(
            router_id = %router_id,
            fip = %floating_ip,
            count = state.dist_fip_count(),
            "Floating IP removed"
        );

        if state.floating_ips.is_empty() {
            self.detach(state).await?;
        }
        Ok(())
    }

    /// Drop a FIP link that has no floating IPs left on it, as left behind
    /// by a removal that failed partway.
    pub async fn finish_teardown(&self, state: &mut RouterState) -> Result<()> {
        if !state.floating_ips.is_empty() || state.fip_ns.is_none() {
            return Ok(());
        }
        warn!(router_id = %state.router_id(), "Finishing interrupted FIP link teardown");
        self.detach(state).await
    }

    /// Subscribe to the FIP namespace and link the router to it.
    async fn attach(
        &self,
        state: &mut RouterState,
        handle: &FipNamespaceHandle,
        ext_net_id: &str,
        gw_port: &Port,
    ) -> Result<()> {
        let router_id = state.router_id().to_string();
        let lease = self.local_subnets.lease(&router_id)?;

        if let Err(e) = self
            .fip_namespaces
            .subscribe(&self.prims, ext_net_id, &router_id, gw_port)
            .await
        {
            self.local_subnets.release(&router_id);
            return Err(e);
        }

        let linked = handle
            .lock()
            .await
            .create_rtr_2_fip_link(&self.prims, &router_id, &state.ns_name, &lease)
            .await;
        if let Err(e) = linked {
            self.local_subnets.release(&router_id);
            if let Err(cleanup) = self
                .fip_namespaces
                .unsubscribe(&self.prims, ext_net_id, &router_id)
                .await
            {
                warn!(
                    router_id = %router_id,
                    error = %cleanup,
                    "Failed to unsubscribe after link failure"
                );
            }
            return Err(e);
        }

        state.rtr_fip_subnet = Some(lease);
        state.fip_ns = Some(handle.clone());
        state.fip_ext_net_id = Some(ext_net_id.to_string());
        Ok(())
    }

    /// Remove the router's FIP link and leave the FIP namespace, destroying
    /// it when the router was its last subscriber.
    ///
    /// Each step clears its part of the router state once done, so a call
    /// that failed halfway can be repeated.
    async fn detach(&self, state: &mut RouterState) -> Result<()> {
        let router_id = state.router_id().to_string();
        let (Some(handle), Some(ext_net_id)) = (state.fip_ns.clone(), state.fip_ext_net_id.clone())
        else {
            return Ok(());
        };
        let names = LinkNames::resolve(&handle, &router_id).await;

        if let Some(lease) = state.rtr_fip_subnet {
            let (_, fip_2_rtr) = lease.pair();
            self.prims
                .routes
                .delete_gateway(
                    &state.ns_name,
                    &names.rtr_2_fip,
                    Some(IpAddr::V4(fip_2_rtr.ip())),
                    Some(names.table),
                )
                .await?;
        }
        self.local_subnets.release(&router_id);
        state.rtr_fip_subnet = None;

        let devices = self.prims.namespaces.list_devices(&names.fip_ns).await?;
        if devices.contains(&names.fip_2_rtr) {
            self.prims
                .devices
                .delete(&names.fip_2_rtr, &names.fip_ns)
                .await?;
        }

        let is_last = self
            .fip_namespaces
            .unsubscribe(&self.prims, &ext_net_id, &router_id)
            .await?;
        state.fip_ns = None;
        state.fip_ext_net_id = None;

        info!(
            router_id = %router_id,
            namespace = %names.fip_ns,
            is_last,
            "Router unlinked from FIP namespace"
        );
        Ok(())
    }

    fn current_lease(&self, state: &RouterState) -> Result<LinkLocalLease> {
        state
            .rtr_fip_subnet
            .ok_or_else(|| Error::not_found(format!("link subnet of router {}", state.router_id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{Call, FakeKernel, agent_gateway_port, port};
    use crate::fip_ns::FipSettings;
    use crate::types::Router;

    fn controller(kernel: &Arc<FakeKernel>) -> FloatingIpController {
        controller_with(kernel, FipSettings::default())
    }

    fn controller_with(kernel: &Arc<FakeKernel>, settings: FipSettings) -> FloatingIpController {
        let pool = LocalSubnetPool::new("169.254.30.0/23".parse().unwrap(), None).unwrap();
        FloatingIpController::new(
            Arc::new(FipNamespaceManager::new(settings)),
            Arc::new(pool),
            kernel.primitives(),
            3,
        )
    }

    fn router_state(id: &str) -> RouterState {
        RouterState::new(Router {
            id: id.to_string(),
            distributed: true,
            ha: false,
            gw_port: None,
            interfaces: vec![port("int-1", "net-1", "subnet-1", "10.0.0.0/24", "10.0.0.1")],
            snat_interfaces: Vec::new(),
            ha_interface: None,
            fip_agent_gw_port: Some(agent_gateway_port()),
        })
    }

    fn fip(floating: &str, fixed: &str) -> (FloatingIp, IpNetwork) {
        let floating_ip: IpAddr = floating.parse().unwrap();
        (
            FloatingIp {
                floating_ip_address: floating_ip,
                fixed_ip_address: fixed.parse().unwrap(),
                floating_network_id: "ext-net".to_string(),
            },
            IpNetwork::new(floating_ip, 32).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_add_floating_ip_links_router() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, f1_cidr) = fip("203.0.113.10", "10.0.0.5");

        ctl.add(&mut state, &f1, f1_cidr).await.unwrap();

        assert_eq!(state.dist_fip_count(), 1);
        assert!(state.rtr_fip_subnet.is_some());
        assert!(kernel.namespace_exists("fip-ext-net"));
        assert!(kernel.devices_in("qrouter-r1").contains(&"rfp-r1".to_string()));
        assert!(kernel.devices_in("fip-ext-net").contains(&"fpr-r1".to_string()));
        assert_eq!(
            kernel.rules_in("qrouter-r1"),
            vec![(RuleSelector::Ip("10.0.0.5".parse().unwrap()), 16, 32768)]
        );
        assert_eq!(kernel.routes_in("fip-ext-net"), vec![f1_cidr]);
        assert!(kernel.gateways_in("qrouter-r1").contains(&Some(16)));
        assert_eq!(
            kernel.count(|c| matches!(c, Call::Garp { device, .. } if device == "fg-gw-port-1")),
            1
        );
    }

    #[tokio::test]
    async fn test_priorities_unique_and_count_tracks_table() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");
        let (f2, c2) = fip("203.0.113.11", "10.0.0.6");

        ctl.add(&mut state, &f1, c1).await.unwrap();
        ctl.add(&mut state, &f2, c2).await.unwrap();
        ctl.add(&mut state, &f2, c2).await.unwrap();

        assert_eq!(state.dist_fip_count(), 2);
        let p1 = state.floating_ips[&f1.floating_ip_address].priority;
        let p2 = state.floating_ips[&f2.floating_ip_address].priority;
        assert_ne!(p1, p2);

        ctl.remove(&mut state, c1).await.unwrap();
        assert_eq!(state.dist_fip_count(), 1);
        assert!(kernel.namespace_exists("fip-ext-net"));

        ctl.remove(&mut state, c2).await.unwrap();
        assert_eq!(state.dist_fip_count(), 0);
        assert!(state.rtr_fip_subnet.is_none());
        assert!(state.fip_ns.is_none());
        assert!(!kernel.namespace_exists("fip-ext-net"));
        assert!(kernel.rules_in("qrouter-r1").is_empty());
        assert!(kernel.gateways_in("qrouter-r1").is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_floating_ip_is_noop() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");

        ctl.remove(&mut state, "198.51.100.7/32".parse().unwrap())
            .await
            .unwrap();

        assert!(kernel.calls().is_empty());
        assert_eq!(state.dist_fip_count(), 0);
    }

    #[tokio::test]
    async fn test_namespace_shared_between_routers() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut r1 = router_state("r1");
        let mut r2 = router_state("r2");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");
        let (f2, c2) = fip("203.0.113.20", "10.0.0.5");

        ctl.add(&mut r1, &f1, c1).await.unwrap();
        ctl.add(&mut r2, &f2, c2).await.unwrap();
        assert_eq!(
            kernel.count(|c| matches!(c, Call::NamespaceCreate(n) if n == "fip-ext-net")),
            1
        );
        assert_ne!(
            r1.floating_ips[&f1.floating_ip_address].priority,
            r2.floating_ips[&f2.floating_ip_address].priority
        );
        assert_ne!(r1.rtr_fip_subnet, r2.rtr_fip_subnet);

        ctl.remove(&mut r1, c1).await.unwrap();
        assert!(kernel.namespace_exists("fip-ext-net"));

        ctl.remove(&mut r2, c2).await.unwrap();
        assert!(!kernel.namespace_exists("fip-ext-net"));
    }

    #[tokio::test]
    async fn test_exhausted_priorities_abort_before_mutation() {
        let kernel = FakeKernel::new();
        let settings = FipSettings {
            rule_priority_start: 32768,
            rule_priority_end: 32769,
            ..FipSettings::default()
        };
        let ctl = controller_with(&kernel, settings);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");
        let (f2, c2) = fip("203.0.113.11", "10.0.0.6");

        ctl.add(&mut state, &f1, c1).await.unwrap();
        let before = kernel.calls().len();

        let err = ctl.add(&mut state, &f2, c2).await.unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted { .. }));
        assert_eq!(kernel.calls().len(), before);
        assert_eq!(state.dist_fip_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_rule_undoes_first_link() {
        let kernel = FakeKernel::new();
        kernel.fail_on("rule.add");
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");

        assert!(ctl.add(&mut state, &f1, c1).await.is_err());
        assert_eq!(state.dist_fip_count(), 0);
        assert!(state.fip_ns.is_none());
        assert!(state.rtr_fip_subnet.is_none());
        assert!(!kernel.namespace_exists("fip-ext-net"));
        assert!(ctl.local_subnets().get("r1").is_none());

        kernel.clear_failures();
        ctl.add(&mut state, &f1, c1).await.unwrap();
        assert_eq!(state.floating_ips[&f1.floating_ip_address].priority, 32768);
    }

    #[tokio::test]
    async fn test_missing_gateway_port_is_an_error() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        state.router.fip_agent_gw_port = None;
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");

        assert!(ctl.add(&mut state, &f1, c1).await.unwrap_err().is_not_found());
        assert!(kernel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_releases_lease_for_reuse() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");

        ctl.add(&mut state, &f1, c1).await.unwrap();
        let first = state.rtr_fip_subnet;
        ctl.remove(&mut state, c1).await.unwrap();
        assert!(ctl.local_subnets().get("r1").is_none());

        ctl.add(&mut state, &f1, c1).await.unwrap();
        assert_eq!(state.rtr_fip_subnet, first);
    }

    #[tokio::test]
    async fn test_failed_route_undoes_rule_and_link() {
        let kernel = FakeKernel::new();
        kernel.fail_on("route.add");
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");

        assert!(ctl.add(&mut state, &f1, c1).await.is_err());
        assert_eq!(state.dist_fip_count(), 0);
        assert!(kernel.rules_in("qrouter-r1").is_empty());
        assert!(kernel.gateways_in("qrouter-r1").is_empty());
        assert!(state.fip_ns.is_none());
        assert!(state.rtr_fip_subnet.is_none());
        assert!(!kernel.namespace_exists("fip-ext-net"));
        assert!(ctl.local_subnets().get("r1").is_none());

        kernel.clear_failures();
        ctl.add(&mut state, &f1, c1).await.unwrap();
        assert_eq!(state.floating_ips[&f1.floating_ip_address].priority, 32768);
        assert_eq!(kernel.routes_in("fip-ext-net"), vec![c1]);
    }

    #[tokio::test]
    async fn test_failed_garp_keeps_other_floating_ips() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");
        let (f2, c2) = fip("203.0.113.11", "10.0.0.6");

        ctl.add(&mut state, &f1, c1).await.unwrap();
        kernel.fail_on("arp.send");
        assert!(ctl.add(&mut state, &f2, c2).await.is_err());

        assert_eq!(state.dist_fip_count(), 1);
        assert!(!state.floating_ips.contains_key(&f2.floating_ip_address));
        assert_eq!(
            kernel.rules_in("qrouter-r1"),
            vec![(RuleSelector::Ip("10.0.0.5".parse().unwrap()), 16, 32768)]
        );
        assert_eq!(kernel.routes_in("fip-ext-net"), vec![c1]);
        assert!(state.rtr_fip_subnet.is_some());
        assert!(kernel.namespace_exists("fip-ext-net"));

        kernel.clear_failures();
        ctl.add(&mut state, &f2, c2).await.unwrap();
        assert_eq!(state.floating_ips[&f2.floating_ip_address].priority, 32769);
    }

    #[tokio::test]
    async fn test_interrupted_unlink_finished_on_next_add() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");

        ctl.add(&mut state, &f1, c1).await.unwrap();
        kernel.fail_on("device.delete");
        assert!(ctl.remove(&mut state, c1).await.is_err());
        assert_eq!(state.dist_fip_count(), 0);
        assert!(state.rtr_fip_subnet.is_none());
        assert!(state.fip_ns.is_some());

        kernel.clear_failures();
        ctl.add(&mut state, &f1, c1).await.unwrap();
        assert_eq!(state.dist_fip_count(), 1);
        assert!(state.rtr_fip_subnet.is_some());
        assert!(state.fip_ns.is_some());
        assert_eq!(
            kernel.rules_in("qrouter-r1"),
            vec![(RuleSelector::Ip("10.0.0.5".parse().unwrap()), 16, 32768)]
        );
        assert_eq!(kernel.gateways_in("qrouter-r1"), vec![Some(16)]);
        assert!(kernel.namespace_exists("fip-ext-net"));
        assert!(kernel.devices_in("fip-ext-net").contains(&"fpr-r1".to_string()));
    }

    #[tokio::test]
    async fn test_finish_teardown_without_new_floating_ip() {
        let kernel = FakeKernel::new();
        let ctl = controller(&kernel);
        let mut state = router_state("r1");
        let (f1, c1) = fip("203.0.113.10", "10.0.0.5");

        ctl.add(&mut state, &f1, c1).await.unwrap();
        kernel.fail_on("namespace.delete");
        assert!(ctl.remove(&mut state, c1).await.is_err());
        assert!(kernel.namespace_exists("fip-ext-net"));

        kernel.clear_failures();
        ctl.finish_teardown(&mut state).await.unwrap();
        assert!(state.fip_ns.is_none());
        assert!(state.fip_ext_net_id.is_none());
        assert!(!kernel.namespace_exists("fip-ext-net"));

        ctl.finish_teardown(&mut state).await.unwrap();
    }
}
