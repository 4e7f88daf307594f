//! Router scenarios through the agent facade against the in-memory kernel.

use async_trait::async_trait;
use common::Result;
use dvr::fakes::{Call, FakeKernel, StaticPorts, agent_gateway_port, port};
use dvr::{FloatingIp, Port, Router};
use ha::{HaState, MetadataProxy, StateChangeMonitor};
use ipnetwork::IpNetwork;
use l3_agent::{Collaborators, Config, L3Agent, MetricsRegistry};
use mockall::Sequence;
use std::sync::Arc;

mockall::mock! {
    pub Proxy {}

    #[async_trait]
    impl MetadataProxy for Proxy {
        async fn spawn(&self, namespace: &str, port: u16, router_id: &str) -> Result<()>;
        async fn destroy(&self, router_id: &str, namespace: &str) -> Result<()>;
    }
}

mockall::mock! {
    pub Monitor {}

    #[async_trait]
    impl StateChangeMonitor for Monitor {
        async fn spawn(&self, router_id: &str, namespace: &str) -> Result<()>;
        async fn destroy(&self, router_id: &str, namespace: &str) -> Result<()>;
    }
}

struct Harness {
    kernel: Arc<FakeKernel>,
    ports: Arc<StaticPorts>,
    agent: L3Agent,
}

fn harness(
    name: &str,
    subnet_ports: Vec<Port>,
    proxy: MockProxy,
    monitor: Option<MockMonitor>,
) -> Harness {
    let mut config = Config::default();
    let state_path =
        std::env::temp_dir().join(format!("l3-agent-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&state_path);
    config.agent.state_path = state_path;

    let kernel = FakeKernel::new();
    let ports = StaticPorts::new(subnet_ports);
    let collaborators = Collaborators {
        prims: kernel.primitives(),
        ports: ports.clone(),
        proxy: Arc::new(proxy),
        monitor: monitor.map(|m| Arc::new(m) as Arc<dyn StateChangeMonitor>),
    };
    let agent = L3Agent::new(&config, collaborators, Some(Arc::new(MetricsRegistry::new())))
        .unwrap();
    Harness {
        kernel,
        ports,
        agent,
    }
}

fn dvr_router(id: &str) -> Router {
    Router {
        id: id.to_string(),
        distributed: true,
        interfaces: vec![port(
            &format!("int-{}", id),
            "net-1",
            "subnet-1",
            "10.0.0.0/24",
            "10.0.0.1",
        )],
        fip_agent_gw_port: Some(agent_gateway_port()),
        ..Default::default()
    }
}

fn ha_router(id: &str) -> Router {
    Router {
        id: id.to_string(),
        ha: true,
        ha_interface: Some(port(
            "ha-port-1",
            "ha-net",
            "ha-subnet",
            "169.254.192.0/18",
            "169.254.192.5",
        )),
        ..Default::default()
    }
}

fn fip(floating: &str, fixed: &str) -> (FloatingIp, IpNetwork) {
    let floating_ip = floating.parse().unwrap();
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
async fn test_two_routers_share_fip_namespace() {
    let h = harness("shared-ns", Vec::new(), MockProxy::new(), None);
    h.agent.add_router(dvr_router("r1"));
    h.agent.add_router(dvr_router("r2"));

    let (f1, f1_cidr) = fip("203.0.113.10", "10.0.0.5");
    let (f2, f2_cidr) = fip("203.0.113.11", "10.0.0.6");
    h.agent.add_floating_ip("r1", &f1, f1_cidr).await.unwrap();
    h.agent.add_floating_ip("r2", &f2, f2_cidr).await.unwrap();

    assert_eq!(
        h.kernel.count(|c| matches!(c, Call::NamespaceCreate(ns) if ns == "fip-ext-net")),
        1
    );
    let r1 = h.agent.router("r1").unwrap();
    let r2 = h.agent.router("r2").unwrap();
    let lease1 = r1.lock().await.rtr_fip_subnet.unwrap();
    let lease2 = r2.lock().await.rtr_fip_subnet.unwrap();
    assert_ne!(lease1, lease2);

    // r1 leaves; r2 still holds the namespace.
    h.agent.remove_floating_ip("r1", f1_cidr).await.unwrap();
    assert!(h.kernel.namespace_exists("fip-ext-net"));
    assert!(r1.lock().await.rtr_fip_subnet.is_none());
    assert!(!h.kernel.devices_in("fip-ext-net").contains(&"fpr-r1".to_string()));

    h.agent.remove_floating_ip("r2", f2_cidr).await.unwrap();
    assert!(!h.kernel.namespace_exists("fip-ext-net"));
    assert_eq!(
        h.kernel.count(|c| matches!(c, Call::NamespaceDelete(ns) if ns == "fip-ext-net")),
        1
    );
}

#[tokio::test]
async fn test_removing_unknown_floating_ip_is_noop() {
    let h = harness("unknown-fip", Vec::new(), MockProxy::new(), None);
    h.agent.add_router(dvr_router("r1"));

    h.agent
        .remove_floating_ip("r1", "198.51.100.1/32".parse().unwrap())
        .await
        .unwrap();
    assert!(h.kernel.calls().is_empty());
}

#[tokio::test]
async fn test_ha_router_lifecycle() {
    let mut seq = Sequence::new();
    let mut proxy = MockProxy::new();
    proxy
        .expect_spawn()
        .withf(|ns, port, id| ns == "qrouter-r1" && *port == 9697 && id == "r1")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Ok(()));
    proxy
        .expect_destroy()
        .withf(|id, ns| id == "r1" && ns == "qrouter-r1")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let mut monitor = MockMonitor::new();
    monitor
        .expect_spawn()
        .withf(|id, ns| id == "r1" && ns == "qrouter-r1")
        .times(1)
        .returning(|_, _| Ok(()));
    monitor.expect_destroy().times(1).returning(|_, _| Ok(()));

    let h = harness("ha-lifecycle", Vec::new(), proxy, Some(monitor));
    h.agent.add_router(ha_router("r1"));

    h.agent.process_ha_router_added("r1").await.unwrap();
    assert!(h.kernel.devices_in("qrouter-r1").contains(&"ha-ha-port-1".to_string()));
    assert_eq!(h.agent.ha_status("r1").await.unwrap().state, HaState::Unknown);

    // Second master is a no-op for the proxy.
    assert!(h.agent.enqueue_ha_state_change("r1", HaState::Master).await);
    assert!(h.agent.enqueue_ha_state_change("r1", HaState::Master).await);
    h.agent.ha_controller().settle("r1").await;
    assert!(h.agent.ha_status("r1").await.unwrap().proxy_running);

    h.agent.process_ha_router_removed("r1").await.unwrap();
    assert!(h.agent.ha_status("r1").await.is_none());
    assert!(!h.kernel.devices_in("qrouter-r1").contains(&"ha-ha-port-1".to_string()));
    assert!(!h.agent.enqueue_ha_state_change("r1", HaState::Backup).await);
}

#[tokio::test]
async fn test_rapid_master_backup_spawns_then_destroys() {
    let mut seq = Sequence::new();
    let mut proxy = MockProxy::new();
    proxy
        .expect_spawn()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Ok(()));
    proxy
        .expect_destroy()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let h = harness("ha-flap", Vec::new(), proxy, None);
    h.agent.add_router(ha_router("r1"));
    h.agent.process_ha_router_added("r1").await.unwrap();

    h.agent.enqueue_ha_state_change("r1", HaState::Master).await;
    h.agent.enqueue_ha_state_change("r1", HaState::Backup).await;
    h.agent.ha_controller().settle("r1").await;

    let status = h.agent.ha_status("r1").await.unwrap();
    assert_eq!(status.state, HaState::Backup);
    assert!(!status.proxy_running);
}

#[tokio::test]
async fn test_arp_failure_requests_full_sync() {
    let mut sibling = port("vm-port-1", "net-1", "subnet-1", "10.0.0.0/24", "10.0.0.9");
    sibling.device_owner = "compute:nova".to_string();
    let h = harness("arp-sync", vec![sibling.clone()], MockProxy::new(), None);
    h.agent.add_router(dvr_router("r1"));
    let router_port = port("int-r1", "net-1", "subnet-1", "10.0.0.0/24", "10.0.0.1");

    h.agent.sync_subnet_arp("r1", &router_port).await;
    assert_eq!(h.kernel.neighbors_in("qrouter-r1").len(), 1);
    assert!(!h.agent.take_full_sync());

    h.ports.set_failing(true);
    h.agent.sync_subnet_arp("r1", &router_port).await;
    assert!(h.agent.full_sync_needed());

    h.ports.set_failing(false);
    h.kernel.fail_on("neighbor.add");
    assert!(h.agent.take_full_sync());
    h.agent
        .update_arp_entry(
            "r1",
            "10.0.0.10".parse().unwrap(),
            "fa:16:3e:00:00:0a",
            "subnet-1",
            dvr::ArpOperation::Add,
        )
        .await;
    assert!(h.agent.take_full_sync());
    assert!(!h.agent.take_full_sync());
}

#[tokio::test]
async fn test_snat_redirect_failure_is_swallowed() {
    let h = harness("snat", Vec::new(), MockProxy::new(), None);
    h.agent.add_router(dvr_router("r1"));
    let sn_port = port("snat-port-1", "net-1", "subnet-1", "10.0.0.0/24", "10.0.0.3");

    h.kernel.fail_on("route.add_gateway");
    h.agent
        .redirect_add("r1", "10.0.0.3".parse().unwrap(), &sn_port, "qr-int-r1")
        .await;
    assert!(h.kernel.rules_in("qrouter-r1").is_empty());

    h.kernel.clear_failures();
    h.agent
        .redirect_add("r1", "10.0.0.3".parse().unwrap(), &sn_port, "qr-int-r1")
        .await;
    assert_eq!(h.kernel.rules_in("qrouter-r1").len(), 1);

    h.agent.redirect_remove("r1", &sn_port, "qr-int-r1").await;
    assert!(h.kernel.rules_in("qrouter-r1").is_empty());
}
