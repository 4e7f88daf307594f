//! Distributed virtual router (DVR) control logic.
//!
//! Decides which namespaces, devices, policy rules, routes and neighbor
//! entries a distributed router needs on this host. The kernel work itself
//! goes through the collaborator traits in [`primitives`].
//!
//! # Components
//!
//! - **Allocators**: rule priorities, /31 link-local leases, SNAT table indices
//! - **FipNamespaceManager**: one shared floating IP namespace per external
//!   network, created on first subscription and destroyed on the last
//! - **FloatingIpController**: per floating IP rules and routes
//! - **SnatManager**: centralized SNAT namespace and subnet redirection
//! - **ArpSynchronizer**: static neighbor entries for subnet siblings
//!
//! # Example
//!
//! ```no_run
//! use dvr::fakes::FakeKernel;
//! use dvr::{FipNamespaceManager, FipSettings};
//!
//! # async fn example() -> common::Result<()> {
//! let kernel = FakeKernel::new();
//! let prims = kernel.primitives();
//! let manager = FipNamespaceManager::new(FipSettings::default());
//!
//! let gw_port = dvr::fakes::agent_gateway_port();
//! manager.subscribe(&prims, "ext-net", "router-1", &gw_port).await?;
//! let is_last = manager.unsubscribe(&prims, "ext-net", "router-1").await?;
//! assert!(is_last);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod arp;
pub mod fakes;
pub mod fip_ns;
pub mod floating_ip;
pub mod primitives;
pub mod router;
pub mod snat;
pub mod types;

pub use allocator::{LinkLocalLease, LocalSubnetPool, RulePriorityAllocator, snat_table_index};
pub use arp::ArpSynchronizer;
pub use fip_ns::{FIP_RT_TBL, FipNamespace, FipNamespaceManager, FipSettings};
pub use floating_ip::FloatingIpController;
pub use primitives::{PortSource, Primitives, RuleSelector};
pub use router::{NatAction, RouterRegistry, RouterState};
pub use snat::{SnatManager, map_internal_interface};
pub use types::{ArpEntry, ArpOperation, FloatingIp, Port, Router};
