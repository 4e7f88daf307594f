//! HA failover handling for VRRP-managed routers.
//!
//! The VRRP process reports each router's transitions to a local listener.
//! Notifications are queued per router and applied in order by a dedicated
//! worker, which keeps the router's metadata proxy running exactly while
//! the router is `master` on this host.
//!
//! # Components
//!
//! - **HaController**: per-router queues, workers and status
//! - **NotificationServer**: HTTP listener translating requests into events
//! - **HaMetrics**: transition, drop and proxy counters

pub mod controller;
pub mod metrics;
pub mod process;
pub mod server;
pub mod types;

pub use controller::HaController;
pub use metrics::HaMetrics;
pub use process::{MetadataProxy, StateChangeMonitor};
pub use server::NotificationServer;
pub use types::{DEFAULT_BACKLOG, HaRouterStatus, HaState, ROUTER_ID_HEADER, STATE_HEADER};
