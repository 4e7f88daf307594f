//! L3 agent: distributed routing and HA failover on one host.
//!
//! # Architecture
//!
//! - [`L3Agent`] is the entry point for the router lifecycle orchestrator:
//!   floating IPs, SNAT redirection, ARP entries and HA router add/remove.
//!   Kernel work goes through the collaborator traits of the `dvr` crate.
//! - [`AgentServer`] is the standalone process: it listens for VRRP
//!   notifications, supervises metadata proxies and state-change monitors,
//!   and serves Prometheus metrics.
//!
//! # Components
//!
//! - **Config**: YAML configuration with validation
//! - **ProcessSupervisor**: per-router child processes, respawned when they die
//! - **MetricsServer**: `/metrics` endpoint

pub mod agent;
pub mod config;
pub mod http_server;
pub mod metrics;
pub mod process;
pub mod server;

pub use agent::{Collaborators, L3Agent};
pub use config::{Config, ConfigError};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use process::{ProcessMetadataProxy, ProcessStateChangeMonitor, ProcessSupervisor};
pub use server::AgentServer;
