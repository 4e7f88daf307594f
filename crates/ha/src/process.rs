//! Monitored external processes driven by HA state.

use async_trait::async_trait;
use common::Result;

/// Per-router metadata proxy process.
///
/// Implementations keep the process alive (respawning it if it dies) until
/// `destroy` is called.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataProxy: Send + Sync {
    /// Start the proxy for `router_id` inside `namespace`, listening on `port`.
    async fn spawn(&self, namespace: &str, port: u16, router_id: &str) -> Result<()>;

    /// Stop the proxy of `router_id`.
    async fn destroy(&self, router_id: &str, namespace: &str) -> Result<()>;
}

/// Helper process that relays VRRP transitions of one router to the
/// notification listener.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateChangeMonitor: Send + Sync {
    async fn spawn(&self, router_id: &str, namespace: &str) -> Result<()>;

    async fn destroy(&self, router_id: &str, namespace: &str) -> Result<()>;
}
