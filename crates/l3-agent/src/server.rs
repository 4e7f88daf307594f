//! Standalone HA agent: notification listener, supervised processes, metrics.

use crate::config::Config;
use crate::http_server::MetricsServer;
use crate::metrics::MetricsRegistry;
use crate::process::{ProcessMetadataProxy, ProcessStateChangeMonitor, ProcessSupervisor};
use ha::{HaController, NotificationServer, StateChangeMonitor};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Main agent server
pub struct AgentServer {
    config: Config,
    controller: Arc<HaController>,
    proxy: Arc<ProcessMetadataProxy>,
    monitor: Option<Arc<ProcessStateChangeMonitor>>,
    notifications: NotificationServer,
    metrics: Option<Arc<MetricsRegistry>>,
    metrics_server: Option<MetricsServer>,
}

impl AgentServer {
    /// Build the components and bind both listeners.
    pub async fn bind(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let metrics = if config.metrics.enabled {
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let proxy = Arc::new(ProcessMetadataProxy::new(supervisor(
            &config,
            "metadata-proxy",
            config.ha.metadata_proxy_command.clone(),
        )));
        let monitor = config.ha.state_change_command.clone().map(|command| {
            Arc::new(ProcessStateChangeMonitor::new(
                supervisor(&config, "state-change-monitor", command),
                config.ha.listen_addr.clone(),
            ))
        });

        let controller = Arc::new(HaController::new(
            proxy.clone(),
            config.ha.metadata_port,
            metrics.as_ref().map(|m| m.ha()),
        ));
        let notifications = NotificationServer::bind(
            config.ha_listen_addr()?,
            config.ha.backlog,
            controller.clone(),
        )
        .await?;

        let metrics_server = match metrics {
            Some(ref registry) => {
                Some(MetricsServer::bind(registry.clone(), config.metrics_listen_addr()?).await?)
            }
            None => None,
        };

        Ok(Self {
            config,
            controller,
            proxy,
            monitor,
            notifications,
            metrics,
            metrics_server,
        })
    }

    pub fn controller(&self) -> Arc<HaController> {
        self.controller.clone()
    }

    pub fn notification_addr(&self) -> common::Result<SocketAddr> {
        self.notifications.local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_server.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Run until interrupted.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for interrupt");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes or the notification listener fails.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Self {
            config,
            controller,
            proxy,
            monitor,
            notifications,
            metrics,
            metrics_server,
        } = self;
        info!("Starting L3 agent");

        for router in &config.ha.routers {
            let namespace = router.namespace();
            controller.register(&router.id, &namespace);
            if let Some(ref monitor) = monitor {
                if let Err(e) = monitor.spawn(&router.id, &namespace).await {
                    warn!(
                        router_id = %router.id,
                        error = %e,
                        "Failed to start state-change monitor"
                    );
                }
            }
        }
        if let Some(ref m) = metrics {
            m.set_router_count(controller.router_ids().len());
        }

        let metrics_handle = metrics_server.map(|server| {
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!(error = %e, "Metrics server error");
                }
            })
        });
        let mut notify_handle = tokio::spawn(notifications.run());

        let mut ticker = tokio::time::interval(config.agent.resync_interval);
        tokio::pin!(shutdown);

        info!(routers = config.ha.routers.len(), "L3 agent running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    supervise(&proxy, monitor.as_deref(), metrics.as_deref()).await;
                }
                result = &mut notify_handle => {
                    match result {
                        Ok(Ok(())) => info!("Notification listener completed"),
                        Ok(Err(e)) => warn!(error = %e, "Notification listener error"),
                        Err(e) => warn!(error = %e, "Notification listener task failed"),
                    }
                    break;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        notify_handle.abort();
        if let Some(handle) = metrics_handle {
            handle.abort();
        }
        controller.shutdown().await;
        if let Some(ref monitor) = monitor {
            monitor.supervisor().shutdown().await;
        }
        proxy.supervisor().shutdown().await;

        info!("L3 agent stopped");
        Ok(())
    }
}

fn supervisor(config: &Config, name: &'static str, command: Vec<String>) -> ProcessSupervisor {
    let supervisor = ProcessSupervisor::new(name, command);
    if config.ha.netns_exec {
        supervisor
    } else {
        supervisor.without_netns()
    }
}

/// Restart supervised processes that exited on their own.
async fn supervise(
    proxy: &ProcessMetadataProxy,
    monitor: Option<&ProcessStateChangeMonitor>,
    metrics: Option<&MetricsRegistry>,
) {
    let mut respawned = proxy.supervisor().respawn_dead().await;
    if let Some(monitor) = monitor {
        respawned += monitor.supervisor().respawn_dead().await;
    }
    if respawned > 0 {
        info!(respawned, "Respawned supervised processes");
        if let Some(m) = metrics {
            m.record_respawns(respawned);
        }
    }
}
