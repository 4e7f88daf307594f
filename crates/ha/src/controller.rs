//! Per-router serial application of HA state changes.
//!
//! Every managed router gets a worker task fed by its own queue, so events
//! for one router are applied strictly in arrival order while different
//! routers proceed in parallel. Enqueueing only waits for queue space, never
//! for the proxy process to start or stop.

use crate::metrics::HaMetrics;
use crate::process::MetadataProxy;
use crate::types::{HaRouterStatus, HaState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending events per router before enqueueing waits.
pub const EVENT_QUEUE_DEPTH: usize = 256;

enum WorkerMsg {
    Transition(HaState),
    Flush(oneshot::Sender<()>),
}

struct RouterWorker {
    tx: mpsc::Sender<WorkerMsg>,
    status: Arc<RwLock<HaRouterStatus>>,
    namespace: String,
    task: JoinHandle<()>,
}

/// Applies VRRP state notifications to managed HA routers.
pub struct HaController {
    workers: DashMap<String, RouterWorker>,
    proxy: Arc<dyn MetadataProxy>,
    metadata_port: u16,
    metrics: Option<Arc<HaMetrics>>,
}

impl HaController {
    pub fn new(
        proxy: Arc<dyn MetadataProxy>,
        metadata_port: u16,
        metrics: Option<Arc<HaMetrics>>,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            proxy,
            metadata_port,
            metrics,
        }
    }

    /// Start managing `router_id` in state `unknown`.
    ///
    /// Returns false if the router is already managed.
    pub fn register(&self, router_id: &str, namespace: &str) -> bool {
        let slot = match self.workers.entry(router_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(router_id, "HA router already registered");
                return false;
            }
            Entry::Vacant(slot) => slot,
        };

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let status = Arc::new(RwLock::new(HaRouterStatus::default()));
        let worker = Worker {
            router_id: router_id.to_string(),
            namespace: namespace.to_string(),
            status: status.clone(),
            proxy: self.proxy.clone(),
            metadata_port: self.metadata_port,
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        slot.insert(RouterWorker {
            tx,
            status,
            namespace: namespace.to_string(),
            task,
        });
        info!(router_id, namespace, "HA router registered");
        true
    }

    /// Stop managing `router_id`.
    ///
    /// Events already queued are applied first; a proxy left running by them
    /// is then destroyed.
    pub async fn unregister(&self, router_id: &str) {
        let Some((_, worker)) = self.workers.remove(router_id) else {
            debug!(router_id, "HA router not registered");
            return;
        };

        drop(worker.tx);
        if let Err(e) = worker.task.await {
            error!(router_id, error = %e, "HA worker ended abnormally");
        }

        let mut status = worker.status.write().await;
        if status.proxy_running {
            match self.proxy.destroy(router_id, &worker.namespace).await {
                Ok(()) => {
                    status.proxy_running = false;
                    if let Some(ref m) = self.metrics {
                        m.proxy_stopped();
                    }
                }
                Err(e) => error!(router_id, error = %e, "Failed to destroy metadata proxy"),
            }
        }
        info!(router_id, "HA router unregistered");
    }

    /// Queue a state change for `router_id`.
    ///
    /// Events for routers that are not managed are logged and dropped.
    /// Returns whether the event was queued.
    pub async fn enqueue(&self, router_id: &str, state: HaState) -> bool {
        info!(router_id, %state, "Router transitioned");

        let tx = self.workers.get(router_id).map(|w| w.tx.clone());
        let Some(tx) = tx else {
            self.drop_event(router_id, state);
            return false;
        };
        if tx.send(WorkerMsg::Transition(state)).await.is_err() {
            self.drop_event(router_id, state);
            return false;
        }
        true
    }

    fn drop_event(&self, router_id: &str, state: HaState) {
        info!(
            router_id,
            %state,
            "Router is not managed by this agent, it was possibly deleted concurrently"
        );
        if let Some(ref m) = self.metrics {
            m.record_dropped();
        }
    }

    /// Wait until every event queued for `router_id` so far is applied.
    pub async fn settle(&self, router_id: &str) {
        let tx = self.workers.get(router_id).map(|w| w.tx.clone());
        let Some(tx) = tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WorkerMsg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Current status of `router_id`.
    pub async fn status(&self, router_id: &str) -> Option<HaRouterStatus> {
        let status = self.workers.get(router_id).map(|w| w.status.clone())?;
        let status = *status.read().await;
        Some(status)
    }

    pub fn is_managed(&self, router_id: &str) -> bool {
        self.workers.contains_key(router_id)
    }

    pub fn router_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.key().clone()).collect()
    }

    /// Unregister every router.
    pub async fn shutdown(&self) {
        for router_id in self.router_ids() {
            self.unregister(&router_id).await;
        }
    }
}

/// Serial executor of one router's events.
struct Worker {
    router_id: String,
    namespace: String,
    status: Arc<RwLock<HaRouterStatus>>,
    proxy: Arc<dyn MetadataProxy>,
    metadata_port: u16,
    metrics: Option<Arc<HaMetrics>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<WorkerMsg>) {
        debug!(router_id = %self.router_id, "HA worker started");
        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::Transition(state) => self.apply(state).await,
                WorkerMsg::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(router_id = %self.router_id, "HA worker stopped");
    }

    async fn apply(&self, state: HaState) {
        let mut status = self.status.write().await;
        let previous = status.state;
        status.state = state;
        if let Some(ref m) = self.metrics {
            m.record_transition(state);
        }

        if state.wants_proxy() {
            if status.proxy_running {
                debug!(router_id = %self.router_id, "Metadata proxy already running");
                return;
            }
            debug!(router_id = %self.router_id, "Spawning metadata proxy");
            match self
                .proxy
                .spawn(&self.namespace, self.metadata_port, &self.router_id)
                .await
            {
                Ok(()) => {
                    status.proxy_running = true;
                    if let Some(ref m) = self.metrics {
                        m.proxy_started();
                    }
                }
                Err(e) => {
                    error!(
                        router_id = %self.router_id,
                        error = %e,
                        "Failed to spawn metadata proxy"
                    )
                }
            }
        } else if status.proxy_running {
            debug!(router_id = %self.router_id, "Closing metadata proxy");
            match self.proxy.destroy(&self.router_id, &self.namespace).await {
                Ok(()) => {
                    status.proxy_running = false;
                    if let Some(ref m) = self.metrics {
                        m.proxy_stopped();
                    }
                }
                Err(e) => {
                    warn!(
                        router_id = %self.router_id,
                        error = %e,
                        "Failed to destroy metadata proxy"
                    )
                }
            }
        }

        debug!(router_id = %self.router_id, from = %previous, to = %state, "HA state applied");
    }
}
