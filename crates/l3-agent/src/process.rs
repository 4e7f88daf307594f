//! Supervised external processes: metadata proxies and state-change monitors.
//!
//! Each process is keyed by router id and runs inside the router's namespace
//! through `ip netns exec`. Children that exit on their own are restarted by
//! [`ProcessSupervisor::respawn_dead`], which the agent's periodic pass calls.

use async_trait::async_trait;
use common::{Error, Result};
use ha::{MetadataProxy, StateChangeMonitor};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct Supervised {
    namespace: String,
    argv: Vec<String>,
    child: Child,
}

/// Keeps one child process per key alive.
pub struct ProcessSupervisor {
    name: &'static str,
    template: Vec<String>,
    netns_exec: bool,
    children: Mutex<HashMap<String, Supervised>>,
}

impl ProcessSupervisor {
    /// `template` is the command line; `{name}` placeholders are filled per spawn.
    pub fn new(name: &'static str, template: Vec<String>) -> Self {
        Self {
            name,
            template,
            netns_exec: true,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Run commands in the caller's namespace instead of `ip netns exec`.
    pub fn without_netns(mut self) -> Self {
        self.netns_exec = false;
        self
    }

    /// Start the process for `key` unless one is already running.
    pub async fn spawn(&self, key: &str, namespace: &str, vars: &[(&str, &str)]) -> Result<()> {
        let mut children = self.children.lock().await;
        if let Some(existing) = children.get_mut(key) {
            if matches!(existing.child.try_wait(), Ok(None)) {
                debug!(process = self.name, key, "Process already running");
                return Ok(());
            }
        }

        let argv = substitute(&self.template, vars);
        let child = self.start(namespace, &argv)?;
        info!(process = self.name, key, namespace, pid = ?child.id(), "Process started");
        children.insert(
            key.to_string(),
            Supervised {
                namespace: namespace.to_string(),
                argv,
                child,
            },
        );
        Ok(())
    }

    /// Kill the process of `key`; a no-op when none is tracked.
    pub async fn destroy(&self, key: &str) -> Result<()> {
        let Some(mut supervised) = self.children.lock().await.remove(key) else {
            debug!(process = self.name, key, "No process to stop");
            return Ok(());
        };

        if let Ok(Some(status)) = supervised.child.try_wait() {
            debug!(process = self.name, key, %status, "Process had already exited");
        } else {
            supervised
                .child
                .kill()
                .await
                .map_err(|e| Error::primitive(format!("{} kill", self.name), e))?;
        }
        info!(process = self.name, key, namespace = %supervised.namespace, "Process stopped");
        Ok(())
    }

    /// Restart children that have exited. Returns how many were restarted.
    pub async fn respawn_dead(&self) -> usize {
        let mut children = self.children.lock().await;
        let mut respawned = 0;
        for (key, supervised) in children.iter_mut() {
            let status = match supervised.child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    warn!(process = self.name, key = %key, error = %e, "Failed to poll process");
                    continue;
                }
            };
            warn!(process = self.name, key = %key, %status, "Process exited, respawning");
            match self.start(&supervised.namespace, &supervised.argv) {
                Ok(child) => {
                    supervised.child = child;
                    respawned += 1;
                }
                Err(e) => warn!(process = self.name, key = %key, error = %e, "Respawn failed"),
            }
        }
        respawned
    }

    pub async fn is_running(&self, key: &str) -> bool {
        let mut children = self.children.lock().await;
        children
            .get_mut(key)
            .is_some_and(|s| matches!(s.child.try_wait(), Ok(None)))
    }

    pub async fn len(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Kill every tracked process.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.destroy(&key).await {
                warn!(process = self.name, key, error = %e, "Failed to stop process");
            }
        }
    }

    fn start(&self, namespace: &str, argv: &[String]) -> Result<Child> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::config(format!("{} command is empty", self.name)))?;

        let mut cmd = if self.netns_exec {
            let mut cmd = Command::new("ip");
            cmd.args(["netns", "exec", namespace]).arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| Error::primitive(format!("{} spawn", self.name), e))
    }
}

fn substitute(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Metadata proxy backed by a supervised process per router.
pub struct ProcessMetadataProxy {
    supervisor: ProcessSupervisor,
}

impl ProcessMetadataProxy {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

#[async_trait]
impl MetadataProxy for ProcessMetadataProxy {
    async fn spawn(&self, namespace: &str, port: u16, router_id: &str) -> Result<()> {
        let port = port.to_string();
        self.supervisor
            .spawn(
                router_id,
                namespace,
                &[("router_id", router_id), ("namespace", namespace), ("port", &port)],
            )
            .await
    }

    async fn destroy(&self, router_id: &str, _namespace: &str) -> Result<()> {
        self.supervisor.destroy(router_id).await
    }
}

/// State-change monitor relaying one router's VRRP transitions to `listen_addr`.
pub struct ProcessStateChangeMonitor {
    supervisor: ProcessSupervisor,
    listen_addr: String,
}

impl ProcessStateChangeMonitor {
    pub fn new(supervisor: ProcessSupervisor, listen_addr: impl Into<String>) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.into(),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

#[async_trait]
impl StateChangeMonitor for ProcessStateChangeMonitor {
    async fn spawn(&self, router_id: &str, namespace: &str) -> Result<()> {
        self.supervisor
            .spawn(
                router_id,
                namespace,
                &[
                    ("router_id", router_id),
                    ("namespace", namespace),
                    ("listen_addr", &self.listen_addr),
                ],
            )
            .await
    }

    async fn destroy(&self, router_id: &str, _namespace: &str) -> Result<()> {
        self.supervisor.destroy(router_id).await
    }
}
