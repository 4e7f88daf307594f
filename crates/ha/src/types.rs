//! HA router states as reported by the VRRP process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header carrying the router identifier of a state notification.
pub const ROUTER_ID_HEADER: &str = "X-Neutron-Router-Id";

/// Header carrying the new VRRP state of a notification.
pub const STATE_HEADER: &str = "X-Neutron-State";

/// Default accept backlog of the notification listener.
pub const DEFAULT_BACKLOG: u32 = 4096;

/// VRRP state of one HA router on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaState {
    /// No notification received yet
    #[default]
    Unknown,
    /// This host owns the router's virtual addresses
    Master,
    /// Another host owns the router's virtual addresses
    Backup,
    /// VRRP instance failed locally
    Fault,
}

impl HaState {
    /// Whether the metadata proxy should run in this state.
    pub fn wants_proxy(&self) -> bool {
        matches!(self, HaState::Master)
    }
}

impl fmt::Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaState::Unknown => write!(f, "unknown"),
            HaState::Master => write!(f, "master"),
            HaState::Backup => write!(f, "backup"),
            HaState::Fault => write!(f, "fault"),
        }
    }
}

/// State token that is not one the VRRP process sends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown HA state {0:?}")]
pub struct UnknownState(pub String);

impl FromStr for HaState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(HaState::Master),
            "backup" => Ok(HaState::Backup),
            "fault" => Ok(HaState::Fault),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

/// Observable state of a managed HA router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HaRouterStatus {
    pub state: HaState,
    pub proxy_running: bool,
}
