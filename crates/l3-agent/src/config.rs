//! Configuration loading and validation for the L3 agent

use dvr::FipSettings;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// File under `state_path` remembering link-local leases.
pub const LINK_LOCAL_STATE_FILE: &str = "fip-linklocal-networks";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub dvr: DvrSettings,

    #[serde(default)]
    pub ha: HaSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.agent.validate()?;
        self.dvr.validate()?;
        self.ha.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Agent-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AgentSettings {
    /// Directory for persistent agent state
    pub state_path: PathBuf,

    /// Delete SNAT namespaces when their router goes away
    pub router_delete_namespaces: bool,

    /// Gratuitous ARPs per floating IP, 0 disables
    #[validate(range(max = 100))]
    pub send_arp_count: u32,

    /// Period of the resync and process supervision pass
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_resync_interval")]
    pub resync_interval: Duration,
}

/// Distributed routing settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_priority_range"))]
pub struct DvrSettings {
    #[validate(range(min = 1))]
    pub rule_priority_start: u32,

    /// Exclusive end of the rule priority range
    pub rule_priority_end: u32,

    /// Table for floating IP default routes; kernel tables 0 and 253-255 are refused
    #[validate(range(min = 1, max = 252))]
    pub fip_rule_table: u32,

    #[validate(custom = "validate_link_local_cidr")]
    pub link_local_cidr: String,

    #[validate(range(min = 4, max = 15))]
    pub device_name_len: usize,
}

/// Statically managed HA router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaRouterSettings {
    pub id: String,

    /// Router namespace; defaults to `qrouter-<id>`
    #[serde(default)]
    pub namespace: Option<String>,
}

impl HaRouterSettings {
    pub fn namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| dvr::types::router_ns_name(&self.id))
    }
}

/// HA notification and metadata proxy settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HaSettings {
    #[validate(custom = "validate_socket_addr")]
    pub listen_addr: String,

    #[validate(range(min = 1, max = 65535))]
    pub backlog: u32,

    #[validate(range(min = 1))]
    pub metadata_port: u16,

    /// Proxy command line; `{router_id}`, `{namespace}` and `{port}` are substituted
    #[validate(length(min = 1))]
    pub metadata_proxy_command: Vec<String>,

    /// State-change relay command line; `{listen_addr}` is also substituted
    pub state_change_command: Option<Vec<String>>,

    /// Run supervised commands through `ip netns exec <namespace>`
    pub netns_exec: bool,

    pub routers: Vec<HaRouterSettings>,
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_socket_addr")]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("/var/lib/l3-agent"),
            router_delete_namespaces: true,
            send_arp_count: 3,
            resync_interval: Duration::from_secs(30),
        }
    }
}

impl Default for DvrSettings {
    fn default() -> Self {
        let fip = FipSettings::default();
        Self {
            rule_priority_start: fip.rule_priority_start,
            rule_priority_end: fip.rule_priority_end,
            fip_rule_table: fip.rule_table,
            link_local_cidr: dvr::allocator::FIP_LL_SUBNET.to_string(),
            device_name_len: fip.device_name_len,
        }
    }
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9699".to_string(),
            backlog: ha::DEFAULT_BACKLOG,
            metadata_port: 9697,
            metadata_proxy_command: vec![
                "neutron-ns-metadata-proxy".to_string(),
                "--router_id={router_id}".to_string(),
                "--metadata_port={port}".to_string(),
            ],
            state_change_command: None,
            netns_exec: true,
            routers: Vec::new(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9100".to_string(),
        }
    }
}

// Custom validators

fn validate_resync_interval(interval: &Duration) -> Result<(), ValidationError> {
    let secs = interval.as_secs();
    if !(1..=3600).contains(&secs) {
        return Err(ValidationError::new("resync_interval_out_of_range"));
    }
    Ok(())
}

/// Widest rule priority range accepted.
const MAX_RULE_PRIORITY_SPAN: u32 = 1 << 20;

/// Priorities of the kernel's `main` and `default` rules.
const RESERVED_RULE_PRIORITIES: std::ops::Range<u32> = 32766..32768;

fn validate_priority_range(dvr: &DvrSettings) -> Result<(), ValidationError> {
    let (start, end) = (dvr.rule_priority_start, dvr.rule_priority_end);
    if end <= start {
        return Err(ValidationError::new("rule_priority_range_empty"));
    }
    if end - start > MAX_RULE_PRIORITY_SPAN {
        return Err(ValidationError::new("rule_priority_range_too_wide"));
    }
    if start == 0 || (start < RESERVED_RULE_PRIORITIES.end && RESERVED_RULE_PRIORITIES.start < end)
    {
        return Err(ValidationError::new("rule_priority_range_reserved"));
    }
    Ok(())
}

fn validate_link_local_cidr(cidr: &str) -> Result<(), ValidationError> {
    let net: Ipv4Network = cidr
        .trim()
        .parse()
        .map_err(|_| ValidationError::new("link_local_cidr_invalid"))?;
    if net.prefix() > 31 {
        return Err(ValidationError::new("link_local_cidr_too_small"));
    }
    Ok(())
}

fn validate_socket_addr(addr: &str) -> Result<(), ValidationError> {
    addr.trim()
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("socket_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileNotFound);
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/l3-agent/l3-agent.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./l3-agent.yaml"));

        paths.into_iter().find(|p| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/l3-agent/l3-agent.yaml"))
    }

    /// FIP namespace settings
    pub fn fip_settings(&self) -> FipSettings {
        FipSettings {
            rule_priority_start: self.dvr.rule_priority_start,
            rule_priority_end: self.dvr.rule_priority_end,
            rule_table: self.dvr.fip_rule_table,
            device_name_len: self.dvr.device_name_len,
        }
    }

    pub fn link_local_network(&self) -> Result<Ipv4Network, ConfigError> {
        self.dvr
            .link_local_cidr
            .trim()
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| ConfigError::InvalidValue {
                field: "dvr.link_local_cidr".to_string(),
                message: e.to_string(),
            })
    }

    pub fn link_local_state_file(&self) -> PathBuf {
        self.agent.state_path.join(LINK_LOCAL_STATE_FILE)
    }

    pub fn ha_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("ha.listen_addr", &self.ha.listen_addr)
    }

    pub fn metrics_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("metrics.listen_addr", &self.metrics.listen_addr)
    }
}

fn parse_addr(field: &str, addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.trim()
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
            field: field.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dvr.rule_priority_start, 32768);
        assert_eq!(config.dvr.rule_priority_end, 72768);
        assert_eq!(config.dvr.fip_rule_table, 16);
        assert_eq!(config.ha.backlog, 4096);
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let yaml = r#"
agent:
  state_path: /tmp/l3-agent
  router_delete_namespaces: false
  send_arp_count: 0
  resync_interval: 10s

dvr:
  rule_priority_start: 40000
  rule_priority_end: 41000
  link_local_cidr: 169.254.64.0/24

ha:
  listen_addr: 127.0.0.1:19699
  backlog: 128
  routers:
    - id: r1
    - id: r2
      namespace: custom-ns
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.agent.router_delete_namespaces);
        assert_eq!(config.agent.resync_interval, Duration::from_secs(10));
        assert_eq!(config.dvr.fip_rule_table, 16);
        assert_eq!(config.ha.routers[0].namespace(), "qrouter-r1");
        assert_eq!(config.ha.routers[1].namespace(), "custom-ns");
        assert_eq!(
            config.link_local_state_file(),
            PathBuf::from("/tmp/l3-agent/fip-linklocal-networks")
        );
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
metrics:
  enabled: false
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.listen_addr, "127.0.0.1:9100");
        assert_eq!(config.ha.metadata_port, 9697);
        assert_eq!(config.agent.send_arp_count, 3);
    }

    #[test]
    fn test_invalid_priority_range() {
        let yaml = r#"
dvr:
  rule_priority_start: 50000
  rule_priority_end: 50000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_priority_range_bounds() {
        let parse = |start: u32, end: u32| {
            let yaml = format!(
                "dvr:\n  rule_priority_start: {}\n  rule_priority_end: {}\n",
                start, end
            );
            serde_yaml::from_str::<Config>(&yaml).unwrap()
        };

        assert!(parse(40000, 40000 + (1 << 20)).validate().is_ok());
        assert!(parse(40000, 40001 + (1 << 20)).validate().is_err());
        assert!(parse(1, u32::MAX).validate().is_err());
        assert!(parse(32000, 32767).validate().is_err());
        assert!(parse(0, 100).validate().is_err());
        assert!(parse(100, 32766).validate().is_ok());
    }

    #[test]
    fn test_invalid_rule_table() {
        let yaml = r#"
dvr:
  fip_rule_table: 254
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backlog() {
        let yaml = r#"
ha:
  backlog: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_link_local_cidr_validation() {
        assert!(validate_link_local_cidr("169.254.30.0/23").is_ok());
        assert!(validate_link_local_cidr("169.254.30.0/31").is_ok());
        assert!(validate_link_local_cidr("169.254.30.0/32").is_err());
        assert!(validate_link_local_cidr("fe80::/64").is_err());
        assert!(validate_link_local_cidr("").is_err());
    }

    #[test]
    fn test_socket_addr_validation() {
        assert!(validate_socket_addr("127.0.0.1:9699").is_ok());
        assert!(validate_socket_addr("[::1]:9699").is_ok());
        assert!(validate_socket_addr("localhost").is_err());
    }

    #[test]
    fn test_invalid_resync_interval() {
        let yaml = r#"
agent:
  resync_interval: 2h
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load_from_file("/nonexistent/l3-agent.yaml"),
            Err(ConfigError::FileNotFound)
        ));
    }

    #[test]
    fn test_fip_settings_conversion() {
        let config = Config::default();
        let fip = config.fip_settings();
        assert_eq!(fip.rule_priority_start, 32768);
        assert_eq!(fip.rule_table, 16);
        assert_eq!(fip.device_name_len, 14);
        assert_eq!(config.link_local_network().unwrap().prefix(), 23);
    }
}
