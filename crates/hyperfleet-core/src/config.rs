//! `hyperfleet.toml` configuration parser.
//!
//! Durations and byte sizes stay as humane strings in the parsed structs
//! and are converted through accessor methods; [`ControllerConfig::validate`]
//! rejects anything those accessors could not read.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{parse_bytes, parse_duration};
use crate::types::{
    AddressRange, CloudInit, HostSpec, InstanceTemplate, NetworkTemplate, PlacementOrder,
    Protocol, Resources,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Time between reconciliation ticks.
    pub interval: String,
    /// Failed attempts before an instance is marked Failed.
    pub max_retries: u32,
    pub backoff_base: String,
    pub backoff_max: String,
    /// Upper bound on any single gateway call.
    pub gateway_timeout: String,
    /// Concurrent gateway calls allowed against one host.
    pub host_concurrency: usize,
    /// How long capacity exhaustion may persist before it is raised as an error.
    pub exhaustion_alert_after: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            max_retries: 5,
            backoff_base: "2s".to_string(),
            backoff_max: "5m".to_string(),
            gateway_timeout: "60s".to_string(),
            host_concurrency: 4,
            exhaustion_alert_after: "5m".to_string(),
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn backoff_base(&self) -> Duration {
        parse_duration(&self.backoff_base).unwrap_or(Duration::from_secs(2))
    }

    pub fn backoff_max(&self) -> Duration {
        parse_duration(&self.backoff_max).unwrap_or(Duration::from_secs(300))
    }

    pub fn gateway_timeout(&self) -> Duration {
        parse_duration(&self.gateway_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn exhaustion_alert_after(&self) -> Duration {
        parse_duration(&self.exhaustion_alert_after).unwrap_or(Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub interval: String,
    pub timeout: String,
    /// Consecutive failed probes before a host is marked unreachable.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            timeout: "3s".to_string(),
            unhealthy_threshold: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(3))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub interval: String,
    /// Samples retained per host for the trailing average.
    pub trailing: usize,
    pub host_timeout: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            trailing: 10,
            host_timeout: "5s".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn host_timeout(&self) -> Duration {
        parse_duration(&self.host_timeout).unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/hyperfleet/state.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8085".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default)]
    pub order: PlacementOrder,
}

/// A byte quantity written either as an integer or as a string like `"8GiB"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ByteSize {
    Bytes(u64),
    Text(String),
}

impl ByteSize {
    pub fn as_bytes(&self) -> Option<u64> {
        match self {
            ByteSize::Bytes(b) => Some(*b),
            ByteSize::Text(s) => parse_bytes(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub cpu: u32,
    pub memory: ByteSize,
    #[serde(default = "zero_bytes")]
    pub storage: ByteSize,
}

fn zero_bytes() -> ByteSize {
    ByteSize::Bytes(0)
}

impl ResourcesConfig {
    fn to_resources(&self, owner: &str) -> Result<Resources, ConfigError> {
        let memory = self.memory.as_bytes().ok_or_else(|| {
            ConfigError::Invalid(format!("{owner}: unreadable memory size {:?}", self.memory))
        })?;
        let storage = self.storage.as_bytes().ok_or_else(|| {
            ConfigError::Invalid(format!("{owner}: unreadable storage size {:?}", self.storage))
        })?;
        Ok(Resources::new(self.cpu, memory, storage))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_host_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_hypervisor")]
    pub hypervisor: String,
    pub user: Option<String>,
    pub resources: ResourcesConfig,
}

fn default_host_port() -> u16 {
    22
}

fn default_hypervisor() -> String {
    "qemu".to_string()
}

impl HostConfig {
    pub fn to_spec(&self) -> Result<HostSpec, ConfigError> {
        Ok(HostSpec {
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            protocol: self.protocol,
            hypervisor: self.hypervisor.clone(),
            user: self.user.clone(),
            capacity: self.resources.to_resources(&format!("host {}", self.name))?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub cpu: u32,
    pub memory: ByteSize,
    #[serde(default = "zero_bytes")]
    pub disk: ByteSize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupScalingConfig {
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    /// Step applied by the standalone scaling policy.
    #[serde(default = "default_increment")]
    pub increment: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    #[serde(default = "default_high_water")]
    pub high_water: f64,
    #[serde(default = "default_low_water")]
    pub low_water: f64,
}

fn default_increment() -> u32 {
    1
}

fn default_cooldown() -> String {
    "5m".to_string()
}

fn default_high_water() -> f64 {
    0.8
}

fn default_low_water() -> f64 {
    0.3
}

impl GroupScalingConfig {
    pub fn cooldown(&self) -> Duration {
        parse_duration(&self.cooldown).unwrap_or(Duration::from_secs(300))
    }
}

/// `[groups.<name>.networking]`: how instances are attached and addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkingConfig {
    /// Libvirt network the NIC is attached to.
    #[serde(default = "default_network")]
    pub network: String,
    pub dhcp: bool,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet: Option<Ipv4Addr>,
    /// `first-last`. The DHCP pool, or the pool static addresses come from.
    #[serde(default)]
    pub address_range: Option<AddressRange>,
}

fn default_network() -> String {
    "default".to_string()
}

impl NetworkingConfig {
    fn to_template(&self, owner: &str, max_size: u32) -> Result<NetworkTemplate, ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(format!("{owner}: networking: {msg}"));
        let net = NetworkTemplate {
            network: self.network.clone(),
            dhcp: self.dhcp,
            gateway: self.gateway,
            netmask: self.netmask,
            subnet: self.subnet,
            address_range: self.address_range,
            address: None,
        };
        if net.network.is_empty() {
            return Err(invalid("network name is empty".into()));
        }
        let Some(range) = net.address_range else {
            return Err(invalid("address_range is required".into()));
        };
        if let Some(mask) = net.netmask
            && net.prefix_len().is_none()
        {
            return Err(invalid(format!("netmask {mask} is not contiguous")));
        }

        if !net.dhcp {
            let (Some(gateway), Some(_)) = (net.gateway, net.netmask) else {
                return Err(invalid("static addressing needs gateway and netmask".into()));
            };
            if range.contains(gateway) {
                return Err(invalid(format!("gateway {gateway} lies inside address_range {range}")));
            }
            if range.size() < u64::from(max_size) {
                return Err(invalid(format!(
                    "address_range {range} holds {} addresses, fewer than max size {max_size}",
                    range.size()
                )));
            }
        }

        if let (Some(subnet), Some(mask)) = (net.subnet, net.netmask) {
            let mask = u32::from(mask);
            let inside = |a: Ipv4Addr| u32::from(a) & mask == u32::from(subnet) & mask;
            for addr in [Some(range.first), Some(range.last), net.gateway].into_iter().flatten() {
                if !inside(addr) {
                    return Err(invalid(format!("{addr} is outside subnet {subnet}")));
                }
            }
        }
        Ok(net)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub image: String,
    pub template: TemplateConfig,
    /// Hosts this group may be placed on. Empty means every host.
    #[serde(default)]
    pub hosts: Vec<String>,
    pub scaling: GroupScalingConfig,
    #[serde(default)]
    pub cloud_init: Option<CloudInit>,
    #[serde(default)]
    pub networking: Option<NetworkingConfig>,
    /// DNS domain for instance FQDNs (`<instance id>.<domain_name>`).
    #[serde(default)]
    pub domain_name: Option<String>,
}

impl GroupConfig {
    pub fn template(&self, group: &str) -> Result<InstanceTemplate, ConfigError> {
        let owner = format!("group {group}");
        let memory = self.template.memory.as_bytes().ok_or_else(|| {
            ConfigError::Invalid(format!("{owner}: unreadable memory size"))
        })?;
        let disk = self
            .template
            .disk
            .as_bytes()
            .ok_or_else(|| ConfigError::Invalid(format!("{owner}: unreadable disk size")))?;
        if let Some(domain) = &self.domain_name
            && !is_dns_name(domain)
        {
            return Err(ConfigError::Invalid(format!(
                "{owner}: domain_name {domain:?} is not a DNS name"
            )));
        }
        let network = self
            .networking
            .as_ref()
            .map(|n| n.to_template(&owner, self.scaling.max))
            .transpose()?;

        Ok(InstanceTemplate {
            image: self.image.clone(),
            resources: Resources::new(self.template.cpu, memory, disk),
            cloud_init: self.cloud_init.clone(),
            network,
            domain_name: self.domain_name.clone(),
        })
    }
}

fn is_dns_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl ControllerConfig {
    /// Read, expand `${VAR}` references, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(content);
        let config: ControllerConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reconciliation;
        for (field, value) in [
            ("reconciliation.interval", &r.interval),
            ("reconciliation.backoff_base", &r.backoff_base),
            ("reconciliation.backoff_max", &r.backoff_max),
            ("reconciliation.gateway_timeout", &r.gateway_timeout),
            ("reconciliation.exhaustion_alert_after", &r.exhaustion_alert_after),
            ("health.interval", &self.health.interval),
            ("health.timeout", &self.health.timeout),
            ("metrics.interval", &self.metrics.interval),
            ("metrics.host_timeout", &self.metrics.host_timeout),
        ] {
            check_duration(field, value)?;
        }
        if r.host_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "reconciliation.host_concurrency must be at least 1".to_string(),
            ));
        }
        if self.metrics.trailing == 0 {
            return Err(ConfigError::Invalid(
                "metrics.trailing must be at least 1".to_string(),
            ));
        }

        let mut host_names = HashSet::new();
        for host in &self.hosts {
            if !host_names.insert(host.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate host name: {}",
                    host.name
                )));
            }
            host.to_spec()?;
        }

        for (name, group) in &self.groups {
            let s = &group.scaling;
            if s.min > s.max {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: min {} exceeds max {}",
                    s.min, s.max
                )));
            }
            if s.desired < s.min || s.desired > s.max {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: desired {} outside [{}, {}]",
                    s.desired, s.min, s.max
                )));
            }
            if s.low_water >= s.high_water {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: low_water {} must be below high_water {}",
                    s.low_water, s.high_water
                )));
            }
            check_duration(&format!("groups.{name}.scaling.cooldown"), &s.cooldown)?;
            for host in &group.hosts {
                if !host_names.contains(host.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "group {name} references unknown host {host}"
                    )));
                }
            }
            group.template(name)?;
        }
        Ok(())
    }

    /// Host specs in declaration order.
    pub fn host_specs(&self) -> Result<Vec<HostSpec>, ConfigError> {
        self.hosts.iter().map(HostConfig::to_spec).collect()
    }
}

fn check_duration(field: &str, value: &str) -> Result<(), ConfigError> {
    parse_duration(value)
        .map(|_| ())
        .ok_or_else(|| ConfigError::Invalid(format!("{field}: unreadable duration {value:?}")))
}

/// Replace `${NAME}` with the value of environment variable `NAME`.
///
/// Unknown variables are left untouched.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
