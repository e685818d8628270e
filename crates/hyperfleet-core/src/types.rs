//! Domain types shared across the hyperfleet crates.
//!
//! Hosts, groups and instances are addressed by plain string IDs. The
//! resource vector is the unit of capacity accounting: every host
//! advertises one, every instance template requests one.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of a hypervisor host (unique within a controller).
pub type HostId = String;

/// Name of an autoscaling group.
pub type GroupId = String;

/// Stable instance identity, independent of any hypervisor-assigned ID.
pub type InstanceId = String;

// ── Resources ─────────────────────────────────────────────────────

/// A capacity vector over the three dimensions the planner checks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_cores: 0,
        memory_bytes: 0,
        storage_bytes: 0,
    };

    pub fn new(cpu_cores: u32, memory_bytes: u64, storage_bytes: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes,
            storage_bytes,
        }
    }

    /// True when every dimension of `self` is at most the matching one in `free`.
    pub fn fits_within(&self, free: &Resources) -> bool {
        self.cpu_cores <= free.cpu_cores
            && self.memory_bytes <= free.memory_bytes
            && self.storage_bytes <= free.storage_bytes
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_add(other.storage_bytes),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_sub(other.storage_bytes),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::ZERO
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}B disk={}B",
            self.cpu_cores, self.memory_bytes, self.storage_bytes
        )
    }
}

/// What every instance of a group looks like.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceTemplate {
    /// Disk image reference handed to the hypervisor.
    pub image: String,
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkTemplate>,
    /// DNS domain appended to the instance ID to form its FQDN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
}

impl InstanceTemplate {
    pub fn new(image: impl Into<String>, resources: Resources) -> Self {
        Self {
            image: image.into(),
            resources,
            ..Self::default()
        }
    }

    /// Whether instances boot with a NoCloud seed disk.
    pub fn wants_seed(&self) -> bool {
        self.cloud_init.is_some() || self.network.is_some() || self.domain_name.is_some()
    }

    /// Static addressing draws per-instance addresses from this range.
    pub fn static_range(&self) -> Option<AddressRange> {
        self.network.as_ref().filter(|n| !n.dhcp).and_then(|n| n.address_range)
    }
}

// ── Guest setup ───────────────────────────────────────────────────

/// Documents handed to cloud-init through the NoCloud seed. Each one
/// left unset is generated (meta-data, user-data, network-config) or
/// omitted (vendor-data).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudInit {
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub meta_data: Option<String>,
    #[serde(default)]
    pub network_data: Option<String>,
    #[serde(default)]
    pub vendor_data: Option<String>,
}

/// How an instance's NIC is attached and addressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkTemplate {
    /// Libvirt network the NIC is attached to.
    pub network: String,
    pub dhcp: bool,
    pub gateway: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Addr>,
    /// DHCP pool, or the pool static addresses are assigned from.
    pub address_range: Option<AddressRange>,
    /// This instance's static address; set per instance at placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
}

impl NetworkTemplate {
    /// Prefix length of `netmask`, if it is a contiguous mask.
    pub fn prefix_len(&self) -> Option<u32> {
        let bits = u32::from(self.netmask?);
        (bits.leading_ones() == bits.count_ones()).then(|| bits.count_ones())
    }
}

/// Inclusive IPv4 range written as `first-last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
}

impl AddressRange {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.first <= addr && addr <= self.last
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.last)) - u64::from(u32::from(self.first)) + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.first)..=u32::from(self.last)).map(Ipv4Addr::from)
    }

    /// Lowest address in the range for which `taken` is false.
    pub fn first_free(&self, taken: impl Fn(&Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        self.iter().find(|a| !taken(a))
    }
}

impl FromStr for AddressRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (first, last) = s
            .split_once('-')
            .ok_or_else(|| format!("address range {s:?} is not of the form first-last"))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| format!("address range {s:?}: {e}"))
        };
        let (first, last) = (parse(first)?, parse(last)?);
        if first > last {
            return Err(format!("address range {s:?} ends before it starts"));
        }
        Ok(Self { first, last })
    }
}

impl TryFrom<String> for AddressRange {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AddressRange> for String {
    fn from(r: AddressRange) -> Self {
        r.to_string()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

// ── Hosts ─────────────────────────────────────────────────────────

/// Transport used to reach a host's hypervisor API.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ssh,
    Tls,
}

/// Static description of a hypervisor host, as configured by the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSpec {
    pub name: HostId,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Hypervisor driver, e.g. `qemu`.
    pub hypervisor: String,
    pub user: Option<String>,
    pub capacity: Resources,
}

impl HostSpec {
    /// Connection URI in libvirt form, e.g. `qemu+ssh://root@10.0.0.5:22/system`.
    pub fn connection_uri(&self) -> String {
        match self.protocol {
            Protocol::Ssh => match &self.user {
                Some(user) => format!(
                    "{}+ssh://{}@{}:{}/system",
                    self.hypervisor, user, self.address, self.port
                ),
                None => format!(
                    "{}+ssh://{}:{}/system",
                    self.hypervisor, self.address, self.port
                ),
            },
            Protocol::Tls => format!(
                "{}+tls://{}:{}/system",
                self.hypervisor, self.address, self.port
            ),
        }
    }

    /// `address:port` for TCP probes.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Ordering the planner applies before first-fit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementOrder {
    /// Fullest eligible host first; keeps spare hosts empty.
    #[default]
    MostAllocated,
    /// Emptiest eligible host first; spreads load.
    LeastAllocated,
}

// ── Hypervisor-facing types ───────────────────────────────────────

/// Reference to a VM as the hypervisor knows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct VmRef(pub String);

impl VmRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observed state of a VM on its host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Running,
    /// Not defined on the host (never created, or already destroyed).
    Absent,
}

/// Host utilization sample, each field a fraction in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HostUtilization {
    pub cpu: f64,
    pub memory: f64,
}

impl HostUtilization {
    /// The busier of the two dimensions.
    pub fn peak(&self) -> f64 {
        self.cpu.max(self.memory)
    }
}
