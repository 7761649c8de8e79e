//! Network data model shared by both backends
//!
//! The serde layout is the netavark on-disk and wire format (snake_case); the
//! CNI backend converts to and from conflist JSON separately.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

pub const DRIVER_BRIDGE: &str = "bridge";
pub const DRIVER_MACVLAN: &str = "macvlan";

pub const IPAM_DRIVER_KEY: &str = "driver";
pub const IPAM_HOST_LOCAL: &str = "host-local";
pub const IPAM_DHCP: &str = "dhcp";
pub const IPAM_NONE: &str = "none";

/// A named, persisted network definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,

    #[serde(default)]
    pub id: String,

    #[serde(default = "default_driver")]
    pub driver: String,

    /// Host side device: the bridge for `bridge`, the parent NIC for `macvlan`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_interface: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<Subnet>,

    #[serde(default)]
    pub ipv6_enabled: bool,

    #[serde(default)]
    pub internal: bool,

    #[serde(default)]
    pub dns_enabled: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ipam_options: HashMap<String, String>,
}

fn default_driver() -> String {
    DRIVER_BRIDGE.to_string()
}

impl Default for Network {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            driver: default_driver(),
            network_interface: String::new(),
            created: None,
            subnets: Vec::new(),
            ipv6_enabled: false,
            internal: false,
            dns_enabled: false,
            labels: HashMap::new(),
            options: HashMap::new(),
            ipam_options: HashMap::new(),
        }
    }
}

impl Network {
    pub fn is_bridge(&self) -> bool {
        self.driver == DRIVER_BRIDGE
    }

    /// IPAM driver, `host-local` when not set.
    pub fn ipam_driver(&self) -> &str {
        self.ipam_options
            .get(IPAM_DRIVER_KEY)
            .map(String::as_str)
            .unwrap_or(IPAM_HOST_LOCAL)
    }
}

/// Subnet of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_range: Option<LeaseRange>,
}

impl Subnet {
    pub fn new(subnet: IpNetwork) -> Self {
        Self {
            subnet,
            gateway: None,
            lease_range: None,
        }
    }
}

/// Range inside a subnet from which addresses are leased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ip: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ip: Option<IpAddr>,
}

/// Per container, per network connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerNetworkOptions {
    pub interface_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_ips: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_mac: Option<String>,

    /// Only valid on networks with DNS enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// Port forwarded from the host into the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default)]
    pub host_ip: String,
    pub container_port: u16,
    pub host_port: u16,
    /// Comma separated list of `tcp`, `udp`, `sctp`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Number of consecutive ports, 1 for a single mapping.
    #[serde(default = "default_range")]
    pub range: u16,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_range() -> u16 {
    1
}

/// Setup/teardown request for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkOptions {
    pub container_id: String,

    #[serde(default)]
    pub container_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,

    /// Network name to connection options.
    pub networks: HashMap<String, PerNetworkOptions>,
}

/// Result of connecting a container to one network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusBlock {
    /// Interface name inside the container to its settings.
    #[serde(default)]
    pub interfaces: HashMap<String, NetInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_server_ips: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_search_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetInterface {
    #[serde(default)]
    pub mac_address: String,

    #[serde(default)]
    pub subnets: Vec<NetAddress>,
}

/// An assigned address: `ipnet` carries the interface IP, not the network address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetAddress {
    pub ipnet: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}
