//! `.conflist` files and conversion to and from [`Network`]

use crate::error::{NetworkError, Result};
use crate::network::bridge::{OPTION_MODE, OPTION_MTU, OPTION_VLAN};
use crate::network::types::{
    LeaseRange, Network, Subnet, DRIVER_BRIDGE, DRIVER_MACVLAN, IPAM_DHCP, IPAM_DRIVER_KEY,
    IPAM_HOST_LOCAL,
};
use crate::network::util::normalize;
use crate::network::validation::{is_valid_name, validate_stored_subnets};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CNI_VERSION: &str = "1.0.0";
pub const DEFAULT_INTERFACE: &str = "cni-podman0";
pub const DNSNAME_DOMAIN: &str = "dns.podman";

const PLUGIN_BRIDGE: &str = "bridge";
const PLUGIN_MACVLAN: &str = "macvlan";
const PLUGIN_PORTMAP: &str = "portmap";
const PLUGIN_FIREWALL: &str = "firewall";
const PLUGIN_TUNING: &str = "tuning";
const PLUGIN_DNSNAME: &str = "dnsname";
const PLUGIN_MACHINE: &str = "podman-machine";

/// A CNI network configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigList {
    pub cni_version: String,
    pub name: String,
    /// Plugin configs, kept as raw JSON so unknown plugins pass through.
    pub plugins: Vec<Value>,
    #[serde(default, skip_serializing_if = "ConfigListArgs::is_empty")]
    pub args: ConfigListArgs,
}

/// Metadata without a CNI equivalent, stored under `args`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigListArgs {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub podman_labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub podman_options: HashMap<String, String>,
}

impl ConfigListArgs {
    fn is_empty(&self) -> bool {
        self.podman_labels.is_empty() && self.podman_options.is_empty()
    }
}

impl NetworkConfigList {
    /// `type` of every plugin in chain order.
    pub fn plugin_types(&self) -> Vec<&str> {
        self.plugins.iter().filter_map(plugin_type).collect()
    }
}

pub fn plugin_type(plugin: &Value) -> Option<&str> {
    plugin.get("type").and_then(Value::as_str)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgePlugin {
    bridge: String,
    #[serde(default)]
    is_gateway: bool,
    #[serde(default)]
    ip_masq: bool,
    #[serde(default)]
    hairpin_mode: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    mtu: u32,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    vlan: u16,
    #[serde(default)]
    ipam: IpamConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MacvlanPlugin {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    master: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    mode: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    mtu: u32,
    #[serde(default)]
    ipam: IpamConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpamConfig {
    #[serde(rename = "type", default)]
    plugin_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    routes: Vec<IpamRoute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ranges: Vec<Vec<IpamRange>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IpamRoute {
    dst: IpNetwork,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpamRange {
    subnet: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range_start: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range_end: Option<IpAddr>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

/// Network ID: sha256 of the name, hex encoded.
pub fn network_id(name: &str) -> String {
    format!("{:x}", Sha256::digest(name.as_bytes()))
}

/// Build the plugin chain for a validated network.
pub fn to_conflist(network: &Network, is_machine: bool) -> Result<NetworkConfigList> {
    let mut plugins = Vec::new();
    let mtu = parse_option::<u32>(&network.options, OPTION_MTU)?;

    match network.driver.as_str() {
        DRIVER_BRIDGE => {
            let bridge = BridgePlugin {
                bridge: network.network_interface.clone(),
                is_gateway: !network.internal,
                ip_masq: !network.internal,
                hairpin_mode: true,
                mtu,
                vlan: parse_option::<u16>(&network.options, OPTION_VLAN)?,
                ipam: ipam_config(network),
            };
            plugins.push(typed_plugin(PLUGIN_BRIDGE, &bridge, &["ips"])?);
            if !network.internal {
                plugins.push(json!({
                    "type": PLUGIN_PORTMAP,
                    "capabilities": {"portMappings": true},
                }));
            }
            plugins.push(json!({"type": PLUGIN_FIREWALL, "backend": ""}));
            plugins.push(json!({"type": PLUGIN_TUNING}));
        }
        DRIVER_MACVLAN => {
            let macvlan = MacvlanPlugin {
                master: network.network_interface.clone(),
                mode: network.options.get(OPTION_MODE).cloned().unwrap_or_default(),
                mtu,
                ipam: ipam_config(network),
            };
            plugins.push(typed_plugin(PLUGIN_MACVLAN, &macvlan, &["ips"])?);
        }
        other => {
            return Err(NetworkError::InvalidArgument(format!(
                "unsupported driver {}",
                other
            )))
        }
    }

    if network.dns_enabled {
        plugins.push(json!({
            "type": PLUGIN_DNSNAME,
            "domainName": DNSNAME_DOMAIN,
            "capabilities": {"aliases": true},
        }));
    }
    if is_machine {
        plugins.push(json!({
            "type": PLUGIN_MACHINE,
            "capabilities": {"portMappings": true},
        }));
    }

    Ok(NetworkConfigList {
        cni_version: CNI_VERSION.to_string(),
        name: network.name.clone(),
        plugins,
        args: ConfigListArgs {
            podman_labels: network.labels.clone(),
            podman_options: network.options.clone(),
        },
    })
}

fn typed_plugin<T: Serialize>(kind: &str, config: &T, capabilities: &[&str]) -> Result<Value> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::String(kind.to_string()));
        if !capabilities.is_empty() {
            let caps: serde_json::Map<String, Value> = capabilities
                .iter()
                .map(|c| (c.to_string(), Value::Bool(true)))
                .collect();
            map.insert("capabilities".to_string(), Value::Object(caps));
        }
    }
    Ok(value)
}

fn ipam_config(network: &Network) -> IpamConfig {
    if network.ipam_driver() == IPAM_DHCP {
        return IpamConfig {
            plugin_type: IPAM_DHCP.to_string(),
            ..Default::default()
        };
    }

    let mut routes = Vec::new();
    if !network.internal {
        for family_v4 in [true, false] {
            if network.subnets.iter().any(|s| s.subnet.is_ipv4() == family_v4) {
                let dst = if family_v4 { "0.0.0.0/0" } else { "::/0" };
                if let Ok(dst) = dst.parse() {
                    routes.push(IpamRoute { dst });
                }
            }
        }
    }

    let ranges = network
        .subnets
        .iter()
        .map(|s| {
            let range = s.lease_range.clone().unwrap_or_default();
            vec![IpamRange {
                subnet: s.subnet,
                gateway: s.gateway,
                range_start: range.start_ip,
                range_end: range.end_ip,
            }]
        })
        .collect();

    IpamConfig {
        plugin_type: IPAM_HOST_LOCAL.to_string(),
        routes,
        ranges,
    }
}

fn parse_option<T: std::str::FromStr + Default>(
    options: &HashMap<String, String>,
    key: &str,
) -> Result<T> {
    match options.get(key) {
        Some(value) => value.parse().map_err(|_| {
            NetworkError::InvalidArgument(format!("invalid {} option {:?}", key, value))
        }),
        None => Ok(T::default()),
    }
}

/// Recover the network definition from a conflist.
pub fn from_conflist(list: &NetworkConfigList, created: Option<DateTime<Utc>>) -> Result<Network> {
    let mut network = Network {
        name: list.name.clone(),
        id: network_id(&list.name),
        created,
        labels: list.args.podman_labels.clone(),
        options: list.args.podman_options.clone(),
        ..Default::default()
    };

    let first = list.plugins.first().ok_or_else(|| {
        NetworkError::InvalidArgument(format!("network {} has no plugins", list.name))
    })?;
    match plugin_type(first) {
        Some(PLUGIN_BRIDGE) => {
            let bridge: BridgePlugin = serde_json::from_value(first.clone())?;
            network.driver = DRIVER_BRIDGE.to_string();
            network.network_interface = bridge.bridge;
            network.internal = !bridge.is_gateway;
            if bridge.mtu != 0 {
                network
                    .options
                    .entry(OPTION_MTU.to_string())
                    .or_insert_with(|| bridge.mtu.to_string());
            }
            if bridge.vlan != 0 {
                network
                    .options
                    .entry(OPTION_VLAN.to_string())
                    .or_insert_with(|| bridge.vlan.to_string());
            }
            apply_ipam(&mut network, &bridge.ipam)?;
        }
        Some(PLUGIN_MACVLAN) => {
            let macvlan: MacvlanPlugin = serde_json::from_value(first.clone())?;
            network.driver = DRIVER_MACVLAN.to_string();
            network.network_interface = macvlan.master;
            if !macvlan.mode.is_empty() {
                network
                    .options
                    .entry(OPTION_MODE.to_string())
                    .or_insert(macvlan.mode);
            }
            if macvlan.mtu != 0 {
                network
                    .options
                    .entry(OPTION_MTU.to_string())
                    .or_insert_with(|| macvlan.mtu.to_string());
            }
            apply_ipam(&mut network, &macvlan.ipam)?;
        }
        other => {
            let kind = other.unwrap_or_default();
            info!(network = %list.name, plugin = kind, "unsupported CNI plugin type, network has limited support");
            network.driver = kind.to_string();
        }
    }

    network.dns_enabled = list.plugin_types().contains(&PLUGIN_DNSNAME);
    Ok(network)
}

fn apply_ipam(network: &mut Network, ipam: &IpamConfig) -> Result<()> {
    if !ipam.plugin_type.is_empty() {
        network
            .ipam_options
            .insert(IPAM_DRIVER_KEY.to_string(), ipam.plugin_type.clone());
    }
    for set in &ipam.ranges {
        for range in set {
            let lease_range = if range.range_start.is_some() || range.range_end.is_some() {
                Some(LeaseRange {
                    start_ip: range.range_start,
                    end_ip: range.range_end,
                })
            } else {
                None
            };
            network.subnets.push(Subnet {
                subnet: normalize(range.subnet),
                gateway: range.gateway,
                lease_range,
            });
        }
    }
    network.ipv6_enabled = network.subnets.iter().any(|s| s.subnet.is_ipv6());
    Ok(())
}

/// A loaded network and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedNetwork {
    pub network: Network,
    pub config: NetworkConfigList,
    /// None for the synthesized default network.
    pub path: Option<PathBuf>,
}

/// Read every `.conflist` in `dir`, skipping invalid files and duplicate names.
pub fn load_networks(dir: &Path) -> Result<HashMap<String, LoadedNetwork>> {
    let mut networks = HashMap::new();
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conflist"))
            .collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(networks),
        Err(e) => {
            return Err(NetworkError::ConfigFile {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })
        }
    };
    // libcni loads files in lexical order, the first name wins.
    entries.sort();

    for path in entries {
        match load_network(&path) {
            Ok(loaded) => {
                let name = loaded.network.name.clone();
                if networks.contains_key(&name) {
                    warn!(path = %path.display(), network = %name, "skipping config with duplicate network name");
                    continue;
                }
                debug!(path = %path.display(), network = %name, "loaded CNI network");
                networks.insert(name, loaded);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid CNI config"),
        }
    }
    Ok(networks)
}

fn load_network(path: &Path) -> Result<LoadedNetwork> {
    let invalid = |message: String| NetworkError::ConfigFile {
        path: path.to_path_buf(),
        message,
    };

    let data = fs::read(path).map_err(|e| invalid(e.to_string()))?;
    let config: NetworkConfigList =
        serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))?;
    if !is_valid_name(&config.name) {
        return Err(invalid(format!("invalid network name {:?}", config.name)));
    }

    let created = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    let network = from_conflist(&config, created).map_err(|e| invalid(e.to_string()))?;
    validate_stored_subnets(&network).map_err(|e| invalid(e.to_string()))?;

    Ok(LoadedNetwork {
        network,
        config,
        path: Some(path.to_path_buf()),
    })
}

/// Write `<dir>/<name>.conflist` atomically, returning its path.
pub fn write_config(dir: &Path, config: &NetworkConfigList) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.conflist", config.name));
    let tmp = dir.join(format!(".{}.conflist.tmp", config.name));
    fs::write(&tmp, serde_json::to_vec_pretty(config)?)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Default bridge network used when no file defines it.
pub fn default_network(name: &str, subnet: IpNetwork) -> Network {
    let mut network = Network {
        name: name.to_string(),
        id: network_id(name),
        network_interface: DEFAULT_INTERFACE.to_string(),
        created: Some(Utc::now()),
        subnets: vec![Subnet {
            gateway: crate::network::util::add_to_ip(subnet.network(), 1),
            subnet,
            lease_range: None,
        }],
        ..Default::default()
    };
    network
        .ipam_options
        .insert(IPAM_DRIVER_KEY.to_string(), IPAM_HOST_LOCAL.to_string());
    network
}
