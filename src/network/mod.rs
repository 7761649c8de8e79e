//! Network backends
//!
//! Two interchangeable implementations of [`ContainerNetwork`]: CNI plugin
//! chains configured by `.conflist` files and netavark with JSON network
//! files. [`NetworkBackend`] picks one at runtime.

use crate::config::AppConfig;
use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

pub mod bridge;
pub mod cni;
pub mod create;
pub mod filters;
pub mod host;
pub mod lock;
pub mod netavark;
pub mod types;
pub mod util;
pub mod validation;

pub use cni::CniNetwork;
pub use create::InternalDnsPolicy;
pub use filters::{generate_filters, NetworkFilter};
pub use netavark::NetavarkNetwork;
pub use types::{
    LeaseRange, NetAddress, NetInterface, Network, NetworkOptions, PerNetworkOptions,
    PortMapping, StatusBlock, Subnet,
};

pub const DEFAULT_NETWORK_NAME: &str = "podman";
pub const DEFAULT_SUBNET: &str = "10.88.0.0/16";

/// Operations every backend provides.
pub trait ContainerNetwork {
    /// Validate, complete and persist a new network. Returns the stored form.
    fn network_create(&self, network: Network) -> impl Future<Output = Result<Network>> + Send;

    /// Remove by name or ID, returning the removed network's name.
    fn network_remove(&self, name_or_id: &str) -> impl Future<Output = Result<String>> + Send;

    /// Networks passing every filter; all networks when `filters` is empty.
    fn network_list(
        &self,
        filters: &[NetworkFilter],
    ) -> impl Future<Output = Result<Vec<Network>>> + Send;

    /// Look up by exact name, full ID or unique ID prefix.
    fn network_inspect(&self, name_or_id: &str) -> impl Future<Output = Result<Network>> + Send;

    /// Connect a container namespace to the requested networks.
    fn setup(
        &self,
        namespace_path: &str,
        options: &NetworkOptions,
    ) -> impl Future<Output = Result<HashMap<String, StatusBlock>>> + Send;

    /// Disconnect a container namespace from the requested networks.
    fn teardown(
        &self,
        namespace_path: &str,
        options: &NetworkOptions,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Name of the network that always exists.
    fn default_network(&self) -> &str;
}

/// Selectable backend implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Netavark,
    Cni,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Netavark => "netavark",
            BackendKind::Cni => "cni",
        }
    }

    /// Where network definitions live when not configured.
    pub fn default_config_dir(&self) -> &'static str {
        match self {
            BackendKind::Netavark => "/etc/containers/networks",
            BackendKind::Cni => "/etc/cni/net.d",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "netavark" => Ok(BackendKind::Netavark),
            "cni" => Ok(BackendKind::Cni),
            other => Err(format!(
                "invalid network backend '{}', expected 'netavark' or 'cni'",
                other
            )),
        }
    }
}

/// Backend chosen from configuration.
pub enum NetworkBackend {
    Netavark(NetavarkNetwork),
    Cni(CniNetwork),
}

impl NetworkBackend {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let default_subnet = config.default_subnet.parse().map_err(|e| {
            NetworkError::InvalidArgument(format!(
                "invalid default subnet {}: {}",
                config.default_subnet, e
            ))
        })?;
        let config_dir = PathBuf::from(config.network_config_dir());
        let timeout = Duration::from_secs(config.plugin_timeout_secs);

        match config.backend {
            BackendKind::Netavark => {
                let options = netavark::NetavarkOptions {
                    config_dir,
                    run_dir: PathBuf::from(&config.run_dir),
                    binary: PathBuf::from(&config.netavark_binary),
                    default_network: config.default_network.clone(),
                    default_subnet,
                    dns_policy: config
                        .internal_dns_conflict
                        .unwrap_or(InternalDnsPolicy::Reject),
                    timeout,
                };
                Ok(NetworkBackend::Netavark(NetavarkNetwork::new(options)))
            }
            BackendKind::Cni => {
                let options = cni::CniOptions {
                    config_dir,
                    plugin_dirs: config.cni_plugin_dirs.iter().map(PathBuf::from).collect(),
                    default_network: config.default_network.clone(),
                    default_subnet,
                    dns_policy: config
                        .internal_dns_conflict
                        .unwrap_or(InternalDnsPolicy::Disable),
                    is_machine: config.machine,
                    timeout,
                };
                Ok(NetworkBackend::Cni(CniNetwork::new(options)))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            NetworkBackend::Netavark(_) => BackendKind::Netavark,
            NetworkBackend::Cni(_) => BackendKind::Cni,
        }
    }
}

impl ContainerNetwork for NetworkBackend {
    async fn network_create(&self, network: Network) -> Result<Network> {
        match self {
            NetworkBackend::Netavark(b) => b.network_create(network).await,
            NetworkBackend::Cni(b) => b.network_create(network).await,
        }
    }

    async fn network_remove(&self, name_or_id: &str) -> Result<String> {
        match self {
            NetworkBackend::Netavark(b) => b.network_remove(name_or_id).await,
            NetworkBackend::Cni(b) => b.network_remove(name_or_id).await,
        }
    }

    async fn network_list(&self, filters: &[NetworkFilter]) -> Result<Vec<Network>> {
        match self {
            NetworkBackend::Netavark(b) => b.network_list(filters).await,
            NetworkBackend::Cni(b) => b.network_list(filters).await,
        }
    }

    async fn network_inspect(&self, name_or_id: &str) -> Result<Network> {
        match self {
            NetworkBackend::Netavark(b) => b.network_inspect(name_or_id).await,
            NetworkBackend::Cni(b) => b.network_inspect(name_or_id).await,
        }
    }

    async fn setup(
        &self,
        namespace_path: &str,
        options: &NetworkOptions,
    ) -> Result<HashMap<String, StatusBlock>> {
        match self {
            NetworkBackend::Netavark(b) => b.setup(namespace_path, options).await,
            NetworkBackend::Cni(b) => b.setup(namespace_path, options).await,
        }
    }

    async fn teardown(&self, namespace_path: &str, options: &NetworkOptions) -> Result<()> {
        match self {
            NetworkBackend::Netavark(b) => b.teardown(namespace_path, options).await,
            NetworkBackend::Cni(b) => b.teardown(namespace_path, options).await,
        }
    }

    fn default_network(&self) -> &str {
        match self {
            NetworkBackend::Netavark(b) => b.default_network(),
            NetworkBackend::Cni(b) => b.default_network(),
        }
    }
}

/// Resolve `name_or_id`: exact name first, then full ID or unique ID prefix.
pub(crate) fn find_network<'a>(
    networks: &'a HashMap<String, Network>,
    name_or_id: &str,
) -> Result<&'a Network> {
    if name_or_id.is_empty() {
        return Err(NetworkError::NoSuchNetwork(name_or_id.to_string()));
    }
    if let Some(network) = networks.get(name_or_id) {
        return Ok(network);
    }

    let mut found: Option<&Network> = None;
    for network in networks.values() {
        if network.id == name_or_id {
            return Ok(network);
        }
        if network.id.starts_with(name_or_id) {
            if found.is_some() {
                return Err(NetworkError::Ambiguous(name_or_id.to_string()));
            }
            found = Some(network);
        }
    }
    found.ok_or_else(|| NetworkError::NoSuchNetwork(name_or_id.to_string()))
}

/// Filtered copies sorted by name.
pub(crate) fn list_networks(
    networks: &HashMap<String, Network>,
    filters: &[NetworkFilter],
) -> Vec<Network> {
    let mut list: Vec<Network> = networks
        .values()
        .filter(|n| filters::matches_all(n, filters))
        .cloned()
        .collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn networks() -> HashMap<String, Network> {
        [("podman", "2f259bab93aa"), ("web", "2f11aa"), ("db", "9c00ff")]
            .iter()
            .map(|(name, id)| {
                (
                    name.to_string(),
                    Network {
                        name: name.to_string(),
                        id: id.to_string(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_find_by_name_and_id() {
        let networks = networks();
        assert_eq!(find_network(&networks, "web").unwrap().name, "web");
        assert_eq!(find_network(&networks, "9c00ff").unwrap().name, "db");
        assert_eq!(find_network(&networks, "2f25").unwrap().name, "podman");
    }

    #[test]
    fn test_find_ambiguous_prefix() {
        let networks = networks();
        let err = find_network(&networks, "2f").unwrap_err();
        assert!(matches!(err, NetworkError::Ambiguous(_)));
    }

    #[test]
    fn test_find_missing() {
        let networks = networks();
        let err = find_network(&networks, "nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to find network with name or ID nope: network not found"
        );
        assert!(find_network(&networks, "").is_err());
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let networks = networks();
        let names: Vec<String> = list_networks(&networks, &[]).into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["db", "podman", "web"]);

        let filters: Vec<NetworkFilter> = vec![Box::new(|n: &Network| n.id.starts_with("2f"))];
        assert_eq!(list_networks(&networks, &filters).len(), 2);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("cni".parse::<BackendKind>().unwrap(), BackendKind::Cni);
        assert_eq!(BackendKind::Netavark.to_string(), "netavark");
        assert!("docker".parse::<BackendKind>().is_err());
    }
}
