//! CNI result documents

use crate::error::{NetworkError, Result};
use crate::network::types::{NetAddress, NetInterface, StatusBlock};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Result printed by a successful ADD (CNI 0.3 and later).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<CniIpConfig>,
    #[serde(default)]
    pub dns: CniDns,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    /// Namespace path for container interfaces, empty on the host side.
    #[serde(default)]
    pub sandbox: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniIpConfig {
    pub address: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into `interfaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniDns {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub search: Vec<String>,
}

/// Error document printed by a failing plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct CniErrorOutput {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

/// Container side view of a result. Host interfaces are dropped, addresses
/// without an interface index belong to `if_name`.
pub fn to_status_block(result: &CniResult, if_name: &str) -> Result<StatusBlock> {
    let mut block = StatusBlock::default();

    for ip in &result.ips {
        let name = match ip.interface {
            Some(index) => {
                let iface = result.interfaces.get(index).ok_or_else(|| {
                    NetworkError::Internal(format!(
                        "CNI result references interface index {} but has {} interfaces",
                        index,
                        result.interfaces.len()
                    ))
                })?;
                if iface.sandbox.is_empty() {
                    continue;
                }
                iface.name.as_str()
            }
            None => if_name,
        };

        let entry = block.interfaces.entry(name.to_string()).or_insert_with(|| NetInterface {
            mac_address: mac_of(result, name),
            subnets: Vec::new(),
        });
        entry.subnets.push(NetAddress {
            ipnet: ip.address,
            gateway: ip.gateway,
        });
    }

    // Sandbox interfaces without addresses, e.g. pending DHCP.
    for iface in result.interfaces.iter().filter(|i| !i.sandbox.is_empty()) {
        block
            .interfaces
            .entry(iface.name.clone())
            .or_insert_with(|| NetInterface {
                mac_address: iface.mac.clone(),
                subnets: Vec::new(),
            });
    }

    block.dns_server_ips = result
        .dns
        .nameservers
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    block.dns_search_domains = result.dns.search.clone();
    Ok(block)
}

fn mac_of(result: &CniResult, name: &str) -> String {
    result
        .interfaces
        .iter()
        .find(|i| i.name == name && !i.sandbox.is_empty())
        .map(|i| i.mac.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIDGE_RESULT: &str = r#"{
        "cniVersion": "1.0.0",
        "interfaces": [
            {"name": "cni-podman1", "mac": "de:ad:be:ef:00:01"},
            {"name": "veth1234", "mac": "de:ad:be:ef:00:02"},
            {"name": "eth0", "mac": "0a:58:0a:59:00:05", "sandbox": "/run/netns/cni-1"}
        ],
        "ips": [
            {"address": "10.89.0.5/24", "gateway": "10.89.0.1", "interface": 2},
            {"address": "fd00::5/64", "gateway": "fd00::1", "interface": 2}
        ],
        "dns": {"nameservers": ["10.89.0.1", "bogus"], "search": ["dns.podman"]}
    }"#;

    #[test]
    fn test_only_sandbox_interfaces() {
        let result: CniResult = serde_json::from_str(BRIDGE_RESULT).unwrap();
        let block = to_status_block(&result, "eth0").unwrap();

        assert_eq!(block.interfaces.len(), 1);
        let eth0 = &block.interfaces["eth0"];
        assert_eq!(eth0.mac_address, "0a:58:0a:59:00:05");
        assert_eq!(eth0.subnets.len(), 2);
        assert_eq!(eth0.subnets[0].ipnet.to_string(), "10.89.0.5/24");
        assert_eq!(eth0.subnets[1].gateway.unwrap().to_string(), "fd00::1");
        assert_eq!(block.dns_server_ips, vec!["10.89.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(block.dns_search_domains, vec!["dns.podman".to_string()]);
    }

    #[test]
    fn test_ip_without_interface_uses_requested_name() {
        let result = CniResult {
            ips: vec![CniIpConfig {
                address: "192.168.1.20/24".parse().unwrap(),
                gateway: None,
                interface: None,
            }],
            ..Default::default()
        };
        let block = to_status_block(&result, "net1").unwrap();
        assert!(block.interfaces.contains_key("net1"));
    }

    #[test]
    fn test_bad_interface_index() {
        let result = CniResult {
            ips: vec![CniIpConfig {
                address: "192.168.1.20/24".parse().unwrap(),
                gateway: None,
                interface: Some(3),
            }],
            ..Default::default()
        };
        assert!(to_status_block(&result, "eth0").is_err());
    }
}
