//! Bridge and macvlan specific create logic

use crate::error::{NetworkError, Result};
use crate::network::types::{
    Network, Subnet, DRIVER_BRIDGE, IPAM_DHCP, IPAM_DRIVER_KEY, IPAM_HOST_LOCAL,
};
use crate::network::util::{free_ipv4_subnet, free_ipv6_subnet};
use crate::network::validation::validate_interface_name;
use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};

/// Candidates tried by [`free_device_name`] before giving up.
pub const MAX_DEVICE_NAME_CANDIDATES: u32 = 1_000_000;

pub const OPTION_MTU: &str = "mtu";
pub const OPTION_VLAN: &str = "vlan";
pub const OPTION_ISOLATE: &str = "isolate";
pub const OPTION_MODE: &str = "mode";

pub const MACVLAN_MODES: &[&str] = &["bridge", "private", "vepa", "passthru"];

/// First `<prefix><n>` (n >= 1) unused by bridges, network names and host links.
pub fn free_device_name(
    prefix: &str,
    networks: &HashMap<String, Network>,
    host_names: &[String],
) -> Result<String> {
    let mut used: HashSet<&str> = host_names.iter().map(String::as_str).collect();
    for network in networks.values() {
        used.insert(network.name.as_str());
        if network.driver == DRIVER_BRIDGE {
            used.insert(network.network_interface.as_str());
        }
    }

    // 0 is reserved for the default network.
    for i in 1..MAX_DEVICE_NAME_CANDIDATES {
        let candidate = format!("{}{}", prefix, i);
        if !used.contains(candidate.as_str()) {
            return Ok(candidate);
        }
    }
    Err(NetworkError::Internal(format!(
        "failed to find free device name with prefix {}",
        prefix
    )))
}

/// Assign bridge name and subnets, validate options.
pub fn create_bridge(
    network: &mut Network,
    networks: &HashMap<String, Network>,
    used_subnets: &[IpNetwork],
    host_names: &[String],
    device_prefix: &str,
) -> Result<()> {
    if network.network_interface.is_empty() {
        network.network_interface = free_device_name(device_prefix, networks, host_names)?;
    } else {
        validate_interface_name(&network.network_interface)?;
        let taken = networks
            .values()
            .any(|n| n.driver == DRIVER_BRIDGE && n.network_interface == network.network_interface);
        if taken {
            return Err(NetworkError::Conflict(format!(
                "bridge name {} already in use",
                network.network_interface
            )));
        }
    }

    validate_bridge_options(&network.options)?;

    match network.ipam_options.get(IPAM_DRIVER_KEY).map(String::as_str) {
        None | Some(IPAM_HOST_LOCAL) => {}
        Some(other) => {
            return Err(NetworkError::InvalidArgument(format!(
                "unsupported ipam driver {} for bridge network",
                other
            )))
        }
    }

    if network.subnets.is_empty() {
        network.subnets.push(Subnet::new(free_ipv4_subnet(used_subnets)?));
    }
    if network.ipv6_enabled {
        let has_v4 = network.subnets.iter().any(|s| s.subnet.is_ipv4());
        let has_v6 = network.subnets.iter().any(|s| s.subnet.is_ipv6());
        if !has_v4 {
            network.subnets.push(Subnet::new(free_ipv4_subnet(used_subnets)?));
        }
        if !has_v6 {
            network.subnets.push(Subnet::new(free_ipv6_subnet(used_subnets)?));
        }
    }

    network
        .ipam_options
        .insert(IPAM_DRIVER_KEY.to_string(), IPAM_HOST_LOCAL.to_string());
    Ok(())
}

fn validate_bridge_options(options: &HashMap<String, String>) -> Result<()> {
    for (key, value) in options {
        match key.as_str() {
            OPTION_MTU => parse_mtu(value)?,
            OPTION_VLAN => {
                let vlan: u16 = value.parse().map_err(|_| {
                    NetworkError::InvalidArgument(format!("vlan {} is not a number", value))
                })?;
                if vlan > 4094 {
                    return Err(NetworkError::InvalidArgument(format!(
                        "vlan ID {} must be between 0 and 4094",
                        vlan
                    )));
                }
            }
            OPTION_ISOLATE => {
                value.parse::<bool>().map_err(|_| {
                    NetworkError::InvalidArgument(format!("isolate {} is not a boolean", value))
                })?;
            }
            _ => {
                return Err(NetworkError::InvalidArgument(format!(
                    "unsupported bridge network option {}",
                    key
                )))
            }
        }
    }
    Ok(())
}

fn parse_mtu(value: &str) -> Result<()> {
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|_| NetworkError::InvalidArgument(format!("mtu {} is not a valid number", value)))
}

/// Validate a macvlan request; the parent device lives in `network_interface`.
pub fn create_macvlan(network: &mut Network, host_names: &[String]) -> Result<()> {
    if network.internal {
        return Err(NetworkError::InvalidArgument(
            "internal is not supported with macvlan".to_string(),
        ));
    }

    if !network.network_interface.is_empty()
        && !host_names.iter().any(|n| *n == network.network_interface)
    {
        return Err(NetworkError::InvalidArgument(format!(
            "parent interface {} does not exist",
            network.network_interface
        )));
    }

    for (key, value) in &network.options {
        match key.as_str() {
            OPTION_MODE => {
                if !MACVLAN_MODES.contains(&value.as_str()) {
                    return Err(NetworkError::InvalidArgument(format!(
                        "unknown macvlan mode {}",
                        value
                    )));
                }
            }
            OPTION_MTU => parse_mtu(value)?,
            _ => {
                return Err(NetworkError::InvalidArgument(format!(
                    "unsupported macvlan network option {}",
                    key
                )))
            }
        }
    }

    let has_subnets = !network.subnets.is_empty();
    let driver = match network.ipam_options.get(IPAM_DRIVER_KEY).map(String::as_str) {
        Some(IPAM_DHCP) if has_subnets => {
            return Err(NetworkError::InvalidArgument(
                "ipam driver dhcp cannot be used with subnets".to_string(),
            ))
        }
        Some(IPAM_DHCP) => IPAM_DHCP,
        None if has_subnets => IPAM_HOST_LOCAL,
        None => IPAM_DHCP,
        Some(IPAM_HOST_LOCAL) if has_subnets => IPAM_HOST_LOCAL,
        Some(IPAM_HOST_LOCAL) => {
            return Err(NetworkError::InvalidArgument(
                "ipam driver host-local requires at least one subnet".to_string(),
            ))
        }
        Some(other) => {
            return Err(NetworkError::InvalidArgument(format!(
                "unsupported ipam driver {} for macvlan network",
                other
            )))
        }
    };
    network
        .ipam_options
        .insert(IPAM_DRIVER_KEY.to_string(), driver.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::types::DRIVER_MACVLAN;

    fn bridge(name: &str, iface: &str) -> Network {
        Network {
            name: name.to_string(),
            network_interface: iface.to_string(),
            ..Default::default()
        }
    }

    fn known(list: Vec<Network>) -> HashMap<String, Network> {
        list.into_iter().map(|n| (n.name.clone(), n)).collect()
    }

    #[test]
    fn test_free_device_name_skips_everything_used() {
        let networks = known(vec![bridge("podman", "podman0"), bridge("podman2", "br-x"), bridge("x", "podman1")]);
        let host = vec!["podman3".to_string()];
        assert_eq!(free_device_name("podman", &networks, &host).unwrap(), "podman4");
    }

    #[test]
    fn test_create_bridge_allocates_name_and_subnet() {
        let networks = known(vec![bridge("podman", "podman0")]);
        let mut network = bridge("", "");
        let used: Vec<IpNetwork> = vec!["10.88.0.0/16".parse().unwrap(), "10.89.0.0/24".parse().unwrap()];
        create_bridge(&mut network, &networks, &used, &[], "podman").unwrap();

        assert_eq!(network.network_interface, "podman1");
        assert_eq!(network.subnets.len(), 1);
        assert_eq!(network.subnets[0].subnet.to_string(), "10.89.1.0/24");
        assert_eq!(network.ipam_options.get("driver").unwrap(), "host-local");
    }

    #[test]
    fn test_create_bridge_dual_stack() {
        let mut network = bridge("dual", "");
        network.ipv6_enabled = true;
        create_bridge(&mut network, &HashMap::new(), &[], &[], "podman").unwrap();
        assert!(network.subnets.iter().any(|s| s.subnet.is_ipv4()));
        assert!(network.subnets.iter().any(|s| s.subnet.is_ipv6()));
    }

    #[test]
    fn test_create_bridge_ipv6_only_gets_ipv4() {
        let mut network = bridge("dual", "");
        network.ipv6_enabled = true;
        network.subnets.push(Subnet::new("fd00:1::/64".parse().unwrap()));
        create_bridge(&mut network, &HashMap::new(), &[], &[], "podman").unwrap();
        assert_eq!(network.subnets.len(), 2);
        assert!(network.subnets[1].subnet.is_ipv4());
    }

    #[test]
    fn test_bridge_name_in_use() {
        let networks = known(vec![bridge("podman", "podman0")]);
        let mut network = bridge("web", "podman0");
        let err = create_bridge(&mut network, &networks, &[], &[], "podman").unwrap_err();
        assert_eq!(err.to_string(), "bridge name podman0 already in use");
    }

    #[test]
    fn test_bridge_options() {
        let mut network = bridge("web", "");
        network.options.insert("mtu".to_string(), "1400".to_string());
        network.options.insert("vlan".to_string(), "5".to_string());
        network.options.insert("isolate".to_string(), "true".to_string());
        assert!(create_bridge(&mut network, &HashMap::new(), &[], &[], "podman").is_ok());

        let mut bad = bridge("bad", "");
        bad.options.insert("color".to_string(), "red".to_string());
        let err = create_bridge(&mut bad, &HashMap::new(), &[], &[], "podman").unwrap_err();
        assert!(err.to_string().contains("unsupported bridge network option"));

        let mut bad_vlan = bridge("bad", "");
        bad_vlan.options.insert("vlan".to_string(), "5000".to_string());
        assert!(create_bridge(&mut bad_vlan, &HashMap::new(), &[], &[], "podman").is_err());
    }

    fn macvlan(parent: &str) -> Network {
        Network {
            name: "mv".to_string(),
            driver: DRIVER_MACVLAN.to_string(),
            network_interface: parent.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_macvlan_internal_rejected() {
        let mut network = macvlan("");
        network.internal = true;
        let err = create_macvlan(&mut network, &[]).unwrap_err();
        assert!(err.to_string().contains("internal is not supported with macvlan"));
    }

    #[test]
    fn test_macvlan_parent_must_exist() {
        let mut network = macvlan("eth9");
        assert!(create_macvlan(&mut network, &["eth0".to_string()]).is_err());

        let mut network = macvlan("eth0");
        create_macvlan(&mut network, &["eth0".to_string()]).unwrap();
        assert_eq!(network.ipam_options.get("driver").unwrap(), "dhcp");
    }

    #[test]
    fn test_macvlan_with_subnet_uses_host_local() {
        let mut network = macvlan("");
        network.subnets.push(Subnet::new("192.168.1.0/24".parse().unwrap()));
        network.options.insert("mode".to_string(), "vepa".to_string());
        create_macvlan(&mut network, &[]).unwrap();
        assert_eq!(network.ipam_options.get("driver").unwrap(), "host-local");

        let mut bad_mode = macvlan("");
        bad_mode.options.insert("mode".to_string(), "weird".to_string());
        assert!(create_macvlan(&mut bad_mode, &[]).is_err());
    }
}
