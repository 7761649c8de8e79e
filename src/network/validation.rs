//! Validation shared by both backends

use crate::error::{NetworkError, Result};
use crate::network::types::{Network, NetworkOptions, Subnet, IPAM_HOST_LOCAL};
use crate::network::util::{first_ip_in_subnet, intersects, ip_to_u128, normalize};
use ipnetwork::IpNetwork;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::LazyLock;

pub const NAME_PATTERN: &str = "[a-zA-Z0-9][a-zA-Z0-9_.-]*";

/// Kernel limit on interface names, IFNAMSIZ without the NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{}$", NAME_PATTERN)).expect("name pattern is a valid regex")
});

pub fn is_valid_name(name: &str) -> bool {
    NAME_REGEX.is_match(name)
}

/// Network names must match [`NAME_PATTERN`].
pub fn validate_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NetworkError::InvalidArgument(format!(
            "network name {} invalid: names must match {}",
            name, NAME_PATTERN
        )))
    }
}

/// Host interface names: name pattern plus kernel length limit.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if !is_valid_name(name) {
        return Err(NetworkError::InvalidArgument(format!(
            "interface name {} invalid: names must match {}",
            name, NAME_PATTERN
        )));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(NetworkError::InvalidArgument(format!(
            "interface name {} is longer than {} characters",
            name, MAX_INTERFACE_NAME_LEN
        )));
    }
    Ok(())
}

/// Checks run before any driver logic. An empty name is left for the caller
/// to generate.
pub fn validate_network_create(network: &Network, known: &HashMap<String, Network>) -> Result<()> {
    if !network.id.is_empty() {
        return Err(NetworkError::InvalidArgument(
            "ID can not be set for network create".to_string(),
        ));
    }
    if !network.name.is_empty() {
        validate_name(&network.name)?;
        if known.contains_key(&network.name) {
            return Err(NetworkError::Conflict(format!(
                "network name {} already used",
                network.name
            )));
        }
    }
    Ok(())
}

/// Normalize subnets and check gateways and lease ranges.
///
/// `used` holds subnets of other networks and host interfaces; a new subnet may
/// not intersect any of them or another subnet of the same network. When
/// `add_gateway` is set, missing gateways become the first IP of the subnet.
pub fn validate_subnets(network: &mut Network, add_gateway: bool, used: &[IpNetwork]) -> Result<()> {
    let mut seen: Vec<IpNetwork> = Vec::with_capacity(network.subnets.len());
    for subnet in network.subnets.iter_mut() {
        validate_subnet(subnet, add_gateway, used)?;
        if let Some(other) = seen.iter().find(|s| intersects(s, &subnet.subnet)) {
            return Err(NetworkError::Conflict(format!(
                "subnet {} overlaps with subnet {} of the same network",
                subnet.subnet, other
            )));
        }
        seen.push(subnet.subnet);
        if subnet.subnet.is_ipv6() {
            network.ipv6_enabled = true;
        }
    }
    Ok(())
}

fn validate_subnet(subnet: &mut Subnet, add_gateway: bool, used: &[IpNetwork]) -> Result<()> {
    subnet.subnet = normalize(subnet.subnet);
    let net = subnet.subnet;

    if let Some(other) = used.iter().find(|u| intersects(u, &net)) {
        return Err(NetworkError::Conflict(format!(
            "subnet {} is already used on the host or by another config ({})",
            net, other
        )));
    }

    match subnet.gateway {
        Some(gateway) => {
            if !net.contains(gateway) {
                return Err(NetworkError::InvalidArgument(format!(
                    "gateway ip {} not in subnet {}",
                    gateway, net
                )));
            }
        }
        None if add_gateway => subnet.gateway = Some(first_ip_in_subnet(&net)?),
        None => {}
    }

    if let Some(range) = &subnet.lease_range {
        for (label, ip) in [("start", range.start_ip), ("end", range.end_ip)] {
            if let Some(ip) = ip {
                if !net.contains(ip) {
                    return Err(NetworkError::InvalidArgument(format!(
                        "lease range {} ip {} not in subnet {}",
                        label, ip, net
                    )));
                }
            }
        }
        if let (Some(start), Some(end)) = (range.start_ip, range.end_ip) {
            if ip_to_u128(start) > ip_to_u128(end) {
                return Err(NetworkError::InvalidArgument(format!(
                    "lease range start ip {} is after end ip {}",
                    start, end
                )));
            }
        }
    }
    Ok(())
}

/// Loaded configs: gateways and lease ranges must sit inside their subnet.
pub fn validate_stored_subnets(network: &Network) -> Result<()> {
    let mut copy = network.clone();
    for subnet in copy.subnets.iter_mut() {
        validate_subnet(subnet, false, &[])?;
    }
    Ok(())
}

/// Check a setup/teardown request against the known networks and return the
/// requested networks by name.
pub fn validate_setup_options(
    namespace_path: &str,
    options: &NetworkOptions,
    known: &HashMap<String, Network>,
) -> Result<HashMap<String, Network>> {
    if namespace_path.is_empty() {
        return Err(NetworkError::InvalidArgument(
            "namespace path is empty".to_string(),
        ));
    }
    if options.container_id.is_empty() {
        return Err(NetworkError::InvalidArgument("container ID is empty".to_string()));
    }
    if options.networks.is_empty() {
        return Err(NetworkError::InvalidArgument(
            "must specify at least one network".to_string(),
        ));
    }

    let mut selected = HashMap::with_capacity(options.networks.len());
    let mut interfaces = HashSet::with_capacity(options.networks.len());
    for (name, opts) in &options.networks {
        let network = known
            .get(name)
            .ok_or_else(|| NetworkError::NoSuchNetwork(name.clone()))?;

        if opts.interface_name.is_empty() {
            return Err(NetworkError::InvalidArgument(format!(
                "interface name on network {} is empty",
                name
            )));
        }
        if !interfaces.insert(opts.interface_name.as_str()) {
            return Err(NetworkError::InvalidArgument(format!(
                "interface name {} is used more than once",
                opts.interface_name
            )));
        }
        // Other IPAM drivers get their addresses from outside the subnet list.
        let static_ips: &[IpAddr] = if network.ipam_driver() == IPAM_HOST_LOCAL {
            &opts.static_ips
        } else {
            &[]
        };
        for ip in static_ips {
            if !ip_in_network(ip, network) {
                return Err(NetworkError::InvalidArgument(format!(
                    "requested static ip {} not in any subnet on network {}",
                    ip, name
                )));
            }
        }
        if !opts.aliases.is_empty() && !network.dns_enabled {
            return Err(NetworkError::InvalidArgument(format!(
                "cannot set aliases on network {} because dns is not enabled",
                name
            )));
        }
        selected.insert(name.clone(), network.clone());
    }
    Ok(selected)
}

fn ip_in_network(ip: &IpAddr, network: &Network) -> bool {
    network.subnets.iter().any(|s| s.subnet.contains(*ip))
}
