//! Driver independent network create pipeline

use crate::error::{NetworkError, Result};
use crate::network::bridge::{create_bridge, create_macvlan, free_device_name};
use crate::network::host::HostInterfaces;
use crate::network::types::{Network, DRIVER_BRIDGE, DRIVER_MACVLAN};
use crate::network::util::normalize;
use crate::network::validation::{validate_network_create, validate_subnets};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// What to do with a network that is both internal and DNS enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalDnsPolicy {
    /// Fail the create.
    Reject,
    /// Turn DNS off and log a warning.
    Disable,
}

impl std::str::FromStr for InternalDnsPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "disable" => Ok(Self::Disable),
            other => Err(format!(
                "invalid internal dns policy '{}', expected 'reject' or 'disable'",
                other
            )),
        }
    }
}

/// Inputs a backend hands to [`prepare_network`].
pub struct CreateContext<'a> {
    pub networks: &'a HashMap<String, Network>,
    pub host: &'a dyn HostInterfaces,
    /// Bridge device prefix, e.g. `podman` for podman1, podman2...
    pub device_prefix: &'a str,
    pub dns_policy: InternalDnsPolicy,
}

/// Validate and complete a create request. The id and creation time are left
/// to the backend.
pub fn prepare_network(mut network: Network, ctx: &CreateContext<'_>) -> Result<Network> {
    validate_network_create(&network, ctx.networks)?;

    let host_names = ctx.host.interface_names()?;

    if network.name.is_empty() {
        let name = free_device_name(ctx.device_prefix, ctx.networks, &host_names)?;
        if network.driver == DRIVER_BRIDGE && network.network_interface.is_empty() {
            network.network_interface = name.clone();
        }
        network.name = name;
    }

    let used = match network.driver.as_str() {
        DRIVER_BRIDGE => {
            let used = used_subnets(ctx.networks, ctx.host)?;
            create_bridge(
                &mut network,
                ctx.networks,
                &used,
                &host_names,
                ctx.device_prefix,
            )?;
            used
        }
        DRIVER_MACVLAN => {
            create_macvlan(&mut network, &host_names)?;
            Vec::new()
        }
        other => {
            return Err(NetworkError::InvalidArgument(format!(
                "unsupported driver {}",
                other
            )))
        }
    };

    if network.internal && network.dns_enabled {
        match ctx.dns_policy {
            InternalDnsPolicy::Reject => {
                return Err(NetworkError::InvalidArgument(
                    "cannot set internal and dns_enabled on the same network".to_string(),
                ))
            }
            InternalDnsPolicy::Disable => {
                warn!(
                    network = %network.name,
                    "dns is not supported on internal networks, disabling dns"
                );
                network.dns_enabled = false;
            }
        }
    }

    let add_gateway = !network.internal || network.dns_enabled;
    validate_subnets(&mut network, add_gateway, &used)?;
    Ok(network)
}

/// Subnets of all known networks plus those on live host interfaces.
pub fn used_subnets(
    networks: &HashMap<String, Network>,
    host: &dyn HostInterfaces,
) -> Result<Vec<IpNetwork>> {
    let mut used: Vec<IpNetwork> = networks
        .values()
        .flat_map(|n| n.subnets.iter().map(|s| normalize(s.subnet)))
        .collect();
    used.extend(host.used_subnets()?);
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::host::testing::FakeHost;
    use crate::network::types::Subnet;
    use crate::network::util::intersects;

    fn ctx<'a>(
        networks: &'a HashMap<String, Network>,
        host: &'a FakeHost,
        policy: InternalDnsPolicy,
    ) -> CreateContext<'a> {
        CreateContext {
            networks,
            host,
            device_prefix: "podman",
            dns_policy: policy,
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("reject".parse::<InternalDnsPolicy>().unwrap(), InternalDnsPolicy::Reject);
        assert_eq!("disable".parse::<InternalDnsPolicy>().unwrap(), InternalDnsPolicy::Disable);
        assert!("maybe".parse::<InternalDnsPolicy>().is_err());
    }

    #[test]
    fn test_generated_name_used_as_interface() {
        let networks = HashMap::new();
        let host = FakeHost::with(&["lo", "eth0", "podman1"], &["192.168.1.0/24"]);
        let network = prepare_network(Network::default(), &ctx(&networks, &host, InternalDnsPolicy::Reject)).unwrap();
        assert_eq!(network.name, "podman2");
        assert_eq!(network.network_interface, "podman2");
        assert_eq!(network.subnets[0].subnet.to_string(), "10.89.0.0/24");
        assert_eq!(network.subnets[0].gateway.unwrap().to_string(), "10.89.0.1");
    }

    #[test]
    fn test_host_subnets_are_avoided() {
        let networks = HashMap::new();
        let host = FakeHost::with(&[], &["10.89.0.0/24", "10.89.1.0/24"]);
        let network = prepare_network(Network::default(), &ctx(&networks, &host, InternalDnsPolicy::Reject)).unwrap();
        for used in host.used_subnets().unwrap() {
            assert!(!intersects(&used, &network.subnets[0].subnet));
        }
    }

    #[test]
    fn test_internal_dns_reject_and_disable() {
        let networks = HashMap::new();
        let host = FakeHost::default();
        let request = Network {
            name: "int".to_string(),
            internal: true,
            dns_enabled: true,
            ..Default::default()
        };

        let err = prepare_network(request.clone(), &ctx(&networks, &host, InternalDnsPolicy::Reject)).unwrap_err();
        assert!(err.to_string().contains("internal"));

        let network = prepare_network(request, &ctx(&networks, &host, InternalDnsPolicy::Disable)).unwrap();
        assert!(!network.dns_enabled);
        // internal without dns gets no gateway
        assert_eq!(network.subnets[0].gateway, None);
    }

    #[test]
    fn test_unsupported_driver() {
        let networks = HashMap::new();
        let host = FakeHost::default();
        let request = Network {
            name: "x".to_string(),
            driver: "ipvlan".to_string(),
            ..Default::default()
        };
        let err = prepare_network(request, &ctx(&networks, &host, InternalDnsPolicy::Reject)).unwrap_err();
        assert_eq!(err.to_string(), "unsupported driver ipvlan");
    }

    #[test]
    fn test_explicit_subnet_overlapping_existing_network() {
        let mut networks = HashMap::new();
        networks.insert(
            "podman".to_string(),
            Network {
                name: "podman".to_string(),
                network_interface: "podman0".to_string(),
                subnets: vec![Subnet::new("10.88.0.0/16".parse().unwrap())],
                ..Default::default()
            },
        );
        let host = FakeHost::default();
        let request = Network {
            name: "clash".to_string(),
            subnets: vec![Subnet::new("10.88.5.0/24".parse().unwrap())],
            ..Default::default()
        };
        let err = prepare_network(request, &ctx(&networks, &host, InternalDnsPolicy::Reject)).unwrap_err();
        assert!(matches!(err, NetworkError::Conflict(_)));
    }
}
