//! Live host interface queries and link removal
//!
//! Free subnet and device name searches must see networking configured outside
//! of this crate, so both backends consult the host through [`HostInterfaces`].

use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use ipnetwork::IpNetwork;
use nix::ifaddrs::getifaddrs;
use rtnetlink::new_connection;
use std::collections::BTreeSet;
use tracing::debug;

use crate::network::util::normalize;

/// Host networking state needed by the backends.
#[async_trait]
pub trait HostInterfaces: Send + Sync {
    /// Names of all interfaces currently present on the host.
    fn interface_names(&self) -> Result<Vec<String>>;

    /// Subnets assigned to host interfaces.
    fn used_subnets(&self) -> Result<Vec<IpNetwork>>;

    /// Delete the link with the given name.
    async fn remove_link(&self, name: &str) -> Result<()>;
}

/// [`HostInterfaces`] backed by getifaddrs(3) and rtnetlink.
#[derive(Debug, Default, Clone)]
pub struct SystemInterfaces;

impl SystemInterfaces {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostInterfaces for SystemInterfaces {
    fn interface_names(&self) -> Result<Vec<String>> {
        let addrs = getifaddrs()
            .map_err(|e| NetworkError::Internal(format!("failed to list host interfaces: {}", e)))?;
        let names: BTreeSet<String> = addrs.map(|ifaddr| ifaddr.interface_name).collect();
        Ok(names.into_iter().collect())
    }

    fn used_subnets(&self) -> Result<Vec<IpNetwork>> {
        let addrs = getifaddrs()
            .map_err(|e| NetworkError::Internal(format!("failed to list host addresses: {}", e)))?;

        let mut subnets = Vec::new();
        for ifaddr in addrs {
            let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
                continue;
            };

            let subnet = if let (Some(ip), Some(mask)) =
                (address.as_sockaddr_in(), netmask.as_sockaddr_in())
            {
                ipnetwork::ipv4_mask_to_prefix(mask.ip())
                    .ok()
                    .and_then(|prefix| IpNetwork::new(ip.ip().into(), prefix).ok())
            } else if let (Some(ip), Some(mask)) =
                (address.as_sockaddr_in6(), netmask.as_sockaddr_in6())
            {
                ipnetwork::ipv6_mask_to_prefix(mask.ip())
                    .ok()
                    .and_then(|prefix| IpNetwork::new(ip.ip().into(), prefix).ok())
            } else {
                None
            };

            if let Some(subnet) = subnet {
                subnets.push(normalize(subnet));
            }
        }
        Ok(subnets)
    }

    async fn remove_link(&self, name: &str) -> Result<()> {
        let (connection, handle, _) = new_connection()?;
        let task = tokio::spawn(connection);

        let result = async {
            let mut links = handle.link().get().match_name(name.to_string()).execute();
            let link = links
                .try_next()
                .await
                .map_err(|e| NetworkError::Internal(format!("failed to get link {}: {}", name, e)))?
                .ok_or_else(|| NetworkError::Internal(format!("link {} not found", name)))?;

            handle
                .link()
                .del(link.header.index)
                .execute()
                .await
                .map_err(|e| NetworkError::Internal(format!("failed to delete link {}: {}", name, e)))
        }
        .await;

        task.abort();
        if result.is_ok() {
            debug!(link = name, "removed host link");
        }
        result
    }
}
