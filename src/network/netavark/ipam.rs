//! Host-local address allocation
//!
//! Leases live in a single JSON file keyed network -> subnet -> address. Every
//! caller already holds the backend lock, so the file is read, updated and
//! written back without further locking.

use crate::error::{NetworkError, Result};
use crate::network::types::{Network, NetworkOptions, Subnet, IPAM_HOST_LOCAL};
use crate::network::util::{add_to_ip, first_ip_in_subnet, ip_to_u128, last_ip_in_subnet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IpamState {
    #[serde(default)]
    networks: BTreeMap<String, BTreeMap<String, SubnetLeases>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubnetLeases {
    /// Address to owning container ID.
    #[serde(default)]
    allocations: BTreeMap<IpAddr, String>,
    /// Last address handed out, the next search starts after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_ip: Option<IpAddr>,
}

/// Lease database stored at `<run_dir>/ipam.json`.
#[derive(Debug, Clone)]
pub struct Ipam {
    path: PathBuf,
}

impl Ipam {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lease one address per subnet of every host-local network in `options`
    /// and record them as static IPs. Nothing is written unless every
    /// network succeeds.
    pub fn allocate(
        &self,
        options: &mut NetworkOptions,
        networks: &HashMap<String, Network>,
    ) -> Result<()> {
        let mut state = self.load()?;
        let container_id = options.container_id.clone();

        for (name, opts) in options.networks.iter_mut() {
            let Some(network) = networks.get(name) else {
                return Err(NetworkError::NoSuchNetwork(name.clone()));
            };
            if network.ipam_driver() != IPAM_HOST_LOCAL {
                continue;
            }

            let subnets = state.networks.entry(name.clone()).or_default();
            for subnet in &network.subnets {
                let leases = subnets.entry(subnet.subnet.to_string()).or_default();
                let requested = opts
                    .static_ips
                    .iter()
                    .copied()
                    .find(|ip| subnet.subnet.contains(*ip));

                match requested {
                    Some(ip) => claim(leases, ip, &container_id, name)?,
                    None => {
                        let ip = match owned_address(leases, &container_id) {
                            Some(ip) => ip,
                            None => next_free(leases, subnet, name)?,
                        };
                        claim(leases, ip, &container_id, name)?;
                        opts.static_ips.push(ip);
                    }
                }
            }
        }

        self.store(&state)?;
        debug!(container = %container_id, "allocated container addresses");
        Ok(())
    }

    /// Drop every lease `container_id` holds on `networks`.
    pub fn release<'a>(
        &self,
        container_id: &str,
        networks: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let mut state = self.load()?;
        let mut changed = false;
        for name in networks {
            let Some(subnets) = state.networks.get_mut(name) else {
                continue;
            };
            for leases in subnets.values_mut() {
                let before = leases.allocations.len();
                leases.allocations.retain(|_, owner| owner != container_id);
                changed |= before != leases.allocations.len();
            }
        }
        if changed {
            self.store(&state)?;
            debug!(container = %container_id, "released container addresses");
        }
        Ok(())
    }

    /// Forget all leases of a removed network.
    pub fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.load()?;
        if state.networks.remove(name).is_some() {
            self.store(&state)?;
        }
        Ok(())
    }

    fn load(&self) -> Result<IpamState> {
        match fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| NetworkError::ConfigFile {
                path: self.path.clone(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(IpamState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, state: &IpamState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn claim(leases: &mut SubnetLeases, ip: IpAddr, container_id: &str, network: &str) -> Result<()> {
    match leases.allocations.get(&ip) {
        Some(owner) if owner != container_id => Err(NetworkError::Conflict(format!(
            "requested ip address {} on network {} is already allocated to container ID {}",
            ip, network, owner
        ))),
        _ => {
            leases.allocations.insert(ip, container_id.to_string());
            leases.last_ip = Some(ip);
            Ok(())
        }
    }
}

fn owned_address(leases: &SubnetLeases, container_id: &str) -> Option<IpAddr> {
    leases
        .allocations
        .iter()
        .find(|(_, owner)| owner.as_str() == container_id)
        .map(|(ip, _)| *ip)
}

/// Round robin over the lease range, starting after the last handed out address.
fn next_free(leases: &SubnetLeases, subnet: &Subnet, network: &str) -> Result<IpAddr> {
    let range = subnet.lease_range.clone().unwrap_or_default();
    let start = match range.start_ip {
        Some(ip) => ip,
        None => first_ip_in_subnet(&subnet.subnet)?,
    };
    let end = match range.end_ip {
        Some(ip) => ip,
        None => last_ip_in_subnet(&subnet.subnet)?,
    };
    let (start_n, end_n) = (ip_to_u128(start), ip_to_u128(end));
    let exhausted = || {
        NetworkError::Conflict(format!(
            "failed to allocate ip address on network {}: subnet {} is full",
            network, subnet.subnet
        ))
    };
    if start_n > end_n {
        return Err(exhausted());
    }

    let size = end_n - start_n + 1;
    let offset = match leases.last_ip.map(ip_to_u128) {
        Some(last) if last >= start_n && last < end_n => last - start_n + 1,
        _ => 0,
    };

    // Each skipped address is taken or the gateway, so the search is bounded
    // by the number of leases.
    let attempts = size.min(leases.allocations.len() as u128 + 2);
    for i in 0..attempts {
        let candidate = add_to_ip(start, (offset + i) % size).ok_or_else(exhausted)?;
        if Some(candidate) == subnet.gateway || leases.allocations.contains_key(&candidate) {
            continue;
        }
        return Ok(candidate);
    }
    Err(exhausted())
}
