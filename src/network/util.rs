//! Subnet arithmetic and free subnet search

use crate::error::{NetworkError, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// First candidate for new IPv4 networks, the default network owns 10.88.0.0/16.
pub const FIRST_FREE_IPV4_SUBNET: &str = "10.89.0.0/24";

/// Upper bound on /24 candidates walked by [`free_ipv4_subnet`].
pub const MAX_IPV4_SUBNET_CANDIDATES: u32 = 65_536;

/// Random prefixes tried by [`free_ipv6_subnet`].
pub const MAX_IPV6_SUBNET_ATTEMPTS: u32 = 10_000;

/// Subnet with host bits cleared.
pub fn normalize(net: IpNetwork) -> IpNetwork {
    match net {
        IpNetwork::V4(v4) => IpNetwork::V4(
            Ipv4Network::new(v4.network(), v4.prefix()).unwrap_or(v4),
        ),
        IpNetwork::V6(v6) => IpNetwork::V6(
            Ipv6Network::new(v6.network(), v6.prefix()).unwrap_or(v6),
        ),
    }
}

/// True when either subnet contains the other's network address.
pub fn intersects(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// The block directly after `net`, same prefix length.
pub fn next_subnet(net: &IpNetwork) -> Result<IpNetwork> {
    let overflow = || NetworkError::Internal(format!("subnet {} is the last of its address space", net));
    match net {
        IpNetwork::V4(v4) => {
            let block = 1u64 << (32 - u32::from(v4.prefix()));
            let next = u64::from(u32::from(v4.network())) + block;
            if next > u64::from(u32::MAX) {
                return Err(overflow());
            }
            let addr = Ipv4Addr::from(next as u32);
            Ok(IpNetwork::V4(Ipv4Network::new(addr, v4.prefix()).map_err(|e| {
                NetworkError::Internal(e.to_string())
            })?))
        }
        IpNetwork::V6(v6) => {
            let shift = 128 - u32::from(v6.prefix());
            if shift == 128 {
                return Err(overflow());
            }
            let block = 1u128 << shift;
            let next = u128::from(v6.network())
                .checked_add(block)
                .ok_or_else(overflow)?;
            Ok(IpNetwork::V6(
                Ipv6Network::new(Ipv6Addr::from(next), v6.prefix())
                    .map_err(|e| NetworkError::Internal(e.to_string()))?,
            ))
        }
    }
}

/// `ip + n`, None on overflow.
pub fn add_to_ip(ip: IpAddr, n: u128) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let value = u128::from(u32::from(v4)).checked_add(n)?;
            u32::try_from(value).ok().map(|v| IpAddr::V4(Ipv4Addr::from(v)))
        }
        IpAddr::V6(v6) => u128::from(v6)
            .checked_add(n)
            .map(|v| IpAddr::V6(Ipv6Addr::from(v))),
    }
}

/// Numeric value of an address, IPv4 widened.
pub fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128_like(template: IpAddr, value: u128) -> IpAddr {
    match template {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Last address of the subnet (IPv4 broadcast).
fn last_address(net: &IpNetwork) -> IpAddr {
    match net {
        IpNetwork::V4(v4) => IpAddr::V4(v4.broadcast()),
        IpNetwork::V6(v6) => {
            let host_bits = 128 - u32::from(v6.prefix());
            let host_mask = if host_bits == 0 {
                0
            } else {
                u128::MAX >> (128 - host_bits)
            };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6.network()) | host_mask))
        }
    }
}

/// First usable host address, network address + 1.
pub fn first_ip_in_subnet(net: &IpNetwork) -> Result<IpAddr> {
    let network = normalize(*net).network();
    if net.prefix() >= max_prefix(net) {
        return Ok(network);
    }
    add_to_ip(network, 1)
        .ok_or_else(|| NetworkError::Internal(format!("no first ip in subnet {}", net)))
}

/// Last usable host address: IPv4 broadcast - 1, last IPv6 address.
pub fn last_ip_in_subnet(net: &IpNetwork) -> Result<IpAddr> {
    let last = last_address(net);
    match net {
        IpNetwork::V4(v4) if v4.prefix() < 31 => {
            Ok(from_u128_like(last, ip_to_u128(last) - 1))
        }
        _ => Ok(last),
    }
}

fn max_prefix(net: &IpNetwork) -> u8 {
    if net.is_ipv4() {
        32
    } else {
        128
    }
}

/// Random unique local /64 (RFC 4193): fdXX:XXXX:XXXX:XXXX::/64.
pub fn random_ula_subnet() -> Result<IpNetwork> {
    let mut octets = [0u8; 16];
    rand::thread_rng().fill(&mut octets[..8]);
    octets[0] = 0xfd;
    Ipv6Network::new(Ipv6Addr::from(octets), 64)
        .map(IpNetwork::V6)
        .map_err(|e| NetworkError::Internal(e.to_string()))
}

fn overlaps_any(candidate: &IpNetwork, used: &[IpNetwork]) -> bool {
    used.iter().any(|net| intersects(candidate, net))
}

/// First /24 from [`FIRST_FREE_IPV4_SUBNET`] onwards not intersecting `used`.
pub fn free_ipv4_subnet(used: &[IpNetwork]) -> Result<IpNetwork> {
    let mut candidate: IpNetwork = FIRST_FREE_IPV4_SUBNET
        .parse()
        .map_err(|e: ipnetwork::IpNetworkError| NetworkError::Internal(e.to_string()))?;
    for _ in 0..MAX_IPV4_SUBNET_CANDIDATES {
        if !overlaps_any(&candidate, used) {
            return Ok(candidate);
        }
        candidate = next_subnet(&candidate)?;
    }
    Err(NetworkError::Conflict(format!(
        "could not find free IPv4 subnet after {} candidates",
        MAX_IPV4_SUBNET_CANDIDATES
    )))
}

/// Random ULA /64 not intersecting `used`.
pub fn free_ipv6_subnet(used: &[IpNetwork]) -> Result<IpNetwork> {
    for _ in 0..MAX_IPV6_SUBNET_ATTEMPTS {
        let candidate = random_ula_subnet()?;
        if !overlaps_any(&candidate, used) {
            return Ok(candidate);
        }
    }
    Err(NetworkError::Conflict(
        "failed to get random ipv6 subnet".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(net("10.0.0.5/24")), net("10.0.0.0/24"));
        assert_eq!(normalize(net("fd00::1/64")), net("fd00::/64"));
    }

    #[test]
    fn test_intersects() {
        assert!(intersects(&net("10.0.0.0/16"), &net("10.0.5.0/24")));
        assert!(intersects(&net("10.0.5.0/24"), &net("10.0.0.0/16")));
        assert!(!intersects(&net("10.0.0.0/24"), &net("10.0.1.0/24")));
        assert!(!intersects(&net("10.0.0.0/24"), &net("fd00::/64")));
    }

    #[test]
    fn test_next_subnet_carries() {
        assert_eq!(next_subnet(&net("10.89.0.0/24")).unwrap(), net("10.89.1.0/24"));
        assert_eq!(next_subnet(&net("10.89.255.0/24")).unwrap(), net("10.90.0.0/24"));
        assert_eq!(next_subnet(&net("10.0.0.0/16")).unwrap(), net("10.1.0.0/16"));
        assert!(next_subnet(&net("255.255.255.0/24")).is_err());
        assert_eq!(next_subnet(&net("fd00::/64")).unwrap(), net("fd00:0:0:1::/64"));
    }

    #[test]
    fn test_first_and_last_ip() {
        let v4 = net("10.88.0.0/16");
        assert_eq!(first_ip_in_subnet(&v4).unwrap().to_string(), "10.88.0.1");
        assert_eq!(last_ip_in_subnet(&v4).unwrap().to_string(), "10.88.255.254");

        let v6 = net("fd00:1:2:3::/64");
        assert_eq!(first_ip_in_subnet(&v6).unwrap().to_string(), "fd00:1:2:3::1");
        assert_eq!(
            last_ip_in_subnet(&v6).unwrap().to_string(),
            "fd00:1:2:3:ffff:ffff:ffff:ffff"
        );

        let host = net("10.0.0.7/32");
        assert_eq!(first_ip_in_subnet(&host).unwrap().to_string(), "10.0.0.7");
    }

    #[test]
    fn test_random_ula_subnet() {
        for _ in 0..32 {
            let subnet = random_ula_subnet().unwrap();
            assert_eq!(subnet.prefix(), 64);
            match subnet.ip() {
                IpAddr::V6(ip) => assert_eq!(ip.octets()[0], 0xfd),
                IpAddr::V4(_) => panic!("expected ipv6"),
            }
            assert_eq!(normalize(subnet), subnet);
        }
    }

    #[test]
    fn test_free_ipv4_subnet_skips_used() {
        assert_eq!(free_ipv4_subnet(&[]).unwrap(), net("10.89.0.0/24"));

        let used = vec![net("10.89.0.0/24"), net("10.89.1.0/24"), net("10.89.3.0/24")];
        assert_eq!(free_ipv4_subnet(&used).unwrap(), net("10.89.2.0/24"));

        let used = vec![net("10.89.0.0/16")];
        assert_eq!(free_ipv4_subnet(&used).unwrap(), net("10.90.0.0/24"));
    }

    #[test]
    fn test_free_ipv4_subnet_exhausted() {
        let used = vec![net("0.0.0.0/0")];
        assert!(free_ipv4_subnet(&used).is_err());
    }

    #[test]
    fn test_free_ipv6_subnet() {
        let used = vec![net("10.89.0.0/24")];
        let subnet = free_ipv6_subnet(&used).unwrap();
        assert!(subnet.is_ipv6());

        let everything = vec![net("fd00::/8")];
        assert!(free_ipv6_subnet(&everything).is_err());
    }
}
