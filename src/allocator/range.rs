//! Address enumeration helpers for pools

use std::net::IpAddr;

use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};

use crate::config::Pool;

/// Whether an address sits on a /24 boundary that some client stacks
/// mistake for a network or broadcast address.
pub fn is_buggy_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => matches!(v4.octets()[3], 0 | 255),
        IpAddr::V6(_) => false,
    }
}

/// Every address of `cidr` in ascending order, network and broadcast included
pub fn addresses(cidr: &IpNet) -> IpAddrRange {
    match cidr {
        IpNet::V4(net) => IpAddrRange::V4(Ipv4AddrRange::new(net.network(), net.broadcast())),
        IpNet::V6(net) => IpAddrRange::V6(Ipv6AddrRange::new(net.network(), net.broadcast())),
    }
}

/// Whether `pool` may hand out `ip` at all
pub fn pool_accepts(pool: &Pool, ip: &IpAddr) -> bool {
    pool.contains(ip) && !(pool.avoid_buggy_ips && is_buggy_ip(ip))
}

/// Allocation candidates of a pool: CIDRs in configured order, addresses ascending
pub fn candidates(pool: &Pool) -> impl Iterator<Item = IpAddr> + '_ {
    pool.cidrs
        .iter()
        .flat_map(addresses)
        .filter(move |ip| !(pool.avoid_buggy_ips && is_buggy_ip(ip)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[test]
    fn test_buggy_ips() {
        assert!(is_buggy_ip(&"10.0.0.0".parse().unwrap()));
        assert!(is_buggy_ip(&"10.0.3.255".parse().unwrap()));
        assert!(!is_buggy_ip(&"10.0.0.1".parse().unwrap()));
        assert!(!is_buggy_ip(&"fd00::ff".parse().unwrap()));
    }

    #[test]
    fn test_addresses_include_boundaries() {
        let ips: Vec<IpAddr> = addresses(&"10.0.0.0/30".parse().unwrap()).collect();
        assert_eq!(ips.len(), 4);
        assert_eq!(ips[0], "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(ips[3], "10.0.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_candidates_skip_buggy_when_asked() {
        let pool = Pool::new(
            "p",
            Protocol::Bgp,
            vec!["10.0.0.254/31".parse().unwrap(), "10.0.1.0/31".parse().unwrap()],
        )
        .with_avoid_buggy_ips(true);

        let ips: Vec<String> = candidates(&pool).map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.254", "10.0.1.1"]);
    }
}
