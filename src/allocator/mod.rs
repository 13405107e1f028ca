//! Address allocator
//!
//! Owns the pool definitions and the exclusive mapping from service key to
//! assigned address. Pure in-memory state; callers provide the locking.
//!
//! Allocation is deterministic: pools are scanned in configured order, CIDRs
//! in configured order, addresses ascending. Converging over an unchanged
//! world is therefore a no-op.

pub mod range;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use thiserror::Error;
use tracing::debug;

use crate::config::{Pool, Protocol};

pub use range::{addresses, candidates, is_buggy_ip};

/// Errors that can occur while assigning addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("{0} is not allowed in config")]
    NoMatchingPool(IpAddr),

    #[error("{0} is a network or broadcast-like address and pool '{1}' avoids those")]
    BuggyAddress(IpAddr, String),

    #[error("{ip} is already assigned to {owner}")]
    AlreadyAssignedElsewhere { ip: IpAddr, owner: String },

    #[error("no available IPs in any auto-assign pool")]
    PoolsExhausted,

    #[error("unknown pool '{0}'")]
    UnknownPool(String),

    #[error("no available IPs in pool '{0}'")]
    PoolExhausted(String),

    #[error("invalid pool set: {0}")]
    InvalidPools(String),

    #[error("{ip} was assigned from {was}, which no longer covers it with the same name and protocol")]
    PoolChanged { ip: IpAddr, was: String },
}

/// An address together with the pool it was handed out from
#[derive(Debug, Clone, PartialEq, Eq)]
struct Allocation {
    ip: IpAddr,
    pool: String,
    protocol: Protocol,
}

impl Allocation {
    fn matches(&self, pool: &Pool) -> bool {
        self.pool == pool.name && self.protocol == pool.protocol
    }
}

/// Exclusive address allocator
#[derive(Debug, Default)]
pub struct Allocator {
    /// Pools in allocation order
    pools: Vec<Pool>,

    /// Service key -> assigned address and its pool at assignment time
    allocated: HashMap<String, Allocation>,

    /// Assigned address -> service key
    owners: HashMap<IpAddr, String>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool set.
    ///
    /// Existing allocations are kept even if the new pools no longer cover
    /// them; the reconciler finds those when it re-validates with `assign`.
    pub fn set_pools(&mut self, pools: Vec<Pool>) -> Result<(), AllocatorError> {
        validate_pools(&pools)?;
        debug!(pools = pools.len(), "Replacing address pools");
        self.pools = pools;
        Ok(())
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    /// Assign `ip` to `key`.
    ///
    /// Idempotent for an unchanged `(key, ip)` as long as the covering pool
    /// keeps its name and protocol. A different address previously held by
    /// `key` is released.
    pub fn assign(&mut self, key: &str, ip: IpAddr) -> Result<(), AllocatorError> {
        let pool = self
            .pool_for_ip(&ip)
            .ok_or(AllocatorError::NoMatchingPool(ip))?;
        if pool.avoid_buggy_ips && is_buggy_ip(&ip) {
            return Err(AllocatorError::BuggyAddress(ip, pool.name.clone()));
        }
        if let Some(held) = self.allocated.get(key) {
            if held.ip == ip && !held.matches(pool) {
                return Err(AllocatorError::PoolChanged {
                    ip,
                    was: format!("pool '{}' ({})", held.pool, held.protocol),
                });
            }
        }

        if let Some(owner) = self.owners.get(&ip) {
            if owner != key {
                return Err(AllocatorError::AlreadyAssignedElsewhere {
                    ip,
                    owner: owner.clone(),
                });
            }
        }

        let allocation = Allocation {
            ip,
            pool: pool.name.clone(),
            protocol: pool.protocol,
        };
        if let Some(previous) = self.allocated.insert(key.to_string(), allocation) {
            if previous.ip != ip {
                self.owners.remove(&previous.ip);
            }
        }
        self.owners.insert(ip, key.to_string());
        Ok(())
    }

    /// Release whatever `key` holds. Returns whether anything was released.
    pub fn unassign(&mut self, key: &str) -> bool {
        match self.allocated.remove(key) {
            Some(held) => {
                self.owners.remove(&held.ip);
                true
            }
            None => false,
        }
    }

    /// Allocate the first free address from any auto-assign pool
    pub fn allocate(&mut self, key: &str) -> Result<IpAddr, AllocatorError> {
        if let Some(ip) = self.current_valid(key) {
            return Ok(ip);
        }
        self.unassign(key);

        let found = self
            .pools
            .iter()
            .filter(|p| p.auto_assign)
            .find_map(|p| self.first_free(p, key));

        match found {
            Some(ip) => {
                self.assign(key, ip)?;
                Ok(ip)
            }
            None => Err(AllocatorError::PoolsExhausted),
        }
    }

    /// Allocate the first free address from the named pool, regardless of
    /// its auto-assign flag
    pub fn allocate_from_pool(&mut self, key: &str, pool: &str) -> Result<IpAddr, AllocatorError> {
        let target = self
            .pools
            .iter()
            .position(|p| p.name == pool)
            .ok_or_else(|| AllocatorError::UnknownPool(pool.to_string()))?;

        match self.current_valid(key) {
            Some(ip) if self.pools[target].contains(&ip) => return Ok(ip),
            Some(_) => {}
            None => {
                self.unassign(key);
            }
        }

        let ip = self
            .first_free(&self.pools[target], key)
            .ok_or_else(|| AllocatorError::PoolExhausted(pool.to_string()))?;
        self.assign(key, ip)?;
        Ok(ip)
    }

    /// Name of the pool currently covering `key`'s address, if it is still
    /// the pool the address was assigned from
    pub fn pool(&self, key: &str) -> Option<&str> {
        let held = self.allocated.get(key)?;
        self.pool_for_ip(&held.ip)
            .filter(|p| held.matches(p))
            .map(|p| p.name.as_str())
    }

    /// Address currently held by `key`
    pub fn ip(&self, key: &str) -> Option<IpAddr> {
        self.allocated.get(key).map(|held| held.ip)
    }

    /// Key currently holding `ip`
    pub fn owner(&self, ip: &IpAddr) -> Option<&str> {
        self.owners.get(ip).map(String::as_str)
    }

    /// Whether any pool serves the address family of `ip`
    pub fn supports_family(&self, ip: &IpAddr) -> bool {
        self.pools
            .iter()
            .flat_map(|p| p.cidrs.iter())
            .any(|cidr| cidr.network().is_ipv4() == ip.is_ipv4())
    }

    /// Number of keys holding an address
    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    fn pool_for_ip(&self, ip: &IpAddr) -> Option<&Pool> {
        self.pools.iter().find(|p| p.contains(ip))
    }

    fn current_valid(&self, key: &str) -> Option<IpAddr> {
        let held = self.allocated.get(key)?;
        let pool = self.pool_for_ip(&held.ip)?;
        (held.matches(pool) && range::pool_accepts(pool, &held.ip)).then_some(held.ip)
    }

    fn first_free(&self, pool: &Pool, key: &str) -> Option<IpAddr> {
        candidates(pool).find(|ip| match self.owners.get(ip) {
            Some(owner) => owner == key,
            None => true,
        })
    }
}

fn validate_pools(pools: &[Pool]) -> Result<(), AllocatorError> {
    let mut names = HashSet::new();
    for pool in pools {
        if !names.insert(pool.name.as_str()) {
            return Err(AllocatorError::InvalidPools(format!(
                "duplicate pool '{}'",
                pool.name
            )));
        }
    }

    let cidrs: Vec<_> = pools
        .iter()
        .flat_map(|p| p.cidrs.iter().map(move |c| (c, &p.name)))
        .collect();
    for (i, (a, pool_a)) in cidrs.iter().enumerate() {
        for (b, pool_b) in &cidrs[i + 1..] {
            if a.contains(*b) || b.contains(*a) {
                return Err(AllocatorError::InvalidPools(format!(
                    "{} ({}) overlaps {} ({})",
                    a, pool_a, b, pool_b
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn pool(name: &str, cidrs: &[&str]) -> Pool {
        Pool::new(
            name,
            Protocol::Bgp,
            cidrs.iter().map(|c| c.parse().unwrap()).collect(),
        )
    }

    fn allocator(pools: Vec<Pool>) -> Allocator {
        let mut alloc = Allocator::new();
        alloc.set_pools(pools).unwrap();
        alloc
    }

    fn assert_exclusive(alloc: &Allocator) {
        assert_eq!(alloc.allocated.len(), alloc.owners.len());
        for (key, held) in &alloc.allocated {
            assert_eq!(alloc.owners.get(&held.ip), Some(key));
        }
    }

    #[test]
    fn test_assign_is_idempotent() {
        let mut alloc = allocator(vec![pool("p", &["10.0.0.0/24"])]);

        alloc.assign("default/a", ip("10.0.0.5")).unwrap();
        alloc.assign("default/a", ip("10.0.0.5")).unwrap();

        assert_eq!(alloc.len(), 1);
        assert_eq!(alloc.ip("default/a"), Some(ip("10.0.0.5")));
        assert_exclusive(&alloc);
    }

    #[test]
    fn test_assign_errors() {
        let mut alloc = allocator(vec![
            pool("p", &["10.0.0.0/24"]),
            pool("buggy", &["10.1.0.0/24"]).with_avoid_buggy_ips(true),
        ]);

        assert_eq!(
            alloc.assign("a", ip("192.168.0.1")),
            Err(AllocatorError::NoMatchingPool(ip("192.168.0.1")))
        );

        alloc.assign("a", ip("10.0.0.1")).unwrap();
        assert_eq!(
            alloc.assign("b", ip("10.0.0.1")),
            Err(AllocatorError::AlreadyAssignedElsewhere {
                ip: ip("10.0.0.1"),
                owner: "a".to_string()
            })
        );

        assert!(matches!(
            alloc.assign("b", ip("10.1.0.255")),
            Err(AllocatorError::BuggyAddress(..))
        ));
    }

    #[test]
    fn test_assign_moves_key() {
        let mut alloc = allocator(vec![pool("p", &["10.0.0.0/24"])]);

        alloc.assign("a", ip("10.0.0.1")).unwrap();
        alloc.assign("a", ip("10.0.0.2")).unwrap();

        assert_eq!(alloc.owner(&ip("10.0.0.1")), None);
        alloc.assign("b", ip("10.0.0.1")).unwrap();
        assert_exclusive(&alloc);
    }

    #[test]
    fn test_unassign() {
        let mut alloc = allocator(vec![pool("p", &["10.0.0.0/24"])]);

        alloc.assign("a", ip("10.0.0.1")).unwrap();
        assert!(alloc.unassign("a"));
        assert!(!alloc.unassign("a"));
        assert!(alloc.is_empty());
        assert_eq!(alloc.pool("a"), None);
    }

    #[test]
    fn test_allocate_scenario() {
        let mut alloc = allocator(vec![pool("pool1", &["10.20.0.0/16"])]);

        assert_eq!(alloc.allocate("svcA").unwrap(), ip("10.20.0.0"));
        assert_eq!(alloc.allocate("svcB").unwrap(), ip("10.20.0.1"));
        assert!(alloc.unassign("svcA"));
        assert_eq!(alloc.allocate("svcC").unwrap(), ip("10.20.0.0"));
        assert_eq!(alloc.pool("svcC"), Some("pool1"));
        assert_exclusive(&alloc);
    }

    #[test]
    fn test_allocate_avoids_buggy_ips() {
        let mut alloc =
            allocator(vec![pool("pool1", &["10.20.0.0/16"]).with_avoid_buggy_ips(true)]);
        assert_eq!(alloc.allocate("svcA").unwrap(), ip("10.20.0.1"));

        let mut alloc = allocator(vec![pool("p", &["10.0.0.0/24"]).with_avoid_buggy_ips(true)]);
        for n in 0..254 {
            let got = alloc.allocate(&format!("svc-{}", n)).unwrap();
            assert_ne!(got, ip("10.0.0.0"));
            assert_ne!(got, ip("10.0.0.255"));
        }
        assert_eq!(alloc.allocate("overflow"), Err(AllocatorError::PoolsExhausted));
    }

    #[test]
    fn test_allocate_is_deterministic() {
        let pools = vec![pool("a", &["10.0.0.8/30"]), pool("b", &["10.0.1.0/30"])];
        let mut first = allocator(pools.clone());
        let mut second = allocator(pools);

        for key in ["x", "y", "z", "w", "v"] {
            assert_eq!(first.allocate(key), second.allocate(key));
        }
        // Same key again returns what it already holds
        assert_eq!(first.allocate("x").unwrap(), ip("10.0.0.8"));
        // Spilled over into the second pool in order
        assert_eq!(first.ip("v"), Some(ip("10.0.1.0")));
    }

    #[test]
    fn test_exhaustion_keeps_prior_allocations() {
        let mut alloc = allocator(vec![pool("p", &["10.0.0.0/31"])]);

        let a = alloc.allocate("a").unwrap();
        let b = alloc.allocate("b").unwrap();
        assert_eq!(alloc.allocate("c"), Err(AllocatorError::PoolsExhausted));

        assert_eq!(alloc.ip("a"), Some(a));
        assert_eq!(alloc.ip("b"), Some(b));
        assert_eq!(alloc.ip("c"), None);
        assert_exclusive(&alloc);
    }

    #[test]
    fn test_allocate_skips_manual_pools() {
        let mut alloc = allocator(vec![
            pool("manual", &["10.0.0.0/24"]).with_auto_assign(false),
            pool("auto", &["10.1.0.0/24"]),
        ]);

        assert_eq!(alloc.allocate("a").unwrap(), ip("10.1.0.0"));
        assert_eq!(
            alloc.allocate_from_pool("b", "manual").unwrap(),
            ip("10.0.0.0")
        );
    }

    #[test]
    fn test_allocate_from_pool_errors() {
        let mut alloc = allocator(vec![pool("tiny", &["10.0.0.0/32"])]);

        assert_eq!(
            alloc.allocate_from_pool("a", "nope"),
            Err(AllocatorError::UnknownPool("nope".to_string()))
        );
        alloc.allocate_from_pool("a", "tiny").unwrap();
        assert_eq!(
            alloc.allocate_from_pool("b", "tiny"),
            Err(AllocatorError::PoolExhausted("tiny".to_string()))
        );
    }

    #[test]
    fn test_allocate_from_pool_moves_between_pools() {
        let mut alloc = allocator(vec![pool("a", &["10.0.0.0/24"]), pool("b", &["10.1.0.0/24"])]);

        alloc.allocate("svc").unwrap();
        assert_eq!(alloc.pool("svc"), Some("a"));

        assert_eq!(alloc.allocate_from_pool("svc", "b").unwrap(), ip("10.1.0.0"));
        assert_eq!(alloc.pool("svc"), Some("b"));
        assert_eq!(alloc.owner(&ip("10.0.0.0")), None);
    }

    #[test]
    fn test_set_pools_keeps_allocations() {
        let mut alloc = allocator(vec![pool("a", &["10.0.0.0/24"])]);
        alloc.assign("svc", ip("10.0.0.7")).unwrap();

        alloc
            .set_pools(vec![pool("a", &["10.0.0.0/24"]), pool("b", &["10.1.0.0/24"])])
            .unwrap();
        assert_eq!(alloc.pool("svc"), Some("a"));

        // Pool removed: allocation stays until re-validated
        alloc.set_pools(vec![pool("b", &["10.1.0.0/24"])]).unwrap();
        assert_eq!(alloc.ip("svc"), Some(ip("10.0.0.7")));
        assert_eq!(alloc.pool("svc"), None);
        assert_eq!(
            alloc.assign("svc", ip("10.0.0.7")),
            Err(AllocatorError::NoMatchingPool(ip("10.0.0.7")))
        );
    }

    #[test]
    fn test_renamed_or_reprotocoled_pool_invalidates_assignment() {
        let mut alloc = allocator(vec![pool("a", &["10.0.0.0/24"])]);
        alloc.assign("svc", ip("10.0.0.7")).unwrap();

        // Same CIDR, new name and protocol
        alloc
            .set_pools(vec![Pool::new(
                "b",
                Protocol::Arp,
                vec!["10.0.0.0/24".parse().unwrap()],
            )])
            .unwrap();
        assert_eq!(alloc.pool("svc"), None);
        assert!(matches!(
            alloc.assign("svc", ip("10.0.0.7")),
            Err(AllocatorError::PoolChanged { .. })
        ));

        // Cleared and re-assigned, the address now belongs to the new pool
        assert!(alloc.unassign("svc"));
        alloc.assign("svc", ip("10.0.0.7")).unwrap();
        assert_eq!(alloc.pool("svc"), Some("b"));

        // Only the protocol changes
        alloc
            .set_pools(vec![Pool::new(
                "b",
                Protocol::Bgp,
                vec!["10.0.0.0/24".parse().unwrap()],
            )])
            .unwrap();
        assert!(alloc.assign("svc", ip("10.0.0.7")).is_err());
        assert_eq!(alloc.allocate("svc").unwrap(), ip("10.0.0.0"));
        assert_eq!(alloc.pool("svc"), Some("b"));
        assert_exclusive(&alloc);
    }

    #[test]
    fn test_set_pools_rejects_invalid() {
        let mut alloc = Allocator::new();

        assert!(matches!(
            alloc.set_pools(vec![pool("a", &["10.0.0.0/8"]), pool("b", &["10.1.0.0/16"])]),
            Err(AllocatorError::InvalidPools(_))
        ));
        assert!(matches!(
            alloc.set_pools(vec![pool("a", &["10.0.0.0/24"]), pool("a", &["10.1.0.0/24"])]),
            Err(AllocatorError::InvalidPools(_))
        ));
        assert!(alloc.pools().is_empty());
    }

    #[test]
    fn test_exclusivity_under_churn() {
        let mut alloc = allocator(vec![pool("p", &["10.0.0.0/29"])]);

        for round in 0..50usize {
            let key = format!("svc-{}", round % 11);
            match round % 4 {
                0 | 1 => {
                    let _ = alloc.allocate(&key);
                }
                2 => {
                    let target = ip(&format!("10.0.0.{}", round % 8));
                    let _ = alloc.assign(&key, target);
                }
                _ => {
                    alloc.unassign(&key);
                }
            }
            assert_exclusive(&alloc);
            assert!(alloc.len() <= 8);
        }
    }

    #[test]
    fn test_ipv6_family() {
        let mut alloc = allocator(vec![pool("v6", &["fd00::/126"])]);

        assert!(alloc.supports_family(&ip("fd00::1")));
        assert!(!alloc.supports_family(&ip("10.0.0.1")));
        assert_eq!(alloc.allocate("a").unwrap(), ip("fd00::"));
    }
}
