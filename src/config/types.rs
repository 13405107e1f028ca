//! Validated configuration values handed to the allocator and speakers.
//!
//! Everything in here is a plain comparable value: peers are matched across
//! reloads by structural equality, so no field may carry identity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Default BGP port used when a peer does not specify one
pub const DEFAULT_BGP_PORT: u16 = 179;

/// Default BGP hold time
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_secs(90);

/// Flat node label set
pub type Labels = BTreeMap<String, String>;

/// How addresses from a pool are announced to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Announced through BGP sessions to configured peers
    Bgp,
    /// Announced with gratuitous ARP by the elected leader
    Arp,
    /// Announced with unsolicited neighbor advertisements by the elected leader
    Ndp,
}

impl Protocol {
    /// Link-layer protocols announce from a single leader node
    pub fn is_layer2(&self) -> bool {
        matches!(self, Protocol::Arp | Protocol::Ndp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Bgp => "bgp",
            Protocol::Arp => "arp",
            Protocol::Ndp => "ndp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template describing how a pool's addresses are advertised over BGP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BgpAdvertisement {
    /// Prefix length the service address is rounded to
    pub aggregation_length: u8,

    /// BGP LOCAL_PREF attribute
    pub local_pref: u32,

    /// Community values, kept sorted and unique
    pub communities: BTreeSet<u32>,
}

impl BgpAdvertisement {
    /// Advertise each address as a host route with no attributes
    pub fn host(aggregation_length: u8) -> Self {
        Self {
            aggregation_length,
            local_pref: 0,
            communities: BTreeSet::new(),
        }
    }

    pub fn with_local_pref(mut self, local_pref: u32) -> Self {
        self.local_pref = local_pref;
        self
    }

    pub fn with_community(mut self, community: u32) -> Self {
        self.communities.insert(community);
        self
    }
}

/// A named set of CIDRs with its allocation and announcement policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pool {
    pub name: String,
    pub protocol: Protocol,

    /// Address ranges, scanned in this order during allocation
    pub cidrs: Vec<IpNet>,

    /// Whether the pool participates in allocation without an explicit request
    pub auto_assign: bool,

    /// Skip IPv4 addresses ending in .0 or .255
    pub avoid_buggy_ips: bool,

    /// Network the layer-2 announcements are restricted to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp_network: Option<IpNet>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bgp_advertisements: Vec<BgpAdvertisement>,
}

impl Pool {
    /// Create an auto-assigned pool with no buggy-IP avoidance
    pub fn new(name: impl Into<String>, protocol: Protocol, cidrs: Vec<IpNet>) -> Self {
        Self {
            name: name.into(),
            protocol,
            cidrs,
            auto_assign: true,
            avoid_buggy_ips: false,
            arp_network: None,
            bgp_advertisements: Vec::new(),
        }
    }

    pub fn with_auto_assign(mut self, auto_assign: bool) -> Self {
        self.auto_assign = auto_assign;
        self
    }

    pub fn with_avoid_buggy_ips(mut self, avoid: bool) -> Self {
        self.avoid_buggy_ips = avoid;
        self
    }

    pub fn with_advertisement(mut self, ad: BgpAdvertisement) -> Self {
        self.bgp_advertisements.push(ad);
        self
    }

    /// Whether any of the pool's CIDRs covers `ip`
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.cidrs.iter().any(|cidr| cidr.contains(ip))
    }
}

/// Operator of a set-based label requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single `key <op> values` requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

impl SelectorRequirement {
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Label selector restricting which nodes run a BGP session.
///
/// All `match_labels` entries and all `match_expressions` must hold. An empty
/// selector matches every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeSelector {
    pub match_labels: Labels,
    pub match_expressions: Vec<SelectorRequirement>,
}

impl NodeSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = Labels::new();
        match_labels.insert(key.into(), value.into());
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    pub fn with_expression(mut self, requirement: SelectorRequirement) -> Self {
        self.match_expressions.push(requirement);
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|req| req.matches(labels))
    }
}

/// Configuration of a single BGP peer.
///
/// Two peers are the same peer iff their configurations are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConfig {
    pub my_asn: u32,
    pub peer_asn: u32,
    pub address: IpAddr,
    pub port: u16,

    #[serde(with = "humantime_serde")]
    pub hold_time: Duration,

    /// Overrides the node address as BGP router ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<IpAddr>,

    /// Nodes allowed to run this session; empty means all nodes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_selectors: Vec<NodeSelector>,
}

impl PeerConfig {
    pub fn new(my_asn: u32, peer_asn: u32, address: IpAddr) -> Self {
        Self {
            my_asn,
            peer_asn,
            address,
            port: DEFAULT_BGP_PORT,
            hold_time: DEFAULT_HOLD_TIME,
            router_id: None,
            node_selectors: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_hold_time(mut self, hold_time: Duration) -> Self {
        self.hold_time = hold_time;
        self
    }

    pub fn with_router_id(mut self, router_id: IpAddr) -> Self {
        self.router_id = Some(router_id);
        self
    }

    pub fn with_node_selector(mut self, selector: NodeSelector) -> Self {
        self.node_selectors.push(selector);
        self
    }

    /// Address and port the session dials
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether a node carrying `labels` should run this peering
    pub fn should_run(&self, labels: &Labels) -> bool {
        self.node_selectors.is_empty() || self.node_selectors.iter().any(|s| s.matches(labels))
    }
}

/// Complete validated configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Config {
    pub peers: Vec<PeerConfig>,

    /// Pools in configured order, which is also allocation order
    pub pools: Vec<Pool>,
}

impl Config {
    /// Look up a pool by name
    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Find the pool whose CIDRs cover `ip`
    pub fn pool_for_ip(&self, ip: &IpAddr) -> Option<&Pool> {
        self.pools.iter().find(|p| p.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_match_labels() {
        let selector = NodeSelector::matching("role", "lb");

        assert!(selector.matches(&labels(&[("role", "lb"), ("zone", "a")])));
        assert!(!selector.matches(&labels(&[("role", "worker")])));
        assert!(!selector.matches(&Labels::new()));
    }

    #[test]
    fn test_selector_expressions() {
        let selector = NodeSelector::default()
            .with_expression(SelectorRequirement {
                key: "zone".to_string(),
                operator: SelectorOperator::In,
                values: vec!["a".to_string(), "b".to_string()],
            })
            .with_expression(SelectorRequirement {
                key: "drain".to_string(),
                operator: SelectorOperator::DoesNotExist,
                values: vec![],
            });

        assert!(selector.matches(&labels(&[("zone", "b")])));
        assert!(!selector.matches(&labels(&[("zone", "c")])));
        assert!(!selector.matches(&labels(&[("zone", "a"), ("drain", "true")])));
    }

    #[test]
    fn test_peer_without_selectors_always_runs() {
        let peer = PeerConfig::new(64500, 64501, "10.0.0.1".parse().unwrap());
        assert!(peer.should_run(&Labels::new()));
    }

    #[test]
    fn test_peer_selectors_are_ored() {
        let peer = PeerConfig::new(64500, 64501, "10.0.0.1".parse().unwrap())
            .with_node_selector(NodeSelector::matching("role", "lb"))
            .with_node_selector(NodeSelector::matching("role", "edge"));

        assert!(peer.should_run(&labels(&[("role", "edge")])));
        assert!(!peer.should_run(&labels(&[("role", "worker")])));
    }

    #[test]
    fn test_peer_equality_is_structural() {
        let a = PeerConfig::new(64500, 64501, "10.0.0.1".parse().unwrap()).with_port(1179);
        let b = PeerConfig::new(64500, 64501, "10.0.0.1".parse().unwrap()).with_port(1179);
        assert_eq!(a, b);
        assert_ne!(a, b.with_hold_time(Duration::from_secs(30)));
    }

    #[test]
    fn test_pool_lookup_by_ip() {
        let config = Config {
            peers: vec![],
            pools: vec![
                Pool::new("a", Protocol::Bgp, vec!["10.0.0.0/24".parse().unwrap()]),
                Pool::new("b", Protocol::Arp, vec!["10.1.0.0/24".parse().unwrap()]),
            ],
        };

        let ip: IpAddr = "10.1.0.7".parse().unwrap();
        assert_eq!(config.pool_for_ip(&ip).map(|p| p.name.as_str()), Some("b"));
        assert!(config.pool_for_ip(&"10.2.0.1".parse().unwrap()).is_none());
        assert!(config.pool("a").is_some());
    }
}
