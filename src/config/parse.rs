use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use super::types::{
    BgpAdvertisement, Config, NodeSelector, PeerConfig, Pool, Protocol, SelectorOperator,
    SelectorRequirement, DEFAULT_BGP_PORT, DEFAULT_HOLD_TIME,
};

/// Qualified label key: optional DNS-subdomain prefix, then a name segment
const LABEL_KEY_PATTERN: &str = r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$";

/// Errors produced while parsing and validating a configuration document
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("Peer #{0}: {1}")]
    InvalidPeer(usize, String),

    #[error("Address pool #{0} has no name")]
    UnnamedPool(usize),

    #[error("Duplicate address pool definition: '{0}'")]
    DuplicatePool(String),

    #[error("Address pool '{0}': {1}")]
    InvalidPool(String, String),

    #[error("CIDR {0} in pool '{1}' overlaps with {2} in pool '{3}'")]
    OverlappingCidrs(IpNet, String, IpNet, String),

    #[error("Invalid BGP community '{0}': {1}")]
    InvalidCommunity(String, String),

    #[error("Invalid node selector: {0}")]
    InvalidSelector(String),
}

// ============================================================================
// Raw document shape, as written by operators
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    peers: Vec<Option<RawPeer>>,
    #[serde(default)]
    bgp_communities: HashMap<String, String>,
    #[serde(default)]
    address_pools: Vec<Option<RawPool>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawPeer {
    my_asn: Option<u32>,
    peer_asn: Option<u32>,
    peer_address: Option<String>,
    peer_port: Option<u16>,
    #[serde(default, with = "humantime_serde")]
    hold_time: Option<Duration>,
    router_id: Option<String>,
    #[serde(default)]
    node_selectors: Vec<RawNodeSelector>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawNodeSelector {
    #[serde(default)]
    match_labels: BTreeMap<String, String>,
    #[serde(default)]
    match_expressions: Vec<RawSelectorRequirement>,
}

#[derive(Debug, Deserialize)]
struct RawSelectorRequirement {
    key: String,
    operator: String,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawPool {
    name: Option<String>,
    protocol: Option<String>,
    #[serde(default, alias = "cidr")]
    addresses: Vec<String>,
    auto_assign: Option<bool>,
    #[serde(default)]
    avoid_buggy_ips: bool,
    arp_network: Option<String>,
    #[serde(default)]
    bgp_advertisements: Vec<Option<RawAdvertisement>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawAdvertisement {
    aggregation_length: Option<u8>,
    localpref: Option<u32>,
    #[serde(default)]
    communities: Vec<String>,
}

// ============================================================================
// Pure parsing and validation (no I/O)
// ============================================================================

/// Parse and validate a YAML configuration document.
pub fn parse_config(content: &str) -> Result<Config, ParseError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }

    let raw: RawConfig =
        serde_yaml::from_str(content).map_err(|e| ParseError::Yaml(e.to_string()))?;

    let label_key = Regex::new(LABEL_KEY_PATTERN)
        .map_err(|e| ParseError::InvalidSelector(e.to_string()))?;

    let mut peers = Vec::with_capacity(raw.peers.len());
    for (index, peer) in raw.peers.into_iter().enumerate() {
        let peer = peer.ok_or_else(|| ParseError::InvalidPeer(index, "empty entry".into()))?;
        peers.push(parse_peer(index, peer, &label_key)?);
    }

    let mut communities = HashMap::with_capacity(raw.bgp_communities.len());
    for (name, literal) in &raw.bgp_communities {
        communities.insert(name.clone(), parse_community_literal(literal)?);
    }

    let mut pools: Vec<Pool> = Vec::with_capacity(raw.address_pools.len());
    let mut names = HashSet::new();
    for (index, pool) in raw.address_pools.into_iter().enumerate() {
        let pool = pool.ok_or(ParseError::UnnamedPool(index))?;
        let pool = parse_pool(index, pool, &communities)?;
        if !names.insert(pool.name.clone()) {
            return Err(ParseError::DuplicatePool(pool.name));
        }
        pools.push(pool);
    }

    check_overlaps(&pools)?;

    Ok(Config { peers, pools })
}

fn parse_peer(index: usize, raw: RawPeer, label_key: &Regex) -> Result<PeerConfig, ParseError> {
    let invalid = |msg: &str| ParseError::InvalidPeer(index, msg.to_string());

    let my_asn = raw.my_asn.ok_or_else(|| invalid("missing my-asn"))?;
    let peer_asn = raw.peer_asn.ok_or_else(|| invalid("missing peer-asn"))?;
    let address: IpAddr = raw
        .peer_address
        .as_deref()
        .ok_or_else(|| invalid("missing peer-address"))?
        .parse()
        .map_err(|_| invalid("invalid peer-address"))?;

    let hold_time = raw.hold_time.unwrap_or(DEFAULT_HOLD_TIME);
    if hold_time != Duration::ZERO && hold_time < Duration::from_secs(3) {
        return Err(invalid("hold-time must be 0 or at least 3s"));
    }

    let router_id = match raw.router_id.as_deref() {
        Some(s) => match s.parse::<IpAddr>() {
            Ok(ip @ IpAddr::V4(_)) => Some(ip),
            _ => return Err(invalid("router-id must be an IPv4 address")),
        },
        None => None,
    };

    let node_selectors = raw
        .node_selectors
        .into_iter()
        .map(|s| parse_node_selector(s, label_key))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PeerConfig {
        my_asn,
        peer_asn,
        address,
        port: raw.peer_port.unwrap_or(DEFAULT_BGP_PORT),
        hold_time,
        router_id,
        node_selectors,
    })
}

fn parse_node_selector(raw: RawNodeSelector, label_key: &Regex) -> Result<NodeSelector, ParseError> {
    for key in raw.match_labels.keys() {
        if !label_key.is_match(key) {
            return Err(ParseError::InvalidSelector(format!("bad label key '{}'", key)));
        }
    }

    let mut match_expressions = Vec::with_capacity(raw.match_expressions.len());
    for req in raw.match_expressions {
        if !label_key.is_match(&req.key) {
            return Err(ParseError::InvalidSelector(format!("bad label key '{}'", req.key)));
        }
        let operator = match req.operator.as_str() {
            "In" | "in" => SelectorOperator::In,
            "NotIn" | "notin" => SelectorOperator::NotIn,
            "Exists" | "exists" => SelectorOperator::Exists,
            "DoesNotExist" | "doesnotexist" => SelectorOperator::DoesNotExist,
            other => {
                return Err(ParseError::InvalidSelector(format!(
                    "unknown operator '{}'",
                    other
                )))
            }
        };
        let needs_values = matches!(operator, SelectorOperator::In | SelectorOperator::NotIn);
        if needs_values == req.values.is_empty() {
            return Err(ParseError::InvalidSelector(format!(
                "operator {:?} on '{}' {} values",
                operator,
                req.key,
                if needs_values { "requires" } else { "does not take" }
            )));
        }
        match_expressions.push(SelectorRequirement {
            key: req.key,
            operator,
            values: req.values,
        });
    }

    Ok(NodeSelector {
        match_labels: raw.match_labels,
        match_expressions,
    })
}

fn parse_pool(
    index: usize,
    raw: RawPool,
    communities: &HashMap<String, u32>,
) -> Result<Pool, ParseError> {
    let name = match raw.name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(ParseError::UnnamedPool(index)),
    };
    let invalid = |msg: String| ParseError::InvalidPool(name.clone(), msg);

    let protocol = match raw.protocol.as_deref() {
        Some("bgp") => Protocol::Bgp,
        Some("arp") | Some("layer2") => Protocol::Arp,
        Some("ndp") => Protocol::Ndp,
        Some(other) => return Err(invalid(format!("unknown protocol '{}'", other))),
        None => return Err(invalid("missing protocol".into())),
    };

    if raw.addresses.is_empty() {
        return Err(invalid("no addresses".into()));
    }
    let cidrs = raw
        .addresses
        .iter()
        .map(|s| {
            s.parse::<IpNet>()
                .map(|n| n.trunc())
                .map_err(|_| invalid(format!("invalid CIDR '{}'", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let arp_network = match raw.arp_network.as_deref() {
        Some(_) if !protocol.is_layer2() => {
            return Err(invalid("arp-network is only valid for arp/ndp pools".into()))
        }
        Some(s) => {
            let net = s
                .parse::<IpNet>()
                .map_err(|_| invalid(format!("invalid arp-network '{}'", s)))?
                .trunc();
            if let Some(outside) = cidrs.iter().find(|c| !net.contains(*c)) {
                return Err(invalid(format!("CIDR {} is outside arp-network {}", outside, net)));
            }
            Some(net)
        }
        None if protocol == Protocol::Arp => default_arp_network(&cidrs),
        None => None,
    };

    if protocol != Protocol::Bgp && !raw.bgp_advertisements.is_empty() {
        return Err(invalid("bgp-advertisements are only valid for bgp pools".into()));
    }

    let mut bgp_advertisements = Vec::new();
    if protocol == Protocol::Bgp {
        let default_length = cidrs[0].max_prefix_len();
        let mut templates = raw.bgp_advertisements;
        if templates.is_empty() {
            templates.push(None);
        }
        for template in templates {
            let template = template.unwrap_or_default();
            let aggregation_length = template.aggregation_length.unwrap_or(default_length);
            for cidr in &cidrs {
                if aggregation_length > cidr.max_prefix_len() {
                    return Err(invalid(format!(
                        "aggregation-length {} is too long for {}",
                        aggregation_length, cidr
                    )));
                }
                if aggregation_length < cidr.prefix_len() {
                    return Err(invalid(format!(
                        "aggregation-length {} would advertise addresses outside {}",
                        aggregation_length, cidr
                    )));
                }
            }

            let mut set = BTreeSet::new();
            for community in &template.communities {
                let value = match communities.get(community) {
                    Some(v) => *v,
                    None => parse_community_literal(community)?,
                };
                set.insert(value);
            }

            bgp_advertisements.push(BgpAdvertisement {
                aggregation_length,
                local_pref: template.localpref.unwrap_or(0),
                communities: set,
            });
        }
    }

    Ok(Pool {
        name,
        protocol,
        cidrs,
        auto_assign: raw.auto_assign.unwrap_or(true),
        avoid_buggy_ips: raw.avoid_buggy_ips,
        arp_network,
        bgp_advertisements,
    })
}

/// Smallest network of at least /24 (/64 for IPv6) covering every CIDR of
/// an ARP pool. `None` when the pool mixes address families.
fn default_arp_network(cidrs: &[IpNet]) -> Option<IpNet> {
    let first = cidrs.first()?;
    let base = match first {
        IpNet::V4(_) => 24,
        IpNet::V6(_) => 64,
    };
    let mut len = first.prefix_len().min(base);
    loop {
        let net = IpNet::new(first.network(), len).ok()?.trunc();
        if cidrs.iter().all(|c| net.contains(c)) {
            return Some(net);
        }
        if len == 0 {
            return None;
        }
        len -= 1;
    }
}

/// Parse an `asn:value` community into its 32-bit form
pub fn parse_community_literal(literal: &str) -> Result<u32, ParseError> {
    let invalid = |msg: &str| ParseError::InvalidCommunity(literal.to_string(), msg.to_string());

    let (asn, value) = literal
        .split_once(':')
        .ok_or_else(|| invalid("expected <asn>:<value> or a named community"))?;
    let asn: u16 = asn.parse().map_err(|_| invalid("asn part must fit in 16 bits"))?;
    let value: u16 = value
        .parse()
        .map_err(|_| invalid("value part must fit in 16 bits"))?;

    Ok((u32::from(asn) << 16) | u32::from(value))
}

fn check_overlaps(pools: &[Pool]) -> Result<(), ParseError> {
    let all: Vec<(&IpNet, &str)> = pools
        .iter()
        .flat_map(|p| p.cidrs.iter().map(move |c| (c, p.name.as_str())))
        .collect();

    for (i, (a, pool_a)) in all.iter().enumerate() {
        for (b, pool_b) in &all[i + 1..] {
            if a.contains(*b) || b.contains(*a) {
                return Err(ParseError::OverlappingCidrs(
                    **a,
                    pool_a.to_string(),
                    **b,
                    pool_b.to_string(),
                ));
            }
        }
    }
    Ok(())
}
