//! BGP peer controller
//!
//! Keeps the set of running sessions in line with configuration and node
//! labels, and pushes the union of every service's advertisements to each
//! live session. A failing peer never prevents the others from converging.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use ipnet::IpNet;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::session::{Advertisement, Session, SessionError, SessionFactory, SessionParams};
use super::{ProtocolController, SpeakerError};
use crate::config::{Config, Labels, PeerConfig, Pool};

/// Default bound on dialing a single peer
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by the BGP controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BgpError {
    #[error("{} BGP sessions failed to start: {}", .0.len(), .0.join("; "))]
    SessionsFailed(Vec<String>),

    #[error("{} of {total} BGP sessions rejected advertisements: {}", .failures.len(), .failures.join("; "))]
    PushFailed { total: usize, failures: Vec<String> },

    #[error("aggregation length {0} is invalid for {1}")]
    InvalidAggregation(u8, IpAddr),
}

struct Peer {
    cfg: PeerConfig,
    session: Option<Arc<dyn Session>>,
}

#[derive(Default)]
struct BgpState {
    /// `None` until the first node update arrives
    node_labels: Option<Labels>,
    peers: Vec<Peer>,
    svc_ads: HashMap<String, Vec<Advertisement>>,
}

/// Manages BGP peerings and advertisements for the local node
pub struct BgpController {
    my_ip: IpAddr,
    factory: Arc<dyn SessionFactory>,
    open_timeout: Duration,
    state: Mutex<BgpState>,
}

impl BgpController {
    /// Create a controller announcing `my_ip` as next hop
    pub fn new(my_ip: IpAddr, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            my_ip,
            factory,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            state: Mutex::new(BgpState::default()),
        }
    }

    /// Set the per-peer dial timeout
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Apply a new peer list.
    ///
    /// Peers whose configuration is unchanged keep their session. Peers that
    /// disappeared are closed on a best-effort basis.
    pub async fn set_config(&self, cfg: &Config) -> Result<(), BgpError> {
        let mut state = self.state.lock().await;

        let mut old: Vec<Option<Peer>> = state.peers.drain(..).map(Some).collect();
        let mut peers = Vec::with_capacity(cfg.peers.len());
        for peer_cfg in &cfg.peers {
            let existing = old
                .iter_mut()
                .find(|p| p.as_ref().is_some_and(|p| &p.cfg == peer_cfg))
                .and_then(Option::take);
            peers.push(existing.unwrap_or_else(|| Peer {
                cfg: peer_cfg.clone(),
                session: None,
            }));
        }
        state.peers = peers;

        for peer in old.into_iter().flatten() {
            info!(peer = %peer.cfg.address, "Peer deconfigured, closing BGP session");
            if let Some(session) = peer.session {
                if let Err(e) = session.close().await {
                    warn!(peer = %peer.cfg.address, error = %e, "Failed to shut down BGP session");
                }
            }
        }

        self.sync_peers(&mut state).await
    }

    /// Rebuild the advertisements for `name` from its pool and push them
    pub async fn set_balancer(&self, name: &str, ip: IpAddr, pool: &Pool) -> Result<(), BgpError> {
        let ads = pool
            .bgp_advertisements
            .iter()
            .map(|template| {
                let prefix = IpNet::new(ip, template.aggregation_length)
                    .map_err(|_| BgpError::InvalidAggregation(template.aggregation_length, ip))?
                    .trunc();
                Ok(Advertisement {
                    prefix,
                    next_hop: self.my_ip,
                    local_pref: template.local_pref,
                    communities: template.communities.clone(),
                })
            })
            .collect::<Result<Vec<_>, BgpError>>()?;

        let count = ads.len();
        let mut state = self.state.lock().await;
        state.svc_ads.insert(name.to_string(), ads);
        self.update_ads(&state).await?;

        info!(service = %name, %ip, count, "Making advertisements using BGP");
        Ok(())
    }

    /// Withdraw all advertisements for `name`
    pub async fn delete_balancer(&self, name: &str, reason: &str) -> Result<(), BgpError> {
        let mut state = self.state.lock().await;
        if state.svc_ads.remove(name).is_none() {
            return Ok(());
        }
        info!(service = %name, reason, "Withdrawing BGP advertisements");
        self.update_ads(&state).await
    }

    /// Record the local node's labels, resyncing peers if they changed
    pub async fn set_node(&self, labels: &Labels) -> Result<(), BgpError> {
        let mut state = self.state.lock().await;
        if state.node_labels.as_ref() == Some(labels) {
            return Ok(());
        }
        state.node_labels = Some(labels.clone());
        info!("Node labels changed, resyncing BGP peers");
        self.sync_peers(&mut state).await
    }

    /// The aggregated set currently pushed to every session
    pub async fn advertisements(&self) -> Vec<Advertisement> {
        let state = self.state.lock().await;
        aggregate(state.svc_ads.values().flatten())
    }

    /// Endpoints with a live session
    pub async fn established(&self) -> Vec<SocketAddr> {
        let state = self.state.lock().await;
        state
            .peers
            .iter()
            .filter(|p| p.session.is_some())
            .map(|p| p.cfg.endpoint())
            .collect()
    }

    fn session_params(&self, cfg: &PeerConfig) -> SessionParams {
        SessionParams {
            endpoint: cfg.endpoint(),
            my_asn: cfg.my_asn,
            router_id: cfg.router_id.unwrap_or(self.my_ip),
            peer_asn: cfg.peer_asn,
            hold_time: cfg.hold_time,
        }
    }

    /// Bring running sessions in line with peer config and node labels.
    /// Called whenever either of those changes.
    async fn sync_peers(&self, state: &mut BgpState) -> Result<(), BgpError> {
        let labels = state.node_labels.clone().unwrap_or_default();
        let mut changed = false;
        let mut to_open = Vec::new();

        for (idx, peer) in state.peers.iter_mut().enumerate() {
            let should_run = peer.cfg.should_run(&labels);
            match (peer.session.take(), should_run) {
                (Some(session), false) => {
                    info!(peer = %peer.cfg.address, "Peer no longer selected, stopping BGP session");
                    if let Err(e) = session.close().await {
                        warn!(peer = %peer.cfg.address, error = %e, "Failed to shut down BGP session");
                    }
                    changed = true;
                }
                (None, true) => {
                    info!(peer = %peer.cfg.address, "Peer selected, starting BGP session");
                    to_open.push((idx, self.session_params(&peer.cfg)));
                }
                (session, _) => peer.session = session,
            }
        }

        // Dial concurrently, each bounded by the open timeout
        let opens = to_open.into_iter().map(|(idx, params)| async move {
            let endpoint = params.endpoint;
            let result = match tokio::time::timeout(self.open_timeout, self.factory.open(params)).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::Timeout(endpoint)),
            };
            (idx, endpoint, result)
        });

        let mut failures = Vec::new();
        for (idx, endpoint, result) in join_all(opens).await {
            match result {
                Ok(session) => {
                    debug!(%endpoint, "BGP session established");
                    state.peers[idx].session = Some(session);
                    changed = true;
                }
                Err(e) => failures.push(format!("creating BGP session to {}: {}", endpoint, e)),
            }
        }

        let pushed = if changed {
            self.update_ads(state).await
        } else {
            Ok(())
        };

        if failures.is_empty() {
            return pushed;
        }
        for failure in &failures {
            error!("{}", failure);
        }
        if let Err(BgpError::PushFailed {
            failures: push_failures,
            ..
        }) = pushed
        {
            failures.extend(
                push_failures
                    .into_iter()
                    .map(|f| format!("pushing advertisements to {}", f)),
            );
        }
        Err(BgpError::SessionsFailed(failures))
    }

    /// Push the aggregated advertisement set to every live session
    async fn update_ads(&self, state: &BgpState) -> Result<(), BgpError> {
        let ads = aggregate(state.svc_ads.values().flatten());

        let live: Vec<(SocketAddr, Arc<dyn Session>)> = state
            .peers
            .iter()
            .filter_map(|p| p.session.clone().map(|s| (p.cfg.endpoint(), s)))
            .collect();

        let pushes = live.iter().map(|(endpoint, session)| {
            let ads = &ads;
            async move { (*endpoint, session.set(ads).await) }
        });

        let failures: Vec<String> = join_all(pushes)
            .await
            .into_iter()
            .filter_map(|(endpoint, result)| {
                result.err().map(|e| {
                    warn!(%endpoint, error = %e, "Failed to update BGP advertisements");
                    format!("{}: {}", endpoint, e)
                })
            })
            .collect();

        debug!(advertisements = ads.len(), sessions = live.len(), "Pushed BGP advertisements");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BgpError::PushFailed {
                total: live.len(),
                failures,
            })
        }
    }
}

/// Union of advertisements, merged per (prefix, next hop).
///
/// Merged routes carry every community of their sources and the highest
/// local preference among them.
pub fn aggregate<'a>(ads: impl IntoIterator<Item = &'a Advertisement>) -> Vec<Advertisement> {
    let mut merged: BTreeMap<(IpNet, IpAddr), Advertisement> = BTreeMap::new();
    for ad in ads {
        merged
            .entry((ad.prefix, ad.next_hop))
            .and_modify(|existing| {
                existing.local_pref = existing.local_pref.max(ad.local_pref);
                existing.communities.extend(ad.communities.iter().copied());
            })
            .or_insert_with(|| ad.clone());
    }
    merged.into_values().collect()
}

#[async_trait]
impl ProtocolController for BgpController {
    async fn set_config(&self, cfg: &Config) -> Result<(), SpeakerError> {
        Ok(BgpController::set_config(self, cfg).await?)
    }

    async fn set_balancer(&self, name: &str, ip: IpAddr, pool: &Pool) -> Result<(), SpeakerError> {
        Ok(BgpController::set_balancer(self, name, ip, pool).await?)
    }

    async fn delete_balancer(&self, name: &str, reason: &str) -> Result<(), SpeakerError> {
        Ok(BgpController::delete_balancer(self, name, reason).await?)
    }

    async fn set_leader(&self, _leader: bool) {}

    async fn set_node(&self, labels: &Labels) -> Result<(), SpeakerError> {
        Ok(BgpController::set_node(self, labels).await?)
    }
}
