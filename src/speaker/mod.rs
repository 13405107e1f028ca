//! Per-node speaker
//!
//! Announces the addresses the reconciler publishes, using whichever protocol
//! the address's pool asks for:
//! - BGP: sessions to configured peers, see [`bgp`]
//! - ARP / NDP: leader-gated gratuitous announcements, see [`layer2`]
//!
//! [`Speaker`] routes each service to exactly one protocol controller and
//! withdraws it from the others.

pub mod bgp;
pub mod layer2;
pub mod session;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Labels, Pool, Protocol};
use crate::service::{Service, SyncState};

pub use bgp::{aggregate, BgpController, BgpError};
pub use layer2::{AnnounceError, AnnounceSender, Announcer, BurstConfig, Layer2Controller};
pub use session::{Advertisement, Session, SessionError, SessionFactory, SessionParams};

/// Errors surfaced by protocol controllers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeakerError {
    #[error(transparent)]
    Bgp(#[from] BgpError),

    #[error("{0} is outside the announcement network {1}")]
    OutsideNetwork(IpAddr, IpNet),

    #[error("no controller handles protocol {0}")]
    UnsupportedProtocol(Protocol),
}

/// One announcement protocol
#[async_trait]
pub trait ProtocolController: Send + Sync {
    async fn set_config(&self, cfg: &Config) -> Result<(), SpeakerError>;

    /// Announce `ip` for service `name`, drawn from `pool`
    async fn set_balancer(&self, name: &str, ip: IpAddr, pool: &Pool) -> Result<(), SpeakerError>;

    /// Withdraw `name`; a no-op when it is not announced
    async fn delete_balancer(&self, name: &str, reason: &str) -> Result<(), SpeakerError>;

    async fn set_leader(&self, leader: bool);

    async fn set_node(&self, labels: &Labels) -> Result<(), SpeakerError>;
}

/// Dispatches service, config, node and leadership events to protocol
/// controllers
pub struct Speaker {
    config: RwLock<Option<Config>>,
    protocols: HashMap<Protocol, Arc<dyn ProtocolController>>,
    /// Service key -> protocol currently announcing it
    announced: DashMap<String, Protocol>,
}

impl Default for Speaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Speaker {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(None),
            protocols: HashMap::new(),
            announced: DashMap::new(),
        }
    }

    /// Register the controller handling `protocol`
    pub fn with_protocol(mut self, protocol: Protocol, ctrl: Arc<dyn ProtocolController>) -> Self {
        self.protocols.insert(protocol, ctrl);
        self
    }

    /// Protocol currently announcing `key`
    pub fn announced_by(&self, key: &str) -> Option<Protocol> {
        self.announced.get(key).map(|p| *p.value())
    }

    /// Apply a new configuration to every controller.
    ///
    /// All controllers see the config even if one fails; the first failure is
    /// returned.
    pub async fn set_config(&self, cfg: &Config) -> Result<(), SpeakerError> {
        *self.config.write().await = Some(cfg.clone());

        let mut first_err = None;
        for (protocol, ctrl) in &self.protocols {
            if let Err(e) = ctrl.set_config(cfg).await {
                error!(%protocol, error = %e, "Failed to apply configuration");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handle a service update (`Some`) or deletion (`None`)
    pub async fn set_balancer(&self, key: &str, svc: Option<&Service>) -> SyncState {
        let Some(svc) = svc else {
            return self.withdraw(key, "service deleted").await;
        };

        let config = self.config.read().await;
        let Some(config) = config.as_ref() else {
            debug!(service = %key, "No configuration yet, skipping service");
            return SyncState::Success;
        };

        if !svc.is_load_balancer() {
            return self.withdraw(key, "not a load balancer").await;
        }
        let Some(ip) = svc.ingress_ip() else {
            return self.withdraw(key, "no IP allocated").await;
        };
        let Some(pool) = config.pool_for_ip(&ip) else {
            warn!(service = %key, %ip, "Published address is not in any pool, withdrawing");
            return self.withdraw(key, "address not allowed").await;
        };

        let Some(ctrl) = self.protocols.get(&pool.protocol) else {
            let e = SpeakerError::UnsupportedProtocol(pool.protocol);
            error!(service = %key, error = %e, "Cannot announce service");
            return SyncState::Error;
        };

        let previous = self.announced_by(key);
        if let Some(old) = previous.filter(|old| *old != pool.protocol) {
            if let Some(old_ctrl) = self.protocols.get(&old) {
                if let Err(e) = old_ctrl.delete_balancer(key, "protocol changed").await {
                    error!(service = %key, protocol = %old, error = %e, "Failed to withdraw service");
                    return SyncState::Error;
                }
            }
            self.announced.remove(key);
        }

        if let Err(e) = ctrl.set_balancer(key, ip, pool).await {
            error!(service = %key, %ip, protocol = %pool.protocol, error = %e, "Failed to announce service");
            return SyncState::Error;
        }
        if previous != Some(pool.protocol) {
            info!(service = %key, %ip, protocol = %pool.protocol, "Announcing service");
        }
        self.announced.insert(key.to_string(), pool.protocol);
        SyncState::Success
    }

    /// Forward new node labels to every controller
    pub async fn set_node(&self, labels: &Labels) -> Result<(), SpeakerError> {
        let mut first_err = None;
        for (protocol, ctrl) in &self.protocols {
            if let Err(e) = ctrl.set_node(labels).await {
                error!(%protocol, error = %e, "Failed to apply node labels");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Forward a leadership change to every controller
    pub async fn set_leader(&self, leader: bool) {
        for ctrl in self.protocols.values() {
            ctrl.set_leader(leader).await;
        }
    }

    async fn withdraw(&self, key: &str, reason: &str) -> SyncState {
        let mut state = SyncState::Success;
        for (protocol, ctrl) in &self.protocols {
            if let Err(e) = ctrl.delete_balancer(key, reason).await {
                error!(service = %key, %protocol, error = %e, "Failed to withdraw service");
                state = SyncState::Error;
            }
        }
        if state == SyncState::Success {
            self.announced.remove(key);
        }
        state
    }
}
