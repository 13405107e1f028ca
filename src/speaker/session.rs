//! BGP session seam.
//!
//! Wire encoding lives behind [`SessionFactory`] and [`Session`]; the peer
//! controller only opens, programs and closes sessions.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use thiserror::Error;

/// Errors reported by a BGP session implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connecting to {0}: {1}")]
    Connect(SocketAddr, String),

    #[error("timed out opening session to {0}")]
    Timeout(SocketAddr),

    #[error("updating advertisements: {0}")]
    Update(String),

    #[error("closing session: {0}")]
    Close(String),
}

/// A route announced to peers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Advertisement {
    pub prefix: IpNet,
    pub next_hop: IpAddr,
    pub local_pref: u32,

    /// Sorted, de-duplicated community values
    pub communities: BTreeSet<u32>,
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.prefix, self.next_hop)?;
        if self.local_pref != 0 {
            write!(f, " localpref {}", self.local_pref)?;
        }
        if !self.communities.is_empty() {
            let comms: Vec<String> = self
                .communities
                .iter()
                .map(|c| format!("{}:{}", c >> 16, c & 0xffff))
                .collect();
            write!(f, " communities [{}]", comms.join(" "))?;
        }
        Ok(())
    }
}

/// Everything needed to dial a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub endpoint: SocketAddr,
    pub my_asn: u32,
    pub router_id: IpAddr,
    pub peer_asn: u32,
    pub hold_time: Duration,
}

/// A live BGP session
#[async_trait]
pub trait Session: Send + Sync {
    /// Replace the full set of routes announced on this session
    async fn set(&self, advertisements: &[Advertisement]) -> Result<(), SessionError>;

    /// Tear the session down
    async fn close(&self) -> Result<(), SessionError>;
}

/// Dials BGP sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, params: SessionParams) -> Result<Arc<dyn Session>, SessionError>;
}
