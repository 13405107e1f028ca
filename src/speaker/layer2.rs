//! Leader-gated layer 2 announcer (ARP and NDP)
//!
//! Only the elected leader announces. On becoming leader the announcer sends
//! a burst of unsolicited announcements for every address it owns, so that
//! neighbors drop whatever stale mapping the previous leader left behind.
//! Losing leadership cancels the burst; there is no way to un-announce.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProtocolController, SpeakerError};
use crate::config::{Config, Labels, Pool, Protocol};

/// Errors from the link-layer transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnounceError {
    #[error("sending announcement for {0}: {1}")]
    Send(IpAddr, String),
}

/// Emits a single gratuitous ARP reply or unsolicited neighbor advertisement
#[async_trait]
pub trait AnnounceSender: Send + Sync {
    async fn gratuitous(&self, ip: IpAddr) -> Result<(), AnnounceError>;
}

/// Timing of the announcement burst sent on leadership acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstConfig {
    /// Total length of the burst, measured from its start
    pub duration: Duration,

    /// Pause between rounds
    pub interval: Duration,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            interval: Duration::from_millis(1100),
        }
    }
}

/// Tracks announced addresses and leadership for one link-layer protocol
pub struct Announcer {
    sender: Arc<dyn AnnounceSender>,
    burst: BurstConfig,
    ips: Arc<DashMap<String, IpAddr>>,
    leader: AtomicBool,
    /// Cancellation handle of the burst in flight, if any
    active: Mutex<Option<CancellationToken>>,
}

impl Announcer {
    pub fn new(sender: Arc<dyn AnnounceSender>) -> Self {
        Self {
            sender,
            burst: BurstConfig::default(),
            ips: Arc::new(DashMap::new()),
            leader: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn with_burst(mut self, burst: BurstConfig) -> Self {
        self.burst = burst;
        self
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Update leadership.
    ///
    /// Any burst in flight is cancelled. Becoming (or remaining) leader starts
    /// a fresh burst and returns its handle.
    pub async fn set_leader(&self, leader: bool) -> Option<JoinHandle<()>> {
        let mut active = self.active.lock().await;
        if let Some(token) = active.take() {
            token.cancel();
        }
        self.leader.store(leader, Ordering::SeqCst);

        if !leader {
            info!("Lost leadership, stopping announcements");
            return None;
        }

        info!(addresses = self.ips.len(), "Acquired leadership, announcing addresses");
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Some(tokio::spawn(spam(
            self.ips.clone(),
            self.sender.clone(),
            self.burst,
            token,
        )))
    }

    /// Start announcing `ip` on behalf of `name`
    pub fn set_balancer(&self, name: &str, ip: IpAddr) {
        self.ips.insert(name.to_string(), ip);
    }

    /// Stop announcing `name`'s address
    pub fn delete_balancer(&self, name: &str) {
        self.ips.remove(name);
    }

    /// Whether `name` is currently announced
    pub fn announce_name(&self, name: &str) -> bool {
        self.ips.contains_key(name)
    }

    /// Snapshot of announced addresses
    pub fn ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.ips.iter().map(|e| *e.value()).collect();
        ips.sort();
        ips
    }
}

/// Broadcast announcements for every address until the burst window closes
/// or `token` is cancelled
async fn spam(
    ips: Arc<DashMap<String, IpAddr>>,
    sender: Arc<dyn AnnounceSender>,
    burst: BurstConfig,
    token: CancellationToken,
) {
    let start = Instant::now();
    while start.elapsed() < burst.duration {
        if token.is_cancelled() {
            return;
        }

        let round: Vec<IpAddr> = ips.iter().map(|e| *e.value()).collect();
        for ip in round {
            if let Err(e) = sender.gratuitous(ip).await {
                warn!(%ip, error = %e, "Failed to send gratuitous layer 2 response");
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                debug!("Announcement burst cancelled");
                return;
            }
            _ = tokio::time::sleep(burst.interval) => {}
        }
    }
    debug!("Announcement burst finished");
}

/// ARP or NDP protocol controller backed by an [`Announcer`]
pub struct Layer2Controller {
    protocol: Protocol,
    announcer: Arc<Announcer>,
}

impl Layer2Controller {
    pub fn new(protocol: Protocol, announcer: Arc<Announcer>) -> Self {
        Self {
            protocol,
            announcer,
        }
    }

    pub fn announcer(&self) -> &Arc<Announcer> {
        &self.announcer
    }
}

#[async_trait]
impl ProtocolController for Layer2Controller {
    async fn set_config(&self, _cfg: &Config) -> Result<(), SpeakerError> {
        Ok(())
    }

    async fn set_balancer(&self, name: &str, ip: IpAddr, pool: &Pool) -> Result<(), SpeakerError> {
        if let Some(network) = pool.arp_network {
            if !network.contains(&ip) {
                return Err(SpeakerError::OutsideNetwork(ip, network));
            }
        }
        debug!(service = %name, %ip, protocol = %self.protocol, "Announcing address");
        self.announcer.set_balancer(name, ip);
        Ok(())
    }

    async fn delete_balancer(&self, name: &str, reason: &str) -> Result<(), SpeakerError> {
        if !self.announcer.announce_name(name) {
            return Ok(());
        }
        info!(service = %name, reason, protocol = %self.protocol, "Withdrawing announcement");
        self.announcer.delete_balancer(name);
        Ok(())
    }

    async fn set_leader(&self, leader: bool) {
        self.announcer.set_leader(leader).await;
    }

    async fn set_node(&self, _labels: &Labels) -> Result<(), SpeakerError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::RecordingSender;
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn fast_burst() -> BurstConfig {
        BurstConfig {
            duration: Duration::from_millis(250),
            interval: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_burst_announces_every_ip_each_round() {
        let sender = Arc::new(RecordingSender::default());
        let announcer = Announcer::new(sender.clone()).with_burst(fast_burst());
        announcer.set_balancer("default/a", ip("10.0.0.1"));
        announcer.set_balancer("default/b", ip("10.0.0.2"));

        let burst = announcer.set_leader(true).await.unwrap();
        burst.await.unwrap();

        // Rounds at ~0ms, ~100ms and ~200ms
        assert!(sender.count(ip("10.0.0.1")) >= 2);
        assert_eq!(sender.count(ip("10.0.0.1")), sender.count(ip("10.0.0.2")));
        assert!(announcer.is_leader());
    }

    #[tokio::test]
    async fn test_losing_leadership_cancels_burst() {
        let sender = Arc::new(RecordingSender::default());
        let announcer = Announcer::new(sender.clone()).with_burst(BurstConfig {
            duration: Duration::from_secs(5),
            interval: Duration::from_secs(1),
        });
        announcer.set_balancer("default/a", ip("10.0.0.1"));

        let burst = announcer.set_leader(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(announcer.set_leader(false).await.is_none());

        tokio::time::timeout(Duration::from_secs(1), burst)
            .await
            .expect("burst should stop promptly")
            .unwrap();
        assert_eq!(sender.count(ip("10.0.0.1")), 1);
        assert!(!announcer.is_leader());
    }

    #[tokio::test]
    async fn test_send_failure_does_not_stop_other_ips() {
        let sender = Arc::new(RecordingSender {
            failing: [ip("10.0.0.1")].into_iter().collect(),
            ..Default::default()
        });
        let announcer = Announcer::new(sender.clone()).with_burst(fast_burst());
        announcer.set_balancer("default/a", ip("10.0.0.1"));
        announcer.set_balancer("default/b", ip("10.0.0.2"));

        announcer.set_leader(true).await.unwrap().await.unwrap();

        assert!(sender.count(ip("10.0.0.2")) >= 2);
    }

    #[tokio::test]
    async fn test_layer2_controller_tracks_balancers() {
        let sender = Arc::new(RecordingSender::default());
        let announcer = Arc::new(Announcer::new(sender));
        let ctrl = Layer2Controller::new(Protocol::Arp, announcer.clone());

        let pool = Pool::new("l2", Protocol::Arp, vec!["10.0.0.0/24".parse().unwrap()]);
        ctrl.set_balancer("default/a", ip("10.0.0.4"), &pool)
            .await
            .unwrap();
        assert_eq!(announcer.ips(), vec![ip("10.0.0.4")]);

        ctrl.delete_balancer("default/a", "deleted").await.unwrap();
        ctrl.delete_balancer("default/a", "deleted").await.unwrap();
        assert!(announcer.ips().is_empty());
    }

    #[tokio::test]
    async fn test_layer2_controller_respects_arp_network() {
        let announcer = Arc::new(Announcer::new(Arc::new(RecordingSender::default())));
        let ctrl = Layer2Controller::new(Protocol::Arp, announcer.clone());

        let mut pool = Pool::new("l2", Protocol::Arp, vec!["10.0.0.0/24".parse().unwrap()]);
        pool.arp_network = Some("10.0.0.0/25".parse().unwrap());

        let result = ctrl.set_balancer("default/a", ip("10.0.0.200"), &pool).await;
        assert!(matches!(result, Err(SpeakerError::OutsideNetwork(..))));
        assert!(announcer.ips().is_empty());
    }
}
