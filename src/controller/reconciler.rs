//! Service reconciler
//!
//! Drives each service towards "holds exactly one valid address from a
//! configured pool, published in its status". Every event is handled by
//! converging a private copy of the service and then writing back only the
//! parts that changed.
//!
//! Failed allocations are reported as service events and are not retried on a
//! timer. They are attempted again on the next event for the service, or when
//! a deletion or config change triggers a full reprocess.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator::{Allocator, AllocatorError};
use crate::config::Config;
use crate::service::{
    ClientError, LoadBalancerIngress, Service, ServiceClient, ServiceEvent, SyncState,
    TrafficPolicy,
};

/// Errors raised while converging or persisting a service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("invalid requested address '{0}'")]
    InvalidRequestedIp(String),

    #[error("no pool serves the address family of {0}")]
    UnsupportedFamily(IpAddr),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result of converging one service in memory
enum Converged {
    /// The working copy holds the desired state
    Ready,
    /// Allocation is needed but must wait until the cluster is synced
    Deferred,
}

#[derive(Default)]
struct ReconcilerState {
    config: Option<Config>,
    /// Whether the initial list of services has been fully processed
    synced: bool,
    ips: Allocator,
}

/// Assigns and publishes load balancer addresses
pub struct ServiceReconciler {
    client: Arc<dyn ServiceClient>,
    state: Mutex<ReconcilerState>,
}

impl ServiceReconciler {
    pub fn new(client: Arc<dyn ServiceClient>) -> Self {
        Self {
            client,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Apply a new configuration.
    ///
    /// Returns `ReprocessAll` so every service is re-validated against the new
    /// pools. A missing or rejected configuration leaves the previous one in
    /// place and returns `Error`.
    pub async fn set_config(&self, cfg: Option<Config>) -> SyncState {
        let Some(cfg) = cfg else {
            error!("Configuration is missing, no addresses will be assigned");
            return SyncState::Error;
        };

        let mut state = self.state.lock().await;
        if let Err(e) = state.ips.set_pools(cfg.pools.clone()) {
            error!(error = %e, "Applying new configuration failed");
            return SyncState::Error;
        }
        info!(
            pools = cfg.pools.len(),
            peers = cfg.peers.len(),
            "Applied new configuration"
        );
        state.config = Some(cfg);
        SyncState::ReprocessAll
    }

    /// Allow allocation of new addresses.
    ///
    /// Until this is called existing assignments are re-validated and
    /// recorded, but nothing new is handed out, so an address already held by
    /// a not-yet-seen service can't be given away.
    pub async fn mark_synced(&self) {
        self.state.lock().await.synced = true;
        info!("Controller synced, can allocate addresses now");
    }

    /// Address currently assigned to `key`
    pub async fn assigned_ip(&self, key: &str) -> Option<IpAddr> {
        self.state.lock().await.ips.ip(key)
    }

    /// Handle a service update (`Some`) or deletion (`None`)
    pub async fn set_balancer(&self, key: &str, svc: Option<&Service>) -> SyncState {
        let Some(original) = svc else {
            let mut state = self.state.lock().await;
            if state.ips.unassign(key) {
                info!(service = %key, "Service deleted, released address");
            }
            // Services waiting for an address may fit now
            return SyncState::ReprocessAll;
        };

        let mut svc = original.clone();
        {
            let mut state = self.state.lock().await;
            if state.config.is_none() {
                debug!(service = %key, "Still waiting for configuration, not processing");
                return SyncState::Success;
            }
            if let Converged::Deferred = self.converge(&mut state, key, &mut svc) {
                return SyncState::Success;
            }
        }

        if svc == *original {
            debug!(service = %key, "Service converged, no change");
            return SyncState::Success;
        }

        match self.write_back(original, &svc).await {
            Ok(()) => {
                info!(service = %key, "Updated service");
                SyncState::Updated
            }
            Err(e) => {
                error!(service = %key, error = %e, "Failed to update service");
                SyncState::Error
            }
        }
    }

    // ===== Convergence =====

    fn converge(&self, state: &mut ReconcilerState, key: &str, svc: &mut Service) -> Converged {
        // It may have been a load balancer before, so managed state is still
        // cleared. No new address is handed out.
        if !svc.is_load_balancer() {
            debug!(service = %key, "Not a load balancer, clearing assignment");
            clear_service_state(&mut state.ips, key, svc);
            return Converged::Ready;
        }

        let mut lb_ip = svc.ingress_ip();
        if lb_ip.is_none() {
            debug!(service = %key, "No ingress address published");
            clear_service_state(&mut state.ips, key, svc);
        }

        // The pools may have changed under an existing assignment
        if let Some(ip) = lb_ip {
            if let Err(e) = state.ips.assign(key, ip) {
                info!(service = %key, %ip, reason = %e, "Clearing assignment");
                clear_service_state(&mut state.ips, key, svc);
                lb_ip = None;
            }
        }

        if let Some(requested) = svc.requested_ip() {
            if requested.parse::<IpAddr>().ok() != lb_ip {
                info!(service = %key, current = ?lb_ip, requested, "Clearing assignment, user requested a different address");
                clear_service_state(&mut state.ips, key, svc);
                lb_ip = None;
            }
        }

        let ip = match lb_ip {
            Some(ip) => ip,
            None => {
                if !state.synced {
                    info!(service = %key, "Not allocating yet, controller not synced");
                    return Converged::Deferred;
                }
                match allocate_ip(&mut state.ips, key, svc) {
                    Ok(ip) => {
                        info!(service = %key, %ip, "Allocated address");
                        self.client.record(
                            svc,
                            ServiceEvent::normal("IPAllocated", format!("Assigned IP \"{ip}\"")),
                        );
                        ip
                    }
                    Err(e) => {
                        warn!(service = %key, error = %e, "Allocation failed");
                        self.client.record(
                            svc,
                            ServiceEvent::warning(
                                "AllocationFailed",
                                format!("Failed to allocate IP for \"{key}\": {e}"),
                            ),
                        );
                        return Converged::Ready;
                    }
                }
            }
        };

        let protocol = state
            .ips
            .pool(key)
            .and_then(|name| state.config.as_ref()?.pool(name))
            .map(|pool| pool.protocol);
        let Some(protocol) = protocol else {
            error!(service = %key, %ip, "Allocated address has no matching pool");
            self.client.record(
                svc,
                ServiceEvent::warning("InternalError", "allocated an IP that has no pool"),
            );
            clear_service_state(&mut state.ips, key, svc);
            return Converged::Ready;
        };

        // Any node may become the layer 2 leader, so node-local traffic
        // policy can't be honored
        if protocol.is_layer2() {
            svc.spec.external_traffic_policy = TrafficPolicy::Cluster;
        }

        svc.status.ingress = vec![LoadBalancerIngress { ip: ip.to_string() }];
        Converged::Ready
    }

    /// Persist the changed parts of `svc`: annotations and spec first, then
    /// status
    async fn write_back(&self, original: &Service, svc: &Service) -> Result<(), ReconcileError> {
        let mut stored = original.clone();
        if original.annotations != svc.annotations || original.spec != svc.spec {
            stored = self.client.update(svc).await?;
        }
        if original.status != svc.status {
            stored.status = svc.status.clone();
            self.client.update_status(&stored).await?;
        }
        Ok(())
    }
}

/// Release `key`'s address and clear the published status
fn clear_service_state(ips: &mut Allocator, key: &str, svc: &mut Service) {
    ips.unassign(key);
    svc.status.ingress.clear();
}

/// Pick an address for `key`: the requested literal if any, else the
/// requested pool, else any auto-assign pool
fn allocate_ip(ips: &mut Allocator, key: &str, svc: &Service) -> Result<IpAddr, ReconcileError> {
    if let Some(requested) = svc.requested_ip() {
        let ip: IpAddr = requested
            .parse()
            .map_err(|_| ReconcileError::InvalidRequestedIp(requested.to_string()))?;
        if !ips.supports_family(&ip) {
            return Err(ReconcileError::UnsupportedFamily(ip));
        }
        ips.assign(key, ip)?;
        return Ok(ip);
    }

    if let Some(pool) = svc.requested_pool() {
        return Ok(ips.allocate_from_pool(key, pool)?);
    }

    Ok(ips.allocate(key)?)
}
