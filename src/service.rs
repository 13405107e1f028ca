//! Service objects as seen by the control plane
//!
//! Only the fields the reconciler and speaker read or write are modelled.
//! Object CRUD and event delivery live behind [`ServiceClient`].

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation naming the pool a service wants its address from
pub const ADDRESS_POOL_ANNOTATION: &str = "metalanchor.io/address-pool";

/// Outcome of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Processed, nothing needed writing
    Success,
    /// Processed and the object was updated
    Updated,
    /// Failed; the caller should retry with its own backoff
    Error,
    /// Every other service should be re-evaluated
    ReprocessAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

/// External traffic policy of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub service_type: ServiceType,

    /// Address explicitly requested by the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    pub external_traffic_policy: TrafficPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadBalancerIngress {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngress>,
}

/// The mutable subset of a service object
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

impl Service {
    /// A load balancer service with no requests and no address
    pub fn load_balancer() -> Self {
        Self {
            spec: ServiceSpec {
                service_type: ServiceType::LoadBalancer,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_requested_ip(mut self, ip: impl Into<String>) -> Self {
        self.spec.load_balancer_ip = Some(ip.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.annotations
            .insert(ADDRESS_POOL_ANNOTATION.to_string(), pool.into());
        self
    }

    pub fn with_ingress(mut self, ip: impl Into<String>) -> Self {
        self.status.ingress = vec![LoadBalancerIngress { ip: ip.into() }];
        self
    }

    pub fn is_load_balancer(&self) -> bool {
        self.spec.service_type == ServiceType::LoadBalancer
    }

    /// Published address, if exactly one well-formed address is published
    pub fn ingress_ip(&self) -> Option<IpAddr> {
        match self.status.ingress.as_slice() {
            [single] => single.ip.parse().ok(),
            _ => None,
        }
    }

    /// Requested address, empty strings treated as absent
    pub fn requested_ip(&self) -> Option<&str> {
        self.spec
            .load_balancer_ip
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Requested pool, empty strings treated as absent
    pub fn requested_pool(&self) -> Option<&str> {
        self.annotations
            .get(ADDRESS_POOL_ANNOTATION)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Severity of a user-facing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// User-facing event attached to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Errors from the object store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("conflict updating service: {0}")]
    Conflict(String),

    #[error("API error: {0}")]
    Api(String),
}

/// Writes service objects and records events
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Persist annotations and spec, returning the stored object
    async fn update(&self, svc: &Service) -> Result<Service, ClientError>;

    /// Persist the status subresource
    async fn update_status(&self, svc: &Service) -> Result<(), ClientError>;

    /// Attach a user-facing event to the service
    fn record(&self, svc: &Service, event: ServiceEvent);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingress_ip_requires_single_valid_entry() {
        assert_eq!(Service::load_balancer().ingress_ip(), None);
        assert_eq!(
            Service::load_balancer().with_ingress("10.0.0.1").ingress_ip(),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            Service::load_balancer().with_ingress("not-an-ip").ingress_ip(),
            None
        );

        let mut two = Service::load_balancer().with_ingress("10.0.0.1");
        two.status.ingress.push(LoadBalancerIngress {
            ip: "10.0.0.2".to_string(),
        });
        assert_eq!(two.ingress_ip(), None);
    }

    #[test]
    fn test_empty_requests_are_absent() {
        let svc = Service::load_balancer().with_requested_ip("").with_pool("");
        assert_eq!(svc.requested_ip(), None);
        assert_eq!(svc.requested_pool(), None);

        let svc = Service::load_balancer()
            .with_requested_ip("10.0.0.9")
            .with_pool("gold");
        assert_eq!(svc.requested_ip(), Some("10.0.0.9"));
        assert_eq!(svc.requested_pool(), Some("gold"));
    }

    #[test]
    fn test_service_deserializes_from_json() {
        let svc: Service = serde_json::from_str(
            r#"{
                "annotations": {"metalanchor.io/address-pool": "gold"},
                "spec": {"type": "LoadBalancer", "externalTrafficPolicy": "Local"},
                "status": {"ingress": [{"ip": "10.0.0.3"}]}
            }"#,
        )
        .unwrap();

        assert!(svc.is_load_balancer());
        assert_eq!(svc.spec.external_traffic_policy, TrafficPolicy::Local);
        assert_eq!(svc.requested_pool(), Some("gold"));
        assert_eq!(svc.ingress_ip(), Some("10.0.0.3".parse().unwrap()));
    }
}
