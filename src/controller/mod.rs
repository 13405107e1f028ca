//! Cluster-wide controller
//!
//! Assigns load balancer addresses to services and publishes them in
//! service status. Announcing those addresses is the speaker's job.

pub mod reconciler;

pub use reconciler::{ReconcileError, ServiceReconciler};
