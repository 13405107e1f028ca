//! metalanchor - control plane for bare-metal load balancers
//!
//! - [`allocator`]: exclusive address assignment from configured pools
//! - [`controller`]: converges services towards a published address
//! - [`speaker`]: announces addresses over BGP, ARP or NDP
//! - [`config`]: YAML configuration parsing and validation

pub mod allocator;
pub mod cli;
pub mod config;
pub mod controller;
pub mod service;
pub mod speaker;
pub mod version;
