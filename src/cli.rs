//! Command line interface
//!
//! - `metalanchor check <config>` validates a configuration file
//! - `metalanchor plan <config> --service ns/name[=ip|@pool]` dry-runs
//!   address assignment for a list of services
//! - `metalanchor version` prints build information

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;

use crate::config::{Config, Protocol};
use crate::controller::ServiceReconciler;
use crate::service::{ClientError, EventType, Service, ServiceClient, ServiceEvent, SyncState};

#[derive(Parser, Debug)]
#[command(name = "metalanchor")]
#[command(about = "Address assignment and announcement for bare-metal load balancers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a configuration file and summarize it
    Check(CheckArgs),

    /// Show which addresses a set of services would be given
    Plan(PlanArgs),

    /// Print version and build information
    Version,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Configuration file (YAML)
    #[arg(env = "METALANCHOR_CONFIG")]
    pub config: PathBuf,

    /// Print the validated configuration as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Configuration file (YAML)
    #[arg(env = "METALANCHOR_CONFIG")]
    pub config: PathBuf,

    /// Service to place, in request order
    #[arg(short, long = "service", value_name = "KEY[=IP|@POOL]", required = true)]
    pub services: Vec<ServiceRequest>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// Find `--env-file` in raw arguments.
///
/// The file has to be loaded before clap runs, so values such as
/// `METALANCHOR_CONFIG` that only exist in it are visible to argument parsing.
pub fn env_file_from_args<I, S>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString>,
{
    let mut args = args.into_iter().map(Into::into);
    while let Some(arg) = args.next() {
        let arg = arg.to_string_lossy().into_owned();
        if arg == "--" {
            return None;
        }
        if arg == "--env-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// What a planned service asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Any,
    Address(String),
    Pool(String),
}

/// A service given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub key: String,
    pub request: Request,
}

impl FromStr for ServiceRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, request) = if let Some((key, ip)) = s.split_once('=') {
            (key, Request::Address(ip.to_string()))
        } else if let Some((key, pool)) = s.split_once('@') {
            (key, Request::Pool(pool.to_string()))
        } else {
            (s, Request::Any)
        };
        if key.is_empty() {
            return Err(format!("missing service key in '{}'", s));
        }
        Ok(Self {
            key: key.to_string(),
            request,
        })
    }
}

impl ServiceRequest {
    fn to_service(&self) -> Service {
        let svc = Service::load_balancer();
        match &self.request {
            Request::Any => svc,
            Request::Address(ip) => svc.with_requested_ip(ip.clone()),
            Request::Pool(pool) => svc.with_pool(pool.clone()),
        }
    }
}

/// Outcome of planning one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client that keeps writes in memory
#[derive(Default)]
struct DryRunClient {
    events: Mutex<Vec<ServiceEvent>>,
}

impl DryRunClient {
    fn take_warning(&self) -> Option<String> {
        let mut events = self.events.lock().ok()?;
        let warning = events
            .iter()
            .rev()
            .find(|e| e.event_type == EventType::Warning)
            .map(|e| e.message.clone());
        events.clear();
        warning
    }
}

#[async_trait]
impl ServiceClient for DryRunClient {
    async fn update(&self, svc: &Service) -> Result<Service, ClientError> {
        Ok(svc.clone())
    }

    async fn update_status(&self, _svc: &Service) -> Result<(), ClientError> {
        Ok(())
    }

    fn record(&self, _svc: &Service, event: ServiceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Run every request through a fresh reconciler, in order
pub async fn plan(config: &Config, requests: &[ServiceRequest]) -> anyhow::Result<Vec<PlanEntry>> {
    let client = Arc::new(DryRunClient::default());
    let reconciler = ServiceReconciler::new(client.clone());
    if reconciler.set_config(Some(config.clone())).await == SyncState::Error {
        bail!("configuration rejected by the allocator");
    }
    reconciler.mark_synced().await;

    let mut entries = Vec::with_capacity(requests.len());
    for req in requests {
        reconciler.set_balancer(&req.key, Some(&req.to_service())).await;
        let address = reconciler.assigned_ip(&req.key).await;
        let pool = address.and_then(|ip| config.pool_for_ip(&ip));
        entries.push(PlanEntry {
            service: req.key.clone(),
            address,
            pool: pool.map(|p| p.name.clone()),
            protocol: pool.map(|p| p.protocol),
            error: client.take_warning(),
        });
    }
    Ok(entries)
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };
    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row.clone());
    }
    output
}

/// Summarize a validated configuration.
/// Pure function - returns a formatted string.
pub fn format_check(config: &Config, path: &str) -> String {
    let mut output = format!("Configuration: {}\n\n", path);

    output.push_str(&format!("Address pools ({}):\n", config.pools.len()));
    let rows: Vec<Vec<String>> = config
        .pools
        .iter()
        .map(|p| {
            let cidrs: Vec<String> = p.cidrs.iter().map(|c| c.to_string()).collect();
            vec![
                p.name.clone(),
                p.protocol.to_string(),
                cidrs.join(","),
                p.auto_assign.to_string(),
                p.avoid_buggy_ips.to_string(),
            ]
        })
        .collect();
    output.push_str(&format_table(
        &["name", "protocol", "addresses", "auto-assign", "avoid-buggy-ips"],
        &rows,
    ));

    output.push_str(&format!("\nBGP peers ({}):\n", config.peers.len()));
    let rows: Vec<Vec<String>> = config
        .peers
        .iter()
        .map(|p| {
            vec![
                p.endpoint().to_string(),
                p.my_asn.to_string(),
                p.peer_asn.to_string(),
                format!("{}s", p.hold_time.as_secs()),
                if p.node_selectors.is_empty() {
                    "all nodes".to_string()
                } else {
                    format!("{} selectors", p.node_selectors.len())
                },
            ]
        })
        .collect();
    output.push_str(&format_table(
        &["peer", "my-asn", "peer-asn", "hold-time", "nodes"],
        &rows,
    ));

    output.push_str("\nValidation: PASSED\n");
    output
}

/// Format plan results as a table.
/// Pure function - returns a formatted string.
pub fn format_plan(entries: &[PlanEntry]) -> String {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.service.clone(),
                e.address.map(|ip| ip.to_string()).unwrap_or_else(|| "<none>".to_string()),
                e.pool.clone().unwrap_or_default(),
                e.protocol.map(|p| p.to_string()).unwrap_or_default(),
                e.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    format_table(&["service", "address", "pool", "protocol", "error"], &rows)
}
