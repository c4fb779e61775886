//! # CLI Interface
//!
//! `clap` derive definitions for `tether-hub`. Three subcommands: `run`
//! (hub server), `agent` (peer agent) and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tether_protocol::config::{DEFAULT_HUB_PORT, DEFAULT_METRICS_PORT, PEER_CHANNEL_PATH};

/// Tether hub.
///
/// Runs the hub that brokers request/response traffic to peer agents, or a
/// peer agent that connects to one.
#[derive(Parser, Debug)]
#[command(
    name = "tether-hub",
    about = "Tether hub server and peer agent",
    version,
    propagate_version = true
)]
pub struct TetherCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start one or more hub instances.
    Run(RunArgs),
    /// Connect to a hub as a peer agent and serve its requests.
    Agent(AgentArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Hub configuration file (TOML). Built-in defaults when omitted.
    #[arg(long, short = 'c', env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind listeners on.
    #[arg(long, env = "TETHER_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// HTTP/WebSocket port of the first instance. Further instances take
    /// the following ports.
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_HUB_PORT)]
    pub port: u16,

    /// Port for the Prometheus endpoint (shared by all instances).
    #[arg(long, env = "TETHER_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Number of hub instances to run in this process, bridged over an
    /// in-memory bus.
    #[arg(long, env = "TETHER_INSTANCES", default_value_t = 1)]
    pub instances: u16,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "TETHER_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Hub WebSocket endpoint.
    #[arg(long, env = "TETHER_HUB_URL", default_value_t = default_hub_url())]
    pub hub: String,

    /// Stable identity of the device this agent fronts.
    #[arg(long, env = "TETHER_DEVICE")]
    pub device: String,

    /// Group to join. Repeat for several.
    #[arg(long = "group", required = true)]
    pub groups: Vec<String>,

    /// Give up after this many consecutive failed attempts. Retries forever
    /// when omitted.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "TETHER_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

fn default_hub_url() -> String {
    format!("ws://127.0.0.1:{DEFAULT_HUB_PORT}{PEER_CHANNEL_PATH}")
}
