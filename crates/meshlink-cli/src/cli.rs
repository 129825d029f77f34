//! Clap CLI definitions for meshlink.

use clap::{Parser, Subcommand};
use meshlink_types::Endpoint;
use std::path::PathBuf;

/// meshlink: run and talk to messaging nodes.
#[derive(Parser)]
#[command(name = "meshlink", version, about = "Inter-node messaging transport")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen host from the config.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Override the listen port from the config.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node with `echo`, `log` and `ping` handlers until Ctrl+C.
    Serve,
    /// Send one fire-and-forget message.
    Send {
        /// Destination, as host:port.
        to: Endpoint,
        /// Message type.
        message_type: String,
        /// Payload, sent as UTF-8 bytes.
        payload: String,
    },
    /// Send a request and print the reply.
    Request {
        /// Destination, as host:port.
        to: Endpoint,
        /// Message type.
        message_type: String,
        /// Payload, sent as UTF-8 bytes.
        payload: String,
        /// Reply timeout; defaults to the configured request TTL.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}
