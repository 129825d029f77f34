//! meshlink CLI: run a messaging node or send to one.
//!
//! `serve` runs a node until Ctrl+C. `send` and `request` start a short-lived
//! node on an ephemeral port (unless `--port` is given), deliver one message
//! and stop.

mod cli;
mod config;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use meshlink_types::{Endpoint, MessageType, MessagingConfig};
use meshlink_wire::{Handler, MessagingService};
use std::time::Duration;
use tracing::info;

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr(cli.log_json);

    let mut config = config::load_config(cli.config.as_deref());
    if let Some(host) = cli.host {
        config.listen_host = host;
    }
    let client_mode = !matches!(cli.command, Commands::Serve);
    match cli.port {
        Some(port) => config.listen_port = port,
        // One-shot commands only need somewhere to receive replies.
        None if client_mode => config.listen_port = 0,
        None => {}
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    match cli.command {
        Commands::Serve => runtime.block_on(cmd_serve(config)),
        Commands::Send {
            to,
            message_type,
            payload,
        } => runtime.block_on(cmd_send(config, to, message_type, payload)),
        Commands::Request {
            to,
            message_type,
            payload,
            timeout_ms,
        } => runtime.block_on(cmd_request(
            config,
            to,
            message_type,
            payload,
            timeout_ms.map(Duration::from_millis),
        )),
    }
}

fn start(config: MessagingConfig) -> anyhow::Result<MessagingService> {
    let service = MessagingService::new(config);
    service.start().context("failed to start messaging service")?;
    Ok(service)
}

async fn cmd_send(
    config: MessagingConfig,
    to: Endpoint,
    message_type: String,
    payload: String,
) -> anyhow::Result<()> {
    let message_type = MessageType::new(message_type)?;
    let service = start(config)?;
    service
        .send_async(&to, &message_type, payload)
        .await
        .with_context(|| format!("send to {to} failed"))?;
    println!("sent {message_type} to {to}");
    service.stop();
    Ok(())
}

async fn cmd_request(
    config: MessagingConfig,
    to: Endpoint,
    message_type: String,
    payload: String,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let message_type = MessageType::new(message_type)?;
    let service = start(config)?;
    let reply = service
        .send_and_receive(&to, &message_type, payload, timeout)
        .await
        .with_context(|| format!("request to {to} failed"))?;
    println!("{}", String::from_utf8_lossy(&reply));
    service.stop();
    Ok(())
}

async fn cmd_serve(config: MessagingConfig) -> anyhow::Result<()> {
    let service = MessagingService::new(config);
    service.register_handler(
        MessageType::new("echo")?,
        Handler::sync_reply(|envelope| Some(envelope.into_payload())),
    );
    service.register_handler(
        MessageType::new("log")?,
        Handler::fire_and_forget(|envelope| {
            info!(
                peer = %envelope.sender(),
                id = envelope.id(),
                payload = %String::from_utf8_lossy(envelope.payload()),
                "Received log message"
            );
        }),
    );
    service.register_handler(
        MessageType::new("ping")?,
        Handler::sync_reply(|_| Some(Bytes::from_static(b"pong"))),
    );

    let local = service
        .start()
        .context("failed to start messaging service")?;
    println!("meshlink listening on {local}");
    info!(handlers = ?service.registered_types(), "Serving until Ctrl+C");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    service.stop();
    Ok(())
}
