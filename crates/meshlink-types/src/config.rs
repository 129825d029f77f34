//! Messaging service configuration.
//!
//! All fields have defaults so a partial TOML table deserializes cleanly.
//! Durations are stored as integer milliseconds and exposed through
//! `Duration` accessors.

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum frame body size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// What happens when a handler is registered for a type that already has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerConflictPolicy {
    /// The new handler replaces the existing one.
    #[default]
    Replace,
    /// The existing handler is kept and the new registration is ignored.
    KeepFirst,
}

/// Mutual-TLS material, all PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain presented to peers (leaf first).
    pub cert_chain: PathBuf,
    /// Private key matching the leaf certificate.
    pub private_key: PathBuf,
    /// CA certificates used to verify peers, both as client and as server.
    pub trust_roots: PathBuf,
}

/// Configuration for a messaging service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Host to bind. Also advertised as sender unless `advertise_host` is
    /// set. Default: 127.0.0.1.
    pub listen_host: String,
    /// Host peers use to reach this node; replies are addressed to it.
    /// Required when `listen_host` is a wildcard such as 0.0.0.0.
    /// Default: none.
    pub advertise_host: Option<String>,
    /// Port to bind. Default: 0 (ephemeral).
    pub listen_port: u16,
    /// Reactor worker threads driving socket I/O. Default: 2.
    pub io_threads: usize,
    /// Bound on connect plus TLS handshake, in milliseconds. Default: 5000.
    pub connect_timeout_ms: u64,
    /// Idle pooled connections older than this are evicted. Default: 60000.
    pub pool_idle_timeout_ms: u64,
    /// Period of the idle-connection sweep. Default: 10000.
    pub pool_sweep_interval_ms: u64,
    /// Idle connections kept per endpoint. Default: 8.
    pub max_idle_per_endpoint: usize,
    /// Default time-to-live of a pending request. Default: 10000.
    pub request_ttl_ms: u64,
    /// Period of the pending-request expiry sweep. Default: 50.
    pub pending_sweep_interval_ms: u64,
    /// Maximum outstanding requests. Default: 65536.
    pub max_pending_requests: usize,
    /// Maximum frame body length in bytes. Default: 16 MB.
    pub max_frame_size: usize,
    /// Handler registration conflict policy. Default: replace.
    pub handler_conflict: HandlerConflictPolicy,
    /// Mutual TLS; plain TCP when absent.
    pub tls: Option<TlsConfig>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            advertise_host: None,
            io_threads: 2,
            connect_timeout_ms: 5_000,
            pool_idle_timeout_ms: 60_000,
            pool_sweep_interval_ms: 10_000,
            max_idle_per_endpoint: 8,
            request_ttl_ms: 10_000,
            pending_sweep_interval_ms: 50,
            max_pending_requests: 65_536,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handler_conflict: HandlerConflictPolicy::Replace,
            tls: None,
        }
    }
}

impl MessagingConfig {
    /// The endpoint requested by this configuration (port may still be 0).
    pub fn listen_endpoint(&self) -> Endpoint {
        Endpoint::new(self.listen_host.clone(), self.listen_port)
    }

    /// The host this node names as the sender of its envelopes.
    pub fn advertised_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.listen_host)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }

    pub fn pool_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pool_sweep_interval_ms.max(1))
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pending_sweep_interval_ms.max(1))
    }
}
