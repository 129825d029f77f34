//! Peer identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Immutable `(host, port)` identity of a peer process.
///
/// Used as the connection pool key and as the sender of every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

/// Failure to parse a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("missing ':port' in endpoint '{0}'")]
    MissingPort(String),
    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),
    #[error("empty host in endpoint '{0}'")]
    EmptyHost(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_and_display() {
        let ep: Endpoint = "10.0.0.5:9876".parse().unwrap();
        assert_eq!(ep.host(), "10.0.0.5");
        assert_eq!(ep.port(), 9876);
        assert_eq!(ep.to_string(), "10.0.0.5:9876");
    }

    #[test]
    fn test_parse_ipv6() {
        let ep: Endpoint = "[::1]:9876".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:9876");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "localhost".parse::<Endpoint>(),
            Err(EndpointParseError::MissingPort(_))
        ));
        assert!(matches!(
            "localhost:http".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            ":80".parse::<Endpoint>(),
            Err(EndpointParseError::EmptyHost(_))
        ));
    }

    #[test]
    fn test_value_equality() {
        let mut set = HashSet::new();
        set.insert(Endpoint::new("node-a", 1));
        set.insert(Endpoint::new("node-a", 1));
        set.insert(Endpoint::new("node-a", 2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("127.0.0.1", 4000));
    }
}
