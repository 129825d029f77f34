//! Outbound connection establishment.
//!
//! A [`Connector`] turns an [`Endpoint`] into a split duplex byte stream.
//! [`StreamConnector`] is the production implementation (TCP, optionally
//! wrapped in mutual TLS); tests plug in in-memory connectors.

use crate::tls::TlsContext;
use async_trait::async_trait;
use meshlink_types::{Endpoint, MessagingError, MessagingResult};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
/// Write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// A freshly established connection, not yet pooled.
pub struct RawConnection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl RawConnection {
    /// Split any duplex stream into boxed halves.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Establishes outbound connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect (and authenticate) to `endpoint`.
    ///
    /// Any failure is reported as [`MessagingError::ConnectFailed`].
    async fn connect(&self, endpoint: &Endpoint) -> MessagingResult<RawConnection>;
}

/// TCP connector with optional mutual TLS.
#[derive(Clone)]
pub struct StreamConnector {
    timeout: Duration,
    tls: Option<TlsContext>,
}

impl StreamConnector {
    pub fn new(timeout: Duration, tls: Option<TlsContext>) -> Self {
        Self { timeout, tls }
    }

    async fn establish(&self, endpoint: &Endpoint) -> Result<RawConnection, String> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| e.to_string())?;
        stream.set_nodelay(true).map_err(|e| e.to_string())?;

        match &self.tls {
            None => Ok(RawConnection::from_stream(stream)),
            Some(tls) => {
                let name = ServerName::try_from(endpoint.host().to_string())
                    .map_err(|e| format!("invalid server name: {e}"))?;
                let stream = tls
                    .connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| format!("TLS handshake failed: {e}"))?;
                Ok(RawConnection::from_stream(stream))
            }
        }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn connect(&self, endpoint: &Endpoint) -> MessagingResult<RawConnection> {
        let result = tokio::time::timeout(self.timeout, self.establish(endpoint))
            .await
            .unwrap_or_else(|_| Err(format!("timed out after {:?}", self.timeout)));
        match result {
            Ok(conn) => {
                debug!(peer = %endpoint, tls = self.tls.is_some(), "Connected");
                Ok(conn)
            }
            Err(reason) => Err(MessagingError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = StreamConnector::new(Duration::from_secs(2), None);
        let err = connector
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MessagingError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_plain_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = StreamConnector::new(Duration::from_secs(2), None);
        let endpoint = Endpoint::new("127.0.0.1", port);
        let (conn, accepted) = tokio::join!(connector.connect(&endpoint), listener.accept());
        assert!(conn.is_ok());
        assert!(accepted.is_ok());
    }
}
