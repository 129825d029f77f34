//! Inbound side: bind, accept, and the per-connection read loop.
//!
//! The read loop is shared with outbound connections. Inbound connections
//! only receive: replies travel on the replier's own pool to the request's
//! sender. On outbound connections the loop mostly watches for the peer
//! hanging up so the pool can discard the connection.

use crate::codec::EnvelopeCodec;
use crate::connector::{BoxedReader, RawConnection};
use crate::dispatcher::Dispatcher;
use crate::pool::Liveness;
use bytes::BytesMut;
use meshlink_types::{Endpoint, MessagingError, MessagingResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Bind a non-blocking std listener on `endpoint`.
///
/// Binding happens before the I/O runtime exists so that a busy port fails
/// `start` synchronously.
pub fn bind(endpoint: &Endpoint) -> MessagingResult<std::net::TcpListener> {
    let bind_err = |e: std::io::Error| MessagingError::Bind {
        endpoint: endpoint.clone(),
        reason: e.to_string(),
    };
    let listener =
        std::net::TcpListener::bind((endpoint.host(), endpoint.port())).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    Ok(listener)
}

/// Everything an inbound connection needs, cloned per accepted socket.
#[derive(Clone)]
pub struct Inbound {
    pub codec: EnvelopeCodec,
    pub dispatcher: Arc<Dispatcher>,
    pub tls: Option<TlsAcceptor>,
    pub handshake_timeout: Duration,
}

/// Accept connections until the task is dropped.
pub async fn accept_loop(listener: TcpListener, inbound: Inbound) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "Accepted connection");
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Err(reason) = handle_inbound(stream, addr, inbound).await {
                        debug!(peer = %addr, %reason, "Dropped inbound connection");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: Inbound,
) -> Result<(), String> {
    stream.set_nodelay(true).map_err(|e| e.to_string())?;

    let connection = match &inbound.tls {
        None => RawConnection::from_stream(stream),
        Some(acceptor) => {
            let accepted = tokio::time::timeout(inbound.handshake_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| "TLS handshake timed out".to_string())?
                .map_err(|e| format!("TLS handshake failed: {e}"))?;
            RawConnection::from_stream(accepted)
        }
    };

    // Inbound connections only carry requests in; the write half stays open
    // until the peer hangs up.
    let RawConnection {
        reader,
        writer: _writer,
    } = connection;
    read_loop(
        reader,
        addr.to_string(),
        inbound.codec,
        inbound.dispatcher,
        None,
    )
    .await;
    Ok(())
}

/// Decode frames from `reader` and dispatch them until EOF or a decode error.
///
/// A decode error closes the connection; there is no resynchronisation.
pub async fn read_loop(
    mut reader: BoxedReader,
    peer: String,
    codec: EnvelopeCodec,
    dispatcher: Arc<Dispatcher>,
    liveness: Option<Liveness>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    'conn: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(envelope)) => dispatcher.dispatch(envelope),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Closing connection after decode failure");
                    break 'conn;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(peer = %peer, "Connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
        }
    }
    if let Some(liveness) = liveness {
        liveness.mark_closed();
    }
}
