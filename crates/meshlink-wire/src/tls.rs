//! Mutual-TLS setup.
//!
//! One PEM certificate chain and key identify this node both when it accepts
//! and when it connects; one PEM bundle of CA certificates verifies peers in
//! both directions. Client certificates are mandatory on the accepting side.
//!
//! Both sides speak TLS 1.2 only. There the client waits for the server's
//! `Finished`, so a rejected client certificate fails the connect rather than
//! silently swallowing the first frame (TLS 1.3 lets the client finish first).

use meshlink_types::{MessagingError, MessagingResult, TlsConfig};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];

/// Handshake configuration for both directions.
#[derive(Clone)]
pub struct TlsContext {
    pub connector: TlsConnector,
    pub acceptor: TlsAcceptor,
}

impl TlsContext {
    /// Load key and trust material and build client and server configs.
    pub fn load(config: &TlsConfig) -> MessagingResult<Self> {
        let certs = load_certs(&config.cert_chain)?;
        let key = PrivateKeyDer::from_pem_file(&config.private_key).map_err(|e| {
            tls_error(format!(
                "cannot read private key {}: {e:?}",
                config.private_key.display()
            ))
        })?;

        let mut roots = RootCertStore::empty();
        for ca in load_certs(&config.trust_roots)? {
            roots
                .add(ca)
                .map_err(|e| tls_error(format!("invalid trust root: {e}")))?;
        }
        let roots = Arc::new(roots);
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                .build()
                .map_err(|e| tls_error(format!("client verifier: {e}")))?;

        let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| tls_error(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| tls_error(format!("server certificate: {e}")))?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| tls_error(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error(format!("client certificate: {e}")))?;

        debug!(
            cert_chain = %config.cert_chain.display(),
            trust_roots = %config.trust_roots.display(),
            "Loaded TLS material"
        );

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }
}

fn load_certs(path: &Path) -> MessagingResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| tls_error(format!("cannot read {}: {e:?}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("bad certificate in {}: {e:?}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn tls_error(reason: String) -> MessagingError {
    MessagingError::Tls(reason)
}
