//! TLS configuration for the push listener
//!
//! Builds a rustls server config that offers only the push protocol over
//! ALPN. When client roots are supplied, clients may present a certificate
//! (certificate authentication) or connect without one (token
//! authentication); both are accepted.

use std::fmt;
use std::sync::Arc;

use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::negotiator::PUSH_ALPN;

/// Errors building the server TLS configuration
#[derive(Debug)]
pub enum TlsConfigError {
    /// rustls rejected the certificate chain, key, or protocol versions
    Rustls(rustls::Error),
    /// Client certificate verifier could not be built
    Verifier(String),
}

impl fmt::Display for TlsConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsConfigError::Rustls(e) => write!(f, "TLS configuration error: {}", e),
            TlsConfigError::Verifier(msg) => {
                write!(f, "client certificate verifier error: {}", msg)
            }
        }
    }
}

impl std::error::Error for TlsConfigError {}

impl From<rustls::Error> for TlsConfigError {
    fn from(e: rustls::Error) -> Self {
        TlsConfigError::Rustls(e)
    }
}

/// Crypto provider used for every TLS config in this crate
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring_provider::default_provider())
}

/// Server config offering ALPN `h2`.
///
/// `client_roots` enables optional client certificate verification against
/// the given trust anchors. Without it, every client uses token
/// authentication.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
) -> Result<ServerConfig, TlsConfigError> {
    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut config = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsConfigError::Verifier(format!("{}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(cert_chain, key)?,
    };

    config.alpn_protocols = vec![PUSH_ALPN.to_vec()];
    Ok(config)
}
