//! Per-connection TLS/ALPN negotiation and authentication classification
//!
//! Every accepted socket runs through:
//!
//! ```text
//! Accepted → TlsHandshaking → ProtocolNegotiated → AuthClassified → HandlerInstalled
//!                                     │
//!                                     └──→ Rejected (ALPN is not h2)
//! ```
//!
//! Failures end only the connection they happen on; the listener never sees
//! them.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::handler::{
    AuthContext, HandlerContext, HandlerError, HandlerFactory, ProtocolHandler, TlsConnection,
    MAX_CONCURRENT_STREAMS,
};
use crate::identity;
use crate::state::GatewayState;

/// ALPN identifier of the push protocol (HTTP/2 over TLS)
pub const PUSH_ALPN: &[u8] = b"h2";

// ============================================================================
// States and Errors
// ============================================================================

/// Where a connection is in its negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Accepted,
    TlsHandshaking,
    ProtocolNegotiated,
    AuthClassified,
    HandlerInstalled,
    Rejected,
}

/// Why a connection was dropped during negotiation
#[derive(Debug)]
pub enum NegotiationError {
    /// TLS handshake failed
    Handshake(io::Error),
    /// Client negotiated something other than h2 (or nothing)
    UnexpectedProtocol(Option<Vec<u8>>),
    /// Handler factory refused the connection
    Handler(HandlerError),
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::Handshake(e) => write!(f, "TLS handshake failed: {}", e),
            NegotiationError::UnexpectedProtocol(Some(proto)) => write!(
                f,
                "unexpected protocol: {}",
                String::from_utf8_lossy(proto)
            ),
            NegotiationError::UnexpectedProtocol(None) => {
                write!(f, "unexpected protocol: none negotiated")
            }
            NegotiationError::Handler(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NegotiationError {}

// ============================================================================
// Classification
// ============================================================================

/// Require the push protocol to have been negotiated.
pub fn check_protocol(alpn: Option<&[u8]>) -> Result<(), NegotiationError> {
    match alpn {
        Some(proto) if proto == PUSH_ALPN => Ok(()),
        other => Err(NegotiationError::UnexpectedProtocol(other.map(<[u8]>::to_vec))),
    }
}

/// Pick the authentication mode from the verified peer chain, if any.
///
/// A verified client certificate means certificate authentication, with the
/// base topic taken from the leaf's `UID=` attribute. No certificate means
/// token authentication.
pub fn classify(peer_certificates: Option<&[CertificateDer<'_>]>) -> AuthContext {
    let leaf = match peer_certificates.and_then(|certs| certs.first()) {
        Some(leaf) => leaf,
        None => return AuthContext::Token,
    };

    let base_topic = match identity::principal_name(leaf.as_ref()) {
        Ok(name) => {
            log::debug!("Peer principal: {}", name);
            identity::base_topic(&name)
        }
        Err(e) => {
            log::warn!("Could not read verified peer certificate: {}", e);
            None
        }
    };

    AuthContext::Certificate { base_topic }
}

// ============================================================================
// Negotiator
// ============================================================================

/// Negotiates accepted sockets and installs protocol handlers on them
pub struct ConnectionNegotiator {
    acceptor: TlsAcceptor,
    state: Arc<GatewayState>,
    factory: Arc<dyn HandlerFactory>,
}

/// Tracks one connection's progress for logging
struct Negotiation {
    peer_addr: SocketAddr,
    state: NegotiationState,
}

impl Negotiation {
    fn advance(&mut self, next: NegotiationState) {
        log::trace!("{}: {:?} -> {:?}", self.peer_addr, self.state, next);
        self.state = next;
    }
}

impl ConnectionNegotiator {
    pub fn new(
        acceptor: TlsAcceptor,
        state: Arc<GatewayState>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        ConnectionNegotiator {
            acceptor,
            state,
            factory,
        }
    }

    /// Negotiate one accepted socket up to the point where its handler is
    /// ready to serve it.
    pub async fn negotiate(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(TlsConnection, Box<dyn ProtocolHandler>, AuthContext), NegotiationError> {
        let mut negotiation = Negotiation {
            peer_addr,
            state: NegotiationState::Accepted,
        };

        negotiation.advance(NegotiationState::TlsHandshaking);
        let connection = self
            .acceptor
            .accept(stream)
            .await
            .map_err(NegotiationError::Handshake)?;

        negotiation.advance(NegotiationState::ProtocolNegotiated);
        let (_, session) = connection.get_ref();
        if let Err(e) = check_protocol(session.alpn_protocol()) {
            negotiation.advance(NegotiationState::Rejected);
            return Err(e);
        }

        let auth = classify(session.peer_certificates());
        negotiation.advance(NegotiationState::AuthClassified);

        let handler = self
            .factory
            .build(HandlerContext {
                state: Arc::clone(&self.state),
                max_concurrent_streams: MAX_CONCURRENT_STREAMS,
                auth: auth.clone(),
                peer_addr,
            })
            .map_err(NegotiationError::Handler)?;
        negotiation.advance(NegotiationState::HandlerInstalled);

        Ok((connection, handler, auth))
    }

    /// Negotiate and serve a connection until it closes or `shutdown` fires.
    /// Errors are logged and never returned.
    pub async fn run(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let served = async {
            let (connection, handler, auth) = match self.negotiate(stream, peer_addr).await {
                Ok(negotiated) => negotiated,
                Err(e @ NegotiationError::UnexpectedProtocol(_)) => {
                    log::warn!("Rejected connection from {}: {}", peer_addr, e);
                    return;
                }
                Err(e) => {
                    log::debug!("Dropped connection from {}: {}", peer_addr, e);
                    return;
                }
            };

            log::info!(
                "Connection from {} uses {} authentication{}",
                peer_addr,
                if auth.uses_token_authentication() { "token" } else { "certificate" },
                auth.base_topic()
                    .map(|topic| format!(" (base topic '{}')", topic))
                    .unwrap_or_default()
            );

            if let Err(e) = handler.serve(connection).await {
                log::debug!("Connection from {} ended with error: {}", peer_addr, e);
            }
        };

        tokio::select! {
            _ = served => {}
            _ = shutdown.cancelled() => {
                log::debug!("Closing connection from {} for shutdown", peer_addr);
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
