//! Boundary with the push protocol handler
//!
//! The negotiator finishes TLS and authentication classification, then hands
//! the connection to a [`ProtocolHandler`] built by the server's
//! [`HandlerFactory`]. Frame-level request handling lives behind this seam.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::state::GatewayState;

/// Concurrent stream limit advertised to every client
pub const MAX_CONCURRENT_STREAMS: u32 = 8;

/// A TLS connection that completed negotiation
pub type TlsConnection = tokio_rustls::server::TlsStream<TcpStream>;

/// Future driving one connection until it closes
pub type HandlerFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

// ============================================================================
// Authentication Context
// ============================================================================

/// How a connection authenticates its requests. Decided once, when the
/// handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Client presented a verified certificate; `base_topic` comes from its
    /// `UID=` subject attribute when present
    Certificate { base_topic: Option<String> },
    /// No client certificate; every request carries a signed token
    Token,
}

impl AuthContext {
    pub fn uses_token_authentication(&self) -> bool {
        matches!(self, AuthContext::Token)
    }

    pub fn base_topic(&self) -> Option<&str> {
        match self {
            AuthContext::Certificate { base_topic } => base_topic.as_deref(),
            AuthContext::Token => None,
        }
    }
}

// ============================================================================
// Handler Contract
// ============================================================================

/// Everything a protocol handler is configured with
#[derive(Clone)]
pub struct HandlerContext {
    /// Registries used to validate requests
    pub state: Arc<GatewayState>,
    /// Stream limit for the connection's protocol settings
    pub max_concurrent_streams: u32,
    /// Authentication mode of the connection
    pub auth: AuthContext,
    /// Remote address of the client
    pub peer_addr: SocketAddr,
}

/// Error building a handler for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to build protocol handler: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Serves one negotiated connection
pub trait ProtocolHandler: Send {
    fn serve(self: Box<Self>, connection: TlsConnection) -> HandlerFuture;
}

/// Builds a handler per connection
pub trait HandlerFactory: Send + Sync + 'static {
    fn build(&self, context: HandlerContext) -> Result<Box<dyn ProtocolHandler>, HandlerError>;
}

// ============================================================================
// Idle Handler
// ============================================================================

/// Holds connections open and discards whatever the client sends.
///
/// Used when no protocol handler is configured, so clients can exercise
/// connection setup and authentication classification on their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleHandlerFactory;

impl HandlerFactory for IdleHandlerFactory {
    fn build(&self, context: HandlerContext) -> Result<Box<dyn ProtocolHandler>, HandlerError> {
        Ok(Box::new(IdleHandler {
            peer_addr: context.peer_addr,
        }))
    }
}

struct IdleHandler {
    peer_addr: SocketAddr,
}

impl ProtocolHandler for IdleHandler {
    fn serve(self: Box<Self>, mut connection: TlsConnection) -> HandlerFuture {
        Box::pin(async move {
            let mut buf = vec![0u8; 16 * 1024];
            let mut total = 0usize;
            loop {
                let len = connection.read(&mut buf).await?;
                if len == 0 {
                    break;
                }
                total += len;
            }
            log::debug!("Peer {} closed after sending {} bytes", self.peer_addr, total);
            Ok(())
        })
    }
}
