//! Mock Push Gateway
//!
//! Authentication core of a push notification gateway emulator:
//! - Signs provider authentication tokens (ES256)
//! - Keeps signing keys, teams, topics, and device tokens
//! - Negotiates TLS/ALPN per connection and classifies it as certificate or
//!   token authenticated
//! - Runs the listener on a caller-supplied or server-owned worker pool

pub mod completion;
pub mod config;
pub mod devices;
pub mod handler;
pub mod identity;
pub mod keys;
pub mod negotiator;
pub mod server;
pub mod state;
pub mod tls;
pub mod token;

pub use completion::Completion;
pub use devices::{DeviceTokenRegistry, TokenExpiration};
pub use handler::{
    AuthContext, HandlerContext, HandlerError, HandlerFactory, ProtocolHandler,
    MAX_CONCURRENT_STREAMS,
};
pub use keys::{KeyRegistry, RegistrationError, Verifier};
pub use negotiator::PUSH_ALPN;
pub use server::{LifecycleError, MockPushServer, MockPushServerBuilder};
pub use state::GatewayState;
pub use token::{AuthenticationToken, SigningError, TokenSigner};
