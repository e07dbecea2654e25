//! Device token registry
//!
//! Tracks the destination tokens registered for each topic. Notifications
//! for unregistered tokens are rejected by the protocol handler; tokens
//! registered with an expiration are reported as expired once that time has
//! passed. The registry only stores expirations; it never evicts.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

/// When a registered device token stops being valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenExpiration {
    /// Token never expires
    Never,
    /// Token expires (or expired) at the given time
    At(SystemTime),
}

impl From<Option<SystemTime>> for TokenExpiration {
    fn from(expiration: Option<SystemTime>) -> Self {
        match expiration {
            Some(at) => TokenExpiration::At(at),
            None => TokenExpiration::Never,
        }
    }
}

/// Registry of device tokens by topic
#[derive(Default)]
pub struct DeviceTokenRegistry {
    /// topic -> (token -> expiration)
    tokens_by_topic: RwLock<HashMap<String, HashMap<String, TokenExpiration>>>,
}

impl DeviceTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `topic`. Registering the same pair again
    /// replaces its expiration.
    pub fn register(&self, topic: &str, token: &str, expiration: Option<SystemTime>) {
        let mut tokens_by_topic = self
            .tokens_by_topic
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        log::debug!("Registering device token for topic '{}'", topic);

        tokens_by_topic
            .entry(topic.to_string())
            .or_default()
            .insert(token.to_string(), expiration.into());
    }

    /// Whether `token` is registered for `topic`, expired or not
    pub fn is_registered(&self, token: &str, topic: &str) -> bool {
        self.expiration(token, topic).is_some()
    }

    /// Stored expiration for the pair, or `None` if it was never registered
    pub fn expiration(&self, token: &str, topic: &str) -> Option<TokenExpiration> {
        self.tokens_by_topic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .and_then(|tokens| tokens.get(token))
            .copied()
    }

    /// Remove every registered token
    pub fn clear(&self) {
        self.tokens_by_topic
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::info!("Cleared all device tokens");
    }

    /// Number of registered (topic, token) pairs
    pub fn len(&self) -> usize {
        self.tokens_by_topic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
