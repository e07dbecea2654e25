//! Shared gateway state handed to every connection's protocol handler

use std::sync::atomic::{AtomicBool, Ordering};

use crate::devices::DeviceTokenRegistry;
use crate::keys::KeyRegistry;

/// Registries and switches shared by all connections.
///
/// Written by administrative calls (test setup, fixtures), read by handlers.
#[derive(Default)]
pub struct GatewayState {
    keys: KeyRegistry,
    devices: DeviceTokenRegistry,
    emulate_internal_errors: AtomicBool,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signing keys, teams, and topics
    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    /// Registered device tokens
    pub fn devices(&self) -> &DeviceTokenRegistry {
        &self.devices
    }

    /// Make handlers answer every request with an internal server error
    pub fn set_emulate_internal_errors(&self, enabled: bool) {
        log::info!("Internal error emulation {}", if enabled { "enabled" } else { "disabled" });
        self.emulate_internal_errors.store(enabled, Ordering::Relaxed);
    }

    pub fn emulate_internal_errors(&self) -> bool {
        self.emulate_internal_errors.load(Ordering::Relaxed)
    }
}
