//! Command line and fixture configuration for the mock push gateway binary
//!
//! Flags:
//!   --port <port>        Listening port (default 8443)
//!   --cert <path>        PEM certificate chain (default certs/cert.pem)
//!   --key <path>         PEM private key (default certs/key.pem)
//!   --client-ca <path>   PEM trust anchors for client certificates (optional)
//!   --fixtures <path>    JSON file with keys and device tokens to register

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use serde::Deserialize;

use crate::keys::RegistrationError;
use crate::state::GatewayState;
use crate::token::TOKEN_ALGORITHM;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8443;

// ============================================================================
// Errors
// ============================================================================

/// Errors loading configuration
#[derive(Debug)]
pub enum ConfigError {
    /// A file could not be read
    Io(PathBuf, io::Error),
    /// Fixtures file is not valid JSON
    Json(serde_json::Error),
    /// A flag has an unusable value
    InvalidArgument(String),
    /// A PEM file has no usable entries
    Pem(PathBuf, String),
    /// A fixture key is not valid base64
    Key(String),
    /// A fixture key was rejected by the key registry
    Registration(RegistrationError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "failed to read {}: {}", path.display(), e),
            ConfigError::Json(e) => write!(f, "invalid fixtures file: {}", e),
            ConfigError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ConfigError::Pem(path, msg) => write!(f, "invalid PEM in {}: {}", path.display(), msg),
            ConfigError::Key(msg) => write!(f, "invalid fixture key: {}", msg),
            ConfigError::Registration(e) => write!(f, "fixture key rejected: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Command Line
// ============================================================================

/// Settings parsed from the command line
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub client_ca_path: Option<PathBuf>,
    pub fixtures_path: Option<PathBuf>,
}

impl ServerSettings {
    /// Parse settings from `std::env::args()`-style arguments.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let port = match parse_arg(args, "--port") {
            Some(port) => port
                .parse()
                .map_err(|_| ConfigError::InvalidArgument(format!("--port {}", port)))?,
            None => DEFAULT_PORT,
        };

        Ok(ServerSettings {
            port,
            cert_path: parse_arg(args, "--cert")
                .unwrap_or_else(|| "certs/cert.pem".to_string())
                .into(),
            key_path: parse_arg(args, "--key")
                .unwrap_or_else(|| "certs/key.pem".to_string())
                .into(),
            client_ca_path: parse_arg(args, "--client-ca").map(PathBuf::from),
            fixtures_path: parse_arg(args, "--fixtures").map(PathBuf::from),
        })
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// PEM Loading
// ============================================================================

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ConfigError::Io(path.to_path_buf(), e))
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(ConfigError::Pem(
            path.to_path_buf(),
            "no certificates found".to_string(),
        ));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?
        .ok_or_else(|| ConfigError::Pem(path.to_path_buf(), "no private key found".to_string()))
}

/// Load trust anchors for client certificate verification
pub fn load_client_roots(path: &Path) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ConfigError::Pem(path.to_path_buf(), format!("{}", e)))?;
    }
    Ok(roots)
}

// ============================================================================
// Fixtures
// ============================================================================

/// Keys and device tokens registered at startup
#[derive(Debug, Default, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub keys: Vec<KeyFixture>,
    #[serde(default)]
    pub device_tokens: Vec<DeviceTokenFixture>,
}

#[derive(Debug, Deserialize)]
pub struct KeyFixture {
    pub team_id: String,
    pub key_id: String,
    /// Standard base64 of a SEC1 point or DER SubjectPublicKeyInfo
    pub public_key: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceTokenFixture {
    pub topic: String,
    pub token: String,
    /// Unix seconds; absent means the token never expires
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl Fixtures {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Json)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_json(&json)
    }

    /// Register every fixture. Stops at the first invalid key.
    pub fn apply(&self, state: &GatewayState) -> Result<(), ConfigError> {
        for key in &self.keys {
            let material = STANDARD
                .decode(key.public_key.trim())
                .map_err(|e| ConfigError::Key(format!("{}: {}", key.key_id, e)))?;
            state
                .keys()
                .register_key(
                    &material,
                    TOKEN_ALGORITHM,
                    &key.team_id,
                    &key.key_id,
                    key.topics.iter().cloned(),
                )
                .map_err(ConfigError::Registration)?;
        }

        for device in &self.device_tokens {
            let expiration = device
                .expires_at
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
            state
                .devices()
                .register(&device.topic, &device.token, expiration);
        }

        log::info!(
            "Loaded {} key(s) and {} device token(s) from fixtures",
            self.keys.len(),
            self.device_tokens.len()
        );
        Ok(())
    }
}
