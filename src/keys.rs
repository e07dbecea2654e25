//! Signing key registry for token authentication
//!
//! Maintains the authoritative mappings used to validate provider tokens:
//! - Key IDs and their verifiers
//! - Key IDs and the team that owns them
//! - Teams and the topics their keys may act on
//!
//! A team has exactly one active key set and one topic set. Registering a
//! key for a team replaces every key and topic previously registered for it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::DecodingKey;
use ring::agreement::{self, EphemeralPrivateKey, ECDH_P256};
use ring::rand::SystemRandom;
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1, ECDSA_P256_SHA256_FIXED};
use x509_parser::prelude::*;

use crate::token::TOKEN_ALGORITHM;

// ============================================================================
// Constants
// ============================================================================

/// Length of an uncompressed SEC1 P-256 point (0x04 || X || Y)
const P256_POINT_LEN: usize = 65;

/// Length of one affine coordinate of a P-256 point
const P256_COORDINATE_LEN: usize = 32;

/// Length of a fixed-width `r || s` P-256 signature
const P256_FIXED_SIGNATURE_LEN: usize = 64;

/// id-ecPublicKey
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

/// prime256v1 / secp256r1
const OID_PRIME256V1: &str = "1.2.840.10045.3.1.7";

// ============================================================================
// Errors
// ============================================================================

/// Errors during key registration. A failed registration never changes the
/// registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// Algorithm hint is not ES256
    UnsupportedAlgorithm(String),
    /// Key material is not a P-256 public key
    InvalidKey(String),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::UnsupportedAlgorithm(alg) => {
                write!(f, "unsupported verification algorithm: {}", alg)
            }
            RegistrationError::InvalidKey(msg) => write!(f, "invalid public key: {}", msg),
        }
    }
}

impl std::error::Error for RegistrationError {}

// ============================================================================
// Verifier
// ============================================================================

/// A P-256 public key bound to ECDSA with SHA-256
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    public_key: Vec<u8>,
}

impl Verifier {
    /// Build a verifier from an uncompressed SEC1 point or a DER encoded
    /// SubjectPublicKeyInfo.
    pub fn new(algorithm: &str, key_material: &[u8]) -> Result<Self, RegistrationError> {
        if algorithm != TOKEN_ALGORITHM {
            return Err(RegistrationError::UnsupportedAlgorithm(
                algorithm.to_string(),
            ));
        }

        let public_key = if key_material.len() == P256_POINT_LEN {
            key_material.to_vec()
        } else {
            point_from_spki(key_material)?
        };

        if public_key.len() != P256_POINT_LEN || public_key[0] != 0x04 {
            return Err(RegistrationError::InvalidKey(
                "expected an uncompressed P-256 point".to_string(),
            ));
        }
        check_on_curve(&public_key)?;

        Ok(Verifier { public_key })
    }

    /// Uncompressed SEC1 encoding of the key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// The key as a JWT decoding key, from its affine coordinates
    pub fn decoding_key(&self) -> Result<DecodingKey, jsonwebtoken::errors::Error> {
        let (x, y) = self.public_key[1..].split_at(P256_COORDINATE_LEN);
        DecodingKey::from_ec_components(&URL_SAFE_NO_PAD.encode(x), &URL_SAFE_NO_PAD.encode(y))
    }

    /// Verify a signature over `message`. Accepts both the fixed-width
    /// `r || s` form and the ASN.1 DER form.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let algorithm = if signature.len() == P256_FIXED_SIGNATURE_LEN {
            &ECDSA_P256_SHA256_FIXED
        } else {
            &ECDSA_P256_SHA256_ASN1
        };

        UnparsedPublicKey::new(algorithm, &self.public_key)
            .verify(message, signature)
            .is_ok()
    }
}

/// Reject points that are not on the P-256 curve. ring parses ECDSA public
/// keys only when verifying, so the point is checked with a throwaway ECDH
/// agreement, which validates the peer point up front.
fn check_on_curve(point: &[u8]) -> Result<(), RegistrationError> {
    let rng = SystemRandom::new();
    let ephemeral = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
        .map_err(|_| RegistrationError::InvalidKey("key agreement unavailable".to_string()))?;

    agreement::agree_ephemeral(
        ephemeral,
        &agreement::UnparsedPublicKey::new(&ECDH_P256, point),
        |_| (),
    )
    .map_err(|_| RegistrationError::InvalidKey("point is not on the P-256 curve".to_string()))
}

fn point_from_spki(der: &[u8]) -> Result<Vec<u8>, RegistrationError> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(der)
        .map_err(|e| RegistrationError::InvalidKey(format!("{}", e)))?;

    if spki.algorithm.algorithm.to_id_string() != OID_EC_PUBLIC_KEY {
        return Err(RegistrationError::InvalidKey(format!(
            "not an EC key ({})",
            spki.algorithm.algorithm.to_id_string()
        )));
    }

    let curve = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.as_oid().ok())
        .map(|oid| oid.to_id_string());
    if curve.as_deref() != Some(OID_PRIME256V1) {
        return Err(RegistrationError::InvalidKey(
            "key is not on the P-256 curve".to_string(),
        ));
    }

    Ok(spki.subject_public_key.data.to_vec())
}

// ============================================================================
// Registry Structure
// ============================================================================

/// A registered key and the team it belongs to
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key_id: String,
    pub team_id: String,
    pub verifier: Arc<Verifier>,
}

#[derive(Default)]
struct KeyTables {
    /// Map from key ID to its record
    keys: HashMap<String, KeyRecord>,
    /// Map from team ID to the topics its keys are authorized for
    topics_by_team: HashMap<String, HashSet<String>>,
}

/// Registry of verification keys, teams, and authorized topics
#[derive(Default)]
pub struct KeyRegistry {
    tables: RwLock<KeyTables>,
}

impl KeyRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a public key for `team_id`, superseding every key and topic
    /// previously registered for that team.
    ///
    /// The key material is validated before anything is removed, so a
    /// failed call leaves the team exactly as it was.
    pub fn register_key<I, S>(
        &self,
        key_material: &[u8],
        algorithm: &str,
        team_id: &str,
        key_id: &str,
        topics: I,
    ) -> Result<(), RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let verifier = Arc::new(Verifier::new(algorithm, key_material)?);
        let topics: HashSet<String> = topics.into_iter().map(Into::into).collect();

        let mut tables = self.write();

        let before = tables.keys.len();
        tables.keys.retain(|_, record| record.team_id != team_id);
        let superseded = before - tables.keys.len();

        log::info!(
            "Registering key '{}' for team '{}' with {} topic(s) (superseded {} key(s))",
            key_id,
            team_id,
            topics.len(),
            superseded
        );

        tables.keys.insert(
            key_id.to_string(),
            KeyRecord {
                key_id: key_id.to_string(),
                team_id: team_id.to_string(),
                verifier,
            },
        );
        tables.topics_by_team.insert(team_id.to_string(), topics);

        Ok(())
    }

    /// Verifier registered under `key_id`
    pub fn verifier(&self, key_id: &str) -> Option<Arc<Verifier>> {
        self.read()
            .keys
            .get(key_id)
            .map(|record| Arc::clone(&record.verifier))
    }

    /// Team owning `key_id`
    pub fn team(&self, key_id: &str) -> Option<String> {
        self.read()
            .keys
            .get(key_id)
            .map(|record| record.team_id.clone())
    }

    /// Full record for `key_id`
    pub fn key(&self, key_id: &str) -> Option<KeyRecord> {
        self.read().keys.get(key_id).cloned()
    }

    /// Topics `team_id` is authorized for
    pub fn topics(&self, team_id: &str) -> Option<HashSet<String>> {
        self.read().topics_by_team.get(team_id).cloned()
    }

    /// Remove every key, team, and topic
    pub fn clear(&self) {
        let mut tables = self.write();
        tables.keys.clear();
        tables.topics_by_team.clear();
        log::info!("Cleared all signing keys");
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, KeyTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, KeyTables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
