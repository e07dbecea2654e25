//! Provider authentication tokens
//!
//! Builds and caches the signed bearer credential a client presents in the
//! `authorization` header when it uses token-based authentication:
//!
//! ```text
//! base64url(header) "." base64url(claims) "." base64url(signature)
//! ```
//!
//! Every segment is URL-safe base64 with the `=` padding removed. The
//! signature is ECDSA over P-256 with SHA-256 in the fixed-width `r || s`
//! form (64 bytes), computed over the ASCII bytes of `header.claims`.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};

use crate::keys::Verifier;

// ============================================================================
// Constants
// ============================================================================

/// The only signing algorithm tokens are issued with
pub const TOKEN_ALGORITHM: &str = "ES256";

/// Token type carried in the header
pub const TOKEN_TYPE: &str = "JWT";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building or signing a token
#[derive(Debug)]
pub enum SigningError {
    /// Requested algorithm is not ES256
    UnsupportedAlgorithm(String),
    /// Private key is not a usable P-256 PKCS#8 document
    InvalidKey(String),
    /// The signing operation itself failed
    Signature,
    /// Header or claims could not be serialized
    Serialization(serde_json::Error),
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningError::UnsupportedAlgorithm(alg) => {
                write!(f, "unsupported signing algorithm: {}", alg)
            }
            SigningError::InvalidKey(msg) => write!(f, "invalid signing key: {}", msg),
            SigningError::Signature => write!(f, "failed to sign token"),
            SigningError::Serialization(e) => write!(f, "failed to serialize token: {}", e),
        }
    }
}

impl std::error::Error for SigningError {}

/// Errors raised while decoding a token received from a client
#[derive(Debug)]
pub enum TokenError {
    /// Token does not consist of three non-empty segments
    Malformed,
    /// Header carries no `kid`
    MissingKeyId,
    /// A segment is not valid base64url or not the expected JSON
    Jwt(jsonwebtoken::errors::Error),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "token must have three non-empty segments"),
            TokenError::MissingKeyId => write!(f, "token header has no key id"),
            TokenError::Jwt(e) => write!(f, "invalid token: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

// ============================================================================
// Token Segments
// ============================================================================

/// Token header. Field order is fixed so the signing input is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

/// Token claims. `iat` is carried as a decimal string of Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: String,
}

impl TokenClaims {
    /// Issued-at as Unix seconds, if the claim is a valid number
    pub fn issued_at(&self) -> Option<u64> {
        self.iat.parse().ok()
    }
}

// ============================================================================
// Signer
// ============================================================================

/// Builds and caches a signed token for one issuer and signing key.
///
/// The token is computed on first use and reused until [`invalidate`] is
/// called, typically after the server reports it as expired.
///
/// [`invalidate`]: TokenSigner::invalidate
pub struct TokenSigner {
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
    issuer: String,
    key_id: String,
    cached: Mutex<Option<String>>,
}

impl TokenSigner {
    /// Create a signer from a PKCS#8 encoded P-256 private key.
    pub fn new(pkcs8: &[u8], issuer: &str, key_id: &str) -> Result<Self, SigningError> {
        Self::with_algorithm(TOKEN_ALGORITHM, pkcs8, issuer, key_id)
    }

    /// Create a signer for a named algorithm. Only `ES256` is supported.
    pub fn with_algorithm(
        algorithm: &str,
        pkcs8: &[u8],
        issuer: &str,
        key_id: &str,
    ) -> Result<Self, SigningError> {
        if algorithm != TOKEN_ALGORITHM {
            return Err(SigningError::UnsupportedAlgorithm(algorithm.to_string()));
        }

        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;

        Ok(TokenSigner {
            key_pair,
            rng,
            issuer: issuer.to_string(),
            key_id: key_id.to_string(),
            cached: Mutex::new(None),
        })
    }

    /// Issuer (team identifier) placed in the `iss` claim
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Key identifier placed in the `kid` header
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Uncompressed SEC1 public key matching the signing key
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    /// Return the cached token, signing a new one if nothing is cached.
    pub fn token(&self) -> Result<String, SigningError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = self.sign_new()?;
        log::debug!(
            "Signed new token for issuer '{}' (kid={})",
            self.issuer,
            self.key_id
        );
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Discard the cached token; the next [`token`](Self::token) call signs
    /// a fresh one with a new issued-at time.
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.take().is_some() {
            log::debug!("Invalidated token for issuer '{}'", self.issuer);
        }
    }

    fn sign_new(&self) -> Result<String, SigningError> {
        let header = TokenHeader {
            alg: TOKEN_ALGORITHM.to_string(),
            typ: TOKEN_TYPE.to_string(),
            kid: self.key_id.clone(),
        };
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            iat: unix_seconds().to_string(),
        };

        let header_json = serde_json::to_vec(&header).map_err(SigningError::Serialization)?;
        let claims_json = serde_json::to_vec(&claims).map_err(SigningError::Serialization)?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );

        let signature = self
            .key_pair
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|_| SigningError::Signature)?;

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.as_ref())
        ))
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Decoding
// ============================================================================

/// A token split into its decoded segments
#[derive(Debug, Clone)]
pub struct AuthenticationToken {
    pub header: TokenHeader,
    pub claims: TokenClaims,
    encoded: String,
}

impl AuthenticationToken {
    /// Decode a `header.claims.signature` token. The signature is not
    /// checked here; see [`verify`](Self::verify).
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 || segments.iter().any(|segment| segment.is_empty()) {
            return Err(TokenError::Malformed);
        }

        let mut validation = validation();
        validation.insecure_disable_signature_validation();

        // Signature checks are off, so the key is never used
        let decoded = jsonwebtoken::decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .map_err(TokenError::Jwt)?;

        let header = decoded.header;
        Ok(AuthenticationToken {
            header: TokenHeader {
                alg: format!("{:?}", header.alg),
                typ: header.typ.unwrap_or_default(),
                kid: header.kid.ok_or(TokenError::MissingKeyId)?,
            },
            claims: decoded.claims,
            encoded: token.to_string(),
        })
    }

    /// Check that the token is ES256 and signed by `verifier`'s key.
    pub fn verify(&self, verifier: &Verifier) -> bool {
        let key = match verifier.decoding_key() {
            Ok(key) => key,
            Err(e) => {
                log::debug!("Unusable verification key: {}", e);
                return false;
            }
        };

        match jsonwebtoken::decode::<TokenClaims>(&self.encoded, &key, &validation()) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Token for kid '{}' rejected: {}", self.header.kid, e);
                false
            }
        }
    }
}

/// ES256 validation without time-based claims. Expiry is judged by the
/// caller from `iat`, which tokens carry as a string.
fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

// ============================================================================
// Unit Tests
// ============================================================================
