//! Peer identity extraction for certificate authentication
//!
//! Renders the subject of a verified client certificate as a principal name
//! in RFC 2253 order (most specific RDN first, comma separated) and pulls
//! the base topic out of its `UID=` attribute:
//!
//!   `UID=com.example.app,CN=Apple Push Services: com.example.app,C=US`
//!     → base topic `com.example.app`

use std::fmt;

use x509_parser::prelude::*;

/// Attribute prefix carrying the base topic
const UID_PREFIX: &str = "UID=";

/// Short names for the attribute types that show up in push certificates
const ATTRIBUTE_NAMES: &[(&str, &str)] = &[
    ("2.5.4.3", "CN"),
    ("2.5.4.6", "C"),
    ("2.5.4.7", "L"),
    ("2.5.4.8", "ST"),
    ("2.5.4.10", "O"),
    ("2.5.4.11", "OU"),
    ("0.9.2342.19200300.100.1.1", "UID"),
    ("0.9.2342.19200300.100.1.25", "DC"),
];

/// Errors while reading a peer certificate
#[derive(Debug)]
pub enum IdentityError {
    /// Failed to parse X.509 DER certificate
    ParseError(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::ParseError(msg) => write!(f, "certificate parse error: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Principal name of a DER-encoded X.509 certificate's subject.
pub fn principal_name(der_cert: &[u8]) -> Result<String, IdentityError> {
    let (_, cert) = X509Certificate::from_der(der_cert)
        .map_err(|e| IdentityError::ParseError(format!("{}", e)))?;

    let rdns: Vec<String> = cert
        .subject()
        .iter()
        .map(|rdn| {
            rdn.iter()
                .map(|attr| {
                    let oid = attr.attr_type().to_id_string();
                    let name = ATTRIBUTE_NAMES
                        .iter()
                        .find(|(id, _)| *id == oid)
                        .map(|(_, name)| name.to_string())
                        .unwrap_or(oid);
                    let value = escape_value(attr.as_str().unwrap_or_default());
                    format!("{}={}", name, value)
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();

    // RFC 2253 lists the last RDN of the sequence first
    Ok(rdns.into_iter().rev().collect::<Vec<_>>().join(","))
}

/// Escape an attribute value the way RFC 2253 section 2.4 requires
fn escape_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let special = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if special {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Base topic from a principal name: the value of the first `UID=`
/// attribute, up to the next unescaped comma, with RFC 2253 escapes removed.
///
/// Only the first `UID=` counts. If its value is empty there is no base
/// topic, even when a later `UID=` has a value.
pub fn base_topic(principal_name: &str) -> Option<String> {
    let start = principal_name.find(UID_PREFIX)? + UID_PREFIX.len();

    let mut value = String::new();
    let mut chars = principal_name[start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => value.extend(chars.next()),
            ',' => break,
            _ => value.push(c),
        }
    }

    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
