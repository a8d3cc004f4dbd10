//! Input validation for lifecycle requests
//!
//! Every check here runs before any side effect: a request that fails
//! validation never allocates an address, never touches the peer store and
//! never writes a row.
//!
//! # Validation Rules
//!
//! - **Identifiers**: non-empty after trimming, at most 254 characters, no
//!   whitespace or control characters
//! - **Plans**: must exist in the catalog with a strictly positive price
//! - **`WireGuard` keys**: Base64, 44 characters, 32 bytes decoded
//! - **Endpoints**: `host:port` with a non-zero port
//!
//! ```
//! use wg_provisioner::subscription::validation::{validate_identifier, validate_paid_plan};
//!
//! assert!(validate_identifier("a@x.com").is_ok());
//! assert!(validate_identifier("   ").is_err());
//! assert!(validate_paid_plan(1).is_ok());
//! assert!(validate_paid_plan(99).is_err());
//! ```

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use super::plan::{find_plan, Plan};

/// `WireGuard` key length in bytes (before Base64 encoding)
pub const WG_KEY_LENGTH: usize = 32;

/// `WireGuard` key Base64 length
pub const WG_KEY_BASE64_LENGTH: usize = 44;

/// Maximum identifier length (longest legal e-mail address)
pub const MAX_IDENTIFIER_LENGTH: usize = 254;

/// Validation error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// Identifier is missing
    #[error("Identifier cannot be empty")]
    EmptyIdentifier,

    /// Identifier is too long
    #[error("Identifier exceeds maximum length of {MAX_IDENTIFIER_LENGTH} characters: {length}")]
    IdentifierTooLong { length: usize },

    /// Identifier contains whitespace or control characters
    #[error("Identifier contains whitespace or control characters")]
    InvalidIdentifierCharacters,

    /// Plan id not in the catalog
    #[error("Unknown plan id: {plan_id}")]
    UnknownPlan { plan_id: u32 },

    /// Plan price is zero or negative
    #[error("Plan {plan_id} has non-positive price {price}")]
    NonPositivePrice { plan_id: u32, price: f64 },

    /// `WireGuard` key has invalid length
    #[error("WireGuard key has invalid length: expected {WG_KEY_BASE64_LENGTH}, got {length}")]
    InvalidKeyLength { length: usize },

    /// `WireGuard` key has invalid Base64 encoding
    #[error("WireGuard key has invalid Base64 encoding")]
    InvalidKeyEncoding,

    /// Endpoint is invalid
    #[error("Invalid endpoint format: {message}")]
    InvalidEndpoint { message: String },

    /// Access token is empty
    #[error("Access token cannot be empty")]
    EmptyToken,
}

/// Validate and normalise a contact identifier
///
/// Returns the trimmed identifier.
pub fn validate_identifier(identifier: &str) -> Result<&str, ValidationError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }

    let length = trimmed.chars().count();
    if length > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::IdentifierTooLong { length });
    }

    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidIdentifierCharacters);
    }

    Ok(trimmed)
}

/// Resolve a purchasable plan
pub fn validate_paid_plan(plan_id: u32) -> Result<&'static Plan, ValidationError> {
    let plan = find_plan(plan_id).ok_or(ValidationError::UnknownPlan { plan_id })?;
    if plan.price <= 0.0 || plan.price.is_nan() {
        return Err(ValidationError::NonPositivePrice {
            plan_id,
            price: plan.price,
        });
    }
    Ok(plan)
}

/// Validate a `WireGuard` public or private key
///
/// ```
/// use wg_provisioner::subscription::validation::validate_wg_key;
///
/// assert!(validate_wg_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_ok());
/// assert!(validate_wg_key("short").is_err());
/// ```
pub fn validate_wg_key(key: &str) -> Result<(), ValidationError> {
    if key.len() != WG_KEY_BASE64_LENGTH {
        return Err(ValidationError::InvalidKeyLength { length: key.len() });
    }

    match BASE64.decode(key) {
        Ok(bytes) if bytes.len() == WG_KEY_LENGTH => Ok(()),
        _ => Err(ValidationError::InvalidKeyEncoding),
    }
}

/// Validate a server endpoint (`IP:port` or `hostname:port`)
pub fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(ValidationError::InvalidEndpoint {
                message: "Port cannot be 0".into(),
            });
        }
        return Ok(());
    }

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ValidationError::InvalidEndpoint {
            message: format!("Missing port in {endpoint}"),
        })?;

    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ValidationError::InvalidEndpoint {
            message: format!("Invalid hostname: {host}"),
        });
    }

    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ValidationError::InvalidEndpoint {
            message: format!("Invalid port: {port}"),
        }),
        Ok(_) => Ok(()),
    }
}

/// Validate an access token presented for redemption
pub fn validate_token(token: &str) -> Result<&str, ValidationError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyToken);
    }
    Ok(trimmed)
}
