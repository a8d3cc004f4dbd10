//! In-process key material
//!
//! X25519 key handling used when the external tool is not involved: the
//! in-memory control backend generates keypairs here, and reactivation
//! derives a stored client's public key from its private key.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::subscription::validation::ValidationError;

/// Length of a raw X25519 key
const KEY_LENGTH: usize = 32;

/// Random bytes behind an access token
pub const ACCESS_TOKEN_BYTES: usize = 24;

/// A client keypair, both halves Base64-encoded
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a new random private key
///
/// ```
/// use wg_provisioner::peer::keys::{derive_public_key, generate_private_key};
///
/// let private = generate_private_key();
/// assert_eq!(private.len(), 44);
/// assert!(derive_public_key(&private).is_ok());
/// ```
#[must_use]
pub fn generate_private_key() -> String {
    let mut key_bytes = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key_bytes);

    // StaticSecret clamps the scalar
    let secret = StaticSecret::from(key_bytes);
    BASE64.encode(secret.as_bytes())
}

/// Derive the Base64 public key for a Base64 private key
pub fn derive_public_key(private_key: &str) -> Result<String, ValidationError> {
    let bytes = BASE64
        .decode(private_key.trim())
        .map_err(|_| ValidationError::InvalidKeyEncoding)?;
    let key_array: [u8; KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ValidationError::InvalidKeyLength {
            length: private_key.trim().len(),
        })?;

    let secret = StaticSecret::from(key_array);
    Ok(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}

/// Generate a keypair without the external tool
#[must_use]
pub fn generate_keypair() -> KeyPair {
    let private_key = generate_private_key();
    // A freshly encoded 32-byte key always decodes
    let public_key = derive_public_key(&private_key).unwrap_or_default();
    KeyPair {
        private_key,
        public_key,
    }
}

/// Generate a URL-safe single-use access token
#[must_use]
pub fn generate_access_token() -> String {
    let mut bytes = [0u8; ACCESS_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
