//! WireGuard Key Material
//!
//! X25519 keys as used by the device identity and the handshake probe.
//! Keys travel as standard base64, the same encoding the registration
//! API and wg-quick configs use.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Curve25519 private key
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// X25519 Diffie-Hellman with a peer key
    pub fn diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(&peer.key).to_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Curve25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A key pair (private + public)
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim())
        .map_err(|_| KeyError::InvalidBase64)?;

    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}
