//! WireGuard key material.
//!
//! WireGuard uses Curve25519 for key exchange. Every key (private, public
//! and preshared) is 32 bytes and travels as standard base64.

use std::fmt;

use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use tracing::debug;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{Result, WireGuardError};

/// WireGuard key size in bytes.
pub const KEY_SIZE: usize = 32;

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
    <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
        .map_err(|_| WireGuardError::InvalidKeyLength(bytes.len()))
}

fn encode_key(bytes: &[u8; KEY_SIZE]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Fills a 32-byte buffer from the operating system CSPRNG.
fn random_key_bytes() -> Result<[u8; KEY_SIZE]> {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| WireGuardError::KeyGeneration(e.to_string()))?;
    Ok(bytes)
}

/// A WireGuard public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or not 32 bytes.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// A WireGuard private key. Never printed.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a fresh, clamped private key.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::KeyGeneration`] if the entropy source fails.
    pub fn generate() -> Result<Self> {
        let mut bytes = random_key_bytes()?;
        // Curve25519 clamping, as `wg genkey` does.
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Ok(Self(bytes))
    }

    /// Creates a private key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey::from(X25519PublicKey::from(&secret))
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a private key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or not 32 bytes.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

/// An optional symmetric key mixed into the handshake.
#[derive(Clone)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    /// Generates a new random preshared key.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::KeyGeneration`] if the entropy source fails.
    pub fn generate() -> Result<Self> {
        random_key_bytes().map(Self)
    }

    /// Creates a preshared key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the preshared key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a preshared key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or not 32 bytes.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey([REDACTED])")
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PresharedKey {}

/// A private key together with its derived public key.
#[derive(Clone)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::KeyGeneration`] if the entropy source fails.
    pub fn generate() -> Result<Self> {
        PrivateKey::generate().map(Self::from_private_key)
    }

    /// Creates a key pair from an existing private key.
    #[must_use]
    pub fn from_private_key(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Returns the private key.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Returns the public key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// Everything a new peer needs: a key pair plus a preshared key.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    /// The peer's public key.
    pub public: PublicKey,
    /// The peer's private key.
    pub private: PrivateKey,
    /// Preshared key shared between the peer and the server.
    pub preshared: PresharedKey,
}

/// Source of fresh key material for new peers.
pub trait KeyGenerator: Send + Sync {
    /// Produces fresh key material. Implementations never reuse output.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::KeyGeneration`] if no entropy is available.
    fn generate(&self) -> Result<KeyMaterial>;
}

/// [`KeyGenerator`] backed by the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsKeyGenerator;

impl KeyGenerator for OsKeyGenerator {
    fn generate(&self) -> Result<KeyMaterial> {
        let pair = KeyPair::generate()?;
        let preshared = PresharedKey::generate()?;
        debug!(public_key = %pair.public, "generated peer key material");
        Ok(KeyMaterial {
            public: pair.public,
            private: pair.private,
            preshared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_is_clamped() {
        let key = PrivateKey::generate().expect("generate");
        let bytes = key.as_bytes();
        assert_eq!(bytes[0] & 7, 0);
        assert_eq!(bytes[31] & 128, 0);
        assert_eq!(bytes[31] & 64, 64);
    }

    #[test]
    fn public_key_derivation_is_deterministic() {
        let private = PrivateKey::generate().expect("generate");
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn known_vector_derivation() {
        // RFC 7748 section 6.1, Alice's key pair.
        let private = PrivateKey::from_bytes([
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ]);
        let expected = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        assert_eq!(private.public_key().as_bytes(), &expected);
    }

    #[test]
    fn generator_never_repeats() {
        let generator = OsKeyGenerator;
        let a = generator.generate().expect("generate");
        let b = generator.generate().expect("generate");
        assert_ne!(a.public, b.public);
        assert_ne!(a.private, b.private);
        assert_ne!(a.preshared, b.preshared);
    }

    #[test]
    fn generated_material_is_consistent() {
        let material = OsKeyGenerator.generate().expect("generate");
        assert_eq!(material.private.public_key(), material.public);
        assert_eq!(material.public.to_base64().len(), 44);
    }

    #[test]
    fn debug_redacts_secrets() {
        let material = OsKeyGenerator.generate().expect("generate");
        let debug = format!("{material:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&material.private.to_base64()));
        assert!(!debug.contains(&material.preshared.to_base64()));
    }

    #[test]
    fn short_key_rejected() {
        let err = PublicKey::from_base64("AAAA").expect_err("3 bytes is not a key");
        assert!(matches!(err, WireGuardError::InvalidKeyLength(3)));
    }

    #[test]
    fn garbage_rejected() {
        let err = PrivateKey::from_base64("not base64!").expect_err("invalid");
        assert!(matches!(err, WireGuardError::InvalidBase64(_)));
    }

    #[test]
    fn public_key_serializes_as_base64_string() {
        let public = PrivateKey::generate().expect("generate").public_key();
        let json = serde_json::to_string(&public).expect("serialize");
        assert_eq!(json, format!("\"{}\"", public.to_base64()));
        let back: PublicKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, public);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn base64_decode_accepts_any_encoded_key(bytes in prop::array::uniform32(any::<u8>())) {
                let key = PresharedKey::from_bytes(bytes);
                let decoded = PresharedKey::from_base64(&key.to_base64());
                prop_assert_eq!(decoded.ok(), Some(key));
            }

            #[test]
            fn derivation_ignores_clamped_bits(seed in prop::array::uniform32(any::<u8>())) {
                let mut clamped = seed;
                clamped[0] &= 248;
                clamped[31] &= 127;
                clamped[31] |= 64;
                prop_assert_eq!(
                    PrivateKey::from_bytes(seed).public_key(),
                    PrivateKey::from_bytes(clamped).public_key()
                );
            }
        }
    }
}
