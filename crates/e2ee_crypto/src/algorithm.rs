//! Closed algorithm sets, one enum per category.
//!
//! Every supported primitive is listed here and dispatched by a single
//! `match` inside the engine, so the audited set lives in one place.
//! Names round-trip through `FromStr`/`Display` for configuration files and
//! metadata; unknown names map to the matching `Unsupported*` error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Symmetric ciphers known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CipherAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
    /// Listed for the advisory tables only. No authentication, refused by policy.
    Aes256Cbc,
}

impl CipherAlgorithm {
    pub const KEY_LEN: usize = 32;
    pub const TAG_LEN: usize = 16;

    pub fn key_len(self) -> usize {
        Self::KEY_LEN
    }

    pub fn nonce_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::ChaCha20Poly1305 => 12,
            CipherAlgorithm::XChaCha20Poly1305 => 24,
            CipherAlgorithm::Aes256Cbc => 16,
        }
    }

    pub fn is_authenticated(self) -> bool {
        !matches!(self, CipherAlgorithm::Aes256Cbc)
    }

    pub fn is_secure(self) -> bool {
        match self {
            CipherAlgorithm::Aes256Gcm
            | CipherAlgorithm::ChaCha20Poly1305
            | CipherAlgorithm::XChaCha20Poly1305 => true,
            // padding oracles
            CipherAlgorithm::Aes256Cbc => false,
        }
    }

    pub fn security_level(self) -> u32 {
        match self {
            CipherAlgorithm::Aes256Gcm
            | CipherAlgorithm::ChaCha20Poly1305
            | CipherAlgorithm::XChaCha20Poly1305 => 256,
            CipherAlgorithm::Aes256Cbc => 128,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "AES-256-GCM",
            CipherAlgorithm::ChaCha20Poly1305 => "CHACHA20-POLY1305",
            CipherAlgorithm::XChaCha20Poly1305 => "XCHACHA20-POLY1305",
            CipherAlgorithm::Aes256Cbc => "AES-256-CBC",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "AES-256-GCM" | "AES256-GCM" => Ok(CipherAlgorithm::Aes256Gcm),
            "CHACHA20-POLY1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            "XCHACHA20-POLY1305" => Ok(CipherAlgorithm::XChaCha20Poly1305),
            "AES-256-CBC" | "AES256-CBC" => Ok(CipherAlgorithm::Aes256Cbc),
            _ => Err(CryptoError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Diffie-Hellman style key agreement protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyExchangeProtocol {
    X25519,
}

impl KeyExchangeProtocol {
    pub fn private_key_len(self) -> usize {
        match self {
            KeyExchangeProtocol::X25519 => 32,
        }
    }

    pub fn public_key_len(self) -> usize {
        match self {
            KeyExchangeProtocol::X25519 => 32,
        }
    }

    pub fn is_secure(self) -> bool {
        match self {
            KeyExchangeProtocol::X25519 => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyExchangeProtocol::X25519 => "X25519",
        }
    }
}

impl fmt::Display for KeyExchangeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyExchangeProtocol {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "X25519" => Ok(KeyExchangeProtocol::X25519),
            _ => Err(CryptoError::UnsupportedProtocol(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureAlgorithm {
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ED25519",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ED25519" => Ok(SignatureAlgorithm::Ed25519),
            _ => Err(CryptoError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 | HashAlgorithm::Blake3 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
            HashAlgorithm::Blake3 => "BLAKE3",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            "BLAKE3" => Ok(HashAlgorithm::Blake3),
            _ => Err(CryptoError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Key derivation functions accepted in [`crate::context::KeyDerivationParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlgorithm {
    HkdfSha256,
    Argon2id,
}

impl FromStr for KdfAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HKDF" | "HKDF-SHA256" => Ok(KdfAlgorithm::HkdfSha256),
            "ARGON2ID" => Ok(KdfAlgorithm::Argon2id),
            _ => Err(CryptoError::UnsupportedKdf(s.to_string())),
        }
    }
}

/// What a [`crate::key::CryptoKey`]'s raw bytes are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    /// AEAD key bound to one cipher.
    Symmetric(CipherAlgorithm),
    /// Generic 32-byte secret: DH outputs, KDF input, ratchet keys.
    /// Encrypts under the engine's default cipher.
    Secret,
    X25519Private,
    X25519Public,
    Ed25519Private,
    Ed25519Public,
}

impl KeyAlgorithm {
    pub fn exchange_protocol(self) -> Option<KeyExchangeProtocol> {
        match self {
            KeyAlgorithm::X25519Private | KeyAlgorithm::X25519Public => {
                Some(KeyExchangeProtocol::X25519)
            }
            _ => None,
        }
    }

    pub fn is_private(self) -> bool {
        matches!(self, KeyAlgorithm::X25519Private | KeyAlgorithm::Ed25519Private)
    }

    pub fn is_public(self) -> bool {
        matches!(self, KeyAlgorithm::X25519Public | KeyAlgorithm::Ed25519Public)
    }

    /// Usable as AEAD / HKDF input key material.
    pub fn is_secret(self) -> bool {
        matches!(self, KeyAlgorithm::Symmetric(_) | KeyAlgorithm::Secret)
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Symmetric(c) => write!(f, "{c}"),
            KeyAlgorithm::Secret => f.write_str("SECRET"),
            KeyAlgorithm::X25519Private => f.write_str("X25519-PRIVATE"),
            KeyAlgorithm::X25519Public => f.write_str("X25519-PUBLIC"),
            KeyAlgorithm::Ed25519Private => f.write_str("ED25519-PRIVATE"),
            KeyAlgorithm::Ed25519Public => f.write_str("ED25519-PUBLIC"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_sizes_follow_cipher() {
        assert_eq!(CipherAlgorithm::Aes256Gcm.nonce_len(), 12);
        assert_eq!(CipherAlgorithm::ChaCha20Poly1305.nonce_len(), 12);
        assert_eq!(CipherAlgorithm::XChaCha20Poly1305.nonce_len(), 24);
    }

    #[test]
    fn cbc_is_flagged_insecure() {
        assert!(!CipherAlgorithm::Aes256Cbc.is_secure());
        assert!(!CipherAlgorithm::Aes256Cbc.is_authenticated());
        assert_eq!(CipherAlgorithm::Aes256Cbc.security_level(), 128);
        assert_eq!(CipherAlgorithm::Aes256Gcm.security_level(), 256);
    }

    #[test]
    fn names_round_trip() {
        for c in [
            CipherAlgorithm::Aes256Gcm,
            CipherAlgorithm::ChaCha20Poly1305,
            CipherAlgorithm::XChaCha20Poly1305,
            CipherAlgorithm::Aes256Cbc,
        ] {
            assert_eq!(c.name().parse::<CipherAlgorithm>().unwrap(), c);
        }
        assert_eq!("sha-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("hkdf".parse::<KdfAlgorithm>().unwrap(), KdfAlgorithm::HkdfSha256);
    }

    #[test]
    fn unknown_names_map_to_typed_errors() {
        assert!(matches!(
            "DES".parse::<CipherAlgorithm>(),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            "ECDH-P256".parse::<KeyExchangeProtocol>(),
            Err(CryptoError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            "PBKDF2".parse::<KdfAlgorithm>(),
            Err(CryptoError::UnsupportedKdf(_))
        ));
    }
}
