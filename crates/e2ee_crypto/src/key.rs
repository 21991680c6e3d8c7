//! Key material plus provenance.
//!
//! `CryptoKey` owns its raw bytes in a `Zeroizing` buffer, so every copy is
//! overwritten when dropped: cache eviction, session close and rotation
//! all erase by dropping. Raw bytes never leave through `Serialize` or
//! `Debug`; only metadata and the key length do.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};
use zeroize::{Zeroize, Zeroizing};

use crate::algorithm::KeyAlgorithm;
use crate::error::CryptoError;

#[derive(Clone)]
pub struct CryptoKey {
    pub id: String,
    pub algorithm: KeyAlgorithm,
    key_data: Zeroizing<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
    pub device_id: String,
    pub parent_key_id: Option<String>,
    pub is_ephemeral: bool,
}

impl CryptoKey {
    /// Wrap existing key material, valid for `ttl` from now.
    pub fn new(
        id: impl Into<String>,
        algorithm: KeyAlgorithm,
        key_data: Vec<u8>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.into(),
            algorithm,
            key_data: Zeroizing::new(key_data),
            created_at,
            expires_at: created_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            user_id: String::new(),
            device_id: String::new(),
            parent_key_id: None,
            is_ephemeral: false,
        }
    }

    pub fn with_owner(mut self, user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.device_id = device_id.into();
        self
    }

    pub fn with_parent(mut self, parent_key_id: impl Into<String>) -> Self {
        self.parent_key_id = Some(parent_key_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.is_ephemeral = true;
        self
    }

    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    pub fn len(&self) -> usize {
        self.key_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_data.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Overwrite and release the raw bytes now instead of at drop.
    pub fn secure_erase(&mut self) {
        self.key_data.zeroize();
        self.key_data.clear();
    }

    /// Raw bytes as a fixed 32-byte array (X25519/Ed25519/AEAD keys).
    pub fn as_array32(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let arr: [u8; 32] = self
            .key_data
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize {
                expected: 32,
                actual: self.key_data.len(),
            })?;
        Ok(Zeroizing::new(arr))
    }

    /// Base64url encoding of a public key. `None` for anything secret.
    pub fn encoded_public(&self) -> Option<String> {
        self.algorithm
            .is_public()
            .then(|| URL_SAFE_NO_PAD.encode(self.key_data.as_slice()))
    }

    /// Rebuild a public key received as base64url (bundles, handshakes).
    pub fn public_from_b64(
        id: impl Into<String>,
        algorithm: KeyAlgorithm,
        encoded: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, CryptoError> {
        if !algorithm.is_public() {
            return Err(CryptoError::InvalidKey(format!(
                "{algorithm} is not a public key algorithm"
            )));
        }
        let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeySize {
                expected: 32,
                actual: bytes.len(),
            });
        }
        Ok(Self::new(id, algorithm, bytes, Duration::zero()).with_expiry(expires_at))
    }

    /// Non-secret description of this key.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            algorithm: self.algorithm,
            created_at: self.created_at,
            expires_at: self.expires_at,
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            parent_key_id: self.parent_key_id.clone(),
            is_ephemeral: self.is_ephemeral,
            key_length: self.key_data.len(),
        }
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("key_data", &format_args!("<{} bytes redacted>", self.key_data.len()))
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .field("parent_key_id", &self.parent_key_id)
            .field("is_ephemeral", &self.is_ephemeral)
            .finish()
    }
}

impl Serialize for CryptoKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.info().serialize(serializer)
    }
}

/// What a key looks like from outside: everything but the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub algorithm: KeyAlgorithm,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
    pub device_id: String,
    pub parent_key_id: Option<String>,
    pub is_ephemeral: bool,
    pub key_length: usize,
}

/// Private/public halves produced together.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private: CryptoKey,
    pub public: CryptoKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::CipherAlgorithm;

    fn sample() -> CryptoKey {
        CryptoKey::new(
            "k1",
            KeyAlgorithm::Symmetric(CipherAlgorithm::Aes256Gcm),
            vec![0xAB; 32],
            Duration::hours(1),
        )
        .with_owner("alice", "phone")
    }

    #[test]
    fn serialisation_never_contains_key_bytes() {
        let key = sample();
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"key_length\":32"));
        assert!(!json.contains("key_data"));
        assert!(!json.to_lowercase().contains(&"ab".repeat(8)));
    }

    #[test]
    fn debug_redacts_bytes() {
        let dbg = format!("{:?}", sample());
        assert!(dbg.contains("redacted"));
        assert!(!dbg.contains("171"));
    }

    #[test]
    fn expiry_is_checked_against_the_clock() {
        let key = sample();
        assert!(!key.is_expired());
        let stale = sample().with_expiry(Utc::now() - Duration::seconds(1));
        assert!(stale.is_expired());
    }

    #[test]
    fn secure_erase_clears_material() {
        let mut key = sample();
        key.secure_erase();
        assert!(key.is_empty());
    }

    #[test]
    fn only_public_keys_encode() {
        assert!(sample().encoded_public().is_none());
        let public = CryptoKey::new("p", KeyAlgorithm::X25519Public, vec![9; 32], Duration::hours(1));
        let encoded = public.encoded_public().unwrap();
        let back =
            CryptoKey::public_from_b64("p", KeyAlgorithm::X25519Public, &encoded, public.expires_at)
                .unwrap();
        assert_eq!(back.key_data(), public.key_data());
    }

    #[test]
    fn as_array32_rejects_wrong_length() {
        let short = CryptoKey::new("s", KeyAlgorithm::Secret, vec![1; 16], Duration::hours(1));
        assert!(matches!(
            short.as_array32(),
            Err(CryptoError::InvalidKeySize { expected: 32, actual: 16 })
        ));
    }
}
