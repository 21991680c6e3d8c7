//! Non-secret metadata that travels with ciphertexts, signatures and
//! derivations. Binary fields are base64 in JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::algorithm::{CipherAlgorithm, HashAlgorithm, SignatureAlgorithm};

/// Everything a receiver needs besides the key to open one ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub algorithm: CipherAlgorithm,
    pub key_id: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub associated_data: Option<Vec<u8>>,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    pub algorithm: SignatureAlgorithm,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub signer_key_id: String,
    pub signed_at: DateTime<Utc>,
    pub hash_algorithm: HashAlgorithm,
}

/// Inputs to `CryptoEngine::derive_key`.
///
/// `algorithm` is matched by name ("HKDF", "HKDF-SHA256", "ARGON2ID") so
/// parameters can come straight from configuration. `iterations`,
/// `memory_cost` (KiB) and `parallelism` only apply to Argon2id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivationParams {
    pub algorithm: String,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub memory_cost: u32,
    #[serde(default)]
    pub parallelism: u32,
    #[serde(default)]
    pub info: String,
}

impl KeyDerivationParams {
    pub fn hkdf(salt: impl Into<Vec<u8>>, info: impl Into<String>) -> Self {
        Self {
            algorithm: "HKDF-SHA256".to_string(),
            salt: salt.into(),
            iterations: 0,
            memory_cost: 0,
            parallelism: 0,
            info: info.into(),
        }
    }

    pub fn argon2id(
        salt: impl Into<Vec<u8>>,
        iterations: u32,
        memory_cost: u32,
        parallelism: u32,
    ) -> Self {
        Self {
            algorithm: "ARGON2ID".to_string(),
            salt: salt.into(),
            iterations,
            memory_cost,
            parallelism,
            info: String::new(),
        }
    }
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_json_uses_base64() {
        let ctx = EncryptionContext {
            algorithm: CipherAlgorithm::Aes256Gcm,
            key_id: "k".into(),
            nonce: vec![0u8; 12],
            tag: vec![0xFF; 16],
            associated_data: Some(b"hdr".to_vec()),
            session_id: "s".into(),
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["nonce"], "AAAAAAAAAAAAAAAA");
        assert_eq!(json["associated_data"], "aGRy");
        assert_eq!(json["algorithm"], "AES256_GCM");

        let back: EncryptionContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn missing_aad_is_omitted() {
        let ctx = EncryptionContext {
            algorithm: CipherAlgorithm::ChaCha20Poly1305,
            key_id: "k".into(),
            nonce: vec![1; 12],
            tag: vec![2; 16],
            associated_data: None,
            session_id: String::new(),
        };
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(!json.contains("associated_data"));
        let back: EncryptionContext = serde_json::from_str(&json).unwrap();
        assert!(back.associated_data.is_none());
    }
}
