//! Per-message metadata handed to the transport next to the ciphertext.

use serde::{Deserialize, Serialize};

use crate::algorithm::CipherAlgorithm;
use crate::context::{b64, b64_opt, EncryptionContext};
use crate::error::CryptoError;
use crate::ratchet::RatchetHeader;

pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub version: u32,
    pub algorithm: CipherAlgorithm,
    pub key_id: String,
    pub session_id: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub associated_data: Option<Vec<u8>>,
    /// Sender's ratchet public key (base64url)
    pub ratchet_key: String,
    pub generation: u32,
    pub counter: u32,
    pub previous_chain_length: u32,
    #[serde(default)]
    pub rekey_requested: bool,
}

impl MessageMetadata {
    pub fn new(context: EncryptionContext, header: RatchetHeader) -> Self {
        Self {
            version: METADATA_VERSION,
            algorithm: context.algorithm,
            key_id: context.key_id,
            session_id: context.session_id,
            nonce: context.nonce,
            tag: context.tag,
            associated_data: context.associated_data,
            ratchet_key: header.ratchet_key,
            generation: header.generation,
            counter: header.counter,
            previous_chain_length: header.previous_chain_length,
            rekey_requested: header.rekey_requested,
        }
    }

    pub fn header(&self) -> RatchetHeader {
        RatchetHeader {
            ratchet_key: self.ratchet_key.clone(),
            generation: self.generation,
            counter: self.counter,
            previous_chain_length: self.previous_chain_length,
            rekey_requested: self.rekey_requested,
        }
    }

    pub fn context(&self) -> EncryptionContext {
        EncryptionContext {
            algorithm: self.algorithm,
            key_id: self.key_id.clone(),
            nonce: self.nonce.clone(),
            tag: self.tag.clone(),
            associated_data: self.associated_data.clone(),
            session_id: self.session_id.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let meta: Self = serde_json::from_str(json)?;
        if meta.version != METADATA_VERSION {
            return Err(CryptoError::UnsupportedProtocol(format!(
                "message metadata version {}",
                meta.version
            )));
        }
        Ok(meta)
    }
}
