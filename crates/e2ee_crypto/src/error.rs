use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unsupported key exchange protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Unsupported key derivation function: {0}")]
    UnsupportedKdf(String),

    #[error("Key {key_id} has expired")]
    KeyExpired { key_id: String },

    #[error("Key {key_id} is marked compromised")]
    KeyCompromised { key_id: String },

    #[error("Key id mismatch: context expects {expected}, got {actual}")]
    KeyIdMismatch { expected: String, actual: String },

    /// Tag verification failure. Malformed nonces and tags end up here too,
    /// so callers cannot tell a forgery from a truncated message.
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Algorithm mismatch: {0}")]
    AlgorithmMismatch(String),

    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Session {0} is not active")]
    SessionNotActive(String),

    #[error("Session {0} is not marked compromised")]
    NotCompromised(String),

    #[error("No message key for generation {generation}, counter {counter}")]
    MessageKeyNotFound { generation: u32, counter: u32 },

    #[error("Too many skipped messages ({requested} > {limit})")]
    TooManySkippedMessages { requested: u32, limit: u32 },

    #[error("Secure random source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("No pending handshake for session {0}")]
    HandshakeNotFound(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Decrypted data is not valid UTF-8")]
    InvalidUtf8,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl CryptoError {
    /// True for every failure a receiver can hit while opening a message.
    pub fn is_decrypt_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed
                | CryptoError::KeyExpired { .. }
                | CryptoError::KeyIdMismatch { .. }
                | CryptoError::MessageKeyNotFound { .. }
                | CryptoError::TooManySkippedMessages { .. }
                | CryptoError::SessionNotActive(_)
                | CryptoError::AlgorithmMismatch(_)
                | CryptoError::Base64Decode(_)
        )
    }

    /// Message safe to hand to the transport layer. Decrypt-path failures
    /// all collapse to one string; the precise cause belongs in the audit log.
    pub fn transport_message(&self) -> String {
        if self.is_decrypt_failure() {
            "message cannot be decrypted".to_string()
        } else {
            self.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_failures_share_one_transport_message() {
        let auth = CryptoError::AuthenticationFailed;
        let missing = CryptoError::MessageKeyNotFound { generation: 1, counter: 4 };
        assert_eq!(auth.transport_message(), missing.transport_message());
        assert!(!auth.transport_message().contains("Authentication"));
    }

    #[test]
    fn non_decrypt_errors_keep_their_message() {
        let err = CryptoError::UnknownUser("bob".into());
        assert!(!err.is_decrypt_failure());
        assert_eq!(err.transport_message(), "Unknown user: bob");
    }
}
