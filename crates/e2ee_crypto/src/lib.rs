//! e2ee_crypto: end-to-end messaging crypto engine
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Closed algorithm enums; anything outside them is an `Unsupported*` error.
//! - Ratchet state only moves after a message authenticates.
//!
//! # Module layout
//! - `algorithm`     cipher / key-exchange / signature / hash / KDF enums
//! - `key`           `CryptoKey`, `KeyPair`, non-secret `KeyInfo`
//! - `context`       encryption, signature and derivation contexts
//! - `random`        CSPRNG with caller-supplied extra entropy
//! - `aead`          AES-256-GCM / ChaCha20-Poly1305 / XChaCha20-Poly1305
//! - `kdf`           HKDF-SHA256 and Argon2id
//! - `hash`          SHA-2 and BLAKE3 dispatch
//! - `cache`         bounded LRU key cache
//! - `engine`        `CryptoEngine`: every primitive operation over keys
//! - `x3dh`          prekey bundles and the X3DH handshake
//! - `ratchet`       Double Ratchet with skipped message keys
//! - `directory`     where bundles and handshakes are exchanged
//! - `metadata`      per-message transport metadata
//! - `fingerprint`   safety numbers
//! - `key_log`       signed, hash-chained key-change log
//! - `session`       `E2EEncryptionManager`
//! - `maintenance`   background sweeper
//! - `config`        JSON configuration
//! - `error`         unified error type

pub mod aead;
pub mod algorithm;
pub mod cache;
pub mod config;
pub mod context;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod hash;
pub mod kdf;
pub mod key;
pub mod key_log;
pub mod maintenance;
pub mod metadata;
pub mod random;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use algorithm::{
    CipherAlgorithm, HashAlgorithm, KdfAlgorithm, KeyAlgorithm, KeyExchangeProtocol,
    SignatureAlgorithm,
};
pub use config::{CryptoConfig, EngineConfig, SessionConfig};
pub use context::{EncryptionContext, KeyDerivationParams, SignatureData};
pub use directory::{InMemoryDirectory, KeyDirectory, OneTimePrekey};
pub use engine::{CryptoEngine, EngineMetrics};
pub use error::CryptoError;
pub use key::{CryptoKey, KeyInfo, KeyPair};
pub use key_log::{KeyChange, KeyLogEntry};
pub use metadata::MessageMetadata;
pub use session::{
    E2EEncryptionManager, EncryptionMetrics, RotationReport, SessionInfo, SessionState,
};
pub use x3dh::{PrekeyBundle, SessionHandshake};
