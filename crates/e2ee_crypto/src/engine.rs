//! Primitive operations over `CryptoKey`s.
//!
//! Every algorithm choice is one `match` on a closed enum; there is no
//! name-based dispatch past `FromStr`. The engine owns the randomness
//! source, the bounded key cache and the compromised-key list. It holds no
//! other state, so every call is a function of its inputs plus those.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::aead;
use crate::algorithm::{
    CipherAlgorithm, HashAlgorithm, KdfAlgorithm, KeyAlgorithm, KeyExchangeProtocol,
    SignatureAlgorithm,
};
use crate::cache::KeyCache;
use crate::config::EngineConfig;
use crate::context::{EncryptionContext, KeyDerivationParams, SignatureData};
use crate::error::CryptoError;
use crate::hash;
use crate::kdf;
use crate::key::{CryptoKey, KeyPair};
use crate::random::SecureRandom;

#[derive(Default)]
struct Counters {
    keys_generated: AtomicU64,
    keys_derived: AtomicU64,
    encryptions: AtomicU64,
    decryptions: AtomicU64,
    decrypt_failures: AtomicU64,
    signatures: AtomicU64,
    key_exchanges: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub keys_generated: u64,
    pub keys_derived: u64,
    pub encryptions: u64,
    pub decryptions: u64,
    pub decrypt_failures: u64,
    pub signatures: u64,
    pub key_exchanges: u64,
    pub cached_keys: usize,
    pub compromised_keys: usize,
}

pub struct CryptoEngine {
    config: EngineConfig,
    rng: SecureRandom,
    cache: Mutex<KeyCache>,
    compromised: RwLock<HashSet<String>>,
    counters: Counters,
}

impl CryptoEngine {
    pub fn new(config: EngineConfig) -> Result<Self, CryptoError> {
        if !config.default_cipher.is_secure() {
            return Err(CryptoError::UnsupportedAlgorithm(
                config.default_cipher.to_string(),
            ));
        }
        Ok(Self {
            cache: Mutex::new(KeyCache::new(config.max_cached_keys)),
            rng: SecureRandom::new()?,
            compromised: RwLock::new(HashSet::new()),
            counters: Counters::default(),
            config,
        })
    }

    pub fn with_defaults() -> Result<Self, CryptoError> {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn random(&self) -> &SecureRandom {
        &self.rng
    }

    // ── Generation ────────────────────────────────────────────────────────

    /// New 32-byte AEAD key. `ttl` defaults to the configured symmetric TTL.
    pub fn generate_symmetric_key(
        &self,
        algorithm: CipherAlgorithm,
        owner: &str,
        device: &str,
        ttl: Option<Duration>,
    ) -> Result<CryptoKey, CryptoError> {
        if !algorithm.is_secure() {
            warn!(algorithm = %algorithm, "refusing insecure cipher");
            return Err(CryptoError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        let bytes = self.rng.bytes(algorithm.key_len())?;
        let key = CryptoKey::new(
            self.generate_key_id()?,
            KeyAlgorithm::Symmetric(algorithm),
            bytes,
            ttl.unwrap_or_else(|| self.config.symmetric_key_ttl()),
        )
        .with_owner(owner, device);
        self.counters.keys_generated.fetch_add(1, Ordering::Relaxed);
        debug!(key_id = %key.id, algorithm = %algorithm, "generated symmetric key");
        Ok(key)
    }

    /// X25519 key agreement pair.
    pub fn generate_keypair(
        &self,
        protocol: KeyExchangeProtocol,
        owner: &str,
        device: &str,
    ) -> Result<KeyPair, CryptoError> {
        let (private_bytes, public_bytes) = match protocol {
            KeyExchangeProtocol::X25519 => {
                let secret = StaticSecret::from(*self.random_seed()?);
                let public = X25519Public::from(&secret);
                (secret.to_bytes().to_vec(), public.as_bytes().to_vec())
            }
        };
        let pair = self.make_pair(
            KeyAlgorithm::X25519Private,
            KeyAlgorithm::X25519Public,
            private_bytes,
            public_bytes,
            owner,
            device,
        )?;
        debug!(key_id = %pair.public.id, protocol = %protocol, "generated key exchange pair");
        Ok(pair)
    }

    /// Ed25519 signing pair. The private half holds the 32-byte seed.
    pub fn generate_signing_keypair(
        &self,
        algorithm: SignatureAlgorithm,
        owner: &str,
        device: &str,
    ) -> Result<KeyPair, CryptoError> {
        let (private_bytes, public_bytes) = match algorithm {
            SignatureAlgorithm::Ed25519 => {
                let signing = SigningKey::from_bytes(&*self.random_seed()?);
                (
                    signing.to_bytes().to_vec(),
                    signing.verifying_key().to_bytes().to_vec(),
                )
            }
        };
        let pair = self.make_pair(
            KeyAlgorithm::Ed25519Private,
            KeyAlgorithm::Ed25519Public,
            private_bytes,
            public_bytes,
            owner,
            device,
        )?;
        debug!(key_id = %pair.public.id, algorithm = %algorithm, "generated signing pair");
        Ok(pair)
    }

    fn random_seed(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        Ok(Zeroizing::new(self.rng.array::<32>()?))
    }

    fn make_pair(
        &self,
        private_alg: KeyAlgorithm,
        public_alg: KeyAlgorithm,
        private_bytes: Vec<u8>,
        public_bytes: Vec<u8>,
        owner: &str,
        device: &str,
    ) -> Result<KeyPair, CryptoError> {
        let base_id = self.generate_key_id()?;
        let ttl = self.config.keypair_ttl();
        let private = CryptoKey::new(format!("{base_id}_private"), private_alg, private_bytes, ttl)
            .with_owner(owner, device);
        let public = CryptoKey::new(format!("{base_id}_public"), public_alg, public_bytes, ttl)
            .with_owner(owner, device)
            .with_expiry(private.expires_at);
        self.counters.keys_generated.fetch_add(2, Ordering::Relaxed);
        Ok(KeyPair { private, public })
    }

    // ── Derivation ────────────────────────────────────────────────────────

    /// Derive a child key from `parent`.
    ///
    /// HKDF uses `params.salt` and the label `context || params.info`.
    /// Argon2id uses `params.salt` and the cost fields. The child never
    /// outlives its parent.
    pub fn derive_key(
        &self,
        parent: &CryptoKey,
        params: &KeyDerivationParams,
        context: &str,
    ) -> Result<CryptoKey, CryptoError> {
        self.check_usable(parent)?;
        if parent.algorithm.is_public() {
            return Err(CryptoError::InvalidKey(format!(
                "cannot derive from public key {}",
                parent.id
            )));
        }
        let kdf_alg: KdfAlgorithm = params.algorithm.parse()?;
        let bytes = match kdf_alg {
            KdfAlgorithm::HkdfSha256 => {
                let mut label = Vec::with_capacity(context.len() + params.info.len());
                label.extend_from_slice(context.as_bytes());
                label.extend_from_slice(params.info.as_bytes());
                kdf::hkdf32(parent.key_data(), &params.salt, &label)?
            }
            KdfAlgorithm::Argon2id => kdf::argon2id(
                parent.key_data(),
                &params.salt,
                params.iterations,
                params.memory_cost,
                params.parallelism,
            )?,
        };

        let algorithm = match parent.algorithm {
            KeyAlgorithm::Symmetric(c) => KeyAlgorithm::Symmetric(c),
            _ => KeyAlgorithm::Secret,
        };
        let mut child = CryptoKey::new(
            self.generate_key_id()?,
            algorithm,
            bytes.to_vec(),
            self.config.derived_key_ttl(),
        )
        .with_owner(parent.user_id.clone(), parent.device_id.clone())
        .with_parent(parent.id.clone())
        .ephemeral();
        if child.expires_at > parent.expires_at {
            child.expires_at = parent.expires_at;
        }
        self.counters.keys_derived.fetch_add(1, Ordering::Relaxed);
        Ok(child)
    }

    // ── AEAD ──────────────────────────────────────────────────────────────

    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &CryptoKey,
        aad: Option<&[u8]>,
    ) -> Result<(Vec<u8>, EncryptionContext), CryptoError> {
        self.check_usable(key)?;
        let cipher = self.cipher_for(key)?;
        if !cipher.is_secure() {
            return Err(CryptoError::UnsupportedAlgorithm(cipher.to_string()));
        }
        let nonce = self.rng.bytes(cipher.nonce_len())?;
        let (ciphertext, tag) =
            aead::seal(cipher, key.key_data(), &nonce, aad.unwrap_or_default(), plaintext)?;
        self.counters.encryptions.fetch_add(1, Ordering::Relaxed);
        Ok((
            ciphertext,
            EncryptionContext {
                algorithm: cipher,
                key_id: key.id.clone(),
                nonce,
                tag,
                associated_data: aad.map(<[u8]>::to_vec),
                session_id: String::new(),
            },
        ))
    }

    /// Open a ciphertext. The precise failure cause goes to the audit log.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &CryptoKey,
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let result = self.decrypt_inner(ciphertext, key, context);
        match &result {
            Ok(_) => {
                self.counters.decryptions.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "audit",
                    key_id = %key.id,
                    session_id = %context.session_id,
                    error = %e,
                    "decrypt failed"
                );
            }
        }
        result
    }

    fn decrypt_inner(
        &self,
        ciphertext: &[u8],
        key: &CryptoKey,
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if context.key_id != key.id {
            return Err(CryptoError::KeyIdMismatch {
                expected: context.key_id.clone(),
                actual: key.id.clone(),
            });
        }
        if key.is_expired_at(Utc::now() - self.config.decrypt_grace()) {
            return Err(CryptoError::KeyExpired { key_id: key.id.clone() });
        }
        let cipher = self.cipher_for(key)?;
        if cipher != context.algorithm {
            return Err(CryptoError::AlgorithmMismatch(format!(
                "key is {cipher}, context says {}",
                context.algorithm
            )));
        }
        aead::open(
            cipher,
            key.key_data(),
            &context.nonce,
            context.associated_data.as_deref().unwrap_or_default(),
            ciphertext,
            &context.tag,
        )
    }

    /// Secret keys follow the configured default cipher.
    fn cipher_for(&self, key: &CryptoKey) -> Result<CipherAlgorithm, CryptoError> {
        match key.algorithm {
            KeyAlgorithm::Symmetric(c) => Ok(c),
            KeyAlgorithm::Secret => Ok(self.config.default_cipher),
            other => Err(CryptoError::AlgorithmMismatch(format!(
                "{other} key cannot be used for encryption"
            ))),
        }
    }

    /// `encrypt` with UTF-8 input and base64 output.
    pub fn encrypt_string(
        &self,
        plaintext: &str,
        key: &CryptoKey,
    ) -> Result<(String, EncryptionContext), CryptoError> {
        let (ciphertext, ctx) = self.encrypt(plaintext.as_bytes(), key, None)?;
        Ok((STANDARD.encode(ciphertext), ctx))
    }

    pub fn decrypt_string(
        &self,
        ciphertext_b64: &str,
        key: &CryptoKey,
        context: &EncryptionContext,
    ) -> Result<String, CryptoError> {
        let ciphertext = STANDARD.decode(ciphertext_b64)?;
        let plaintext = self.decrypt(&ciphertext, key, context)?;
        std::str::from_utf8(&plaintext)
            .map(str::to_owned)
            .map_err(|_| CryptoError::InvalidUtf8)
    }

    // ── Signatures ────────────────────────────────────────────────────────

    /// Ed25519 over `hash_algorithm(data)`.
    pub fn sign(
        &self,
        data: &[u8],
        private_key: &CryptoKey,
        hash_algorithm: HashAlgorithm,
    ) -> Result<SignatureData, CryptoError> {
        self.check_usable(private_key)?;
        if private_key.algorithm != KeyAlgorithm::Ed25519Private {
            return Err(CryptoError::AlgorithmMismatch(format!(
                "{} key cannot sign",
                private_key.algorithm
            )));
        }
        let signing = SigningKey::from_bytes(&*private_key.as_array32()?);
        let digest = hash::digest(data, hash_algorithm);
        let signature = signing.sign(&digest);
        self.counters.signatures.fetch_add(1, Ordering::Relaxed);
        Ok(SignatureData {
            algorithm: SignatureAlgorithm::Ed25519,
            signature: signature.to_bytes().to_vec(),
            signer_key_id: private_key.id.clone(),
            signed_at: Utc::now(),
            hash_algorithm,
        })
    }

    /// False for any mismatch or malformed input. Never errors.
    pub fn verify_signature(
        &self,
        data: &[u8],
        signature: &SignatureData,
        public_key: &CryptoKey,
    ) -> bool {
        if public_key.algorithm != KeyAlgorithm::Ed25519Public
            || signature.algorithm != SignatureAlgorithm::Ed25519
        {
            return false;
        }
        let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key.key_data()) else {
            return false;
        };
        let Ok(verifying) = VerifyingKey::from_bytes(&pk_bytes) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&signature.signature) else {
            return false;
        };
        let digest = hash::digest(data, signature.hash_algorithm);
        verifying.verify_strict(&digest, &sig).is_ok()
    }

    // ── Key agreement ─────────────────────────────────────────────────────

    /// X25519 between our private key and a peer public key.
    ///
    /// The result is an ephemeral `Secret` key whose id is `session_id` (or a
    /// fresh session id), owned by the private key's owner.
    pub fn perform_key_exchange(
        &self,
        private_key: &CryptoKey,
        public_key: &CryptoKey,
        session_id: Option<&str>,
    ) -> Result<CryptoKey, CryptoError> {
        let protocol = match (
            private_key.algorithm.exchange_protocol(),
            public_key.algorithm.exchange_protocol(),
        ) {
            (Some(a), Some(b))
                if a == b && private_key.algorithm.is_private() && public_key.algorithm.is_public() =>
            {
                a
            }
            _ => {
                return Err(CryptoError::AlgorithmMismatch(format!(
                    "{} with {}",
                    private_key.algorithm, public_key.algorithm
                )))
            }
        };
        for (key, expected) in [
            (private_key, protocol.private_key_len()),
            (public_key, protocol.public_key_len()),
        ] {
            if key.len() != expected {
                return Err(CryptoError::InvalidKeySize {
                    expected,
                    actual: key.len(),
                });
            }
        }
        self.check_usable(private_key)?;

        let shared = match protocol {
            KeyExchangeProtocol::X25519 => {
                let secret = StaticSecret::from(*private_key.as_array32()?);
                let peer = X25519Public::from(*public_key.as_array32()?);
                let shared = secret.diffie_hellman(&peer);
                if !shared.was_contributory() {
                    return Err(CryptoError::InvalidKey(format!(
                        "low-order public key {}",
                        public_key.id
                    )));
                }
                shared.as_bytes().to_vec()
            }
        };

        let id = match session_id {
            Some(s) => s.to_string(),
            None => self.generate_session_id()?,
        };
        self.counters.key_exchanges.fetch_add(1, Ordering::Relaxed);
        Ok(
            CryptoKey::new(id, KeyAlgorithm::Secret, shared, self.config.derived_key_ttl())
                .with_owner(private_key.user_id.clone(), private_key.device_id.clone())
                .with_parent(private_key.id.clone())
                .ephemeral(),
        )
    }

    // ── Hashing ───────────────────────────────────────────────────────────

    pub fn hash(&self, data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
        hash::digest(data, algorithm)
    }

    pub fn hash_hex(&self, data: &[u8], algorithm: HashAlgorithm) -> String {
        hash::digest_hex(data, algorithm)
    }

    /// Hex hash of the raw key bytes, for out-of-band comparison only.
    pub fn calculate_key_fingerprint(&self, key: &CryptoKey, algorithm: HashAlgorithm) -> String {
        hash::digest_hex(key.key_data(), algorithm)
    }

    // ── Key cache ─────────────────────────────────────────────────────────

    pub fn cache_key(&self, key: CryptoKey) -> Arc<CryptoKey> {
        let key = Arc::new(key);
        let evicted = self.cache.lock().insert(Arc::clone(&key), Utc::now());
        if evicted > 0 {
            debug!(evicted, "key cache full, evicted entries");
        }
        key
    }

    /// `None` for unknown or expired ids.
    pub fn get_cached_key(&self, key_id: &str) -> Option<Arc<CryptoKey>> {
        self.cache.lock().get(key_id, Utc::now())
    }

    pub fn remove_cached_key(&self, key_id: &str) -> bool {
        self.cache.lock().remove(key_id)
    }

    pub fn cleanup_expired_keys(&self) -> usize {
        self.cache.lock().purge_expired(Utc::now())
    }

    /// Same as `cleanup_expired_keys` but releases the lock every
    /// `max_per_lock` removals.
    pub fn cleanup_expired_keys_chunked(&self, max_per_lock: usize) -> usize {
        let max_per_lock = max_per_lock.max(1);
        let mut total = 0;
        loop {
            let removed = self.cache.lock().purge_expired_chunk(Utc::now(), max_per_lock);
            total += removed;
            if removed < max_per_lock {
                return total;
            }
        }
    }

    pub fn clear_key_cache(&self) -> usize {
        self.cache.lock().clear()
    }

    pub fn cached_key_count(&self) -> usize {
        self.cache.lock().len()
    }

    // ── Key status ────────────────────────────────────────────────────────

    /// Compromised keys are refused for encrypt, sign, derive and exchange,
    /// and dropped from the cache.
    pub fn mark_key_compromised(&self, key_id: &str) {
        self.compromised.write().insert(key_id.to_string());
        self.cache.lock().remove(key_id);
        warn!(key_id, "key marked compromised");
    }

    pub fn is_key_compromised(&self, key_id: &str) -> bool {
        self.compromised.read().contains(key_id)
    }

    /// Well-formed, unexpired and not compromised.
    pub fn validate_key(&self, key: &CryptoKey) -> bool {
        let expected_len = match key.algorithm {
            KeyAlgorithm::Symmetric(c) => c.key_len(),
            _ => 32,
        };
        key.len() == expected_len && !key.is_expired() && !self.is_key_compromised(&key.id)
    }

    fn check_usable(&self, key: &CryptoKey) -> Result<(), CryptoError> {
        if self.is_key_compromised(&key.id) {
            return Err(CryptoError::KeyCompromised { key_id: key.id.clone() });
        }
        if key.is_expired() {
            return Err(CryptoError::KeyExpired { key_id: key.id.clone() });
        }
        Ok(())
    }

    // ── Random helpers ────────────────────────────────────────────────────

    pub fn generate_salt(&self) -> Result<Vec<u8>, CryptoError> {
        self.rng.bytes(32)
    }

    pub fn generate_nonce(&self, cipher: CipherAlgorithm) -> Result<Vec<u8>, CryptoError> {
        self.rng.bytes(cipher.nonce_len())
    }

    pub fn generate_session_id(&self) -> Result<String, CryptoError> {
        self.rng.hex(16)
    }

    pub fn generate_key_id(&self) -> Result<String, CryptoError> {
        Ok(format!("key_{}", self.rng.hex(16)?))
    }

    // ── Advisory ──────────────────────────────────────────────────────────

    /// Unknown names are never secure.
    pub fn is_algorithm_secure(&self, name: &str) -> bool {
        name.parse::<CipherAlgorithm>()
            .map(CipherAlgorithm::is_secure)
            .unwrap_or(false)
    }

    pub fn is_key_exchange_secure(&self, name: &str) -> bool {
        name.parse::<KeyExchangeProtocol>()
            .map(KeyExchangeProtocol::is_secure)
            .unwrap_or(false)
    }

    /// Security level in bits, 0 for unknown names.
    pub fn calculate_security_level(&self, name: &str) -> u32 {
        name.parse::<CipherAlgorithm>()
            .map(CipherAlgorithm::security_level)
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> EngineMetrics {
        let c = &self.counters;
        EngineMetrics {
            keys_generated: c.keys_generated.load(Ordering::Relaxed),
            keys_derived: c.keys_derived.load(Ordering::Relaxed),
            encryptions: c.encryptions.load(Ordering::Relaxed),
            decryptions: c.decryptions.load(Ordering::Relaxed),
            decrypt_failures: c.decrypt_failures.load(Ordering::Relaxed),
            signatures: c.signatures.load(Ordering::Relaxed),
            key_exchanges: c.key_exchanges.load(Ordering::Relaxed),
            cached_keys: self.cached_key_count(),
            compromised_keys: self.compromised.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CryptoEngine {
        CryptoEngine::with_defaults().unwrap()
    }

    #[test]
    fn keypair_ids_share_a_base() {
        let e = engine();
        let pair = e
            .generate_keypair(KeyExchangeProtocol::X25519, "alice", "phone")
            .unwrap();
        let base = pair.private.id.strip_suffix("_private").unwrap();
        assert_eq!(pair.public.id, format!("{base}_public"));
        assert_eq!(pair.private.len(), 32);
        assert_eq!(pair.public.len(), 32);
    }

    #[test]
    fn secret_keys_encrypt_under_default_cipher() {
        let e = engine();
        let pair_a = e.generate_keypair(KeyExchangeProtocol::X25519, "a", "d").unwrap();
        let pair_b = e.generate_keypair(KeyExchangeProtocol::X25519, "b", "d").unwrap();
        let shared = e.perform_key_exchange(&pair_a.private, &pair_b.public, None).unwrap();
        let (ct, ctx) = e.encrypt(b"hi", &shared, None).unwrap();
        assert_eq!(ctx.algorithm, CipherAlgorithm::Aes256Gcm);
        assert_eq!(e.decrypt(&ct, &shared, &ctx).unwrap().as_slice(), b"hi");
    }

    #[test]
    fn derived_key_lineage_and_expiry() {
        let e = engine();
        let parent = e
            .generate_symmetric_key(CipherAlgorithm::ChaCha20Poly1305, "a", "d", Some(Duration::hours(1)))
            .unwrap();
        let child = e
            .derive_key(&parent, &KeyDerivationParams::hkdf(vec![1u8; 16], "info"), "ctx")
            .unwrap();
        assert_eq!(child.parent_key_id.as_deref(), Some(parent.id.as_str()));
        assert!(child.is_ephemeral);
        assert_eq!(child.algorithm, parent.algorithm);
        assert!(child.expires_at <= parent.expires_at);
        assert_ne!(child.key_data(), parent.key_data());
    }

    #[test]
    fn hkdf_label_is_context_then_info() {
        let e = engine();
        let parent = e
            .generate_symmetric_key(CipherAlgorithm::Aes256Gcm, "a", "d", None)
            .unwrap();
        let a = e.derive_key(&parent, &KeyDerivationParams::hkdf(Vec::<u8>::new(), "cd"), "ab").unwrap();
        let b = e.derive_key(&parent, &KeyDerivationParams::hkdf(Vec::<u8>::new(), "d"), "abc").unwrap();
        assert_eq!(a.key_data(), b.key_data());
    }

    #[test]
    fn compromised_keys_are_refused() {
        let e = engine();
        let key = e
            .generate_symmetric_key(CipherAlgorithm::Aes256Gcm, "a", "d", None)
            .unwrap();
        let cached = e.cache_key(key.clone());
        e.mark_key_compromised(&cached.id);
        assert!(e.is_key_compromised(&key.id));
        assert!(e.get_cached_key(&key.id).is_none());
        assert!(!e.validate_key(&key));
        assert!(matches!(
            e.encrypt(b"x", &key, None),
            Err(CryptoError::KeyCompromised { .. })
        ));
    }

    #[test]
    fn advisory_tables() {
        let e = engine();
        assert!(e.is_algorithm_secure("AES-256-GCM"));
        assert!(!e.is_algorithm_secure("AES-256-CBC"));
        assert!(!e.is_algorithm_secure("ROT13"));
        assert!(e.is_key_exchange_secure("X25519"));
        assert_eq!(e.calculate_security_level("AES-256-CBC"), 128);
        assert_eq!(e.calculate_security_level("nope"), 0);
    }

    #[test]
    fn metrics_count_operations() {
        let e = engine();
        let key = e
            .generate_symmetric_key(CipherAlgorithm::Aes256Gcm, "a", "d", None)
            .unwrap();
        let (ct, mut ctx) = e.encrypt(b"x", &key, None).unwrap();
        e.decrypt(&ct, &key, &ctx).unwrap();
        ctx.tag[0] ^= 1;
        assert!(e.decrypt(&ct, &key, &ctx).is_err());
        let m = e.metrics();
        assert_eq!(m.keys_generated, 1);
        assert_eq!(m.encryptions, 1);
        assert_eq!(m.decryptions, 1);
        assert_eq!(m.decrypt_failures, 1);
    }
}
