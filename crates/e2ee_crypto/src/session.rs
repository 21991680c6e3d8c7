//! Session management: X3DH key agreement + Double Ratchet per conversation.
//!
//! One `E2EEncryptionManager` per device. It holds the device's long-term
//! identity and prekeys (by user id) and one ratchet per session (by
//! session id). Public prekey material and handshakes travel through the
//! injected `KeyDirectory`.
//!
//! Session lifecycle:
//!   Uninitialized → Initiating | Accepting → Active → Closed
//!
//! `reset_ratchet` drops the ratchet and puts a session back to
//! `Uninitialized`; it has to be re-established under a new id. Closed
//! sessions keep their (key-less) entry until the next `sweep`. A session
//! marked compromised is closed the same way and can be replaced by a fresh
//! handshake with `recover_from_compromise`.
//!
//! Key rotations ask the ratchet for a DH step; see `ratchet` for when the
//! step actually runs. Key changes are recorded in a signed `KeyLog`.
//!
//! Locking: the session map lock is only held to look up, insert or
//! remove; ratchet work happens under the per-session mutex, so unrelated
//! sessions never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::algorithm::{KeyAlgorithm, KeyExchangeProtocol, SignatureAlgorithm};
use crate::config::{CryptoConfig, SessionConfig};
use crate::directory::{KeyDirectory, OneTimePrekey};
use crate::engine::{CryptoEngine, EngineMetrics};
use crate::error::CryptoError;
use crate::fingerprint;
use crate::key::{CryptoKey, KeyPair};
use crate::key_log::{KeyChange, KeyChangeRecord, KeyLog, KeyLogEntry};
use crate::metadata::MessageMetadata;
use crate::ratchet::{RatchetInfo, RatchetState};
use crate::x3dh::{self, SessionHandshake};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initiating,
    Accepting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Responder,
}

// ── Long-term material ───────────────────────────────────────────────────────

struct UserKeys {
    device_id: String,
    identity: KeyPair,
    signed_prekey: KeyPair,
    /// Kept for handshakes that were in flight during a rotation.
    previous_signed_prekey: Option<KeyPair>,
    /// Keyed by the public half's id, which is what bundles advertise.
    one_time_prekeys: HashMap<String, KeyPair>,
}

impl UserKeys {
    fn signed_prekey_by_id(&self, id: &str) -> Option<&KeyPair> {
        std::iter::once(&self.signed_prekey)
            .chain(self.previous_signed_prekey.as_ref())
            .find(|pair| pair.public.id == id)
    }
}

// ── Per-session state ────────────────────────────────────────────────────────

struct SessionEntry {
    session_id: String,
    local_user: String,
    peer_user: String,
    role: SessionRole,
    state: SessionState,
    ratchet: Option<RatchetState>,
    safety: Option<[u8; 32]>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    messages_sent: u64,
    messages_received: u64,
    compromised: bool,
}

impl SessionEntry {
    fn new(session_id: &str, local_user: &str, peer_user: &str, role: SessionRole, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            local_user: local_user.to_string(),
            peer_user: peer_user.to_string(),
            role,
            state: match role {
                SessionRole::Initiator => SessionState::Initiating,
                SessionRole::Responder => SessionState::Accepting,
            },
            ratchet: None,
            safety: None,
            created_at: now,
            last_activity: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            messages_sent: 0,
            messages_received: 0,
            compromised: false,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Erase every secret this session holds.
    fn erase(&mut self) {
        self.ratchet = None;
        self.safety = None;
    }

    /// The ratchet, if this session may be used right now.
    fn active_ratchet(&mut self) -> Result<&mut RatchetState, CryptoError> {
        if self.state != SessionState::Active || self.is_expired(Utc::now()) {
            return Err(CryptoError::SessionNotActive(self.session_id.clone()));
        }
        self.ratchet
            .as_mut()
            .ok_or_else(|| CryptoError::SessionNotActive(self.session_id.clone()))
    }

    fn involves(&self, user_id: &str) -> bool {
        self.local_user == user_id || self.peer_user == user_id
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

/// Non-secret description of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub local_user: String,
    pub peer_user: String,
    pub role: SessionRole,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub compromised: bool,
    pub ratchet: Option<RatchetInfo>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptionMetrics {
    pub engine: EngineMetrics,
    pub registered_users: usize,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub messages_encrypted: u64,
    pub messages_decrypted: u64,
    pub decrypt_failures: u64,
    pub skipped_keys_evicted: u64,
    pub sessions_established: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_keys: usize,
    pub expired_sessions: usize,
    pub closed_sessions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub one_time_prekeys_added: usize,
    /// Sessions whose DH step ran during the rotation.
    pub sessions_rotated: usize,
    /// Sessions where the step waits for the peer's next ratchet key.
    pub sessions_deferred: usize,
}

#[derive(Default)]
struct Counters {
    messages_encrypted: AtomicU64,
    messages_decrypted: AtomicU64,
    decrypt_failures: AtomicU64,
    skipped_keys_evicted: AtomicU64,
    sessions_established: AtomicU64,
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct E2EEncryptionManager {
    engine: Arc<CryptoEngine>,
    directory: Arc<dyn KeyDirectory>,
    config: SessionConfig,
    users: RwLock<HashMap<String, UserKeys>>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    key_log: KeyLog,
    counters: Counters,
}

impl E2EEncryptionManager {
    pub fn new(
        engine: Arc<CryptoEngine>,
        directory: Arc<dyn KeyDirectory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            engine,
            directory,
            key_log: KeyLog::new(config.max_key_log_entries),
            config,
            users: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Build the engine and the manager from one config.
    pub fn from_config(
        config: &CryptoConfig,
        directory: Arc<dyn KeyDirectory>,
    ) -> Result<Self, CryptoError> {
        let engine = Arc::new(CryptoEngine::new(config.engine.clone())?);
        Ok(Self::new(engine, directory, config.session.clone()))
    }

    pub fn engine(&self) -> &Arc<CryptoEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// Store a user's long-term keys and publish their signed bundle.
    pub fn register_user_keys(
        &self,
        user_id: &str,
        identity: KeyPair,
        signed_prekey: KeyPair,
        one_time_prekeys: Vec<KeyPair>,
    ) -> Result<(), CryptoError> {
        expect_pair(&identity, KeyAlgorithm::Ed25519Private, KeyAlgorithm::Ed25519Public)?;
        expect_pair(&signed_prekey, KeyAlgorithm::X25519Private, KeyAlgorithm::X25519Public)?;
        for opk in &one_time_prekeys {
            expect_pair(opk, KeyAlgorithm::X25519Private, KeyAlgorithm::X25519Public)?;
        }

        // Handshakes name the sender by the identity key's owner.
        let device_id = identity.private.device_id.clone();
        let identity = KeyPair {
            private: identity.private.with_owner(user_id, device_id.clone()),
            public: identity.public.with_owner(user_id, device_id.clone()),
        };
        let bundle = x3dh::build_bundle(&self.engine, &identity, &signed_prekey, None)?;
        let published = publish_list(&one_time_prekeys)?;
        self.directory.publish_bundle(bundle, published)?;

        let count = one_time_prekeys.len();
        let identity_id = identity.public.id.clone();
        let keys = UserKeys {
            device_id,
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: one_time_prekeys
                .into_iter()
                .map(|pair| (pair.public.id.clone(), pair))
                .collect(),
        };
        self.users.write().insert(user_id.to_string(), keys);
        info!(user_id, one_time_prekeys = count, "registered user keys");
        self.record_key_change(
            user_id,
            KeyChange::IdentityRegistered,
            None,
            (None, Some(identity_id)),
            "registered",
        );
        Ok(())
    }

    /// Generate and register a full key set for `user_id`.
    pub fn provision_user(
        &self,
        user_id: &str,
        device_id: &str,
        one_time_count: usize,
    ) -> Result<(), CryptoError> {
        let identity =
            self.engine
                .generate_signing_keypair(SignatureAlgorithm::Ed25519, user_id, device_id)?;
        let signed_prekey =
            self.engine
                .generate_keypair(KeyExchangeProtocol::X25519, user_id, device_id)?;
        let one_time = self.generate_one_time_prekeys(user_id, device_id, one_time_count)?;
        self.register_user_keys(user_id, identity, signed_prekey, one_time)
    }

    /// Rotate the signed prekey (keeping the previous one for in-flight
    /// handshakes) and add fresh one-time prekeys.
    pub fn update_user_keys(
        &self,
        user_id: &str,
        new_signed_prekey: KeyPair,
        new_one_time_prekeys: Vec<KeyPair>,
    ) -> Result<(), CryptoError> {
        self.replace_signed_prekey(user_id, new_signed_prekey, new_one_time_prekeys, "updated")
    }

    fn replace_signed_prekey(
        &self,
        user_id: &str,
        new_signed_prekey: KeyPair,
        new_one_time_prekeys: Vec<KeyPair>,
        reason: &str,
    ) -> Result<(), CryptoError> {
        expect_pair(&new_signed_prekey, KeyAlgorithm::X25519Private, KeyAlgorithm::X25519Public)?;
        for opk in &new_one_time_prekeys {
            expect_pair(opk, KeyAlgorithm::X25519Private, KeyAlgorithm::X25519Public)?;
        }
        let published = publish_list(&new_one_time_prekeys)?;
        let added = new_one_time_prekeys.len();

        let (old_id, new_id) = {
            let mut users = self.users.write();
            let keys = users
                .get_mut(user_id)
                .ok_or_else(|| CryptoError::UnknownUser(user_id.to_string()))?;
            let bundle =
                x3dh::build_bundle(&self.engine, &keys.identity, &new_signed_prekey, None)?;
            self.directory.publish_bundle(bundle, published)?;

            let new_id = new_signed_prekey.public.id.clone();
            let old = std::mem::replace(&mut keys.signed_prekey, new_signed_prekey);
            let old_id = old.public.id.clone();
            keys.previous_signed_prekey = Some(old);
            keys.one_time_prekeys.extend(
                new_one_time_prekeys
                    .into_iter()
                    .map(|pair| (pair.public.id.clone(), pair)),
            );
            (old_id, new_id)
        };
        info!(user_id, one_time_prekeys_added = added, "rotated signed prekey");
        self.record_key_change(
            user_id,
            KeyChange::SignedPrekeyRotated,
            None,
            (Some(old_id), Some(new_id)),
            reason,
        );
        self.check_prekey_pool(user_id);
        Ok(())
    }

    pub fn remaining_one_time_prekeys(&self, user_id: &str) -> usize {
        self.directory.remaining_one_time_prekeys(user_id)
    }

    fn generate_one_time_prekeys(
        &self,
        user_id: &str,
        device_id: &str,
        count: usize,
    ) -> Result<Vec<KeyPair>, CryptoError> {
        (0..count)
            .map(|_| {
                self.engine
                    .generate_keypair(KeyExchangeProtocol::X25519, user_id, device_id)
            })
            .collect()
    }

    fn check_prekey_pool(&self, user_id: &str) {
        let remaining = self.directory.remaining_one_time_prekeys(user_id);
        if remaining < self.config.one_time_prekey_low_water {
            warn!(
                user_id,
                remaining,
                low_water = self.config.one_time_prekey_low_water,
                "one-time prekey pool is running low"
            );
        }
    }

    fn user_material(&self, user_id: &str) -> Result<(KeyPair, String), CryptoError> {
        let users = self.users.read();
        let keys = users
            .get(user_id)
            .ok_or_else(|| CryptoError::UnknownUser(user_id.to_string()))?;
        Ok((keys.identity.clone(), keys.device_id.clone()))
    }

    // ── Establishment ────────────────────────────────────────────────────

    /// Run X3DH against `recipient`'s published bundle and post the
    /// handshake. Returns the new session id.
    pub fn initiate_session(
        &self,
        sender: &str,
        recipient: &str,
        device: Option<&str>,
    ) -> Result<String, CryptoError> {
        let (identity, _) = self.user_material(sender)?;
        let bundle = self.directory.fetch_bundle(recipient)?;
        if let Some(device) = device {
            if bundle.device_id != device {
                return Err(CryptoError::UnknownUser(format!("{recipient}/{device}")));
            }
        }
        if bundle.one_time_prekey.is_none() {
            warn!(
                sender,
                recipient, "no one-time prekey available, continuing without one"
            );
        }

        let session_id = self.engine.generate_session_id()?;
        let entry = Arc::new(Mutex::new(SessionEntry::new(
            &session_id,
            sender,
            recipient,
            SessionRole::Initiator,
            self.config.session_ttl(),
        )));
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&entry));

        let mut guard = entry.lock();
        let established = (|| {
            let init = x3dh::initiate(&self.engine, &session_id, &identity, recipient, &bundle)?;
            let safety = fingerprint::safety_material(
                init.root.key_data(),
                identity.public.key_data(),
                init.remote_identity.key_data(),
            );
            let ratchet = RatchetState::new_initiator(
                &self.engine,
                &session_id,
                init.root,
                init.local_ratchet,
                init.remote_ratchet_key,
                guard.expires_at,
                &self.config,
            )?;
            self.directory.post_handshake(init.handshake)?;
            Ok::<_, CryptoError>((ratchet, safety))
        })();

        match established {
            Ok((ratchet, safety)) => {
                guard.ratchet = Some(ratchet);
                guard.safety = Some(safety);
                guard.state = SessionState::Active;
                drop(guard);
                self.counters.sessions_established.fetch_add(1, Ordering::Relaxed);
                info!(session_id = %session_id, sender, recipient, "session initiated");
                Ok(session_id)
            }
            Err(e) => {
                drop(guard);
                self.sessions.write().remove(&session_id);
                warn!(sender, recipient, error = %e, "session initiation failed");
                Err(e)
            }
        }
    }

    /// Take the pending handshake for `session_id` from the directory and
    /// complete it as `recipient`.
    pub fn accept_session(
        &self,
        session_id: &str,
        recipient: &str,
        sender: &str,
    ) -> Result<(), CryptoError> {
        let handshake = self.directory.take_handshake(session_id)?;
        if handshake.recipient_id != recipient || handshake.sender_id != sender {
            let err = CryptoError::InvalidKey(format!(
                "handshake {session_id} is not from {sender} to {recipient}"
            ));
            self.directory.post_handshake(handshake)?;
            return Err(err);
        }
        self.accept_handshake(handshake, recipient).map(|_| ())
    }

    /// Complete a handshake delivered out of band.
    pub fn accept_handshake(
        &self,
        handshake: SessionHandshake,
        recipient: &str,
    ) -> Result<String, CryptoError> {
        let session_id = handshake.session_id.clone();
        if handshake.recipient_id != recipient {
            return Err(CryptoError::InvalidKey(format!(
                "handshake {session_id} is addressed to {}",
                handshake.recipient_id
            )));
        }

        let entry = Arc::new(Mutex::new(SessionEntry::new(
            &session_id,
            recipient,
            &handshake.sender_id,
            SessionRole::Responder,
            self.config.session_ttl(),
        )));
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&session_id) {
                return Err(CryptoError::InvalidKey(format!(
                    "session {session_id} already exists on this device"
                )));
            }
            sessions.insert(session_id.clone(), Arc::clone(&entry));
        }

        let mut guard = entry.lock();
        let established = (|| {
            // The one-time prekey leaves the pool here whatever happens next.
            let (identity, signed_prekey, one_time) = {
                let mut users = self.users.write();
                let keys = users
                    .get_mut(recipient)
                    .ok_or_else(|| CryptoError::UnknownUser(recipient.to_string()))?;
                let spk = keys
                    .signed_prekey_by_id(&handshake.signed_prekey_id)
                    .cloned()
                    .ok_or_else(|| {
                        CryptoError::InvalidKey(format!(
                            "signed prekey {} is no longer available",
                            handshake.signed_prekey_id
                        ))
                    })?;
                let opk = match &handshake.one_time_prekey_id {
                    Some(id) => Some(keys.one_time_prekeys.remove(id).ok_or_else(|| {
                        CryptoError::InvalidKey(format!("one-time prekey {id} already used"))
                    })?),
                    None => None,
                };
                (keys.identity.clone(), spk, opk)
            };

            let root = x3dh::respond(
                &self.engine,
                &handshake,
                &identity,
                &signed_prekey.private,
                one_time.as_ref().map(|pair| &pair.private),
            )?;
            let sender_identity = handshake.sender_identity_public()?;
            let safety = fingerprint::safety_material(
                root.key_data(),
                identity.public.key_data(),
                sender_identity.key_data(),
            );
            let ratchet = RatchetState::new_responder(
                &self.engine,
                &session_id,
                root,
                signed_prekey,
                handshake.ratchet_public()?,
                guard.expires_at,
                &self.config,
            )?;
            Ok::<_, CryptoError>((ratchet, safety))
        })();

        match established {
            Ok((ratchet, safety)) => {
                guard.ratchet = Some(ratchet);
                guard.safety = Some(safety);
                guard.state = SessionState::Active;
                drop(guard);
                self.counters.sessions_established.fetch_add(1, Ordering::Relaxed);
                info!(
                    session_id = %session_id,
                    recipient,
                    sender = %handshake.sender_id,
                    "session accepted"
                );
                self.check_prekey_pool(recipient);
                Ok(session_id)
            }
            Err(e) => {
                drop(guard);
                self.sessions.write().remove(&session_id);
                warn!(session_id = %session_id, recipient, error = %e, "session accept failed");
                Err(e)
            }
        }
    }

    // ── Messages ─────────────────────────────────────────────────────────

    fn entry(&self, session_id: &str) -> Result<Arc<Mutex<SessionEntry>>, CryptoError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CryptoError::SessionNotActive(session_id.to_string()))
    }

    /// Encrypt under the next sending message key.
    pub fn encrypt_message(
        &self,
        session_id: &str,
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<(Vec<u8>, MessageMetadata), CryptoError> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock();
        let ratchet = guard.active_ratchet()?;

        let (mut message_key, header) = ratchet.next_sending_key(&self.engine)?;
        message_key.algorithm = KeyAlgorithm::Symmetric(self.engine.config().default_cipher);
        let (ciphertext, mut context) = self.engine.encrypt(plaintext, &message_key, aad)?;
        context.session_id = session_id.to_string();

        guard.messages_sent += 1;
        guard.last_activity = Utc::now();
        self.counters.messages_encrypted.fetch_add(1, Ordering::Relaxed);
        debug!(
            session_id,
            generation = header.generation,
            counter = header.counter,
            "message encrypted"
        );
        Ok((ciphertext, MessageMetadata::new(context, header)))
    }

    /// Decrypt one message. Ratchet state only moves if the tag verifies.
    pub fn decrypt_message(
        &self,
        session_id: &str,
        ciphertext: &[u8],
        metadata: &MessageMetadata,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let result = self.decrypt_inner(session_id, ciphertext, metadata);
        if let Err(e) = &result {
            self.counters.decrypt_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "audit",
                session_id,
                generation = metadata.generation,
                counter = metadata.counter,
                error = %e,
                "message decrypt failed"
            );
        }
        result
    }

    fn decrypt_inner(
        &self,
        session_id: &str,
        ciphertext: &[u8],
        metadata: &MessageMetadata,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if metadata.session_id != session_id {
            return Err(CryptoError::SessionNotActive(metadata.session_id.clone()));
        }
        if !metadata.algorithm.is_secure() {
            return Err(CryptoError::UnsupportedAlgorithm(metadata.algorithm.to_string()));
        }
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock();
        let ratchet = guard.active_ratchet()?;

        let step = ratchet.plan_receive(&self.engine, &metadata.header())?;
        let mut message_key = step.message_key.clone();
        message_key.algorithm = KeyAlgorithm::Symmetric(metadata.algorithm);
        let plaintext = self
            .engine
            .decrypt(ciphertext, &message_key, &metadata.context())?;

        let evicted = ratchet.commit_receive(step);
        match ratchet.take_requested_step(&self.engine) {
            Ok(true) => debug!(session_id, "deferred ratchet step taken"),
            Ok(false) => {}
            // left pending; the next encrypt retries
            Err(e) => warn!(session_id, error = %e, "deferred ratchet step failed"),
        }
        if evicted > 0 {
            self.counters
                .skipped_keys_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            warn!(session_id, evicted, "skipped message keys evicted");
        }
        guard.messages_received += 1;
        guard.last_activity = Utc::now();
        self.counters.messages_decrypted.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }

    // ── Ratchet control ──────────────────────────────────────────────────

    /// Sending DH step, taken now if the peer's newest ratchet key is
    /// unanswered and otherwise as soon as the next one arrives. Returns
    /// whether the step ran now.
    pub fn advance_ratchet(&self, session_id: &str) -> Result<bool, CryptoError> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock();
        let stepped = guard.active_ratchet()?.request_step(&self.engine)?;
        guard.last_activity = Utc::now();
        debug!(session_id, stepped, "ratchet advance requested");
        Ok(stepped)
    }

    /// Erase the ratchet; the session drops back to `Uninitialized`.
    pub fn reset_ratchet(&self, session_id: &str) -> Result<(), CryptoError> {
        let entry = self.entry(session_id)?;
        let mut guard = entry.lock();
        guard.erase();
        guard.state = SessionState::Uninitialized;
        warn!(session_id, "ratchet reset");
        Ok(())
    }

    /// `advance_ratchet`, recorded in the key log.
    pub fn rotate_session_keys(&self, session_id: &str) -> Result<bool, CryptoError> {
        let stepped = self.advance_ratchet(session_id)?;
        let local_user = self.entry(session_id)?.lock().local_user.clone();
        let reason = if stepped { "stepped" } else { "step requested" };
        self.record_key_change(
            &local_user,
            KeyChange::SessionRotated,
            Some(session_id),
            (None, None),
            reason,
        );
        info!(session_id, stepped, "session keys rotated");
        Ok(stepped)
    }

    /// New signed prekey and one-time batch for `user_id`, plus a DH step
    /// request on each of the user's active sessions.
    pub fn rotate_all_user_keys(&self, user_id: &str) -> Result<RotationReport, CryptoError> {
        let (_, device_id) = self.user_material(user_id)?;
        let signed_prekey =
            self.engine
                .generate_keypair(KeyExchangeProtocol::X25519, user_id, &device_id)?;
        let batch = self.config.rotation_batch_size;
        let one_time = self.generate_one_time_prekeys(user_id, &device_id, batch)?;
        self.replace_signed_prekey(user_id, signed_prekey, one_time, "scheduled rotation")?;

        let mut report = RotationReport {
            one_time_prekeys_added: batch,
            ..RotationReport::default()
        };
        for session_id in self.active_session_ids(|e| e.local_user == user_id) {
            match self.rotate_session_keys(&session_id) {
                Ok(true) => report.sessions_rotated += 1,
                Ok(false) => report.sessions_deferred += 1,
                Err(e) => warn!(session_id = %session_id, error = %e, "session rotation skipped"),
            }
        }
        info!(
            user_id,
            sessions_rotated = report.sessions_rotated,
            sessions_deferred = report.sessions_deferred,
            "rotated all user keys"
        );
        Ok(report)
    }

    /// Sessions whose peer asked for a DH step. Any message we send on
    /// them, even an empty one, lets the step happen.
    pub fn pending_rekey_requests(&self) -> Vec<String> {
        self.active_session_ids(|e| {
            e.ratchet
                .as_ref()
                .is_some_and(|r| r.info().peer_requested_step)
        })
    }

    // ── Compromise ───────────────────────────────────────────────────────

    /// Erase the session's keys and refuse further traffic on it.
    pub fn mark_session_compromised(&self, session_id: &str) -> Result<(), CryptoError> {
        let entry = self.entry(session_id)?;
        let local_user = {
            let mut guard = entry.lock();
            guard.erase();
            guard.state = SessionState::Closed;
            guard.compromised = true;
            guard.local_user.clone()
        };
        warn!(target: "audit", session_id, "session marked compromised");
        self.record_key_change(
            &local_user,
            KeyChange::SessionCompromised,
            Some(session_id),
            (None, None),
            "marked compromised",
        );
        Ok(())
    }

    /// Replace a compromised session with a fresh X3DH session to the same
    /// peer. Returns the new session id; the peer accepts it as usual.
    pub fn recover_from_compromise(&self, session_id: &str) -> Result<String, CryptoError> {
        let entry = self.entry(session_id)?;
        let (local_user, peer_user) = {
            let guard = entry.lock();
            if !guard.compromised {
                return Err(CryptoError::NotCompromised(session_id.to_string()));
            }
            (guard.local_user.clone(), guard.peer_user.clone())
        };

        let new_session = self.initiate_session(&local_user, &peer_user, None)?;
        self.sessions.write().remove(session_id);
        self.record_key_change(
            &local_user,
            KeyChange::SessionRecovered,
            Some(&new_session),
            (None, None),
            &format!("replaces {session_id}"),
        );
        info!(session_id, new_session = %new_session, "recovered from compromise");
        Ok(new_session)
    }

    // ── Key log ──────────────────────────────────────────────────────────

    /// Key changes recorded for `user_id`, oldest first.
    pub fn get_key_log(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Vec<KeyLogEntry> {
        self.key_log.entries_for(user_id, since)
    }

    /// Hash and signature of `entry` against its user's identity key.
    pub fn verify_key_log_entry(&self, entry: &KeyLogEntry) -> bool {
        let users = self.users.read();
        users
            .get(&entry.user_id)
            .is_some_and(|keys| entry.verify(&self.engine, &keys.identity.public))
    }

    /// Every retained entry hashes correctly and links to its predecessor.
    pub fn key_log_intact(&self) -> bool {
        self.key_log.verify_chain(&self.engine)
    }

    fn record_key_change(
        &self,
        user_id: &str,
        change: KeyChange,
        session_id: Option<&str>,
        (old_key_id, new_key_id): (Option<String>, Option<String>),
        reason: &str,
    ) {
        let users = self.users.read();
        let Some(keys) = users.get(user_id) else {
            warn!(user_id, ?change, "key change not logged: unknown user");
            return;
        };
        let record = KeyChangeRecord {
            user_id: user_id.to_string(),
            device_id: keys.device_id.clone(),
            change,
            session_id: session_id.map(str::to_string),
            old_key_id,
            new_key_id,
            reason: reason.to_string(),
        };
        if let Err(e) = self.key_log.append(&self.engine, &keys.identity.private, record) {
            warn!(user_id, ?change, error = %e, "key change not logged");
        }
    }

    // ── Fingerprints ─────────────────────────────────────────────────────

    /// Safety number; identical on both ends of a session.
    pub fn get_session_fingerprint(&self, session_id: &str) -> Result<String, CryptoError> {
        let entry = self.entry(session_id)?;
        let guard = entry.lock();
        guard
            .safety
            .as_ref()
            .map(fingerprint::numeric)
            .ok_or_else(|| CryptoError::SessionNotActive(session_id.to_string()))
    }

    /// Whitespace-insensitive, no early exit.
    pub fn compare_fingerprints(&self, a: &str, b: &str) -> bool {
        let strip = |s: &str| s.split_whitespace().collect::<String>();
        fingerprint::constant_time_eq(strip(a).as_bytes(), strip(b).as_bytes())
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    pub fn close_session(&self, session_id: &str) -> Result<(), CryptoError> {
        let entry = self.entry(session_id)?;
        let local_user = {
            let mut guard = entry.lock();
            guard.erase();
            guard.state = SessionState::Closed;
            guard.local_user.clone()
        };
        info!(session_id, "session closed");
        self.record_key_change(
            &local_user,
            KeyChange::SessionClosed,
            Some(session_id),
            (None, None),
            "closed",
        );
        Ok(())
    }

    /// Close every session `user_id` takes part in. Returns how many.
    pub fn close_all_sessions(&self, user_id: &str) -> usize {
        let ids = self.session_ids(|e| e.involves(user_id) && e.state != SessionState::Closed);
        ids.iter()
            .filter(|id| self.close_session(id).is_ok())
            .count()
    }

    /// Close sessions idle for longer than `max_age`.
    pub fn cleanup_old_sessions(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let ids = self.session_ids(|e| e.state != SessionState::Closed && e.last_activity < cutoff);
        let closed = ids
            .iter()
            .filter(|id| self.close_session(id).is_ok())
            .count();
        if closed > 0 {
            info!(closed, "closed idle sessions");
        }
        closed
    }

    /// Periodic maintenance: expired cache keys, then expired and closed
    /// sessions, a chunk at a time.
    pub fn sweep(&self) -> SweepReport {
        let chunk = self.config.sweep_chunk_size.max(1);
        let mut report = SweepReport {
            expired_keys: self.engine.cleanup_expired_keys_chunked(chunk),
            ..SweepReport::default()
        };

        let now = Utc::now();
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for batch in ids.chunks(chunk) {
            let mut doomed = Vec::new();
            for id in batch {
                let Ok(entry) = self.entry(id) else { continue };
                let mut guard = entry.lock();
                if guard.state == SessionState::Closed {
                    report.closed_sessions += 1;
                    doomed.push(id.clone());
                } else if guard.is_expired(now) {
                    guard.erase();
                    guard.state = SessionState::Closed;
                    report.expired_sessions += 1;
                    doomed.push(id.clone());
                }
            }
            if !doomed.is_empty() {
                let mut sessions = self.sessions.write();
                for id in &doomed {
                    sessions.remove(id);
                }
            }
        }
        debug!(
            expired_keys = report.expired_keys,
            expired_sessions = report.expired_sessions,
            closed_sessions = report.closed_sessions,
            "sweep finished"
        );
        report
    }

    // ── Queries ──────────────────────────────────────────────────────────

    fn session_ids(&self, pred: impl Fn(&SessionEntry) -> bool) -> Vec<String> {
        let entries: Vec<(String, Arc<Mutex<SessionEntry>>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();
        let mut ids: Vec<String> = entries
            .into_iter()
            .filter(|(_, e)| pred(&*e.lock()))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    fn active_session_ids(&self, pred: impl Fn(&SessionEntry) -> bool) -> Vec<String> {
        let now = Utc::now();
        self.session_ids(|e| e.state == SessionState::Active && !e.is_expired(now) && pred(e))
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.entry(session_id)
            .map(|e| {
                let e = e.lock();
                e.state == SessionState::Active && !e.is_expired(Utc::now())
            })
            .unwrap_or(false)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.entry(session_id).ok().map(|e| e.lock().state)
    }

    /// Active sessions `user_id` takes part in, sorted by id.
    pub fn get_active_sessions(&self, user_id: &str) -> Vec<String> {
        self.active_session_ids(|e| e.involves(user_id))
    }

    /// Active, unexpired, with a ratchet whose keys and counters line up.
    pub fn verify_session_integrity(&self, session_id: &str) -> bool {
        let Ok(entry) = self.entry(session_id) else {
            return false;
        };
        let e = entry.lock();
        e.state == SessionState::Active
            && !e.is_expired(Utc::now())
            && e.safety.is_some()
            && e.ratchet.as_ref().is_some_and(RatchetState::is_consistent)
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo, CryptoError> {
        let entry = self.entry(session_id)?;
        let e = entry.lock();
        Ok(SessionInfo {
            session_id: e.session_id.clone(),
            local_user: e.local_user.clone(),
            peer_user: e.peer_user.clone(),
            role: e.role,
            state: e.state,
            created_at: e.created_at,
            last_activity: e.last_activity,
            expires_at: e.expires_at,
            messages_sent: e.messages_sent,
            messages_received: e.messages_received,
            compromised: e.compromised,
            ratchet: e.ratchet.as_ref().map(RatchetState::info),
            fingerprint: e.safety.as_ref().map(fingerprint::numeric),
        })
    }

    /// `session_info` as JSON. Never contains key material.
    pub fn export_session_info(&self, session_id: &str) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(&self.session_info(session_id)?)?)
    }

    pub fn get_encryption_metrics(&self) -> EncryptionMetrics {
        let c = &self.counters;
        let total_sessions = self.sessions.read().len();
        EncryptionMetrics {
            engine: self.engine.metrics(),
            registered_users: self.users.read().len(),
            total_sessions,
            active_sessions: self.active_session_ids(|_| true).len(),
            messages_encrypted: c.messages_encrypted.load(Ordering::Relaxed),
            messages_decrypted: c.messages_decrypted.load(Ordering::Relaxed),
            decrypt_failures: c.decrypt_failures.load(Ordering::Relaxed),
            skipped_keys_evicted: c.skipped_keys_evicted.load(Ordering::Relaxed),
            sessions_established: c.sessions_established.load(Ordering::Relaxed),
        }
    }
}

fn expect_pair(
    pair: &KeyPair,
    private: KeyAlgorithm,
    public: KeyAlgorithm,
) -> Result<(), CryptoError> {
    if pair.private.algorithm != private || pair.public.algorithm != public {
        return Err(CryptoError::AlgorithmMismatch(format!(
            "expected a {private}/{public} pair, got {}/{}",
            pair.private.algorithm, pair.public.algorithm
        )));
    }
    Ok(())
}

fn publish_list(pairs: &[KeyPair]) -> Result<Vec<OneTimePrekey>, CryptoError> {
    pairs
        .iter()
        .map(|pair| {
            Ok(OneTimePrekey {
                id: pair.public.id.clone(),
                public_key: public_b64(&pair.public)?,
            })
        })
        .collect()
}

fn public_b64(key: &CryptoKey) -> Result<String, CryptoError> {
    key.encoded_public()
        .ok_or_else(|| CryptoError::InvalidKey(format!("{} is not a public key", key.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;

    fn manager(directory: &Arc<InMemoryDirectory>) -> E2EEncryptionManager {
        E2EEncryptionManager::new(
            Arc::new(CryptoEngine::with_defaults().unwrap()),
            Arc::clone(directory) as Arc<dyn KeyDirectory>,
            SessionConfig::default(),
        )
    }

    #[test]
    fn states_move_through_the_lifecycle() {
        let dir = Arc::new(InMemoryDirectory::new());
        let alice = manager(&dir);
        let bob = manager(&dir);
        alice.provision_user("alice", "a-phone", 2).unwrap();
        bob.provision_user("bob", "b-phone", 2).unwrap();

        let sid = alice.initiate_session("alice", "bob", None).unwrap();
        assert_eq!(alice.session_state(&sid), Some(SessionState::Active));
        bob.accept_session(&sid, "bob", "alice").unwrap();
        assert_eq!(bob.session_state(&sid), Some(SessionState::Active));

        bob.reset_ratchet(&sid).unwrap();
        assert_eq!(bob.session_state(&sid), Some(SessionState::Uninitialized));
        assert!(!bob.is_session_active(&sid));

        alice.close_session(&sid).unwrap();
        assert_eq!(alice.session_state(&sid), Some(SessionState::Closed));
        assert_eq!(alice.sweep().closed_sessions, 1);
        assert_eq!(alice.session_state(&sid), None);
    }

    #[test]
    fn wrong_key_types_are_rejected_at_registration() {
        let dir = Arc::new(InMemoryDirectory::new());
        let m = manager(&dir);
        let e = m.engine();
        let x = e.generate_keypair(KeyExchangeProtocol::X25519, "u", "d").unwrap();
        let x2 = e.generate_keypair(KeyExchangeProtocol::X25519, "u", "d").unwrap();
        assert!(matches!(
            m.register_user_keys("u", x, x2, vec![]),
            Err(CryptoError::AlgorithmMismatch(_))
        ));
    }

    #[test]
    fn signed_prekey_rotation_keeps_previous_for_in_flight_handshakes() {
        let dir = Arc::new(InMemoryDirectory::new());
        let alice = manager(&dir);
        let bob = manager(&dir);
        alice.provision_user("alice", "a", 1).unwrap();
        bob.provision_user("bob", "b", 1).unwrap();

        let sid = alice.initiate_session("alice", "bob", None).unwrap();
        bob.rotate_all_user_keys("bob").unwrap();
        bob.accept_session(&sid, "bob", "alice").unwrap();
        assert_eq!(
            alice.get_session_fingerprint(&sid).unwrap(),
            bob.get_session_fingerprint(&sid).unwrap()
        );
    }

    #[test]
    fn device_filter_on_initiate() {
        let dir = Arc::new(InMemoryDirectory::new());
        let alice = manager(&dir);
        let bob = manager(&dir);
        alice.provision_user("alice", "a", 1).unwrap();
        bob.provision_user("bob", "b-laptop", 1).unwrap();
        assert!(matches!(
            alice.initiate_session("alice", "bob", Some("b-phone")),
            Err(CryptoError::UnknownUser(_))
        ));
        assert!(alice.initiate_session("alice", "bob", Some("b-laptop")).is_ok());
    }
}
