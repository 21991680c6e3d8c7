//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation:
//!   RK  : root key (updated on every DH ratchet step)
//!   CKs : sending chain key (updated per message)
//!   CKr : receiving chain key (updated per message)
//!   MK  : message key (derived from CK, used once, then dropped)
//!
//! DH Ratchet:
//!   Seeing a new remote ratchet key triggers the receiving step at once and
//!   marks a sending step as pending; the sending step (fresh local keypair,
//!   new root, new sending chain) runs on our next encrypt. Every derivation
//!   goes through `CryptoEngine::perform_key_exchange` / `derive_key`.
//!
//!   Sending steps strictly alternate with the peer's: we only step after
//!   seeing a ratchet key newer than the one we last answered. A step asked
//!   for outside that window (rotation, rekey policy) is deferred and
//!   flagged in our headers until the peer's next ratchet key arrives.
//!
//! Receiving is two-phase: `plan_receive` derives everything into a
//! `ReceiveStep` without touching the state, and `commit_receive` applies
//! it once the AEAD tag has verified.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::algorithm::{KeyAlgorithm, KeyExchangeProtocol};
use crate::config::SessionConfig;
use crate::context::KeyDerivationParams;
use crate::engine::CryptoEngine;
use crate::error::CryptoError;
use crate::key::{CryptoKey, KeyPair};

const ROOT_CONTEXT: &str = "e2ee-ratchet-root";
const CHAIN_CONTEXT: &str = "e2ee-ratchet-chain";
const NEXT_CHAIN_CONTEXT: &str = "e2ee-chain-next";
const MESSAGE_KEY_CONTEXT: &str = "e2ee-message-key";

/// Sent alongside every ciphertext so the recipient can advance their ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64url)
    pub ratchet_key: String,
    /// Sender's DH step count; names the chain
    pub generation: u32,
    /// Message number in the current sending chain
    pub counter: u32,
    /// Number of messages in the sender's previous chain
    pub previous_chain_length: u32,
    /// Sender wants a DH step and is waiting for our next ratchet key
    #[serde(default)]
    pub rekey_requested: bool,
}

/// Non-secret view of a ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatchetInfo {
    pub send_generation: u32,
    pub recv_generation: u32,
    pub send_count: u32,
    pub recv_count: u32,
    pub previous_chain_length: u32,
    pub skipped_keys: usize,
    pub send_step_pending: bool,
    /// We asked for a step the peer has not made possible yet.
    pub step_requested: bool,
    /// The peer asked for a step; any message from us lets it happen.
    pub peer_requested_step: bool,
}

// ── Skipped message keys ─────────────────────────────────────────────────────

/// Insertion-ordered, bounded `(generation, counter) → message key`.
#[derive(Clone)]
struct SkippedKeys {
    keys: HashMap<(u32, u32), CryptoKey>,
    order: VecDeque<(u32, u32)>,
    cap: usize,
}

impl SkippedKeys {
    fn new(cap: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Returns how many old entries were evicted.
    fn insert(&mut self, slot: (u32, u32), key: CryptoKey) -> usize {
        if self.cap == 0 {
            return 1;
        }
        let mut evicted = 0;
        while self.keys.len() >= self.cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.keys.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        self.keys.insert(slot, key);
        self.order.push_back(slot);
        if self.order.len() > self.cap.saturating_mul(2) {
            let keys = &self.keys;
            self.order.retain(|s| keys.contains_key(s));
        }
        evicted
    }

    fn get(&self, slot: &(u32, u32)) -> Option<&CryptoKey> {
        self.keys.get(slot)
    }

    fn remove(&mut self, slot: &(u32, u32)) -> Option<CryptoKey> {
        self.keys.remove(slot)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

// ── Receive staging ──────────────────────────────────────────────────────────

/// Everything one incoming message would change, not yet applied.
pub(crate) struct ReceiveStep {
    pub message_key: CryptoKey,
    skipped_hit: Option<(u32, u32)>,
    new_skipped: Vec<((u32, u32), CryptoKey)>,
    ratchet: Option<(CryptoKey, CryptoKey, u32)>,
    chain_key: Option<CryptoKey>,
    recv_count: u32,
    rekey_requested: bool,
}

// ── Session state ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct RatchetState {
    session_id: String,
    expires_at: DateTime<Utc>,
    root_key: CryptoKey,
    sending_chain: Option<CryptoKey>,
    receiving_chain: Option<CryptoKey>,
    local_ratchet: KeyPair,
    remote_ratchet: CryptoKey,
    send_count: u32,
    recv_count: u32,
    previous_chain_length: u32,
    send_generation: u32,
    recv_generation: u32,
    send_step_pending: bool,
    step_requested: bool,
    peer_requested_step: bool,
    sending_chain_started: DateTime<Utc>,
    skipped: SkippedKeys,
    max_skip_per_message: u32,
    rekey_after_messages: u32,
    rekey_after: Option<Duration>,
}

impl RatchetState {
    /// Initiator: `local` is the ratchet pair announced in the handshake,
    /// `remote` the responder's signed prekey. The first sending chain is
    /// derived immediately.
    pub fn new_initiator(
        engine: &CryptoEngine,
        session_id: &str,
        root: CryptoKey,
        local: KeyPair,
        remote: CryptoKey,
        expires_at: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Result<Self, CryptoError> {
        let mut state = Self::blank(session_id, root, local, remote, expires_at, config);
        let dh = state.dh(engine, &state.local_ratchet.private, &state.remote_ratchet)?;
        let (root, chain) = state.kdf_rk(engine, &dh)?;
        state.root_key = root;
        state.sending_chain = Some(chain);
        state.send_generation = 1;
        Ok(state)
    }

    /// Responder: `local` is the signed prekey pair, `remote` the
    /// initiator's announced ratchet key. The initiator's first chain is
    /// derived immediately; our first sending step is left pending.
    pub fn new_responder(
        engine: &CryptoEngine,
        session_id: &str,
        root: CryptoKey,
        local: KeyPair,
        remote: CryptoKey,
        expires_at: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Result<Self, CryptoError> {
        let mut state = Self::blank(session_id, root, local, remote, expires_at, config);
        let dh = state.dh(engine, &state.local_ratchet.private, &state.remote_ratchet)?;
        let (root, chain) = state.kdf_rk(engine, &dh)?;
        state.root_key = root;
        state.receiving_chain = Some(chain);
        state.recv_generation = 1;
        state.send_step_pending = true;
        Ok(state)
    }

    fn blank(
        session_id: &str,
        root: CryptoKey,
        local: KeyPair,
        remote: CryptoKey,
        expires_at: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            expires_at,
            root_key: root.with_expiry(expires_at),
            sending_chain: None,
            receiving_chain: None,
            local_ratchet: KeyPair {
                private: local.private.with_expiry(expires_at),
                public: local.public.with_expiry(expires_at),
            },
            remote_ratchet: remote.with_expiry(expires_at),
            send_count: 0,
            recv_count: 0,
            previous_chain_length: 0,
            send_generation: 0,
            recv_generation: 0,
            send_step_pending: false,
            step_requested: false,
            peer_requested_step: false,
            sending_chain_started: Utc::now(),
            skipped: SkippedKeys::new(config.max_skipped_keys),
            max_skip_per_message: config.max_skip_per_message,
            rekey_after_messages: config.rekey_after_messages,
            rekey_after: config.rekey_after(),
        }
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Next sending message key plus the header that lets the peer find it.
    pub fn next_sending_key(
        &mut self,
        engine: &CryptoEngine,
    ) -> Result<(CryptoKey, RatchetHeader), CryptoError> {
        if !self.send_step_pending && !self.step_requested && self.rekey_due(Utc::now()) {
            self.step_requested = true;
            tracing::debug!(
                session_id = %self.session_id,
                generation = self.send_generation,
                "rekey due, waiting for the peer's next ratchet key"
            );
        }
        if self.send_step_pending || self.sending_chain.is_none() {
            self.sending_step(engine)?;
        }
        let chain = self
            .sending_chain
            .as_ref()
            .ok_or_else(|| CryptoError::SessionNotActive(self.session_id.clone()))?;
        let (next, mk) = self.kdf_ck(engine, chain, self.send_generation, self.send_count)?;
        self.sending_chain = Some(next);

        let header = RatchetHeader {
            ratchet_key: self.local_public_b64()?,
            generation: self.send_generation,
            counter: self.send_count,
            previous_chain_length: self.previous_chain_length,
            rekey_requested: self.step_requested,
        };
        self.send_count += 1;
        self.peer_requested_step = false;
        Ok((mk, header))
    }

    /// Ask for a sending DH step. It runs now if the peer's newest ratchet
    /// key is still unanswered; otherwise it waits for the next one.
    /// Returns whether the step ran.
    pub fn request_step(&mut self, engine: &CryptoEngine) -> Result<bool, CryptoError> {
        if self.send_step_pending {
            self.sending_step(engine)?;
            return Ok(true);
        }
        self.step_requested = true;
        Ok(false)
    }

    /// Run a deferred step once the peer has made it possible.
    pub fn take_requested_step(&mut self, engine: &CryptoEngine) -> Result<bool, CryptoError> {
        if self.step_requested && self.send_step_pending {
            self.sending_step(engine)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Count or age limit of the current sending chain reached.
    pub fn rekey_due(&self, now: DateTime<Utc>) -> bool {
        if self.sending_chain.is_none() {
            return false;
        }
        let by_count = self.rekey_after_messages > 0 && self.send_count >= self.rekey_after_messages;
        let by_age = self
            .rekey_after
            .is_some_and(|limit| now - self.sending_chain_started >= limit);
        by_count || by_age
    }

    /// Sending DH step: fresh local pair, new root, new sending chain.
    /// Only sound while `send_step_pending` holds.
    fn sending_step(&mut self, engine: &CryptoEngine) -> Result<(), CryptoError> {
        let owner = self.local_ratchet.private.user_id.clone();
        let device = self.local_ratchet.private.device_id.clone();
        let fresh = engine.generate_keypair(KeyExchangeProtocol::X25519, &owner, &device)?;
        let fresh = KeyPair {
            private: fresh.private.with_expiry(self.expires_at),
            public: fresh.public.with_expiry(self.expires_at),
        };
        let dh = self.dh(engine, &fresh.private, &self.remote_ratchet)?;
        let (root, chain) = self.kdf_rk(engine, &dh)?;

        self.root_key = root;
        self.sending_chain = Some(chain);
        self.local_ratchet = fresh;
        self.previous_chain_length = self.send_count;
        self.send_count = 0;
        self.send_generation += 1;
        self.send_step_pending = false;
        self.step_requested = false;
        self.sending_chain_started = Utc::now();
        tracing::debug!(
            session_id = %self.session_id,
            generation = self.send_generation,
            "sending ratchet step"
        );
        Ok(())
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Work out the message key for `header` without mutating the state.
    ///
    /// Handles three cases:
    ///   1. Key cached earlier under (generation, counter)
    ///   2. Message from the current receiving chain, possibly after a gap
    ///   3. New remote ratchet key: close out the current chain, DH step
    pub fn plan_receive(
        &self,
        engine: &CryptoEngine,
        header: &RatchetHeader,
    ) -> Result<ReceiveStep, CryptoError> {
        let slot = (header.generation, header.counter);
        if let Some(mk) = self.skipped.get(&slot) {
            return Ok(ReceiveStep {
                message_key: mk.clone(),
                skipped_hit: Some(slot),
                new_skipped: Vec::new(),
                ratchet: None,
                chain_key: None,
                recv_count: self.recv_count,
                rekey_requested: false,
            });
        }
        let not_found = || CryptoError::MessageKeyNotFound {
            generation: header.generation,
            counter: header.counter,
        };

        let remote = CryptoKey::public_from_b64(
            format!("{}:remote:{}", self.session_id, header.generation),
            KeyAlgorithm::X25519Public,
            &header.ratchet_key,
            self.expires_at,
        )?;
        let is_new_chain = remote.key_data() != self.remote_ratchet.key_data();

        let mut new_skipped = Vec::new();
        let mut ratchet = None;
        let (mut chain, mut count, generation) = if is_new_chain {
            if header.generation <= self.recv_generation {
                return Err(not_found());
            }
            let close_out = match &self.receiving_chain {
                Some(_) => header.previous_chain_length.saturating_sub(self.recv_count),
                None => 0,
            };
            self.check_skip_budget(close_out.saturating_add(header.counter))?;
            if let Some(current) = &self.receiving_chain {
                let mut ck = current.clone();
                for n in self.recv_count..header.previous_chain_length {
                    let (next, mk) = self.kdf_ck(engine, &ck, self.recv_generation, n)?;
                    new_skipped.push(((self.recv_generation, n), mk));
                    ck = next;
                }
            }

            let dh = self.dh(engine, &self.local_ratchet.private, &remote)?;
            let (root, ck) = self.kdf_rk_from(engine, &self.root_key, &dh)?;
            ratchet = Some((root, remote, header.generation));
            (ck, 0, header.generation)
        } else {
            if header.generation != self.recv_generation || header.counter < self.recv_count {
                return Err(not_found());
            }
            let current = self.receiving_chain.as_ref().ok_or_else(not_found)?;
            self.check_skip_budget(header.counter - self.recv_count)?;
            (current.clone(), self.recv_count, self.recv_generation)
        };

        while count < header.counter {
            let (next, mk) = self.kdf_ck(engine, &chain, generation, count)?;
            new_skipped.push(((generation, count), mk));
            chain = next;
            count += 1;
        }
        let (next, mk) = self.kdf_ck(engine, &chain, generation, count)?;

        Ok(ReceiveStep {
            message_key: mk,
            skipped_hit: None,
            new_skipped,
            ratchet,
            chain_key: Some(next),
            recv_count: count + 1,
            rekey_requested: header.rekey_requested,
        })
    }

    /// Apply a step whose message authenticated. Returns skipped-key
    /// evictions caused by the step.
    pub fn commit_receive(&mut self, step: ReceiveStep) -> usize {
        if let Some(slot) = step.skipped_hit {
            self.skipped.remove(&slot);
            return 0;
        }
        let mut evicted = 0;
        for (slot, key) in step.new_skipped {
            evicted += self.skipped.insert(slot, key);
        }
        if let Some((root, remote, generation)) = step.ratchet {
            self.root_key = root;
            self.remote_ratchet = remote;
            self.recv_generation = generation;
            self.send_step_pending = true;
        }
        if let Some(chain) = step.chain_key {
            self.receiving_chain = Some(chain);
        }
        self.recv_count = step.recv_count;
        if step.rekey_requested {
            self.peer_requested_step = true;
        }
        evicted
    }

    fn check_skip_budget(&self, requested: u32) -> Result<(), CryptoError> {
        if requested > self.max_skip_per_message {
            return Err(CryptoError::TooManySkippedMessages {
                requested,
                limit: self.max_skip_per_message,
            });
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn info(&self) -> RatchetInfo {
        RatchetInfo {
            send_generation: self.send_generation,
            recv_generation: self.recv_generation,
            send_count: self.send_count,
            recv_count: self.recv_count,
            previous_chain_length: self.previous_chain_length,
            skipped_keys: self.skipped.len(),
            send_step_pending: self.send_step_pending,
            step_requested: self.step_requested,
            peer_requested_step: self.peer_requested_step,
        }
    }

    /// Sanity checks over the invariants a healthy state keeps.
    pub fn is_consistent(&self) -> bool {
        let now = Utc::now();
        let keys_live = !self.root_key.is_expired_at(now)
            && !self.local_ratchet.private.is_expired_at(now)
            && self.root_key.len() == 32
            && self.remote_ratchet.len() == 32;
        let chains_ok = self.sending_chain.is_some() || self.send_step_pending;
        let counters_ok = self.sending_chain.is_some() || self.send_count == 0;
        keys_live && chains_ok && counters_ok && self.skipped.len() <= self.skipped.cap
    }

    fn local_public_b64(&self) -> Result<String, CryptoError> {
        self.local_ratchet
            .public
            .encoded_public()
            .ok_or_else(|| CryptoError::InvalidKey("ratchet public key expected".into()))
    }

    // ── KDF helpers ──────────────────────────────────────────────────────

    fn dh(
        &self,
        engine: &CryptoEngine,
        private: &CryptoKey,
        public: &CryptoKey,
    ) -> Result<CryptoKey, CryptoError> {
        engine.perform_key_exchange(private, public, Some(&self.session_id))
    }

    fn kdf_rk(
        &self,
        engine: &CryptoEngine,
        dh_output: &CryptoKey,
    ) -> Result<(CryptoKey, CryptoKey), CryptoError> {
        self.kdf_rk_from(engine, &self.root_key, dh_output)
    }

    /// KDF_RK: HKDF(salt = RK, ikm = DH output) → (RK', CK).
    fn kdf_rk_from(
        &self,
        engine: &CryptoEngine,
        root: &CryptoKey,
        dh_output: &CryptoKey,
    ) -> Result<(CryptoKey, CryptoKey), CryptoError> {
        let mut params = KeyDerivationParams::hkdf(root.key_data().to_vec(), "");
        let derived = engine
            .derive_key(dh_output, &params, ROOT_CONTEXT)
            .and_then(|rk| Ok((rk, engine.derive_key(dh_output, &params, CHAIN_CONTEXT)?)));
        params.salt.zeroize();
        let (rk, ck) = derived?;
        Ok((
            rk.with_id(format!("{}:root", self.session_id))
                .with_expiry(self.expires_at),
            ck.with_id(format!("{}:chain", self.session_id))
                .with_expiry(self.expires_at),
        ))
    }

    /// KDF_CK: chain key → (next chain key, message key).
    fn kdf_ck(
        &self,
        engine: &CryptoEngine,
        chain: &CryptoKey,
        generation: u32,
        counter: u32,
    ) -> Result<(CryptoKey, CryptoKey), CryptoError> {
        let params = KeyDerivationParams::hkdf(Vec::new(), "");
        let next = engine.derive_key(chain, &params, NEXT_CHAIN_CONTEXT)?;
        let mk = engine.derive_key(chain, &params, MESSAGE_KEY_CONTEXT)?;
        Ok((
            next.with_id(chain.id.clone()).with_expiry(self.expires_at),
            mk.with_id(message_key_id(&self.session_id, generation, counter))
                .with_expiry(self.expires_at),
        ))
    }
}

/// Message keys get the same id on both sides.
pub fn message_key_id(session_id: &str, generation: u32, counter: u32) -> String {
    format!("{session_id}:{generation}:{counter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        alice: RatchetState,
        bob: RatchetState,
    }

    fn setup(engine: &CryptoEngine, max_skipped: usize, max_per_message: u32) -> Pair {
        let config = SessionConfig {
            max_skipped_keys: max_skipped,
            max_skip_per_message: max_per_message,
            ..SessionConfig::default()
        };
        setup_with(engine, &config)
    }

    fn setup_with(engine: &CryptoEngine, config: &SessionConfig) -> Pair {
        let root_bytes = engine.random().bytes(32).unwrap();
        let root = CryptoKey::new("r", KeyAlgorithm::Secret, root_bytes, Duration::hours(1));
        let bob_spk = engine
            .generate_keypair(KeyExchangeProtocol::X25519, "bob", "d")
            .unwrap();
        let alice_ratchet = engine
            .generate_keypair(KeyExchangeProtocol::X25519, "alice", "d")
            .unwrap();
        let expires = Utc::now() + Duration::hours(1);

        let alice = RatchetState::new_initiator(
            engine,
            "sess",
            root.clone(),
            alice_ratchet.clone(),
            bob_spk.public.clone(),
            expires,
            config,
        )
        .unwrap();
        let bob = RatchetState::new_responder(
            engine,
            "sess",
            root,
            bob_spk,
            alice_ratchet.public,
            expires,
            config,
        )
        .unwrap();
        Pair { alice, bob }
    }

    fn receive(engine: &CryptoEngine, s: &mut RatchetState, h: &RatchetHeader) -> CryptoKey {
        let step = s.plan_receive(engine, h).unwrap();
        let mk = step.message_key.clone();
        s.commit_receive(step);
        mk
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);

        for _ in 0..3 {
            let (mk, h) = alice.next_sending_key(&engine).unwrap();
            assert_eq!(mk.key_data(), receive(&engine, &mut bob, &h).key_data());
        }
        for _ in 0..2 {
            let (mk, h) = bob.next_sending_key(&engine).unwrap();
            assert_eq!(h.generation, 1);
            assert_eq!(mk.key_data(), receive(&engine, &mut alice, &h).key_data());
        }
        let (mk, h) = alice.next_sending_key(&engine).unwrap();
        assert_eq!(h.generation, 2);
        assert_eq!(h.previous_chain_length, 3);
        assert_eq!(mk.id, message_key_id("sess", 2, 0));
        assert_eq!(mk.key_data(), receive(&engine, &mut bob, &h).key_data());
    }

    #[test]
    fn responder_may_send_first() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);
        let (mk, h) = bob.next_sending_key(&engine).unwrap();
        assert_eq!(mk.key_data(), receive(&engine, &mut alice, &h).key_data());
    }

    #[test]
    fn out_of_order_messages() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);

        let (mk0, h0) = alice.next_sending_key(&engine).unwrap();
        let (mk1, h1) = alice.next_sending_key(&engine).unwrap();
        let (mk2, h2) = alice.next_sending_key(&engine).unwrap();

        assert_eq!(mk2.key_data(), receive(&engine, &mut bob, &h2).key_data());
        assert_eq!(bob.info().skipped_keys, 2);
        assert_eq!(mk0.key_data(), receive(&engine, &mut bob, &h0).key_data());
        assert_eq!(mk1.key_data(), receive(&engine, &mut bob, &h1).key_data());
        assert_eq!(bob.info().skipped_keys, 0);
    }

    #[test]
    fn late_messages_from_a_closed_chain() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);

        let (_, h0) = alice.next_sending_key(&engine).unwrap();
        receive(&engine, &mut bob, &h0);
        let (mk1, h1) = alice.next_sending_key(&engine).unwrap();

        let (_, hb) = bob.next_sending_key(&engine).unwrap();
        receive(&engine, &mut alice, &hb);
        let (mk_new, h_new) = alice.next_sending_key(&engine).unwrap();

        // The new chain arrives first; message 1 of the old chain is cached.
        assert_eq!(mk_new.key_data(), receive(&engine, &mut bob, &h_new).key_data());
        assert_eq!(mk1.key_data(), receive(&engine, &mut bob, &h1).key_data());
    }

    #[test]
    fn consumed_keys_cannot_be_recomputed() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);
        let (_, h0) = alice.next_sending_key(&engine).unwrap();
        let (_, h1) = alice.next_sending_key(&engine).unwrap();
        receive(&engine, &mut bob, &h0);
        receive(&engine, &mut bob, &h1);
        assert!(matches!(
            bob.plan_receive(&engine, &h0),
            Err(CryptoError::MessageKeyNotFound { generation: 1, counter: 0 })
        ));
    }

    #[test]
    fn uncommitted_plans_leave_state_untouched() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, bob } = setup(&engine, 100, 100);
        let (_, h0) = alice.next_sending_key(&engine).unwrap();
        let (_, h1) = alice.next_sending_key(&engine).unwrap();
        let before = bob.info();
        let _ = bob.plan_receive(&engine, &h1).unwrap();
        assert_eq!(bob.info(), before);
        assert!(bob.plan_receive(&engine, &h0).is_ok());
    }

    #[test]
    fn skip_budget_per_message() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, bob } = setup(&engine, 100, 3);
        let mut last = None;
        for _ in 0..5 {
            last = Some(alice.next_sending_key(&engine).unwrap().1);
        }
        assert!(matches!(
            bob.plan_receive(&engine, &last.unwrap()),
            Err(CryptoError::TooManySkippedMessages { requested: 4, limit: 3 })
        ));
    }

    #[test]
    fn skipped_keys_evict_oldest_first() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 2, 100);
        let headers: Vec<_> = (0..4)
            .map(|_| alice.next_sending_key(&engine).unwrap().1)
            .collect();
        receive(&engine, &mut bob, &headers[3]);
        assert_eq!(bob.info().skipped_keys, 2);
        assert!(matches!(
            bob.plan_receive(&engine, &headers[0]),
            Err(CryptoError::MessageKeyNotFound { .. })
        ));
        assert!(bob.plan_receive(&engine, &headers[1]).is_ok());
        assert!(bob.plan_receive(&engine, &headers[2]).is_ok());
    }

    #[test]
    fn step_requests_wait_for_the_peer() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);
        let (_, h0) = alice.next_sending_key(&engine).unwrap();
        receive(&engine, &mut bob, &h0);

        assert!(!alice.request_step(&engine).unwrap());
        assert!(!alice.request_step(&engine).unwrap());
        let (mk, h) = alice.next_sending_key(&engine).unwrap();
        assert_eq!(h.generation, 1);
        assert!(h.rekey_requested);
        assert_eq!(mk.key_data(), receive(&engine, &mut bob, &h).key_data());
        assert!(bob.info().peer_requested_step);

        let (mk, h) = bob.next_sending_key(&engine).unwrap();
        assert!(!bob.info().peer_requested_step);
        assert_eq!(mk.key_data(), receive(&engine, &mut alice, &h).key_data());
        assert!(alice.take_requested_step(&engine).unwrap());
        let info = alice.info();
        assert_eq!(info.send_generation, 2);
        assert!(!info.step_requested);

        let (mk, h) = alice.next_sending_key(&engine).unwrap();
        assert!(!h.rekey_requested);
        assert_eq!(mk.key_data(), receive(&engine, &mut bob, &h).key_data());
    }

    #[test]
    fn step_request_runs_at_once_when_the_peer_key_is_unanswered() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);
        assert!(bob.request_step(&engine).unwrap());
        assert_eq!(bob.info().send_generation, 1);
        assert!(!bob.request_step(&engine).unwrap());

        let (mk, h) = bob.next_sending_key(&engine).unwrap();
        assert_eq!(h.generation, 1);
        assert_eq!(mk.key_data(), receive(&engine, &mut alice, &h).key_data());
    }

    #[test]
    fn step_request_with_crossing_traffic() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { mut alice, mut bob } = setup(&engine, 100, 100);
        let (_, a0) = alice.next_sending_key(&engine).unwrap();
        receive(&engine, &mut bob, &a0);
        let (mk_reply, reply) = bob.next_sending_key(&engine).unwrap();

        assert!(!alice.request_step(&engine).unwrap());
        let (mk_after, after) = alice.next_sending_key(&engine).unwrap();
        assert_eq!(mk_reply.key_data(), receive(&engine, &mut alice, &reply).key_data());
        assert!(alice.take_requested_step(&engine).unwrap());
        assert_eq!(mk_after.key_data(), receive(&engine, &mut bob, &after).key_data());

        for _ in 0..3 {
            let (mk, h) = alice.next_sending_key(&engine).unwrap();
            assert_eq!(mk.key_data(), receive(&engine, &mut bob, &h).key_data());
            let (mk, h) = bob.next_sending_key(&engine).unwrap();
            assert_eq!(mk.key_data(), receive(&engine, &mut alice, &h).key_data());
        }
    }

    #[test]
    fn rekey_policy_asks_for_a_step_after_enough_messages() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let config = SessionConfig {
            rekey_after_messages: 3,
            ..SessionConfig::default()
        };
        let Pair { mut alice, mut bob } = setup_with(&engine, &config);

        let flags: Vec<bool> = (0..4)
            .map(|_| {
                let (_, h) = alice.next_sending_key(&engine).unwrap();
                receive(&engine, &mut bob, &h);
                h.rekey_requested
            })
            .collect();
        assert_eq!(flags, vec![false, false, false, true]);
        assert!(alice.rekey_due(Utc::now()));
        assert!(bob.info().peer_requested_step);

        let (_, h) = bob.next_sending_key(&engine).unwrap();
        receive(&engine, &mut alice, &h);
        assert!(alice.take_requested_step(&engine).unwrap());
        assert!(!alice.rekey_due(Utc::now()));
    }

    #[test]
    fn rekey_policy_by_chain_age() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let Pair { alice, .. } = setup(&engine, 100, 100);
        assert!(!alice.rekey_due(Utc::now()));
        assert!(alice.rekey_due(Utc::now() + Duration::hours(25)));
    }
}
