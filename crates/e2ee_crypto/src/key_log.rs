//! Key-change transparency log.
//!
//! Identity registrations, signed prekey rotations and session key changes
//! are appended here. Entries form a hash chain (`prev_hash` → `hash`), and
//! each hash is signed with the identity key of the user the change belongs
//! to. The log is bounded; the oldest entries drop off first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::algorithm::HashAlgorithm;
use crate::context::SignatureData;
use crate::engine::CryptoEngine;
use crate::error::CryptoError;
use crate::key::CryptoKey;

const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyChange {
    IdentityRegistered,
    SignedPrekeyRotated,
    SessionRotated,
    SessionClosed,
    SessionCompromised,
    SessionRecovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyLogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub device_id: String,
    pub change: KeyChange,
    pub session_id: Option<String>,
    pub old_key_id: Option<String>,
    pub new_key_id: Option<String>,
    pub reason: String,
    pub prev_hash: String,
    pub hash: String,
    pub signature: SignatureData,
}

/// The caller's half of an entry.
#[derive(Debug, Clone)]
pub struct KeyChangeRecord {
    pub user_id: String,
    pub device_id: String,
    pub change: KeyChange,
    pub session_id: Option<String>,
    pub old_key_id: Option<String>,
    pub new_key_id: Option<String>,
    pub reason: String,
}

/// Hashed form of an entry; field order is part of the format.
#[derive(Serialize)]
struct EntryBody<'a> {
    seq: u64,
    timestamp: &'a DateTime<Utc>,
    user_id: &'a str,
    device_id: &'a str,
    change: KeyChange,
    session_id: Option<&'a str>,
    old_key_id: Option<&'a str>,
    new_key_id: Option<&'a str>,
    reason: &'a str,
    prev_hash: &'a str,
}

impl EntryBody<'_> {
    fn hash(&self, engine: &CryptoEngine) -> Result<String, CryptoError> {
        Ok(engine.hash_hex(&serde_json::to_vec(self)?, HashAlgorithm::Sha256))
    }
}

impl KeyLogEntry {
    fn body(&self) -> EntryBody<'_> {
        EntryBody {
            seq: self.seq,
            timestamp: &self.timestamp,
            user_id: &self.user_id,
            device_id: &self.device_id,
            change: self.change,
            session_id: self.session_id.as_deref(),
            old_key_id: self.old_key_id.as_deref(),
            new_key_id: self.new_key_id.as_deref(),
            reason: &self.reason,
            prev_hash: &self.prev_hash,
        }
    }

    /// Recomputes the hash and checks the signature over it.
    pub fn verify(&self, engine: &CryptoEngine, identity_public: &CryptoKey) -> bool {
        let Ok(hash) = self.body().hash(engine) else {
            return false;
        };
        hash == self.hash && engine.verify_signature(hash.as_bytes(), &self.signature, identity_public)
    }
}

struct LogState {
    entries: VecDeque<KeyLogEntry>,
    last_seq: u64,
    last_hash: String,
}

pub struct KeyLog {
    max_entries: usize,
    inner: Mutex<LogState>,
}

impl KeyLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(LogState {
                entries: VecDeque::new(),
                last_seq: 0,
                last_hash: CHAIN_START.to_string(),
            }),
        }
    }

    /// Append `record`, signed with `signer` (an Ed25519 private key).
    pub fn append(
        &self,
        engine: &CryptoEngine,
        signer: &CryptoKey,
        record: KeyChangeRecord,
    ) -> Result<KeyLogEntry, CryptoError> {
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let timestamp = Utc::now();
        let hash = EntryBody {
            seq,
            timestamp: &timestamp,
            user_id: &record.user_id,
            device_id: &record.device_id,
            change: record.change,
            session_id: record.session_id.as_deref(),
            old_key_id: record.old_key_id.as_deref(),
            new_key_id: record.new_key_id.as_deref(),
            reason: &record.reason,
            prev_hash: &state.last_hash,
        }
        .hash(engine)?;
        let signature = engine.sign(hash.as_bytes(), signer, HashAlgorithm::Sha256)?;

        let prev_hash = std::mem::replace(&mut state.last_hash, hash.clone());
        state.last_seq = seq;
        let entry = KeyLogEntry {
            seq,
            timestamp,
            user_id: record.user_id,
            device_id: record.device_id,
            change: record.change,
            session_id: record.session_id,
            old_key_id: record.old_key_id,
            new_key_id: record.new_key_id,
            reason: record.reason,
            prev_hash,
            hash,
            signature,
        };
        state.entries.push_back(entry.clone());
        while state.entries.len() > self.max_entries {
            state.entries.pop_front();
        }
        Ok(entry)
    }

    /// Entries for `user_id`, oldest first.
    pub fn entries_for(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Vec<KeyLogEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && since.map_or(true, |t| e.timestamp >= t))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every retained entry hashes correctly and links to its predecessor.
    pub fn verify_chain(&self, engine: &CryptoEngine) -> bool {
        let state = self.inner.lock();
        let hashes_ok = state
            .entries
            .iter()
            .all(|e| e.body().hash(engine).is_ok_and(|h| h == e.hash));
        let links_ok = state
            .entries
            .iter()
            .zip(state.entries.iter().skip(1))
            .all(|(a, b)| b.prev_hash == a.hash && b.seq == a.seq + 1);
        hashes_ok && links_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::SignatureAlgorithm;

    fn record(user: &str, change: KeyChange) -> KeyChangeRecord {
        KeyChangeRecord {
            user_id: user.to_string(),
            device_id: "phone".to_string(),
            change,
            session_id: None,
            old_key_id: Some("old".to_string()),
            new_key_id: Some("new".to_string()),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn entries_chain_and_verify() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let id = engine
            .generate_signing_keypair(SignatureAlgorithm::Ed25519, "alice", "phone")
            .unwrap();
        let log = KeyLog::new(100);
        let first = log
            .append(&engine, &id.private, record("alice", KeyChange::IdentityRegistered))
            .unwrap();
        let second = log
            .append(&engine, &id.private, record("alice", KeyChange::SignedPrekeyRotated))
            .unwrap();
        assert_eq!(first.prev_hash, CHAIN_START);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.seq, 2);
        assert!(first.verify(&engine, &id.public));
        assert!(log.verify_chain(&engine));

        let mut forged = second.clone();
        forged.reason = "nothing to see".into();
        assert!(!forged.verify(&engine, &id.public));

        let other = engine
            .generate_signing_keypair(SignatureAlgorithm::Ed25519, "mallory", "laptop")
            .unwrap();
        assert!(!second.verify(&engine, &other.public));
    }

    #[test]
    fn log_is_bounded_and_filtered_by_user() {
        let engine = CryptoEngine::with_defaults().unwrap();
        let id = engine
            .generate_signing_keypair(SignatureAlgorithm::Ed25519, "alice", "phone")
            .unwrap();
        let log = KeyLog::new(3);
        for user in ["alice", "bob", "alice", "bob", "alice"] {
            log.append(&engine, &id.private, record(user, KeyChange::SessionClosed))
                .unwrap();
        }
        assert_eq!(log.len(), 3);
        let alice: Vec<u64> = log.entries_for("alice", None).iter().map(|e| e.seq).collect();
        assert_eq!(alice, vec![3, 5]);
        assert!(log.entries_for("alice", Some(Utc::now() + chrono::Duration::hours(1))).is_empty());
        assert!(log.verify_chain(&engine));
    }
}
