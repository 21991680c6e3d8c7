//! Where public prekey material and pending handshakes live between the
//! two parties. Persistence and transport sit behind `KeyDirectory`;
//! `InMemoryDirectory` serves tests and single-process setups.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::x3dh::{PrekeyBundle, SessionHandshake};

/// Public half of a one-time prekey as uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekey {
    pub id: String,
    /// X25519 public key (base64url)
    pub public_key: String,
}

pub trait KeyDirectory: Send + Sync {
    /// Replace the user's signed bundle and append `one_time_prekeys` to
    /// their pool. One-time fields on `bundle` itself are ignored.
    fn publish_bundle(
        &self,
        bundle: PrekeyBundle,
        one_time_prekeys: Vec<OneTimePrekey>,
    ) -> Result<(), CryptoError>;

    /// The user's bundle with at most one one-time prekey, which is removed
    /// from the pool.
    fn fetch_bundle(&self, user_id: &str) -> Result<PrekeyBundle, CryptoError>;

    fn remaining_one_time_prekeys(&self, user_id: &str) -> usize;

    fn post_handshake(&self, handshake: SessionHandshake) -> Result<(), CryptoError>;

    /// Remove and return the handshake for `session_id`.
    fn take_handshake(&self, session_id: &str) -> Result<SessionHandshake, CryptoError>;
}

struct DirectoryEntry {
    bundle: PrekeyBundle,
    one_time: VecDeque<OneTimePrekey>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: Mutex<HashMap<String, DirectoryEntry>>,
    handshakes: Mutex<HashMap<String, SessionHandshake>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_handshakes(&self) -> usize {
        self.handshakes.lock().len()
    }
}

impl KeyDirectory for InMemoryDirectory {
    fn publish_bundle(
        &self,
        mut bundle: PrekeyBundle,
        one_time_prekeys: Vec<OneTimePrekey>,
    ) -> Result<(), CryptoError> {
        bundle.one_time_prekey_id = None;
        bundle.one_time_prekey = None;
        let mut users = self.users.lock();
        match users.get_mut(&bundle.user_id) {
            Some(entry) => {
                entry.bundle = bundle;
                entry.one_time.extend(one_time_prekeys);
            }
            None => {
                users.insert(
                    bundle.user_id.clone(),
                    DirectoryEntry {
                        bundle,
                        one_time: one_time_prekeys.into(),
                    },
                );
            }
        }
        Ok(())
    }

    fn fetch_bundle(&self, user_id: &str) -> Result<PrekeyBundle, CryptoError> {
        let mut users = self.users.lock();
        let entry = users
            .get_mut(user_id)
            .ok_or_else(|| CryptoError::UnknownUser(user_id.to_string()))?;
        let mut bundle = entry.bundle.clone();
        if let Some(opk) = entry.one_time.pop_front() {
            bundle.one_time_prekey_id = Some(opk.id);
            bundle.one_time_prekey = Some(opk.public_key);
        }
        Ok(bundle)
    }

    fn remaining_one_time_prekeys(&self, user_id: &str) -> usize {
        self.users
            .lock()
            .get(user_id)
            .map(|e| e.one_time.len())
            .unwrap_or(0)
    }

    fn post_handshake(&self, handshake: SessionHandshake) -> Result<(), CryptoError> {
        self.handshakes
            .lock()
            .insert(handshake.session_id.clone(), handshake);
        Ok(())
    }

    fn take_handshake(&self, session_id: &str) -> Result<SessionHandshake, CryptoError> {
        self.handshakes
            .lock()
            .remove(session_id)
            .ok_or_else(|| CryptoError::HandshakeNotFound(session_id.to_string()))
    }
}
