use std::path::Path;

use anyhow::Context;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::algorithm::{CipherAlgorithm, HashAlgorithm};

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_cipher: CipherAlgorithm,
    pub default_hash: HashAlgorithm,
    pub max_cached_keys: usize,
    pub symmetric_key_ttl_secs: u64,
    pub keypair_ttl_secs: u64,
    pub derived_key_ttl_secs: u64,
    /// How long past `expires_at` a key may still decrypt. Zero means never.
    pub decrypt_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_cipher: CipherAlgorithm::Aes256Gcm,
            default_hash: HashAlgorithm::Sha256,
            max_cached_keys: 1000,
            symmetric_key_ttl_secs: 30 * DAY_SECS,
            keypair_ttl_secs: 30 * DAY_SECS,
            derived_key_ttl_secs: DAY_SECS,
            decrypt_grace_secs: 0,
        }
    }
}

impl EngineConfig {
    pub fn symmetric_key_ttl(&self) -> Duration {
        secs(self.symmetric_key_ttl_secs)
    }

    pub fn keypair_ttl(&self) -> Duration {
        secs(self.keypair_ttl_secs)
    }

    pub fn derived_key_ttl(&self) -> Duration {
        secs(self.derived_key_ttl_secs)
    }

    pub fn decrypt_grace(&self) -> Duration {
        secs(self.decrypt_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cap on cached out-of-order message keys per session.
    pub max_skipped_keys: usize,
    /// Cap on keys one incoming header may force us to derive.
    pub max_skip_per_message: u32,
    pub session_ttl_secs: u64,
    /// Warn once a user's one-time prekey pool drops below this.
    pub one_time_prekey_low_water: usize,
    pub rotation_batch_size: usize,
    pub sweep_chunk_size: usize,
    pub sweep_interval_secs: u64,
    /// Ask for a DH step once a sending chain has carried this many
    /// messages. Zero disables.
    pub rekey_after_messages: u32,
    /// Same, by sending chain age. Zero disables.
    pub rekey_after_secs: u64,
    /// Entries kept in the key-change log before the oldest is dropped.
    pub max_key_log_entries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: 1000,
            max_skip_per_message: 1000,
            session_ttl_secs: 30 * DAY_SECS,
            one_time_prekey_low_water: 10,
            rotation_batch_size: 20,
            sweep_chunk_size: 64,
            sweep_interval_secs: 300,
            rekey_after_messages: 1000,
            rekey_after_secs: DAY_SECS,
            max_key_log_entries: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        secs(self.session_ttl_secs)
    }

    pub fn rekey_after(&self) -> Option<Duration> {
        (self.rekey_after_secs > 0).then(|| secs(self.rekey_after_secs))
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

impl CryptoConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid crypto config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading crypto config {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.engine.default_cipher.is_secure() {
            anyhow::bail!(
                "default cipher {} is refused by policy",
                self.engine.default_cipher
            );
        }
        if self.engine.max_cached_keys == 0 {
            anyhow::bail!("max_cached_keys must be at least 1");
        }
        if self.session.sweep_chunk_size == 0 {
            anyhow::bail!("sweep_chunk_size must be at least 1");
        }
        Ok(())
    }
}

fn secs(s: u64) -> Duration {
    // chrono panics above i64::MAX milliseconds
    Duration::seconds(s.min((i64::MAX / 1000) as u64) as i64)
}
