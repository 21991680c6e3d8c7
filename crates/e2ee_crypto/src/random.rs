//! Cryptographically secure randomness.
//!
//! Every byte handed out is OS CSPRNG output XORed with a secondary ChaCha
//! stream. The secondary stream only exists so callers can mix in extra
//! entropy; since OS output is always present, seeding it can never be
//! the sole source.

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::CryptoError;

pub struct SecureRandom {
    mixer: Mutex<StdRng>,
}

impl SecureRandom {
    pub fn new() -> Result<Self, CryptoError> {
        let mixer = StdRng::from_rng(OsRng)
            .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
        Ok(Self {
            mixer: Mutex::new(mixer),
        })
    }

    /// Fill `buf` with random bytes.
    pub fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        let mut mixer = self.mixer.lock();
        OsRng.try_fill_bytes(buf).map_err(|e| {
            tracing::error!(error = %e, "OS entropy source failed");
            CryptoError::EntropyUnavailable(e.to_string())
        })?;
        let mut mask = vec![0u8; buf.len()];
        mixer.fill_bytes(&mut mask);
        for (b, m) in buf.iter_mut().zip(mask.iter()) {
            *b ^= m;
        }
        mask.zeroize();
        Ok(())
    }

    pub fn bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; n];
        self.fill(&mut out)?;
        Ok(out)
    }

    /// `n` random bytes, hex-encoded (2n characters).
    pub fn hex(&self, n: usize) -> Result<String, CryptoError> {
        Ok(hex::encode(self.bytes(n)?))
    }

    /// `n` random bytes, standard base64.
    pub fn base64(&self, n: usize) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.bytes(n)?))
    }

    pub fn uint64(&self) -> Result<u64, CryptoError> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Fixed-size array variant used for keys and nonces.
    pub fn array<const N: usize>(&self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        self.fill(&mut out)?;
        Ok(out)
    }

    /// Mix caller-supplied entropy into the secondary stream.
    ///
    /// The new seed is SHA-256(previous stream output || entropy), so the
    /// stream keeps everything it had before and gains `entropy` on top.
    pub fn seed_additional_entropy(&self, entropy: &[u8]) {
        let mut mixer = self.mixer.lock();
        let mut current = [0u8; 32];
        mixer.fill_bytes(&mut current);

        let mut hasher = Sha256::new();
        hasher.update(b"e2ee-random-reseed-v1");
        hasher.update(current);
        hasher.update(entropy);
        let mut seed: [u8; 32] = hasher.finalize().into();

        *mixer = StdRng::from_seed(seed);
        seed.zeroize();
        current.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn output_lengths() {
        let rng = SecureRandom::new().unwrap();
        assert_eq!(rng.bytes(0).unwrap().len(), 0);
        assert_eq!(rng.bytes(48).unwrap().len(), 48);
        assert_eq!(rng.hex(16).unwrap().len(), 32);
        assert_eq!(STANDARD.decode(rng.base64(20).unwrap()).unwrap().len(), 20);
    }

    #[test]
    fn outputs_do_not_repeat() {
        let rng = SecureRandom::new().unwrap();
        let seen: HashSet<u64> = (0..1000).map(|_| rng.uint64().unwrap()).collect();
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn low_entropy_seed_does_not_make_output_predictable() {
        let a = SecureRandom::new().unwrap();
        let b = SecureRandom::new().unwrap();
        a.seed_additional_entropy(&[0u8; 32]);
        b.seed_additional_entropy(&[0u8; 32]);
        assert_ne!(a.bytes(32).unwrap(), b.bytes(32).unwrap());
    }

    #[test]
    fn concurrent_callers() {
        let rng = Arc::new(SecureRandom::new().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rng = Arc::clone(&rng);
                std::thread::spawn(move || {
                    (0..100).map(|_| rng.hex(16).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 800);
    }
}
