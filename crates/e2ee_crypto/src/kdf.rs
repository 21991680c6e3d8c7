//! Key derivation functions
//!
//! `hkdf_expand`: HKDF-SHA256 extract-and-expand, used for derived keys,
//!   the X3DH root and every ratchet step.
//!
//! `argon2id`: password-style derivation with caller-chosen costs.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// 32-byte HKDF output, zeroized on drop.
pub fn hkdf32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut out = Zeroizing::new([0u8; 32]);
    let salt = (!salt.is_empty()).then_some(salt);
    hkdf_expand(ikm, salt, info, out.as_mut())?;
    Ok(out)
}

/// Argon2id with explicit costs. `memory_kib` is in KiB.
pub fn argon2id(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    memory_kib: u32,
    parallelism: u32,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let params = Params::new(memory_kib, iterations, parallelism, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, out.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_label_separated() {
        let a = hkdf32(b"ikm", b"salt", b"one").unwrap();
        let b = hkdf32(b"ikm", b"salt", b"one").unwrap();
        let c = hkdf32(b"ikm", b"salt", b"two").unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn empty_salt_matches_none() {
        let a = hkdf32(b"ikm", b"", b"x").unwrap();
        let mut b = [0u8; 32];
        hkdf_expand(b"ikm", None, b"x", &mut b).unwrap();
        assert_eq!(*a, b);
    }

    #[test]
    fn argon2id_rejects_bad_params() {
        assert!(matches!(
            argon2id(b"pw", b"saltsaltsalt", 0, 8, 1),
            Err(CryptoError::KeyDerivation(_))
        ));
        let k = argon2id(b"pw", b"saltsaltsalt", 1, 64, 1).unwrap();
        assert_eq!(k.len(), 32);
    }
}
