//! Authenticated Encryption with Associated Data
//!
//! AES-256-GCM, ChaCha20-Poly1305 and XChaCha20-Poly1305 behind one
//! dispatch. Key size: 32 bytes. Tag: 16 bytes, detached from the
//! ciphertext so it can travel in the `EncryptionContext`.
//!
//! Every failure while opening (bad nonce length, bad tag length, tag
//! mismatch) returns the same `AuthenticationFailed` from the same place.

use aes_gcm::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use zeroize::{Zeroize, Zeroizing};

use crate::algorithm::CipherAlgorithm;
use crate::error::CryptoError;

/// Encrypt `plaintext`; returns `(ciphertext, tag)`.
pub fn seal(
    cipher: CipherAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    if key.len() != cipher.key_len() {
        return Err(CryptoError::InvalidKeySize {
            expected: cipher.key_len(),
            actual: key.len(),
        });
    }
    if nonce.len() != cipher.nonce_len() {
        return Err(CryptoError::InvalidKey(format!(
            "{cipher} needs a {}-byte nonce",
            cipher.nonce_len()
        )));
    }
    match cipher {
        CipherAlgorithm::Aes256Gcm => seal_with::<Aes256Gcm>(key, nonce, aad, plaintext),
        CipherAlgorithm::ChaCha20Poly1305 => {
            seal_with::<ChaCha20Poly1305>(key, nonce, aad, plaintext)
        }
        CipherAlgorithm::XChaCha20Poly1305 => {
            seal_with::<XChaCha20Poly1305>(key, nonce, aad, plaintext)
        }
        CipherAlgorithm::Aes256Cbc => Err(CryptoError::UnsupportedAlgorithm(cipher.to_string())),
    }
}

/// Decrypt and verify. The plaintext is zeroized when dropped.
pub fn open(
    cipher: CipherAlgorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if key.len() != cipher.key_len() {
        return Err(CryptoError::InvalidKeySize {
            expected: cipher.key_len(),
            actual: key.len(),
        });
    }
    if nonce.len() != cipher.nonce_len() || tag.len() != CipherAlgorithm::TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }
    match cipher {
        CipherAlgorithm::Aes256Gcm => open_with::<Aes256Gcm>(key, nonce, aad, ciphertext, tag),
        CipherAlgorithm::ChaCha20Poly1305 => {
            open_with::<ChaCha20Poly1305>(key, nonce, aad, ciphertext, tag)
        }
        CipherAlgorithm::XChaCha20Poly1305 => {
            open_with::<XChaCha20Poly1305>(key, nonce, aad, ciphertext, tag)
        }
        CipherAlgorithm::Aes256Cbc => Err(CryptoError::AuthenticationFailed),
    }
}

fn seal_with<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize {
        expected: CipherAlgorithm::KEY_LEN,
        actual: key.len(),
    })?;
    let mut buffer = plaintext.to_vec();
    match cipher.encrypt_in_place_detached(Nonce::<C>::from_slice(nonce), aad, &mut buffer) {
        Ok(tag) => Ok((buffer, tag.to_vec())),
        Err(_) => {
            buffer.zeroize();
            Err(CryptoError::InvalidKey("AEAD encryption failed".into()))
        }
    }
}

fn open_with<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::AuthenticationFailed)?;
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::<C>::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::<C>::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(buffer)
}
