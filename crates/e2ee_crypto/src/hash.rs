//! Hash dispatch: SHA-256, SHA-512 and BLAKE3.

use sha2::{Digest, Sha256, Sha512};

use crate::algorithm::HashAlgorithm;

pub fn digest(data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
    }
}

pub fn digest_hex(data: &[u8], algorithm: HashAlgorithm) -> String {
    hex::encode(digest(data, algorithm))
}

/// Domain-separated BLAKE3 over several parts, each length-prefixed.
pub fn blake3_tagged(domain: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            digest_hex(b"abc", HashAlgorithm::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn output_lengths() {
        for alg in [HashAlgorithm::Sha256, HashAlgorithm::Sha512, HashAlgorithm::Blake3] {
            assert_eq!(digest(b"x", alg).len(), alg.output_len());
        }
    }

    #[test]
    fn tagged_hash_separates_boundaries() {
        let a = blake3_tagged("test", &[b"ab", b"c"]);
        let b = blake3_tagged("test", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }
}
