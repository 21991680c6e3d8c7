//! Safety numbers for out-of-band session verification.
//!
//! Both sides hash the X3DH root together with the two identity public
//! keys (sorted, so order does not matter) and render the result as 12
//! groups of 5 digits. The number is fixed for the lifetime of a session.

use crate::hash::blake3_tagged;

const SAFETY_DOMAIN: &str = "e2ee-crypto 2024 session safety number v1";

/// 32-byte digest both parties compute identically.
pub fn safety_material(handshake_root: &[u8], identity_a: &[u8], identity_b: &[u8]) -> [u8; 32] {
    let (first, second) = if identity_a <= identity_b {
        (identity_a, identity_b)
    } else {
        (identity_b, identity_a)
    };
    blake3_tagged(SAFETY_DOMAIN, &[handshake_root, first, second])
}

/// Numeric fingerprint: 12 groups of 5 digits (60 digits).
pub fn numeric(material: &[u8; 32]) -> String {
    let bytes = material;
    let mut groups = Vec::with_capacity(12);
    for i in 0..12 {
        // Take 2.5 bytes (20 bits) per group, mod 100000
        let offset = i * 5 / 2;
        let val = if i % 2 == 0 {
            ((bytes[offset] as u32) << 12)
                | ((bytes[offset + 1] as u32) << 4)
                | ((bytes[offset + 2] as u32) >> 4)
        } else {
            (((bytes[offset] & 0x0F) as u32) << 16)
                | ((bytes[offset + 1] as u32) << 8)
                | (bytes[offset + 2] as u32)
        };
        groups.push(format!("{:05}", val % 100_000));
    }
    groups.join(" ")
}

/// Compares every byte regardless of where the first difference is.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u64;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= u64::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_order_does_not_matter() {
        let root = [1u8; 32];
        assert_eq!(
            safety_material(&root, b"alice-key", b"bob-key"),
            safety_material(&root, b"bob-key", b"alice-key")
        );
    }

    #[test]
    fn numeric_format() {
        let n = numeric(&[0xAB; 32]);
        let groups: Vec<_> = n.split(' ').collect();
        assert_eq!(groups.len(), 12);
        assert!(groups.iter().all(|g| g.len() == 5 && g.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn different_roots_give_different_numbers() {
        let a = numeric(&safety_material(&[1u8; 32], b"x", b"y"));
        let b = numeric(&safety_material(&[2u8; 32], b"x", b"y"));
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_handles_lengths() {
        assert!(constant_time_eq(b"12345", b"12345"));
        assert!(!constant_time_eq(b"12345", b"12346"));
        assert!(!constant_time_eq(b"1234", b"12345"));
        assert!(!constant_time_eq(b"", b"\0"));
    }
}
