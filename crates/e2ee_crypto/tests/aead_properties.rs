//! Property tests over the three AEAD ciphers and the session layer.
//!
//! 1. **Round-trip**: decrypt(encrypt(m, aad), aad) == m
//! 2. **Tamper detection**: any flipped bit in ciphertext, tag or AAD fails
//! 3. **Ordering**: any delivery order of one chain decrypts every message

use std::sync::Arc;

use e2ee_crypto::{
    CipherAlgorithm, CryptoEngine, CryptoError, E2EEncryptionManager, InMemoryDirectory,
    KeyDirectory, SessionConfig,
};
use proptest::prelude::*;

fn cipher() -> impl Strategy<Value = CipherAlgorithm> {
    prop_oneof![
        Just(CipherAlgorithm::Aes256Gcm),
        Just(CipherAlgorithm::ChaCha20Poly1305),
        Just(CipherAlgorithm::XChaCha20Poly1305),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip(
        alg in cipher(),
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        aad in prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
    ) {
        let e = CryptoEngine::with_defaults().unwrap();
        let key = e.generate_symmetric_key(alg, "u", "d", None).unwrap();
        let (ct, ctx) = e.encrypt(&plaintext, &key, aad.as_deref()).unwrap();
        prop_assert_eq!(ct.len(), plaintext.len());
        prop_assert_eq!(ctx.nonce.len(), alg.nonce_len());
        prop_assert_eq!(ctx.tag.len(), CipherAlgorithm::TAG_LEN);
        let pt = e.decrypt(&ct, &key, &ctx).unwrap();
        prop_assert_eq!(pt.as_slice(), plaintext.as_slice());
    }

    #[test]
    fn prop_any_flipped_bit_is_detected(
        alg in cipher(),
        plaintext in prop::collection::vec(any::<u8>(), 1..512),
        target in 0usize..3,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let e = CryptoEngine::with_defaults().unwrap();
        let key = e.generate_symmetric_key(alg, "u", "d", None).unwrap();
        let (mut ct, mut ctx) = e.encrypt(&plaintext, &key, Some(b"header")).unwrap();
        let mask = 1u8 << bit;
        match target {
            0 => {
                let i = position.index(ct.len());
                ct[i] ^= mask;
            }
            1 => {
                let i = position.index(ctx.tag.len());
                ctx.tag[i] ^= mask;
            }
            _ => {
                let aad = ctx.associated_data.as_mut().unwrap();
                let i = position.index(aad.len());
                aad[i] ^= mask;
            }
        }
        prop_assert!(matches!(
            e.decrypt(&ct, &key, &ctx),
            Err(CryptoError::AuthenticationFailed)
        ));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_any_delivery_order_within_budget(
        order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let directory = Arc::new(InMemoryDirectory::new());
        let make = || E2EEncryptionManager::new(
            Arc::new(CryptoEngine::with_defaults().unwrap()),
            Arc::clone(&directory) as Arc<dyn KeyDirectory>,
            SessionConfig::default(),
        );
        let alice = make();
        let bob = make();
        alice.provision_user("alice", "a", 1).unwrap();
        bob.provision_user("bob", "b", 1).unwrap();
        let sid = bob.initiate_session("bob", "alice", None).unwrap();
        alice.accept_session(&sid, "alice", "bob").unwrap();

        let sent: Vec<_> = (0..12)
            .map(|i| bob.encrypt_message(&sid, format!("msg {i}").as_bytes(), None).unwrap())
            .collect();
        for i in order {
            let (ct, meta) = &sent[i];
            let pt = alice.decrypt_message(&sid, ct, meta).unwrap();
            let expected = format!("msg {i}");
            prop_assert_eq!(pt.as_slice(), expected.as_bytes());
        }
        prop_assert_eq!(alice.session_info(&sid).unwrap().ratchet.unwrap().skipped_keys, 0);
    }
}
