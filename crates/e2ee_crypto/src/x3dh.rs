//! X3DH-like asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator fetches the recipient's `PrekeyBundle` from the directory:
//!     IK_B  (identity, Ed25519 public → converted to X25519)
//!     SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519)
//!
//!   The initiator generates ONE ephemeral keypair EK_A (X25519).
//!
//!   DH calculations, each one `CryptoEngine::perform_key_exchange`:
//!     DH1 = DH(IK_A_x25519, SPK_B)
//!     DH2 = DH(EK_A,         IK_B_x25519)
//!     DH3 = DH(EK_A,         SPK_B)
//!     DH4 = DH(EK_A,         OPK_B)     [optional]
//!
//!   SK = derive_key(ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4],
//!                   salt = 0*32, context = "e2ee-x3dh-v1")
//!
//! The SPK signature is verified before any DH is computed. The salt is a
//! fixed constant so both sides derive the same SK.

use chrono::{DateTime, Duration, Utc};
use curve25519_dalek::edwards::CompressedEdwardsY;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, Zeroizing};

use crate::algorithm::{KeyAlgorithm, KeyExchangeProtocol};
use crate::context::{KeyDerivationParams, SignatureData};
use crate::engine::CryptoEngine;
use crate::error::CryptoError;
use crate::key::{CryptoKey, KeyPair};

const X3DH_CONTEXT: &str = "e2ee-x3dh-v1";

// ── Identity key conversion ──────────────────────────────────────────────────

/// Convert an Ed25519 identity private key (seed) to an X25519 private key.
/// This uses the clamped SHA-512 expansion that ed25519-dalek uses internally.
pub fn identity_private_to_x25519(identity: &CryptoKey) -> Result<CryptoKey, CryptoError> {
    if identity.algorithm != KeyAlgorithm::Ed25519Private {
        return Err(CryptoError::AlgorithmMismatch(format!(
            "expected an Ed25519 private identity key, got {}",
            identity.algorithm
        )));
    }
    let seed = identity.as_array32()?;
    let mut h = Sha512::digest(seed.as_slice());
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut scalar = Zeroizing::new([0u8; 32]);
    scalar.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    let secret = StaticSecret::from(*scalar);

    Ok(CryptoKey::new(
        format!("{}_x25519", identity.id),
        KeyAlgorithm::X25519Private,
        secret.to_bytes().to_vec(),
        Duration::zero(),
    )
    .with_owner(identity.user_id.clone(), identity.device_id.clone())
    .with_expiry(identity.expires_at))
}

/// Convert an Ed25519 identity public key to X25519 via the birational map.
pub fn identity_public_to_x25519(identity: &CryptoKey) -> Result<CryptoKey, CryptoError> {
    if identity.algorithm != KeyAlgorithm::Ed25519Public {
        return Err(CryptoError::AlgorithmMismatch(format!(
            "expected an Ed25519 public identity key, got {}",
            identity.algorithm
        )));
    }
    let compressed = CompressedEdwardsY::from_slice(identity.key_data())
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    Ok(CryptoKey::new(
        format!("{}_x25519", identity.id),
        KeyAlgorithm::X25519Public,
        point.to_montgomery().to_bytes().to_vec(),
        Duration::zero(),
    )
    .with_owner(identity.user_id.clone(), identity.device_id.clone())
    .with_expiry(identity.expires_at))
}

// ── Published material ───────────────────────────────────────────────────────

/// A user's public registration as stored in the key directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub user_id: String,
    pub device_id: String,
    pub identity_key_id: String,
    /// Ed25519 identity public key (base64url)
    pub identity_key: String,
    pub signed_prekey_id: String,
    /// X25519 signed prekey (base64url)
    pub signed_prekey: String,
    /// Identity signature over the raw signed-prekey bytes
    pub signed_prekey_signature: SignatureData,
    pub one_time_prekey_id: Option<String>,
    /// X25519 one-time prekey (base64url), handed out once
    pub one_time_prekey: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl PrekeyBundle {
    pub fn identity_public(&self) -> Result<CryptoKey, CryptoError> {
        CryptoKey::public_from_b64(
            self.identity_key_id.clone(),
            KeyAlgorithm::Ed25519Public,
            &self.identity_key,
            self.expires_at,
        )
        .map(|k| k.with_owner(self.user_id.clone(), self.device_id.clone()))
    }

    pub fn signed_prekey_public(&self) -> Result<CryptoKey, CryptoError> {
        CryptoKey::public_from_b64(
            self.signed_prekey_id.clone(),
            KeyAlgorithm::X25519Public,
            &self.signed_prekey,
            self.expires_at,
        )
    }

    pub fn one_time_prekey_public(&self) -> Result<Option<CryptoKey>, CryptoError> {
        match (&self.one_time_prekey_id, &self.one_time_prekey) {
            (Some(id), Some(encoded)) => Ok(Some(CryptoKey::public_from_b64(
                id.clone(),
                KeyAlgorithm::X25519Public,
                encoded,
                self.expires_at,
            )?)),
            _ => Ok(None),
        }
    }
}

/// Build and sign a bundle from the owner's private material.
pub fn build_bundle(
    engine: &CryptoEngine,
    identity: &KeyPair,
    signed_prekey: &KeyPair,
    one_time_prekey: Option<&CryptoKey>,
) -> Result<PrekeyBundle, CryptoError> {
    let signature = sign_prekey(engine, identity, &signed_prekey.public)?;
    let encode = |key: &CryptoKey| {
        key.encoded_public()
            .ok_or_else(|| CryptoError::InvalidKey(format!("{} is not a public key", key.id)))
    };
    Ok(PrekeyBundle {
        user_id: identity.public.user_id.clone(),
        device_id: identity.public.device_id.clone(),
        identity_key_id: identity.public.id.clone(),
        identity_key: encode(&identity.public)?,
        signed_prekey_id: signed_prekey.public.id.clone(),
        signed_prekey: encode(&signed_prekey.public)?,
        signed_prekey_signature: signature,
        one_time_prekey_id: one_time_prekey.map(|k| k.id.clone()),
        one_time_prekey: one_time_prekey.map(encode).transpose()?,
        expires_at: signed_prekey.public.expires_at,
    })
}

pub fn sign_prekey(
    engine: &CryptoEngine,
    identity: &KeyPair,
    prekey_public: &CryptoKey,
) -> Result<SignatureData, CryptoError> {
    engine.sign(
        prekey_public.key_data(),
        &identity.private,
        engine.config().default_hash,
    )
}

// ── Init header ──────────────────────────────────────────────────────────────

/// Sent by the initiator so the responder can derive SK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandshake {
    pub session_id: String,
    pub sender_id: String,
    pub sender_device_id: String,
    pub recipient_id: String,
    pub sender_identity_key_id: String,
    /// Initiator's Ed25519 identity public key (base64url)
    pub sender_identity_key: String,
    /// Initiator's ephemeral X25519 public key (base64url)
    pub ephemeral_key: String,
    /// Initiator's first ratchet public key (base64url)
    pub ratchet_key: String,
    pub signed_prekey_id: String,
    /// Which OPK was consumed; `None` if the pool was empty
    pub one_time_prekey_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionHandshake {
    pub fn sender_identity_public(&self) -> Result<CryptoKey, CryptoError> {
        CryptoKey::public_from_b64(
            self.sender_identity_key_id.clone(),
            KeyAlgorithm::Ed25519Public,
            &self.sender_identity_key,
            DateTime::<Utc>::MAX_UTC,
        )
        .map(|k| k.with_owner(self.sender_id.clone(), self.sender_device_id.clone()))
    }

    pub fn ratchet_public(&self) -> Result<CryptoKey, CryptoError> {
        CryptoKey::public_from_b64(
            format!("{}_ratchet", self.session_id),
            KeyAlgorithm::X25519Public,
            &self.ratchet_key,
            DateTime::<Utc>::MAX_UTC,
        )
    }

    fn ephemeral_public(&self) -> Result<CryptoKey, CryptoError> {
        CryptoKey::public_from_b64(
            format!("{}_ephemeral", self.session_id),
            KeyAlgorithm::X25519Public,
            &self.ephemeral_key,
            DateTime::<Utc>::MAX_UTC,
        )
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

pub struct Initiated {
    /// Shared root; feeds the Double Ratchet
    pub root: CryptoKey,
    pub handshake: SessionHandshake,
    /// Announced in the handshake as our first ratchet key
    pub local_ratchet: KeyPair,
    /// The responder's SPK, which is its first ratchet public key
    pub remote_ratchet_key: CryptoKey,
    pub remote_identity: CryptoKey,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Run the initiator side against a fetched bundle.
pub fn initiate(
    engine: &CryptoEngine,
    session_id: &str,
    sender_identity: &KeyPair,
    recipient_id: &str,
    bundle: &PrekeyBundle,
) -> Result<Initiated, CryptoError> {
    // ── 1. Verify SPK signature ──────────────────────────────────────────
    let ik_b = bundle.identity_public()?;
    let spk_b = bundle.signed_prekey_public()?;
    if !engine.verify_signature(spk_b.key_data(), &bundle.signed_prekey_signature, &ik_b) {
        return Err(CryptoError::SignatureVerification);
    }

    // ── 2. Convert identity keys to X25519 ───────────────────────────────
    let ik_a_x = identity_private_to_x25519(&sender_identity.private)?;
    let ik_b_x = identity_public_to_x25519(&ik_b)?;

    // ── 3. Ephemeral key ─────────────────────────────────────────────────
    let sender_id = sender_identity.private.user_id.as_str();
    let sender_device = sender_identity.private.device_id.as_str();
    let ek_a = engine.generate_keypair(KeyExchangeProtocol::X25519, sender_id, sender_device)?;
    let ratchet = engine.generate_keypair(KeyExchangeProtocol::X25519, sender_id, sender_device)?;

    // ── 4. DH calculations (single EK for all) ──────────────────────────
    let sid = Some(session_id);
    let mut dh = vec![
        engine.perform_key_exchange(&ik_a_x, &spk_b, sid)?,
        engine.perform_key_exchange(&ek_a.private, &ik_b_x, sid)?,
        engine.perform_key_exchange(&ek_a.private, &spk_b, sid)?,
    ];
    let one_time = bundle.one_time_prekey_public()?;
    if let Some(opk_b) = &one_time {
        dh.push(engine.perform_key_exchange(&ek_a.private, opk_b, sid)?);
    }

    // ── 5. Derive SK ─────────────────────────────────────────────────────
    let root = derive_root(engine, session_id, sender_id, &dh)?;

    let handshake = SessionHandshake {
        session_id: session_id.to_string(),
        sender_id: sender_id.to_string(),
        sender_device_id: sender_device.to_string(),
        recipient_id: recipient_id.to_string(),
        sender_identity_key_id: sender_identity.public.id.clone(),
        sender_identity_key: sender_identity
            .public
            .encoded_public()
            .ok_or_else(|| CryptoError::InvalidKey("identity public key expected".into()))?,
        ephemeral_key: ek_a
            .public
            .encoded_public()
            .ok_or_else(|| CryptoError::InvalidKey("ephemeral public key expected".into()))?,
        ratchet_key: ratchet
            .public
            .encoded_public()
            .ok_or_else(|| CryptoError::InvalidKey("ratchet public key expected".into()))?,
        signed_prekey_id: bundle.signed_prekey_id.clone(),
        one_time_prekey_id: one_time.map(|k| k.id),
        created_at: Utc::now(),
    };

    Ok(Initiated {
        root,
        handshake,
        local_ratchet: ratchet,
        remote_ratchet_key: spk_b,
        remote_identity: ik_b,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct SK from an init header with the recipient's private prekeys.
pub fn respond(
    engine: &CryptoEngine,
    handshake: &SessionHandshake,
    recipient_identity: &KeyPair,
    signed_prekey: &CryptoKey,
    one_time_prekey: Option<&CryptoKey>,
) -> Result<CryptoKey, CryptoError> {
    if handshake.one_time_prekey_id.is_some() != one_time_prekey.is_some() {
        return Err(CryptoError::InvalidKey(format!(
            "one-time prekey for session {} is unavailable",
            handshake.session_id
        )));
    }
    let ek_a = handshake.ephemeral_public()?;
    let ik_a_x = identity_public_to_x25519(&handshake.sender_identity_public()?)?;
    let ik_b_x = identity_private_to_x25519(&recipient_identity.private)?;

    // Mirror the initiator's order; X25519 is commutative.
    let sid = Some(handshake.session_id.as_str());
    let mut dh = vec![
        engine.perform_key_exchange(signed_prekey, &ik_a_x, sid)?,
        engine.perform_key_exchange(&ik_b_x, &ek_a, sid)?,
        engine.perform_key_exchange(signed_prekey, &ek_a, sid)?,
    ];
    if let Some(opk) = one_time_prekey {
        dh.push(engine.perform_key_exchange(opk, &ek_a, sid)?);
    }

    derive_root(
        engine,
        &handshake.session_id,
        &recipient_identity.private.user_id,
        &dh,
    )
}

fn derive_root(
    engine: &CryptoEngine,
    session_id: &str,
    owner: &str,
    dh_outputs: &[CryptoKey],
) -> Result<CryptoKey, CryptoError> {
    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    for out in dh_outputs {
        ikm.extend_from_slice(out.key_data());
    }
    let ikm_key = CryptoKey::new(
        format!("{session_id}_x3dh_ikm"),
        KeyAlgorithm::Secret,
        ikm,
        engine.config().derived_key_ttl(),
    )
    .with_owner(owner, "")
    .ephemeral();
    let root = engine.derive_key(
        &ikm_key,
        &KeyDerivationParams::hkdf(vec![0u8; 32], ""),
        X3DH_CONTEXT,
    )?;
    Ok(root.with_id(format!("{session_id}_root")))
}
