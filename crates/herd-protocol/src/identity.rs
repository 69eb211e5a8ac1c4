/// Per-post signing identities.
///
/// Every post is signed with a freshly generated Ed25519 key that is never
/// reused, so posts cannot be linked to each other or to an author. The
/// post id is the fingerprint of that key.
///
/// Keys and signatures travel as ASCII armor: a BEGIN line, one line of
/// standard padded base64, and an END line. Parsing is strict so that any
/// altered byte is rejected rather than normalized away.
use data_encoding::BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::error::PostError;

const PUBLIC_KEY_LABEL: &str = "HERD PUBLIC KEY";
const PRIVATE_KEY_LABEL: &str = "HERD PRIVATE KEY";
const SIGNATURE_LABEL: &str = "HERD SIGNATURE";

/// Domain separation prefix for key fingerprints.
const FINGERPRINT_DOMAIN: &[u8] = b"herd-post-key-fingerprint-v1";

/// Fingerprint length in bytes (40 hex characters).
const FINGERPRINT_LEN: usize = 20;

/// Source of fresh signing identities.
///
/// Production uses OS randomness; tests substitute a seeded generator.
pub trait KeyGenerator: Send {
    fn generate(&mut self) -> SigningKey;
}

/// Generates keys from the thread-local CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyGenerator;

impl KeyGenerator for OsKeyGenerator {
    fn generate(&mut self) -> SigningKey {
        let seed: [u8; 32] = rand::random();
        SigningKey::from_bytes(&seed)
    }
}

/// Deterministic key source for tests and simulations.
#[derive(Debug)]
pub struct SeededKeyGenerator {
    rng: rand::rngs::StdRng,
}

impl SeededKeyGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }
}

impl KeyGenerator for SeededKeyGenerator {
    fn generate(&mut self) -> SigningKey {
        let mut seed = [0u8; 32];
        self.rng.fill_bytes(&mut seed);
        SigningKey::from_bytes(&seed)
    }
}

/// Deterministic digest of a public key, used as the post id.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..FINGERPRINT_LEN])
}

/// Sign `message` with a detached Ed25519 signature, armored.
pub fn sign(key: &SigningKey, message: &[u8]) -> String {
    armor_signature(&key.sign(message))
}

/// Verify an armored detached signature over `message`.
///
/// Uses strict verification (rejects non-canonical signatures).
pub fn verify(key: &VerifyingKey, message: &[u8], armored_signature: &str) -> Result<(), PostError> {
    let signature = read_signature(armored_signature)?;
    key.verify_strict(message, &signature)
        .map_err(|_| PostError::InvalidSignature)
}

pub fn armor_public_key(key: &VerifyingKey) -> String {
    armor(PUBLIC_KEY_LABEL, key.as_bytes())
}

pub fn armor_private_key(key: &SigningKey) -> String {
    armor(PRIVATE_KEY_LABEL, &key.to_bytes())
}

pub fn armor_signature(signature: &Signature) -> String {
    armor(SIGNATURE_LABEL, &signature.to_bytes())
}

/// Parse an armored public key.
pub fn read_public_key(armored: &str) -> Result<VerifyingKey, PostError> {
    let bytes = dearmor(PUBLIC_KEY_LABEL, armored).ok_or_else(|| PostError::InvalidPublicKey {
        reason: "not an armored public key".into(),
    })?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PostError::InvalidPublicKey {
            reason: "public key must be 32 bytes".into(),
        })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| PostError::InvalidPublicKey {
        reason: e.to_string(),
    })
}

/// Parse an armored private key.
pub fn read_private_key(armored: &str) -> Option<SigningKey> {
    let bytes: [u8; 32] = dearmor(PRIVATE_KEY_LABEL, armored)?.try_into().ok()?;
    Some(SigningKey::from_bytes(&bytes))
}

/// Parse an armored signature.
pub fn read_signature(armored: &str) -> Result<Signature, PostError> {
    let bytes: [u8; 64] = dearmor(SIGNATURE_LABEL, armored)
        .ok_or(PostError::InvalidSignature)?
        .try_into()
        .map_err(|_| PostError::InvalidSignature)?;
    Ok(Signature::from_bytes(&bytes))
}

fn armor(label: &str, bytes: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----",
        BASE64.encode(bytes)
    )
}

fn dearmor(label: &str, armored: &str) -> Option<Vec<u8>> {
    let body = armored
        .strip_prefix(&format!("-----BEGIN {label}-----\n"))?
        .strip_suffix(&format!("\n-----END {label}-----"))?;
    BASE64.decode(body.as_bytes()).ok()
}
