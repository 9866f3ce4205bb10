//! Keypairs and signatures for live swarms.
//!
//! A live swarm is identified by its source's public key; the source signs
//! every munro it publishes, binding `(bin, hash, timestamp)` together. The
//! signature algorithm is negotiated with DNSSEC algorithm numbers; this
//! implementation signs with Ed25519 and refuses the RSA/ECDSA codes.

use crate::bin::Bin;
use crate::hashtree::Sha1Hash;
use crate::time::Tint;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// DNSSEC-style signature algorithm identifiers carried in the
/// LIVE_SIG_ALG protocol option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LiveSigAlg {
    RsaSha1 = 5,
    EcdsaP256Sha256 = 13,
    EcdsaP384Sha384 = 14,
    Ed25519 = 15,
}

impl LiveSigAlg {
    pub fn from_u8(v: u8) -> Option<LiveSigAlg> {
        match v {
            5 => Some(LiveSigAlg::RsaSha1),
            13 => Some(LiveSigAlg::EcdsaP256Sha256),
            14 => Some(LiveSigAlg::EcdsaP384Sha384),
            15 => Some(LiveSigAlg::Ed25519),
            _ => None,
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, LiveSigAlg::Ed25519)
    }

    /// Wire size of a detached signature under this algorithm.
    pub fn sig_size(self) -> usize {
        match self {
            LiveSigAlg::Ed25519 => ED25519_SIG_SIZE,
            _ => 0,
        }
    }
}

pub const DEFAULT_LIVE_SIG_ALG: LiveSigAlg = LiveSigAlg::Ed25519;

pub const ED25519_SIG_SIZE: usize = 64;
pub const ED25519_PUBKEY_SIZE: usize = 32;

/// Signature length used when content integrity protection is `None`:
/// a fixed-size dummy filler so the message layout stays regular.
pub const CIPM_NONE_SIG_SIZE: usize = 20;

/// Detached signature bytes as they travel in SIGNED_INTEGRITY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSignature(pub Vec<u8>);

impl LiveSignature {
    pub fn dummy() -> LiveSignature {
        LiveSignature(vec![0u8; CIPM_NONE_SIG_SIZE])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The message a munro signature covers: big-endian bin, node hash,
/// big-endian source timestamp.
pub fn munro_sign_message(bin: Bin, hash: &Sha1Hash, timestamp: Tint) -> Vec<u8> {
    let mut msg = Vec::with_capacity(8 + 20 + 8);
    msg.extend_from_slice(&bin.to_u64().to_be_bytes());
    msg.extend_from_slice(&hash.0);
    msg.extend_from_slice(&(timestamp as u64).to_be_bytes());
    msg
}

/// Public half of a live swarm identity: the swarm ID of a live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmPubKey {
    alg: LiveSigAlg,
    key: [u8; ED25519_PUBKEY_SIZE],
}

impl SwarmPubKey {
    pub fn new(alg: LiveSigAlg, key: [u8; ED25519_PUBKEY_SIZE]) -> SwarmPubKey {
        SwarmPubKey { alg, key }
    }

    /// Wire form: one algorithm byte followed by the key bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(1 + ED25519_PUBKEY_SIZE);
        v.push(self.alg as u8);
        v.extend_from_slice(&self.key);
        v
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<SwarmPubKey> {
        let (&alg, key) = bytes.split_first()?;
        let alg = LiveSigAlg::from_u8(alg)?;
        let key: [u8; ED25519_PUBKEY_SIZE] = key.try_into().ok()?;
        Some(SwarmPubKey { alg, key })
    }

    pub fn alg(&self) -> LiveSigAlg {
        self.alg
    }

    pub fn hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Option<SwarmPubKey> {
        Self::from_bytes(&hex::decode(s).ok()?)
    }

    /// Check a munro signature from this swarm's source.
    pub fn verify(&self, bin: Bin, hash: &Sha1Hash, timestamp: Tint, sig: &LiveSignature) -> bool {
        if self.alg != LiveSigAlg::Ed25519 {
            return false;
        }
        let Ok(vk) = VerifyingKey::from_bytes(&self.key) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; ED25519_SIG_SIZE]>::try_from(sig.0.as_slice()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&sig_arr);
        vk.verify(&munro_sign_message(bin, hash, timestamp), &signature)
            .is_ok()
    }
}

/// Source-side signing identity of a live swarm.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> KeyPair {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        KeyPair {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> KeyPair {
        KeyPair {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn swarm_pubkey(&self) -> SwarmPubKey {
        SwarmPubKey {
            alg: LiveSigAlg::Ed25519,
            key: self.signing.verifying_key().to_bytes(),
        }
    }

    pub fn sign_munro(&self, bin: Bin, hash: &Sha1Hash, timestamp: Tint) -> LiveSignature {
        let sig = self.signing.sign(&munro_sign_message(bin, hash, timestamp));
        LiveSignature(sig.to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::from_seed([7u8; 32]);
        let spk = kp.swarm_pubkey();
        let hash = Sha1Hash::from_content(b"chunk");
        let bin = Bin::new(5, 3);
        let sig = kp.sign_munro(bin, &hash, 123_456);
        assert!(spk.verify(bin, &hash, 123_456, &sig));
        // Any field change must break the signature.
        assert!(!spk.verify(Bin::new(5, 4), &hash, 123_456, &sig));
        assert!(!spk.verify(bin, &hash, 123_457, &sig));
        assert!(!spk.verify(bin, &Sha1Hash::from_content(b"x"), 123_456, &sig));
    }

    #[test]
    fn test_pubkey_wire_roundtrip() {
        let kp = KeyPair::from_seed([9u8; 32]);
        let spk = kp.swarm_pubkey();
        let restored = SwarmPubKey::from_bytes(&spk.to_bytes()).unwrap();
        assert_eq!(spk, restored);
        assert_eq!(restored.alg(), LiveSigAlg::Ed25519);
    }
}
