//! Swarm identity: a root hash for static content, a source public key for
//! live streams. The wire and URI forms are the raw bytes, hex-encoded for
//! humans.

use crate::hashtree::{Sha1Hash, HASH_SIZE};
use crate::livesig::SwarmPubKey;

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmId {
    /// Merkle root hash of a static swarm.
    File(Sha1Hash),
    /// Source public key of a live swarm.
    Live(SwarmPubKey),
}

impl SwarmId {
    pub fn is_live(&self) -> bool {
        matches!(self, SwarmId::Live(_))
    }

    pub fn root_hash(&self) -> Option<&Sha1Hash> {
        match self {
            SwarmId::File(h) => Some(h),
            SwarmId::Live(_) => None,
        }
    }

    pub fn pubkey(&self) -> Option<&SwarmPubKey> {
        match self {
            SwarmId::File(_) => None,
            SwarmId::Live(k) => Some(k),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SwarmId::File(h) => h.0.to_vec(),
            SwarmId::Live(k) => k.to_bytes(),
        }
    }

    /// A 20-byte id is a root hash; anything longer must parse as a live
    /// public key.
    pub fn from_bytes(bytes: &[u8]) -> Option<SwarmId> {
        if bytes.len() == HASH_SIZE {
            let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
            return Some(SwarmId::File(Sha1Hash(arr)));
        }
        SwarmPubKey::from_bytes(bytes).map(SwarmId::Live)
    }

    pub fn hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Option<SwarmId> {
        SwarmId::from_bytes(&hex::decode(s).ok()?)
    }

    /// Filename-safe rendition, used for content-addressed storage.
    pub fn to_filename(&self) -> String {
        self.hex()
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livesig::KeyPair;

    #[test]
    fn test_roundtrip_both_kinds() {
        let file = SwarmId::File(Sha1Hash::from_bytes_digest(b"content"));
        assert_eq!(SwarmId::from_hex(&file.hex()), Some(file.clone()));
        assert!(!file.is_live());

        let live = SwarmId::Live(KeyPair::from_seed([6; 32]).swarm_pubkey());
        assert_eq!(SwarmId::from_hex(&live.hex()), Some(live.clone()));
        assert!(live.is_live());
    }
}
