//! Live Merkle hash tree: grows leaf by leaf, trust enters through munros.
//!
//! Unlike the static tree this one is a real node structure (arena indices
//! for parent/left/right) because arbitrary left parts get pruned once the
//! live discard window moves on. Every `chunks_per_sign` appended chunks
//! the source signs the root of the just-completed epoch subtree — the
//! *munro* — and peers verify chunks against the munro covering them.
//!
//! ```text
//! State machine:
//!
//!   source:  SIGN_EMPTY ──first add_data──► SIGN_DATA ──(stays)
//!   client:  VER_AWAIT_MUNRO ──first verified munro──► VER_AWAIT_DATA
//! ```

use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::error::SwiftError;
use crate::hashtree::Sha1Hash;
use crate::livesig::{KeyPair, LiveSignature, SwarmPubKey};
use crate::storage::Storage;
use crate::time::{Tint, TINT_SEC};

use std::fs;
use std::io::Write as _;
use std::path::Path;
use tracing::debug;

/// Default number of chunks per signed munro. Must be a power of two.
pub const DEFAULT_CHUNKS_PER_SIGN: u32 = 32;

/// How far a munro timestamp may diverge from local time (seconds).
pub const MAX_SOURCE_DIVERGENCE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTreeState {
    /// Source with no chunks yet.
    SignEmpty,
    /// Source with chunks, epoch counter running.
    SignData,
    /// Client awaiting its first verified munro.
    VerAwaitMunro,
    /// Client with at least one verified munro.
    VerAwaitData,
}

/// A munro with everything needed to relay it.
#[derive(Debug, Clone)]
pub struct SignedMunro {
    pub bin: Bin,
    pub hash: Sha1Hash,
    pub timestamp: Tint,
    pub signature: LiveSignature,
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<u32>,
    left: Option<u32>,
    right: Option<u32>,
    bin: Bin,
    hash: Sha1Hash,
    /// Hash checked against a munro (client) or computed from data (source).
    verified: bool,
}

pub struct LiveHashTree {
    state: LiveTreeState,
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    root: Option<u32>,
    chunk_size: u32,
    chunks_per_sign: u32,
    /// Source: next chunk id to append.
    next_chunk: u64,
    keypair: Option<KeyPair>,
    pubkey: SwarmPubKey,
    /// Recent signed (source) / verified (client) munros, oldest first.
    munros: Vec<SignedMunro>,
    /// Chunks whose bytes verified against a munro and were stored.
    ack_out: Binmap,
    /// Source: chunks covered by signed munros; the only ones it may
    /// announce, or peers would request unverifiable data.
    signed_ack_out: Binmap,
    completec: u64,
}

impl LiveHashTree {
    /// Source side.
    pub fn new_source(keypair: KeyPair, chunk_size: u32, chunks_per_sign: u32) -> LiveHashTree {
        debug_assert!(chunks_per_sign.is_power_of_two());
        let pubkey = keypair.swarm_pubkey();
        LiveHashTree {
            state: LiveTreeState::SignEmpty,
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            chunk_size,
            chunks_per_sign,
            next_chunk: 0,
            keypair: Some(keypair),
            pubkey,
            munros: Vec::new(),
            ack_out: Binmap::new(),
            signed_ack_out: Binmap::new(),
            completec: 0,
        }
    }

    /// Client side: trust rooted in the swarm public key.
    pub fn new_client(pubkey: SwarmPubKey, chunk_size: u32, chunks_per_sign: u32) -> LiveHashTree {
        LiveHashTree {
            state: LiveTreeState::VerAwaitMunro,
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            chunk_size,
            chunks_per_sign,
            next_chunk: 0,
            keypair: None,
            pubkey,
            munros: Vec::new(),
            ack_out: Binmap::new(),
            signed_ack_out: Binmap::new(),
            completec: 0,
        }
    }

    pub fn state(&self) -> LiveTreeState {
        self.state
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunks_per_sign(&self) -> u32 {
        self.chunks_per_sign
    }

    pub fn pubkey(&self) -> &SwarmPubKey {
        &self.pubkey
    }

    pub fn is_source(&self) -> bool {
        self.keypair.is_some()
    }

    pub fn ack_out(&self) -> &Binmap {
        &self.ack_out
    }

    pub fn ack_out_mut(&mut self) -> &mut Binmap {
        &mut self.ack_out
    }

    /// Source view restricted to signed epochs.
    pub fn signed_ack_out(&self) -> &Binmap {
        &self.signed_ack_out
    }

    pub fn chunks_complete(&self) -> u64 {
        self.completec
    }

    /// Source: bin of the most recently generated chunk.
    pub fn source_pos(&self) -> Bin {
        if self.next_chunk == 0 {
            Bin::NONE
        } else {
            Bin::chunk(self.next_chunk - 1)
        }
    }

    /*
     * Node arena
     */

    fn node(&self, id: u32) -> &Node {
        self.nodes[id as usize].as_ref().expect("live node")
    }

    fn node_mut(&mut self, id: u32) -> &mut Node {
        self.nodes[id as usize].as_mut().expect("live node")
    }

    fn new_node(&mut self, bin: Bin, hash: Sha1Hash, verified: bool) -> u32 {
        let node = Node {
            parent: None,
            left: None,
            right: None,
            bin,
            hash,
            verified,
        };
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as u32
        }
    }

    fn root_bin(&self) -> Bin {
        self.root.map(|r| self.node(r).bin).unwrap_or(Bin::NONE)
    }

    fn find_node(&self, bin: Bin) -> Option<u32> {
        let mut cur = self.root?;
        if !self.node(cur).bin.contains(bin) {
            return None;
        }
        loop {
            let n = self.node(cur);
            if n.bin == bin {
                return Some(cur);
            }
            cur = if bin < n.bin { n.left? } else { n.right? };
        }
    }

    /// Find or create the node for `bin`, lifting the root and growing the
    /// path as needed. New interior nodes are unverified placeholders.
    fn make_node(&mut self, bin: Bin) -> u32 {
        match self.root {
            None => {
                let id = self.new_node(bin, Sha1Hash::ZERO, false);
                self.root = Some(id);
                return id;
            }
            Some(mut root_id) => {
                while !self.node(root_id).bin.contains(bin) {
                    let root_bin = self.node(root_id).bin;
                    let up = self.new_node(root_bin.parent(), Sha1Hash::ZERO, false);
                    if root_bin.is_left() {
                        self.node_mut(up).left = Some(root_id);
                    } else {
                        self.node_mut(up).right = Some(root_id);
                    }
                    self.node_mut(root_id).parent = Some(up);
                    self.root = Some(up);
                    root_id = up;
                }
                let mut cur = root_id;
                loop {
                    let cur_bin = self.node(cur).bin;
                    if cur_bin == bin {
                        return cur;
                    }
                    let go_left = bin < cur_bin;
                    let next = if go_left {
                        self.node(cur).left
                    } else {
                        self.node(cur).right
                    };
                    match next {
                        Some(id) => cur = id,
                        None => {
                            let child_bin = if go_left { cur_bin.left() } else { cur_bin.right() };
                            let id = self.new_node(child_bin, Sha1Hash::ZERO, false);
                            self.node_mut(id).parent = Some(cur);
                            if go_left {
                                self.node_mut(cur).left = Some(id);
                            } else {
                                self.node_mut(cur).right = Some(id);
                            }
                            cur = id;
                        }
                    }
                }
            }
        }
    }

    /*
     * Munro bookkeeping
     */

    /// The munro layer: log2(chunks_per_sign).
    fn munro_layer(&self) -> u32 {
        self.chunks_per_sign.trailing_zeros()
    }

    /// Munro bin covering `pos`; every chunk belongs to exactly one epoch.
    pub fn munro_for(&self, pos: Bin) -> Bin {
        let layer = self.munro_layer();
        Bin::new(layer, pos.base_offset() >> layer)
    }

    /// Most recent munro, `NONE` before the first epoch closes.
    pub fn last_munro(&self) -> Bin {
        self.munros.last().map(|m| m.bin).unwrap_or(Bin::NONE)
    }

    pub fn signed_munro(&self, bin: Bin) -> Option<&SignedMunro> {
        self.munros.iter().find(|m| m.bin == bin)
    }

    /// Whether `bin` lies under a verified/signed munro.
    pub fn is_munro_covered(&self, bin: Bin) -> bool {
        self.munros.iter().any(|m| m.bin.contains(bin))
    }

    /*
     * Source path
     */

    /// Append one chunk; closes an epoch with a fresh signed munro every
    /// `chunks_per_sign` additions.
    pub fn add_data(&mut self, data: &[u8], now: Tint) -> (Bin, Option<SignedMunro>) {
        debug_assert!(self.is_source());
        let pos = Bin::chunk(self.next_chunk);
        self.next_chunk += 1;
        self.state = LiveTreeState::SignData;

        let leaf = self.make_node(pos);
        let hash = Sha1Hash::from_content(data);
        {
            let n = self.node_mut(leaf);
            n.hash = hash;
            n.verified = true;
        }
        self.ack_out.set(pos);
        self.completec += 1;

        // Recompute the right spine: every parent this leaf completes.
        let mut cur = leaf;
        while self.node(cur).bin.is_right() {
            let parent = match self.node(cur).parent {
                Some(p) => p,
                None => break,
            };
            let (l, r) = (self.node(parent).left, self.node(parent).right);
            if let (Some(l), Some(r)) = (l, r) {
                let h = Sha1Hash::from_pair(&self.node(l).hash, &self.node(r).hash);
                let n = self.node_mut(parent);
                n.hash = h;
                n.verified = true;
            }
            cur = parent;
        }

        if self.next_chunk % self.chunks_per_sign as u64 == 0 {
            let munro_bin = self.munro_for(pos);
            let munro_id = self
                .find_node(munro_bin)
                .expect("epoch root exists after its last chunk");
            let hash = self.node(munro_id).hash;
            let keypair = self.keypair.as_ref().expect("source keypair");
            let signature = keypair.sign_munro(munro_bin, &hash, now);
            let munro = SignedMunro {
                bin: munro_bin,
                hash,
                timestamp: now,
                signature,
            };
            debug!(munro = %munro_bin, "live: signed epoch munro");
            self.munros.push(munro.clone());
            self.signed_ack_out.set(munro_bin);
            return (pos, Some(munro));
        }
        (pos, None)
    }

    /*
     * Client path
     */

    /// Accept a signed munro; the munro's hash must have arrived in a
    /// preceding INTEGRITY message (`offer_hash`). `Ok(true)` when new and
    /// verified.
    pub fn offer_signed_munro(
        &mut self,
        bin: Bin,
        timestamp: Tint,
        signature: LiveSignature,
        now: Tint,
    ) -> Result<bool, SwiftError> {
        if self.is_source() {
            return Ok(false);
        }
        if bin.layer() != self.munro_layer() {
            return Err(SwiftError::Monotonicity);
        }
        // Replays of an already-verified munro are nothing new, not an error.
        if self.signed_munro(bin).is_some() {
            return Ok(false);
        }
        // The source must sign monotonically: a distinct new munro has to
        // sit strictly to the right of the highest one accepted so far.
        if let Some(last) = self.munros.last() {
            if bin <= last.bin {
                return Err(SwiftError::Monotonicity);
            }
        }
        // The candidate hash this signature is supposed to cover.
        let hash = match self.find_node(bin) {
            Some(id) if !self.node(id).hash.is_zero() => self.node(id).hash,
            _ => return Err(SwiftError::Signature),
        };
        if !self.pubkey.verify(bin, &hash, timestamp, &signature) {
            return Err(SwiftError::Signature);
        }
        let div = (now - timestamp) / TINT_SEC;
        if div.abs() > MAX_SOURCE_DIVERGENCE_SECS {
            return Err(SwiftError::Divergence(div));
        }
        let id = self.make_node(bin);
        let node = self.node_mut(id);
        node.hash = hash;
        node.verified = true;
        // Monotonicity keeps this list sorted by construction.
        self.munros.push(SignedMunro {
            bin,
            hash,
            timestamp,
            signature,
        });
        self.state = LiveTreeState::VerAwaitData;
        debug!(munro = %bin, "live: verified munro");
        Ok(true)
    }

    /// Uncle hash inside a munro-covered subtree, or a candidate munro
    /// hash awaiting its signature; held tentatively until verified. Zero
    /// hashes are rejected outright.
    pub fn offer_hash(&mut self, pos: Bin, hash: Sha1Hash) -> Result<(), SwiftError> {
        if self.is_source() {
            return Ok(());
        }
        if hash.is_zero() {
            return Err(SwiftError::Integrity);
        }
        if !self.is_munro_covered(pos) && pos.layer() != self.munro_layer() {
            // No trust anchor and not a munro candidate; remember nothing.
            return Ok(());
        }
        let id = self.make_node(pos);
        let node = self.node_mut(id);
        if !node.verified {
            node.hash = hash;
        }
        Ok(())
    }

    /// Verify one live chunk against its covering munro and store it.
    pub fn offer_data(
        &mut self,
        pos: Bin,
        data: &[u8],
        storage: &mut Storage,
    ) -> Result<bool, SwiftError> {
        if !pos.is_base() || data.len() > self.chunk_size as usize {
            return Ok(false);
        }
        if self.ack_out.is_filled_in(pos) {
            return Ok(true);
        }
        let munro = self.munro_for(pos);
        let munro_id = match self.find_node(munro) {
            Some(id) if self.node(id).verified => id,
            _ => return Ok(false), // not deliverable before its munro
        };

        let mut hash = Sha1Hash::from_content(data);
        let mut cur = pos;
        let mut pending: Vec<(Bin, Sha1Hash)> = Vec::new();
        while cur != munro {
            let trusted = self
                .find_node(cur)
                .map(|id| self.node(id).verified)
                .unwrap_or(false);
            if trusted {
                break;
            }
            pending.push((cur, hash));
            let sibling = match self.find_node(cur.sibling()) {
                Some(id) => self.node(id).hash,
                None => Sha1Hash::ZERO,
            };
            hash = if cur.is_left() {
                Sha1Hash::from_pair(&hash, &sibling)
            } else {
                Sha1Hash::from_pair(&sibling, &hash)
            };
            cur = cur.parent();
        }
        let anchor = match self.find_node(cur) {
            Some(id) => self.node(id).hash,
            None => self.node(munro_id).hash,
        };
        if hash != anchor {
            return Ok(false);
        }

        for (b, h) in pending {
            let id = self.make_node(b);
            let n = self.node_mut(id);
            n.hash = h;
            n.verified = true;
        }
        storage.write(data, pos.base_offset() * self.chunk_size as u64)?;
        self.ack_out.set(pos);
        self.completec += 1;
        Ok(true)
    }

    /// Uncle chain from `pos` up to (excluding) its munro, descending
    /// layers first, skipping levels the peer provably has.
    pub fn uncle_chain(&self, pos: Bin, skip_known: impl Fn(Bin) -> bool) -> Vec<(Bin, Sha1Hash)> {
        let munro = self.munro_for(pos);
        let mut chain = Vec::new();
        let mut p = pos;
        while p != munro && !skip_known(p.parent()) {
            let uncle = p.sibling();
            if let Some(id) = self.find_node(uncle) {
                chain.push((uncle, self.node(id).hash));
            }
            p = p.parent();
        }
        chain.reverse();
        chain
    }

    /*
     * Pruning
     */

    /// Drop everything entirely to the left of base position `pos`,
    /// including stale munros. Chunks inside the window survive.
    pub fn purge_tree(&mut self, pos: Bin) {
        let keep_from = pos.base_offset();
        self.munros.retain(|m| m.bin.base_right().base_offset() >= keep_from);
        let Some(root) = self.root else { return };
        self.purge_under(root, keep_from);
        // Reset the acked maps below the window.
        if keep_from > 0 {
            for b in crate::net::wire::chunk_range_to_bins(0, keep_from - 1) {
                self.ack_out.reset(b);
                self.signed_ack_out.reset(b);
            }
        }
    }

    fn purge_under(&mut self, id: u32, keep_from: u64) {
        let (bin, left, right) = {
            let n = self.node(id);
            (n.bin, n.left, n.right)
        };
        if bin.base_right().base_offset() < keep_from {
            self.drop_subtree(id);
            return;
        }
        if bin.base_offset() >= keep_from {
            return;
        }
        if let Some(l) = left {
            self.purge_under(l, keep_from);
        }
        if let Some(r) = right {
            self.purge_under(r, keep_from);
        }
    }

    fn drop_subtree(&mut self, id: u32) {
        let (parent, left, right) = {
            let n = self.node(id);
            (n.parent, n.left, n.right)
        };
        if let Some(l) = left {
            self.drop_subtree(l);
        }
        if let Some(r) = right {
            self.drop_subtree(r);
        }
        if let Some(p) = parent {
            let pn = self.node_mut(p);
            if pn.left == Some(id) {
                pn.left = None;
            } else if pn.right == Some(id) {
                pn.right = None;
            }
        } else if self.root == Some(id) {
            self.root = None;
        }
        self.nodes[id as usize] = None;
        self.free.push(id);
    }

    /*
     * Source checkpoint: one line with the last signed munro.
     */

    pub fn write_checkpoint(&self, path: &Path) -> std::io::Result<()> {
        let Some(m) = self.munros.last() else {
            return Ok(());
        };
        let mut out = Vec::new();
        writeln!(
            out,
            "{} {} {} {}",
            m.bin.to_u64(),
            m.hash.hex(),
            m.timestamp,
            hex::encode(&m.signature.0)
        )?;
        fs::write(path, out)
    }

    pub fn read_checkpoint(path: &Path) -> Option<SignedMunro> {
        let text = fs::read_to_string(path).ok()?;
        let mut it = text.split_whitespace();
        let bin = Bin::from_u64(it.next()?.parse().ok()?);
        let hash = Sha1Hash::from_hex(it.next()?)?;
        let timestamp: Tint = it.next()?.parse().ok()?;
        let signature = LiveSignature(hex::decode(it.next()?).ok()?);
        Some(SignedMunro {
            bin,
            hash,
            timestamp,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livesig::KeyPair;
    use std::path::PathBuf;

    fn temp_storage(tag: &str) -> Storage {
        let dir = std::env::temp_dir().join(format!("tswift_live_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path: PathBuf = dir.join("live.dat");
        Storage::open(&path, &dir, 0).unwrap()
    }

    fn chunk(i: u64) -> Vec<u8> {
        vec![(i & 0xFF) as u8; 64]
    }

    #[test]
    fn test_source_signs_every_epoch() {
        let mut src = LiveHashTree::new_source(KeyPair::from_seed([1; 32]), 64, 4);
        let mut munros = Vec::new();
        for i in 0..12 {
            let (pos, munro) = src.add_data(&chunk(i), 1000 + i as Tint);
            assert_eq!(pos, Bin::chunk(i));
            if let Some(m) = munro {
                munros.push(m);
            }
        }
        assert_eq!(munros.len(), 3);
        assert_eq!(munros[0].bin, Bin::new(2, 0));
        assert_eq!(munros[1].bin, Bin::new(2, 1));
        assert_eq!(munros[2].bin, Bin::new(2, 2));
        assert_eq!(src.state(), LiveTreeState::SignData);
    }

    #[test]
    fn test_client_verifies_chain() {
        let kp = KeyPair::from_seed([2; 32]);
        let pubkey = kp.swarm_pubkey();
        let mut src = LiveHashTree::new_source(kp, 64, 4);
        let mut client = LiveHashTree::new_client(pubkey, 64, 4);
        let mut storage = temp_storage("client");

        let mut munro = None;
        for i in 0..4 {
            let (_, m) = src.add_data(&chunk(i), 50);
            if m.is_some() {
                munro = m;
            }
        }
        let m = munro.unwrap();
        client.offer_hash(m.bin, m.hash).unwrap();
        assert!(client
            .offer_signed_munro(m.bin, m.timestamp, m.signature.clone(), 60)
            .unwrap());
        assert_eq!(client.state(), LiveTreeState::VerAwaitData);

        // Chunk 0 is verifiable given its uncles.
        for (ub, uh) in src.uncle_chain(Bin::chunk(0), |_| false) {
            client.offer_hash(ub, uh).unwrap();
        }
        assert!(client.offer_data(Bin::chunk(0), &chunk(0), &mut storage).unwrap());
        // A flipped byte is not.
        let mut bad = chunk(1);
        bad[0] ^= 1;
        for (ub, uh) in src.uncle_chain(Bin::chunk(1), |_| false) {
            client.offer_hash(ub, uh).unwrap();
        }
        assert!(!client.offer_data(Bin::chunk(1), &bad, &mut storage).unwrap());
        assert!(client.ack_out().is_empty_in(Bin::chunk(1)));
    }

    #[test]
    fn test_trust_failures() {
        let kp = KeyPair::from_seed([3; 32]);
        let other = KeyPair::from_seed([4; 32]);
        let mut src = LiveHashTree::new_source(kp, 64, 4);
        let mut client = LiveHashTree::new_client(src.pubkey().clone(), 64, 4);

        let mut munro = None;
        for i in 0..4 {
            let (_, m) = src.add_data(&chunk(i), 1_000_000);
            if m.is_some() {
                munro = m;
            }
        }
        let m = munro.unwrap();
        client.offer_hash(m.bin, m.hash).unwrap();

        // Wrong key.
        let forged = other.sign_munro(m.bin, &m.hash, m.timestamp);
        assert!(matches!(
            client.offer_signed_munro(m.bin, m.timestamp, forged, 1_000_000),
            Err(SwiftError::Signature)
        ));
        // Too far in the past.
        assert!(matches!(
            client.offer_signed_munro(
                m.bin,
                m.timestamp,
                m.signature.clone(),
                1_000_000 + 31 * TINT_SEC
            ),
            Err(SwiftError::Divergence(_))
        ));
        // In-window accepts.
        assert!(client
            .offer_signed_munro(m.bin, m.timestamp, m.signature.clone(), 1_000_000)
            .unwrap());
    }

    #[test]
    fn test_munro_monotonicity() {
        let kp = KeyPair::from_seed([6; 32]);
        let mut src = LiveHashTree::new_source(kp, 64, 4);
        let mut client = LiveHashTree::new_client(src.pubkey().clone(), 64, 4);

        // Two epochs: munros (2,0) and (2,1), both genuinely signed.
        let mut munros = Vec::new();
        for i in 0..8 {
            let (_, m) = src.add_data(&chunk(i), 2_000_000);
            if let Some(m) = m {
                munros.push(m);
            }
        }
        let (first, second) = (munros[0].clone(), munros[1].clone());

        // The newer epoch arrives first and verifies.
        client.offer_hash(second.bin, second.hash).unwrap();
        assert!(client
            .offer_signed_munro(second.bin, second.timestamp, second.signature.clone(), 2_000_000)
            .unwrap());

        // A distinct munro to the left of it is non-monotonic, even though
        // its signature and timestamp check out.
        client.offer_hash(first.bin, first.hash).unwrap();
        assert!(matches!(
            client.offer_signed_munro(first.bin, first.timestamp, first.signature, 2_000_000),
            Err(SwiftError::Monotonicity)
        ));
        assert!(client.signed_munro(first.bin).is_none());

        // Replaying the accepted one stays a no-op.
        assert!(!client
            .offer_signed_munro(second.bin, second.timestamp, second.signature, 2_000_000)
            .unwrap());
    }

    #[test]
    fn test_purge_window() {
        let mut src = LiveHashTree::new_source(KeyPair::from_seed([5; 32]), 64, 4);
        for i in 0..16 {
            src.add_data(&chunk(i), 10);
        }
        assert_eq!(src.munros.len(), 4);
        src.purge_tree(Bin::chunk(8));
        assert_eq!(src.last_munro(), Bin::new(2, 3));
        assert!(src.munros.iter().all(|m| m.bin.base_offset() >= 8));
        assert!(src.find_node(Bin::chunk(2)).is_none());
        assert!(src.find_node(Bin::chunk(9)).is_some());
        assert!(src.ack_out().is_empty_in(Bin::chunk(3)));
        assert!(src.ack_out().is_filled_in(Bin::chunk(9)));
    }
}
