//! Static Merkle hash tree over fixed-size chunks.
//!
//! The tree is addressed by bins. For a swarm of N chunks the *peaks* are
//! the roots of the maximal complete subtrees tiling the chunks left to
//! right; the swarm's root hash is the accumulation from the rightmost peak
//! upward to `Bin::ALL`, an absent sibling contributing the zero hash. A
//! cold peer that knows only the root hash learns the content size from the
//! peak hashes alone: the peaks are accepted exactly when they accumulate
//! to the known root.
//!
//! Verification is transactional: `offer_data` recomputes the chain from
//! the chunk up to the nearest trusted node and commits hashes, ack bits
//! and bytes only when the chain closes.

use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::error::{StorageError, SwiftError};
use crate::storage::Storage;

use sha1::{Digest, Sha1};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default chunk size in bytes, configurable per swarm.
pub const DEFAULT_CHUNK_SIZE: u32 = 8192;

pub const HASH_SIZE: usize = 20;

/// SHA-1 digest wrapper used for every node of the tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Hash(pub [u8; HASH_SIZE]);

impl Sha1Hash {
    pub const ZERO: Sha1Hash = Sha1Hash([0u8; HASH_SIZE]);

    /// Leaf hash: domain-separated from interior nodes by a 0x00 prefix.
    pub fn from_content(data: &[u8]) -> Sha1Hash {
        let mut h = Sha1::new();
        h.update([0u8]);
        h.update(data);
        Sha1Hash(h.finalize().into())
    }

    /// Interior hash over the concatenation of the two children.
    pub fn from_pair(left: &Sha1Hash, right: &Sha1Hash) -> Sha1Hash {
        let mut h = Sha1::new();
        h.update(left.0);
        h.update(right.0);
        Sha1Hash(h.finalize().into())
    }

    /// Free-form digest (swarm ids derived from strings, tests).
    pub fn from_bytes_digest(data: &[u8]) -> Sha1Hash {
        Sha1Hash(Sha1::digest(data).into())
    }

    pub fn is_zero(&self) -> bool {
        *self == Sha1Hash::ZERO
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Sha1Hash> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Sha1Hash(arr))
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Peak bins for `sizec` chunks: one peak per set bit, highest layer first.
pub fn peak_bins(sizec: u64) -> Vec<Bin> {
    let mut peaks = Vec::new();
    let mut consumed = 0u64;
    for layer in (0..64).rev() {
        if sizec & (1u64 << layer) != 0 {
            peaks.push(Bin::new(layer, consumed >> layer));
            consumed += 1u64 << layer;
        }
    }
    peaks
}

/// Accumulate peak hashes from the rightmost peak up to `Bin::ALL`.
/// Peaks must be in descending-layer (left to right) order.
pub fn derive_root(peaks: &[(Bin, Sha1Hash)]) -> Sha1Hash {
    if peaks.is_empty() {
        return Sha1Hash::ZERO;
    }
    let mut c = peaks.len() - 1;
    let (mut p, mut hash) = peaks[c];
    while !p.is_all() {
        if p.is_left() {
            hash = Sha1Hash::from_pair(&hash, &Sha1Hash::ZERO);
        } else {
            if c == 0 || peaks[c - 1].0 != p.sibling() {
                // Candidate peaks do not tile: not a valid peak set.
                return Sha1Hash::ZERO;
            }
            c -= 1;
            hash = Sha1Hash::from_pair(&peaks[c].1, &hash);
        }
        p = p.parent();
    }
    hash
}

/// Where node hashes live: in memory, or read per request from the
/// `.mhash` sidecar (zero-state serving).
enum HashStore {
    Mem(Vec<Sha1Hash>),
    Disk(fs::File),
}

/// Merkle tree for a static (known-size or size-discovering) swarm.
pub struct HashTree {
    chunk_size: u32,
    /// Content size in bytes; 0 while peaks are still being collected.
    size: u64,
    sizec: u64,
    complete: u64,
    completec: u64,
    root_hash: Sha1Hash,
    peaks: Vec<(Bin, Sha1Hash)>,
    hashes: HashStore,
    /// Hashes individually checked against the trust chain.
    verified: Binmap,
    /// Chunks verified and persisted.
    ack_out: Binmap,
}

impl HashTree {
    /// Cold client: only the root hash is known; size follows from peaks.
    pub fn new_client(root_hash: Sha1Hash, chunk_size: u32) -> HashTree {
        HashTree {
            chunk_size,
            size: 0,
            sizec: 0,
            complete: 0,
            completec: 0,
            root_hash,
            peaks: Vec::new(),
            hashes: HashStore::Mem(Vec::new()),
            verified: Binmap::new(),
            ack_out: Binmap::new(),
        }
    }

    /// Seeder bootstrap: hash every chunk of `storage` and build the tree.
    pub fn create_from_storage(
        storage: &mut Storage,
        size: u64,
        chunk_size: u32,
    ) -> Result<HashTree, SwiftError> {
        let sizec = size.div_ceil(chunk_size as u64).max(1);
        let mut tree = HashTree::new_client(Sha1Hash::ZERO, chunk_size);
        tree.alloc_size(size, sizec);
        let mut buf = vec![0u8; chunk_size as usize];
        for c in 0..sizec {
            let off = c * chunk_size as u64;
            let want = (size - off).min(chunk_size as u64) as usize;
            let got = storage.read(&mut buf[..want], off)?;
            if got != want {
                return Err(StorageError::OutOfRange(off).into());
            }
            tree.set_hash(Bin::chunk(c), Sha1Hash::from_content(&buf[..want]));
        }
        tree.build_interior();
        for i in 0..tree.peaks.len() {
            let peak = tree.peaks[i].0;
            tree.peaks[i].1 = tree.stored_hash(peak);
            tree.verified.set(peak);
            tree.ack_out.set(peak);
        }
        tree.root_hash = derive_root(&tree.peaks);
        tree.complete = size;
        tree.completec = sizec;
        Ok(tree)
    }

    /// Restore from sidecars. Returns `None` when the files are missing,
    /// corrupt or do not belong to `root_hash`.
    pub fn load_checkpoint(
        root_hash: &Sha1Hash,
        chunk_size: u32,
        mhash_path: &Path,
        mbinmap_path: &Path,
    ) -> Option<HashTree> {
        let (size, completec, ack_out) = read_binmap_sidecar(mbinmap_path, root_hash, chunk_size)?;
        let sizec = size.div_ceil(chunk_size as u64).max(1);
        let data = fs::read(mhash_path).ok()?;
        let node_space = hash_space(sizec);
        if data.len() < node_space as usize * HASH_SIZE {
            return None;
        }
        let mut hashes = Vec::with_capacity(node_space as usize);
        for i in 0..node_space as usize {
            let mut h = [0u8; HASH_SIZE];
            h.copy_from_slice(&data[i * HASH_SIZE..(i + 1) * HASH_SIZE]);
            hashes.push(Sha1Hash(h));
        }
        let mut tree = HashTree::new_client(*root_hash, chunk_size);
        tree.size = size;
        tree.sizec = sizec;
        tree.hashes = HashStore::Mem(hashes);
        for peak in peak_bins(sizec) {
            let h = tree.stored_hash(peak);
            tree.peaks.push((peak, h));
            tree.verified.set(peak);
        }
        if derive_root(&tree.peaks) != *root_hash {
            return None;
        }
        tree.ack_out = ack_out;
        tree.completec = completec;
        tree.complete = tree.completed_bytes_from_chunks();
        Some(tree)
    }

    /// Zero-state serving: peaks and ack binmap in memory, node hashes read
    /// from the `.mhash` file per request. Requires a complete checkpoint.
    pub fn open_zero_state(
        root_hash: &Sha1Hash,
        chunk_size: u32,
        mhash_path: &Path,
        mbinmap_path: &Path,
    ) -> Option<HashTree> {
        let (size, completec, ack_out) = read_binmap_sidecar(mbinmap_path, root_hash, chunk_size)?;
        let sizec = size.div_ceil(chunk_size as u64).max(1);
        if completec < sizec {
            // Zero-state can only serve finished content.
            return None;
        }
        let file = fs::File::open(mhash_path).ok()?;
        let mut tree = HashTree::new_client(*root_hash, chunk_size);
        tree.size = size;
        tree.sizec = sizec;
        tree.hashes = HashStore::Disk(file);
        for peak in peak_bins(sizec) {
            let h = tree.stored_hash(peak);
            tree.peaks.push((peak, h));
            tree.verified.set(peak);
        }
        if derive_root(&tree.peaks) != *root_hash {
            return None;
        }
        tree.ack_out = ack_out;
        tree.completec = completec;
        tree.complete = size;
        Some(tree)
    }

    pub fn is_zero_state(&self) -> bool {
        matches!(self.hashes, HashStore::Disk(_))
    }

    fn alloc_size(&mut self, size: u64, sizec: u64) {
        self.size = size;
        self.sizec = sizec;
        let space = hash_space(sizec) as usize;
        if let HashStore::Mem(v) = &mut self.hashes {
            v.resize(space, Sha1Hash::ZERO);
        }
        self.peaks = peak_bins(sizec).into_iter().map(|b| (b, Sha1Hash::ZERO)).collect();
    }

    /// Fill the interior nodes inside every peak from the leaf layer up.
    fn build_interior(&mut self) {
        for i in 0..self.peaks.len() {
            let peak = self.peaks[i].0;
            for layer in 1..=peak.layer() {
                let step = 1u64 << (layer + 1);
                let mut v = Bin::new(layer, peak.base_offset() >> layer).to_u64();
                let end = peak.base_right().to_u64();
                while v <= end {
                    let b = Bin::from_u64(v);
                    let h = Sha1Hash::from_pair(
                        &self.stored_hash(b.left()),
                        &self.stored_hash(b.right()),
                    );
                    self.set_hash(b, h);
                    v += step;
                }
            }
        }
    }

    fn completed_bytes_from_chunks(&self) -> u64 {
        let mut bytes = self.completec * self.chunk_size as u64;
        // The final chunk may be short.
        if self.sizec > 0 && self.ack_out.is_filled_in(Bin::chunk(self.sizec - 1)) {
            let tail = self.size - (self.sizec - 1) * self.chunk_size as u64;
            bytes = bytes - self.chunk_size as u64 + tail;
        }
        bytes.min(self.size)
    }

    /*
     * Accessors
     */

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn root_hash(&self) -> &Sha1Hash {
        &self.root_hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_in_chunks(&self) -> u64 {
        self.sizec
    }

    pub fn complete(&self) -> u64 {
        self.complete
    }

    pub fn chunks_complete(&self) -> u64 {
        self.completec
    }

    pub fn is_complete(&self) -> bool {
        self.size > 0 && self.complete == self.size
    }

    /// Bytes retrievable sequentially starting at byte `offset`.
    pub fn seq_complete(&self, offset: u64) -> u64 {
        if self.size == 0 || offset >= self.size {
            return 0;
        }
        let start_chunk = offset / self.chunk_size as u64;
        let first_empty = self.ack_out.find_empty_from(Bin::chunk(start_chunk));
        let seq_end = if first_empty.is_none() {
            self.size
        } else {
            (first_empty.base_offset() * self.chunk_size as u64).min(self.size)
        };
        seq_end.saturating_sub(offset)
    }

    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    pub fn peak(&self, i: usize) -> Bin {
        self.peaks[i].0
    }

    pub fn peak_hash(&self, i: usize) -> Sha1Hash {
        self.peaks[i].1
    }

    /// The peak whose subtree contains `pos`; `NONE` outside the tree.
    pub fn peak_for(&self, pos: Bin) -> Bin {
        for (peak, _) in &self.peaks {
            if peak.contains(pos) {
                return *peak;
            }
        }
        Bin::NONE
    }

    pub fn ack_out(&self) -> &Binmap {
        &self.ack_out
    }

    pub fn ack_out_mut(&mut self) -> &mut Binmap {
        &mut self.ack_out
    }

    /// Stored hash for `bin`; `ZERO` when never offered.
    pub fn hash(&self, bin: Bin) -> Sha1Hash {
        self.stored_hash(bin)
    }

    fn stored_hash(&self, bin: Bin) -> Sha1Hash {
        let idx = bin.to_u64();
        match &self.hashes {
            HashStore::Mem(v) => v.get(idx as usize).copied().unwrap_or(Sha1Hash::ZERO),
            HashStore::Disk(f) => {
                let mut file = f;
                let mut buf = [0u8; HASH_SIZE];
                let res = file
                    .seek(SeekFrom::Start(idx * HASH_SIZE as u64))
                    .and_then(|_| file.read_exact(&mut buf));
                match res {
                    Ok(()) => Sha1Hash(buf),
                    Err(_) => Sha1Hash::ZERO,
                }
            }
        }
    }

    fn set_hash(&mut self, bin: Bin, hash: Sha1Hash) {
        if let HashStore::Mem(v) = &mut self.hashes {
            let idx = bin.to_u64() as usize;
            if idx >= v.len() {
                v.resize(idx + 1, Sha1Hash::ZERO);
            }
            v[idx] = hash;
        }
    }

    /*
     * Verification
     */

    /// Store `hash` for `bin`, tentatively or as a peak candidate.
    /// Returns whether the hash is (now) known to be trustworthy.
    pub fn offer_hash(&mut self, pos: Bin, hash: Sha1Hash) -> bool {
        if self.size == 0 {
            return self.offer_peak_hash(pos, hash);
        }
        let peak = self.peak_for(pos);
        if peak.is_none() {
            return false;
        }
        if peak == pos {
            return hash == self.stored_hash(pos);
        }
        if !self.ack_out.is_empty_in(pos.parent()) || self.verified.is_filled_in(pos) {
            // Frozen region: only a confirmation is acceptable.
            return hash == self.stored_hash(pos);
        }
        self.set_hash(pos, hash);
        false
    }

    /// Collect candidate peaks until they accumulate to the root hash.
    fn offer_peak_hash(&mut self, pos: Bin, hash: Sha1Hash) -> bool {
        if let Some(&(last, _)) = self.peaks.last() {
            // Peaks arrive left to right in descending layers; anything
            // else restarts the collection.
            if pos.layer() >= last.layer()
                || pos.base_offset() != last.base_offset() + last.base_length()
            {
                self.peaks.clear();
            }
        }
        self.peaks.push((pos, hash));
        if derive_root(&self.peaks) != self.root_hash {
            return false;
        }
        // The peak set checks out: the content size is now known.
        let sizec: u64 = self.peaks.iter().map(|(b, _)| b.base_length()).sum();
        let size = sizec * self.chunk_size as u64;
        let peaks = std::mem::take(&mut self.peaks);
        self.alloc_size(size, sizec);
        self.peaks = peaks;
        for &(b, h) in &self.peaks.clone() {
            self.set_hash(b, h);
            self.verified.set(b);
        }
        true
    }

    /// Verify one chunk against the trust chain; on success persist it via
    /// `storage` and mark it acknowledged.
    pub fn offer_data(
        &mut self,
        pos: Bin,
        data: &[u8],
        storage: &mut Storage,
    ) -> Result<bool, SwiftError> {
        if self.size == 0 || !pos.is_base() {
            return Ok(false);
        }
        if pos.base_offset() >= self.sizec {
            return Ok(false);
        }
        if data.len() > self.chunk_size as usize {
            return Ok(false);
        }
        if data.len() < self.chunk_size as usize && pos != Bin::chunk(self.sizec - 1) {
            return Ok(false);
        }
        if self.ack_out.is_filled_in(pos) {
            return Ok(true);
        }
        if self.is_zero_state() {
            return Ok(false);
        }
        let peak = self.peak_for(pos);
        if peak.is_none() {
            return Ok(false);
        }

        // Walk up to the nearest trusted node without touching stored state.
        let mut hash = Sha1Hash::from_content(data);
        let mut p = pos;
        let mut pending: Vec<(Bin, Sha1Hash)> = Vec::new();
        while p != peak && self.ack_out.is_empty_in(p) && !self.verified.is_filled_in(p) {
            pending.push((p, hash));
            let sibling = self.stored_hash(p.sibling());
            hash = if p.is_left() {
                Sha1Hash::from_pair(&hash, &sibling)
            } else {
                Sha1Hash::from_pair(&sibling, &hash)
            };
            p = p.parent();
        }
        if hash != self.stored_hash(p) {
            return Ok(false);
        }

        for (b, h) in pending {
            self.set_hash(b, h);
            self.verified.set(b);
        }
        storage.write(data, pos.base_offset() * self.chunk_size as u64)?;
        self.ack_out.set(pos);
        self.completec += 1;
        self.complete += data.len() as u64;
        if pos == Bin::chunk(self.sizec - 1) && data.len() < self.chunk_size as usize {
            // A short final chunk pins down the exact content size, which a
            // peak-taught client only knew rounded up to a whole chunk.
            self.size = (self.sizec - 1) * self.chunk_size as u64 + data.len() as u64;
        }
        Ok(true)
    }

    /// The uncle chain for `pos`: siblings up to (excluding) its peak,
    /// returned in descending-layer order as the wire wants them.
    pub fn uncle_chain(&self, pos: Bin, skip_known: impl Fn(Bin) -> bool) -> Vec<(Bin, Sha1Hash)> {
        let peak = self.peak_for(pos);
        if peak.is_none() {
            return Vec::new();
        }
        let mut chain = Vec::new();
        let mut p = pos;
        while p != peak && !skip_known(p.parent()) {
            let uncle = p.sibling();
            chain.push((uncle, self.stored_hash(uncle)));
            p = p.parent();
        }
        chain.reverse();
        chain
    }

    /*
     * Sidecar persistence
     */

    /// Atomically write the `.mhash` and `.mbinmap` sidecars.
    pub fn checkpoint(&self, mhash_path: &Path, mbinmap_path: &Path) -> io::Result<()> {
        if let HashStore::Mem(hashes) = &self.hashes {
            let mut bytes = Vec::with_capacity(hashes.len() * HASH_SIZE);
            for h in hashes {
                bytes.extend_from_slice(&h.0);
            }
            write_atomic(mhash_path, &bytes)?;
        }
        let mut text = Vec::new();
        writeln!(text, "version 1")?;
        writeln!(text, "root hash {}", self.root_hash.hex())?;
        writeln!(text, "chunk size {}", self.chunk_size)?;
        writeln!(text, "size {}", self.size)?;
        writeln!(text, "completec {}", self.completec)?;
        self.ack_out.serialize(&mut text)?;
        write_atomic(mbinmap_path, &text)
    }
}

/// Node-hash slots needed for a tree of `sizec` chunks: bin values run up
/// to the root of the next power of two.
fn hash_space(sizec: u64) -> u64 {
    let leaves = sizec.next_power_of_two().max(1);
    2 * leaves
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = PathBuf::from(path);
    let mut name = tmp
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    tmp.set_file_name(name);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Parse the `.mbinmap` sidecar: (size, completec, ack binmap).
fn read_binmap_sidecar(
    path: &Path,
    root_hash: &Sha1Hash,
    chunk_size: u32,
) -> Option<(u64, u64, Binmap)> {
    let file = fs::File::open(path).ok()?;
    let mut rd = BufReader::new(file);
    let mut line = String::new();

    let mut next = |rd: &mut BufReader<fs::File>, line: &mut String| -> Option<String> {
        line.clear();
        if rd.read_line(line).ok()? == 0 {
            return None;
        }
        Some(line.trim_end().to_string())
    };

    if next(&mut rd, &mut line)? != "version 1" {
        return None;
    }
    let rh = next(&mut rd, &mut line)?;
    let rh = rh.strip_prefix("root hash ")?;
    if Sha1Hash::from_hex(rh)? != *root_hash {
        return None;
    }
    let cs = next(&mut rd, &mut line)?;
    if cs.strip_prefix("chunk size ")?.parse::<u32>().ok()? != chunk_size {
        return None;
    }
    let size = next(&mut rd, &mut line)?
        .strip_prefix("size ")?
        .parse::<u64>()
        .ok()?;
    let completec = next(&mut rd, &mut line)?
        .strip_prefix("completec ")?
        .parse::<u64>()
        .ok()?;
    let ack_out = Binmap::deserialize(&mut rd).ok()?;
    Some((size, completec, ack_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_bins_for_five_chunks() {
        let peaks = peak_bins(5);
        assert_eq!(peaks, vec![Bin::new(2, 0), Bin::new(0, 4)]);
        assert_eq!(peak_bins(8), vec![Bin::new(3, 0)]);
        assert_eq!(
            peak_bins(7),
            vec![Bin::new(2, 0), Bin::new(1, 2), Bin::new(0, 6)]
        );
    }

    #[test]
    fn test_derive_root_rejects_non_tiling_peaks() {
        let h = Sha1Hash::from_content(b"x");
        let ok = vec![(Bin::new(2, 0), h), (Bin::new(0, 4), h)];
        assert!(!derive_root(&ok).is_zero());
        // A right-child peak with no left sibling cannot accumulate.
        let bad = vec![(Bin::new(0, 5), h)];
        assert!(derive_root(&bad).is_zero());
    }

    #[test]
    fn test_hash_space() {
        assert_eq!(hash_space(1), 2);
        assert_eq!(hash_space(5), 16);
        assert_eq!(hash_space(8), 16);
    }
}
