//! Wire format: message ids, protocol options, chunk-address codecs and
//! the big-endian datagram reader/writer.
//!
//! A datagram is the peer's channel id (4 bytes) followed by concatenated
//! messages; each message is a one-byte id and a fixed-layout body. All
//! multi-byte integers in bodies are big-endian. Parsing is strictly
//! bounded: a truncated body or an unknown id is a `ProtocolError`, and
//! protocol errors close the channel.

use crate::bin::Bin;
use crate::error::ProtocolError;
use crate::hashtree::{Sha1Hash, HASH_SIZE};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/*
 * Size limits
 */

/// Ethernet-safe UDP payload: 1500 - IP(20) - UDP(8).
pub const MAX_UDP_PAYLOAD: usize = 1472;

/// Budget for the non-DATA head of a datagram; when the integrity hashes
/// outgrow it the head is flushed as its own datagram.
pub const MAX_NONDATA_DGRAM_SIZE: usize = 1200;

/// Largest datagram we are willing to parse.
pub const MAX_RECV_DGRAM_SIZE: usize = 65_535;

/// Cap on the SWARM_ID protocol option.
pub const MAX_SWARMID_SIZE: usize = 1024;

/// Live discard window wire value meaning "keep everything".
pub const LIVE_DISC_WND_ALL: u64 = 0xFFFF_FFFF;

/*
 * Message ids
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgId {
    Handshake = 0,
    Data = 1,
    Ack = 2,
    Have = 3,
    Integrity = 4,
    PexResV4 = 5,
    PexReq = 6,
    SignedIntegrity = 7,
    Request = 8,
    Cancel = 9,
    Choke = 10,
    Unchoke = 11,
    PexResV6 = 12,
}

impl MsgId {
    pub fn from_u8(v: u8) -> Option<MsgId> {
        match v {
            0 => Some(MsgId::Handshake),
            1 => Some(MsgId::Data),
            2 => Some(MsgId::Ack),
            3 => Some(MsgId::Have),
            4 => Some(MsgId::Integrity),
            5 => Some(MsgId::PexResV4),
            6 => Some(MsgId::PexReq),
            7 => Some(MsgId::SignedIntegrity),
            8 => Some(MsgId::Request),
            9 => Some(MsgId::Cancel),
            10 => Some(MsgId::Choke),
            11 => Some(MsgId::Unchoke),
            12 => Some(MsgId::PexResV6),
            _ => None,
        }
    }
}

/*
 * Protocol options (PPSPP handshake TLVs)
 */

const POPT_VERSION: u8 = 0;
const POPT_MIN_VERSION: u8 = 1;
const POPT_SWARMID: u8 = 2;
const POPT_CONT_INT_PROT: u8 = 3;
const POPT_MERKLE_HASH_FUNC: u8 = 4;
const POPT_LIVE_SIG_ALG: u8 = 5;
const POPT_CHUNK_ADDR: u8 = 6;
const POPT_LIVE_DISC_WND: u8 = 7;
const POPT_SUPP_MSGS: u8 = 8;
const POPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Version {
    Legacy = 0,
    Ppspv1 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentIntegrity {
    None = 0,
    Merkle = 1,
    SignAll = 2,
    UnifiedMerkle = 3,
}

impl ContentIntegrity {
    fn from_u8(v: u8) -> Option<ContentIntegrity> {
        match v {
            0 => Some(ContentIntegrity::None),
            1 => Some(ContentIntegrity::Merkle),
            2 => Some(ContentIntegrity::SignAll),
            3 => Some(ContentIntegrity::UnifiedMerkle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MerkleHashFunc {
    Sha1 = 0,
    Sha224 = 1,
    Sha256 = 2,
    Sha384 = 3,
    Sha512 = 4,
}

impl MerkleHashFunc {
    fn from_u8(v: u8) -> Option<MerkleHashFunc> {
        match v {
            0 => Some(MerkleHashFunc::Sha1),
            1 => Some(MerkleHashFunc::Sha224),
            2 => Some(MerkleHashFunc::Sha256),
            3 => Some(MerkleHashFunc::Sha384),
            4 => Some(MerkleHashFunc::Sha512),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkAddr {
    Bin32 = 0,
    Byte64 = 1,
    Chunk32 = 2,
    Bin64 = 3,
    Chunk64 = 4,
}

impl ChunkAddr {
    fn from_u8(v: u8) -> Option<ChunkAddr> {
        match v {
            0 => Some(ChunkAddr::Bin32),
            1 => Some(ChunkAddr::Byte64),
            2 => Some(ChunkAddr::Chunk32),
            3 => Some(ChunkAddr::Bin64),
            4 => Some(ChunkAddr::Chunk64),
            _ => None,
        }
    }

    /// Wire size of one chunk address under this encoding.
    pub fn size(self) -> usize {
        match self {
            ChunkAddr::Bin32 => 4,
            ChunkAddr::Byte64 => 16,
            ChunkAddr::Chunk32 => 8,
            ChunkAddr::Bin64 => 8,
            ChunkAddr::Chunk64 => 16,
        }
    }
}

/// Negotiated per-channel parameters, one for each direction.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Peer channel id; zero means the peer wants to close.
    pub peer_channel_id: u32,
    pub version: Version,
    pub min_version: Version,
    pub cont_int_prot: ContentIntegrity,
    pub merkle_func: MerkleHashFunc,
    /// Raw live signature algorithm code; validated in `is_supported`.
    pub live_sig_alg: u8,
    pub chunk_addr: ChunkAddr,
    pub live_disc_wnd: u64,
    /// Swarm id bytes, present in the initiating handshake only.
    pub swarm_id: Option<Vec<u8>>,
}

impl Default for Handshake {
    fn default() -> Handshake {
        Handshake {
            peer_channel_id: 0,
            version: Version::Ppspv1,
            min_version: Version::Ppspv1,
            cont_int_prot: ContentIntegrity::Merkle,
            merkle_func: MerkleHashFunc::Sha1,
            live_sig_alg: crate::livesig::DEFAULT_LIVE_SIG_ALG as u8,
            chunk_addr: ChunkAddr::Chunk32,
            live_disc_wnd: LIVE_DISC_WND_ALL,
            swarm_id: None,
        }
    }
}

impl Handshake {
    /// Whether this option combination is implementable here.
    pub fn is_supported(&self) -> bool {
        if self.cont_int_prot == ContentIntegrity::SignAll {
            return false;
        }
        if self.merkle_func != MerkleHashFunc::Sha1 {
            return false;
        }
        if !matches!(self.chunk_addr, ChunkAddr::Bin32 | ChunkAddr::Chunk32) {
            return false;
        }
        if self.cont_int_prot == ContentIntegrity::UnifiedMerkle
            && crate::livesig::LiveSigAlg::from_u8(self.live_sig_alg)
                .map(|a| !a.is_supported())
                .unwrap_or(true)
        {
            return false;
        }
        true
    }

    /// Fall back to the pre-PPSP wire dialect.
    pub fn reset_to_legacy(&mut self) {
        self.version = Version::Legacy;
        self.min_version = Version::Legacy;
        self.cont_int_prot = ContentIntegrity::Merkle;
        self.merkle_func = MerkleHashFunc::Sha1;
        self.chunk_addr = ChunkAddr::Bin32;
        self.live_disc_wnd = LIVE_DISC_WND_ALL;
    }
}

/*
 * Datagram writer
 */

pub struct DgramWriter {
    buf: Vec<u8>,
}

impl Default for DgramWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DgramWriter {
    pub fn new() -> DgramWriter {
        DgramWriter {
            buf: Vec::with_capacity(MAX_UDP_PAYLOAD),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn hash(&mut self, h: &Sha1Hash) {
        self.buf.extend_from_slice(&h.0);
    }

    /// Channel id prefix: little-endian per §6, everything else big-endian.
    pub fn channel_id(&mut self, id: u32) {
        self.buf.extend_from_slice(&id.to_le_bytes());
    }

    pub fn chunk_addr(&mut self, bin: Bin, ca: ChunkAddr) {
        match ca {
            ChunkAddr::Bin32 => self.u32(bin_to_u32(bin)),
            ChunkAddr::Chunk32 => {
                self.u32(bin.base_offset() as u32);
                // End is inclusive.
                self.u32((bin.base_offset() + bin.base_length() - 1) as u32);
            }
            // 64-bit encodings are rejected at handshake time.
            ChunkAddr::Byte64 | ChunkAddr::Bin64 | ChunkAddr::Chunk64 => {
                self.u64(bin.to_u64());
            }
        }
    }

    pub fn pex_addr(&mut self, addr: SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.u8(MsgId::PexResV4 as u8);
                self.bytes(&ip.octets());
                self.u16(addr.port());
            }
            IpAddr::V6(ip) => {
                self.u8(MsgId::PexResV6 as u8);
                self.bytes(&ip.octets());
                self.u16(addr.port());
            }
        }
    }
}

/*
 * Datagram reader
 */

pub struct DgramReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DgramReader<'a> {
    pub fn new(buf: &'a [u8]) -> DgramReader<'a> {
        DgramReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, n: usize, what: &'static str) -> Result<(), ProtocolError> {
        if self.remaining() < n {
            Err(ProtocolError::Truncated(what))
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        self.need(1, what)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        self.need(2, what)?;
        let v = u16::from_be_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        self.need(4, what)?;
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, ProtocolError> {
        self.need(8, what)?;
        let v = u64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    /// Channel id prefix is little-endian.
    pub fn channel_id(&mut self) -> Result<u32, ProtocolError> {
        self.need(4, "channel id")?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn hash(&mut self, what: &'static str) -> Result<Sha1Hash, ProtocolError> {
        self.need(HASH_SIZE, what)?;
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&self.buf[self.pos..self.pos + HASH_SIZE]);
        self.pos += HASH_SIZE;
        Ok(Sha1Hash(h))
    }

    pub fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        self.need(n, what)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    /// Decode one chunk address into the minimal set of covering bins.
    pub fn chunk_addr(&mut self, ca: ChunkAddr) -> Result<Vec<Bin>, ProtocolError> {
        match ca {
            ChunkAddr::Bin32 => {
                let v = self.u32("chunk addr")?;
                Ok(vec![bin_from_u32(v)])
            }
            ChunkAddr::Chunk32 => {
                let s = self.u32("chunk addr")?;
                let e = self.u32("chunk addr")?;
                if s > e {
                    return Ok(Vec::new());
                }
                Ok(chunk_range_to_bins(s as u64, e as u64))
            }
            ChunkAddr::Byte64 | ChunkAddr::Bin64 | ChunkAddr::Chunk64 => {
                Err(ProtocolError::Unsupported)
            }
        }
    }

    pub fn pex_addr_v4(&mut self) -> Result<SocketAddr, ProtocolError> {
        let octets = self.bytes(4, "pex v4")?;
        let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        let port = self.u16("pex v4 port")?;
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    }

    pub fn pex_addr_v6(&mut self) -> Result<SocketAddr, ProtocolError> {
        let octets = self.bytes(16, "pex v6")?;
        let arr: [u8; 16] = octets.try_into().unwrap();
        let ip = Ipv6Addr::from(arr);
        let port = self.u16("pex v6 port")?;
        Ok(SocketAddr::new(IpAddr::V6(ip), port))
    }
}

/*
 * Bin32 encoding helpers
 */

const BIN32_NONE: u32 = u32::MAX;

pub fn bin_to_u32(bin: Bin) -> u32 {
    if bin.is_none() || bin.to_u64() > BIN32_NONE as u64 {
        BIN32_NONE
    } else {
        bin.to_u64() as u32
    }
}

pub fn bin_from_u32(v: u32) -> Bin {
    if v == BIN32_NONE {
        Bin::NONE
    } else {
        Bin::from_u64(v as u64)
    }
}

/// Decompose the inclusive chunk interval [start, end] into the minimal
/// ordered set of complete subtrees covering it.
pub fn chunk_range_to_bins(start: u64, end: u64) -> Vec<Bin> {
    let s = Bin::chunk(start);
    let e = Bin::chunk(end);
    let mut out = Vec::new();
    let mut cur = s;
    loop {
        // Climb until the parent would poke out of [start, end]; the node
        // below the overshoot belongs to the cover.
        if cur.parent().base_left() < s || cur.parent().base_right() > e {
            out.push(cur);
            cur = if cur.parent().base_left() < s {
                Bin::chunk(cur.parent().base_right().layer_offset() + 1)
            } else {
                Bin::chunk(cur.base_right().layer_offset() + 1)
            };
            if cur >= e {
                if cur == e {
                    out.push(e);
                }
                break;
            }
        } else {
            cur = cur.parent();
        }
    }
    out
}

/// Base bins covered by `orig` but not by `cancel` (which `orig` covers).
pub fn bin_fragment(orig: Bin, cancel: Bin) -> Vec<Bin> {
    let mut out = Vec::new();
    let mut cur = orig.base_left();
    while cur < cancel.base_left() {
        out.push(cur);
        cur = Bin::chunk(cur.base_offset() + 1);
    }
    let mut cur = Bin::chunk(cancel.base_right().base_offset() + 1);
    while cur <= orig.base_right() {
        out.push(cur);
        cur = Bin::chunk(cur.base_offset() + 1);
    }
    out
}

/*
 * Handshake encode / decode
 */

/// Append a HANDSHAKE message. `encoded_channel` is the scrambled local
/// channel id (zero for an explicit close). The swarm id travels only in
/// the initiating handshake.
pub fn write_handshake(
    w: &mut DgramWriter,
    encoded_channel: u32,
    hs: &Handshake,
    swarm_id: Option<&[u8]>,
    is_live: bool,
    root_hash: Option<&Sha1Hash>,
) {
    if hs.version == Version::Legacy {
        if let Some(rh) = root_hash {
            // Legacy initiating handshake leads with the root hash.
            w.u8(MsgId::Integrity as u8);
            w.u32(bin_to_u32(Bin::ALL));
            w.hash(rh);
        }
        w.u8(MsgId::Handshake as u8);
        w.u32(encoded_channel);
        return;
    }

    w.u8(MsgId::Handshake as u8);
    w.u32(encoded_channel);
    if encoded_channel != 0 {
        w.u8(POPT_VERSION);
        w.u8(hs.version as u8);
        w.u8(POPT_MIN_VERSION);
        w.u8(hs.min_version as u8);
        if let Some(sid) = swarm_id {
            w.u8(POPT_SWARMID);
            w.u16(sid.len() as u16);
            w.bytes(sid);
        }
        w.u8(POPT_CONT_INT_PROT);
        w.u8(hs.cont_int_prot as u8);
        if hs.cont_int_prot == ContentIntegrity::Merkle {
            w.u8(POPT_MERKLE_HASH_FUNC);
            w.u8(hs.merkle_func as u8);
        }
        if is_live && hs.cont_int_prot != ContentIntegrity::None {
            w.u8(POPT_LIVE_SIG_ALG);
            w.u8(hs.live_sig_alg);
        }
        w.u8(POPT_CHUNK_ADDR);
        w.u8(hs.chunk_addr as u8);
        if is_live {
            w.u8(POPT_LIVE_DISC_WND);
            match hs.chunk_addr {
                ChunkAddr::Bin32 | ChunkAddr::Chunk32 => w.u32(hs.live_disc_wnd as u32),
                _ => w.u64(hs.live_disc_wnd),
            }
        }
    }
    w.u8(POPT_END);
}

/// Parse a HANDSHAKE whose leading message id has already been consumed
/// (or identified as legacy INTEGRITY). `version` carries the dialect when
/// it is already known for this channel.
pub fn read_handshake(
    r: &mut DgramReader<'_>,
    version: Option<Version>,
    first_msg: MsgId,
) -> Result<Handshake, ProtocolError> {
    let ver = match version {
        Some(v) => v,
        None => match first_msg {
            MsgId::Integrity => Version::Legacy,
            MsgId::Handshake => Version::Ppspv1,
            _ => return Err(ProtocolError::UnknownMessage(first_msg as u8)),
        },
    };

    let mut hs = Handshake::default();
    if ver == Version::Legacy {
        hs.reset_to_legacy();
        if first_msg == MsgId::Integrity {
            // Initiating legacy handshake: INTEGRITY(ALL, root) + HANDSHAKE.
            let pos = bin_from_u32(r.u32("legacy root bin")?);
            if !pos.is_all() {
                return Err(ProtocolError::BadOption("legacy root bin"));
            }
            let root = r.hash("legacy root hash")?;
            hs.swarm_id = Some(root.0.to_vec());
            let msg = r.u8("legacy handshake id")?;
            if msg != MsgId::Handshake as u8 {
                return Err(ProtocolError::UnknownMessage(msg));
            }
        }
        hs.peer_channel_id = r.u32("legacy channel id")?;
        return Ok(hs);
    }

    hs.peer_channel_id = r.u32("handshake channel id")?;
    loop {
        let popt = r.u8("protocol option")?;
        match popt {
            POPT_VERSION => {
                hs.version = match r.u8("version")? {
                    0 => Version::Legacy,
                    1 => Version::Ppspv1,
                    _ => return Err(ProtocolError::BadOption("version")),
                };
            }
            POPT_MIN_VERSION => {
                hs.min_version = match r.u8("min version")? {
                    0 => Version::Legacy,
                    1 => Version::Ppspv1,
                    _ => return Err(ProtocolError::BadOption("min version")),
                };
            }
            POPT_SWARMID => {
                let len = r.u16("swarm id size")? as usize;
                if len > MAX_SWARMID_SIZE {
                    return Err(ProtocolError::BadOption("swarm id size"));
                }
                hs.swarm_id = Some(r.bytes(len, "swarm id")?.to_vec());
            }
            POPT_CONT_INT_PROT => {
                hs.cont_int_prot = ContentIntegrity::from_u8(r.u8("cont int prot")?)
                    .ok_or(ProtocolError::BadOption("cont int prot"))?;
            }
            POPT_MERKLE_HASH_FUNC => {
                hs.merkle_func = MerkleHashFunc::from_u8(r.u8("merkle hash func")?)
                    .ok_or(ProtocolError::BadOption("merkle hash func"))?;
            }
            POPT_LIVE_SIG_ALG => {
                hs.live_sig_alg = r.u8("live sig alg")?;
            }
            POPT_CHUNK_ADDR => {
                hs.chunk_addr = ChunkAddr::from_u8(r.u8("chunk addr")?)
                    .ok_or(ProtocolError::BadOption("chunk addr"))?;
            }
            POPT_LIVE_DISC_WND => {
                hs.live_disc_wnd = match hs.chunk_addr {
                    ChunkAddr::Bin32 | ChunkAddr::Chunk32 => r.u32("live disc wnd")? as u64,
                    _ => r.u64("live disc wnd")?,
                };
            }
            POPT_SUPP_MSGS => {
                let len = r.u8("supp msgs size")? as usize;
                if len > 8 {
                    return Err(ProtocolError::BadOption("supp msgs size"));
                }
                let _ = r.bytes(len, "supp msgs")?;
            }
            POPT_END => break,
            _ => return Err(ProtocolError::BadOption("unknown option")),
        }
    }
    Ok(hs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_range_decomposition() {
        // The canonical (5, 25) cover, in order, each chunk exactly once.
        let bins = chunk_range_to_bins(5, 25);
        assert_eq!(
            bins,
            vec![
                Bin::new(0, 5),
                Bin::new(1, 3),
                Bin::new(3, 1),
                Bin::new(3, 2),
                Bin::new(1, 12),
            ]
        );
        let mut covered = Vec::new();
        for b in &bins {
            for c in b.base_offset()..b.base_offset() + b.base_length() {
                covered.push(c);
            }
        }
        covered.sort_unstable();
        assert_eq!(covered, (5..=25).collect::<Vec<_>>());
    }

    #[test]
    fn test_chunk_range_fuzz_covers_exactly() {
        for s in 0..40u64 {
            for e in s..s + 70 {
                let bins = chunk_range_to_bins(s, e);
                let mut covered = Vec::new();
                for b in &bins {
                    assert!(b.base_offset() >= s && b.base_right().base_offset() <= e);
                    for c in b.base_offset()..b.base_offset() + b.base_length() {
                        covered.push(c);
                    }
                }
                covered.sort_unstable();
                assert_eq!(covered, (s..=e).collect::<Vec<_>>(), "range {s}..={e}");
            }
        }
    }

    #[test]
    fn test_bin_fragment() {
        let orig = Bin::new(2, 0);
        let cancel = Bin::new(1, 1);
        assert_eq!(
            bin_fragment(orig, cancel),
            vec![Bin::chunk(0), Bin::chunk(1)]
        );
    }

    #[test]
    fn test_chunk32_codec_roundtrip() {
        let mut w = DgramWriter::new();
        w.chunk_addr(Bin::new(2, 3), ChunkAddr::Chunk32);
        let bytes = w.into_bytes();
        let mut r = DgramReader::new(&bytes);
        let bins = r.chunk_addr(ChunkAddr::Chunk32).unwrap();
        assert_eq!(bins, vec![Bin::new(2, 3)]);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake {
            peer_channel_id: 0,
            live_disc_wnd: 1000,
            ..Handshake::default()
        };
        let sid = vec![0xAB; 20];
        let mut w = DgramWriter::new();
        write_handshake(&mut w, 0x1234_5678, &hs, Some(&sid), true, None);
        let bytes = w.into_bytes();
        let mut r = DgramReader::new(&bytes);
        let msg = MsgId::from_u8(r.u8("id").unwrap()).unwrap();
        assert_eq!(msg, MsgId::Handshake);
        let got = read_handshake(&mut r, None, msg).unwrap();
        assert_eq!(got.peer_channel_id, 0x1234_5678);
        assert_eq!(got.swarm_id.as_deref(), Some(&sid[..]));
        assert_eq!(got.live_disc_wnd, 1000);
        assert_eq!(got.chunk_addr, ChunkAddr::Chunk32);
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_message_is_protocol_error() {
        let bytes = [MsgId::Have as u8, 0, 0];
        let mut r = DgramReader::new(&bytes);
        let _ = r.u8("id").unwrap();
        assert!(matches!(
            r.chunk_addr(ChunkAddr::Chunk32),
            Err(ProtocolError::Truncated(_))
        ));
    }

    #[test]
    fn test_legacy_handshake_decode() {
        let root = Sha1Hash::from_bytes_digest(b"swarm");
        let mut w = DgramWriter::new();
        let mut hs = Handshake::default();
        hs.reset_to_legacy();
        write_handshake(&mut w, 77, &hs, None, false, Some(&root));
        let bytes = w.into_bytes();
        let mut r = DgramReader::new(&bytes);
        let msg = MsgId::from_u8(r.u8("id").unwrap()).unwrap();
        assert_eq!(msg, MsgId::Integrity);
        let got = read_handshake(&mut r, None, msg).unwrap();
        assert_eq!(got.version, Version::Legacy);
        assert_eq!(got.peer_channel_id, 77);
        assert_eq!(got.swarm_id.as_deref(), Some(&root.0[..]));
    }
}
