//! `tswift://` swarm URIs.
//!
//! `tswift://<tracker>/<swarm-id-hex>[/<filename>][?k=v&…]` — the query
//! keys carry the swarm metadata a joining peer needs before the first
//! handshake (protocol options, chunk size, content length, and so on).

use crate::hashtree::DEFAULT_CHUNK_SIZE;
use crate::net::wire::{ChunkAddr, ContentIntegrity, MerkleHashFunc, Version, LIVE_DISC_WND_ALL};
use crate::swarm::SwarmId;

use std::collections::HashMap;
use std::net::SocketAddr;

pub const URI_SCHEME: &str = "tswift";

/// Metadata of a swarm as carried in its URI.
#[derive(Debug, Clone)]
pub struct SwarmMeta {
    pub version: Version,
    pub cont_int_prot: ContentIntegrity,
    pub merkle_func: MerkleHashFunc,
    pub live_sig_alg: u8,
    pub chunk_addr: ChunkAddr,
    pub live_disc_wnd: u64,
    pub chunk_size: u32,
    /// Content length in bytes, when advertised.
    pub cont_len: Option<u64>,
    /// Duration in seconds; -1 flags a live stream.
    pub cont_dur: Option<i64>,
    pub ext_tracker_url: Option<String>,
    pub mime_type: Option<String>,
    /// Injector (live source) address.
    pub injector_addr: Option<SocketAddr>,
    pub bt_tracker_url: Option<String>,
}

impl Default for SwarmMeta {
    fn default() -> SwarmMeta {
        SwarmMeta {
            version: Version::Ppspv1,
            cont_int_prot: ContentIntegrity::Merkle,
            merkle_func: MerkleHashFunc::Sha1,
            live_sig_alg: crate::livesig::DEFAULT_LIVE_SIG_ALG as u8,
            chunk_addr: ChunkAddr::Chunk32,
            live_disc_wnd: LIVE_DISC_WND_ALL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cont_len: None,
            cont_dur: None,
            ext_tracker_url: None,
            mime_type: None,
            injector_addr: None,
            bt_tracker_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwarmUri {
    pub tracker: String,
    pub swarm_id: SwarmId,
    pub filename: Option<String>,
    pub meta: SwarmMeta,
}

impl SwarmUri {
    /// Parse a swarm URI; `None` on anything malformed.
    pub fn parse(uri: &str) -> Option<SwarmUri> {
        let rest = uri.strip_prefix(URI_SCHEME)?.strip_prefix("://")?;
        let (body, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };
        let mut parts = body.splitn(3, '/');
        let tracker = parts.next()?.to_string();
        let idhex = parts.next()?;
        let swarm_id = SwarmId::from_hex(idhex)?;
        let filename = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

        let mut meta = SwarmMeta::default();
        if swarm_id.is_live() {
            meta.cont_int_prot = ContentIntegrity::UnifiedMerkle;
            meta.cont_dur = Some(-1);
        }
        if let Some(q) = query {
            let kv: HashMap<&str, &str> = q
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .collect();
            apply_query(&mut meta, &kv)?;
        }
        Some(SwarmUri {
            tracker,
            swarm_id,
            filename,
            meta,
        })
    }

    /// Compose the URI back out of its parts.
    pub fn to_uri(&self) -> String {
        let mut s = format!("{}://{}/{}", URI_SCHEME, self.tracker, self.swarm_id.hex());
        if let Some(f) = &self.filename {
            s.push('/');
            s.push_str(f);
        }
        let mut q: Vec<String> = Vec::new();
        let d = SwarmMeta::default();
        if self.meta.chunk_size != d.chunk_size {
            q.push(format!("cs={}", self.meta.chunk_size));
        }
        if let Some(len) = self.meta.cont_len {
            q.push(format!("cl={len}"));
        }
        if let Some(dur) = self.meta.cont_dur {
            q.push(format!("cd={dur}"));
        }
        if self.meta.live_disc_wnd != d.live_disc_wnd {
            q.push(format!("ld={}", self.meta.live_disc_wnd));
        }
        if let Some(et) = &self.meta.ext_tracker_url {
            q.push(format!("et={et}"));
        }
        if let Some(mt) = &self.meta.mime_type {
            q.push(format!("mt={mt}"));
        }
        if let Some(ia) = &self.meta.injector_addr {
            q.push(format!("ia={ia}"));
        }
        if let Some(bt) = &self.meta.bt_tracker_url {
            q.push(format!("bt={bt}"));
        }
        if !q.is_empty() {
            s.push('?');
            s.push_str(&q.join("&"));
        }
        s
    }
}

fn apply_query(meta: &mut SwarmMeta, kv: &HashMap<&str, &str>) -> Option<()> {
    if let Some(v) = kv.get("v") {
        meta.version = match v.parse::<u8>().ok()? {
            0 => Version::Legacy,
            1 => Version::Ppspv1,
            _ => return None,
        };
    }
    if let Some(v) = kv.get("cp") {
        meta.cont_int_prot = match v.parse::<u8>().ok()? {
            0 => ContentIntegrity::None,
            1 => ContentIntegrity::Merkle,
            2 => ContentIntegrity::SignAll,
            3 => ContentIntegrity::UnifiedMerkle,
            _ => return None,
        };
    }
    if let Some(v) = kv.get("hf") {
        meta.merkle_func = match v.parse::<u8>().ok()? {
            0 => MerkleHashFunc::Sha1,
            1 => MerkleHashFunc::Sha224,
            2 => MerkleHashFunc::Sha256,
            3 => MerkleHashFunc::Sha384,
            4 => MerkleHashFunc::Sha512,
            _ => return None,
        };
    }
    if let Some(v) = kv.get("ls") {
        meta.live_sig_alg = v.parse().ok()?;
    }
    if let Some(v) = kv.get("ca") {
        meta.chunk_addr = match v.parse::<u8>().ok()? {
            0 => ChunkAddr::Bin32,
            1 => ChunkAddr::Byte64,
            2 => ChunkAddr::Chunk32,
            3 => ChunkAddr::Bin64,
            4 => ChunkAddr::Chunk64,
            _ => return None,
        };
    }
    if let Some(v) = kv.get("ld") {
        meta.live_disc_wnd = v.parse().ok()?;
    }
    if let Some(v) = kv.get("cs") {
        meta.chunk_size = v.parse().ok()?;
    }
    if let Some(v) = kv.get("cl") {
        meta.cont_len = Some(v.parse().ok()?);
    }
    if let Some(v) = kv.get("cd") {
        meta.cont_dur = Some(v.parse().ok()?);
    }
    if let Some(v) = kv.get("et") {
        meta.ext_tracker_url = Some((*v).to_string());
    }
    if let Some(v) = kv.get("mt") {
        meta.mime_type = Some((*v).to_string());
    }
    if let Some(v) = kv.get("ia") {
        meta.injector_addr = Some(v.parse().ok()?);
    }
    if let Some(v) = kv.get("bt") {
        meta.bt_tracker_url = Some((*v).to_string());
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtree::Sha1Hash;

    #[test]
    fn test_parse_minimal() {
        let id = SwarmId::File(Sha1Hash::from_bytes_digest(b"x"));
        let uri = format!("tswift://tracker.example.org:20000/{}", id.hex());
        let parsed = SwarmUri::parse(&uri).unwrap();
        assert_eq!(parsed.tracker, "tracker.example.org:20000");
        assert_eq!(parsed.swarm_id, id);
        assert!(parsed.filename.is_none());
        assert_eq!(parsed.meta.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_parse_full() {
        let id = SwarmId::File(Sha1Hash::from_bytes_digest(b"y"));
        let uri = format!(
            "tswift://t.example/{}/video.ogv?cs=1024&cl=4100&cd=0&mt=video/ogg&ia=10.0.0.1:6778",
            id.hex()
        );
        let parsed = SwarmUri::parse(&uri).unwrap();
        assert_eq!(parsed.filename.as_deref(), Some("video.ogv"));
        assert_eq!(parsed.meta.chunk_size, 1024);
        assert_eq!(parsed.meta.cont_len, Some(4100));
        assert_eq!(parsed.meta.mime_type.as_deref(), Some("video/ogg"));
        assert_eq!(
            parsed.meta.injector_addr,
            Some("10.0.0.1:6778".parse().unwrap())
        );
        // And back out.
        let re = SwarmUri::parse(&parsed.to_uri()).unwrap();
        assert_eq!(re.meta.chunk_size, 1024);
        assert_eq!(re.meta.cont_len, Some(4100));
    }

    #[test]
    fn test_reject_garbage() {
        assert!(SwarmUri::parse("http://x/deadbeef").is_none());
        assert!(SwarmUri::parse("tswift://x/nothex").is_none());
    }
}
