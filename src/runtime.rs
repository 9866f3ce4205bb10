//! The runtime: socket ownership, transfer table, datagram dispatch and
//! the public API of the library.
//!
//! One `Runtime` value owns everything; all mutation happens on the task
//! driving `run` (or whoever calls `handle_datagram`/`tick` in tests), so
//! the protocol core needs no locks. Transfers are addressed by integer
//! descriptors, channels by their swarm-wide ids; the dispatcher maps the
//! leading channel id of a datagram back to its transfer, and treats
//! channel id zero as an incoming handshake.

use crate::bin::Bin;
use crate::error::{StorageError, SwiftError};
use crate::hashtree::{HashTree, DEFAULT_CHUNK_SIZE};
use crate::livesig::KeyPair;
use crate::livetree::{LiveHashTree, DEFAULT_CHUNKS_PER_SIGN};
use crate::net::wire::{
    self, ContentIntegrity, DgramReader, Handshake, MsgId, LIVE_DISC_WND_ALL, MAX_RECV_DGRAM_SIZE,
};
use crate::picker::{LivePicker, PiecePicker, RarestFirstPicker, SeqPicker};
use crate::storage::Storage;
use crate::swarm::SwarmId;
use crate::transfer::{Content, Direction, ProgressCallback, Transfer, MAX_INCOMING_CONNECTIONS};
use crate::time::{Tint, TINT_NEVER, TINT_SEC};

use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Piece-picking strategy for file swarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickerKind {
    #[default]
    Sequential,
    RarestFirst,
}

/// Options for `Runtime::open`.
#[derive(Default)]
pub struct OpenOptions {
    pub tracker_url: Option<String>,
    /// Re-hash the file on disk even when sidecars exist.
    pub force_check: bool,
    pub cipm: Option<ContentIntegrity>,
    pub zero_state: bool,
    pub chunk_size: Option<u32>,
    pub picker: PickerKind,
}

/// Options for `Runtime::live_open` / `Runtime::live_create`.
pub struct LiveOptions {
    pub tracker_url: Option<String>,
    pub source_addr: Option<SocketAddr>,
    pub cipm: ContentIntegrity,
    pub disc_wnd: u64,
    pub chunks_per_sign: u32,
    pub chunk_size: u32,
    pub checkpoint_file: Option<PathBuf>,
}

impl Default for LiveOptions {
    fn default() -> LiveOptions {
        LiveOptions {
            tracker_url: None,
            source_addr: None,
            cipm: ContentIntegrity::UnifiedMerkle,
            disc_wnd: LIVE_DISC_WND_ALL,
            chunks_per_sign: DEFAULT_CHUNKS_PER_SIGN,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checkpoint_file: None,
        }
    }
}

pub struct Runtime {
    epoch: Instant,
    /// XOR key scrambling channel ids on the wire, fixed per process run.
    scramble: u32,
    sockets: Vec<Arc<UdpSocket>>,
    local_port: u16,
    transfers: HashMap<u32, Transfer>,
    /// channel id -> td owning it.
    channel_index: HashMap<u32, u32>,
    next_td: u32,
    next_channel_id: u32,
    /// Content-addressed directory served on demand in zero-state mode.
    zero_state_dir: Option<PathBuf>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Runtime {
        let mut rng = rand::thread_rng();
        Runtime {
            epoch: Instant::now(),
            scramble: rng.gen(),
            sockets: Vec::new(),
            local_port: 0,
            transfers: HashMap::new(),
            channel_index: HashMap::new(),
            next_td: 1,
            next_channel_id: 1,
            zero_state_dir: None,
        }
    }

    /// Monotonic protocol time; starts one second in so zero stays a
    /// usable "never happened" sentinel.
    pub fn now(&self) -> Tint {
        self.epoch.elapsed().as_micros() as Tint + TINT_SEC
    }

    /// Bind a UDP socket; the first one becomes the default for sends.
    pub async fn listen(&mut self, addr: SocketAddr) -> Result<usize, SwiftError> {
        let sock = UdpSocket::bind(addr).await.map_err(SwiftError::Io)?;
        let local = sock.local_addr().map_err(SwiftError::Io)?;
        info!(%local, "listening");
        if self.sockets.is_empty() {
            self.local_port = local.port();
        }
        self.sockets.push(Arc::new(sock));
        Ok(self.sockets.len() - 1)
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.sockets.first().and_then(|s| s.local_addr().ok())
    }

    /// Serve content-addressed files from `dir` on demand, without keeping
    /// their state in memory (zero-state mode).
    pub fn set_zero_state_dir(&mut self, dir: PathBuf) {
        self.zero_state_dir = Some(dir);
    }

    fn alloc_td(&mut self) -> u32 {
        let td = self.next_td;
        self.next_td += 1;
        td
    }

    fn alloc_channel_id(&mut self) -> u32 {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        id
    }

    fn transfer(&self, td: u32) -> Result<&Transfer, SwiftError> {
        self.transfers.get(&td).ok_or(SwiftError::NotFound)
    }

    fn transfer_mut(&mut self, td: u32) -> Result<&mut Transfer, SwiftError> {
        self.transfers.get_mut(&td).ok_or(SwiftError::NotFound)
    }

    pub fn find_by_swarm_id(&self, id: &SwarmId) -> Option<u32> {
        self.transfers
            .values()
            .find(|t| t.swarm_id() == id)
            .map(|t| t.td)
    }

    /*
     * Opening transfers
     */

    /// Open a static swarm backed by `filename`. With a known `swarm_id`
    /// the transfer starts cold when the file is absent; without one the
    /// file is hashed and becomes the swarm.
    pub fn open(
        &mut self,
        filename: &Path,
        swarm_id: Option<SwarmId>,
        opts: OpenOptions,
    ) -> Result<u32, SwiftError> {
        let now = self.now();
        let chunk_size = opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let dest_dir = filename
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mhash = sidecar(filename, "mhash");
        let mbinmap = sidecar(filename, "mbinmap");

        let root = match &swarm_id {
            Some(SwarmId::File(h)) => Some(*h),
            Some(SwarmId::Live(_)) => return Err(SwiftError::NotFound),
            None => None,
        };

        if opts.zero_state {
            let root = root.ok_or(SwiftError::NotFound)?;
            let tree = HashTree::open_zero_state(&root, chunk_size, &mhash, &mbinmap)
                .ok_or(SwiftError::NotFound)?;
            return self.install_file_transfer(
                filename, &dest_dir, tree, true, opts, chunk_size, now,
            );
        }

        let mut storage = Storage::open(filename, &dest_dir, 0)?;
        let file_size = storage.physical_size();

        let tree = if let (false, Some(root)) = (opts.force_check, root.as_ref()) {
            HashTree::load_checkpoint(root, chunk_size, &mhash, &mbinmap)
        } else {
            None
        };
        let tree = match tree {
            Some(t) => t,
            None if file_size > 0 => {
                let t = HashTree::create_from_storage(&mut storage, file_size, chunk_size)?;
                if let Some(expect) = root {
                    if *t.root_hash() != expect {
                        warn!(got = %t.root_hash(), want = %expect, "root hash mismatch");
                        return Err(SwiftError::Integrity);
                    }
                }
                t
            }
            None => {
                // Cold leecher: needs the root hash to bootstrap trust.
                let root = root.ok_or(SwiftError::NotFound)?;
                HashTree::new_client(root, chunk_size)
            }
        };

        let sid = SwarmId::File(*tree.root_hash());
        if self.find_by_swarm_id(&sid).is_some() {
            // One instance per swarm; sidecars cannot be shared.
            return Err(SwiftError::DuplicateChannel);
        }
        let td = self.alloc_td();
        let picker: Box<dyn PiecePicker + Send> = match opts.picker {
            PickerKind::Sequential => Box::new(SeqPicker::new()),
            PickerKind::RarestFirst => Box::new(RarestFirstPicker::new()),
        };
        let mut picker = picker;
        picker.randomize(rand::thread_rng().gen::<u64>() & 63);

        let mut hs = Handshake {
            cont_int_prot: opts.cipm.unwrap_or(ContentIntegrity::Merkle),
            ..Handshake::default()
        };
        hs.live_disc_wnd = LIVE_DISC_WND_ALL;
        let content = Content::File {
            hashtree: tree,
            avail: crate::avail::Availability::new(crate::transfer::MAX_OUTGOING_CONNECTIONS),
            zero_state: false,
        };
        let mut t = Transfer::new(
            td,
            sid,
            content,
            storage,
            Some(picker),
            hs,
            self.scramble,
            self.local_port,
            now,
        );
        t.set_sidecar_paths(mhash, mbinmap);
        t.set_tracker(opts.tracker_url);
        info!(td, swarm = %t.swarm_id(), "transfer open");
        self.transfers.insert(td, t);
        Ok(td)
    }

    fn install_file_transfer(
        &mut self,
        filename: &Path,
        dest_dir: &Path,
        tree: HashTree,
        zero_state: bool,
        opts: OpenOptions,
        _chunk_size: u32,
        now: Tint,
    ) -> Result<u32, SwiftError> {
        let sid = SwarmId::File(*tree.root_hash());
        if self.find_by_swarm_id(&sid).is_some() {
            return Err(SwiftError::DuplicateChannel);
        }
        let storage = Storage::open(filename, dest_dir, 0)?;
        let td = self.alloc_td();
        let hs = Handshake {
            cont_int_prot: opts.cipm.unwrap_or(ContentIntegrity::Merkle),
            ..Handshake::default()
        };
        let content = Content::File {
            hashtree: tree,
            avail: crate::avail::Availability::new(crate::transfer::MAX_OUTGOING_CONNECTIONS),
            zero_state,
        };
        let mut t = Transfer::new(
            td,
            sid,
            content,
            storage,
            None,
            hs,
            self.scramble,
            self.local_port,
            now,
        );
        t.set_sidecar_paths(sidecar(filename, "mhash"), sidecar(filename, "mbinmap"));
        t.set_tracker(opts.tracker_url);
        info!(td, swarm = %t.swarm_id(), zero_state, "transfer open");
        self.transfers.insert(td, t);
        Ok(td)
    }

    /// Create a live swarm as its source.
    pub fn live_create(
        &mut self,
        filename: &Path,
        keypair: KeyPair,
        opts: LiveOptions,
    ) -> Result<u32, SwiftError> {
        let now = self.now();
        let dest_dir = parent_dir(filename);
        let wrap_bytes = if opts.disc_wnd == LIVE_DISC_WND_ALL {
            0
        } else {
            opts.disc_wnd * opts.chunk_size as u64
        };
        let storage = Storage::open(filename, &dest_dir, wrap_bytes)?;
        let tree = LiveHashTree::new_source(keypair, opts.chunk_size, opts.chunks_per_sign);
        let sid = SwarmId::Live(tree.pubkey().clone());
        let td = self.alloc_td();
        let hs = Handshake {
            cont_int_prot: opts.cipm,
            live_disc_wnd: opts.disc_wnd,
            ..Handshake::default()
        };
        let content = Content::Live {
            tree,
            source_addr: None,
            checkpoint_path: opts.checkpoint_file,
        };
        let mut t = Transfer::new(
            td,
            sid,
            content,
            storage,
            None,
            hs,
            self.scramble,
            self.local_port,
            now,
        );
        t.set_tracker(opts.tracker_url);
        info!(td, swarm = %t.swarm_id(), "live source open");
        self.transfers.insert(td, t);
        Ok(td)
    }

    /// Join a live swarm as a client.
    pub fn live_open(
        &mut self,
        filename: &Path,
        swarm_id: SwarmId,
        opts: LiveOptions,
    ) -> Result<u32, SwiftError> {
        let now = self.now();
        let SwarmId::Live(pubkey) = &swarm_id else {
            return Err(SwiftError::NotFound);
        };
        if self.find_by_swarm_id(&swarm_id).is_some() {
            return Err(SwiftError::DuplicateChannel);
        }
        let dest_dir = parent_dir(filename);
        let wrap_bytes = if opts.disc_wnd == LIVE_DISC_WND_ALL {
            0
        } else {
            opts.disc_wnd * opts.chunk_size as u64
        };
        let storage = Storage::open(filename, &dest_dir, wrap_bytes)?;
        let tree = LiveHashTree::new_client(pubkey.clone(), opts.chunk_size, opts.chunks_per_sign);
        let td = self.alloc_td();
        let hs = Handshake {
            cont_int_prot: opts.cipm,
            live_disc_wnd: opts.disc_wnd,
            ..Handshake::default()
        };
        let content = Content::Live {
            tree,
            source_addr: opts.source_addr,
            checkpoint_path: None,
        };
        let mut t = Transfer::new(
            td,
            swarm_id,
            content,
            storage,
            Some(Box::new(LivePicker::new(true))),
            hs,
            self.scramble,
            self.local_port,
            now,
        );
        t.set_tracker(opts.tracker_url);
        info!(td, swarm = %t.swarm_id(), "live client open");
        let source = opts.source_addr;
        self.transfers.insert(td, t);
        if let Some(addr) = source {
            self.add_peer(td, addr)?;
        }
        Ok(td)
    }

    /// Source: push live bytes into the swarm.
    pub fn live_write(&mut self, td: u32, buf: &[u8]) -> Result<usize, SwiftError> {
        let now = self.now();
        let t = self.transfer_mut(td)?;
        let n = t.live_write(buf, now)?;
        t.pump(now);
        Ok(n)
    }

    /*
     * Content access
     */

    pub fn read(&mut self, td: u32, buf: &mut [u8], offset: u64) -> Result<usize, SwiftError> {
        let t = self.transfer_mut(td)?;
        let avail = t.seq_complete(offset);
        if avail == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(avail) as usize;
        Ok(t.storage.read(&mut buf[..want], offset)?)
    }

    pub fn write(&mut self, td: u32, buf: &[u8], offset: u64) -> Result<usize, SwiftError> {
        let t = self.transfer_mut(td)?;
        if t.is_zero_state() {
            return Err(StorageError::NotReady.into());
        }
        Ok(t.storage.write(buf, offset)?)
    }

    /// Move the interest window for streaming playback. Fails when the
    /// transfer's picker has no seek notion (plain sequential download).
    pub fn seek(&mut self, td: u32, offset: u64) -> Result<u64, SwiftError> {
        let t = self.transfer_mut(td)?;
        let chunk_size = t.chunk_size() as u64;
        if t.size() != 0 && offset >= t.size() {
            return Err(StorageError::OutOfRange(offset).into());
        }
        if !t.seek_picker(Bin::chunk(offset / chunk_size)) {
            return Err(SwiftError::NotFound);
        }
        Ok(offset)
    }

    pub fn size(&self, td: u32) -> Result<u64, SwiftError> {
        Ok(self.transfer(td)?.size())
    }

    pub fn complete(&self, td: u32) -> Result<u64, SwiftError> {
        Ok(self.transfer(td)?.complete())
    }

    pub fn is_complete(&self, td: u32) -> Result<bool, SwiftError> {
        Ok(self.transfer(td)?.is_complete())
    }

    pub fn seq_complete(&self, td: u32, offset: u64) -> Result<u64, SwiftError> {
        Ok(self.transfer(td)?.seq_complete(offset))
    }

    pub fn chunk_size(&self, td: u32) -> Result<u32, SwiftError> {
        Ok(self.transfer(td)?.chunk_size())
    }

    pub fn get_swarm_id(&self, td: u32) -> Result<SwarmId, SwiftError> {
        Ok(self.transfer(td)?.swarm_id().clone())
    }

    pub fn transfer_descriptors(&self) -> Vec<u32> {
        self.transfers.keys().copied().collect()
    }

    pub fn num_seeders(&self, td: u32) -> Result<u32, SwiftError> {
        Ok(self.transfer(td)?.num_seeders())
    }

    pub fn num_leechers(&self, td: u32) -> Result<u32, SwiftError> {
        Ok(self.transfer(td)?.num_leechers())
    }

    pub fn set_max_speed(&mut self, td: u32, dir: Direction, bps: f64) -> Result<(), SwiftError> {
        self.transfer_mut(td)?.set_max_speed(dir, bps);
        Ok(())
    }

    pub fn current_speed(&mut self, td: u32, dir: Direction) -> Result<f64, SwiftError> {
        let now = self.now();
        Ok(self.transfer_mut(td)?.current_speed(dir, now))
    }

    pub fn add_progress_callback(
        &mut self,
        td: u32,
        cb: ProgressCallback,
        agg_layer: u8,
    ) -> Result<u64, SwiftError> {
        Ok(self.transfer_mut(td)?.add_progress_callback(cb, agg_layer))
    }

    pub fn remove_progress_callback(&mut self, td: u32, id: u64) -> Result<(), SwiftError> {
        self.transfer_mut(td)?.remove_progress_callback(id);
        Ok(())
    }

    pub fn checkpoint(&self, td: u32) -> Result<(), SwiftError> {
        self.transfer(td)?.checkpoint()
    }

    /// Poll the tracker back-off gate: returns the tracker URL when the
    /// embedder's tracker client should (re)announce this swarm now.
    pub fn tracker_due(&mut self, td: u32) -> Result<Option<String>, SwiftError> {
        let now = self.now();
        let t = self.transfer_mut(td)?;
        let moving = t.current_speed(Direction::Download, now) > 0.0
            || t.current_speed(Direction::Upload, now) > 0.0;
        if t.tracker_reconnect_if_allowed(moving, now) {
            Ok(t.tracker_url().map(str::to_string))
        } else {
            Ok(None)
        }
    }

    /// Add a peer and fire the opening handshake immediately.
    pub fn add_peer(&mut self, td: u32, addr: SocketAddr) -> Result<(), SwiftError> {
        let now = self.now();
        let id = self.alloc_channel_id();
        let t = self.transfer_mut(td)?;
        if t.add_peer(id, addr, now).is_some() {
            self.channel_index.insert(id, td);
            let t = self.transfer_mut(td)?;
            t.send(id, now);
            self.flush(td);
        }
        Ok(())
    }

    /// Close a transfer; optionally scrub sidecars and content from disk.
    pub fn close(
        &mut self,
        td: u32,
        remove_state: bool,
        remove_content: bool,
    ) -> Result<(), SwiftError> {
        let now = self.now();
        let Some(mut t) = self.transfers.remove(&td) else {
            return Err(SwiftError::NotFound);
        };
        let ids: Vec<u32> = t.channels.keys().copied().collect();
        for id in ids {
            t.close_channel(id, true, now);
            self.channel_index.remove(&id);
        }
        for (addr, bytes) in t.outbox.drain(..) {
            self.send_to(addr, &bytes);
        }
        if remove_state {
            let _ = std::fs::remove_file(sidecar(t.storage.os_path(), "mhash"));
            let _ = std::fs::remove_file(sidecar(t.storage.os_path(), "mbinmap"));
        }
        if remove_content {
            let _ = t.storage.remove_content();
        }
        info!(td, "transfer closed");
        Ok(())
    }

    /*
     * Dispatch
     */

    /// Demultiplex one received datagram.
    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Tint) {
        if data.len() < 4 {
            debug!(%from, len = data.len(), "runt datagram");
            return;
        }
        if data.len() > MAX_RECV_DGRAM_SIZE {
            debug!(%from, len = data.len(), "oversized datagram");
            return;
        }
        let mut r = DgramReader::new(data);
        let mych = r.channel_id().expect("length checked");
        let payload = &data[4..];

        if mych == 0 {
            self.handle_incoming_handshake(from, payload, now);
            return;
        }
        let id = mych ^ self.scramble;
        let Some(&td) = self.channel_index.get(&id) else {
            debug!(%from, id, "datagram for unknown channel");
            return;
        };
        let Some(t) = self.transfers.get_mut(&td) else {
            self.channel_index.remove(&id);
            return;
        };
        if !t.channels.contains_key(&id) {
            self.channel_index.remove(&id);
            return;
        }
        if let Some(ch) = t.channels.get_mut(&id) {
            ch.own_id_mentioned = true;
        }
        t.recv(id, payload, from, now);
        t.pump(now);
        self.flush(td);
    }

    /// A datagram with channel id zero: someone knocking with a handshake.
    fn handle_incoming_handshake(&mut self, from: SocketAddr, payload: &[u8], now: Tint) {
        // Peek the handshake for the swarm id.
        let mut r = DgramReader::new(payload);
        let first = match r.u8("message id").ok().and_then(MsgId::from_u8) {
            Some(m) => m,
            None => return,
        };
        let hs = match wire::read_handshake(&mut r, None, first) {
            Ok(hs) => hs,
            Err(e) => {
                debug!(%from, error = %e, "bad incoming handshake");
                return;
            }
        };
        if hs.peer_channel_id == 0 {
            return; // a stray close
        }
        let Some(sid) = hs.swarm_id.as_deref().and_then(SwarmId::from_bytes) else {
            debug!(%from, "handshake without swarm id");
            return;
        };
        let td = match self.find_by_swarm_id(&sid) {
            Some(td) => td,
            None => match self.open_zero_state_for(&sid) {
                Some(td) => td,
                None => {
                    // Strangers knocking for unknown swarms get no reply.
                    debug!(%from, swarm = %sid, "unknown swarm");
                    return;
                }
            },
        };
        let Some(t) = self.transfers.get_mut(&td) else {
            return;
        };
        if !t.is_operational() {
            return;
        }

        // Duplicate channel to the same address: reuse an unestablished
        // one, let an established one die out on its own.
        let mut ch_id = None;
        if let Some(existing) = t.find_channel_to(from, None) {
            let established = t
                .channels
                .get(&existing)
                .map(|c| c.is_established())
                .unwrap_or(false);
            if established {
                debug!(%from, "re-handshake on established channel; opening anew");
            } else {
                ch_id = Some(existing);
            }
        }
        let id = match ch_id {
            Some(id) => id,
            None => {
                if t.channels.len() >= MAX_INCOMING_CONNECTIONS {
                    warn!(%from, "too many connections");
                    return;
                }
                let id = self.alloc_channel_id();
                let t = self.transfers.get_mut(&td).expect("present");
                t.open_channel(id, from, now);
                self.channel_index.insert(id, td);
                id
            }
        };
        let t = self.transfers.get_mut(&td).expect("present");
        t.recv(id, payload, from, now);
        t.pump(now);
        self.flush(td);
    }

    /// Look for `<hex>.mhash`/`.mbinmap`/content in the zero-state dir and
    /// bring the swarm up without loading its state.
    fn open_zero_state_for(&mut self, sid: &SwarmId) -> Option<u32> {
        let dir = self.zero_state_dir.clone()?;
        let root = *sid.root_hash()?;
        let content = dir.join(sid.to_filename());
        if !content.exists() {
            return None;
        }
        let tree = HashTree::open_zero_state(
            &root,
            DEFAULT_CHUNK_SIZE,
            &sidecar(&content, "mhash"),
            &sidecar(&content, "mbinmap"),
        )?;
        let dest = parent_dir(&content);
        let opts = OpenOptions::default();
        self.install_file_transfer(&content, &dest, tree, true, opts, DEFAULT_CHUNK_SIZE, self.now())
            .ok()
    }

    /*
     * Event loop
     */

    /// Fire due timers, service PEX backlogs, drop dead transfers.
    pub fn tick(&mut self, now: Tint) {
        let tds: Vec<u32> = self.transfers.keys().copied().collect();
        for td in tds {
            // Connect addresses learned through PEX.
            let backlog: Vec<SocketAddr> = self
                .transfers
                .get_mut(&td)
                .map(|t| t.pex_backlog.drain(..).collect())
                .unwrap_or_default();
            for addr in backlog {
                let id = self.alloc_channel_id();
                if let Some(t) = self.transfers.get_mut(&td) {
                    if t.on_pex_in(addr, id, now) && t.channels.contains_key(&id) {
                        self.channel_index.insert(id, td);
                        if let Some(t) = self.transfers.get_mut(&td) {
                            t.send(id, now);
                        }
                    }
                }
            }
            if let Some(t) = self.transfers.get_mut(&td) {
                t.pump(now);
            }
            self.flush(td);
            // Reap channels the transfer dropped.
            self.channel_index.retain(|id, owner| {
                *owner != td
                    || self
                        .transfers
                        .get(&td)
                        .map(|t| t.channels.contains_key(id))
                        .unwrap_or(false)
            });
            if self
                .transfers
                .get(&td)
                .map(|t| t.should_shutdown())
                .unwrap_or(false)
            {
                info!(td, "zero-state transfer idles out");
                self.transfers.remove(&td);
            }
        }
    }

    /// Earliest pending timer over all transfers.
    pub fn next_deadline(&self) -> Tint {
        self.transfers
            .values()
            .map(|t| t.next_timer())
            .min()
            .unwrap_or(TINT_NEVER)
    }

    fn flush(&mut self, td: u32) {
        let Some(t) = self.transfers.get_mut(&td) else {
            return;
        };
        let out: Vec<(SocketAddr, Vec<u8>)> = t.outbox.drain(..).collect();
        for (addr, bytes) in out {
            self.send_to(addr, &bytes);
        }
    }

    fn send_to(&self, addr: SocketAddr, bytes: &[u8]) {
        let Some(sock) = self.sockets.first() else {
            return;
        };
        // Failure is packet loss; the protocol is built for it.
        if let Err(e) = sock.try_send_to(bytes, addr) {
            debug!(%addr, error = %e, "send failed");
        }
    }

    /// One event-loop turn: fire due timers, then wait up to `max_wait`
    /// for a datagram or the next channel timer, whichever is earlier.
    pub async fn step(&mut self, max_wait: std::time::Duration) -> Result<(), SwiftError> {
        let sock = self
            .sockets
            .first()
            .cloned()
            .ok_or(SwiftError::NotFound)?;
        let now = self.now();
        self.tick(now);
        let deadline = self.next_deadline();
        let sleep_for = if deadline == TINT_NEVER {
            max_wait
        } else {
            max_wait.min(std::time::Duration::from_micros(
                deadline.saturating_sub(now).max(1000) as u64,
            ))
        };
        let mut buf = vec![0u8; MAX_RECV_DGRAM_SIZE];
        tokio::select! {
            res = sock.recv_from(&mut buf) => {
                let (n, from) = res.map_err(SwiftError::Io)?;
                let now = self.now();
                self.handle_datagram(from, &buf[..n], now);
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
        Ok(())
    }

    /// Drive the event loop: socket readable or earliest channel timer.
    pub async fn run(&mut self) -> Result<(), SwiftError> {
        loop {
            self.step(std::time::Duration::from_secs(1)).await?;
        }
    }
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
