//! One swarm: content, storage, picker, channels and their glue.
//!
//! The deep class split of classic implementations collapses here into a
//! tagged `Content` variant with the shared machinery on `Transfer` itself.
//! A transfer owns its channels outright; the runtime refers to them by
//! stable integer ids and relays datagrams in and out through `outbox`.
//! All methods run on the event-loop task; handlers never suspend.

use crate::avail::Availability;
use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::error::{ProtocolError, SwiftError};
use crate::hashtree::HashTree;
use crate::livesig::{LiveSignature, CIPM_NONE_SIG_SIZE};
use crate::livetree::{LiveHashTree, SignedMunro};
use crate::net::channel::{Channel, CHANNEL_TIMEOUT, HINT_TIME, MIN_PEX_REQUEST_INTERVAL};
use crate::net::send_control::SendControl;
use crate::net::wire::{
    self, ChunkAddr, ContentIntegrity, DgramReader, DgramWriter, Handshake, MsgId, Version,
    LIVE_DISC_WND_ALL, MAX_NONDATA_DGRAM_SIZE,
};
use crate::picker::{PickContext, PiecePicker};
use crate::speed::MovingAverageSpeed;
use crate::swarm::SwarmId;
use crate::time::{Tint, TINT_NEVER, TINT_SEC};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Outgoing-connection budget per transfer.
pub const MAX_OUTGOING_CONNECTIONS: usize = 20;

/// Incoming channel cap per transfer; set high for tracker-style seeders.
pub const MAX_INCOMING_CONNECTIONS: usize = 0xFFFF;

/// Tracker retry: initial interval, doubling to the ceiling.
pub const TRACKER_RETRY_INITIAL: Tint = 30 * TINT_SEC;
pub const TRACKER_RETRY_MAX: Tint = 1800 * TINT_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload = 0,
    Download = 1,
}

/// Progress callback: `(td, covering solid bin)`.
pub type ProgressCallback = Box<dyn FnMut(u32, Bin) + Send>;

pub enum Content {
    File {
        hashtree: HashTree,
        avail: Availability,
        zero_state: bool,
    },
    Live {
        tree: LiveHashTree,
        /// Client side: the source's address, when known.
        source_addr: Option<SocketAddr>,
        /// Source: checkpoint file for the last signed munro.
        checkpoint_path: Option<PathBuf>,
    },
}

pub struct Transfer {
    pub td: u32,
    swarm_id: SwarmId,
    pub content: Content,
    pub storage: crate::storage::Storage,
    picker: Option<Box<dyn PiecePicker + Send>>,
    pub channels: HashMap<u32, Channel>,
    def_hs_out: Handshake,
    /// XOR key for channel ids on the wire, shared with the runtime.
    scramble: u32,
    local_port: u16,

    cur_speed: [MovingAverageSpeed; 2],
    max_speed: [f64; 2],
    speed_zero_count: u32,
    slow_start_hints: u64,

    callbacks: Vec<(u64, u8, ProgressCallback)>,
    next_callback_id: u64,

    tracker_url: Option<String>,
    tracker_retry_interval: Tint,
    tracker_retry_time: Tint,

    /// Datagrams ready for the runtime to transmit.
    pub outbox: Vec<(SocketAddr, Vec<u8>)>,
    /// Fresh addresses learned via PEX, for the runtime to connect.
    pub pex_backlog: Vec<SocketAddr>,
    operational: bool,
    last_gc_time: Tint,

    /// Sidecar paths for checkpointing (file transfers).
    mhash_path: Option<PathBuf>,
    mbinmap_path: Option<PathBuf>,
}

fn is_private_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
    }
}

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        td: u32,
        swarm_id: SwarmId,
        content: Content,
        storage: crate::storage::Storage,
        picker: Option<Box<dyn PiecePicker + Send>>,
        def_hs_out: Handshake,
        scramble: u32,
        local_port: u16,
        now: Tint,
    ) -> Transfer {
        Transfer {
            td,
            swarm_id,
            content,
            storage,
            picker,
            channels: HashMap::new(),
            def_hs_out,
            scramble,
            local_port,
            cur_speed: [MovingAverageSpeed::new(now), MovingAverageSpeed::new(now)],
            max_speed: [f64::MAX, f64::MAX],
            speed_zero_count: 0,
            slow_start_hints: 0,
            callbacks: Vec::new(),
            next_callback_id: 1,
            tracker_url: None,
            tracker_retry_interval: TRACKER_RETRY_INITIAL,
            tracker_retry_time: 0,
            outbox: Vec::new(),
            pex_backlog: Vec::new(),
            operational: true,
            last_gc_time: now,
            mhash_path: None,
            mbinmap_path: None,
        }
    }

    pub fn set_sidecar_paths(&mut self, mhash: PathBuf, mbinmap: PathBuf) {
        self.mhash_path = Some(mhash);
        self.mbinmap_path = Some(mbinmap);
    }

    pub fn set_tracker(&mut self, url: Option<String>) {
        self.tracker_url = url;
    }

    pub fn tracker_url(&self) -> Option<&str> {
        self.tracker_url.as_deref()
    }

    /*
     * Content accessors
     */

    pub fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }

    pub fn is_live(&self) -> bool {
        matches!(self.content, Content::Live { .. })
    }

    pub fn am_source(&self) -> bool {
        matches!(&self.content, Content::Live { tree, .. } if tree.is_source())
    }

    pub fn is_zero_state(&self) -> bool {
        matches!(&self.content, Content::File { zero_state, .. } if *zero_state)
    }

    pub fn is_operational(&self) -> bool {
        self.operational
    }

    pub fn set_broken(&mut self) {
        if self.operational {
            warn!(td = self.td, "transfer marked inoperable");
        }
        self.operational = false;
    }

    pub fn chunk_size(&self) -> u32 {
        match &self.content {
            Content::File { hashtree, .. } => hashtree.chunk_size(),
            Content::Live { tree, .. } => tree.chunk_size(),
        }
    }

    pub fn ack_out(&self) -> &Binmap {
        match &self.content {
            Content::File { hashtree, .. } => hashtree.ack_out(),
            Content::Live { tree, .. } => tree.ack_out(),
        }
    }

    pub fn size(&self) -> u64 {
        match &self.content {
            Content::File { hashtree, .. } => hashtree.size(),
            Content::Live { tree, .. } => tree.chunks_complete() * tree.chunk_size() as u64,
        }
    }

    pub fn complete(&self) -> u64 {
        match &self.content {
            Content::File { hashtree, .. } => hashtree.complete(),
            Content::Live { tree, .. } => tree.chunks_complete() * tree.chunk_size() as u64,
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self.content {
            Content::File { hashtree, .. } => hashtree.is_complete(),
            Content::Live { .. } => false,
        }
    }

    pub fn seq_complete(&self, offset: u64) -> u64 {
        match &self.content {
            Content::File { hashtree, .. } => hashtree.seq_complete(offset),
            Content::Live { tree, .. } => {
                let hookin = self.hookin_offset();
                let start = if offset > 0 { offset } else { hookin };
                let first = tree
                    .ack_out()
                    .find_empty_from(Bin::chunk(start / tree.chunk_size() as u64));
                if first.is_none() {
                    return 0;
                }
                (first.base_offset() * tree.chunk_size() as u64).saturating_sub(start)
            }
        }
    }

    /// Byte offset at which a live client hooked into the stream.
    pub fn hookin_offset(&self) -> u64 {
        let Content::Live { tree, .. } = &self.content else {
            return 0;
        };
        let hookin = self
            .picker
            .as_ref()
            .and_then(|p| p.as_any_live())
            .map(|lp| lp.hookin_pos())
            .unwrap_or(Bin::NONE);
        if hookin.is_none() {
            0
        } else {
            hookin.base_offset() * tree.chunk_size() as u64
        }
    }

    fn peaks(&self) -> Vec<Bin> {
        match &self.content {
            Content::File { hashtree, .. } => {
                (0..hashtree.peak_count()).map(|i| hashtree.peak(i)).collect()
            }
            Content::Live { .. } => Vec::new(),
        }
    }

    fn peer_is_source(&self, ch: &Channel) -> bool {
        match &self.content {
            Content::Live {
                source_addr: Some(src),
                ..
            } => ch.peer == *src || ch.recv_peer == Some(*src),
            _ => false,
        }
    }

    fn channel_is_complete(&self, ch: &Channel) -> bool {
        if self.is_live() {
            return self.peer_is_source(ch);
        }
        ch.peer_is_complete(&self.peaks())
    }

    pub fn num_seeders(&self) -> u32 {
        self.channels
            .values()
            .filter(|c| self.channel_is_complete(c))
            .count() as u32
    }

    pub fn num_leechers(&self) -> u32 {
        self.channels
            .values()
            .filter(|c| !self.channel_is_complete(c))
            .count() as u32
    }

    /*
     * Speeds
     */

    pub fn on_recv_data(&mut self, n: usize, now: Tint) {
        self.cur_speed[Direction::Download as usize].add_point(now, n as u64);
    }

    pub fn on_send_data(&mut self, n: usize, now: Tint) {
        self.cur_speed[Direction::Upload as usize].add_point(now, n as u64);
    }

    pub fn on_send_no_data(&mut self, now: Tint) {
        // Batch idle points so zero events do not flood the average.
        self.speed_zero_count += 1;
        if self.speed_zero_count >= 32 {
            self.cur_speed[Direction::Upload as usize].add_point(now, 0);
            self.speed_zero_count = 0;
        }
    }

    pub fn current_speed(&mut self, dir: Direction, now: Tint) -> f64 {
        self.cur_speed[dir as usize].speed(now)
    }

    pub fn max_speed(&self, dir: Direction) -> f64 {
        self.max_speed[dir as usize]
    }

    pub fn set_max_speed(&mut self, dir: Direction, bps: f64) {
        self.max_speed[dir as usize] = if bps <= 0.0 { f64::MAX } else { bps };
    }

    /*
     * Progress callbacks
     */

    pub fn add_progress_callback(&mut self, cb: ProgressCallback, agg_layer: u8) -> u64 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.callbacks.push((id, agg_layer, cb));
        id
    }

    pub fn remove_progress_callback(&mut self, id: u64) {
        self.callbacks.retain(|(cid, _, _)| *cid != id);
    }

    fn progress(&mut self, bin: Bin) {
        let td = self.td;
        for (_, agg, cb) in &mut self.callbacks {
            if bin.layer() >= *agg as u32 {
                cb(td, bin);
            }
        }
    }

    /*
     * Channel management
     */

    /// Open an outgoing channel to `addr`; honours the connection budget.
    pub fn add_peer(&mut self, id: u32, addr: SocketAddr, now: Tint) -> Option<u32> {
        if self.channels.len() >= MAX_OUTGOING_CONNECTIONS {
            debug!(td = self.td, %addr, "peer dropped: connection budget");
            return None;
        }
        if self.find_channel_to(addr, None).is_some() {
            return None;
        }
        self.open_channel(id, addr, now);
        Some(id)
    }

    /// Create channel state; the first send carries the handshake.
    pub fn open_channel(&mut self, id: u32, addr: SocketAddr, now: Tint) {
        let ch = Channel::new(id, addr, self.def_hs_out.clone(), now);
        self.channels.insert(id, ch);
    }

    pub fn find_channel_to(&self, addr: SocketAddr, not: Option<u32>) -> Option<u32> {
        self.channels
            .values()
            .find(|c| {
                Some(c.id) != not && (c.peer == addr || c.recv_peer == Some(addr))
            })
            .map(|c| c.id)
    }

    /// PEX learned a peer; connect unless known or over budget.
    pub fn on_pex_in(&mut self, addr: SocketAddr, id: u32, now: Tint) -> bool {
        if self.find_channel_to(addr, None).is_some() {
            return false;
        }
        if self.channels.len() < MAX_OUTGOING_CONNECTIONS {
            self.open_channel(id, addr, now);
        }
        true
    }

    /// Close a channel; `send_close` emits the explicit zero handshake.
    pub fn close_channel(&mut self, id: u32, send_close: bool, now: Tint) {
        let Some(mut ch) = self.channels.remove(&id) else {
            return;
        };
        debug!(td = self.td, id, "channel close");
        let _ = ch.switch_send_control(SendControl::Close, now);
        if send_close && ch.peer_channel_id() != 0 {
            let mut w = DgramWriter::new();
            w.channel_id(ch.peer_channel_id());
            wire::write_handshake(&mut w, 0, &ch.hs_out, None, self.is_live(), None);
            self.outbox.push((ch.peer, w.into_bytes()));
        }
        if let Content::File { avail, .. } = &mut self.content {
            avail.remove_peer(&ch.ack_in);
        }
        if let Some(p) = self.picker.as_mut().and_then(|p| p.as_any_live_mut()) {
            p.remove_peer(id);
        }
    }

    /// Channels flagged for deletion are dropped; idle ones are closed.
    /// Runs at most every 5 s.
    pub fn garbage_collect_channels(&mut self, now: Tint) {
        if now - self.last_gc_time < 5 * TINT_SEC {
            return;
        }
        self.last_gc_time = now;
        let doomed: Vec<u32> = self
            .channels
            .values()
            .filter(|c| {
                c.scheduled_for_delete
                    || (c.last_recv_time != 0 && c.last_recv_time < now - CHANNEL_TIMEOUT)
                    || c.send_control == SendControl::Close
            })
            .map(|c| c.id)
            .collect();
        for id in doomed {
            self.close_channel(id, false, now);
        }
    }

    /// Earliest pending send over all channels.
    pub fn next_timer(&self) -> Tint {
        self.channels
            .values()
            .filter(|c| c.send_control != SendControl::Close && !c.scheduled_for_delete)
            .map(|c| c.next_send_time)
            .min()
            .unwrap_or(TINT_NEVER)
    }

    /// Forward a playback seek to the picker.
    pub fn seek_picker(&mut self, offset: Bin) -> bool {
        self.picker
            .as_mut()
            .map(|p| p.seek(offset))
            .unwrap_or(false)
    }

    /// Fire every due channel timer; bounded per call to keep the loop fair.
    pub fn pump(&mut self, now: Tint) {
        let due: Vec<u32> = self
            .channels
            .values()
            .filter(|c| c.next_send_time <= now && c.send_control != SendControl::Close)
            .map(|c| c.id)
            .collect();
        for id in due {
            self.send(id, now);
        }
        self.garbage_collect_channels(now);
    }

    /// Exponential back-off gate for tracker contact: `true` when the
    /// embedder should (re)announce now.
    pub fn tracker_reconnect_if_allowed(&mut self, moving_forward: bool, now: Tint) -> bool {
        let established = self.channels.values().any(|c| c.is_established());
        if established && moving_forward {
            self.tracker_retry_interval = TRACKER_RETRY_INITIAL;
            return false;
        }
        if now < self.tracker_retry_time {
            return false;
        }
        self.tracker_retry_time = now + self.tracker_retry_interval;
        self.tracker_retry_interval = (self.tracker_retry_interval * 2).min(TRACKER_RETRY_MAX);
        self.tracker_url.is_some()
    }

    /*
     * Receive path
     */

    /// Feed one datagram (channel id already stripped) into `ch_id`.
    pub fn recv(&mut self, ch_id: u32, payload: &[u8], from: SocketAddr, now: Tint) {
        let Some(mut ch) = self.channels.remove(&ch_id) else {
            return;
        };
        if !self.operational {
            self.channels.insert(ch_id, ch);
            self.close_by_error(ch_id, now);
            return;
        }

        // NAT duplicate / stray sender arbitration.
        if from != ch.peer && self.duplicate_or_stray(&mut ch, from) {
            debug!(id = ch_id, %from, "closing duplicate/stray channel");
            self.channels.insert(ch_id, ch);
            self.close_channel(ch_id, true, now);
            return;
        }

        let keepalive = payload.is_empty();
        ch.mark_recv(payload.len() + 4, keepalive, now);
        if keepalive {
            self.on_recv_data(0, now);
        }

        let mut r = DgramReader::new(payload);
        let result = self.recv_messages(&mut ch, &mut r, now);
        let closed = matches!(ch.send_control, SendControl::Close);
        let id = ch.id;
        self.channels.insert(id, ch);
        match result {
            Err(e) => {
                debug!(id, error = %e, "channel protocol error");
                self.close_channel(id, true, now);
            }
            Ok(()) if closed => {
                self.close_channel(id, false, now);
            }
            Ok(()) => self.reschedule(id, now),
        }
    }

    /// Called on an address mismatch: `true` closes the channel. Only the
    /// first reply from an IANA-private address may differ from the dialed
    /// address (a NAT mirror); any other mismatched sender is invalid.
    fn duplicate_or_stray(&self, ch: &mut Channel, from: SocketAddr) -> bool {
        if ch.own_id_mentioned || !is_private_addr(&from) {
            return true;
        }
        ch.recv_peer = Some(from);
        if self.find_channel_to(from, Some(ch.id)).is_some() {
            // Two peers behind one NAT created mirrored channels; keep the
            // one whose remote port is lower than ours.
            return from.port() > self.local_port;
        }
        false
    }

    fn recv_messages(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        now: Tint,
    ) -> Result<(), SwiftError> {
        if ch.hs_in.is_none() && !r.is_empty() {
            // First reply: must be a handshake, dialect sniffed from the
            // leading message id (legacy leads with INTEGRITY).
            let id = r.u8("message id")?;
            let first = MsgId::from_u8(id).ok_or(ProtocolError::UnknownMessage(id))?;
            let hs = wire::read_handshake(r, None, first).map_err(SwiftError::Protocol)?;
            self.on_handshake(ch, hs, now)?;
        }
        while !r.is_empty() && ch.send_control != SendControl::Close {
            let id = r.u8("message id")?;
            let msg = MsgId::from_u8(id).ok_or(ProtocolError::UnknownMessage(id))?;
            match msg {
                MsgId::Handshake => {
                    let ver = ch.hs_in.as_ref().map(|h| h.version);
                    let hs = wire::read_handshake(r, ver.or(Some(Version::Ppspv1)), msg)
                        .map_err(SwiftError::Protocol)?;
                    self.on_handshake(ch, hs, now)?;
                }
                MsgId::Data => self.on_data(ch, r, now)?,
                MsgId::Ack => self.on_ack(ch, r, now)?,
                MsgId::Have => self.on_have(ch, r, now)?,
                MsgId::Integrity => self.on_integrity(ch, r, now)?,
                MsgId::SignedIntegrity => self.on_signed_integrity(ch, r, now)?,
                MsgId::Request => self.on_request(ch, r, now)?,
                MsgId::Cancel => self.on_cancel(ch, r)?,
                MsgId::Choke => {
                    // The peer stopped serving us; outstanding requests die.
                    ch.choked = true;
                    ch.hint_out.clear();
                    ch.hint_out_size = 0;
                }
                MsgId::Unchoke => {
                    ch.choked = false;
                }
                MsgId::PexResV4 => {
                    let addr = r.pex_addr_v4().map_err(SwiftError::Protocol)?;
                    self.on_pex_res(ch, addr);
                }
                MsgId::PexResV6 => {
                    let addr = r.pex_addr_v6().map_err(SwiftError::Protocol)?;
                    self.on_pex_res(ch, addr);
                }
                MsgId::PexReq => self.on_pex_req(ch, now),
            }
        }
        Ok(())
    }

    fn chunk_addr_in(&self, ch: &Channel) -> ChunkAddr {
        ch.hs_in
            .as_ref()
            .map(|h| h.chunk_addr)
            .unwrap_or(ch.hs_out.chunk_addr)
    }

    fn on_handshake(&mut self, ch: &mut Channel, hs: Handshake, now: Tint) -> Result<(), SwiftError> {
        if hs.peer_channel_id == 0 {
            // Explicit close from the peer.
            debug!(id = ch.id, "peer close");
            let _ = ch.switch_send_control(SendControl::Close, now);
            return Ok(());
        }
        if !hs.is_supported() {
            let _ = ch.switch_send_control(SendControl::Close, now);
            return Err(ProtocolError::Unsupported.into());
        }
        // Self-connection: our own scrambled id coming back at us.
        if hs.peer_channel_id ^ self.scramble == ch.id {
            let _ = ch.switch_send_control(SendControl::Close, now);
            return Err(SwiftError::Address);
        }
        if hs.version == Version::Legacy {
            ch.hs_out.reset_to_legacy();
        }
        ch.hs_in = Some(hs);
        if ch.is_established() {
            info!(id = ch.id, peer = %ch.peer, "channel established");
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        now: Tint,
    ) -> Result<(), SwiftError> {
        let bv = r.chunk_addr(self.chunk_addr_in(ch)).map_err(SwiftError::Protocol)?;
        if bv.len() != 1 {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        let pos = bv[0];
        let mut peer_time = TINT_NEVER;
        if ch.hs_out.version == Version::Ppspv1 {
            peer_time = r.u64("data timestamp")? as Tint;
        }
        let chunk_size = self.chunk_size() as usize;
        let rest = r.rest();
        let data = &rest[..rest.len().min(chunk_size)];

        if self.is_zero_state() {
            // Zero-state serves, it does not leech.
            return Ok(());
        }

        if !self.ack_out().is_empty_in(pos) {
            debug!(id = ch.id, bin = %pos, "duplicate data");
            ch.data_in = (TINT_NEVER, self.ack_out().cover(pos));
            ch.update_dip(pos, now);
            return Ok(());
        }

        let verified = match &mut self.content {
            Content::File { hashtree, .. } => {
                hashtree.offer_data(pos, data, &mut self.storage)?
            }
            Content::Live { tree, .. } => {
                if ch
                    .hs_in
                    .as_ref()
                    .map(|h| h.cont_int_prot == ContentIntegrity::None)
                    .unwrap_or(false)
                {
                    // No integrity protection: store and account directly.
                    self.storage
                        .write(data, pos.base_offset() * chunk_size as u64)?;
                    tree.ack_out_mut().set(pos);
                    true
                } else {
                    tree.offer_data(pos, data, &mut self.storage)?
                }
            }
        };
        if !verified {
            debug!(id = ch.id, bin = %pos, "data failed verification");
            return Ok(());
        }

        let cover = self.ack_out().cover(pos);
        self.progress(cover);
        self.on_recv_data(data.len(), now);

        ch.bytes_down += data.len() as u64;
        ch.data_in = (now, pos);
        if peer_time != TINT_NEVER {
            ch.data_in = (now - peer_time, pos);
        }
        if cover.layer() > 2 {
            ch.data_in_dbl = cover;
        }
        ch.update_dip(pos, now);
        ch.clean_hint_out(pos);

        // Live discard window: drop tree state that slid out.
        if let Content::Live { tree, .. } = &mut self.content {
            let wnd = ch.hs_out.live_disc_wnd;
            if wnd != LIVE_DISC_WND_ALL && pos.base_offset() >= wnd {
                let k = tree.chunks_per_sign() as u64;
                let keep_from = ((pos.base_offset() - wnd + 1) / k) * k;
                if keep_from > 0 {
                    tree.purge_tree(Bin::chunk(keep_from));
                }
            }
        }
        Ok(())
    }

    fn on_ack(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        now: Tint,
    ) -> Result<(), SwiftError> {
        let bv = r.chunk_addr(self.chunk_addr_in(ch)).map_err(SwiftError::Protocol)?;
        if bv.is_empty() {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        let peer_owd = r.u64("ack delay")? as Tint;
        for pos in bv {
            if pos.is_none() {
                return Ok(());
            }
            if let Content::File { hashtree, .. } = &self.content {
                if hashtree.size() != 0 && pos.base_offset() >= hashtree.size_in_chunks() {
                    warn!(id = ch.id, bin = %pos, "ack outside the tree");
                    return Ok(());
                }
            }
            ch.on_ack_bin(pos, peer_owd, now);
        }
        Ok(())
    }

    fn on_have(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        now: Tint,
    ) -> Result<(), SwiftError> {
        let bv = r.chunk_addr(self.chunk_addr_in(ch)).map_err(SwiftError::Protocol)?;
        if bv.is_empty() {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        for pos in bv {
            if pos.is_none() {
                return Ok(());
            }
            if let Content::File { hashtree, avail, .. } = &mut self.content {
                if !hashtree.is_complete() {
                    avail.on_have(&ch.ack_in, pos);
                }
            }
            ch.ack_in.set(pos);
            debug!(id = ch.id, bin = %pos, "have");
            if self.is_live() {
                self.on_have_live(ch, pos);
            }
        }
        Ok(())
    }

    fn on_have_live(&mut self, ch: &mut Channel, pos: Bin) {
        if self.am_source() {
            return;
        }
        let wnd = ch.hs_in.as_ref().map(|h| h.live_disc_wnd).unwrap_or(LIVE_DISC_WND_ALL);
        if wnd != LIVE_DISC_WND_ALL {
            // The peer only retains its discard window; mask out what it
            // has provably dropped so the picker never asks for it.
            let right = pos.base_right();
            if ch.ack_in_right_basebin.is_none() || right > ch.ack_in_right_basebin {
                ch.ack_in_right_basebin = right;
                if right.layer_offset() >= wnd {
                    let first_kept = right.layer_offset() - wnd + 1;
                    for b in wire::chunk_range_to_bins(0, first_kept - 1) {
                        ch.ack_in.reset(b);
                    }
                    debug!(id = ch.id, first_kept, "have window clamp");
                }
            }
        }
        if ch.hint_out.is_empty() {
            // No hints outstanding: ask right away instead of waiting for
            // the timer.
            ch.live_have_no_hint = true;
        }
    }

    fn on_integrity(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        _now: Tint,
    ) -> Result<(), SwiftError> {
        let cipm = ch
            .hs_in
            .as_ref()
            .map(|h| h.cont_int_prot)
            .unwrap_or(ContentIntegrity::Merkle);
        let bv = r.chunk_addr(self.chunk_addr_in(ch)).map_err(SwiftError::Protocol)?;
        if bv.len() != 1 {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        let pos = bv[0];
        let hash = r.hash("integrity hash")?;
        if !matches!(cipm, ContentIntegrity::Merkle | ContentIntegrity::UnifiedMerkle) {
            debug!(id = ch.id, "integrity without integrity protection");
            return Ok(());
        }
        match &mut self.content {
            Content::File { hashtree, .. } => {
                hashtree.offer_hash(pos, hash);
            }
            Content::Live { tree, .. } => {
                if !tree.is_source() {
                    if let Err(e) = tree.offer_hash(pos, hash) {
                        debug!(id = ch.id, bin = %pos, error = %e, "live hash rejected");
                    }
                }
            }
        }
        Ok(())
    }

    fn on_signed_integrity(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        now: Tint,
    ) -> Result<(), SwiftError> {
        let peer_src = self.peer_is_source(ch);
        let addr = self.chunk_addr_in(ch);
        let Content::Live { tree, .. } = &mut self.content else {
            return Err(ProtocolError::BadChunkSpec.into());
        };
        let bv = r.chunk_addr(addr).map_err(SwiftError::Protocol)?;
        if bv.len() != 1 {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        let pos = bv[0];
        let source_time = r.u64("signed integrity timestamp")? as Tint;
        let cipm = ch
            .hs_in
            .as_ref()
            .map(|h| h.cont_int_prot)
            .unwrap_or(ContentIntegrity::UnifiedMerkle);
        let siglen = if cipm == ContentIntegrity::None {
            CIPM_NONE_SIG_SIZE
        } else {
            tree.pubkey().alg().sig_size()
        };
        let sig = LiveSignature(r.bytes(siglen, "signature")?.to_vec());

        if tree.is_source() {
            return Ok(());
        }
        if cipm == ContentIntegrity::None {
            // Nothing to verify; the munro only marks the source position.
            if let Some(p) = self.picker.as_mut().and_then(|p| p.as_any_live_mut()) {
                p.add_peer_munro(ch.id, pos, source_time, peer_src);
            }
            return Ok(());
        }
        match tree.offer_signed_munro(pos, source_time, sig, now) {
            Ok(_new) => {
                if let Some(p) = self.picker.as_mut().and_then(|p| p.as_any_live_mut()) {
                    p.add_peer_munro(ch.id, pos, source_time, peer_src);
                }
            }
            Err(e) => {
                // Trust failure: drop the munro, keep the channel.
                debug!(id = ch.id, bin = %pos, error = %e, "munro rejected");
            }
        }
        Ok(())
    }

    fn on_request(
        &mut self,
        ch: &mut Channel,
        r: &mut DgramReader<'_>,
        now: Tint,
    ) -> Result<(), SwiftError> {
        let bv = r.chunk_addr(self.chunk_addr_in(ch)).map_err(SwiftError::Protocol)?;
        if bv.is_empty() {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        for hint in bv {
            ch.enqueue_hint_in(hint, now);
        }
        Ok(())
    }

    fn on_cancel(&mut self, ch: &mut Channel, r: &mut DgramReader<'_>) -> Result<(), SwiftError> {
        let bv = r.chunk_addr(self.chunk_addr_in(ch)).map_err(SwiftError::Protocol)?;
        if bv.is_empty() {
            return Err(ProtocolError::BadChunkSpec.into());
        }
        for cancel in bv {
            ch.on_cancel_bin(cancel);
        }
        Ok(())
    }

    fn on_pex_res(&mut self, ch: &mut Channel, addr: SocketAddr) {
        debug!(id = ch.id, %addr, "pex");
        ch.pex_request_outstanding = false;
        // The runtime allocates ids; queue the address for it.
        if self.find_channel_to(addr, None).is_some() {
            ch.useless_pex_count += 1;
        } else {
            ch.useless_pex_count = 0;
            self.pex_backlog.push(addr);
        }
    }

    fn on_pex_req(&mut self, ch: &mut Channel, now: Tint) {
        if now > ch.last_pex_request_time + MIN_PEX_REQUEST_INTERVAL {
            ch.pex_requested = true;
            ch.last_pex_request_time = now;
        }
    }

    fn close_by_error(&mut self, id: u32, now: Tint) {
        self.close_channel(id, true, now);
    }

    /*
     * Send path
     */

    fn reschedule(&mut self, ch_id: u32, now: Tint) {
        let Some(ch) = self.channels.get_mut(&ch_id) else {
            return;
        };
        let nst = ch.next_send_time(now);
        ch.next_send_time = nst;
        if nst == TINT_NEVER {
            ch.scheduled_for_delete = true;
        }
    }

    /// Construct and queue at most one datagram (plus the optional
    /// hash-overflow datagram) for `ch_id`.
    pub fn send(&mut self, ch_id: u32, now: Tint) {
        let Some(mut ch) = self.channels.remove(&ch_id) else {
            return;
        };
        let mut w = DgramWriter::new();
        w.channel_id(ch.peer_channel_id());

        let mut data = Bin::NONE;
        if ch.send_control == SendControl::Close {
            self.add_handshake(&mut ch, &mut w, true);
        } else if ch.is_established() {
            self.add_have(&mut ch, &mut w);
            self.add_ack(&mut ch, &mut w);
            let complete_for_peer = match &self.content {
                Content::File { hashtree, .. } => hashtree.is_complete(),
                Content::Live { tree, .. } => tree.is_source(),
            };
            if !complete_for_peer {
                self.add_hint(&mut ch, &mut w, now);
                self.add_pex_req(&mut ch, &mut w, now);
                self.add_cancel(&mut ch, &mut w);
            }
            self.add_pex(&mut ch, &mut w, now);
            ch.timeout_data_out(now);
            data = self.add_data(&mut ch, &mut w, now);
        } else {
            self.add_handshake(&mut ch, &mut w, false);
            self.add_have(&mut ch, &mut w);
            self.add_ack(&mut ch, &mut w);
        }

        let keepalive = w.len() == 4;
        let bytes = w.into_bytes();
        debug!(
            id = ch.id,
            len = bytes.len(),
            data = %data,
            peer = %ch.peer,
            "send"
        );
        ch.mark_send(bytes.len(), keepalive, now);
        self.outbox.push((ch.peer, bytes));

        let id = ch.id;
        self.channels.insert(id, ch);
        self.reschedule(id, now);
    }

    fn encoded_id(&self, id: u32) -> u32 {
        id ^ self.scramble
    }

    fn add_handshake(&mut self, ch: &mut Channel, w: &mut DgramWriter, closing: bool) {
        let encoded = if closing { 0 } else { self.encoded_id(ch.id) };
        // The swarm id travels only when we initiate.
        let swarm_bytes = if ch.hs_in.is_none() {
            Some(self.swarm_id.to_bytes())
        } else {
            None
        };
        let root = match (&self.content, ch.hs_out.version) {
            (Content::File { hashtree, .. }, Version::Legacy) if ch.hs_in.is_none() => {
                Some(*hashtree.root_hash())
            }
            _ => None,
        };
        wire::write_handshake(
            w,
            encoded,
            &ch.hs_out,
            swarm_bytes.as_deref(),
            self.is_live(),
            root.as_ref(),
        );
        ch.have_out.clear();
    }

    /// HAVE for the next unannounced region of our ack set, a few per
    /// datagram.
    fn add_have(&mut self, ch: &mut Channel, w: &mut DgramWriter) {
        if !ch.data_in_dbl.is_none() {
            w.u8(MsgId::Have as u8);
            w.chunk_addr(ch.data_in_dbl, ch.hs_out.chunk_addr);
            ch.data_in_dbl = Bin::NONE;
        }
        if self.is_zero_state() {
            if ch.is_established() {
                return;
            }
            for peak in self.peaks() {
                w.u8(MsgId::Have as u8);
                w.chunk_addr(peak, ch.hs_out.chunk_addr);
            }
            return;
        }
        // A live source may only announce chunks under a signed munro.
        let ack_out = match &self.content {
            Content::Live { tree, .. } if tree.is_source() => tree.signed_ack_out(),
            _ => self.ack_out(),
        };
        for _ in 0..4 {
            let ack = Binmap::find_complement(&ch.have_out, ack_out, 0);
            if ack.is_none() {
                break;
            }
            let ack = ack_out.cover(ack);
            ch.have_out.set(ack);
            w.u8(MsgId::Have as u8);
            w.chunk_addr(ack, ch.hs_out.chunk_addr);
        }
    }

    fn add_ack(&mut self, ch: &mut Channel, w: &mut DgramWriter) {
        let (time, bin) = ch.data_in;
        if bin.is_none() {
            return;
        }
        if time == TINT_NEVER {
            // Duplicate data was received: answer with a HAVE.
            w.u8(MsgId::Have as u8);
            w.chunk_addr(bin, ch.hs_out.chunk_addr);
        } else {
            w.u8(MsgId::Ack as u8);
            w.chunk_addr(bin, ch.hs_out.chunk_addr);
            w.u64(time.max(0) as u64);
        }
        ch.have_out.set(bin);
        if bin.layer() > 2 {
            ch.data_in_dbl = bin;
        }
        ch.data_in = (TINT_NEVER, Bin::NONE);
    }

    /// REQUEST budgeting: available pipe (dip-based) and the rate limiter.
    fn add_hint(&mut self, ch: &mut Channel, w: &mut DgramWriter, now: Tint) {
        if self.picker.is_none() || self.is_complete() {
            return;
        }
        if self.current_speed(Direction::Download, now) > self.max_speed(Direction::Download) {
            return;
        }

        // 1. Uncongested-queue allowance.
        let plan_for = HINT_TIME.max(ch.rtt_avg << 2);
        let dropped = ch.clean_stale_hint_out(now);
        for b in dropped {
            ch.cancel_out.push_back(b);
        }
        let first_plan_pck = (plan_for / ch.dip_avg.max(1)).max(1) as u64;
        let queue_allowed = first_plan_pck.saturating_sub(ch.hint_out_size);

        // 2. Rate-limit allowance across all channels.
        let mut rate_allowed = u64::MAX;
        let mut count_hints = false;
        if self.max_speed(Direction::Download) < f64::MAX {
            let global_out: u64 = self.channels.values().map(|c| c.hint_out_size).sum::<u64>()
                + ch.hint_out_size;
            let rate_limit =
                (HINT_TIME / TINT_SEC) as f64 * self.max_speed(Direction::Download)
                    / self.chunk_size() as f64;
            // Ramp up over the first seconds; speed estimates need ~3 s.
            let mut limit = rate_limit;
            let running = now - ch.open_time;
            if running < 3 * TINT_SEC {
                count_hints = true;
                let slow = rate_limit * running as f64 / TINT_SEC as f64;
                limit = (slow - self.slow_start_hints as f64).max(0.0);
            }
            rate_allowed = (limit as u64).saturating_sub(global_out);
        }

        let plan = queue_allowed.min(rate_allowed);
        if ch.hint_out_size != 0 && plan == 0 && !self.is_live() {
            return;
        }

        let hint = if self.is_live() {
            self.pick_for(ch, plan.max(1), now)
        } else {
            let mut h = ch.dequeue_hint_out(plan, now);
            if h.is_none() {
                let res = self.pick_for(ch, plan.max(1), now);
                if !res.is_none() {
                    ch.hint_queue_out.push_back((now, res));
                    ch.hint_queue_out_size += res.base_length();
                    h = ch.dequeue_hint_out(plan.max(1), now);
                }
            }
            h
        };

        if hint.is_none() {
            return;
        }
        w.u8(MsgId::Request as u8);
        w.chunk_addr(hint, ch.hs_out.chunk_addr);
        ch.hint_out.push_back((now, hint));
        ch.hint_out_size += hint.base_length();
        if count_hints {
            self.slow_start_hints += hint.base_length();
        }
        if ch.rtt_hint.1.is_none() {
            ch.rtt_hint = (now, hint.base_left());
        }
        debug!(id = ch.id, bin = %hint, out = ch.hint_out_size, "hint out");
    }

    /// Run the picker for this channel.
    fn pick_for(&mut self, ch: &Channel, max_width: u64, now: Tint) -> Bin {
        let Some(picker) = self.picker.as_mut() else {
            return Bin::NONE;
        };
        let (ack_out, size_known, first_peak, avail) = match &self.content {
            Content::File { hashtree, avail, .. } => (
                hashtree.ack_out(),
                hashtree.size() != 0,
                if hashtree.peak_count() > 0 {
                    hashtree.peak(0)
                } else {
                    Bin::NONE
                },
                Some(avail),
            ),
            Content::Live { tree, .. } => (tree.ack_out(), true, Bin::NONE, None),
        };
        let offers: Vec<&Binmap> = self
            .channels
            .values()
            .filter(|c| c.is_established())
            .map(|c| &c.ack_in)
            .collect();
        let peer_is_source = match &self.content {
            Content::Live {
                source_addr: Some(src),
                ..
            } => ch.peer == *src || ch.recv_peer == Some(*src),
            _ => false,
        };
        let ctx = PickContext {
            ack_out,
            size_known,
            first_peak,
            avail,
            all_offers: &offers,
            peer_count: offers.len() as u32 + 1,
            peer_is_source,
        };
        picker.pick(&ctx, &ch.ack_in, max_width, now, ch.id)
    }

    fn add_cancel(&mut self, ch: &mut Channel, w: &mut DgramWriter) {
        let addr_size = 1 + ch.hs_out.chunk_addr.size();
        while w.len() + addr_size <= MAX_NONDATA_DGRAM_SIZE {
            let Some(cancel) = ch.cancel_out.pop_front() else {
                break;
            };
            w.u8(MsgId::Cancel as u8);
            w.chunk_addr(cancel, ch.hs_out.chunk_addr);
        }
    }

    fn add_pex_req(&mut self, ch: &mut Channel, w: &mut DgramWriter, now: Tint) {
        if now < ch.next_pex_request_time {
            return;
        }
        if ch.pex_request_outstanding {
            ch.useless_pex_count += 1;
        }
        ch.pex_request_outstanding = false;
        if self.channels.len() + 1 >= MAX_OUTGOING_CONNECTIONS || ch.useless_pex_count > 2 {
            ch.useless_pex_count = 0;
            ch.next_pex_request_time = now + 30 * TINT_SEC;
            return;
        }
        w.u8(MsgId::PexReq as u8);
        ch.next_pex_request_time = now + MIN_PEX_REQUEST_INTERVAL * 11 / 10;
        ch.pex_request_outstanding = true;
    }

    fn add_pex(&mut self, ch: &mut Channel, w: &mut DgramWriter, now: Tint) {
        // Reverse PEX first: addresses queued to punch NATs.
        while let Some(&(due, other_id)) = ch.reverse_pex_out.front() {
            if due > now || w.len() + 8 > MAX_NONDATA_DGRAM_SIZE {
                break;
            }
            ch.reverse_pex_out.pop_front();
            let Some(other) = self.channels.get(&other_id) else {
                continue;
            };
            let a = other.peer;
            if !is_private_addr(&a) || is_private_addr(&ch.peer) {
                w.pex_addr(a);
                debug!(id = ch.id, %a, "reverse pex");
            }
        }

        if !ch.pex_requested {
            return;
        }
        ch.pex_requested = false;

        // A random established peer, never leaking private addresses to
        // public ones.
        let candidates: Vec<u32> = self
            .channels
            .values()
            .filter(|c| {
                c.id != ch.id
                    && c.is_established()
                    && (!is_private_addr(&c.peer) || is_private_addr(&ch.peer))
            })
            .map(|c| c.id)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let chosen = candidates[rand::random::<usize>() % candidates.len()];
        let addr = self.channels.get(&chosen).map(|c| c.peer).expect("chosen");
        w.pex_addr(addr);

        // Queue the reverse direction ~2 s out.
        if let Some(other) = self.channels.get_mut(&chosen) {
            if !other.reverse_pex_out.iter().any(|&(_, id)| id == ch.id) {
                other.reverse_pex_out.push_back((now + 2 * TINT_SEC, ch.id));
                if other.send_control == SendControl::KeepAlive
                    && other.next_send_time > now + 2 * TINT_SEC
                {
                    other.next_send_time = now + 2 * TINT_SEC;
                }
            }
        }
    }

    /// Integrity prerequisites for `pos` (or the initial peaks/munro when
    /// `pos` is NONE), then one DATA chunk.
    fn add_data(&mut self, ch: &mut Channel, w: &mut DgramWriter, now: Tint) -> Bin {
        if self.current_speed(Direction::Upload, now) > self.max_speed(Direction::Upload) {
            self.on_send_no_data(now);
            return Bin::NONE;
        }
        if let Content::File { hashtree, .. } = &self.content {
            if hashtree.size() == 0 {
                return Bin::NONE; // nothing known to serve yet
            }
        }

        let mut tosend = Bin::NONE;
        let mut is_retransmit = false;
        let luft = ch.send_interval >> 4; // may wake a bit early
        if (ch.data_out_size as f64) < ch.cwnd
            && ch.last_data_out_time + ch.send_interval <= now + luft
        {
            let (bin, retx) = ch.dequeue_hint(now);
            tosend = bin;
            is_retransmit = retx;
            if tosend.is_none() {
                if ch.send_control != SendControl::KeepAlive
                    && ch.send_control != SendControl::Close
                {
                    let _ = ch.switch_send_control(SendControl::KeepAlive, now);
                }
            }
        }

        self.add_required_hashes(ch, w, tosend, is_retransmit, now);

        if tosend.is_none() {
            self.on_send_no_data(now);
            return Bin::NONE;
        }
        if !ch.ack_in.is_empty() {
            ch.data_out_cap = tosend;
        }

        // Flush the head separately if the hashes already filled the frame.
        if ch.is_established() && w.len() > MAX_NONDATA_DGRAM_SIZE {
            let head = w.take();
            debug!(id = ch.id, len = head.len(), "flushing oversized head");
            ch.raw_bytes_up += head.len() as u64;
            self.outbox.push((ch.peer, head));
            w.channel_id(ch.peer_channel_id());
        }

        let chunk_size = self.chunk_size() as usize;
        let mut buf = vec![0u8; chunk_size];
        let off = tosend.base_offset() * chunk_size as u64;
        let n = match self.storage.read(&mut buf, off) {
            Ok(n) if n > 0 => n,
            _ => {
                debug!(id = ch.id, bin = %tosend, "read failed for data");
                return Bin::NONE;
            }
        };
        // Trim the final chunk to the content size.
        let n = match &self.content {
            Content::File { hashtree, .. } => {
                (hashtree.size().saturating_sub(off) as usize).min(n)
            }
            Content::Live { .. } => n,
        };

        w.u8(MsgId::Data as u8);
        w.chunk_addr(tosend, ch.hs_out.chunk_addr);
        if ch
            .hs_in
            .as_ref()
            .map(|h| h.version == Version::Ppspv1)
            .unwrap_or(false)
        {
            w.u64(now as u64);
        }
        w.bytes(&buf[..n]);

        ch.last_data_out_time = now;
        ch.data_out.push_back((now, tosend));
        ch.data_out_size += 1;
        ch.bytes_up += n as u64;
        self.on_send_data(n, now);
        debug!(id = ch.id, bin = %tosend, "data out");
        tosend
    }

    fn add_required_hashes(
        &mut self,
        ch: &mut Channel,
        w: &mut DgramWriter,
        pos: Bin,
        is_retransmit: bool,
        now: Tint,
    ) {
        match &self.content {
            Content::File { hashtree, .. } => {
                // Cold peers always get the peaks; they carry the size.
                if ch.ack_in.is_empty() && hashtree.peak_count() > 0 {
                    for i in 0..hashtree.peak_count() {
                        let peak = hashtree.peak(i);
                        w.u8(MsgId::Integrity as u8);
                        w.chunk_addr(peak, ch.hs_out.chunk_addr);
                        w.hash(&hashtree.peak_hash(i));
                    }
                }
                let merkle = ch
                    .hs_in
                    .as_ref()
                    .map(|h| h.cont_int_prot == ContentIntegrity::Merkle)
                    .unwrap_or(true);
                if merkle && !pos.is_none() {
                    let chain = hashtree.uncle_chain(pos, |parent| !ch.ack_in.is_empty_in(parent));
                    for (uncle, hash) in chain {
                        w.u8(MsgId::Integrity as u8);
                        w.chunk_addr(uncle, ch.hs_out.chunk_addr);
                        w.hash(&hash);
                    }
                }
            }
            Content::Live { tree, .. } => {
                if self.peer_is_source(ch) {
                    return;
                }
                let cipm_none = ch.hs_out.cont_int_prot == ContentIntegrity::None;
                let munro = if pos.is_none() {
                    tree.last_munro()
                } else {
                    tree.munro_for(pos)
                };
                if munro.is_none() {
                    return;
                }
                if pos.is_none() {
                    // Initial announcement of the newest munro, unless the
                    // peer is clearly past it already.
                    let ahead = !ch.ack_in_right_basebin.is_none()
                        && ch.ack_in_right_basebin > munro.base_right();
                    if !ch.ack_in.is_empty_in(munro) || ch.munro_ack_rcvd || ahead {
                        return;
                    }
                    self.write_signed_munro(ch, w, munro, cipm_none, now);
                    ch.last_sent_munro = munro;
                } else {
                    let fresh = munro != ch.last_sent_munro;
                    ch.last_sent_munro = munro;
                    if is_retransmit || fresh {
                        self.write_signed_munro(ch, w, munro, cipm_none, now);
                    }
                    if ch.hs_in.as_ref().map(|h| h.cont_int_prot)
                        == Some(ContentIntegrity::UnifiedMerkle)
                    {
                        let chain = if is_retransmit {
                            tree.uncle_chain(pos, |_| false)
                        } else {
                            tree.uncle_chain(pos, |parent| !ch.ack_in.is_empty_in(parent))
                        };
                        for (uncle, hash) in chain {
                            w.u8(MsgId::Integrity as u8);
                            w.chunk_addr(uncle, ch.hs_out.chunk_addr);
                            w.hash(&hash);
                        }
                    }
                }
            }
        }
    }

    fn write_signed_munro(
        &self,
        ch: &Channel,
        w: &mut DgramWriter,
        munro: Bin,
        cipm_none: bool,
        now: Tint,
    ) {
        let Content::Live { tree, .. } = &self.content else {
            return;
        };
        let (hash, timestamp, signature) = if cipm_none {
            (None, now, LiveSignature::dummy())
        } else {
            match tree.signed_munro(munro) {
                Some(m) => (Some(m.hash), m.timestamp, m.signature.clone()),
                None => return,
            }
        };
        if let Some(h) = &hash {
            w.u8(MsgId::Integrity as u8);
            w.chunk_addr(munro, ch.hs_out.chunk_addr);
            w.hash(h);
        }
        w.u8(MsgId::SignedIntegrity as u8);
        w.chunk_addr(munro, ch.hs_out.chunk_addr);
        w.u64(timestamp as u64);
        w.bytes(&signature.0);
        debug!(id = ch.id, munro = %munro, "signed munro out");
    }

    /*
     * Live source feed
     */

    /// Source: append bytes, chunk by chunk. Returns bytes consumed.
    pub fn live_write(&mut self, buf: &[u8], now: Tint) -> Result<usize, SwiftError> {
        let chunk_size = self.chunk_size() as usize;
        let Content::Live {
            tree,
            checkpoint_path,
            ..
        } = &mut self.content
        else {
            return Err(SwiftError::NotFound);
        };
        if !tree.is_source() {
            return Err(SwiftError::NotFound);
        }
        let mut consumed = 0usize;
        let mut new_munro: Option<SignedMunro> = None;
        while consumed < buf.len() {
            let take = chunk_size.min(buf.len() - consumed);
            let piece = &buf[consumed..consumed + take];
            let offset = tree.source_pos();
            let write_off = if offset.is_none() {
                0
            } else {
                (offset.base_offset() + 1) * chunk_size as u64
            };
            self.storage.write(piece, write_off)?;
            let (_, munro) = tree.add_data(piece, now);
            if munro.is_some() {
                new_munro = munro;
            }
            consumed += take;
        }
        if let Some(m) = new_munro {
            if let Some(path) = checkpoint_path {
                if let Err(e) = tree.write_checkpoint(path) {
                    warn!(error = %e, "live checkpoint write failed");
                }
            }
            debug!(munro = %m.bin, "announcing new munro");
            // Wake established channels so the munro goes out promptly.
            for ch in self.channels.values_mut() {
                if ch.is_established() {
                    ch.next_send_time = now;
                }
            }
        }
        Ok(consumed)
    }

    /// Persist the `.mhash`/`.mbinmap` sidecars.
    pub fn checkpoint(&self) -> Result<(), SwiftError> {
        let (Some(mhash), Some(mbinmap)) = (&self.mhash_path, &self.mbinmap_path) else {
            return Err(SwiftError::NotFound);
        };
        match &self.content {
            Content::File { hashtree, .. } => {
                hashtree.checkpoint(mhash, mbinmap)?;
                Ok(())
            }
            Content::Live { .. } => Err(SwiftError::NotFound),
        }
    }

    /// Zero-state transfers shut down once the swarm stops using them.
    pub fn should_shutdown(&self) -> bool {
        self.is_zero_state() && self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtree::{HashTree, Sha1Hash};

    fn test_transfer(tag: &str, local_port: u16) -> Transfer {
        let dir = std::env::temp_dir().join(format!("tswift_tr_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let storage = crate::storage::Storage::open(&dir.join("t.dat"), &dir, 0).unwrap();
        let root = Sha1Hash::from_bytes_digest(tag.as_bytes());
        let content = Content::File {
            hashtree: HashTree::new_client(root, 1024),
            avail: Availability::new(4),
            zero_state: false,
        };
        Transfer::new(
            1,
            SwarmId::File(root),
            content,
            storage,
            None,
            Handshake::default(),
            0x5A5A_5A5A,
            local_port,
            0,
        )
    }

    fn channel(id: u32, peer: &str) -> Channel {
        Channel::new(id, peer.parse().unwrap(), Handshake::default(), 0)
    }

    #[test]
    fn test_mismatch_after_own_id_confirmed_closes() {
        let t = test_transfer("ownid", 7000);
        let mut ch = channel(1, "192.168.1.10:6000");
        ch.own_id_mentioned = true;
        // Even a private mirror address is invalid once the channel's own
        // id has been echoed back.
        assert!(t.duplicate_or_stray(&mut ch, "192.168.1.11:6000".parse().unwrap()));
        assert!(t.duplicate_or_stray(&mut ch, "203.0.113.9:6000".parse().unwrap()));
    }

    #[test]
    fn test_public_address_mismatch_closes() {
        let t = test_transfer("public", 7000);
        let mut ch = channel(1, "203.0.113.5:6000");
        // No NAT in play for a public sender; a different address is a stray.
        assert!(t.duplicate_or_stray(&mut ch, "203.0.113.6:6000".parse().unwrap()));
    }

    #[test]
    fn test_nat_mirror_tiebreak_by_port() {
        // Two peers behind one NAT: the reply comes from the internal
        // address while another channel already dials it.
        let mirror: SocketAddr = "10.0.0.8:7100".parse().unwrap();

        let mut t = test_transfer("mirror-close", 7000);
        t.open_channel(2, mirror, 0);
        let mut ch = channel(1, "198.51.100.20:7100");
        // Sender port above ours: this channel loses the tiebreak.
        assert!(t.duplicate_or_stray(&mut ch, mirror));
        assert_eq!(ch.recv_peer, Some(mirror));

        let mut t = test_transfer("mirror-keep", 7200);
        t.open_channel(2, mirror, 0);
        let mut ch = channel(1, "198.51.100.20:7100");
        // Sender port below ours: keep this channel.
        assert!(!t.duplicate_or_stray(&mut ch, mirror));
    }

    #[test]
    fn test_private_mirror_without_duplicate_is_kept() {
        let t = test_transfer("lone", 7000);
        let mut ch = channel(1, "198.51.100.20:7100");
        let from: SocketAddr = "10.0.0.9:7100".parse().unwrap();
        assert!(!t.duplicate_or_stray(&mut ch, from));
        assert_eq!(ch.recv_peer, Some(from));
    }
}
