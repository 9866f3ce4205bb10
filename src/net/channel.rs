//! Per-peer channel state.
//!
//! A channel loosely corresponds to a TCP connection: one per (peer,
//! transfer) pair, identified by a local id that travels scrambled on the
//! wire. The struct is pure state plus self-contained bookkeeping helpers
//! (ack accounting, hint queues, retransmission, RTT/OWD estimation); the
//! message handlers and datagram composition live with the transfer, which
//! owns every channel and the content they talk about.

use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::net::send_control::SendControl;
use crate::net::wire::Handshake;
use crate::time::{Tint, TINT_MSEC, TINT_NEVER, TINT_SEC};

use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Inactivity limit: no datagram for this long closes the channel.
pub const CHANNEL_TIMEOUT: Tint = 60 * TINT_SEC;

/// Entries older than this leave the retransmit queue for good.
pub const MAX_POSSIBLE_RTT: Tint = 10 * TINT_SEC;

/// RTT deviation floor for the ack timeout.
pub const MIN_DEV: Tint = 50 * TINT_MSEC;

/// Minimum spacing between PEX_REQs on one channel.
pub const MIN_PEX_REQUEST_INTERVAL: Tint = TINT_SEC;

/// Hints are planned for at least this long ahead.
pub const HINT_TIME: Tint = TINT_SEC;

/// A timestamped bin; the workhorse of every queue on the channel.
pub type TintBin = (Tint, Bin);

pub struct Channel {
    /// Local channel id; scrambled on the wire.
    pub id: u32,
    pub peer: SocketAddr,
    /// Address the last datagram actually came from, when it differs from
    /// `peer` (two peers behind one NAT).
    pub recv_peer: Option<SocketAddr>,
    pub own_id_mentioned: bool,

    /// Handshake I send; swarm id omitted.
    pub hs_out: Handshake,
    /// Handshake the peer sent, once seen.
    pub hs_in: Option<Handshake>,

    /// Peer's progress, from its HAVEs and ACKs.
    pub ack_in: Binmap,
    /// Rightmost base bin the peer ever announced (live window clamp).
    pub ack_in_right_basebin: Bin,

    /// Last chunk received, to be acked in the next datagram; a time of
    /// `TINT_NEVER` sends a HAVE instead (duplicate data).
    pub data_in: TintBin,
    /// Wide HAVE to repeat for redundancy.
    pub data_in_dbl: Bin,

    /// Chunks sent and not yet acknowledged.
    pub data_out: VecDeque<TintBin>,
    pub data_out_size: u32,
    /// Timed-out chunks, candidates for retransmission.
    pub data_out_tmo: VecDeque<TintBin>,
    pub data_out_cap: Bin,

    /// HAVE cursor: what we already told this peer we have.
    pub have_out: Binmap,

    /// Peer's requests to us, split to base bins as they are served.
    pub hint_in: VecDeque<TintBin>,
    pub hint_in_size: u64,
    /// Our outstanding requests to the peer.
    pub hint_out: VecDeque<TintBin>,
    pub hint_out_size: u64,
    /// Requests granted by the picker but not yet sent.
    pub hint_queue_out: VecDeque<TintBin>,
    pub hint_queue_out_size: u64,
    /// CANCELs waiting to go out.
    pub cancel_out: VecDeque<Bin>,
    /// Peer asked us to stop serving (CHOKE).
    pub choked: bool,

    // PEX
    pub pex_requested: bool,
    pub last_pex_request_time: Tint,
    pub next_pex_request_time: Tint,
    pub pex_request_outstanding: bool,
    /// (due time, other channel id) pairs for reverse PEX.
    pub reverse_pex_out: VecDeque<(Tint, u32)>,
    pub useless_pex_count: u32,

    // Smoothed estimators
    pub rtt_avg: Tint,
    pub dev_avg: Tint,
    /// Data inter-arrival period.
    pub dip_avg: Tint,

    pub last_send_time: Tint,
    pub last_recv_time: Tint,
    pub last_data_out_time: Tint,
    pub last_data_in_time: Tint,
    pub last_loss_time: Tint,
    pub next_send_time: Tint,
    pub open_time: Tint,

    // Congestion state
    pub cwnd: f64,
    pub send_interval: Tint,
    pub send_control: SendControl,
    pub sent_since_recv: u32,
    pub last_recv_was_keepalive: bool,
    pub last_send_was_keepalive: bool,
    /// Live: got a HAVE with no hints outstanding; request right away.
    pub live_have_no_hint: bool,
    pub ack_rcvd_recent: u32,
    pub ack_not_rcvd_recent: u32,

    // LEDBAT one-way-delay machinery: a 10-slot rolling minimum plus the
    // delay samples of the last RTT.
    pub owd_min_bins: [Tint; 10],
    pub owd_min_bin: usize,
    pub owd_min_bin_start: Tint,
    pub owd_cur: Tint,
    pub owd_min: Tint,
    /// (owd sample, arrival time), newest at the front.
    pub owd_current: VecDeque<(Tint, Tint)>,

    // Stats
    pub dgrams_sent: u32,
    pub dgrams_rcvd: u32,
    pub raw_bytes_up: u64,
    pub raw_bytes_down: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,

    pub scheduled_for_delete: bool,

    // Live
    pub last_sent_munro: Bin,
    pub munro_ack_rcvd: bool,

    /// First hint and its time, for the RTT sanity correction.
    pub rtt_hint: TintBin,
}

impl Channel {
    pub fn new(id: u32, peer: SocketAddr, hs_out: Handshake, now: Tint) -> Channel {
        debug!(id, %peer, "channel open");
        Channel {
            id,
            peer,
            recv_peer: None,
            own_id_mentioned: false,
            hs_out,
            hs_in: None,
            ack_in: Binmap::new(),
            ack_in_right_basebin: Bin::NONE,
            data_in: (TINT_NEVER, Bin::NONE),
            data_in_dbl: Bin::NONE,
            data_out: VecDeque::new(),
            data_out_size: 0,
            data_out_tmo: VecDeque::new(),
            data_out_cap: Bin::ALL,
            have_out: Binmap::new(),
            hint_in: VecDeque::new(),
            hint_in_size: 0,
            hint_out: VecDeque::new(),
            hint_out_size: 0,
            hint_queue_out: VecDeque::new(),
            hint_queue_out_size: 0,
            cancel_out: VecDeque::new(),
            choked: false,
            pex_requested: false,
            last_pex_request_time: 0,
            next_pex_request_time: 0,
            pex_request_outstanding: false,
            reverse_pex_out: VecDeque::new(),
            useless_pex_count: 0,
            rtt_avg: TINT_SEC,
            dev_avg: 0,
            dip_avg: TINT_SEC,
            last_send_time: 0,
            last_recv_time: 0,
            last_data_out_time: 0,
            last_data_in_time: 0,
            last_loss_time: 0,
            next_send_time: 0,
            open_time: now,
            cwnd: 1.0,
            send_interval: TINT_SEC,
            send_control: SendControl::PingPong,
            sent_since_recv: 0,
            last_recv_was_keepalive: false,
            last_send_was_keepalive: false,
            live_have_no_hint: false,
            ack_rcvd_recent: 0,
            ack_not_rcvd_recent: 0,
            owd_min_bins: [TINT_NEVER; 10],
            owd_min_bin: 0,
            owd_min_bin_start: now - crate::net::send_control::LEDBAT_ROLLOVER,
            owd_cur: TINT_NEVER,
            owd_min: TINT_NEVER,
            owd_current: VecDeque::new(),
            dgrams_sent: 0,
            dgrams_rcvd: 0,
            raw_bytes_up: 0,
            raw_bytes_down: 0,
            bytes_up: 0,
            bytes_down: 0,
            scheduled_for_delete: false,
            last_sent_munro: Bin::NONE,
            munro_ack_rcvd: false,
            rtt_hint: (TINT_NEVER, Bin::NONE),
        }
    }

    /// Established: the peer told us its channel id and echoed ours.
    pub fn is_established(&self) -> bool {
        self.own_id_mentioned
            && self
                .hs_in
                .as_ref()
                .map(|hs| hs.peer_channel_id != 0)
                .unwrap_or(false)
    }

    pub fn peer_channel_id(&self) -> u32 {
        self.hs_in.as_ref().map(|hs| hs.peer_channel_id).unwrap_or(0)
    }

    /// Retransmission timeout: smoothed RTT plus four deviations, floored
    /// at `MIN_DEV` and capped at 30 s.
    pub fn ack_timeout(&self) -> Tint {
        let dev = self.dev_avg.max(MIN_DEV);
        (self.rtt_avg + dev * 4).min(30 * TINT_SEC)
    }

    /// Whether this peer holds the complete content, judged by its acks
    /// against the given peak set.
    pub fn peer_is_complete(&self, peaks: &[Bin]) -> bool {
        if peaks.is_empty() {
            return false;
        }
        peaks.iter().all(|p| self.ack_in.is_filled_in(*p))
    }

    /*
     * Ack accounting
     */

    /// Process one acked bin: unqueue sent data, update RTT estimators.
    /// Returns whether the ack matched an outstanding transmission.
    pub fn on_ack_bin(&mut self, pos: Bin, peer_owd: Tint, now: Tint) -> bool {
        self.munro_ack_rcvd = true;
        self.ack_in.set(pos);

        if let Some(di) = self
            .data_out
            .iter()
            .position(|&(t, b)| t != TINT_NEVER && pos.contains(b))
        {
            let rtt = now - self.data_out[di].0;
            self.rtt_avg = (self.rtt_avg * 7 + rtt) >> 3;
            self.dev_avg = (self.dev_avg * 3 + (rtt - self.rtt_avg).abs()) >> 2;
            trace!(
                id = self.id,
                rtt,
                rtt_avg = self.rtt_avg,
                dev_avg = self.dev_avg,
                "ack rtt sample"
            );
            self.update_owd(peer_owd, now);
            self.data_out[di] = (TINT_NEVER, Bin::NONE);
            self.data_out_size -= 1;
            return true;
        }
        if let Some(ri) = self
            .data_out_tmo
            .iter()
            .position(|&(_, b)| pos.contains(b))
        {
            // Late ack for a timed-out chunk still carries a delay sample.
            self.update_owd(peer_owd, now);
            self.data_out_tmo[ri] = (TINT_NEVER, Bin::NONE);
            return true;
        }
        false
    }

    /// Record a one-way-delay sample into the rolling-minimum bins and the
    /// recent-sample window.
    pub fn update_owd(&mut self, owd: Tint, now: Tint) {
        self.owd_current.push_front((owd, now));
        if self.owd_min_bin_start + crate::net::send_control::LEDBAT_ROLLOVER < now {
            self.owd_min_bin_start = now;
            self.owd_min_bin = (self.owd_min_bin + 1) % self.owd_min_bins.len();
            self.owd_min_bins[self.owd_min_bin] = owd;
        } else if self.owd_min_bins[self.owd_min_bin] > owd {
            self.owd_min_bins[self.owd_min_bin] = owd;
        }
        self.ack_rcvd_recent += 1;
    }

    /// Update the data inter-arrival estimate after receiving a chunk
    /// (duplicates included, so the estimate does not skew).
    pub fn update_dip(&mut self, pos: Bin, now: Tint) {
        if !pos.is_none() {
            if self.last_data_in_time != 0 {
                let dip = now - self.last_data_in_time;
                self.dip_avg = (self.dip_avg * 3 + dip) >> 2;
            }
            self.last_data_in_time = now;
        }
        // RTT sanity correction: the initial RTT sample may be wildly off
        // in a plain client/server exchange; the hint->data gap bounds it.
        if self.rtt_hint.1 == pos && !pos.is_none() {
            let diff = now - self.rtt_hint.0;
            if diff < self.rtt_avg >> 1 {
                debug!(id = self.id, old = self.rtt_avg, new = diff, "rtt adjust");
                self.rtt_avg = diff;
            }
            let owd = self.data_in.0;
            if owd != TINT_NEVER && owd << 2 > self.rtt_avg {
                self.rtt_avg = owd << 2;
            }
            self.rtt_hint = (TINT_NEVER, Bin::NONE);
        }
    }

    /// Sweep: move unacked-and-overdue chunks to the retransmit queue and
    /// age both queues.
    pub fn timeout_data_out(&mut self, now: Tint) {
        let mut timeout = now - self.ack_timeout();
        if self.send_control != SendControl::Ledbat {
            // Only time out aggressively while actively clocked.
            timeout -= self.ack_timeout() << 1;
        }
        while let Some(&(t, b)) = self.data_out.front() {
            if t >= timeout && t != TINT_NEVER {
                break;
            }
            if t != TINT_NEVER && self.ack_in.is_empty_in(b) {
                self.ack_not_rcvd_recent += 1;
                self.data_out_cap = Bin::ALL;
                self.data_out_tmo.push_back((t, b));
                self.data_out_size -= 1;
                debug!(id = self.id, bin = %b, "data timeout");
            }
            self.data_out.pop_front();
        }
        while let Some(&(t, _)) = self.data_out_tmo.front() {
            if t != TINT_NEVER && t >= now - MAX_POSSIBLE_RTT {
                break;
            }
            self.data_out_tmo.pop_front();
        }
        // The delay window keeps at least 4 samples.
        while self.owd_current.len() > 4 {
            match self.owd_current.back() {
                Some(&(_, t)) if t < timeout => {
                    self.owd_current.pop_back();
                }
                _ => break,
            }
        }
    }

    /*
     * Hint queues
     */

    /// Take the next chunk to transmit: first a still-unacked retransmit,
    /// then the head of the peer's request queue.
    pub fn dequeue_hint(&mut self, now: Tint) -> (Bin, bool) {
        // No DATA to a peer that went quiet.
        if self.last_recv_time < now - 3 * TINT_SEC {
            return (Bin::NONE, false);
        }
        while let Some((_, b)) = self.data_out_tmo.pop_front() {
            if b.is_none() || self.ack_in.is_filled_in(b) {
                continue; // acked meanwhile
            }
            debug!(id = self.id, bin = %b, "retransmit");
            return (b, true);
        }
        while let Some((t, hint)) = self.hint_in.pop_front() {
            self.hint_in_size -= hint.base_length();
            // Serve base bins; push back the remainder of wide hints.
            let mut hint = hint;
            while !hint.is_base() {
                self.hint_in.push_front((t, hint.right()));
                self.hint_in_size += hint.right().base_length();
                hint = hint.left();
            }
            if !self.ack_in.is_filled_in(hint) {
                return (hint, false);
            }
        }
        (Bin::NONE, false)
    }

    /// Queue a request from the peer.
    pub fn enqueue_hint_in(&mut self, hint: Bin, now: Tint) {
        self.hint_in.push_back((now, hint));
        self.hint_in_size += hint.base_length();
        trace!(id = self.id, bin = %hint, total = self.hint_in_size, "hint in");
    }

    /// Drop outstanding hints that the peer ignored for too long; they are
    /// re-picked later. Returns the dropped bins for CANCELs.
    pub fn clean_stale_hint_out(&mut self, now: Tint) -> Vec<Bin> {
        let plan_for = HINT_TIME.max(self.rtt_avg << 2);
        let timed_out = now - plan_for * 2;
        let mut dropped = Vec::new();
        while let Some(&(t, b)) = self.hint_out.front() {
            if t >= timed_out {
                break;
            }
            self.hint_out_size -= b.base_length();
            self.hint_out.pop_front();
            dropped.push(b);
            debug!(id = self.id, bin = %b, "hint expired");
        }
        dropped
    }

    /// Remove `pos` from the outstanding-hint queue, discarding hints that
    /// were evidently snubbed (requested before `pos` but never served).
    pub fn clean_hint_out(&mut self, pos: Bin) {
        let mut hi = 0;
        while hi < self.hint_out.len() && !self.hint_out[hi].1.contains(pos) {
            hi += 1;
        }
        if hi == self.hint_out.len() {
            return;
        }
        for _ in 0..hi {
            let (_, hint) = self.hint_out.pop_front().expect("counted");
            self.hint_out_size -= hint.base_length();
        }
        // Split the covering hint until `pos` is at the front.
        while self.hint_out.front().map(|&(_, b)| b) != Some(pos) {
            let (t, b) = self.hint_out.pop_front().expect("cover exists");
            debug_assert!(b.contains(pos));
            let half = if pos < b { b.left() } else { b.right() };
            self.hint_out.push_front((t, half.sibling()));
            self.hint_out.push_front((t, half));
        }
        let (_, served) = self.hint_out.pop_front().expect("front is pos");
        self.hint_out_size -= served.base_length();
    }

    /// Pop a sub-hint of at most `size` chunks from the granted queue.
    pub fn dequeue_hint_out(&mut self, size: u64, now: Tint) -> Bin {
        // Age the granted-but-unsent queue as well.
        while let Some(&(t, b)) = self.hint_queue_out.front() {
            if t >= now - TINT_SEC * 3 / 2 {
                break;
            }
            self.hint_queue_out_size -= b.base_length();
            self.hint_queue_out.pop_front();
        }
        if self.hint_queue_out_size == 0 || size == 0 {
            return Bin::NONE;
        }
        while self
            .hint_queue_out
            .front()
            .map(|&(_, b)| b.base_length() > size)
            .unwrap_or(false)
        {
            let (t, b) = self.hint_queue_out.pop_front().expect("checked");
            self.hint_queue_out.push_front((t, b.right()));
            self.hint_queue_out.push_front((t, b.left()));
        }
        let (_, b) = self.hint_queue_out.pop_front().expect("non-empty");
        self.hint_queue_out_size -= b.base_length();
        b
    }

    /// Apply a CANCEL: remove covered queue entries and fragment partially
    /// covered ones. Requests already in flight are left alone.
    pub fn on_cancel_bin(&mut self, cancel: Bin) {
        debug!(id = self.id, bin = %cancel, "cancel");
        // 1. Drop queued hints the cancel covers.
        let mut kept = VecDeque::with_capacity(self.hint_in.len());
        let mut size = 0u64;
        for (t, b) in self.hint_in.drain(..) {
            if cancel.contains(b) {
                continue;
            }
            if b.contains(cancel) {
                // 2. Fragment a wider hint around the cancelled part.
                for frag in crate::net::wire::bin_fragment(b, cancel) {
                    size += frag.base_length();
                    kept.push_back((t, frag));
                }
                continue;
            }
            size += b.base_length();
            kept.push_back((t, b));
        }
        self.hint_in = kept;
        self.hint_in_size = size;
    }

    /*
     * Keep-alive bookkeeping
     */

    pub fn mark_send(&mut self, raw_len: usize, keepalive: bool, now: Tint) {
        self.last_send_time = now;
        self.last_send_was_keepalive = keepalive;
        self.sent_since_recv += 1;
        self.dgrams_sent += 1;
        self.raw_bytes_up += raw_len as u64;
    }

    pub fn mark_recv(&mut self, raw_len: usize, keepalive: bool, now: Tint) {
        self.last_recv_was_keepalive = keepalive;
        self.dgrams_rcvd += 1;
        self.raw_bytes_down += raw_len as u64;
        // First response initialises the estimators off the handshake RTT.
        if self.last_send_time != 0 && self.rtt_avg == TINT_SEC && self.dev_avg == 0 {
            self.rtt_avg = now - self.last_send_time;
            self.dev_avg = self.rtt_avg;
            self.dip_avg = self.rtt_avg;
            debug!(id = self.id, rtt = self.rtt_avg, "rtt init");
        }
        self.last_recv_time = now;
        self.sent_since_recv = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::Handshake;

    fn test_channel() -> Channel {
        let peer: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        Channel::new(1, peer, Handshake::default(), 0)
    }

    #[test]
    fn test_ack_updates_rtt_and_clears_data_out() {
        let mut ch = test_channel();
        ch.data_out.push_back((1000, Bin::chunk(3)));
        ch.data_out_size = 1;
        assert!(ch.on_ack_bin(Bin::chunk(3), 500, 101_000));
        assert_eq!(ch.data_out_size, 0);
        assert!(ch.ack_in.is_filled_in(Bin::chunk(3)));
        assert!(ch.rtt_avg < TINT_SEC);
        assert_eq!(ch.ack_rcvd_recent, 1);
    }

    #[test]
    fn test_timeout_moves_to_retransmit_queue() {
        let mut ch = test_channel();
        ch.send_control = SendControl::Ledbat;
        ch.data_out.push_back((0, Bin::chunk(1)));
        ch.data_out_size = 1;
        let later = ch.ack_timeout() + TINT_SEC;
        ch.timeout_data_out(later);
        assert_eq!(ch.data_out_size, 0);
        assert_eq!(ch.data_out_tmo.len(), 1);
        assert_eq!(ch.ack_not_rcvd_recent, 1);
        // Retransmit dequeues it (peer recently alive).
        ch.last_recv_time = later;
        let (bin, retx) = ch.dequeue_hint(later);
        assert_eq!(bin, Bin::chunk(1));
        assert!(retx);
    }

    #[test]
    fn test_wide_hint_served_base_first() {
        let mut ch = test_channel();
        ch.last_recv_time = 1;
        ch.enqueue_hint_in(Bin::new(1, 0), 1);
        let (a, _) = ch.dequeue_hint(1);
        assert_eq!(a, Bin::chunk(0));
        let (b, _) = ch.dequeue_hint(1);
        assert_eq!(b, Bin::chunk(1));
        let (c, _) = ch.dequeue_hint(1);
        assert!(c.is_none());
    }

    #[test]
    fn test_cancel_fragments_wide_hint() {
        let mut ch = test_channel();
        ch.enqueue_hint_in(Bin::new(2, 0), 1);
        ch.on_cancel_bin(Bin::new(1, 0));
        let bins: Vec<Bin> = ch.hint_in.iter().map(|&(_, b)| b).collect();
        assert_eq!(bins, vec![Bin::chunk(2), Bin::chunk(3)]);
        assert_eq!(ch.hint_in_size, 2);
    }

    #[test]
    fn test_clean_hint_out_splits_cover() {
        let mut ch = test_channel();
        ch.hint_out.push_back((0, Bin::new(2, 0)));
        ch.hint_out_size = 4;
        ch.clean_hint_out(Bin::chunk(1));
        assert_eq!(ch.hint_out_size, 3);
        let bins: Vec<Bin> = ch.hint_out.iter().map(|&(_, b)| b).collect();
        assert_eq!(bins, vec![Bin::chunk(0), Bin::new(1, 1)]);
    }

    #[test]
    fn test_dequeue_hint_out_narrows_to_budget() {
        let mut ch = test_channel();
        ch.hint_queue_out.push_back((0, Bin::new(2, 0)));
        ch.hint_queue_out_size = 4;
        let b = ch.dequeue_hint_out(1, 0);
        assert_eq!(b, Bin::chunk(0));
        assert_eq!(ch.hint_queue_out_size, 3);
        let b = ch.dequeue_hint_out(2, 0);
        assert_eq!(b, Bin::chunk(1));
        let b = ch.dequeue_hint_out(2, 0);
        assert_eq!(b, Bin::new(1, 1));
        assert_eq!(ch.hint_queue_out_size, 0);
    }
}
