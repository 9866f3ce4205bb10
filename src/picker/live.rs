//! Live stream picker: munro-based hook-in, then sequential toward the
//! stream head, with an optional skip policy and the small-swarm
//! source-bias optimisation.

use super::{clamp_width, HintShadow, PickContext, PiecePicker};
use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::time::Tint;

use std::collections::HashMap;
use tracing::debug;

/// Picks with the same current position this many times without success
/// before the skip policy is consulted.
const MAX_ATTEMPTS_BEFORE_CHUNK_DROP: u32 = 100;

/// Swarm size at which the chance of downloading from the source bottoms
/// out; beyond twice this the bias is gone.
const BIAS_LOW_NPEERS: u32 = 10;

/// Hook-in point search and sequential pick after it.
///
/// While searching, the picker records the latest munro each peer has
/// announced. Once two or more peers have reported, it hooks in at the
/// leftmost leaf of the newest munro that at least two peers can serve —
/// the second-highest per-peer latest munro — and switches to sequential
/// picking from there toward the stream head.
pub struct LivePicker {
    shadow: HintShadow,
    twist: u64,
    /// Hook-in frozen by the first committed pick.
    locked: bool,
    /// Latest munro per channel, collected during hook-in search.
    peer_munros: HashMap<u32, Bin>,
    hookin_bin: Bin,
    current_bin: Bin,
    /// Small-swarm sharing optimisation on/off.
    source_bias: bool,
    same_curbin_count: u32,
    /// Skip-policy attempt threshold; small in tests.
    attempts_before_drop: u32,
}

impl LivePicker {
    pub fn new(source_bias: bool) -> LivePicker {
        LivePicker {
            shadow: HintShadow::new(),
            twist: 0,
            locked: false,
            peer_munros: HashMap::new(),
            hookin_bin: Bin::NONE,
            current_bin: Bin::NONE,
            source_bias,
            same_curbin_count: 0,
            attempts_before_drop: MAX_ATTEMPTS_BEFORE_CHUNK_DROP,
        }
    }

    #[cfg(test)]
    pub fn with_drop_threshold(mut self, n: u32) -> LivePicker {
        self.attempts_before_drop = n;
        self
    }

    pub fn searching_hookin(&self) -> bool {
        self.hookin_bin.is_none()
    }

    pub fn hookin_pos(&self) -> Bin {
        self.hookin_bin
    }

    pub fn current_pos(&self) -> Bin {
        self.current_bin
    }

    /// Register a munro announced by `channel`. The hook-in point tracks
    /// the reports — the newest epoch at least two peers can serve — until
    /// the first committed pick freezes it. A munro straight from the
    /// source is authoritative and hooks in on its own.
    pub fn add_peer_munro(&mut self, channel: u32, munro: Bin, _source_time: Tint, is_source: bool) {
        let entry = self.peer_munros.entry(channel).or_insert(Bin::NONE);
        if entry.is_none() || munro > *entry {
            *entry = munro;
        }
        if self.locked {
            return;
        }
        if is_source {
            if self.hookin_bin.is_none() || munro.base_left() > self.hookin_bin {
                self.hookin_bin = munro.base_left();
                self.current_bin = self.hookin_bin;
                debug!(hookin = %self.hookin_bin, "live picker: hook-in at source");
            }
            return;
        }
        if self.peer_munros.len() < 2 {
            return;
        }
        // Second-highest per-peer latest munro: a lone runaway peer cannot
        // drag the hook-in to a position only it can serve.
        let mut latest: Vec<Bin> = self.peer_munros.values().copied().collect();
        latest.sort_unstable();
        let hook_munro = latest[latest.len() - 2];
        if hook_munro.is_none() {
            return;
        }
        self.hookin_bin = hook_munro.base_left();
        self.current_bin = self.hookin_bin;
        debug!(hookin = %self.hookin_bin, "live picker: hook-in");
    }

    /// A peer went away; its opinion should not pin the hook-in search.
    pub fn remove_peer(&mut self, channel: u32) {
        self.peer_munros.remove(&channel);
    }

    /// Largest bin offered and unhinted that covers `start`, grown while
    /// its sibling is equally available.
    fn pick_largest_bin(&self, offered: &Binmap, start: Bin) -> Bin {
        if !offered.is_filled_in(start) || !self.shadow.ack_hint_out.is_empty_in(start) {
            return Bin::NONE;
        }
        let mut good = start;
        let mut cur = start;
        while cur.is_left()
            && offered.is_filled_in(cur.sibling())
            && self.shadow.ack_hint_out.is_empty_in(cur.sibling())
        {
            good = cur.parent();
            cur = cur.parent();
        }
        good
    }

    /// Anything on offer strictly beyond the current position and not
    /// already hinted.
    fn pick_beyond_current(&self, offered: &Binmap) -> Bin {
        let mut masked = Binmap::new();
        Binmap::copy(&mut masked, &self.shadow.ack_hint_out);
        for b in crate::net::wire::chunk_range_to_bins(0, self.current_bin.base_offset()) {
            masked.set(b);
        }
        Binmap::find_complement(&masked, offered, 0)
    }

    /// Skip policy: advance past the current chunk only when no peer has it
    /// and at least one peer offers something further right.
    fn should_skip(&self, ctx: &PickContext<'_>) -> bool {
        let mut beyond = false;
        for offer in ctx.all_offers {
            if offer.is_filled_in(self.current_bin) {
                return false;
            }
            if !self.pick_beyond_current(offer).is_none() {
                beyond = true;
            }
        }
        beyond
    }
}

impl PiecePicker for LivePicker {
    fn randomize(&mut self, twist: u64) {
        self.twist = twist;
    }

    fn limit_range(&mut self, _range: Bin) {
        // Live streams have no fixed end to confine to.
    }

    fn pick(
        &mut self,
        ctx: &PickContext<'_>,
        offered: &Binmap,
        max_width: u64,
        now: Tint,
        _channel_id: u32,
    ) -> Bin {
        if self.hookin_bin.is_none() {
            return Bin::NONE;
        }
        self.shadow.expire(ctx.ack_out, now);

        // Advance past everything already verified.
        while ctx.ack_out.is_filled_in(self.current_bin) {
            self.current_bin = Bin::chunk(self.current_bin.base_offset() + 1);
            self.same_curbin_count = 0;
        }
        self.same_curbin_count += 1;

        let mut urgent = true;
        let mut hint = self.pick_largest_bin(offered, self.current_bin);
        if hint.is_none() {
            if self.same_curbin_count > self.attempts_before_drop {
                self.same_curbin_count = 0;
                if self.should_skip(ctx) {
                    self.current_bin = Bin::chunk(self.current_bin.base_offset() + 1);
                    debug!(skip_to = %self.current_bin, "live picker: skipping stuck chunk");
                    hint = self.pick_largest_bin(offered, self.current_bin);
                }
            }
            if hint.is_none() {
                urgent = false;
                hint = self.pick_beyond_current(offered);
            }
        }
        if hint.is_none() {
            return hint;
        }

        // Small swarms: leave non-urgent chunks for peers to forward,
        // instead of all leeching straight from the source.
        if self.source_bias && !urgent && ctx.peer_is_source {
            let n = ctx.peer_count.max(1) as i64;
            let low = BIAS_LOW_NPEERS as i64;
            let x = (n.min(low) - (n - low).max(0)).max(1);
            let dlprob = 1.0 / x as f64;
            if rand::random::<f64>() >= dlprob {
                // Trust the swarm to forward this chunk to us instead.
                return Bin::NONE;
            }
        }

        let hint = clamp_width(hint, max_width);
        debug_assert!(self.shadow.ack_hint_out.is_empty_in(hint));
        self.shadow.commit(hint, now);
        self.locked = true;
        hint
    }

    fn as_any_live(&self) -> Option<&LivePicker> {
        Some(self)
    }

    fn as_any_live_mut(&mut self) -> Option<&mut LivePicker> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(ack_out: &'a Binmap, offers: &'a [&'a Binmap]) -> PickContext<'a> {
        PickContext {
            ack_out,
            size_known: true,
            first_peak: Bin::NONE,
            avail: None,
            all_offers: offers,
            peer_count: offers.len() as u32,
            peer_is_source: false,
        }
    }

    #[test]
    fn test_no_pick_before_hookin() {
        let ack_out = Binmap::new();
        let offer = Binmap::new();
        let mut p = LivePicker::new(false);
        assert!(p.pick(&ctx(&ack_out, &[]), &offer, 1, 0, 1).is_none());
        assert!(p.searching_hookin());
    }

    #[test]
    fn test_hookin_two_peers() {
        // Peer 1 announces munros up to (0,103), peer 2 up to (0,104):
        // hook-in lands on the newest munro both sides of the swarm serve.
        let mut p = LivePicker::new(false);
        for i in 0..4 {
            p.add_peer_munro(1, Bin::chunk(100 + i), 0, false);
        }
        assert!(p.searching_hookin());
        for i in 0..4 {
            p.add_peer_munro(2, Bin::chunk(101 + i), 0, false);
        }
        assert!(!p.searching_hookin());
        assert_eq!(p.hookin_pos(), Bin::chunk(103));
    }

    #[test]
    fn test_hookin_eight_peers() {
        let mut p = LivePicker::new(false);
        for c in 1..8u32 {
            for i in 0..4 {
                p.add_peer_munro(c, Bin::chunk(100 + c as u64 + i), 0, false);
            }
        }
        assert!(!p.searching_hookin());
        assert_eq!(p.hookin_pos(), Bin::chunk(109));
    }

    #[test]
    fn test_hookin_ignores_single_runaway_peer() {
        // One peer far ahead of everyone must not drag the hook-in to a
        // position only it can serve.
        let mut q = LivePicker::new(false);
        for c in 1..8u32 {
            for i in 0..4 {
                q.add_peer_munro(c, Bin::chunk(100 + c as u64 + i), 0, false);
            }
        }
        for i in 0..4 {
            q.add_peer_munro(9, Bin::chunk(208 + i), 0, false);
        }
        assert_eq!(q.hookin_pos(), Bin::chunk(110));
    }

    #[test]
    fn test_hookin_at_munro_base_left() {
        let mut p = LivePicker::new(false);
        p.add_peer_munro(1, Bin::new(5, 481), 0, false);
        p.add_peer_munro(2, Bin::new(5, 482), 0, false);
        assert_eq!(p.hookin_pos(), Bin::new(5, 481).base_left());
    }

    #[test]
    fn test_sequential_after_hookin() {
        let ack_out = Binmap::new();
        let mut offer = Binmap::new();
        for i in 100..110 {
            offer.set(Bin::chunk(i));
        }
        let mut p = LivePicker::new(false);
        p.add_peer_munro(1, Bin::chunk(100), 0, false);
        p.add_peer_munro(2, Bin::chunk(100), 0, false);
        assert_eq!(p.hookin_pos(), Bin::chunk(100));

        let c = ctx(&ack_out, &[]);
        let a = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(a, Bin::chunk(100));
        let b = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(b, Bin::chunk(101));
    }

    #[test]
    fn test_picks_beyond_missing_chunk_without_advancing() {
        let ack_out = Binmap::new();
        // The peer has nothing at 100 but plenty beyond.
        let mut offer = Binmap::new();
        for i in 101..105 {
            offer.set(Bin::chunk(i));
        }
        let mut p = LivePicker::new(false);
        p.add_peer_munro(1, Bin::chunk(100), 0, false);
        p.add_peer_munro(2, Bin::chunk(100), 0, false);

        let c = ctx(&ack_out, &[]);
        let first = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(first, Bin::chunk(101));
        let second = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(second, Bin::chunk(102));
        // The stuck chunk stays current so it is requested the moment
        // somebody announces it.
        assert_eq!(p.current_pos(), Bin::chunk(100));
    }

    #[test]
    fn test_skip_policy_advances_over_dead_chunk() {
        let ack_out = Binmap::new();
        // The peer we are asking has nothing at all; another established
        // peer offers chunks beyond the stuck one.
        let empty_offer = Binmap::new();
        let mut other = Binmap::new();
        for i in 101..105 {
            other.set(Bin::chunk(i));
        }
        let offers = [&other];
        let mut p = LivePicker::new(false).with_drop_threshold(2);
        p.add_peer_munro(1, Bin::chunk(100), 0, false);
        p.add_peer_munro(2, Bin::chunk(100), 0, false);

        let c = ctx(&ack_out, &offers);
        for _ in 0..3 {
            assert!(p.pick(&c, &empty_offer, 1, 0, 1).is_none());
        }
        // Threshold crossed: the dead chunk is skipped.
        assert_eq!(p.current_pos(), Bin::chunk(101));
    }
}
