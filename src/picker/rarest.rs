//! Rarest-first picker backed by the availability table.

use super::{clamp_width, HintShadow, PickContext, PiecePicker};
use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::time::Tint;

/// Walks the rarity levels from least to most replicated and requests the
/// rarest bin the peer actually offers; falls back to plain sequential
/// picking when no rarity information matches.
pub struct RarestFirstPicker {
    shadow: HintShadow,
    twist: u64,
    range: Bin,
}

impl RarestFirstPicker {
    pub fn new() -> RarestFirstPicker {
        RarestFirstPicker {
            shadow: HintShadow::new(),
            twist: 0,
            range: Bin::ALL,
        }
    }

    /// One pass over a rarity level: a bin filled at this level, offered by
    /// the peer and not yet hinted, narrowed through the shadow map.
    fn pick_at_level(
        &mut self,
        ctx: &PickContext<'_>,
        level: &Binmap,
        offered: &Binmap,
        now: Tint,
    ) -> Bin {
        let mut scratch = Binmap::new();
        Binmap::copy(&mut scratch, level);
        loop {
            let cand =
                Binmap::find_complement_in(&self.shadow.ack_hint_out, &scratch, self.range, self.twist);
            if cand.is_none() {
                return Bin::NONE;
            }
            // The rarity table is swarm-wide; this peer may not offer the
            // candidate at all.
            let hint = Binmap::find_complement_in(&self.shadow.ack_hint_out, offered, cand, self.twist);
            if hint.is_none() {
                scratch.reset(cand);
                continue;
            }
            if !ctx.ack_out.is_empty_in(hint) {
                // Late data: resync the shadow and start over.
                Binmap::copy_range(&mut self.shadow.ack_hint_out, ctx.ack_out, hint);
                scratch.reset(cand);
                continue;
            }
            let _ = now;
            return hint;
        }
    }
}

impl Default for RarestFirstPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl PiecePicker for RarestFirstPicker {
    fn randomize(&mut self, twist: u64) {
        self.twist = twist;
    }

    fn limit_range(&mut self, range: Bin) {
        self.range = range;
    }

    fn pick(
        &mut self,
        ctx: &PickContext<'_>,
        offered: &Binmap,
        max_width: u64,
        now: Tint,
        _channel_id: u32,
    ) -> Bin {
        self.shadow.expire(ctx.ack_out, now);
        if !ctx.size_known {
            return Bin::chunk(0);
        }

        let mut hint = Bin::NONE;
        if let Some(avail) = ctx.avail {
            for idx in 0..avail.levels() {
                let level = match avail.level(idx) {
                    Some(l) if !l.is_empty() => l,
                    _ => continue,
                };
                hint = self.pick_at_level(ctx, level, offered, now);
                if !hint.is_none() {
                    break;
                }
            }
        }

        if hint.is_none() {
            // Last resort: anything the peer has that we lack.
            hint = Binmap::find_complement_in(
                &self.shadow.ack_hint_out,
                offered,
                self.range,
                self.twist,
            );
            if !hint.is_none() && !ctx.ack_out.is_empty_in(hint) {
                Binmap::copy_range(&mut self.shadow.ack_hint_out, ctx.ack_out, hint);
                hint = Binmap::find_complement_in(
                    &self.shadow.ack_hint_out,
                    offered,
                    self.range,
                    self.twist,
                );
            }
        }
        if hint.is_none() {
            return hint;
        }
        let hint = clamp_width(hint, max_width);
        self.shadow.commit(hint, now);
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avail::Availability;

    #[test]
    fn test_prefers_rarest_offered_bin() {
        // Three peers with disjoint announcements; chunk 9 is rare (1 peer),
        // chunks 0..4 are common (3 peers).
        let mut avail = Availability::new(8);
        let none = Binmap::new();
        for _ in 0..3 {
            avail.on_have(&none, Bin::new(2, 0));
        }
        avail.on_have(&none, Bin::chunk(9));

        let ack_out = Binmap::new();
        let mut offer = Binmap::new();
        offer.set(Bin::new(2, 0));
        offer.set(Bin::chunk(9));

        let ctx = PickContext {
            ack_out: &ack_out,
            size_known: true,
            first_peak: Bin::new(4, 0),
            avail: Some(&avail),
            all_offers: &[],
            peer_count: 3,
            peer_is_source: false,
        };
        let mut p = RarestFirstPicker::new();
        let got = p.pick(&ctx, &offer, 1, 0, 1);
        assert_eq!(got, Bin::chunk(9));
    }

    #[test]
    fn test_falls_back_without_rarity_info() {
        let ack_out = Binmap::new();
        let mut offer = Binmap::new();
        offer.set(Bin::new(1, 0));
        let avail = Availability::new(8);
        let ctx = PickContext {
            ack_out: &ack_out,
            size_known: true,
            first_peak: Bin::new(1, 0),
            avail: Some(&avail),
            all_offers: &[],
            peer_count: 1,
            peer_is_source: false,
        };
        let mut p = RarestFirstPicker::new();
        let got = p.pick(&ctx, &offer, 1, 0, 1);
        assert_eq!(got, Bin::chunk(0));
    }
}
