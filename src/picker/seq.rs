//! Nearly-sequential picker with twist de-synchronisation.

use super::{clamp_width, HintShadow, PickContext, PiecePicker};
use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::time::Tint;

/// Picks low-numbered bins first; the twist (masked to the low 6 bits of
/// the first peak) shifts each peer's walk so identical leechers do not
/// all hammer the same chunk.
pub struct SeqPicker {
    shadow: HintShadow,
    twist: u64,
    range: Bin,
}

impl SeqPicker {
    pub fn new() -> SeqPicker {
        SeqPicker {
            shadow: HintShadow::new(),
            twist: 0,
            range: Bin::ALL,
        }
    }
}

impl Default for SeqPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl PiecePicker for SeqPicker {
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
            // Whoever answers first tells us the size via its peaks.
            return Bin::chunk(0);
        }
        self.twist &= ctx.first_peak.to_u64() & ((1 << 6) - 1);
        let hint = loop {
            let hint = Binmap::find_complement_in(
                &self.shadow.ack_hint_out,
                offered,
                self.range,
                self.twist,
            );
            if hint.is_none() {
                return hint;
            }
            if !ctx.ack_out.is_empty_in(hint) {
                // Unhinted or late data arrived meanwhile; resync and retry.
                Binmap::copy_range(&mut self.shadow.ack_hint_out, ctx.ack_out, hint);
                continue;
            }
            break hint;
        };
        let hint = clamp_width(hint, max_width);
        debug_assert!(self.shadow.ack_hint_out.is_empty_in(hint));
        self.shadow.commit(hint, now);
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TINT_SEC;

    fn ctx<'a>(ack_out: &'a Binmap, offers: &'a [&'a Binmap]) -> PickContext<'a> {
        PickContext {
            ack_out,
            size_known: true,
            first_peak: Bin::new(3, 0),
            avail: None,
            all_offers: offers,
            peer_count: 1,
            peer_is_source: false,
        }
    }

    #[test]
    fn test_picks_sequentially_and_tracks_hints() {
        let ack_out = Binmap::new();
        let mut offer = Binmap::new();
        offer.set(Bin::new(3, 0));
        let mut p = SeqPicker::new();
        let c = ctx(&ack_out, &[]);

        let first = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(first, Bin::chunk(0));
        let second = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(second, Bin::chunk(1));
        // Wider cap asks for a wider bin.
        let third = p.pick(&c, &offer, 2, 0, 1);
        assert_eq!(third, Bin::new(1, 1));
    }

    #[test]
    fn test_hints_expire_and_get_repicked() {
        let ack_out = Binmap::new();
        let mut offer = Binmap::new();
        offer.set(Bin::new(2, 0));
        let mut p = SeqPicker::new();
        let c = ctx(&ack_out, &[]);

        let first = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(first, Bin::chunk(0));
        // Not answered: after expiry the same chunk is pickable again.
        let again = p.pick(&c, &offer, 1, 2 * TINT_SEC, 1);
        assert_eq!(again, Bin::chunk(0));
    }

    #[test]
    fn test_skips_chunks_already_acked() {
        let mut ack_out = Binmap::new();
        ack_out.set(Bin::chunk(0));
        let mut offer = Binmap::new();
        offer.set(Bin::new(2, 0));
        let mut p = SeqPicker::new();
        // Shadow copies ack_out lazily via the late-data path.
        let c = ctx(&ack_out, &[]);
        let got = p.pick(&c, &offer, 1, 0, 1);
        assert_eq!(got, Bin::chunk(1));
    }

    #[test]
    fn test_limit_range() {
        let ack_out = Binmap::new();
        let mut offer = Binmap::new();
        offer.set(Bin::new(3, 0));
        let mut p = SeqPicker::new();
        p.limit_range(Bin::new(1, 2));
        let c = ctx(&ack_out, &[]);
        let got = p.pick(&c, &offer, 4, 0, 1);
        assert!(Bin::new(1, 2).contains(got));
    }
}
