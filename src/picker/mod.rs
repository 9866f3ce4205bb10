//! Piece picking: choosing the next bin to request from a peer.
//!
//! Every picker answers the same question — given what the peer offers,
//! what do we ask for next — under a shared contract: the answer is set in
//! the peer's offer, empty in our own `ack_out` and in the outstanding-hint
//! shadow map, no wider than `max_width`, and as wide as possible under
//! those rules. Hints not answered within ~1.5 s fall out of the shadow map
//! and become pickable again.

mod live;
mod rarest;
mod seq;

pub use live::LivePicker;
pub use rarest::RarestFirstPicker;
pub use seq::SeqPicker;

use crate::avail::Availability;
use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::time::{Tint, TINT_SEC};

/// Outstanding hints become stale and re-pickable after this long.
pub const HINT_EXPIRY: Tint = 3 * TINT_SEC / 2;

/// The slice of transfer state a picker is allowed to look at.
pub struct PickContext<'a> {
    /// Chunks we already hold, verified.
    pub ack_out: &'a Binmap,
    /// Whether the content size is known yet (peaks in).
    pub size_known: bool,
    /// First peak of the tree; seeds the sequential twist.
    pub first_peak: Bin,
    /// Per-rarity availability, when the transfer keeps one.
    pub avail: Option<&'a Availability>,
    /// Established-peer offers, for the live skip policy.
    pub all_offers: &'a [&'a Binmap],
    /// Established peer count (leechers + seeders).
    pub peer_count: u32,
    /// Whether the peer being asked is the live source.
    pub peer_is_source: bool,
}

pub trait PiecePicker {
    /// Permute the pick order to de-synchronise identical peers.
    fn randomize(&mut self, twist: u64);

    /// Confine picks to the subtree `range`.
    fn limit_range(&mut self, range: Bin);

    /// Choose the next bin to request from a peer offering `offered`.
    /// Returns `NONE` when the peer has nothing (new) for us.
    fn pick(
        &mut self,
        ctx: &PickContext<'_>,
        offered: &Binmap,
        max_width: u64,
        now: Tint,
        channel_id: u32,
    ) -> Bin;

    /// Move the interest window for streaming playback. Pickers without a
    /// seek notion refuse.
    fn seek(&mut self, _offset: Bin) -> bool {
        false
    }

    /// Live-specific surface (hook-in state), when this is a live picker.
    fn as_any_live(&self) -> Option<&LivePicker> {
        None
    }

    fn as_any_live_mut(&mut self) -> Option<&mut LivePicker> {
        None
    }
}

/// Shared hint shadow bookkeeping: `ack_hint_out` mirrors `ack_out` plus
/// the bins hinted at recently.
pub(crate) struct HintShadow {
    pub ack_hint_out: Binmap,
    pub hint_out: std::collections::VecDeque<(Tint, Bin)>,
}

impl HintShadow {
    pub fn new() -> HintShadow {
        HintShadow {
            ack_hint_out: Binmap::new(),
            hint_out: std::collections::VecDeque::new(),
        }
    }

    /// Age out stale hints, restoring their region from `ack_out`.
    pub fn expire(&mut self, ack_out: &Binmap, now: Tint) {
        while let Some(&(t, bin)) = self.hint_out.front() {
            if t >= now - HINT_EXPIRY {
                break;
            }
            Binmap::copy_range(&mut self.ack_hint_out, ack_out, bin);
            self.hint_out.pop_front();
        }
    }

    pub fn commit(&mut self, hint: Bin, now: Tint) {
        self.ack_hint_out.set(hint);
        self.hint_out.push_back((now, hint));
    }
}

/// Narrow `hint` from the left until it fits `max_width` base bins.
pub(crate) fn clamp_width(mut hint: Bin, max_width: u64) -> Bin {
    let max_width = max_width.max(1);
    while hint.base_length() > max_width {
        hint = hint.left();
    }
    hint
}
