//! Swarm-wide chunk availability, bucketed by rarity.
//!
//! `rarity[r]` holds the bins currently announced by exactly `r + 1`
//! connected peers; the levels partition the announced bin space. A HAVE
//! moves the newly-announced bins one level up, a leaving peer moves its
//! bins one level down. Rarest-first picking walks the levels from 0 up.

use crate::bin::Bin;
use crate::binmap::Binmap;

use tracing::trace;

pub struct Availability {
    rarity: Vec<Binmap>,
}

impl Availability {
    /// `connections`: the per-transfer channel cap; availability saturates
    /// there.
    pub fn new(connections: usize) -> Availability {
        assert!(connections > 0);
        Availability {
            rarity: (0..connections).map(|_| Binmap::new()).collect(),
        }
    }

    pub fn levels(&self) -> usize {
        self.rarity.len()
    }

    /// Bins available at exactly `idx + 1` peers.
    pub fn level(&self, idx: usize) -> Option<&Binmap> {
        self.rarity.get(idx)
    }

    /// Account a HAVE for `target` from a peer whose prior announcements
    /// are `peer_ack_in`. Call before updating `peer_ack_in` itself: only
    /// the bins new to this peer move up a level.
    pub fn on_have(&mut self, peer_ack_in: &Binmap, target: Bin) {
        if peer_ack_in.is_filled_in(target) {
            return;
        }
        let mut fresh = Binmap::new();
        fresh.set(target);
        loop {
            let b = Binmap::find_complement_in(peer_ack_in, &fresh, target, 0);
            if b.is_none() {
                break;
            }
            trace!(bin = %b, "availability: bin gains a peer");
            self.inc(b, self.rarity.len() - 1);
            fresh.reset(b);
        }
    }

    /// Remove a leaving peer's announcements.
    pub fn remove_peer(&mut self, peer_ack_in: &Binmap) {
        if peer_ack_in.is_empty() {
            return;
        }
        let mut seen = Binmap::new();
        loop {
            let b = Binmap::find_complement(&seen, peer_ack_in, 0);
            if b.is_none() {
                break;
            }
            self.dec(b, self.rarity.len() - 1);
            seen.set(b);
        }
    }

    /// Move `bin` one level up, searching downward from `idx` for the level
    /// currently holding it; unknown bins enter at level 0.
    fn inc(&mut self, bin: Bin, idx: usize) {
        if self.rarity[idx].is_empty_in(bin) {
            if idx == 0 {
                self.rarity[0].set(bin);
            } else {
                self.inc(bin, idx - 1);
            }
        } else if self.rarity[idx].is_filled_in(bin) {
            if idx + 1 == self.rarity.len() {
                return; // saturated
            }
            self.rarity[idx].reset(bin);
            self.rarity[idx + 1].set(bin);
        } else {
            self.inc(bin.left(), idx);
            self.inc(bin.right(), idx);
        }
    }

    fn dec(&mut self, bin: Bin, idx: usize) {
        if self.rarity[idx].is_empty_in(bin) {
            if idx > 0 {
                self.dec(bin, idx - 1);
            }
        } else if self.rarity[idx].is_filled_in(bin) {
            self.rarity[idx].reset(bin);
            if idx > 0 {
                self.rarity[idx - 1].set(bin);
            }
        } else {
            self.dec(bin.left(), idx);
            self.dec(bin.right(), idx);
        }
    }
}
