//! Congestion control: when may this channel send its next datagram.
//!
//! ```text
//! Mode transitions:
//!
//!             10 unacked dgrams
//! ┌──────────┐────────────────►┌────────────┐
//! │ PING_PONG│                 │ KEEP_ALIVE │──── 3 keep-alives unanswered,
//! └────┬─────┘◄── nothing ─────└─────┬──────┘     3×MAX_SEND_INTERVAL silent
//!      │ first ack    to send        │ first ack            │
//!      ▼                             ▼                      ▼
//! ┌────────────┐  loss, or pipe ┌────────┐             ┌───────┐
//! │ SLOW_START │───────────────►│ LEDBAT │────────────►│ CLOSE │
//! └────────────┘  full (rtt/cwnd└────────┘  peer close └───────┘
//!                  < 100 ms)
//! ```
//!
//! SLOW_START grows the window by one per ack; LEDBAT targets 25 ms of
//! queueing delay over a 10-slot rolling one-way-delay minimum and halves
//! the window at most once per RTT on loss. AIMD is kept as the classical
//! fallback; the live code paths never enter it by default.

use crate::bin::Bin;
use crate::net::channel::Channel;
use crate::time::{Tint, TINT_MSEC, TINT_NEVER, TINT_SEC};

use tracing::debug;

/// Keep-alive back-off ceiling.
pub const MAX_SEND_INTERVAL: Tint = 58 * TINT_SEC;

/// LEDBAT target queueing delay.
pub const LEDBAT_TARGET: Tint = 25 * TINT_MSEC;

/// Window gain per off-target microsecond.
pub const LEDBAT_GAIN: f64 = 1.0 / LEDBAT_TARGET as f64;

/// Width of one rolling-minimum delay bin.
pub const LEDBAT_ROLLOVER: Tint = 30 * TINT_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendControl {
    KeepAlive,
    PingPong,
    SlowStart,
    Aimd,
    Ledbat,
    Close,
}

impl SendControl {
    pub fn name(self) -> &'static str {
        match self {
            SendControl::KeepAlive => "keepalive",
            SendControl::PingPong => "pingpong",
            SendControl::SlowStart => "slowstart",
            SendControl::Aimd => "standard_aimd",
            SendControl::Ledbat => "ledbat",
            SendControl::Close => "closing",
        }
    }
}

impl Channel {
    /// Compute when this channel should send next; may switch modes.
    pub fn next_send_time(&mut self, now: Tint) -> Tint {
        self.timeout_data_out(now); // know the free window first
        match self.send_control {
            SendControl::KeepAlive => self.keep_alive_next_send_time(now),
            SendControl::PingPong => self.ping_pong_next_send_time(now),
            SendControl::SlowStart => self.slow_start_next_send_time(now),
            SendControl::Aimd => self.aimd_next_send_time(now),
            SendControl::Ledbat => self.ledbat_next_send_time(now),
            SendControl::Close => TINT_NEVER,
        }
    }

    pub fn switch_send_control(&mut self, mode: SendControl, now: Tint) -> Tint {
        debug!(
            id = self.id,
            from = self.send_control.name(),
            to = mode.name(),
            "sendctrl switch"
        );
        match mode {
            SendControl::KeepAlive => {
                self.send_interval = self.rtt_avg;
                self.dev_avg = self.rtt_avg.max(TINT_SEC);
                self.data_out_cap = Bin::ALL;
                self.cwnd = 1.0;
            }
            SendControl::PingPong => {
                self.dev_avg = self.rtt_avg.max(TINT_SEC);
                self.data_out_cap = Bin::ALL;
                self.cwnd = 1.0;
            }
            SendControl::SlowStart => {
                self.cwnd = 1.0;
            }
            SendControl::Aimd | SendControl::Ledbat | SendControl::Close => {}
        }
        self.send_control = mode;
        self.next_send_time(now)
    }

    fn keep_alive_next_send_time(&mut self, now: Tint) -> Tint {
        if self.sent_since_recv >= 3 && self.last_recv_time < now - 3 * MAX_SEND_INTERVAL {
            return self.switch_send_control(SendControl::Close, now);
        }
        if self.ack_rcvd_recent != 0 {
            return self.switch_send_control(SendControl::SlowStart, now);
        }
        if self.data_in.0 != TINT_NEVER {
            return now; // an ack is owed
        }
        if self.live_have_no_hint {
            self.live_have_no_hint = false;
            return now;
        }
        if let Some(&(due, _)) = self.reverse_pex_out.front() {
            return due;
        }
        // Exponential back-off, but only between sends with no reply.
        if self.last_recv_was_keepalive && self.last_send_was_keepalive {
            self.send_interval <<= 1;
        } else if self.last_recv_was_keepalive || self.last_send_was_keepalive {
            if self.sent_since_recv < 4 {
                self.send_interval = self.rtt_avg;
            } else {
                self.send_interval <<= 1;
            }
        } else if self.sent_since_recv <= 1 {
            self.send_interval = self.rtt_avg;
        } else {
            self.send_interval <<= 1;
        }
        if self.send_interval > MAX_SEND_INTERVAL {
            self.send_interval = MAX_SEND_INTERVAL;
        }
        self.last_send_time + self.send_interval
    }

    fn ping_pong_next_send_time(&mut self, now: Tint) -> Tint {
        if self.dgrams_sent >= 10 {
            return self.switch_send_control(SendControl::KeepAlive, now);
        }
        if self.ack_rcvd_recent != 0 {
            return self.switch_send_control(SendControl::SlowStart, now);
        }
        if self.data_in.0 != TINT_NEVER {
            return now;
        }
        if self.last_recv_time > self.last_send_time {
            return now;
        }
        if self.last_send_time == 0 {
            return now;
        }
        self.last_send_time + self.ack_timeout()
    }

    /// Common clocked-send schedule for the windowed modes.
    fn cwnd_rate_next_send_time(&mut self, now: Tint) -> Tint {
        if self.data_in.0 != TINT_NEVER {
            return now; // ack owed
        }
        if self.last_recv_time < now - self.rtt_avg * 4 {
            return self.switch_send_control(SendControl::KeepAlive, now);
        }
        self.send_interval = (self.rtt_avg as f64 / self.cwnd) as Tint;
        if self.send_interval > self.rtt_avg.max(TINT_SEC) * 4 {
            return self.switch_send_control(SendControl::KeepAlive, now);
        }
        if (self.data_out_size as f64) < self.cwnd {
            self.last_data_out_time + self.send_interval
        } else {
            let due = self
                .data_out
                .front()
                .map(|&(t, _)| t)
                .unwrap_or(self.last_data_out_time);
            due + self.ack_timeout()
        }
    }

    /// Halve (or scale) the window, at most once per RTT.
    pub fn back_off_on_losses(&mut self, ratio: f64, now: Tint) {
        self.ack_not_rcvd_recent = 0;
        if self.last_loss_time < now - self.rtt_avg {
            self.cwnd *= ratio;
            self.last_loss_time = now;
            debug!(id = self.id, cwnd = self.cwnd, "sendctrl backoff");
        }
    }

    fn slow_start_next_send_time(&mut self, now: Tint) -> Tint {
        if self.ack_not_rcvd_recent != 0 {
            self.back_off_on_losses(0.5, now);
            return self.switch_send_control(SendControl::Ledbat, now);
        }
        if (self.rtt_avg as f64 / self.cwnd) < (TINT_SEC / 10) as f64 {
            // Pipe saturated: the clock is tighter than 100 ms per packet.
            return self.switch_send_control(SendControl::Ledbat, now);
        }
        self.cwnd += self.ack_rcvd_recent as f64;
        self.ack_rcvd_recent = 0;
        self.cwnd_rate_next_send_time(now)
    }

    fn aimd_next_send_time(&mut self, now: Tint) -> Tint {
        if self.ack_not_rcvd_recent != 0 {
            self.back_off_on_losses(0.5, now);
        }
        if self.ack_rcvd_recent != 0 {
            if self.cwnd > 1.0 {
                self.cwnd += self.ack_rcvd_recent as f64 / self.cwnd;
            } else {
                self.cwnd *= 2.0;
            }
        }
        self.ack_rcvd_recent = 0;
        self.cwnd_rate_next_send_time(now)
    }

    fn ledbat_next_send_time(&mut self, now: Tint) -> Tint {
        if self.ack_rcvd_recent != 0 {
            // Rolling minimum across the delay bins.
            self.owd_min = TINT_NEVER;
            for &b in &self.owd_min_bins {
                if self.owd_min > b {
                    self.owd_min = b;
                }
            }
            // Current delay: the acks of the last RTT, at least 4 samples.
            let timeout = now - self.rtt_avg;
            let mut total: Tint = 0;
            let mut count: Tint = 0;
            for &(owd, t) in &self.owd_current {
                if t <= timeout && count >= 4 {
                    break;
                }
                total += owd;
                count += 1;
            }
            if count > 0 {
                self.owd_cur = total / count;
            }

            if self.ack_not_rcvd_recent != 0 {
                self.back_off_on_losses(0.8, now);
            }
            self.ack_rcvd_recent = 0;

            let queueing_delay = self.owd_cur.saturating_sub(self.owd_min);
            let off_target = LEDBAT_TARGET - queueing_delay;
            self.cwnd += LEDBAT_GAIN * off_target as f64 / self.cwnd;
            if self.cwnd < 1.0 {
                self.cwnd = 1.0;
            }
            if self.owd_cur == TINT_NEVER || self.owd_min == TINT_NEVER {
                self.cwnd = 1.0;
            }
        }
        self.cwnd_rate_next_send_time(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::Handshake;
    use std::net::SocketAddr;

    fn test_channel(now: Tint) -> Channel {
        let peer: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        Channel::new(2, peer, Handshake::default(), now)
    }

    #[test]
    fn test_ping_pong_to_slow_start_on_ack() {
        let mut ch = test_channel(0);
        ch.data_out.push_back((0, Bin::chunk(0)));
        ch.data_out_size = 1;
        ch.on_ack_bin(Bin::chunk(0), 1000, 100_000);
        let t = ch.next_send_time(100_000);
        assert_eq!(ch.send_control, SendControl::SlowStart);
        assert!(t != TINT_NEVER);
    }

    #[test]
    fn test_ping_pong_to_keepalive_after_ten_datagrams() {
        let mut ch = test_channel(0);
        ch.dgrams_sent = 10;
        ch.last_send_time = 1;
        ch.last_recv_time = 0;
        let _ = ch.next_send_time(TINT_SEC);
        assert_eq!(ch.send_control, SendControl::KeepAlive);
    }

    #[test]
    fn test_slow_start_saturation_enters_ledbat() {
        let mut ch = test_channel(0);
        ch.send_control = SendControl::SlowStart;
        ch.rtt_avg = 50 * TINT_MSEC;
        ch.cwnd = 1.0;
        ch.last_recv_time = TINT_SEC;
        ch.last_data_out_time = TINT_SEC;
        // rtt/cwnd = 50 ms < 100 ms: saturated.
        let _ = ch.next_send_time(TINT_SEC);
        assert_eq!(ch.send_control, SendControl::Ledbat);
    }

    #[test]
    fn test_slow_start_loss_enters_ledbat_with_backoff() {
        let mut ch = test_channel(0);
        ch.send_control = SendControl::SlowStart;
        ch.cwnd = 8.0;
        ch.rtt_avg = 2 * TINT_SEC;
        ch.ack_not_rcvd_recent = 1;
        ch.last_recv_time = TINT_SEC;
        ch.last_data_out_time = TINT_SEC;
        let _ = ch.next_send_time(TINT_SEC);
        assert_eq!(ch.send_control, SendControl::Ledbat);
        assert!(ch.cwnd <= 4.0 + f64::EPSILON);
    }

    #[test]
    fn test_ledbat_converges_toward_target() {
        let mut ch = test_channel(0);
        ch.send_control = SendControl::Ledbat;
        ch.rtt_avg = 100 * TINT_MSEC;
        ch.cwnd = 4.0;
        let mut now = TINT_SEC;
        // Feed acks whose one-way delay sits at the base delay: the window
        // must grow (queueing delay 0 < target).
        for i in 0..50 {
            now += 10 * TINT_MSEC;
            ch.data_out.push_back((now - 50 * TINT_MSEC, Bin::chunk(i)));
            ch.data_out_size += 1;
            ch.on_ack_bin(Bin::chunk(i), 40 * TINT_MSEC, now);
            ch.last_recv_time = now;
            ch.last_data_out_time = now;
            let _ = ch.next_send_time(now);
        }
        assert_eq!(ch.send_control, SendControl::Ledbat);
        let grown = ch.cwnd;
        assert!(grown > 4.0, "cwnd {grown}");

        // Now delays far above base: the window must shrink.
        for i in 50..100 {
            now += 10 * TINT_MSEC;
            ch.data_out.push_back((now - 50 * TINT_MSEC, Bin::chunk(i)));
            ch.data_out_size += 1;
            ch.on_ack_bin(Bin::chunk(i), 40 * TINT_MSEC + 200 * TINT_MSEC, now);
            ch.last_recv_time = now;
            ch.last_data_out_time = now;
            let _ = ch.next_send_time(now);
        }
        assert!(ch.cwnd < grown, "cwnd {} after queueing", ch.cwnd);
        assert!(ch.cwnd >= 1.0);
    }

    #[test]
    fn test_keepalive_backoff_doubles_then_caps() {
        let mut ch = test_channel(0);
        ch.send_control = SendControl::KeepAlive;
        ch.rtt_avg = TINT_SEC;
        ch.send_interval = TINT_SEC;
        ch.last_send_time = 10 * TINT_SEC;
        ch.last_recv_time = 9 * TINT_SEC;
        ch.last_send_was_keepalive = true;
        ch.last_recv_was_keepalive = true;
        let mut prev = ch.send_interval;
        for _ in 0..10 {
            let _ = ch.next_send_time(20 * TINT_SEC);
            assert!(ch.send_interval >= prev);
            prev = ch.send_interval;
        }
        assert_eq!(ch.send_interval, MAX_SEND_INTERVAL);
    }

    #[test]
    fn test_keepalive_to_close_when_peer_silent() {
        let mut ch = test_channel(0);
        ch.send_control = SendControl::KeepAlive;
        ch.sent_since_recv = 3;
        ch.last_recv_time = 0;
        let t = ch.next_send_time(4 * MAX_SEND_INTERVAL);
        assert_eq!(ch.send_control, SendControl::Close);
        assert_eq!(t, TINT_NEVER);
    }
}
