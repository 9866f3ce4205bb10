//! Microsecond time scale used throughout the protocol core.
//!
//! All protocol state carries plain `Tint` microsecond counts taken from a
//! single monotonic epoch owned by the runtime; handlers receive `now` as a
//! parameter, which keeps every state machine clock-free and testable.

/// Microseconds. Signed so that differences are painless.
pub type Tint = i64;

pub const TINT_USEC: Tint = 1;
pub const TINT_MSEC: Tint = 1_000;
pub const TINT_SEC: Tint = 1_000_000;
pub const TINT_MIN: Tint = 60 * TINT_SEC;
pub const TINT_HOUR: Tint = 60 * TINT_MIN;

/// "Not scheduled" / "never happened".
pub const TINT_NEVER: Tint = Tint::MAX;

/// Render a tint as `h_mm_ss_mmm_uuu` for logs; `NEVER` stays symbolic.
pub fn tintstr(t: Tint) -> String {
    if t == TINT_NEVER {
        return "NEVER".into();
    }
    let hours = t / TINT_HOUR;
    let t = t % TINT_HOUR;
    let mins = t / TINT_MIN;
    let t = t % TINT_MIN;
    let secs = t / TINT_SEC;
    let t = t % TINT_SEC;
    let msecs = t / TINT_MSEC;
    let usecs = (t % TINT_MSEC) / TINT_USEC;
    format!("{hours}_{mins:02}_{secs:02}_{msecs:03}_{usecs:03}")
}
