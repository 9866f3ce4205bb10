//! Error kinds and the action each one implies.
//!
//! Every failure is a value; nothing in the protocol needs unwinding.
//! The rule of thumb per kind: wire garbage closes the channel, integrity
//! failures discard the offending message, local failures take the whole
//! transfer down, and trust failures on live streams drop the munro.

use std::io;
use thiserror::Error;

/// Binmap cell-arena exhaustion. The map stays consistent; the mutation
/// that hit this is a no-op.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    #[error("binmap cell reference space exhausted")]
    RefLimit,
}

/// Malformed or unacceptable wire input. Closes the channel, no retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message id {0}")]
    UnknownMessage(u8),
    #[error("truncated {0} message")]
    Truncated(&'static str),
    #[error("protocol option {0} out of range")]
    BadOption(&'static str),
    #[error("chunk specification does not denote a single bin")]
    BadChunkSpec,
    #[error("unsupported protocol option combination")]
    Unsupported,
    #[error("datagram exceeds receive limit ({0} bytes)")]
    OversizedDatagram(usize),
}

/// Local byte-store failure. Marks the transfer inoperable.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage not ready: multi-file spec still incomplete")]
    NotReady,
    #[error("offset {0} outside the stored byte space")]
    OutOfRange(u64),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Top-level error surfaced by the public API.
#[derive(Error, Debug)]
pub enum SwiftError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("chunk or hash failed verification")]
    Integrity,
    #[error("live signature invalid")]
    Signature,
    #[error("munro timestamp diverges more than {0} s from local time")]
    Divergence(i64),
    #[error("munro not to the right of the previously signed one")]
    Monotonicity,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("bad or unusable peer address")]
    Address,
    #[error("duplicate channel to the same peer")]
    DuplicateChannel,
    #[error("unknown transfer or swarm")]
    NotFound,
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SwiftError>;
