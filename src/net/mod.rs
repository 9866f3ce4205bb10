//! Per-peer protocol machinery: wire codecs, the channel state machine and
//! the congestion controller.

pub mod channel;
pub mod send_control;
pub mod wire;

pub use channel::Channel;
pub use send_control::SendControl;
pub use wire::{
    ChunkAddr, ContentIntegrity, Handshake, MerkleHashFunc, MsgId, Version, LIVE_DISC_WND_ALL,
};
