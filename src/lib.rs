//! tswift: a Peer-to-Peer Streaming Peer Protocol (PPSPP) transport core.
//!
//! Content is addressed by the root of a Merkle tree over fixed-size
//! chunks, so any peer holding any subset can serve verified pieces to any
//! other peer over UDP. Static files and live streams share the same
//! bin-addressed machinery; live trust flows from source-signed *munros*.
//!
//! The embedder supplies the event loop boundary (or uses
//! [`Runtime::run`]); everything else — binmaps, hash trees, channels,
//! congestion control, piece picking, storage mapping — lives here.

pub mod avail;
pub mod bin;
pub mod binmap;
pub mod error;
pub mod hashtree;
pub mod livesig;
pub mod livetree;
pub mod net;
pub mod picker;
pub mod runtime;
pub mod speed;
pub mod storage;
pub mod swarm;
pub mod time;
pub mod transfer;
pub mod uri;

pub use bin::Bin;
pub use binmap::Binmap;
pub use error::{AllocationError, ProtocolError, StorageError, SwiftError};
pub use hashtree::{HashTree, Sha1Hash, DEFAULT_CHUNK_SIZE};
pub use livesig::{KeyPair, LiveSigAlg, SwarmPubKey};
pub use livetree::{LiveHashTree, SignedMunro};
pub use net::{ChunkAddr, ContentIntegrity, Handshake, SendControl, Version};
pub use runtime::{LiveOptions, OpenOptions, PickerKind, Runtime};
pub use swarm::SwarmId;
pub use transfer::{Direction, Transfer};
pub use uri::{SwarmMeta, SwarmUri};
