//! # weft-sync
//!
//! The wire protocol engine: known-state negotiation, minimal content
//! diffs, and dependency-aware fan-out between peers.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- load {known} ---------->|
//!   |<------- known {state} ----------|
//!   |<------- content (group) --------|     dependencies first
//!   |<------- content (value) --------|
//!   |-------- known {state} --------->|     acknowledgement
//! ```
//!
//! Misaligned content is answered with `known {isCorrection}` and never
//! applied; peer disconnects terminate only that peer's loop.

pub mod error;
pub mod manager;
pub mod messages;
pub mod peer;

pub use error::{Result, SyncError};
pub use manager::{
    dependencies_of, run_peer_loop, CoValueSource, LoopControl, SyncManager,
};
pub use messages::{PeerEvent, PeerSignal, SyncMessage};
pub use peer::{connected_peer_pair, Peer, PeerId, PeerRole, PEER_CHANNEL_CAPACITY};
