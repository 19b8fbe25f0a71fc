//! ZRE v2 wire layer: message kinds, framing codec, discovery beacon
//! frames and node identities.
//!
//! This crate is pure protocol logic with no I/O; the `zre` crate hosts
//! the sockets, discovery and the node engine on top of it.

pub mod beacon;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use beacon::{BeaconFrame, BEACON_FRAME_LEN, BEACON_MAX, BEACON_PREFIX, BEACON_VERSION};
pub use identity::{PeerId, ROUTING_ID_LEN, ROUTING_ID_MARKER};
pub use protocol::{ZreBody, ZreMsg, SIGNATURE, STRING_MAX, VERSION};
pub use wire::{marshal, unmarshal, WireError};
