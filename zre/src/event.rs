//! Events delivered to the embedding application.

use std::collections::HashMap;

use zre_core::PeerId;

/// A cluster event. Control events (`Enter`, `Exit`, `Join`, `Leave`)
/// track peer presence; data events (`Whisper`, `Shout`) carry payloads.
///
/// Events from a given peer arrive in the order they were produced; the
/// channel is bounded, so a caller that stops draining loses events
/// rather than stalling the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new peer completed its handshake.
    Enter {
        sender: PeerId,
        name: String,
        address: String,
        headers: HashMap<String, String>,
    },
    /// A peer left, expired or announced departure.
    Exit { sender: PeerId, name: String },
    /// A peer joined a group.
    Join {
        sender: PeerId,
        name: String,
        group: String,
    },
    /// A peer left a group.
    Leave {
        sender: PeerId,
        name: String,
        group: String,
    },
    /// A unicast message from a peer.
    Whisper {
        sender: PeerId,
        name: String,
        content: Vec<u8>,
    },
    /// A group message from a peer.
    Shout {
        sender: PeerId,
        name: String,
        group: String,
        content: Vec<u8>,
    },
}

impl Event {
    /// Identity of the peer this event is about.
    pub fn sender(&self) -> PeerId {
        match self {
            Event::Enter { sender, .. }
            | Event::Exit { sender, .. }
            | Event::Join { sender, .. }
            | Event::Leave { sender, .. }
            | Event::Whisper { sender, .. }
            | Event::Shout { sender, .. } => *sender,
        }
    }

    /// The sending peer's public name.
    pub fn name(&self) -> &str {
        match self {
            Event::Enter { name, .. }
            | Event::Exit { name, .. }
            | Event::Join { name, .. }
            | Event::Leave { name, .. }
            | Event::Whisper { name, .. }
            | Event::Shout { name, .. } => name,
        }
    }
}
