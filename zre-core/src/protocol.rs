//! ZRE v2 message kinds and protocol constants.

use std::collections::HashMap;
use std::fmt;

/// Protocol signature carried by every framed message.
pub const SIGNATURE: u16 = 0xAAA0 | 1;

/// Protocol version; v1 frames (without the version byte) are rejected.
pub const VERSION: u8 = 2;

/// Maximum length of a short (1-byte length) string.
pub const STRING_MAX: usize = 255;

pub const HELLO_ID: u8 = 1;
pub const WHISPER_ID: u8 = 2;
pub const SHOUT_ID: u8 = 3;
pub const JOIN_ID: u8 = 4;
pub const LEAVE_ID: u8 = 5;
pub const PING_ID: u8 = 6;
pub const PING_OK_ID: u8 = 7;

/// A protocol message: per-peer sequence number plus one of the seven
/// message kinds. Cloning yields an independent copy, so the engine can
/// stamp a fresh sequence per recipient when multicasting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZreMsg {
    pub sequence: u16,
    pub body: ZreBody,
}

/// The seven ZRE v2 message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZreBody {
    /// Greet a peer so it can connect back to us.
    Hello {
        endpoint: String,
        groups: Vec<String>,
        status: u8,
        name: String,
        headers: HashMap<String, String>,
    },
    /// Unicast message to one peer.
    Whisper { content: Vec<u8> },
    /// Multicast message to a named group.
    Shout { group: String, content: Vec<u8> },
    /// Announce joining a group.
    Join { group: String, status: u8 },
    /// Announce leaving a group.
    Leave { group: String, status: u8 },
    /// Liveness probe towards an evasive peer.
    Ping,
    /// Reply to a PING.
    PingOk,
}

impl ZreMsg {
    /// A message with an unstamped (zero) sequence.
    pub fn new(body: ZreBody) -> Self {
        ZreMsg { sequence: 0, body }
    }

    /// Wire message id of this message's kind.
    pub fn id(&self) -> u8 {
        match self.body {
            ZreBody::Hello { .. } => HELLO_ID,
            ZreBody::Whisper { .. } => WHISPER_ID,
            ZreBody::Shout { .. } => SHOUT_ID,
            ZreBody::Join { .. } => JOIN_ID,
            ZreBody::Leave { .. } => LEAVE_ID,
            ZreBody::Ping => PING_ID,
            ZreBody::PingOk => PING_OK_ID,
        }
    }
}

impl fmt::Display for ZreMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.body {
            ZreBody::Hello { .. } => "HELLO",
            ZreBody::Whisper { .. } => "WHISPER",
            ZreBody::Shout { .. } => "SHOUT",
            ZreBody::Join { .. } => "JOIN",
            ZreBody::Leave { .. } => "LEAVE",
            ZreBody::Ping => "PING",
            ZreBody::PingOk => "PING_OK",
        };
        write!(f, "{kind}(seq={})", self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_match_the_wire_assignment() {
        let hello = ZreMsg::new(ZreBody::Hello {
            endpoint: String::new(),
            groups: vec![],
            status: 0,
            name: String::new(),
            headers: HashMap::new(),
        });
        assert_eq!(hello.id(), 1);
        assert_eq!(ZreMsg::new(ZreBody::Whisper { content: vec![] }).id(), 2);
        assert_eq!(
            ZreMsg::new(ZreBody::Shout { group: "g".into(), content: vec![] }).id(),
            3
        );
        assert_eq!(ZreMsg::new(ZreBody::Join { group: "g".into(), status: 1 }).id(), 4);
        assert_eq!(ZreMsg::new(ZreBody::Leave { group: "g".into(), status: 1 }).id(), 5);
        assert_eq!(ZreMsg::new(ZreBody::Ping).id(), 6);
        assert_eq!(ZreMsg::new(ZreBody::PingOk).id(), 7);
    }

    #[test]
    fn clone_is_independent() {
        let msg = ZreMsg::new(ZreBody::Shout {
            group: "GLOBAL".into(),
            content: b"payload".to_vec(),
        });
        let mut cloned = msg.clone();
        cloned.sequence = 7;
        if let ZreBody::Shout { content, .. } = &mut cloned.body {
            content.push(b'!');
        }
        assert_eq!(msg.sequence, 0);
        if let ZreBody::Shout { content, .. } = &msg.body {
            assert_eq!(content, b"payload");
        } else {
            panic!("expected Shout");
        }
    }

    #[test]
    fn signature_constant() {
        assert_eq!(SIGNATURE, 0xAAA1);
    }
}
