//! Node identity: 16 random bytes, displayed as uppercase hex.

use std::fmt;

/// Routing identities carry a leading marker byte so the first byte is
/// never zero, which some transports reject in an identity.
pub const ROUTING_ID_MARKER: u8 = 0x01;

/// Length of a routing identity frame: marker plus the raw id.
pub const ROUTING_ID_LEN: usize = 17;

/// Identity of a node, unique per node instance. Generated once at node
/// creation and advertised in beacons and HELLO handshakes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The routing identity the remote router observes for this node.
    pub fn routing_id(&self) -> Vec<u8> {
        let mut id = Vec::with_capacity(ROUTING_ID_LEN);
        id.push(ROUTING_ID_MARKER);
        id.extend_from_slice(&self.0);
        id
    }

    /// Extract the identity from a routing identity frame.
    pub fn from_routing_id(frame: &[u8]) -> Option<PeerId> {
        if frame.len() != ROUTING_ID_LEN || frame[0] != ROUTING_ID_MARKER {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&frame[1..]);
        Some(PeerId(bytes))
    }

    /// Parse an uppercase or lowercase hex representation.
    pub fn parse_hex(s: &str) -> Option<PeerId> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(PeerId(bytes))
    }

    /// First six hex characters; the default public name of a node.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(6);
        s
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}
