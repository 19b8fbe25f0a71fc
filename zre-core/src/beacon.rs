//! Discovery beacon frame: the 22-byte UDP advertisement.

use crate::identity::PeerId;

/// Leading bytes of every beacon frame.
pub const BEACON_PREFIX: &[u8; 3] = b"ZRE";

/// Beacon format version. Distinct from the message protocol version.
pub const BEACON_VERSION: u8 = 0x01;

/// Encoded beacon length: prefix, version, identity, port.
pub const BEACON_FRAME_LEN: usize = 3 + 1 + 16 + 2;

/// Longest datagram the receive side will consider at all.
pub const BEACON_MAX: usize = 255;

/// A presence advertisement. `port` is the sender's inbound TCP port;
/// zero announces departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconFrame {
    pub identity: PeerId,
    pub port: u16,
}

impl BeaconFrame {
    pub fn new(identity: PeerId, port: u16) -> Self {
        BeaconFrame { identity, port }
    }

    /// The departure variant of this frame.
    pub fn departure(identity: PeerId) -> Self {
        BeaconFrame { identity, port: 0 }
    }

    pub fn is_departure(&self) -> bool {
        self.port == 0
    }

    pub fn encode(&self) -> [u8; BEACON_FRAME_LEN] {
        let mut out = [0u8; BEACON_FRAME_LEN];
        out[..3].copy_from_slice(BEACON_PREFIX);
        out[3] = BEACON_VERSION;
        out[4..20].copy_from_slice(self.identity.as_bytes());
        out[20..22].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Parse a received datagram. Anything that is not exactly a
    /// well-formed beacon of our version is `None` and gets dropped.
    pub fn parse(buf: &[u8]) -> Option<BeaconFrame> {
        if buf.len() != BEACON_FRAME_LEN || &buf[..3] != BEACON_PREFIX || buf[3] != BEACON_VERSION {
            return None;
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[4..20]);
        Some(BeaconFrame {
            identity: PeerId::from_bytes(id),
            port: u16::from_be_bytes([buf[20], buf[21]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let id = PeerId::from_bytes([0x42; 16]);
        let frame = BeaconFrame::new(id, 0xC001);
        let bytes = frame.encode();
        assert_eq!(&bytes[..3], b"ZRE");
        assert_eq!(bytes[3], 0x01);
        assert_eq!(&bytes[4..20], &[0x42; 16]);
        assert_eq!(&bytes[20..], &[0xC0, 0x01]);
    }

    #[test]
    fn parse_roundtrip() {
        let frame = BeaconFrame::new(PeerId::random(), 5670);
        assert_eq!(BeaconFrame::parse(&frame.encode()), Some(frame));
    }

    #[test]
    fn rejects_malformed_frames() {
        let frame = BeaconFrame::new(PeerId::random(), 5670);
        let bytes = frame.encode();

        assert_eq!(BeaconFrame::parse(&bytes[..21]), None);
        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(BeaconFrame::parse(&long), None);

        let mut bad_prefix = bytes;
        bad_prefix[0] = b'X';
        assert_eq!(BeaconFrame::parse(&bad_prefix), None);

        let mut bad_version = frame.encode();
        bad_version[3] = 0x02;
        assert_eq!(BeaconFrame::parse(&bad_version), None);
    }

    #[test]
    fn zero_port_signals_departure() {
        let id = PeerId::random();
        let frame = BeaconFrame::departure(id);
        assert!(frame.is_departure());
        let parsed = BeaconFrame::parse(&frame.encode()).unwrap();
        assert!(parsed.is_departure());
        assert_eq!(parsed.identity, id);
    }
}
