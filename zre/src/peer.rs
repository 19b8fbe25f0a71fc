//! One record per discovered remote node: its outbound mailbox, message
//! sequence counters and liveness deadlines.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};
use zre_core::{wire, PeerId, ZreMsg};

use crate::config;
use crate::transport::{Dealer, Endpoint};

pub(crate) struct Peer {
    identity: PeerId,
    endpoint: String,
    name: String,
    pub(crate) headers: HashMap<String, String>,
    /// Local image of the peer's own change counter.
    pub(crate) status: u8,
    /// HELLO has arrived; until then no other message is accepted.
    pub(crate) ready: bool,
    connected: bool,
    pub(crate) sent_sequence: u16,
    pub(crate) want_sequence: u16,
    evasive_at: Instant,
    expired_at: Instant,
    mailbox: Option<Dealer>,
}

impl Peer {
    pub(crate) fn new(identity: PeerId) -> Self {
        let now = Instant::now();
        Peer {
            identity,
            endpoint: String::new(),
            name: identity.short(),
            headers: HashMap::new(),
            status: 0,
            ready: false,
            connected: false,
            sent_sequence: 0,
            want_sequence: 0,
            evasive_at: now + config::evasive(),
            expired_at: now + config::expired(),
            mailbox: None,
        }
    }

    pub(crate) fn identity(&self) -> PeerId {
        self.identity
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected
    }

    /// Open the outbound mailbox towards `endpoint`. Our routing
    /// identity rides along so the remote router knows who is talking.
    /// The high-water mark scales with the expiry window: a peer that
    /// cannot drain a full window of traffic is about to expire anyway.
    pub(crate) fn connect(&mut self, our_identity: PeerId, endpoint: &str) -> Result<(), crate::transport::TransportError> {
        debug_assert!(!self.connected, "peer already connected");
        let parsed = Endpoint::parse(endpoint)?;
        let hwm = config::expired().as_millis() as usize;
        let (dealer, _replies) = Dealer::connect(&parsed, our_identity.routing_id(), hwm);
        self.mailbox = Some(dealer);
        self.endpoint = endpoint.to_string();
        self.connected = true;
        self.ready = false;
        Ok(())
    }

    /// Drop the mailbox. Queued frames are lost; nothing more is sent
    /// until connected again.
    pub(crate) fn disconnect(&mut self) {
        if self.connected {
            self.mailbox = None;
            self.endpoint.clear();
            self.connected = false;
            self.ready = false;
        }
    }

    /// Stamp the next outgoing sequence and hand the message to the
    /// mailbox. A transport error disconnects; the reaper will expire
    /// the record if the peer never comes back.
    pub(crate) fn send(&mut self, mut msg: ZreMsg) {
        if !self.connected {
            return;
        }
        self.sent_sequence = self.sent_sequence.wrapping_add(1);
        msg.sequence = self.sent_sequence;
        let frames = wire::marshal(&msg);
        if let Some(mailbox) = &self.mailbox {
            if let Err(e) = mailbox.send(frames) {
                debug!("send to {} failed: {e}", self.identity);
                self.disconnect();
            }
        }
    }

    /// Validate an inbound sequence number. On a gap the counter
    /// resynchronises to the received value so the following message is
    /// accepted again; the lossy message itself is dropped by the caller.
    pub(crate) fn check_message(&mut self, msg: &ZreMsg) -> bool {
        let expected = self.want_sequence.wrapping_add(1);
        if msg.sequence == expected {
            self.want_sequence = expected;
            true
        } else {
            warn!(
                "sequence gap from {}: expected {expected}, got {}",
                self.identity, msg.sequence
            );
            self.want_sequence = msg.sequence;
            false
        }
    }

    /// Push both liveness deadlines out; called on any activity.
    pub(crate) fn refresh(&mut self) {
        let now = Instant::now();
        self.evasive_at = now + config::evasive();
        self.expired_at = now + config::expired();
    }

    pub(crate) fn is_evasive(&self, now: Instant) -> bool {
        now >= self.evasive_at
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.expired_at
    }

    pub(crate) fn destroy(&mut self) {
        self.disconnect();
        self.headers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zre_core::ZreBody;

    fn msg_with_sequence(sequence: u16) -> ZreMsg {
        ZreMsg { sequence, body: ZreBody::Ping }
    }

    #[test]
    fn accepts_consecutive_sequences() {
        let mut peer = Peer::new(PeerId::random());
        assert!(peer.check_message(&msg_with_sequence(1)));
        assert!(peer.check_message(&msg_with_sequence(2)));
        assert!(peer.check_message(&msg_with_sequence(3)));
    }

    #[test]
    fn gap_is_reported_once_then_resynchronised() {
        let mut peer = Peer::new(PeerId::random());
        assert!(peer.check_message(&msg_with_sequence(1)));
        // Message 2 got lost; 3 arrives.
        assert!(!peer.check_message(&msg_with_sequence(3)));
        // The stream continues from the observed value.
        assert!(peer.check_message(&msg_with_sequence(4)));
    }

    #[test]
    fn sequence_wraps_modulo_u16() {
        let mut peer = Peer::new(PeerId::random());
        peer.want_sequence = u16::MAX - 1;
        assert!(peer.check_message(&msg_with_sequence(u16::MAX)));
        assert!(peer.check_message(&msg_with_sequence(0)));
        assert!(peer.check_message(&msg_with_sequence(1)));
    }

    #[test]
    fn send_without_mailbox_is_a_no_op() {
        let mut peer = Peer::new(PeerId::random());
        peer.send(ZreMsg::new(ZreBody::Ping));
        assert_eq!(peer.sent_sequence, 0);
    }

    #[tokio::test]
    async fn send_stamps_monotonic_sequences() {
        let mut peer = Peer::new(PeerId::random());
        peer.connect(PeerId::random(), "inproc://peer-seq-test").unwrap();
        for _ in 0..3 {
            peer.send(ZreMsg::new(ZreBody::Ping));
        }
        assert_eq!(peer.sent_sequence, 3);
    }

    #[test]
    fn default_name_is_short_identity() {
        let id = PeerId::random();
        let peer = Peer::new(id);
        assert_eq!(peer.name(), id.short());
    }

    #[test]
    fn liveness_deadlines_order_evasive_before_expired() {
        let mut peer = Peer::new(PeerId::random());
        peer.refresh();
        let now = Instant::now();
        assert!(!peer.is_evasive(now));
        assert!(!peer.is_expired(now));
        let later = now + config::evasive();
        assert!(peer.is_evasive(later));
        assert!(!peer.is_expired(later));
        let much_later = now + config::expired();
        assert!(peer.is_expired(much_later));
    }

    #[test]
    fn destroy_clears_headers() {
        let mut peer = Peer::new(PeerId::random());
        peer.headers.insert("X-KEY".into(), "value".into());
        peer.destroy();
        assert!(peer.headers.is_empty());
        assert!(!peer.connected());
    }
}
