//! A named set of peers with one-message-to-many dispatch.

use std::collections::{HashMap, HashSet};

use zre_core::{PeerId, ZreMsg};

use crate::peer::Peer;

/// Membership is tracked by identity; the node's peer map stays the
/// single owner of the `Peer` records.
pub(crate) struct Group {
    name: String,
    members: HashSet<PeerId>,
}

impl Group {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Group {
            name: name.into(),
            members: HashSet::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Add the peer; duplicate joins are ignored. The status bump keeps
    /// our image of the peer's change counter in step with the one it
    /// reports in JOIN/LEAVE.
    pub(crate) fn join(&mut self, peer: &mut Peer) {
        self.members.insert(peer.identity());
        peer.status = peer.status.wrapping_add(1);
    }

    pub(crate) fn leave(&mut self, peer: &mut Peer) {
        self.members.remove(&peer.identity());
        peer.status = peer.status.wrapping_add(1);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Send one logical message to every member. Each recipient gets its
    /// own clone so the per-peer sequence stamp never aliases.
    pub(crate) fn send(&self, peers: &mut HashMap<PeerId, Peer>, msg: &ZreMsg) {
        for identity in &self.members {
            if let Some(peer) = peers.get_mut(identity) {
                peer.send(msg.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zre_core::ZreBody;

    #[test]
    fn join_and_leave_track_membership_and_status() {
        let mut group = Group::new("GLOBAL");
        let mut peer = Peer::new(PeerId::random());
        assert_eq!(peer.status, 0);
        assert_eq!(group.name(), "GLOBAL");

        group.join(&mut peer);
        assert!(!group.is_empty());
        assert_eq!(peer.status, 1);

        // A duplicate join still bumps the counter, mirroring the
        // remote's own increment per announcement.
        group.join(&mut peer);
        assert_eq!(peer.status, 2);

        group.leave(&mut peer);
        assert!(group.is_empty());
        assert_eq!(peer.status, 3);
    }

    #[test]
    fn status_wraps_at_u8() {
        let mut group = Group::new("GLOBAL");
        let mut peer = Peer::new(PeerId::random());
        peer.status = u8::MAX;
        group.join(&mut peer);
        assert_eq!(peer.status, 0);
    }

    #[tokio::test]
    async fn send_reaches_only_members() {
        let mut group = Group::new("GLOBAL");
        let our_id = PeerId::random();

        let mut peers = HashMap::new();
        let mut member = Peer::new(PeerId::random());
        member.connect(our_id, "inproc://group-send-member").unwrap();
        let mut outsider = Peer::new(PeerId::random());
        outsider.connect(our_id, "inproc://group-send-outsider").unwrap();

        let member_id = member.identity();
        let outsider_id = outsider.identity();
        group.join(&mut member);
        peers.insert(member_id, member);
        peers.insert(outsider_id, outsider);

        let msg = ZreMsg::new(ZreBody::Shout {
            group: "GLOBAL".into(),
            content: b"hi".to_vec(),
        });
        group.send(&mut peers, &msg);

        assert_eq!(peers[&member_id].sent_sequence, 1);
        assert_eq!(peers[&outsider_id].sent_sequence, 0);
    }
}
