//! The node engine: a single task owning every piece of mutable state,
//! multiplexing facade commands, inbound protocol frames, beacon
//! signals, gossip updates and the reaper tick.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use zre_core::{wire, BeaconFrame, PeerId, ZreBody, ZreMsg, BEACON_PREFIX};

use crate::beacon::{Beacon, BeaconError, BeaconSignal};
use crate::config;
use crate::event::Event;
use crate::gossip::{GossipClient, GossipHub};
use crate::group::Group;
use crate::peer::Peer;
use crate::transport::{Endpoint, Router, TransportError};

/// Failures surfaced through the facade's value-returning calls.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node already started")]
    AlreadyStarted,
    #[error("endpoint already bound")]
    AlreadyBound,
    #[error("no free port in the dynamic range")]
    PortExhausted,
    #[error("no usable network interface")]
    NoInterface,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Beacon(#[from] BeaconError),
}

/// Commands from the facade. Variants carrying a oneshot sender reply
/// exactly once; the rest are fire-and-forget.
pub(crate) enum Command {
    Uuid(oneshot::Sender<PeerId>),
    Name(oneshot::Sender<String>),
    Addr(oneshot::Sender<Option<String>>),
    Header {
        key: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Headers(oneshot::Sender<HashMap<String, String>>),
    SetName(String),
    SetHeader { key: String, value: String },
    SetVerbose(bool),
    SetPort(u16),
    SetInterval(Duration),
    SetInterface(String),
    SetEndpoint {
        endpoint: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    GossipBind {
        endpoint: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    GossipConnect {
        endpoint: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    GossipPort(oneshot::Sender<u16>),
    Start(oneshot::Sender<Result<(), NodeError>>),
    Stop(oneshot::Sender<()>),
    Join(String),
    Leave(String),
    Whisper { peer: PeerId, content: Vec<u8> },
    Shout { group: String, content: Vec<u8> },
}

pub(crate) struct Node {
    identity: PeerId,
    name: String,
    /// Our own change counter; advanced on every own join/leave, before
    /// the announcement carrying it goes out.
    status: u8,
    verbose: bool,
    started: bool,
    beacon_port: u16,
    interval: Duration,
    iface: Option<String>,
    endpoint: Option<String>,
    headers: HashMap<String, String>,
    peers: HashMap<PeerId, Peer>,
    own_groups: HashMap<String, Group>,
    peer_groups: HashMap<String, Group>,
    router: Option<Router>,
    inbox: Option<mpsc::Receiver<(Vec<u8>, Vec<Vec<u8>>)>>,
    beacon: Option<Beacon>,
    signals: Option<mpsc::Receiver<BeaconSignal>>,
    gossip_hub: Option<GossipHub>,
    gossip_bind_endpoint: Option<Endpoint>,
    gossip_connects: Vec<Endpoint>,
    gossip_clients: Vec<GossipClient>,
    gossip_tx: mpsc::Sender<(String, String)>,
    gossip_rx: mpsc::Receiver<(String, String)>,
    events: mpsc::Sender<Event>,
    commands: mpsc::Receiver<Command>,
}

impl Node {
    pub(crate) fn new(commands: mpsc::Receiver<Command>, events: mpsc::Sender<Event>) -> Node {
        let identity = PeerId::random();
        let (gossip_tx, gossip_rx) = mpsc::channel(config::SIGNAL_CAPACITY);
        Node {
            identity,
            name: identity.short(),
            status: 0,
            verbose: false,
            started: false,
            beacon_port: config::BEACON_PORT,
            interval: Duration::ZERO,
            iface: None,
            endpoint: None,
            headers: HashMap::new(),
            peers: HashMap::new(),
            own_groups: HashMap::new(),
            peer_groups: HashMap::new(),
            router: None,
            inbox: None,
            beacon: None,
            signals: None,
            gossip_hub: None,
            gossip_bind_endpoint: None,
            gossip_connects: Vec::new(),
            gossip_clients: Vec::new(),
            gossip_tx,
            gossip_rx,
            events,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut reap = Box::pin(tokio::time::sleep(config::reap_interval()));
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(ack) = self.handle_command(cmd).await {
                            self.shutdown().await;
                            let _ = ack.send(());
                            return;
                        }
                    }
                    // The facade was dropped; wind down silently.
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some((rid, frames)) = recv_opt(&mut self.inbox) => {
                    self.handle_inbox(rid, frames);
                }
                Some(signal) = recv_opt(&mut self.signals) => {
                    self.handle_beacon(signal);
                }
                Some((key, value)) = self.gossip_rx.recv() => {
                    self.handle_gossip(key, value);
                }
                _ = reap.as_mut() => {
                    self.reap();
                    reap.set(tokio::time::sleep(config::reap_interval()));
                }
            }
        }
    }

    /// Returns the ack sender when the command was Stop.
    async fn handle_command(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Uuid(reply) => {
                let _ = reply.send(self.identity);
            }
            Command::Name(reply) => {
                let _ = reply.send(self.name.clone());
            }
            Command::Addr(reply) => {
                let _ = reply.send(self.endpoint.clone());
            }
            Command::Header { key, reply } => {
                let _ = reply.send(self.headers.get(&key).cloned());
            }
            Command::Headers(reply) => {
                let _ = reply.send(self.headers.clone());
            }
            Command::SetName(name) => {
                if !self.started {
                    self.name = name;
                }
            }
            Command::SetHeader { key, value } => {
                if !self.started {
                    self.headers.insert(key, value);
                }
            }
            Command::SetVerbose(verbose) => self.verbose = verbose,
            Command::SetPort(port) => {
                if !self.started {
                    self.beacon_port = port;
                }
            }
            Command::SetInterval(interval) => {
                if !self.started {
                    self.interval = interval;
                }
            }
            Command::SetInterface(iface) => {
                if !self.started {
                    self.iface = Some(iface);
                }
            }
            Command::SetEndpoint { endpoint, reply } => {
                let _ = reply.send(self.set_endpoint(endpoint).await);
            }
            Command::GossipBind { endpoint, reply } => {
                let _ = reply.send(self.gossip_bind(endpoint).await);
            }
            Command::GossipConnect { endpoint, reply } => {
                let _ = reply.send(self.gossip_connect(endpoint));
            }
            Command::GossipPort(reply) => {
                let _ = reply.send(self.gossip_hub.as_ref().map_or(0, |hub| hub.port()));
            }
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Stop(reply) => return Some(reply),
            Command::Join(group) => self.join(group),
            Command::Leave(group) => self.leave(group),
            Command::Whisper { peer, content } => self.whisper(peer, content),
            Command::Shout { group, content } => self.shout(group, content),
        }
        None
    }

    async fn set_endpoint(&mut self, endpoint: String) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyStarted);
        }
        if self.router.is_some() {
            return Err(NodeError::AlreadyBound);
        }
        let parsed = Endpoint::parse(&endpoint)?;
        let (router, inbox) = Router::bind(&parsed, config::INBOX_CAPACITY).await?;
        self.router = Some(router);
        self.inbox = Some(inbox);
        self.endpoint = Some(endpoint);
        // Explicit endpoints and beacon discovery exclude each other.
        self.beacon_port = 0;
        Ok(())
    }

    async fn gossip_bind(&mut self, endpoint: String) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyStarted);
        }
        let parsed = Endpoint::parse(&endpoint)?;
        let hub = GossipHub::bind(&parsed).await?;
        self.gossip_hub = Some(hub);
        self.gossip_bind_endpoint = Some(parsed);
        self.beacon_port = 0;
        Ok(())
    }

    fn gossip_connect(&mut self, endpoint: String) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyStarted);
        }
        let parsed = Endpoint::parse(&endpoint)?;
        self.gossip_connects.push(parsed);
        self.beacon_port = 0;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyStarted);
        }
        let pre_bound = self.router.is_some();
        let result = self.start_inner().await;
        if result.is_err() && !pre_bound {
            // A failed start leaves no partial state behind.
            self.router = None;
            self.inbox = None;
            self.endpoint = None;
        }
        result
    }

    async fn start_inner(&mut self) -> Result<(), NodeError> {
        // Without an explicit endpoint, probe the dynamic range for a
        // free inbound port.
        if self.router.is_none() {
            let mut bound = None;
            for _ in 0..config::DYN_PORT_ATTEMPTS {
                let port = rand::thread_rng().gen_range(config::DYN_PORT_FROM..=config::DYN_PORT_TO);
                let endpoint = Endpoint::Tcp { host: "*".into(), port };
                if let Ok(ok) = Router::bind(&endpoint, config::INBOX_CAPACITY).await {
                    bound = Some(ok);
                    break;
                }
            }
            let (router, inbox) = bound.ok_or(NodeError::PortExhausted)?;
            self.router = Some(router);
            self.inbox = Some(inbox);
        }
        let port = self.router.as_ref().map_or(0, Router::local_port);

        if self.beacon_port > 0 {
            let (beacon, signals) =
                Beacon::start(self.beacon_port, self.interval, self.iface.as_deref()).await?;
            beacon.no_echo();
            beacon.subscribe(BEACON_PREFIX.to_vec());
            beacon.publish(BeaconFrame::new(self.identity, port).encode().to_vec())?;
            if self.endpoint.is_none() {
                self.endpoint = Some(tcp_endpoint(beacon.local_ip(), port));
            }
            self.beacon = Some(beacon);
            self.signals = Some(signals);
        } else {
            if self.endpoint.is_none() {
                let ip = local_ip_address::local_ip().map_err(|_| NodeError::NoInterface)?;
                self.endpoint = Some(tcp_endpoint(ip, port));
            }
            let endpoint = self.endpoint.clone().unwrap_or_default();
            let mut hubs = self.gossip_connects.clone();
            if let Some(own_hub) = &self.gossip_bind_endpoint {
                // Our own hub counts as a rendezvous too; dial the port
                // it actually bound when the endpoint asked for :0.
                let mut own_hub = connectable(own_hub);
                if let Endpoint::Tcp { port, .. } = &mut own_hub {
                    if *port == 0 {
                        *port = self.gossip_hub.as_ref().map_or(0, GossipHub::port);
                    }
                }
                hubs.push(own_hub);
            }
            for hub in &hubs {
                let client =
                    GossipClient::connect(hub, self.identity.routing_id(), self.gossip_tx.clone());
                client.publish(self.identity.to_string(), endpoint.clone());
                self.gossip_clients.push(client);
            }
        }

        self.started = true;
        if self.verbose {
            info!(
                "node {} ({}) up at {}",
                self.name,
                self.identity,
                self.endpoint.as_deref().unwrap_or("?")
            );
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        // The zero-port beacon tells peers we are going, faster than
        // their expiry timers would.
        if let Some(beacon) = self.beacon.take() {
            let _ = beacon.publish(BeaconFrame::departure(self.identity).encode().to_vec());
            beacon.close().await;
        }
        self.signals = None;
        for peer in self.peers.values_mut() {
            peer.destroy();
        }
        self.peers.clear();
        self.gossip_clients.clear();
        self.gossip_hub = None;
        self.inbox = None;
        self.router = None;
        self.started = false;
    }

    fn handle_inbox(&mut self, rid: Vec<u8>, frames: Vec<Vec<u8>>) {
        let Some(identity) = PeerId::from_routing_id(&rid) else {
            if self.verbose {
                debug!("dropping frame without a valid routing identity");
            }
            return;
        };
        let msg = match wire::unmarshal(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                if self.verbose {
                    debug!("dropping invalid frame from {identity}: {e}");
                }
                return;
            }
        };

        // A HELLO may create or rebuild the peer; for every other kind
        // the peer must already exist and be ready.
        if let ZreBody::Hello { endpoint, .. } = &msg.body {
            match self.peers.get(&identity) {
                Some(peer) if peer.ready => {
                    // Duplicate HELLO from a restarted peer: rebuild fresh.
                    self.remove_peer(identity);
                }
                Some(peer) if peer.endpoint() == self.endpoint.as_deref().unwrap_or("") => {
                    return;
                }
                _ => {}
            }
            let endpoint = endpoint.clone();
            self.require_peer(identity, &endpoint);
            if let Some(peer) = self.peers.get_mut(&identity) {
                peer.ready = true;
            }
        }

        let Some(peer) = self.peers.get_mut(&identity) else {
            return;
        };
        if !peer.ready {
            warn!("peer {identity} was not ready, ignoring a {msg}");
            self.remove_peer(identity);
            return;
        }
        if !peer.check_message(&msg) {
            warn!("lost messages from {identity}");
            return;
        }
        let name = peer.name().to_string();

        match msg.body {
            ZreBody::Hello {
                endpoint,
                groups,
                status,
                name: peer_name,
                headers,
            } => {
                if let Some(peer) = self.peers.get_mut(&identity) {
                    peer.set_name(peer_name.clone());
                    peer.headers = headers.clone();
                }
                self.emit(Event::Enter {
                    sender: identity,
                    name: peer_name,
                    address: endpoint,
                    headers,
                });
                for group in groups {
                    self.join_peer_group(identity, group);
                }
                // HELLO carries the peer's latest change counter.
                if let Some(peer) = self.peers.get_mut(&identity) {
                    peer.status = status;
                }
            }
            ZreBody::Whisper { content } => {
                self.emit(Event::Whisper { sender: identity, name, content });
            }
            ZreBody::Shout { group, content } => {
                self.emit(Event::Shout { sender: identity, name, group, content });
            }
            ZreBody::Ping => {
                if let Some(peer) = self.peers.get_mut(&identity) {
                    peer.send(ZreMsg::new(ZreBody::PingOk));
                }
            }
            ZreBody::PingOk => {}
            ZreBody::Join { group, status } => {
                self.join_peer_group(identity, group);
                self.check_status_drift(identity, status, "JOIN");
            }
            ZreBody::Leave { group, status } => {
                self.leave_peer_group(identity, group);
                self.check_status_drift(identity, status, "LEAVE");
            }
        }

        if let Some(peer) = self.peers.get_mut(&identity) {
            peer.refresh();
        }
    }

    /// The counter in JOIN/LEAVE must match our image after applying
    /// the mutation; drift means reordering or an unnoticed loss. A
    /// protocol violation, but not worth killing the process over.
    fn check_status_drift(&self, identity: PeerId, reported: u8, kind: &str) {
        if let Some(peer) = self.peers.get(&identity) {
            if peer.status != reported {
                warn!(
                    "{kind} from {identity} reports status {reported}, expected {}",
                    peer.status
                );
            }
        }
    }

    fn handle_beacon(&mut self, signal: BeaconSignal) {
        let Some(frame) = BeaconFrame::parse(&signal.bytes) else {
            if self.verbose {
                debug!("ignoring invalid beacon from {}", signal.addr);
            }
            return;
        };
        if frame.identity == self.identity {
            return;
        }
        if frame.is_departure() {
            if self.peers.contains_key(&frame.identity) {
                self.remove_peer(frame.identity);
            }
            return;
        }
        let endpoint = tcp_endpoint(signal.addr, frame.port);
        self.require_peer(frame.identity, &endpoint);
        if let Some(peer) = self.peers.get_mut(&frame.identity) {
            peer.refresh();
        }
    }

    fn handle_gossip(&mut self, key: String, value: String) {
        let Some(identity) = PeerId::parse_hex(&key) else {
            debug!("ignoring gossip tuple with malformed key {key}");
            return;
        };
        if identity == self.identity || Some(value.as_str()) == self.endpoint.as_deref() {
            return;
        }
        self.require_peer(identity, &value);
        if let Some(peer) = self.peers.get_mut(&identity) {
            peer.refresh();
        }
    }

    /// Find or create the peer. A new peer gets connected and greeted
    /// with HELLO before anything else can be sent to it.
    fn require_peer(&mut self, identity: PeerId, endpoint: &str) {
        if self.peers.contains_key(&identity) {
            return;
        }
        // A new identity at a reused endpoint means the old occupant is
        // gone; disconnect its ghost so the reconnect can succeed.
        for peer in self.peers.values_mut() {
            if peer.connected() && peer.endpoint() == endpoint {
                peer.disconnect();
            }
        }
        let mut peer = Peer::new(identity);
        if let Err(e) = peer.connect(self.identity, endpoint) {
            warn!("cannot connect to {identity} at {endpoint}: {e}");
        } else {
            let hello = self.hello();
            peer.send(hello);
        }
        self.peers.insert(identity, peer);
        if self.verbose {
            info!("discovered peer {identity} at {endpoint}");
        }
    }

    /// Our HELLO, reflecting current groups, headers and status.
    fn hello(&self) -> ZreMsg {
        ZreMsg::new(ZreBody::Hello {
            endpoint: self.endpoint.clone().unwrap_or_default(),
            groups: self.own_groups.keys().cloned().collect(),
            status: self.status,
            name: self.name.clone(),
            headers: self.headers.clone(),
        })
    }

    fn remove_peer(&mut self, identity: PeerId) {
        let Some(peer) = self.peers.get(&identity) else {
            return;
        };
        let name = peer.name().to_string();
        self.emit(Event::Exit { sender: identity, name });
        if let Some(peer) = self.peers.get_mut(&identity) {
            for group in self.peer_groups.values_mut() {
                group.leave(peer);
            }
            // Disconnect before dropping the record; a lingering mailbox
            // breaks reconnects to the same endpoint.
            peer.destroy();
        }
        self.peers.remove(&identity);
    }

    fn join_peer_group(&mut self, identity: PeerId, group: String) {
        let Some(peer) = self.peers.get_mut(&identity) else {
            return;
        };
        let name = peer.name().to_string();
        let entry = self
            .peer_groups
            .entry(group)
            .or_insert_with_key(|key| Group::new(key.clone()));
        entry.join(peer);
        let group = entry.name().to_string();
        self.emit(Event::Join { sender: identity, name, group });
    }

    fn leave_peer_group(&mut self, identity: PeerId, group: String) {
        let Some(peer) = self.peers.get_mut(&identity) else {
            return;
        };
        let name = peer.name().to_string();
        let entry = self
            .peer_groups
            .entry(group)
            .or_insert_with_key(|key| Group::new(key.clone()));
        entry.leave(peer);
        let group = entry.name().to_string();
        self.emit(Event::Leave { sender: identity, name, group });
    }

    fn join(&mut self, group: String) {
        if self.own_groups.contains_key(&group) {
            return;
        }
        self.own_groups.insert(group.clone(), Group::new(group.clone()));
        // The counter advances before the announcement carries it.
        self.status = self.status.wrapping_add(1);
        let msg = ZreMsg::new(ZreBody::Join { group, status: self.status });
        for peer in self.peers.values_mut() {
            peer.send(msg.clone());
        }
    }

    fn leave(&mut self, group: String) {
        if !self.own_groups.contains_key(&group) {
            return;
        }
        self.status = self.status.wrapping_add(1);
        let msg = ZreMsg::new(ZreBody::Leave {
            group: group.clone(),
            status: self.status,
        });
        for peer in self.peers.values_mut() {
            peer.send(msg.clone());
        }
        self.own_groups.remove(&group);
    }

    fn whisper(&mut self, identity: PeerId, content: Vec<u8>) {
        // Unknown peers may have been destroyed already; drop silently.
        if let Some(peer) = self.peers.get_mut(&identity) {
            peer.send(ZreMsg::new(ZreBody::Whisper { content }));
        }
    }

    fn shout(&mut self, group: String, content: Vec<u8>) {
        let msg = ZreMsg::new(ZreBody::Shout { group: group.clone(), content });
        if let Some(members) = self.peer_groups.get(&group) {
            if !members.is_empty() {
                members.send(&mut self.peers, &msg);
            }
        }
    }

    /// Once per reaper tick: expire silent peers, ping evasive ones.
    fn reap(&mut self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_expired(now))
            .map(Peer::identity)
            .collect();
        for identity in expired {
            if self.verbose {
                info!("peer {identity} expired");
            }
            self.remove_peer(identity);
        }
        for peer in self.peers.values_mut() {
            if peer.is_evasive(now) {
                peer.send(ZreMsg::new(ZreBody::Ping));
            }
        }
    }

    fn emit(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            // Never stall the engine on a slow consumer.
            if self.verbose {
                warn!("event channel full, dropping {event:?}");
            }
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn tcp_endpoint(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("tcp://{v4}:{port}"),
        IpAddr::V6(v6) => format!("tcp://[{v6}]:{port}"),
    }
}

/// The address a local client can dial for a wildcard bind.
fn connectable(endpoint: &Endpoint) -> Endpoint {
    match endpoint {
        Endpoint::Tcp { host, port } if host == "*" || host == "0.0.0.0" => Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: *port,
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_endpoint_brackets_ipv6() {
        assert_eq!(
            tcp_endpoint("192.168.1.10".parse().unwrap(), 5671),
            "tcp://192.168.1.10:5671"
        );
        assert_eq!(tcp_endpoint("::1".parse().unwrap(), 5671), "tcp://[::1]:5671");
    }

    #[test]
    fn connectable_rewrites_wildcard_hosts() {
        let wildcard = Endpoint::Tcp { host: "*".into(), port: 9000 };
        assert_eq!(
            connectable(&wildcard),
            Endpoint::Tcp { host: "127.0.0.1".into(), port: 9000 }
        );
        let inproc = Endpoint::Inproc("hub".into());
        assert_eq!(connectable(&inproc), inproc);
    }
}
