//! Proximity-based peer-to-peer clustering over the ZRE realtime
//! exchange protocol.
//!
//! A node discovers other nodes on the local network (UDP beacons by
//! default, a gossip rendezvous as the alternative), keeps one
//! bidirectional messaging channel per peer, tracks liveness, and
//! maintains named groups for multicast-style delivery. The embedding
//! application drives a [`Zre`] handle and drains the [`Event`] channel:
//!
//! ```no_run
//! # async fn demo() -> Result<(), zre::ZreError> {
//! let node = zre::Zre::new();
//! node.set_name("listener").await?;
//! node.start().await?;
//! node.join("GLOBAL").await?;
//! let mut events = node.events().expect("first take");
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! All engine state lives on one task; the handle talks to it through a
//! command channel, so `Zre` is cheap to share and every call carries a
//! five-second timeout instead of ever blocking on the engine.

pub mod beacon;
pub mod config;
pub mod event;

mod gossip;
mod group;
mod node;
mod peer;
mod transport;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

pub use beacon::BeaconError;
pub use event::Event;
pub use node::NodeError;
pub use transport::TransportError;
pub use zre_core::{PeerId, ZreBody, ZreMsg};

use node::{Command, Node};

/// Failures of facade calls.
#[derive(Debug, thiserror::Error)]
pub enum ZreError {
    /// The engine did not accept or answer the command in time.
    #[error("command timed out")]
    Timeout,
    /// The engine task is gone (the node was stopped).
    #[error("node is stopped")]
    Stopped,
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Handle to one cluster node.
///
/// Created silent and invisible; configure it, then [`start`](Zre::start)
/// it to begin discovery and connection. Dropping the handle shuts the
/// node down without the polite departure broadcast; call
/// [`stop`](Zre::stop) for that.
pub struct Zre {
    commands: mpsc::Sender<Command>,
    events: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl Zre {
    /// Create a node and spawn its engine on the current tokio runtime.
    pub fn new() -> Zre {
        let (commands, command_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(config::EVENT_CAPACITY);
        tokio::spawn(Node::new(command_rx, event_tx).run());
        Zre {
            commands,
            events: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver. Yields `None` on every call after the
    /// first.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events.lock().unwrap().take()
    }

    /// Our identity, unique per node instance.
    pub async fn uuid(&self) -> Result<PeerId, ZreError> {
        self.request(Command::Uuid).await
    }

    /// Our public name; defaults to the first six hex characters of the
    /// identity.
    pub async fn name(&self) -> Result<String, ZreError> {
        self.request(Command::Name).await
    }

    /// The endpoint we accept peer traffic on; `None` before `start`
    /// (unless `set_endpoint` bound one).
    pub async fn addr(&self) -> Result<Option<String>, ZreError> {
        self.request(Command::Addr).await
    }

    /// One of our own headers.
    pub async fn header(&self, key: &str) -> Result<Option<String>, ZreError> {
        let key = key.to_string();
        self.request(|reply| Command::Header { key, reply }).await
    }

    /// All of our own headers.
    pub async fn headers(&self) -> Result<HashMap<String, String>, ZreError> {
        self.request(Command::Headers).await
    }

    /// Set the public name other nodes see in events. Before `start`.
    pub async fn set_name(&self, name: &str) -> Result<(), ZreError> {
        self.post(Command::SetName(name.to_string())).await
    }

    /// Set a header; headers travel in the HELLO handshake and arrive
    /// with every `Enter` event. Before `start`.
    pub async fn set_header(&self, key: &str, value: &str) -> Result<(), ZreError> {
        self.post(Command::SetHeader {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Log all traffic and major state changes.
    pub async fn set_verbose(&self, verbose: bool) -> Result<(), ZreError> {
        self.post(Command::SetVerbose(verbose)).await
    }

    /// Override the UDP discovery port (default 5670), e.g. to keep a
    /// development cluster apart from production. Zero disables the
    /// beacon entirely. Before `start`.
    pub async fn set_port(&self, port: u16) -> Result<(), ZreError> {
        self.post(Command::SetPort(port)).await
    }

    /// Override the beacon broadcast interval (default 1 s). Before
    /// `start`.
    pub async fn set_interval(&self, interval: Duration) -> Result<(), ZreError> {
        self.post(Command::SetInterval(interval)).await
    }

    /// Pin discovery to one network interface, by name or literal IPv4
    /// address. Before `start`.
    pub async fn set_interface(&self, iface: &str) -> Result<(), ZreError> {
        self.post(Command::SetInterface(iface.to_string())).await
    }

    /// Bind the inbound endpoint explicitly instead of the ephemeral
    /// tcp port the node would pick. Disables beacon discovery; combine
    /// with the gossip rendezvous. Before `start`.
    pub async fn set_endpoint(&self, endpoint: &str) -> Result<(), ZreError> {
        self.request(|reply| Command::SetEndpoint {
            endpoint: endpoint.to_string(),
            reply,
        })
        .await??;
        Ok(())
    }

    /// Run a gossip hub at `endpoint` for other nodes to connect to.
    /// Disables beacon discovery. Before `start`.
    pub async fn gossip_bind(&self, endpoint: &str) -> Result<(), ZreError> {
        self.request(|reply| Command::GossipBind {
            endpoint: endpoint.to_string(),
            reply,
        })
        .await??;
        Ok(())
    }

    /// Connect to a gossip hub. May be called several times for
    /// redundant hubs. Disables beacon discovery. Before `start`.
    pub async fn gossip_connect(&self, endpoint: &str) -> Result<(), ZreError> {
        self.request(|reply| Command::GossipConnect {
            endpoint: endpoint.to_string(),
            reply,
        })
        .await??;
        Ok(())
    }

    /// Port of our gossip hub, when `gossip_bind` bound a tcp endpoint
    /// with an ephemeral port; 0 otherwise.
    pub async fn gossip_port(&self) -> Result<u16, ZreError> {
        self.request(Command::GossipPort).await
    }

    /// Start discovery and connection.
    pub async fn start(&self) -> Result<(), ZreError> {
        self.request(Command::Start).await??;
        Ok(())
    }

    /// Stop the node politely: broadcast the departure beacon (when
    /// beaconing), drop every peer, unbind. Resolves once the engine
    /// has fully shut down.
    pub async fn stop(&self) -> Result<(), ZreError> {
        self.request(Command::Stop).await
    }

    /// Join a named group; peers in it will receive our shouts.
    pub async fn join(&self, group: &str) -> Result<(), ZreError> {
        self.post(Command::Join(group.to_string())).await
    }

    /// Leave a group.
    pub async fn leave(&self, group: &str) -> Result<(), ZreError> {
        self.post(Command::Leave(group.to_string())).await
    }

    /// Send `content` to one peer.
    pub async fn whisper(&self, peer: PeerId, content: Vec<u8>) -> Result<(), ZreError> {
        self.post(Command::Whisper { peer, content }).await
    }

    /// Send `content` to every peer in a group.
    pub async fn shout(&self, group: &str, content: Vec<u8>) -> Result<(), ZreError> {
        self.post(Command::Shout {
            group: group.to_string(),
            content,
        })
        .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ZreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::time::timeout(config::CMD_TIMEOUT, self.commands.send(make(reply_tx)))
            .await
            .map_err(|_| ZreError::Timeout)?
            .map_err(|_| ZreError::Stopped)?;
        tokio::time::timeout(config::CMD_TIMEOUT, reply_rx)
            .await
            .map_err(|_| ZreError::Timeout)?
            .map_err(|_| ZreError::Stopped)
    }

    async fn post(&self, cmd: Command) -> Result<(), ZreError> {
        tokio::time::timeout(config::CMD_TIMEOUT, self.commands.send(cmd))
            .await
            .map_err(|_| ZreError::Timeout)?
            .map_err(|_| ZreError::Stopped)
    }
}

impl Default for Zre {
    fn default() -> Self {
        Zre::new()
    }
}
