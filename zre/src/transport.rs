//! Message-oriented transport: a `Router` accepts many `Dealer`
//! connections and tags inbound traffic with each dealer's routing
//! identity.
//!
//! Frames go on the wire as `[more: u8][len: u32 BE][payload]`; a logical
//! message is every frame up to the first with `more == 0`. The first
//! message a dealer writes after connecting is its routing identity.
//!
//! Three address schemes are understood: `tcp://host:port` (`*` binds the
//! unspecified address, IPv6 literals in brackets), `ipc://path` (unix
//! sockets) and `inproc://name` (an in-process duplex registry, used by
//! tests and by gossip hubs inside one process).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const FLAG_MORE: u8 = 0x01;

/// Buffer size of one in-process duplex pipe.
const INPROC_PIPE: usize = 256 * 1024;

/// Dealers retry a failed connection attempt at this cadence, queueing
/// outbound messages up to the high-water mark meanwhile.
const CONNECT_RETRY: Duration = Duration::from_millis(250);
const CONNECT_ATTEMPTS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error("unsupported endpoint scheme `{0}`")]
    Unsupported(String),
    #[error("address in use: {0}")]
    AddrInUse(String),
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("send queue full")]
    Full,
    #[error("channel closed")]
    Closed,
    #[error("no connection for routing id")]
    NotConnected,
}

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`; host `*` is the unspecified address.
    Tcp { host: String, port: u16 },
    /// `ipc://path`, a filesystem socket.
    Ipc(String),
    /// `inproc://name`, same-process only.
    Inproc(String),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Endpoint, TransportError> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| TransportError::InvalidEndpoint(s.into()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| TransportError::InvalidEndpoint(s.into()))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.into()));
            }
            Ok(Endpoint::Tcp { host: host.into(), port })
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.into()));
            }
            Ok(Endpoint::Ipc(path.into()))
        } else if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.into()));
            }
            Ok(Endpoint::Inproc(name.into()))
        } else {
            let scheme = s.split("://").next().unwrap_or(s);
            Err(TransportError::Unsupported(scheme.into()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => {
                if host.contains(':') {
                    write!(f, "tcp://[{host}]:{port}")
                } else {
                    write!(f, "tcp://{host}:{port}")
                }
            }
            Endpoint::Ipc(path) => write!(f, "ipc://{path}"),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type BoxStream = Box<dyn Io>;

fn inproc_registry() -> &'static Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    frames: &[Vec<u8>],
) -> std::io::Result<()> {
    for (i, frame) in frames.iter().enumerate() {
        let more = if i + 1 < frames.len() { FLAG_MORE } else { 0 };
        w.write_u8(more).await?;
        w.write_u32(frame.len() as u32).await?;
        w.write_all(frame).await?;
    }
    w.flush().await
}

async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    loop {
        let more = r.read_u8().await?;
        let len = r.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame too large",
            ));
        }
        let mut frame = vec![0u8; len as usize];
        r.read_exact(&mut frame).await?;
        frames.push(frame);
        if more & FLAG_MORE == 0 {
            return Ok(frames);
        }
    }
}

type ConnMap = std::sync::Arc<Mutex<HashMap<Vec<u8>, mpsc::UnboundedSender<Vec<Vec<u8>>>>>>;

/// Inbound side of a node: accepts dealer connections and yields
/// `(routing_id, frames)` pairs on a bounded inbox channel.
pub struct Router {
    endpoint: Endpoint,
    local_port: u16,
    conns: ConnMap,
    shutdown: watch::Sender<bool>,
}

impl Router {
    pub async fn bind(
        endpoint: &Endpoint,
        inbox_capacity: usize,
    ) -> Result<(Router, mpsc::Receiver<(Vec<u8>, Vec<Vec<u8>>)>), TransportError> {
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let conns: ConnMap = Default::default();
        let mut local_port = 0;

        match endpoint {
            Endpoint::Tcp { host, port } => {
                let host = if host == "*" { "0.0.0.0" } else { host.as_str() };
                let listener = TcpListener::bind((host, *port))
                    .await
                    .map_err(TransportError::Bind)?;
                local_port = listener.local_addr().map_err(TransportError::Bind)?.port();
                tokio::spawn(accept_tcp(listener, conns.clone(), inbox_tx, shutdown_rx));
            }
            Endpoint::Ipc(path) => {
                #[cfg(unix)]
                {
                    let _ = std::fs::remove_file(path);
                    let listener = UnixListener::bind(path).map_err(TransportError::Bind)?;
                    tokio::spawn(accept_unix(listener, conns.clone(), inbox_tx, shutdown_rx));
                }
                #[cfg(not(unix))]
                return Err(TransportError::Unsupported("ipc".into()));
            }
            Endpoint::Inproc(name) => {
                let mut registry = inproc_registry().lock().unwrap();
                if registry.contains_key(name) {
                    return Err(TransportError::AddrInUse(name.clone()));
                }
                let (conn_tx, conn_rx) = mpsc::unbounded_channel();
                registry.insert(name.clone(), conn_tx);
                tokio::spawn(accept_inproc(conn_rx, conns.clone(), inbox_tx, shutdown_rx));
            }
        }

        Ok((
            Router {
                endpoint: endpoint.clone(),
                local_port,
                conns,
                shutdown,
            },
            inbox_rx,
        ))
    }

    /// Port of a tcp bind; meaningful after binding `tcp://*:0` or an
    /// ephemeral probe.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send a message back to a connected dealer.
    pub fn send(&self, routing_id: &[u8], frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        let conns = self.conns.lock().unwrap();
        let tx = conns.get(routing_id).ok_or(TransportError::NotConnected)?;
        tx.send(frames).map_err(|_| TransportError::NotConnected)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Endpoint::Inproc(name) = &self.endpoint {
            inproc_registry().lock().unwrap().remove(name);
        }
        #[cfg(unix)]
        if let Endpoint::Ipc(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    conns: ConnMap,
    inbox: mpsc::Sender<(Vec<u8>, Vec<Vec<u8>>)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_conn(
                        Box::new(stream) as BoxStream,
                        conns.clone(),
                        inbox.clone(),
                    ));
                }
                Err(e) => {
                    debug!("accept failed: {e}");
                    return;
                }
            },
        }
    }
}

#[cfg(unix)]
async fn accept_unix(
    listener: UnixListener,
    conns: ConnMap,
    inbox: mpsc::Sender<(Vec<u8>, Vec<Vec<u8>>)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_conn(
                        Box::new(stream) as BoxStream,
                        conns.clone(),
                        inbox.clone(),
                    ));
                }
                Err(e) => {
                    debug!("accept failed: {e}");
                    return;
                }
            },
        }
    }
}

async fn accept_inproc(
    mut conn_rx: mpsc::UnboundedReceiver<DuplexStream>,
    conns: ConnMap,
    inbox: mpsc::Sender<(Vec<u8>, Vec<Vec<u8>>)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            stream = conn_rx.recv() => match stream {
                Some(stream) => {
                    tokio::spawn(serve_conn(
                        Box::new(stream) as BoxStream,
                        conns.clone(),
                        inbox.clone(),
                    ));
                }
                None => return,
            },
        }
    }
}

/// Drive one accepted connection: the first message is the dealer's
/// routing identity, everything after it flows into the inbox.
async fn serve_conn(stream: BoxStream, conns: ConnMap, inbox: mpsc::Sender<(Vec<u8>, Vec<Vec<u8>>)>) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let routing_id = match read_message(&mut reader).await {
        Ok(frames) if frames.len() == 1 && !frames[0].is_empty() => frames[0].clone(),
        _ => {
            debug!("connection without routing identity, dropping");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();
    // A reconnect under the same routing id replaces the previous entry;
    // the displaced writer loses its channel and winds down.
    conns.lock().unwrap().insert(routing_id.clone(), tx.clone());

    tokio::spawn(async move {
        while let Some(frames) = rx.recv().await {
            if write_message(&mut writer, &frames).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_message(&mut reader).await {
            Ok(frames) => {
                if inbox.send((routing_id.clone(), frames)).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let mut conns = conns.lock().unwrap();
    if conns.get(&routing_id).is_some_and(|cur| cur.same_channel(&tx)) {
        conns.remove(&routing_id);
    }
}

/// Outbound side of a peer mailbox: connects to a remote router, sends
/// its routing identity first, then queued messages. `send` never
/// blocks; a full queue or a dead connection reports an error
/// immediately.
pub struct Dealer {
    tx: mpsc::Sender<Vec<Vec<u8>>>,
}

impl Dealer {
    /// Start connecting. The connection is established in the
    /// background (with retries inside the liveness window); messages
    /// queue up to `hwm` meanwhile.
    pub fn connect(
        endpoint: &Endpoint,
        routing_id: Vec<u8>,
        hwm: usize,
    ) -> (Dealer, mpsc::Receiver<Vec<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(hwm.max(1));
        let (in_tx, in_rx) = mpsc::channel(hwm.max(1));
        tokio::spawn(run_dealer(endpoint.clone(), routing_id, rx, in_tx));
        (Dealer { tx }, in_rx)
    }

    /// Queue a message without blocking.
    pub fn send(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        self.tx.try_send(frames).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

async fn run_dealer(
    endpoint: Endpoint,
    routing_id: Vec<u8>,
    mut rx: mpsc::Receiver<Vec<Vec<u8>>>,
    in_tx: mpsc::Sender<Vec<Vec<u8>>>,
) {
    let stream = match establish(&endpoint).await {
        Some(stream) => stream,
        None => {
            debug!("could not connect to {endpoint}");
            return; // rx drops; sends start failing
        }
    };
    let (mut reader, mut writer) = tokio::io::split(stream);

    if write_message(&mut writer, &[routing_id]).await.is_err() {
        return;
    }

    // Inbound traffic from the router (a plain peer mailbox never gets
    // any; gossip clients do). Discard once the receiver is gone.
    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(frames) => {
                    let _ = in_tx.send(frames).await;
                }
                Err(_) => return,
            }
        }
    });

    while let Some(frames) = rx.recv().await {
        if write_message(&mut writer, &frames).await.is_err() {
            return;
        }
    }
}

async fn establish(endpoint: &Endpoint) -> Option<BoxStream> {
    for attempt in 0..CONNECT_ATTEMPTS {
        match try_connect(endpoint).await {
            Some(stream) => return Some(stream),
            None if attempt + 1 < CONNECT_ATTEMPTS => {
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            None => break,
        }
    }
    None
}

async fn try_connect(endpoint: &Endpoint) -> Option<BoxStream> {
    match endpoint {
        Endpoint::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
            .await
            .ok()
            .map(|s| {
                let _ = s.set_nodelay(true);
                Box::new(s) as BoxStream
            }),
        Endpoint::Ipc(path) => {
            #[cfg(unix)]
            {
                UnixStream::connect(path).await.ok().map(|s| Box::new(s) as BoxStream)
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                None
            }
        }
        Endpoint::Inproc(name) => {
            let conn_tx = inproc_registry().lock().unwrap().get(name).cloned()?;
            let (ours, theirs) = tokio::io::duplex(INPROC_PIPE);
            conn_tx.send(theirs).ok()?;
            Some(Box::new(ours) as BoxStream)
        }
    }
}
