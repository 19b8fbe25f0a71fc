//! UDP beacon service: periodically broadcast a small advertisement on
//! the local link and deliver received advertisements as signals.
//!
//! One task owns the socket and multiplexes the publish ticker, the
//! receive path and the control commands. Shutdown is a command, not a
//! self-addressed wake-up datagram; `close` flushes one final transmit
//! of the current frame, so publishing the zero-port frame right before
//! closing broadcasts the departure.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use zre_core::beacon::BEACON_MAX;

use crate::config;

/// All-nodes multicast group assigned to ZRE discovery.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 250);

#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("no usable broadcast interface")]
    NoInterface,
    #[error("unknown interface `{0}`")]
    InterfaceNotFound(String),
    #[error("beacon frame exceeds {BEACON_MAX} bytes")]
    FrameTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A received advertisement: the sender's address and the raw bytes.
#[derive(Debug, Clone)]
pub struct BeaconSignal {
    pub addr: IpAddr,
    pub bytes: Vec<u8>,
}

enum BeaconCmd {
    Publish(Vec<u8>),
    Silence,
    Subscribe(Vec<u8>),
    Unsubscribe,
    NoEcho,
    #[cfg(test)]
    SetDestination(SocketAddr),
    Close(oneshot::Sender<()>),
}

/// Handle to a running beacon.
pub struct Beacon {
    cmd_tx: mpsc::UnboundedSender<BeaconCmd>,
    local_ip: IpAddr,
    port: u16,
}

impl Beacon {
    /// Bind the UDP socket, join the discovery multicast group and start
    /// the beacon task. Nothing is transmitted until `publish`.
    pub async fn start(
        port: u16,
        interval: Duration,
        iface: Option<&str>,
    ) -> Result<(Beacon, mpsc::Receiver<BeaconSignal>), BeaconError> {
        let local_ip = select_interface(iface)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&bind.into())?;
        // Joining on loopback-only setups can fail; reception still works
        // for unicast and broadcast, so this is not fatal.
        if let Err(e) = socket.join_multicast_v4(&MULTICAST_GROUP, &local_ip) {
            debug!("join multicast on {local_ip} failed: {e}");
        }
        let _ = socket.set_multicast_loop_v4(true);
        let _ = socket.set_multicast_ttl_v4(1);
        socket.set_broadcast(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        let destination: SocketAddr = if config::broadcast_enabled() {
            (Ipv4Addr::BROADCAST, port).into()
        } else {
            (MULTICAST_GROUP, port).into()
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::channel(config::SIGNAL_CAPACITY);
        let interval = if interval.is_zero() { config::BEACON_INTERVAL } else { interval };
        tokio::spawn(run_beacon(socket, destination, interval, cmd_rx, signal_tx));

        Ok((
            Beacon {
                cmd_tx,
                local_ip: IpAddr::V4(local_ip),
                port,
            },
            signal_rx,
        ))
    }

    /// Address of the interface the beacon speaks on; the node derives
    /// its advertised endpoint from it.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start periodic transmission of `frame` (sent once immediately).
    pub fn publish(&self, frame: Vec<u8>) -> Result<(), BeaconError> {
        if frame.len() > BEACON_MAX {
            return Err(BeaconError::FrameTooLong);
        }
        let _ = self.cmd_tx.send(BeaconCmd::Publish(frame));
        Ok(())
    }

    /// Stop transmitting; reception continues.
    pub fn silence(&self) {
        let _ = self.cmd_tx.send(BeaconCmd::Silence);
    }

    /// Only deliver received frames starting with `prefix`.
    pub fn subscribe(&self, prefix: Vec<u8>) {
        let _ = self.cmd_tx.send(BeaconCmd::Subscribe(prefix));
    }

    /// Drop the prefix filter (deliver everything).
    pub fn unsubscribe(&self) {
        let _ = self.cmd_tx.send(BeaconCmd::Unsubscribe);
    }

    /// Drop received frames byte-identical to the published one.
    pub fn no_echo(&self) {
        let _ = self.cmd_tx.send(BeaconCmd::NoEcho);
    }

    #[cfg(test)]
    fn set_destination(&self, dest: SocketAddr) {
        let _ = self.cmd_tx.send(BeaconCmd::SetDestination(dest));
    }

    /// Shut the beacon down. The current frame, if any, is transmitted
    /// one final time before the socket is dropped.
    pub async fn close(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(BeaconCmd::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg_attr(not(test), allow(unused_mut))]
async fn run_beacon(
    socket: UdpSocket,
    mut destination: SocketAddr,
    interval: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<BeaconCmd>,
    signal_tx: mpsc::Sender<BeaconSignal>,
) {
    let mut transmit: Option<Vec<u8>> = None;
    let mut filter: Option<Vec<u8>> = None;
    let mut noecho = false;
    let mut ticker = tokio::time::interval(interval);
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(BeaconCmd::Publish(frame)) => {
                    let _ = socket.send_to(&frame, destination).await;
                    transmit = Some(frame);
                }
                Some(BeaconCmd::Silence) => transmit = None,
                Some(BeaconCmd::Subscribe(prefix)) => filter = Some(prefix),
                Some(BeaconCmd::Unsubscribe) => filter = None,
                Some(BeaconCmd::NoEcho) => noecho = true,
                #[cfg(test)]
                Some(BeaconCmd::SetDestination(dest)) => destination = dest,
                Some(BeaconCmd::Close(ack)) => {
                    if let Some(frame) = &transmit {
                        let _ = socket.send_to(frame, destination).await;
                    }
                    let _ = ack.send(());
                    return;
                }
                None => return,
            },
            _ = ticker.tick() => {
                if let Some(frame) = &transmit {
                    if let Err(e) = socket.send_to(frame, destination).await {
                        warn!("beacon send to {destination} failed: {e}");
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        debug!("beacon receive failed: {e}");
                        continue;
                    }
                };
                if n == 0 || n > BEACON_MAX {
                    continue;
                }
                let bytes = &buf[..n];
                let wanted = filter.as_deref().map_or(true, |p| bytes.starts_with(p));
                let echo = noecho && transmit.as_deref() == Some(bytes);
                if wanted && !echo {
                    // Full channel: drop silently rather than stall the socket.
                    let _ = signal_tx.try_send(BeaconSignal {
                        addr: from.ip(),
                        bytes: bytes.to_vec(),
                    });
                }
            }
        }
    }
}

/// Pick the IPv4 address the beacon binds its outgoing traffic to.
/// An explicit interface (name or literal address) wins over the
/// environment override; otherwise the first non-loopback interface.
fn select_interface(explicit: Option<&str>) -> Result<Ipv4Addr, BeaconError> {
    let choice = explicit
        .map(str::to_string)
        .or_else(config::interface_override);

    if let Some(choice) = choice {
        if let Ok(addr) = choice.parse::<Ipv4Addr>() {
            return Ok(addr);
        }
        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|_| BeaconError::NoInterface)?;
        return interfaces
            .into_iter()
            .find_map(|(name, ip)| match ip {
                IpAddr::V4(v4) if name == choice => Some(v4),
                _ => None,
            })
            .ok_or(BeaconError::InterfaceNotFound(choice));
    }

    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|_| BeaconError::NoInterface)?;
    interfaces
        .into_iter()
        .find_map(|(_, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .ok_or(BeaconError::NoInterface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zre_core::{BeaconFrame, PeerId, BEACON_PREFIX};

    async fn test_beacon(port: u16) -> (Beacon, mpsc::Receiver<BeaconSignal>) {
        Beacon::start(port, Duration::from_millis(100), Some("127.0.0.1"))
            .await
            .expect("beacon start")
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn receives_unicast_frames_matching_filter() {
        let port = free_udp_port();
        let (beacon, mut signals) = test_beacon(port).await;
        beacon.subscribe(BEACON_PREFIX.to_vec());

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = BeaconFrame::new(PeerId::random(), 4242).encode();
        sender.send_to(&frame, ("127.0.0.1", port)).await.unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("signal in time")
            .expect("signal");
        assert_eq!(signal.bytes, frame);
        assert!(signal.addr.is_loopback());
        beacon.close().await;
    }

    #[tokio::test]
    async fn filters_out_non_matching_prefixes() {
        let port = free_udp_port();
        let (beacon, mut signals) = test_beacon(port).await;
        beacon.subscribe(BEACON_PREFIX.to_vec());

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"XXX not a beacon", ("127.0.0.1", port)).await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(300), signals.recv()).await;
        assert!(timed_out.is_err(), "filtered frame must not be delivered");
        beacon.close().await;
    }

    #[tokio::test]
    async fn drops_overlong_frames() {
        let port = free_udp_port();
        let (beacon, mut signals) = test_beacon(port).await;

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[0u8; 256], ("127.0.0.1", port)).await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(300), signals.recv()).await;
        assert!(timed_out.is_err(), "overlong frame must be dropped");
        beacon.close().await;
    }

    #[tokio::test]
    async fn no_echo_suppresses_own_transmit() {
        let port = free_udp_port();
        let (beacon, mut signals) = test_beacon(port).await;
        beacon.no_echo();

        let frame = BeaconFrame::new(PeerId::random(), 4242).encode().to_vec();
        beacon.publish(frame.clone()).unwrap();

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&frame, ("127.0.0.1", port)).await.unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(300), signals.recv()).await;
        assert!(timed_out.is_err(), "own frame must be suppressed");

        // A different frame still gets through.
        let other = BeaconFrame::new(PeerId::random(), 4243).encode().to_vec();
        sender.send_to(&other, ("127.0.0.1", port)).await.unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("signal in time")
            .expect("signal");
        assert_eq!(signal.bytes, other);
        beacon.close().await;
    }

    #[tokio::test]
    async fn publishes_periodically_and_flushes_departure_on_close() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        let port = free_udp_port();
        let (beacon, _signals) = test_beacon(port).await;
        beacon.set_destination(dest);

        let id = PeerId::random();
        beacon.publish(BeaconFrame::new(id, 4242).encode().to_vec()).unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("first transmit")
            .unwrap();
        let parsed = BeaconFrame::parse(&buf[..n]).expect("valid beacon");
        assert_eq!(parsed.identity, id);
        assert_eq!(parsed.port, 4242);

        // Departure: publish the zero-port frame, close flushes it.
        beacon.publish(BeaconFrame::departure(id).encode().to_vec()).unwrap();
        beacon.close().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let (n, _) = tokio::time::timeout(remaining, receiver.recv_from(&mut buf))
                .await
                .expect("departure frame")
                .unwrap();
            if let Some(frame) = BeaconFrame::parse(&buf[..n]) {
                if frame.is_departure() {
                    assert_eq!(frame.identity, id);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn rejects_overlong_publish() {
        let port = free_udp_port();
        let (beacon, _signals) = test_beacon(port).await;
        assert!(matches!(
            beacon.publish(vec![0u8; 300]),
            Err(BeaconError::FrameTooLong)
        ));
        beacon.close().await;
    }

    #[test]
    fn interface_selection_accepts_literal_addresses() {
        assert_eq!(
            select_interface(Some("127.0.0.1")).unwrap(),
            Ipv4Addr::LOCALHOST
        );
        assert!(matches!(
            select_interface(Some("no-such-interface-zre")),
            Err(BeaconError::InterfaceNotFound(_))
        ));
    }
}
