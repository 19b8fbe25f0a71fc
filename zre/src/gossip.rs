//! Gossip rendezvous: an alternative to UDP beaconing for networks
//! without broadcast. One node binds a hub; every node connects a
//! client and publishes its `{identity → endpoint}` tuple. The hub
//! replays the known table to newcomers and forwards every publish to
//! all other clients.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Dealer, Endpoint, Router, TransportError};

/// Queue bound of a gossip client's dealer.
const GOSSIP_HWM: usize = 100;

/// Inbox bound of the hub router.
const HUB_INBOX: usize = 1_000;

#[derive(Debug, Serialize, Deserialize)]
enum GossipMsg {
    /// A client announcing itself; the hub answers with the full table.
    Hello,
    /// One `{identity → endpoint}` tuple.
    Publish { key: String, value: String },
}

fn encode(msg: &GossipMsg) -> Vec<Vec<u8>> {
    // Serializing an in-memory enum cannot fail.
    vec![bincode::serialize(msg).expect("gossip message serializes")]
}

/// The rendezvous service a node runs when `gossip_bind` is called.
pub(crate) struct GossipHub {
    router: Arc<Router>,
}

impl GossipHub {
    pub(crate) async fn bind(endpoint: &Endpoint) -> Result<GossipHub, TransportError> {
        let (router, inbox) = Router::bind(endpoint, HUB_INBOX).await?;
        let router = Arc::new(router);
        tokio::spawn(run_hub(router.clone(), inbox));
        Ok(GossipHub { router })
    }

    /// Bound tcp port (0 for ipc/inproc hubs).
    pub(crate) fn port(&self) -> u16 {
        self.router.local_port()
    }
}

async fn run_hub(router: Arc<Router>, mut inbox: mpsc::Receiver<(Vec<u8>, Vec<Vec<u8>>)>) {
    let mut tuples: HashMap<String, String> = HashMap::new();
    let mut clients: HashSet<Vec<u8>> = HashSet::new();

    while let Some((rid, frames)) = inbox.recv().await {
        let Some(frame) = frames.first() else { continue };
        match bincode::deserialize::<GossipMsg>(frame) {
            Ok(GossipMsg::Hello) => {
                for (key, value) in &tuples {
                    let _ = router.send(
                        &rid,
                        encode(&GossipMsg::Publish {
                            key: key.clone(),
                            value: value.clone(),
                        }),
                    );
                }
                clients.insert(rid);
            }
            Ok(GossipMsg::Publish { key, value }) => {
                tuples.insert(key.clone(), value.clone());
                let forward = GossipMsg::Publish { key, value };
                // Forward to everyone else; prune clients whose
                // connection has gone away.
                clients.retain(|client| {
                    client == &rid || router.send(client, encode(&forward)).is_ok()
                });
            }
            Err(e) => debug!("dropping malformed gossip frame: {e}"),
        }
    }
}

/// A node's connection to a hub.
pub(crate) struct GossipClient {
    dealer: Dealer,
}

impl GossipClient {
    /// Connect and announce. Received tuples flow into `updates`, which
    /// the node engine drains next to its other discovery inputs.
    pub(crate) fn connect(
        endpoint: &Endpoint,
        routing_id: Vec<u8>,
        updates: mpsc::Sender<(String, String)>,
    ) -> GossipClient {
        let (dealer, mut replies) = Dealer::connect(endpoint, routing_id, GOSSIP_HWM);
        let _ = dealer.send(encode(&GossipMsg::Hello));

        tokio::spawn(async move {
            while let Some(frames) = replies.recv().await {
                let Some(frame) = frames.first() else { continue };
                match bincode::deserialize::<GossipMsg>(frame) {
                    Ok(GossipMsg::Publish { key, value }) => {
                        if updates.send((key, value)).await.is_err() {
                            return;
                        }
                    }
                    Ok(GossipMsg::Hello) => {}
                    Err(e) => debug!("dropping malformed gossip frame: {e}"),
                }
            }
        });

        GossipClient { dealer }
    }

    pub(crate) fn publish(&self, key: String, value: String) {
        let _ = self.dealer.send(encode(&GossipMsg::Publish { key, value }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn uniq() -> Endpoint {
        static N: AtomicUsize = AtomicUsize::new(0);
        Endpoint::Inproc(format!("gossip-hub-{}", N.fetch_add(1, Ordering::Relaxed)))
    }

    fn rid(tag: u8) -> Vec<u8> {
        let mut id = vec![0x01];
        id.extend_from_slice(&[tag; 16]);
        id
    }

    async fn expect_tuple(
        rx: &mut mpsc::Receiver<(String, String)>,
        key: &str,
        value: &str,
    ) {
        let (k, v) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tuple in time")
            .expect("tuple");
        assert_eq!(k, key);
        assert_eq!(v, value);
    }

    #[tokio::test]
    async fn publishes_are_forwarded_to_other_clients() {
        let ep = uniq();
        let _hub = GossipHub::bind(&ep).await.unwrap();

        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let a = GossipClient::connect(&ep, rid(1), a_tx);
        let b = GossipClient::connect(&ep, rid(2), b_tx);

        a.publish("AAAA".into(), "tcp://10.0.0.1:5671".into());
        expect_tuple(&mut b_rx, "AAAA", "tcp://10.0.0.1:5671").await;

        b.publish("BBBB".into(), "tcp://10.0.0.2:5672".into());
        expect_tuple(&mut a_rx, "BBBB", "tcp://10.0.0.2:5672").await;
    }

    #[tokio::test]
    async fn late_client_gets_table_replay() {
        let ep = uniq();
        let _hub = GossipHub::bind(&ep).await.unwrap();

        let (a_tx, _a_rx) = mpsc::channel(16);
        let a = GossipClient::connect(&ep, rid(1), a_tx);
        a.publish("AAAA".into(), "tcp://10.0.0.1:5671".into());

        // Let the hub absorb the publish before the late join.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (late_tx, mut late_rx) = mpsc::channel(16);
        let _late = GossipClient::connect(&ep, rid(3), late_tx);
        expect_tuple(&mut late_rx, "AAAA", "tcp://10.0.0.1:5671").await;
    }

    #[tokio::test]
    async fn hub_reports_tcp_port() {
        let ep = Endpoint::Tcp { host: "127.0.0.1".into(), port: 0 };
        let hub = GossipHub::bind(&ep).await.unwrap();
        assert_ne!(hub.port(), 0);
    }
}
