//! Peer registry: attached endpoints indexed by participant id and by
//! symbolic client id.
//!
//! The registry mutex guards the maps only. Senders snapshot the endpoint
//! handle, release the lock, then queue the write; the endpoint's own queue
//! serializes the actual frames.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use tss_types::{Envelope, ParticipantId};

use crate::endpoint::Endpoint;
use crate::error::{NetworkError, NetworkResult};

#[derive(Default)]
struct Connections {
    peers: HashMap<ParticipantId, Arc<Endpoint>>,
    clients: HashMap<String, Arc<Endpoint>>,
}

/// Registry of live transports for one coordinator process.
pub struct PeerRegistry {
    local_id: ParticipantId,
    connections: RwLock<Connections>,
}

impl PeerRegistry {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            connections: RwLock::new(Connections::default()),
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    /// Attach a peer endpoint. Idempotent: an existing endpoint for the same
    /// id is replaced (and closed).
    pub async fn attach(&self, id: ParticipantId, endpoint: Arc<Endpoint>) {
        let previous = {
            let mut connections = self.connections.write().await;
            connections.peers.insert(id, endpoint)
        };
        if let Some(old) = previous {
            old.close().await;
        }
        debug!(peer = %id, "peer endpoint attached");
    }

    /// Detach a peer endpoint; detaching an unknown id is a no-op.
    pub async fn detach(&self, id: ParticipantId) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.peers.remove(&id)
        };
        if removed.is_some() {
            debug!(peer = %id, "peer endpoint detached");
        }
    }

    pub async fn attach_client(&self, client_id: impl Into<String>, endpoint: Arc<Endpoint>) {
        let client_id = client_id.into();
        let previous = {
            let mut connections = self.connections.write().await;
            connections.clients.insert(client_id.clone(), endpoint)
        };
        if let Some(old) = previous {
            old.close().await;
        }
        debug!(client = %client_id, "client endpoint attached");
    }

    pub async fn detach_client(&self, client_id: &str) {
        let mut connections = self.connections.write().await;
        connections.clients.remove(client_id);
    }

    /// Endpoint handle for an attached peer, if any.
    pub async fn peer_endpoint(&self, id: ParticipantId) -> Option<Arc<Endpoint>> {
        self.connections.read().await.peers.get(&id).cloned()
    }

    /// Queue an envelope to one participant.
    pub async fn send_to(&self, id: ParticipantId, envelope: Envelope) -> NetworkResult<()> {
        let endpoint = self
            .peer_endpoint(id)
            .await
            .ok_or(NetworkError::NotConnected { id })?;
        endpoint.send(envelope).await
    }

    /// Queue an envelope to one attached client.
    pub async fn send_to_client(&self, client_id: &str, envelope: Envelope) -> NetworkResult<()> {
        let endpoint = {
            self.connections
                .read()
                .await
                .clients
                .get(client_id)
                .cloned()
        }
        .ok_or_else(|| NetworkError::ClientNotConnected {
            client_id: client_id.to_string(),
        })?;
        endpoint.send(envelope).await
    }

    /// Send to every attached peer except `exclude`. Individual failures are
    /// reported but do not stop the fan-out.
    pub async fn broadcast(&self, envelope: Envelope, exclude: Option<ParticipantId>) {
        let targets: Vec<(ParticipantId, Arc<Endpoint>)> = {
            let connections = self.connections.read().await;
            connections
                .peers
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, endpoint)| (*id, Arc::clone(endpoint)))
                .collect()
        };
        for (id, endpoint) in targets {
            if let Err(e) = endpoint.send(envelope.clone()).await {
                debug!(peer = %id, error = %e, "broadcast delivery failed");
            }
        }
    }

    /// Send to every attached client. This is the local hub used both for
    /// completion notifications and as the routing fallback when a
    /// participant is federated behind another coordinator.
    pub async fn broadcast_clients(&self, envelope: Envelope) {
        let targets: Vec<(String, Arc<Endpoint>)> = {
            let connections = self.connections.read().await;
            connections
                .clients
                .iter()
                .map(|(id, endpoint)| (id.clone(), Arc::clone(endpoint)))
                .collect()
        };
        for (id, endpoint) in targets {
            if let Err(e) = endpoint.send(envelope.clone()).await {
                debug!(client = %id, error = %e, "client delivery failed");
            }
        }
    }

    /// Snapshot of currently attached participant ids.
    pub async fn connected_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> =
            self.connections.read().await.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn is_connected(&self, id: ParticipantId) -> bool {
        self.connections.read().await.peers.contains_key(&id)
    }

    /// Number of attached clients (open-enrollment gating counts these).
    pub async fn client_count(&self) -> usize {
        self.connections.read().await.clients.len()
    }

    /// Endpoint handle for an attached client, if any.
    pub async fn client_endpoint(&self, client_id: &str) -> Option<Arc<Endpoint>> {
        self.connections.read().await.clients.get(client_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{split, EndpointConfig};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tss_types::MessageType;

    async fn endpoint_pair() -> (Arc<Endpoint>, mpsc::UnboundedReceiver<Envelope>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (reader_c, writer_c) = split(client);
        let (reader_s, writer_s) = split(server);

        let sender = Endpoint::spawn(
            reader_c,
            writer_c,
            "sender",
            EndpointConfig::default(),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let _receiver = Endpoint::spawn(
            reader_s,
            writer_s,
            "receiver",
            EndpointConfig::default(),
            Arc::new(move |envelope| {
                let _ = tx.send(envelope);
            }),
            Arc::new(|| {}),
        );
        (sender, rx)
    }

    #[tokio::test]
    async fn send_to_unknown_peer_reports_not_connected() {
        let registry = PeerRegistry::new(ParticipantId(1));
        let result = registry
            .send_to(ParticipantId(2), Envelope::new(MessageType::Ack, ""))
            .await;
        assert!(matches!(
            result,
            Err(NetworkError::NotConnected {
                id: ParticipantId(2)
            })
        ));
    }

    #[tokio::test]
    async fn attach_send_detach() {
        let registry = PeerRegistry::new(ParticipantId(1));
        let (endpoint, mut rx) = endpoint_pair().await;

        registry.attach(ParticipantId(2), endpoint).await;
        assert_eq!(registry.connected_ids().await, vec![ParticipantId(2)]);

        registry
            .send_to(ParticipantId(2), Envelope::new(MessageType::Ack, ""))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().msg_type, MessageType::Ack);

        registry.detach(ParticipantId(2)).await;
        assert!(registry.connected_ids().await.is_empty());
        assert!(registry
            .send_to(ParticipantId(2), Envelope::new(MessageType::Ack, ""))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_id() {
        let registry = PeerRegistry::new(ParticipantId(1));
        let (endpoint_two, mut rx_two) = endpoint_pair().await;
        let (endpoint_three, mut rx_three) = endpoint_pair().await;
        registry.attach(ParticipantId(2), endpoint_two).await;
        registry.attach(ParticipantId(3), endpoint_three).await;

        registry
            .broadcast(
                Envelope::new(MessageType::SessionSync, "s"),
                Some(ParticipantId(2)),
            )
            .await;

        assert_eq!(
            rx_three.recv().await.unwrap().msg_type,
            MessageType::SessionSync
        );
        assert!(rx_two.try_recv().is_err());
    }

    #[tokio::test]
    async fn clients_are_tracked_separately() {
        let registry = PeerRegistry::new(ParticipantId(1));
        let (endpoint, mut rx) = endpoint_pair().await;
        registry.attach_client("web-1", endpoint).await;

        assert_eq!(registry.client_count().await, 1);
        assert!(registry.connected_ids().await.is_empty());

        registry
            .broadcast_clients(Envelope::new(MessageType::KeygenComplete, "s"))
            .await;
        assert_eq!(
            rx.recv().await.unwrap().msg_type,
            MessageType::KeygenComplete
        );

        registry.detach_client("web-1").await;
        assert_eq!(registry.client_count().await, 0);
    }
}
