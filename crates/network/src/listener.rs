//! TCP accept loop and peer dial-out.
//!
//! The first frame on any fresh connection is an `ack` hello naming either a
//! peer coordinator (participant id) or a request-originating client
//! (symbolic id). The acceptor attaches the endpoint in the registry under
//! that identity; the endpoint's close hook detaches it again.

use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tss_types::{
    decode_envelope, encode_envelope, AckData, Envelope, MessageType, ParticipantId,
};

use crate::endpoint::{split, Endpoint, EndpointConfig, EnvelopeHandler};
use crate::error::{NetworkError, NetworkResult};
use crate::registry::PeerRegistry;

/// How long a fresh connection may take to present its hello frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity presented in a hello frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Peer(ParticipantId),
    Client(String),
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Peer(id) => write!(f, "peer-{id}"),
            Identity::Client(id) => write!(f, "client-{id}"),
        }
    }
}

/// Bind the coordinator's listening socket.
pub async fn bind(addr: &str) -> NetworkResult<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| NetworkError::BindFailed {
            address: addr.to_string(),
            source,
        })?;
    info!(address = %addr, "transport listener bound");
    Ok(listener)
}

/// Spawn the accept loop. Every accepted connection is handshaked and, on
/// success, attached to the registry under its presented identity.
pub fn spawn_acceptor(
    listener: TcpListener,
    registry: Arc<PeerRegistry>,
    config: EndpointConfig,
    handler: EnvelopeHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(remote = %remote, "incoming transport connection");

            let registry = Arc::clone(&registry);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                match accept_connection(stream, registry, config, handler).await {
                    Ok(identity) => debug!(remote = %remote, identity = %identity, "attached"),
                    Err(e) => warn!(remote = %remote, error = %e, "handshake rejected"),
                }
            });
        }
    })
}

async fn accept_connection(
    stream: TcpStream,
    registry: Arc<PeerRegistry>,
    config: EndpointConfig,
    handler: EnvelopeHandler,
) -> NetworkResult<Identity> {
    let remote = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut reader, writer) = split(stream);

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| NetworkError::HandshakeFailed {
            address: remote.clone(),
            reason: "hello frame timed out".to_string(),
        })?
        .ok_or_else(|| NetworkError::HandshakeFailed {
            address: remote.clone(),
            reason: "connection closed before hello".to_string(),
        })?
        .map_err(|e| NetworkError::HandshakeFailed {
            address: remote.clone(),
            reason: e.to_string(),
        })?;

    let identity = parse_hello(&hello).ok_or_else(|| NetworkError::HandshakeFailed {
        address: remote.clone(),
        reason: "first frame was not a usable ack hello".to_string(),
    })?;

    let endpoint = Endpoint::spawn(
        reader,
        writer,
        identity.to_string(),
        config,
        handler,
        close_hook(Arc::clone(&registry), identity.clone()),
    );

    match &identity {
        Identity::Peer(id) => registry.attach(*id, endpoint).await,
        Identity::Client(id) => registry.attach_client(id.clone(), endpoint).await,
    }
    Ok(identity)
}

fn parse_hello(line: &str) -> Option<Identity> {
    let envelope = decode_envelope(line).ok()?;
    if envelope.msg_type != MessageType::Ack {
        return None;
    }
    let ack: AckData = envelope.payload().ok()?;
    if let Some(id) = ack.participant_id {
        return Some(Identity::Peer(ParticipantId(id)));
    }
    ack.client_id.map(Identity::Client)
}

fn close_hook(
    registry: Arc<PeerRegistry>,
    identity: Identity,
) -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(move || {
        let registry = Arc::clone(&registry);
        let identity = identity.clone();
        tokio::spawn(async move {
            // Detach only if the registered endpoint is the one that closed;
            // an attach that replaced it must stay registered.
            match identity {
                Identity::Peer(id) => {
                    if let Some(current) = registry.peer_endpoint(id).await {
                        if current.is_closed() {
                            registry.detach(id).await;
                        }
                    }
                }
                Identity::Client(id) => {
                    if let Some(current) = registry.client_endpoint(&id).await {
                        if current.is_closed() {
                            registry.detach_client(&id).await;
                        }
                    }
                }
            }
        });
    })
}

/// Dial a configured peer, retrying with fixed backoff until the connection
/// is established, then attach it to the registry. Returns the endpoint.
pub async fn connect_peer(
    address: &str,
    peer_id: ParticipantId,
    hello: AckData,
    registry: Arc<PeerRegistry>,
    config: EndpointConfig,
    handler: EnvelopeHandler,
    backoff: Duration,
) -> NetworkResult<Arc<Endpoint>> {
    let stream = loop {
        match TcpStream::connect(address).await {
            Ok(stream) => break stream,
            Err(e) => {
                debug!(address = %address, error = %e, "peer dial failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }
    };

    let (reader, mut writer) = split(stream);
    let line = encode_envelope(
        &Envelope::new(MessageType::Ack, "").data(&hello),
    )
    .map_err(|e| NetworkError::Codec(e.to_string()))?;
    writer
        .send(line)
        .await
        .map_err(|e| NetworkError::HandshakeFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let identity = Identity::Peer(peer_id);
    let endpoint = Endpoint::spawn(
        reader,
        writer,
        identity.to_string(),
        config,
        handler,
        close_hook(Arc::clone(&registry), identity),
    );
    registry.attach(peer_id, Arc::clone(&endpoint)).await;
    info!(peer = %peer_id, address = %address, "peer connected");
    Ok(endpoint)
}
