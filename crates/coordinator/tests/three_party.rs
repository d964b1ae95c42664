//! End-to-end scenarios over loopback TCP with in-process coordinators.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use tss_coordinator::{CoordinatorConfig, SessionCoordinator};
use tss_network::PeerRegistry;
use tss_provider::{ecdsa_verify, ed25519_verify, CurvProvider, EcdsaSignatureData, Ed25519SignatureData};
use tss_types::{CurveKind, ParticipantId, Session, SessionStatus};

fn test_config(id: u16, wait_secs: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        participant_id: id,
        name: format!("node-{id}"),
        participant_wait_timeout_secs: wait_secs,
        connect_backoff_secs: 1,
        ..CoordinatorConfig::default()
    }
}

struct Cluster {
    nodes: Vec<Arc<SessionCoordinator>>,
}

impl Cluster {
    /// Spin up `n` coordinators and connect them into a full mesh (lower id
    /// dials higher id; the acceptor registers the reverse direction).
    async fn start(n: u16, wait_secs: u64) -> Self {
        let mut nodes = Vec::new();
        let mut addrs = Vec::new();
        for id in 1..=n {
            let node = SessionCoordinator::new(
                test_config(id, wait_secs),
                Arc::new(CurvProvider::new()),
                Arc::new(PeerRegistry::new(ParticipantId(id))),
            );
            let addr = node.serve_transport("127.0.0.1:0").await.unwrap();
            nodes.push(node);
            addrs.push(addr);
        }

        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                nodes[i].connect_to_peer(
                    ParticipantId((j + 1) as u16),
                    addrs[j].to_string(),
                );
            }
        }

        let cluster = Self { nodes };
        cluster.await_mesh().await;
        cluster
    }

    async fn await_mesh(&self) {
        // The session gate re-checks connectivity with its own timeout; a
        // short settle keeps the accept/dial races out of test timings.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    fn node(&self, id: u16) -> &Arc<SessionCoordinator> {
        &self.nodes[(id - 1) as usize]
    }

    async fn await_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        within: Duration,
    ) -> Vec<Session> {
        tokio::time::timeout(within, async {
            loop {
                let mut sessions = Vec::new();
                let mut all = true;
                for node in &self.nodes {
                    match node.session(session_id).await {
                        Some(session) if session.status == status => sessions.push(session),
                        Some(session) if session.is_terminal() && status != session.status => {
                            panic!(
                                "session {session_id} reached {} while waiting for {status}",
                                session.status
                            );
                        }
                        _ => {
                            all = false;
                            break;
                        }
                    }
                }
                if all {
                    return sessions;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session {session_id} never reached {status} everywhere"))
    }

    /// Wait for the given signers to report a completed signature.
    async fn await_signature(
        &self,
        session_id: Uuid,
        reporter: u16,
        within: Duration,
    ) -> (String, String) {
        tokio::time::timeout(within, async {
            loop {
                if let Some(session) = self.node(reporter).session(session_id).await {
                    if session.status == SessionStatus::Failed {
                        panic!(
                            "sign session failed: {:?}",
                            session.data.get("reason")
                        );
                    }
                    if let (Some(r), Some(s)) = (
                        session.data.get("signature_r"),
                        session.data.get("signature_s"),
                    ) {
                        return (r.clone(), s.clone());
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("signature never appeared")
    }

    async fn run_keygen(&self, threshold: u16, curve: CurveKind, within: Duration) -> Uuid {
        let participants: Vec<u16> = (1..=self.nodes.len() as u16).collect();
        let session_id = self
            .node(1)
            .start_keygen(threshold, participants, curve, None)
            .await
            .unwrap();
        self.await_status(session_id, SessionStatus::Completed, within)
            .await;
        session_id
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_party_ed25519_dkg_completes_with_matching_keys() {
    let cluster = Cluster::start(3, 10).await;
    let participants: Vec<u16> = vec![1, 2, 3];
    let session_id = cluster
        .node(1)
        .start_keygen(2, participants, CurveKind::Ed25519, None)
        .await
        .unwrap();

    // All three coordinators complete within five seconds on loopback.
    cluster
        .await_status(session_id, SessionStatus::Completed, Duration::from_secs(5))
        .await;

    let shares: Vec<_> = futures::future::join_all(
        cluster
            .nodes
            .iter()
            .map(|node| node.key_share(session_id)),
    )
    .await
    .into_iter()
    .map(|share| share.expect("every participant holds a share"))
    .collect();

    assert_eq!(shares[0].public_key, shares[1].public_key);
    assert_eq!(shares[1].public_key, shares[2].public_key);
    for share in &shares {
        assert!(!share.secret_share.is_empty());
        assert_ne!(share.secret_share.trim_matches('0'), "");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_of_two_ecdsa_sign_verifies() {
    let cluster = Cluster::start(2, 10).await;
    let key_id = cluster
        .run_keygen(2, CurveKind::Secp256k1, Duration::from_secs(10))
        .await;

    let message = b"Hello, ECDSA MPC!";
    let session_id = cluster
        .node(1)
        .start_sign(key_id, message, vec![1, 2], None)
        .await
        .unwrap();

    let (r, s) = cluster
        .await_signature(session_id, 1, Duration::from_secs(120))
        .await;

    let share = cluster.node(1).key_share(key_id).await.unwrap();
    let hash = sha2_digest(message);
    assert!(ecdsa_verify(
        &share.public_key,
        &hash,
        &EcdsaSignatureData { r, s }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_with_lost_share_preserves_key_and_signs() {
    let cluster = Cluster::start(3, 10).await;
    let key_id = cluster
        .run_keygen(2, CurveKind::Ed25519, Duration::from_secs(10))
        .await;
    let original_key = cluster.node(1).key_share(key_id).await.unwrap().public_key;

    // Participant 2 lost its secret; 1 and 3 devote material.
    assert!(cluster.node(2).mark_share_lost(key_id).await);
    let reshare_id = cluster
        .node(1)
        .start_reshare(key_id, 2, vec![1, 2, 3], (1, 3), None)
        .await
        .unwrap();
    cluster
        .await_status(reshare_id, SessionStatus::Completed, Duration::from_secs(10))
        .await;

    // Participant 2 holds a fresh, valid share; the group key is unchanged.
    let recovered = cluster.node(2).key_share(key_id).await.unwrap();
    assert_eq!(recovered.public_key, original_key);
    assert!(!recovered.secret_share.is_empty());

    // A 2-of-2 sign using the recovered share verifies under the old key.
    let message = b"Hello, Ed25519 Threshold Signature!";
    let session_id = cluster
        .node(1)
        .start_sign(key_id, message, vec![1, 2], None)
        .await
        .unwrap();
    let (r, s) = cluster
        .await_signature(session_id, 1, Duration::from_secs(30))
        .await;
    assert!(ed25519_verify(
        &original_key,
        &sha2_digest(message),
        &Ed25519SignatureData { r, s }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_participant_fails_the_session_after_timeout() {
    // Nodes 1 and 2 are meshed; node 3 is expected but never attaches.
    let mut nodes = Vec::new();
    let mut addrs = Vec::new();
    for id in 1..=2u16 {
        let node = SessionCoordinator::new(
            test_config(id, 2),
            Arc::new(CurvProvider::new()),
            Arc::new(PeerRegistry::new(ParticipantId(id))),
        );
        let addr = node.serve_transport("127.0.0.1:0").await.unwrap();
        nodes.push(node);
        addrs.push(addr);
    }
    nodes[0].connect_to_peer(ParticipantId(2), addrs[1].to_string());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let session_id = nodes[0]
        .start_keygen(2, vec![1, 2, 3], CurveKind::Ed25519, None)
        .await
        .unwrap();

    let session = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(session) = nodes[0].session(session_id).await {
                if session.is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("session never became terminal");

    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(
        session.data.get("reason").map(String::as_str),
        Some("participant timeout")
    );
    // No completion was ever produced.
    assert!(session.data.get("public_key").is_none());
    assert!(nodes[0].key_share(session_id).await.is_none());

    // The failure propagated to the connected peer.
    let peer_view = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = nodes[1].session(session_id).await {
                if session.is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("peer never observed the failure");
    assert_eq!(peer_view.status, SessionStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ed25519_two_of_three_sign_verifies() {
    let cluster = Cluster::start(3, 10).await;
    let key_id = cluster
        .run_keygen(2, CurveKind::Ed25519, Duration::from_secs(10))
        .await;

    let message = b"Hello, Ed25519 Threshold Signature!";
    let session_id = cluster
        .node(1)
        .start_sign(key_id, message, vec![1, 3], None)
        .await
        .unwrap();

    let (r, s) = cluster
        .await_signature(session_id, 1, Duration::from_secs(30))
        .await;

    let share = cluster.node(1).key_share(key_id).await.unwrap();
    assert!(ed25519_verify(
        &share.public_key,
        &sha2_digest(message),
        &Ed25519SignatureData { r, s }
    ));
}

fn sha2_digest(message: &[u8]) -> Vec<u8> {
    use sha2::Digest;
    sha2::Sha256::digest(message).to_vec()
}

/// Replay tolerance: a fake peer feeds coordinator 1 the same round-1
/// envelope three times; exactly one `keygen_round2` reply is produced.
mod duplicate_delivery {
    use super::*;
    use futures::SinkExt;
    use std::collections::BTreeMap;
    use tss_network::{split, Endpoint, EndpointConfig};
    use tss_provider::{CryptoProvider, DkgSetup};
    use tss_types::{
        encode_envelope, envelope::round_data, AckData, Envelope, MessageType, RoundData,
    };

    struct FakePeer {
        id: ParticipantId,
        endpoint: Arc<Endpoint>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        setup: Box<dyn DkgSetup>,
    }

    impl FakePeer {
        async fn connect(addr: &str, id: u16) -> Self {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (reader, mut writer) = split(stream);
            let hello = encode_envelope(
                &Envelope::new(MessageType::Ack, "").data(&AckData {
                    participant_id: Some(id),
                    name: Some(format!("node-{id}")),
                    ..AckData::default()
                }),
            )
            .unwrap();
            writer.send(hello).await.unwrap();

            let (tx, inbox) = mpsc::unbounded_channel();
            let endpoint = Endpoint::spawn(
                reader,
                writer,
                format!("fake-{id}"),
                EndpointConfig::default(),
                Arc::new(move |envelope| {
                    let _ = tx.send(envelope);
                }),
                Arc::new(|| {}),
            );

            let ids: Vec<ParticipantId> = (1..=3).map(ParticipantId).collect();
            let setup = CurvProvider::new()
                .new_dkg_setup(ParticipantId(id), &ids, 2, CurveKind::Ed25519)
                .unwrap();
            Self {
                id: ParticipantId(id),
                endpoint,
                inbox,
                setup,
            }
        }

        async fn next_of(&mut self, tag: MessageType) -> Envelope {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let envelope = self.inbox.recv().await.expect("inbox closed");
                    if envelope.msg_type == tag {
                        return envelope;
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("never received {tag}"))
        }

        fn extract(&self, envelope: &Envelope) -> (ParticipantId, String) {
            let payload: RoundData = envelope.payload().unwrap();
            let entry = payload.get(&self.id.to_string()).expect("no entry for us");
            (envelope.sender().unwrap(), entry.data.clone())
        }

        async fn send_round(
            &self,
            session_id: &str,
            tag: MessageType,
            round: u16,
            per_peer: &BTreeMap<ParticipantId, String>,
            to: ParticipantId,
        ) {
            let envelope = Envelope::new(tag, session_id)
                .from_participant(self.id)
                .to_participant(to)
                .round(round)
                .data(&round_data(self.id, per_peer));
            self.endpoint.send(envelope).await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replayed_round_one_produces_a_single_round_two() {
        let coordinator = SessionCoordinator::new(
            test_config(1, 10),
            Arc::new(CurvProvider::new()),
            Arc::new(PeerRegistry::new(ParticipantId(1))),
        );
        let addr = coordinator
            .serve_transport("127.0.0.1:0")
            .await
            .unwrap()
            .to_string();

        let mut peer2 = FakePeer::connect(&addr, 2).await;
        let mut peer3 = FakePeer::connect(&addr, 3).await;

        let session_id = coordinator
            .start_keygen(2, vec![1, 2, 3], CurveKind::Ed25519, None)
            .await
            .unwrap();
        let sid = session_id.to_string();

        // Round 1 from the real coordinator to both fake peers.
        let round1_to_2 = peer2.next_of(MessageType::KeygenRound1).await;
        let round1_to_3 = peer3.next_of(MessageType::KeygenRound1).await;

        // Fake peers run their own setups.
        let out2 = peer2.setup.round1().unwrap();
        let out3 = peer3.setup.round1().unwrap();

        // Peer 2 sends its round-1 envelope to the coordinator THREE times.
        for _ in 0..3 {
            peer2
                .send_round(&sid, MessageType::KeygenRound1, 1, &out2, ParticipantId(1))
                .await;
        }
        peer3
            .send_round(&sid, MessageType::KeygenRound1, 1, &out3, ParticipantId(1))
            .await;

        // Exactly one round-2 envelope arrives at each fake peer.
        let round2_to_2 = peer2.next_of(MessageType::KeygenRound2).await;
        let round2_to_3 = peer3.next_of(MessageType::KeygenRound2).await;

        // Drive the protocol to completion so the replay tolerance is not
        // just a stall: peers exchange their round-1/2 material directly.
        let inbound2_r1 = vec![
            peer2.extract(&round1_to_2),
            (ParticipantId(3), out3[&peer2.id].clone()),
        ];
        let inbound3_r1 = vec![
            peer3.extract(&round1_to_3),
            (ParticipantId(2), out2[&peer3.id].clone()),
        ];
        let out2_r2 = peer2.setup.round2(&inbound2_r1).unwrap();
        let out3_r2 = peer3.setup.round2(&inbound3_r1).unwrap();

        peer2
            .send_round(&sid, MessageType::KeygenRound2, 2, &out2_r2, ParticipantId(1))
            .await;
        peer3
            .send_round(&sid, MessageType::KeygenRound2, 2, &out3_r2, ParticipantId(1))
            .await;

        let inbound2_r2 = vec![
            peer2.extract(&round2_to_2),
            (ParticipantId(3), out3_r2[&peer2.id].clone()),
        ];
        let inbound3_r2 = vec![
            peer3.extract(&round2_to_3),
            (ParticipantId(2), out2_r2[&peer3.id].clone()),
        ];
        let share2 = peer2.setup.round3(&inbound2_r2).unwrap();
        let share3 = peer3.setup.round3(&inbound3_r2).unwrap();
        assert_eq!(share2.public_key, share3.public_key);

        // The coordinator completes and agrees on the key.
        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(session) = coordinator.session(session_id).await {
                    if session.status == SessionStatus::Completed {
                        return session;
                    }
                    assert_ne!(session.status, SessionStatus::Failed);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("coordinator never completed");
        assert_eq!(
            completed.data.get("public_key"),
            Some(&share2.public_key)
        );

        // No further round-2 traffic arrived for either peer.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(extra) = peer2.inbox.try_recv() {
            assert_ne!(extra.msg_type, MessageType::KeygenRound2);
        }
        while let Ok(extra) = peer3.inbox.try_recv() {
            assert_ne!(extra.msg_type, MessageType::KeygenRound2);
        }
    }
}
