//! Session coordinator: drives every session from creation to termination.
//!
//! One dispatch task per coordinator consumes inbound envelopes in arrival
//! order. All session state is mutated under the session's own mutex; the
//! mutex is released before anything touches a transport. Every status
//! transition is mirrored to peers with a `session_sync` envelope.

use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tss_network::{
    bind, connect_peer, spawn_acceptor, EnvelopeHandler, NetworkError, PeerRegistry,
};
use tss_protocols::{Artifact, Deposit, ProtocolMachine, RoundOutput};
use tss_provider::CryptoProvider;
use tss_types::{
    envelope::round_data, AckData, CurveKind, Envelope, ErrorData, KeygenCompleteData,
    KeygenInitData, MessageType, ParticipantId, ReshareCompleteData, ReshareInitData, RoundData,
    Session, SessionFailedData, SessionKind, SessionOrigin, SessionStatus, SessionSyncData,
    SignCompleteData, SignInitData,
};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::keystore::KeyStore;
use crate::store::{SessionStore, SharedEntry};

/// Reason string recorded when participant gating times out.
const PARTICIPANT_TIMEOUT: &str = "participant timeout";

pub struct SessionCoordinator {
    config: CoordinatorConfig,
    registry: Arc<PeerRegistry>,
    provider: Arc<dyn CryptoProvider>,
    store: SessionStore,
    keys: KeyStore,
    inbound: mpsc::UnboundedSender<Envelope>,
}

impl SessionCoordinator {
    /// Build the coordinator and spawn its dispatch loop.
    pub fn new(
        config: CoordinatorConfig,
        provider: Arc<dyn CryptoProvider>,
        registry: Arc<PeerRegistry>,
    ) -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let coordinator = Arc::new(Self {
            config,
            registry,
            provider,
            store: SessionStore::new(),
            keys: KeyStore::new(),
            inbound: inbound_tx,
        });

        let dispatcher = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                if let Err(e) = dispatcher.handle_envelope(envelope).await {
                    warn!(error = %e, "envelope handling failed");
                }
            }
        });

        coordinator
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn local_id(&self) -> ParticipantId {
        self.config.local_id()
    }

    fn id_str(&self) -> String {
        self.local_id().to_string()
    }

    /// Handler to plug into transport endpoints; forwards into the dispatch
    /// queue without blocking the reader.
    pub fn envelope_handler(&self) -> EnvelopeHandler {
        let tx = self.inbound.clone();
        Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        })
    }

    // ------------------------------------------------------------------
    // Networking bootstrap
    // ------------------------------------------------------------------

    /// Bind the transport listener and start accepting connections.
    pub async fn serve_transport(self: &Arc<Self>, addr: &str) -> CoordinatorResult<SocketAddr> {
        let listener = bind(addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CoordinatorError::Store(e.to_string()))?;
        spawn_acceptor(
            listener,
            Arc::clone(&self.registry),
            self.config.endpoint_config(),
            self.envelope_handler(),
        );
        Ok(local_addr)
    }

    /// Dial one configured peer, retrying with fixed backoff until attached.
    pub fn connect_to_peer(self: &Arc<Self>, id: ParticipantId, addr: String) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let handler = self.envelope_handler();
        let hello = AckData {
            participant_id: Some(self.config.participant_id),
            name: Some(self.config.name.clone()),
            ..AckData::default()
        };
        let endpoint_config = self.config.endpoint_config();
        let backoff = self.config.connect_backoff();
        tokio::spawn(async move {
            if let Err(e) = connect_peer(
                &addr, id, hello, registry, endpoint_config, handler, backoff,
            )
            .await
            {
                warn!(peer = %id, error = %e, "peer dial-out failed");
            }
        })
    }

    /// Dial every peer from the config.
    pub fn connect_configured_peers(self: &Arc<Self>) {
        for peer in self.config.peers.clone() {
            self.connect_to_peer(ParticipantId(peer.id), peer.addr);
        }
    }

    // ------------------------------------------------------------------
    // Read accessors (HTTP surface, tests)
    // ------------------------------------------------------------------

    pub async fn session(&self, id: Uuid) -> Option<Session> {
        let entry = self.store.get(id).await?;
        let guard = entry.lock().await;
        Some(guard.session.clone())
    }

    pub async fn sessions(
        &self,
        status: Option<SessionStatus>,
        kind: Option<SessionKind>,
    ) -> Vec<Session> {
        self.store.list(status, kind).await
    }

    pub async fn key_share(&self, key_id: Uuid) -> Option<tss_provider::KeyShare> {
        self.keys.share(key_id).await
    }

    /// Testing hook for the lost-share refresh path.
    pub async fn mark_share_lost(&self, key_id: Uuid) -> bool {
        self.keys.mark_share_lost(key_id).await
    }

    // ------------------------------------------------------------------
    // Local initiation (HTTP surface)
    // ------------------------------------------------------------------

    pub async fn start_keygen(
        self: &Arc<Self>,
        threshold: u16,
        participants: Vec<u16>,
        curve: CurveKind,
        initiated_by: Option<String>,
    ) -> CoordinatorResult<Uuid> {
        self.gate_role(SessionKind::Dkg)?;
        if participants.is_empty() || threshold == 0 || threshold > participants.len() as u16 {
            return Err(CoordinatorError::InvalidRequest(format!(
                "threshold {threshold} invalid for {} participants",
                participants.len()
            )));
        }

        let mut session = Session::new(
            Uuid::new_v4(),
            SessionKind::Dkg,
            participants.iter().copied().map(ParticipantId).collect(),
            threshold,
            SessionOrigin::Local,
        );
        session.initiated_by = initiated_by;
        session
            .data
            .insert("curve".to_string(), curve.to_string());

        let id = session.id;
        self.store.create(session.clone()).await?;
        info!(session = %id, kind = %SessionKind::Dkg, "session created");
        self.broadcast_sync(&session).await;
        self.spawn_gate(id);
        Ok(id)
    }

    pub async fn start_reshare(
        self: &Arc<Self>,
        key_session_id: Uuid,
        threshold: u16,
        participants: Vec<u16>,
        devote: (u16, u16),
        initiated_by: Option<String>,
    ) -> CoordinatorResult<Uuid> {
        self.gate_role(SessionKind::Refresh)?;
        let share = self
            .keys
            .share(key_session_id)
            .await
            .ok_or(CoordinatorError::UnknownKey(key_session_id))?;

        let mut session = Session::new(
            Uuid::new_v4(),
            SessionKind::Refresh,
            participants.iter().copied().map(ParticipantId).collect(),
            threshold,
            SessionOrigin::Local,
        );
        session.initiated_by = initiated_by;
        session
            .data
            .insert("key_session_id".to_string(), key_session_id.to_string());
        session
            .data
            .insert("devote".to_string(), format!("{},{}", devote.0, devote.1));
        session
            .data
            .insert("curve".to_string(), share.curve.to_string());

        let id = session.id;
        self.store.create(session.clone()).await?;
        info!(session = %id, kind = %SessionKind::Refresh, "session created");
        self.broadcast_sync(&session).await;
        self.spawn_gate(id);
        Ok(id)
    }

    pub async fn start_sign(
        self: &Arc<Self>,
        key_session_id: Uuid,
        message: &[u8],
        signers: Vec<u16>,
        initiated_by: Option<String>,
    ) -> CoordinatorResult<Uuid> {
        let share = self
            .keys
            .share(key_session_id)
            .await
            .ok_or(CoordinatorError::UnknownKey(key_session_id))?;
        let kind = match share.curve {
            CurveKind::Secp256k1 => SessionKind::EcdsaSign,
            CurveKind::Ed25519 => SessionKind::Ed25519Sign,
        };
        self.gate_role(kind)?;
        if signers.len() != 2 || signers[0] == signers[1] {
            return Err(CoordinatorError::InvalidRequest(
                "signing requires exactly two distinct signers".to_string(),
            ));
        }

        let mut session = Session::new(
            Uuid::new_v4(),
            kind,
            signers.iter().copied().map(ParticipantId).collect(),
            2,
            SessionOrigin::Local,
        );
        session.initiated_by = initiated_by;
        session
            .data
            .insert("key_session_id".to_string(), key_session_id.to_string());
        session
            .data
            .insert("message".to_string(), hex::encode(message));

        let id = session.id;
        self.store.create(session.clone()).await?;
        info!(session = %id, kind = %kind, "session created");
        self.broadcast_sync(&session).await;
        self.spawn_gate(id);
        Ok(id)
    }

    fn gate_role(&self, kind: SessionKind) -> CoordinatorResult<()> {
        if !self.config.role.allows(kind) {
            return Err(CoordinatorError::CapabilityMismatch {
                role: self.config.role,
                kind,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Participant gating
    // ------------------------------------------------------------------

    fn spawn_gate(self: &Arc<Self>, session_id: Uuid) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.gate_session(session_id).await;
        });
    }

    async fn gate_session(self: Arc<Self>, session_id: Uuid) {
        let (participants, initial) = match self.store.get(session_id).await {
            Some(entry) => {
                let mut guard = entry.lock().await;
                if guard
                    .session
                    .transition(SessionStatus::AwaitingParticipants)
                    .is_err()
                {
                    return;
                }
                (guard.session.participants.clone(), guard.session.clone())
            }
            None => return,
        };
        self.broadcast_sync(&initial).await;

        let deadline = tokio::time::Instant::now() + self.config.participant_wait_timeout();
        let required = participants.len();
        loop {
            let present = if self.config.open_enrollment {
                // Hub mode: count attached clients.
                self.registry.client_count().await >= required
            } else {
                // Static membership: every named participant except this node
                // must have an attached endpoint.
                let mut all = true;
                for p in &participants {
                    if *p == self.local_id() {
                        continue;
                    }
                    if !self.registry.is_connected(*p).await {
                        all = false;
                        break;
                    }
                }
                all
            };

            if present {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(session = %session_id, "participant gating timed out");
                self.fail_session(session_id, PARTICIPANT_TIMEOUT.to_string())
                    .await;
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        // Every participant is present: go Ready, announce, start round 1.
        let snapshot = match self.store.get(session_id).await {
            Some(entry) => {
                let mut guard = entry.lock().await;
                if guard.session.transition(SessionStatus::Ready).is_err() {
                    return;
                }
                guard.session.clone()
            }
            None => return,
        };
        self.broadcast_sync(&snapshot).await;
        self.broadcast_init(&snapshot).await;
        if let Err(e) = self.begin_protocol(session_id).await {
            warn!(session = %session_id, error = %e, "failed to start protocol");
            self.fail_session(session_id, e.to_string()).await;
        }
    }

    async fn broadcast_init(&self, session: &Session) {
        let participants: Vec<u16> = session.participants.iter().map(|p| p.0).collect();
        let (msg_type, data) = match session.kind {
            SessionKind::Dkg => (
                MessageType::KeygenInit,
                serde_json::to_value(KeygenInitData {
                    threshold: session.threshold,
                    participants,
                    curve: self.session_curve(session).unwrap_or(CurveKind::Secp256k1),
                })
                .ok(),
            ),
            SessionKind::Refresh => (
                MessageType::ReshareInit,
                serde_json::to_value(ReshareInitData {
                    session_id: session
                        .data
                        .get("key_session_id")
                        .cloned()
                        .unwrap_or_default(),
                    threshold: session.threshold,
                    participants,
                    devote: self.session_devote(session).unwrap_or((0, 0)),
                })
                .ok(),
            ),
            SessionKind::EcdsaSign | SessionKind::Ed25519Sign => (
                MessageType::SignInit,
                serde_json::to_value(SignInitData {
                    session_id: session
                        .data
                        .get("key_session_id")
                        .cloned()
                        .unwrap_or_default(),
                    message: session.data.get("message").cloned().unwrap_or_default(),
                    signers: participants,
                })
                .ok(),
            ),
        };

        let mut envelope = Envelope::new(msg_type, session.id.to_string())
            .from_participant(self.local_id());
        envelope.data = data;
        self.registry.broadcast(envelope.clone(), None).await;
        self.registry.broadcast_clients(envelope).await;
    }

    // ------------------------------------------------------------------
    // Protocol lifecycle
    // ------------------------------------------------------------------

    /// Transition to Running, fire the input-free round actions, and replay
    /// any round traffic that raced ahead of the init.
    async fn begin_protocol(&self, session_id: Uuid) -> CoordinatorResult<()> {
        let entry = self
            .store
            .get(session_id)
            .await
            .ok_or(CoordinatorError::UnknownSession(session_id))?;

        let (snapshot, outputs) = {
            let mut guard = entry.lock().await;
            // Idempotence keys on the machine: a peer sync may have marked
            // the session Running before the init reached this node.
            if guard.session.is_terminal() || guard.machine.is_some() {
                return Ok(());
            }
            let machine = self.build_machine(&guard.session).await?;
            guard.session.transition(SessionStatus::Running)?;

            let mut outputs = Vec::new();
            if let Some(mut machine) = machine {
                let output = machine.start()?;
                guard.machine = Some(machine);
                if !output.outbound.is_empty() && guard.session.current_round < 1 {
                    guard.session.advance_round(1)?;
                }
                outputs.push(output);

                for (round, from, payload) in std::mem::take(&mut guard.pending) {
                    match self.apply_deposit(&mut guard, round, from, payload) {
                        Ok(Some(output)) => outputs.push(output),
                        Ok(None) => {}
                        Err(StepError::Fatal(reason)) => {
                            drop(guard);
                            self.fail_session(session_id, reason).await;
                            return Ok(());
                        }
                        Err(StepError::Reject(_)) => {}
                    }
                }
            }
            (guard.session.clone(), outputs)
        };

        self.broadcast_sync(&snapshot).await;
        for output in outputs {
            self.dispatch_output(&snapshot, output).await;
        }
        Ok(())
    }

    /// Build the protocol machine for the local participant, or `None` when
    /// this node merely mirrors the session.
    async fn build_machine(&self, session: &Session) -> CoordinatorResult<Option<ProtocolMachine>> {
        let me = self.local_id();
        if !session.participants.contains(&me) {
            return Ok(None);
        }

        match session.kind {
            SessionKind::Dkg => {
                let curve = self
                    .session_curve(session)
                    .ok_or_else(|| CoordinatorError::InvalidRequest("missing curve".into()))?;
                let setup = self.provider.new_dkg_setup(
                    me,
                    &session.participants,
                    session.threshold,
                    curve,
                )?;
                Ok(Some(ProtocolMachine::dkg(setup, me, &session.participants)))
            }
            SessionKind::Refresh => {
                let key_id = self.session_key_id(session)?;
                let (seed, public_key) = self
                    .keys
                    .refresh_seed(key_id)
                    .await
                    .ok_or(CoordinatorError::UnknownKey(key_id))?;
                let curve = self
                    .session_curve(session)
                    .ok_or_else(|| CoordinatorError::InvalidRequest("missing curve".into()))?;
                let devote = self
                    .session_devote(session)
                    .ok_or_else(|| CoordinatorError::InvalidRequest("missing devote".into()))?;
                let setup = self.provider.new_refresh_setup(
                    me,
                    &session.participants,
                    session.threshold,
                    (ParticipantId(devote.0), ParticipantId(devote.1)),
                    seed.as_ref(),
                    &public_key,
                    curve,
                )?;
                Ok(Some(ProtocolMachine::refresh(
                    setup,
                    me,
                    &session.participants,
                )))
            }
            SessionKind::EcdsaSign => {
                let key_id = self.session_key_id(session)?;
                let share = self
                    .keys
                    .share(key_id)
                    .await
                    .ok_or(CoordinatorError::UnknownKey(key_id))?;
                let hash = self.session_message_hash(session)?;
                let signers = (session.participants[0], session.participants[1]);
                if me == signers.0 {
                    let (keypair, dln) = match self.keys.cached_paillier(key_id).await {
                        Some(material) => material,
                        None => {
                            let keypair = self.provider.paillier_keypair()?;
                            let dln = self.provider.pedersen_parameters()?;
                            self.keys
                                .store_paillier(key_id, keypair.clone(), dln.clone())
                                .await;
                            (keypair, dln)
                        }
                    };
                    let context =
                        self.provider
                            .new_ecdsa_p1(&share, signers, &keypair, &dln, &hash)?;
                    Ok(Some(ProtocolMachine::ecdsa_p1(context, signers.1)))
                } else {
                    let context = self.provider.new_ecdsa_p2(&share, signers, &hash)?;
                    Ok(Some(ProtocolMachine::ecdsa_p2(context, signers.0)))
                }
            }
            SessionKind::Ed25519Sign => {
                let key_id = self.session_key_id(session)?;
                let share = self
                    .keys
                    .share(key_id)
                    .await
                    .ok_or(CoordinatorError::UnknownKey(key_id))?;
                let hash = self.session_message_hash(session)?;
                let signers = (session.participants[0], session.participants[1]);
                let counterparty = if me == signers.0 { signers.1 } else { signers.0 };
                let context = self.provider.new_ed25519_sign(&share, signers, &hash)?;
                Ok(Some(ProtocolMachine::ed25519(context, counterparty)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Envelope dispatch
    // ------------------------------------------------------------------

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) -> CoordinatorResult<()> {
        // Multi-hop routing: envelopes targeted at another participant are
        // forwarded, with the local hub as the fallback.
        if !envelope.to.is_empty() && envelope.to != self.id_str() {
            if let Ok(target) = envelope.to.parse::<ParticipantId>() {
                debug!(to = %target, tag = %envelope.msg_type, "relaying envelope");
                self.send_with_fallback(target, envelope).await;
                return Ok(());
            }
        }

        match envelope.msg_type {
            MessageType::SessionSync => self.handle_session_sync(envelope).await,
            MessageType::KeygenInit | MessageType::ReshareInit | MessageType::SignInit => {
                self.handle_init(envelope).await
            }
            MessageType::KeygenRound1
            | MessageType::KeygenRound2
            | MessageType::KeygenRound3
            | MessageType::ReshareRound
            | MessageType::SignRound => self.handle_round(envelope).await,
            MessageType::KeygenComplete
            | MessageType::ReshareComplete
            | MessageType::SignComplete => self.handle_complete(envelope).await,
            MessageType::SessionFailed => self.handle_failed(envelope).await,
            MessageType::Error => {
                let message = envelope
                    .payload::<ErrorData>()
                    .map(|d| d.message)
                    .unwrap_or_default();
                warn!(session = %envelope.session_id, from = %envelope.from, %message, "peer reported error");
                Ok(())
            }
            // Heartbeats die in the endpoint; a stray ack after the
            // handshake carries nothing actionable.
            MessageType::Heartbeat | MessageType::Ack => Ok(()),
        }
    }

    async fn handle_session_sync(&self, envelope: Envelope) -> CoordinatorResult<()> {
        let sync: SessionSyncData = envelope
            .payload()
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
        let session_id = envelope
            .session_uuid()
            .ok_or_else(|| CoordinatorError::InvalidRequest("bad session id".into()))?;

        if let Some(entry) = self.store.get(session_id).await {
            let mut guard = entry.lock().await;
            let mut sync = sync;
            // A faster peer's Completed sync must not preempt a machine that
            // still produces its own artifact; failure syncs do apply.
            if sync.status == SessionStatus::Completed
                && guard
                    .machine
                    .as_ref()
                    .is_some_and(|machine| machine.awaiting_own_artifact())
            {
                sync.status = guard.session.status;
            }
            guard.session.apply_sync(&sync);
            return Ok(());
        }

        // A sync for an unknown id: adopt it, renaming a locally-minted
        // placeholder for the same conceptual session if one exists.
        let participants: Vec<ParticipantId> =
            sync.participants.iter().copied().map(ParticipantId).collect();
        if let Some(provisional) = self.store.find_provisional(sync.kind, &participants).await {
            info!(old = %provisional, new = %session_id, "renaming provisional session");
            self.store.rename(provisional, session_id).await?;
            if let Some(entry) = self.store.get(session_id).await {
                let mut guard = entry.lock().await;
                guard.session.apply_sync(&sync);
            }
            return Ok(());
        }

        self.store
            .create(Session::from_sync(session_id, &sync))
            .await?;
        debug!(session = %session_id, "session adopted from sync");
        Ok(())
    }

    async fn handle_init(self: &Arc<Self>, envelope: Envelope) -> CoordinatorResult<()> {
        let session_id = envelope
            .session_uuid()
            .ok_or_else(|| CoordinatorError::InvalidRequest("bad session id".into()))?;

        // An init from a peer coordinator means the initiator already gated;
        // an init from an attached client makes this node the initiator.
        let from_client = envelope.sender().is_none() && !envelope.from.is_empty();

        let mut session = match envelope.msg_type {
            MessageType::KeygenInit => {
                let data: KeygenInitData = envelope
                    .payload()
                    .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
                let mut session = Session::new(
                    session_id,
                    SessionKind::Dkg,
                    data.participants.iter().copied().map(ParticipantId).collect(),
                    data.threshold,
                    SessionOrigin::Remote,
                );
                session
                    .data
                    .insert("curve".to_string(), data.curve.to_string());
                session
            }
            MessageType::ReshareInit => {
                if self.gate_role(SessionKind::Refresh).is_err() {
                    self.reply_error(&envelope, "role does not accept reshare".to_string())
                        .await;
                    return Ok(());
                }
                let data: ReshareInitData = envelope
                    .payload()
                    .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
                let mut session = Session::new(
                    session_id,
                    SessionKind::Refresh,
                    data.participants.iter().copied().map(ParticipantId).collect(),
                    data.threshold,
                    SessionOrigin::Remote,
                );
                session
                    .data
                    .insert("key_session_id".to_string(), data.session_id.clone());
                session.data.insert(
                    "devote".to_string(),
                    format!("{},{}", data.devote.0, data.devote.1),
                );
                if let Ok(key_id) = data.session_id.parse::<Uuid>() {
                    if let Some(share) = self.keys.share(key_id).await {
                        session
                            .data
                            .insert("curve".to_string(), share.curve.to_string());
                    }
                }
                session
            }
            MessageType::SignInit => {
                let data: SignInitData = envelope
                    .payload()
                    .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
                let me_signing = data.signers.contains(&self.local_id().0);
                let key_id: Uuid = match data.session_id.parse() {
                    Ok(id) => id,
                    Err(_) => {
                        self.reply_error(&envelope, "unknown session".to_string()).await;
                        return Ok(());
                    }
                };
                let share = self.keys.share(key_id).await;
                let kind = match &share {
                    Some(s) => match s.curve {
                        CurveKind::Secp256k1 => SessionKind::EcdsaSign,
                        CurveKind::Ed25519 => SessionKind::Ed25519Sign,
                    },
                    None if me_signing => {
                        self.reply_error(&envelope, "unknown session".to_string()).await;
                        return Ok(());
                    }
                    // Not a signer and no key material: nothing to do here,
                    // the session_sync mirror is enough.
                    None => return Ok(()),
                };
                if self.gate_role(kind).is_err() {
                    self.reply_error(&envelope, "role does not accept sign".to_string())
                        .await;
                    return Ok(());
                }
                let mut session = Session::new(
                    session_id,
                    kind,
                    data.signers.iter().copied().map(ParticipantId).collect(),
                    2,
                    SessionOrigin::Remote,
                );
                session
                    .data
                    .insert("key_session_id".to_string(), data.session_id.clone());
                session
                    .data
                    .insert("message".to_string(), data.message.clone());
                session
            }
            _ => return Ok(()),
        };

        if from_client {
            session.origin = SessionOrigin::Local;
            session.initiated_by = Some(envelope.from.clone());
            if self.store.get(session_id).await.is_none() {
                self.store.create(session.clone()).await?;
                self.broadcast_sync(&session).await;
            }
            self.spawn_gate(session_id);
            return Ok(());
        }

        // Upsert: a session_sync usually got here first.
        if self.store.get(session_id).await.is_none() {
            self.store.create(session).await?;
        }
        if let Err(e) = self.begin_protocol(session_id).await {
            warn!(session = %session_id, error = %e, "failed to start protocol from init");
            self.fail_session(session_id, e.to_string()).await;
        }
        Ok(())
    }

    async fn handle_round(&self, envelope: Envelope) -> CoordinatorResult<()> {
        let Some(sender) = envelope.sender() else {
            debug!(from = %envelope.from, "round envelope without participant sender, dropped");
            return Ok(());
        };
        let Some(session_id) = envelope.session_uuid() else {
            self.reply_error(&envelope, "unknown session".to_string()).await;
            return Ok(());
        };
        let Some(entry) = self.store.get(session_id).await else {
            self.reply_error(&envelope, "unknown session".to_string()).await;
            return Ok(());
        };

        let step = self
            .deposit_and_advance(&entry, &envelope, sender)
            .await;
        match step {
            Ok(None) => Ok(()),
            Ok(Some((snapshot, output))) => {
                self.dispatch_output(&snapshot, output).await;
                Ok(())
            }
            Err(StepError::Reject(message)) => {
                self.reply_error(&envelope, message).await;
                Ok(())
            }
            Err(StepError::Fatal(reason)) => {
                self.fail_session(session_id, reason).await;
                Ok(())
            }
        }
    }

    /// Deposit one inbound sub-message and, when the round's fan-in is
    /// complete, advance the machine. Runs entirely under the session mutex;
    /// transport writes happen after it returns.
    async fn deposit_and_advance(
        &self,
        entry: &SharedEntry,
        envelope: &Envelope,
        sender: ParticipantId,
    ) -> Result<Option<(Session, RoundOutput)>, StepError> {
        let mut guard = entry.lock().await;

        if guard.session.is_terminal() {
            // Late or replayed traffic after completion: drop silently.
            return Ok(None);
        }

        // Destination-keyed extraction: take the sub-message addressed to us,
        // tagged with the envelope's sender.
        let round_payload: RoundData = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "malformed round payload, dropped");
                return Ok(None);
            }
        };
        let Some(sub_message) = round_payload.get(&self.id_str()) else {
            return Ok(None);
        };

        if guard.machine.is_none() {
            if !guard.session.participants.contains(&self.local_id()) {
                // Mirrored session on a non-participant: nothing to run.
                return Ok(None);
            }
            // Round traffic can outrun the init across independent
            // connections; hold it until the machine starts.
            if guard.pending.len() < crate::store::MAX_PENDING_DEPOSITS {
                guard
                    .pending
                    .push((envelope.round, sender, sub_message.data.clone()));
                return Ok(None);
            }
            return Err(StepError::Reject(format!(
                "session {} is {}, not running",
                guard.session.id, guard.session.status
            )));
        }

        let output =
            self.apply_deposit(&mut guard, envelope.round, sender, sub_message.data.clone())?;
        Ok(output.map(|output| (guard.session.clone(), output)))
    }

    /// Core deposit step, shared by live traffic and the pre-Running replay.
    /// Caller holds the session mutex and has verified Running + machine.
    fn apply_deposit(
        &self,
        entry: &mut crate::store::SessionEntry,
        round: u16,
        sender: ParticipantId,
        payload: String,
    ) -> Result<Option<RoundOutput>, StepError> {
        let Some(machine) = entry.machine.as_ref() else {
            return Ok(None);
        };
        let expected = machine.expected_sources(round);
        match entry.buffer.deposit(round, sender, payload, &expected) {
            Deposit::Stored => {}
            Deposit::Duplicate | Deposit::Unexpected => return Ok(None),
        }
        if !entry.buffer.is_complete(round, &expected) {
            return Ok(None);
        }

        let inbound = entry.buffer.drain(round);
        let machine = entry
            .machine
            .as_mut()
            .ok_or_else(|| StepError::Fatal("protocol context missing".to_string()))?;
        let output = match machine.advance(round, inbound) {
            Ok(output) => output,
            Err(tss_protocols::EngineError::Provider(e)) => {
                // Primitive failure: surface the text, fail the session.
                return Err(StepError::Fatal(e.to_string()));
            }
            Err(e) => {
                debug!(error = %e, "engine rejected round, dropped");
                return Ok(None);
            }
        };

        let reached = if output.artifact.is_some() {
            entry.session.kind.rounds()
        } else {
            output
                .outbound
                .iter()
                .map(|o| o.round)
                .max()
                .unwrap_or(round)
        };
        // A peer sync may have raised current_round past this node already;
        // the observed sequence only ever moves forward.
        if reached > entry.session.current_round {
            entry
                .session
                .advance_round(reached)
                .map_err(|e| StepError::Fatal(e.to_string()))?;
        }

        Ok(Some(output))
    }

    async fn dispatch_output(&self, session: &Session, output: RoundOutput) {
        let tag_kind = session.kind;
        for outbound in output.outbound {
            let data = {
                let mut per_peer = std::collections::BTreeMap::new();
                per_peer.insert(outbound.to, outbound.payload);
                round_data(self.local_id(), &per_peer)
            };
            let envelope = Envelope::new(
                MessageType::round_tag(tag_kind, outbound.round),
                session.id.to_string(),
            )
            .from_participant(self.local_id())
            .to_participant(outbound.to)
            .round(outbound.round)
            .data(&data);
            self.send_with_fallback(outbound.to, envelope).await;
        }

        if let Some(artifact) = output.artifact {
            self.complete_session(session.id, artifact).await;
        }
    }

    async fn send_with_fallback(&self, to: ParticipantId, envelope: Envelope) {
        match self.registry.send_to(to, envelope.clone()).await {
            Ok(()) => {}
            Err(NetworkError::NotConnected { .. }) => {
                // Hub fallback: let clients (or a federated coordinator
                // behind them) carry the envelope onward.
                debug!(to = %to, "peer absent, falling back to hub broadcast");
                self.registry.broadcast_clients(envelope).await;
            }
            Err(e) => {
                warn!(to = %to, error = %e, "send failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion and failure
    // ------------------------------------------------------------------

    async fn complete_session(&self, session_id: Uuid, artifact: Artifact) {
        let Some(entry) = self.store.get(session_id).await else {
            return;
        };

        let (snapshot, peer_payload, client_payload, tag) = {
            let mut guard = entry.lock().await;
            if guard.session.is_terminal() {
                return;
            }
            let kind = guard.session.kind;
            if guard.session.transition(SessionStatus::Completed).is_err() {
                return;
            }
            let _ = guard.session.advance_round(kind.rounds());
            guard.buffer.discard();
            guard.machine = None;

            let (peer_payload, client_payload) = match &artifact {
                Artifact::Key(share) => {
                    self.keys.insert(session_id, share.clone()).await;
                    guard
                        .session
                        .data
                        .insert("public_key".to_string(), share.public_key.clone());
                    let to_peers = KeygenCompleteData {
                        public_key: share.public_key.clone(),
                        participant_id: self.local_id().0,
                        private_share: String::new(),
                    };
                    let to_client = KeygenCompleteData {
                        private_share: share.secret_share.clone(),
                        ..to_peers.clone()
                    };
                    (
                        serde_json::to_value(to_peers).ok(),
                        serde_json::to_value(to_client).ok(),
                    )
                }
                Artifact::Refresh(outcome) => {
                    if let Ok(key_id) = self.key_id_of(&guard.session) {
                        self.keys.apply_refresh(key_id, outcome).await;
                    }
                    guard.session.data.insert(
                        "public_key".to_string(),
                        outcome.key_share.public_key.clone(),
                    );
                    let completed_at = chrono::Utc::now();
                    let to_peers = ReshareCompleteData {
                        new_private_share: String::new(),
                        old_private_share: String::new(),
                        reshare_completed_at: completed_at,
                    };
                    let to_client = ReshareCompleteData {
                        new_private_share: outcome.key_share.secret_share.clone(),
                        old_private_share: outcome.old_share.clone(),
                        reshare_completed_at: completed_at,
                    };
                    (
                        serde_json::to_value(to_peers).ok(),
                        serde_json::to_value(to_client).ok(),
                    )
                }
                Artifact::EcdsaSignature(signature) => {
                    let payload = SignCompleteData {
                        signature: format!("{}{}", signature.r, signature.s),
                        signature_r: signature.r.clone(),
                        signature_s: signature.s.clone(),
                    };
                    guard
                        .session
                        .data
                        .insert("signature_r".to_string(), signature.r.clone());
                    guard
                        .session
                        .data
                        .insert("signature_s".to_string(), signature.s.clone());
                    guard
                        .session
                        .data
                        .insert("signature".to_string(), payload.signature.clone());
                    let value = serde_json::to_value(payload).ok();
                    (value.clone(), value)
                }
                Artifact::Ed25519Signature(signature) => {
                    let payload = SignCompleteData {
                        signature: signature.combined(),
                        signature_r: signature.r.clone(),
                        signature_s: signature.s.clone(),
                    };
                    guard
                        .session
                        .data
                        .insert("signature_r".to_string(), signature.r.clone());
                    guard
                        .session
                        .data
                        .insert("signature_s".to_string(), signature.s.clone());
                    guard
                        .session
                        .data
                        .insert("signature".to_string(), payload.signature.clone());
                    let value = serde_json::to_value(payload).ok();
                    (value.clone(), value)
                }
            };

            (
                guard.session.clone(),
                peer_payload,
                client_payload,
                MessageType::complete_tag(kind),
            )
        };

        info!(session = %session_id, kind = %snapshot.kind, "session completed");
        self.broadcast_sync(&snapshot).await;

        let mut peer_envelope = Envelope::new(tag, session_id.to_string())
            .from_participant(self.local_id())
            .round(snapshot.kind.rounds());
        peer_envelope.data = peer_payload;
        self.registry.broadcast(peer_envelope, None).await;

        let mut client_envelope = Envelope::new(tag, session_id.to_string())
            .from_participant(self.local_id())
            .round(snapshot.kind.rounds());
        client_envelope.data = client_payload;
        self.notify_client(&snapshot, client_envelope).await;
    }

    async fn handle_complete(&self, envelope: Envelope) -> CoordinatorResult<()> {
        let Some(session_id) = envelope.session_uuid() else {
            return Ok(());
        };
        let Some(entry) = self.store.get(session_id).await else {
            debug!(session = %envelope.session_id, "completion for unknown session, dropped");
            return Ok(());
        };

        let snapshot = {
            let mut guard = entry.lock().await;
            if guard.session.is_terminal() {
                return Ok(());
            }
            // Merge the public summary into the session dictionary.
            match envelope.msg_type {
                MessageType::SignComplete => {
                    if let Ok(data) = envelope.payload::<SignCompleteData>() {
                        guard
                            .session
                            .data
                            .insert("signature".to_string(), data.signature);
                        guard
                            .session
                            .data
                            .insert("signature_r".to_string(), data.signature_r);
                        guard
                            .session
                            .data
                            .insert("signature_s".to_string(), data.signature_s);
                    }
                }
                MessageType::KeygenComplete => {
                    if let Ok(data) = envelope.payload::<KeygenCompleteData>() {
                        guard
                            .session
                            .data
                            .insert("public_key".to_string(), data.public_key);
                    }
                }
                _ => {}
            }
            // A machine that still produces its own artifact (every DKG and
            // refresh participant, P1, both Ed25519 signers) must not be
            // preempted by a faster peer's completion broadcast.
            if let Some(machine) = guard.machine.as_ref() {
                if machine.awaiting_own_artifact() {
                    return Ok(());
                }
            }
            if guard.session.transition(SessionStatus::Completed).is_err() {
                return Ok(());
            }
            let rounds = guard.session.kind.rounds();
            let _ = guard.session.advance_round(rounds);
            guard.buffer.discard();
            guard.machine = None;
            guard.session.clone()
        };

        let mut client_envelope = envelope.clone();
        client_envelope.from = self.id_str();
        self.notify_client(&snapshot, client_envelope).await;
        Ok(())
    }

    /// Deliver a terminal notification to attached clients; with
    /// `auto_disconnect`, the originating client's transport is closed after
    /// the terminal message.
    async fn notify_client(&self, session: &Session, envelope: Envelope) {
        self.registry.broadcast_clients(envelope).await;
        if !self.config.auto_disconnect {
            return;
        }
        if let Some(client_id) = session.initiated_by.as_deref() {
            if let Some(endpoint) = self.registry.client_endpoint(client_id).await {
                endpoint.close().await;
            }
            self.registry.detach_client(client_id).await;
        }
    }

    pub async fn fail_session(&self, session_id: Uuid, reason: String) {
        let Some(entry) = self.store.get(session_id).await else {
            return;
        };
        let snapshot = {
            let mut guard = entry.lock().await;
            if guard.session.is_terminal() {
                return;
            }
            guard
                .session
                .data
                .insert("reason".to_string(), reason.clone());
            if guard.session.transition(SessionStatus::Failed).is_err() {
                return;
            }
            guard.buffer.discard();
            guard.machine = None;
            guard.session.clone()
        };

        warn!(session = %session_id, %reason, "session failed");
        self.broadcast_sync(&snapshot).await;

        let envelope = Envelope::new(MessageType::SessionFailed, session_id.to_string())
            .from_participant(self.local_id())
            .data(&SessionFailedData { reason });
        self.registry.broadcast(envelope.clone(), None).await;
        self.notify_client(&snapshot, envelope).await;
    }

    async fn handle_failed(&self, envelope: Envelope) -> CoordinatorResult<()> {
        let Some(session_id) = envelope.session_uuid() else {
            return Ok(());
        };
        let Some(entry) = self.store.get(session_id).await else {
            return Ok(());
        };
        let reason = envelope
            .payload::<SessionFailedData>()
            .map(|d| d.reason)
            .unwrap_or_else(|_| "peer reported failure".to_string());

        let snapshot = {
            let mut guard = entry.lock().await;
            if guard.session.is_terminal() {
                return Ok(());
            }
            guard
                .session
                .data
                .insert("reason".to_string(), reason.clone());
            if guard.session.transition(SessionStatus::Failed).is_err() {
                return Ok(());
            }
            guard.buffer.discard();
            guard.machine = None;
            guard.session.clone()
        };
        debug!(session = %session_id, %reason, "session failed by peer");
        self.notify_client(&snapshot, envelope).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn broadcast_sync(&self, session: &Session) {
        let envelope = Envelope::new(MessageType::SessionSync, session.id.to_string())
            .from_participant(self.local_id())
            .round(session.current_round)
            .data(&session.to_sync());
        self.registry.broadcast(envelope, None).await;
    }

    async fn reply_error(&self, inbound: &Envelope, message: String) {
        let envelope = Envelope::new(MessageType::Error, inbound.session_id.clone())
            .from_participant(self.local_id())
            .data(&ErrorData {
                message: message.clone(),
            });
        match inbound.sender() {
            Some(peer) => {
                if let Err(e) = self.registry.send_to(peer, envelope).await {
                    debug!(to = %peer, error = %e, "error reply undeliverable");
                }
            }
            None => {
                if let Err(e) = self
                    .registry
                    .send_to_client(&inbound.from, envelope)
                    .await
                {
                    debug!(to = %inbound.from, error = %e, "error reply undeliverable");
                }
            }
        }
    }

    fn session_curve(&self, session: &Session) -> Option<CurveKind> {
        session.data.get("curve").and_then(|c| c.parse().ok())
    }

    fn session_devote(&self, session: &Session) -> Option<(u16, u16)> {
        let raw = session.data.get("devote")?;
        let (a, b) = raw.split_once(',')?;
        Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
    }

    fn session_key_id(&self, session: &Session) -> CoordinatorResult<Uuid> {
        self.key_id_of(session)
    }

    fn key_id_of(&self, session: &Session) -> CoordinatorResult<Uuid> {
        session
            .data
            .get("key_session_id")
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| {
                CoordinatorError::InvalidRequest("session has no key reference".to_string())
            })
    }

    fn session_message_hash(&self, session: &Session) -> CoordinatorResult<Vec<u8>> {
        let raw = session
            .data
            .get("message")
            .ok_or_else(|| CoordinatorError::InvalidRequest("session has no message".into()))?;
        let bytes = hex::decode(raw)
            .map_err(|e| CoordinatorError::InvalidRequest(format!("bad message hex: {e}")))?;
        Ok(Sha256::digest(&bytes).to_vec())
    }
}

/// Internal disposition of a round step.
enum StepError {
    /// Answer the sender with an `error` envelope.
    Reject(String),
    /// Mark the session failed, preserving the reason.
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tss_provider::CurvProvider;
    use tss_types::Role;

    fn coordinator(role: Role) -> Arc<SessionCoordinator> {
        let config = CoordinatorConfig {
            participant_id: 1,
            name: "node-1".to_string(),
            role,
            ..CoordinatorConfig::default()
        };
        SessionCoordinator::new(
            config,
            Arc::new(CurvProvider::new()),
            Arc::new(PeerRegistry::new(ParticipantId(1))),
        )
    }

    async fn wait_for_session(
        coordinator: &Arc<SessionCoordinator>,
        id: Uuid,
    ) -> Session {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(session) = coordinator.session(id).await {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never appeared")
    }

    #[tokio::test]
    async fn sync_adoption_is_idempotent() {
        let c = coordinator(Role::Enterprise);
        let mut remote = Session::new(
            Uuid::new_v4(),
            SessionKind::Dkg,
            vec![ParticipantId(1), ParticipantId(2), ParticipantId(3)],
            2,
            SessionOrigin::Remote,
        );
        remote.transition(SessionStatus::Running).unwrap();
        remote.advance_round(2).unwrap();
        let envelope = Envelope::new(MessageType::SessionSync, remote.id.to_string())
            .from_participant(ParticipantId(2))
            .data(&remote.to_sync());

        let handler = c.envelope_handler();
        handler(envelope.clone());
        let first = wait_for_session(&c, remote.id).await;
        assert_eq!(first.status, SessionStatus::Running);
        assert_eq!(first.current_round, 2);

        handler(envelope);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = c.session(remote.id).await.unwrap();
        assert_eq!(second.status, first.status);
        assert_eq!(second.current_round, first.current_round);
        assert_eq!(second.updated_at, first.updated_at);
    }

    #[tokio::test]
    async fn third_party_refuses_reshare() {
        let c = coordinator(Role::ThirdParty);
        let result = c
            .start_reshare(Uuid::new_v4(), 2, vec![1, 2, 3], (1, 2), None)
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::CapabilityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn keygen_validates_threshold() {
        let c = coordinator(Role::ThirdParty);
        assert!(matches!(
            c.start_keygen(4, vec![1, 2, 3], CurveKind::Ed25519, None).await,
            Err(CoordinatorError::InvalidRequest(_))
        ));
        assert!(matches!(
            c.start_keygen(0, vec![1, 2, 3], CurveKind::Ed25519, None).await,
            Err(CoordinatorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn sign_requires_known_key() {
        let c = coordinator(Role::Enterprise);
        let result = c
            .start_sign(Uuid::new_v4(), b"message", vec![1, 2], None)
            .await;
        assert!(matches!(result, Err(CoordinatorError::UnknownKey(_))));
    }

    #[tokio::test]
    async fn gating_times_out_without_participants() {
        let config = CoordinatorConfig {
            participant_id: 1,
            name: "node-1".to_string(),
            participant_wait_timeout_secs: 1,
            ..CoordinatorConfig::default()
        };
        let c = SessionCoordinator::new(
            config,
            Arc::new(CurvProvider::new()),
            Arc::new(PeerRegistry::new(ParticipantId(1))),
        );
        let id = c
            .start_keygen(2, vec![1, 2, 3], CurveKind::Ed25519, None)
            .await
            .unwrap();

        let session = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let session = c.session(id).await.unwrap();
                if session.is_terminal() {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("gating never timed out");

        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(
            session.data.get("reason").map(String::as_str),
            Some(PARTICIPANT_TIMEOUT)
        );
    }
}
