//! Protocol engine: per-kind state machines over the crypto provider.
//!
//! Each machine is driven the same way: `start` fires any round action that
//! needs no input, then `advance(round, inbound)` is invoked exactly once per
//! completed fan-in round. Outbound sub-messages carry the round index their
//! *recipient* deposits them into, matching the wire convention.

use tracing::debug;

use tss_provider::{
    DkgSetup, EcdsaP1Context, EcdsaP2Context, EcdsaSignatureData, Ed25519SignContext,
    Ed25519SignatureData, KeyShare, ProviderError, RefreshOutcome, RefreshSetup,
};
use tss_types::ParticipantId;

use crate::error::{EngineError, EngineResult};

/// Terminal result of a protocol run.
#[derive(Debug, Clone)]
pub enum Artifact {
    Key(KeyShare),
    Refresh(RefreshOutcome),
    EcdsaSignature(EcdsaSignatureData),
    Ed25519Signature(Ed25519SignatureData),
}

/// One outbound sub-message. `round` is the deposit round at the recipient.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: ParticipantId,
    pub round: u16,
    pub payload: String,
}

/// Result of one engine step.
#[derive(Debug, Default)]
pub struct RoundOutput {
    pub outbound: Vec<Outbound>,
    pub artifact: Option<Artifact>,
}

impl RoundOutput {
    fn sends(outbound: Vec<Outbound>) -> Self {
        Self {
            outbound,
            artifact: None,
        }
    }

    fn done(artifact: Artifact) -> Self {
        Self {
            outbound: Vec::new(),
            artifact: Some(artifact),
        }
    }
}

fn spread(per_peer: tss_provider::OutboundMap, round: u16) -> Vec<Outbound> {
    per_peer
        .into_iter()
        .map(|(to, payload)| Outbound { to, round, payload })
        .collect()
}

/// N-party three-round machine shared by DKG and Refresh.
struct FanInState {
    peers: Vec<ParticipantId>,
    next_round: u16,
    finished: bool,
}

impl FanInState {
    fn new(party: ParticipantId, participants: &[ParticipantId]) -> Self {
        Self {
            peers: participants
                .iter()
                .copied()
                .filter(|p| *p != party)
                .collect(),
            next_round: 1,
            finished: false,
        }
    }

    fn check(&mut self, kind: &'static str, round: u16) -> EngineResult<()> {
        if self.finished {
            return Err(EngineError::Finished { kind });
        }
        if round != self.next_round {
            return Err(EngineError::UnexpectedRound { kind, round });
        }
        self.next_round += 1;
        Ok(())
    }
}

/// Distributed key generation machine.
pub struct DkgMachine {
    setup: Box<dyn DkgSetup>,
    state: FanInState,
}

impl DkgMachine {
    pub fn new(
        setup: Box<dyn DkgSetup>,
        party: ParticipantId,
        participants: &[ParticipantId],
    ) -> Self {
        Self {
            setup,
            state: FanInState::new(party, participants),
        }
    }
}

/// Share refresh machine; structurally identical to DKG.
pub struct RefreshMachine {
    setup: Box<dyn RefreshSetup>,
    state: FanInState,
}

impl RefreshMachine {
    pub fn new(
        setup: Box<dyn RefreshSetup>,
        party: ParticipantId,
        participants: &[ParticipantId],
    ) -> Self {
        Self {
            setup,
            state: FanInState::new(party, participants),
        }
    }
}

/// Two-party ECDSA, P1 role (index 0 of the signer pair).
pub struct EcdsaP1Machine {
    context: Box<dyn EcdsaP1Context>,
    counterparty: ParticipantId,
    started: bool,
    finished: bool,
}

/// Two-party ECDSA, P2 role.
pub struct EcdsaP2Machine {
    context: Box<dyn EcdsaP2Context>,
    counterparty: ParticipantId,
    finished: bool,
}

/// Two-party Ed25519, symmetric roles.
pub struct Ed25519Machine {
    context: Box<dyn Ed25519SignContext>,
    counterparty: ParticipantId,
    started: bool,
    finished: bool,
}

/// The per-session protocol context owned by the coordinator.
pub enum ProtocolMachine {
    Dkg(DkgMachine),
    Refresh(RefreshMachine),
    EcdsaP1(EcdsaP1Machine),
    EcdsaP2(EcdsaP2Machine),
    Ed25519(Ed25519Machine),
}

impl ProtocolMachine {
    pub fn dkg(
        setup: Box<dyn DkgSetup>,
        party: ParticipantId,
        participants: &[ParticipantId],
    ) -> Self {
        ProtocolMachine::Dkg(DkgMachine::new(setup, party, participants))
    }

    pub fn refresh(
        setup: Box<dyn RefreshSetup>,
        party: ParticipantId,
        participants: &[ParticipantId],
    ) -> Self {
        ProtocolMachine::Refresh(RefreshMachine::new(setup, party, participants))
    }

    pub fn ecdsa_p1(context: Box<dyn EcdsaP1Context>, counterparty: ParticipantId) -> Self {
        ProtocolMachine::EcdsaP1(EcdsaP1Machine {
            context,
            counterparty,
            started: false,
            finished: false,
        })
    }

    pub fn ecdsa_p2(context: Box<dyn EcdsaP2Context>, counterparty: ParticipantId) -> Self {
        ProtocolMachine::EcdsaP2(EcdsaP2Machine {
            context,
            counterparty,
            finished: false,
        })
    }

    pub fn ed25519(context: Box<dyn Ed25519SignContext>, counterparty: ParticipantId) -> Self {
        ProtocolMachine::Ed25519(Ed25519Machine {
            context,
            counterparty,
            started: false,
            finished: false,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMachine::Dkg(_) => "dkg",
            ProtocolMachine::Refresh(_) => "refresh",
            ProtocolMachine::EcdsaP1(_) => "ecdsa-p1",
            ProtocolMachine::EcdsaP2(_) => "ecdsa-p2",
            ProtocolMachine::Ed25519(_) => "ed25519",
        }
    }

    /// True while this machine will still produce its own terminal artifact.
    /// A peer's completion broadcast must not preempt such a machine; only
    /// roles whose last word is an outbound message (ECDSA P2) and finished
    /// machines complete via broadcast.
    pub fn awaiting_own_artifact(&self) -> bool {
        match self {
            ProtocolMachine::Dkg(m) => !m.state.finished,
            ProtocolMachine::Refresh(m) => !m.state.finished,
            ProtocolMachine::EcdsaP1(m) => !m.finished,
            ProtocolMachine::EcdsaP2(_) => false,
            ProtocolMachine::Ed25519(m) => !m.finished,
        }
    }

    /// Sources whose sub-messages must arrive before `advance(round, ..)`.
    /// Empty means this machine never consumes that round.
    pub fn expected_sources(&self, round: u16) -> Vec<ParticipantId> {
        match self {
            ProtocolMachine::Dkg(m) => match round {
                1 | 2 => m.state.peers.clone(),
                _ => Vec::new(),
            },
            ProtocolMachine::Refresh(m) => match round {
                1 | 2 => m.state.peers.clone(),
                _ => Vec::new(),
            },
            // P1 consumes P2's replies at deposit rounds 2 and 3.
            ProtocolMachine::EcdsaP1(m) => match round {
                2 | 3 => vec![m.counterparty],
                _ => Vec::new(),
            },
            // P2 consumes P1's messages at deposit rounds 1 and 2.
            ProtocolMachine::EcdsaP2(m) => match round {
                1 | 2 => vec![m.counterparty],
                _ => Vec::new(),
            },
            ProtocolMachine::Ed25519(m) => match round {
                1..=3 => vec![m.counterparty],
                _ => Vec::new(),
            },
        }
    }

    /// Fire the round actions that take no input (round 1 of DKG/Refresh,
    /// P1's commitment, both Ed25519 commitments). P2 has nothing to start.
    pub fn start(&mut self) -> EngineResult<RoundOutput> {
        match self {
            ProtocolMachine::Dkg(m) => {
                debug!(machine = "dkg", "starting round 1");
                Ok(RoundOutput::sends(spread(m.setup.round1()?, 1)))
            }
            ProtocolMachine::Refresh(m) => {
                debug!(machine = "refresh", "starting round 1");
                Ok(RoundOutput::sends(spread(m.setup.round1()?, 1)))
            }
            ProtocolMachine::EcdsaP1(m) => {
                if m.started {
                    return Err(EngineError::UnexpectedRound {
                        kind: "ecdsa-p1",
                        round: 1,
                    });
                }
                m.started = true;
                let payload = m.context.round1()?;
                Ok(RoundOutput::sends(vec![Outbound {
                    to: m.counterparty,
                    round: 1,
                    payload,
                }]))
            }
            ProtocolMachine::EcdsaP2(_) => Ok(RoundOutput::default()),
            ProtocolMachine::Ed25519(m) => {
                if m.started {
                    return Err(EngineError::UnexpectedRound {
                        kind: "ed25519",
                        round: 1,
                    });
                }
                m.started = true;
                let payload = m.context.round1()?;
                Ok(RoundOutput::sends(vec![Outbound {
                    to: m.counterparty,
                    round: 1,
                    payload,
                }]))
            }
        }
    }

    /// Consume a completed fan-in round and run the next action.
    pub fn advance(
        &mut self,
        round: u16,
        inbound: Vec<(ParticipantId, String)>,
    ) -> EngineResult<RoundOutput> {
        match self {
            ProtocolMachine::Dkg(m) => {
                m.state.check("dkg", round)?;
                match round {
                    1 => Ok(RoundOutput::sends(spread(m.setup.round2(&inbound)?, 2))),
                    2 => {
                        m.state.finished = true;
                        Ok(RoundOutput::done(Artifact::Key(m.setup.round3(&inbound)?)))
                    }
                    _ => Err(EngineError::UnexpectedRound {
                        kind: "dkg",
                        round,
                    }),
                }
            }
            ProtocolMachine::Refresh(m) => {
                m.state.check("refresh", round)?;
                match round {
                    1 => Ok(RoundOutput::sends(spread(m.setup.round2(&inbound)?, 2))),
                    2 => {
                        m.state.finished = true;
                        Ok(RoundOutput::done(Artifact::Refresh(
                            m.setup.round3(&inbound)?,
                        )))
                    }
                    _ => Err(EngineError::UnexpectedRound {
                        kind: "refresh",
                        round,
                    }),
                }
            }
            ProtocolMachine::EcdsaP1(m) => {
                if m.finished {
                    return Err(EngineError::Finished { kind: "ecdsa-p1" });
                }
                let payload = single(inbound, "ecdsa-p1")?;
                match round {
                    2 => {
                        let reply = m.context.round2(&payload)?;
                        Ok(RoundOutput::sends(vec![Outbound {
                            to: m.counterparty,
                            round: 2,
                            payload: reply,
                        }]))
                    }
                    3 => {
                        m.finished = true;
                        Ok(RoundOutput::done(Artifact::EcdsaSignature(
                            m.context.round3(&payload)?,
                        )))
                    }
                    _ => Err(EngineError::UnexpectedRound {
                        kind: "ecdsa-p1",
                        round,
                    }),
                }
            }
            ProtocolMachine::EcdsaP2(m) => {
                if m.finished {
                    return Err(EngineError::Finished { kind: "ecdsa-p2" });
                }
                let payload = single(inbound, "ecdsa-p2")?;
                match round {
                    1 => {
                        let reply = m.context.round1(&payload)?;
                        Ok(RoundOutput::sends(vec![Outbound {
                            to: m.counterparty,
                            round: 2,
                            payload: reply,
                        }]))
                    }
                    2 => {
                        // The ciphertext is P2's last word; completion arrives
                        // as a broadcast from P1.
                        m.finished = true;
                        let reply = m.context.round2(&payload)?;
                        Ok(RoundOutput::sends(vec![Outbound {
                            to: m.counterparty,
                            round: 3,
                            payload: reply,
                        }]))
                    }
                    _ => Err(EngineError::UnexpectedRound {
                        kind: "ecdsa-p2",
                        round,
                    }),
                }
            }
            ProtocolMachine::Ed25519(m) => {
                if m.finished {
                    return Err(EngineError::Finished { kind: "ed25519" });
                }
                let payload = single(inbound, "ed25519")?;
                match round {
                    1 => {
                        let reply = m.context.round2(&payload)?;
                        Ok(RoundOutput::sends(vec![Outbound {
                            to: m.counterparty,
                            round: 2,
                            payload: reply,
                        }]))
                    }
                    2 => {
                        let reply = m.context.round3(&payload)?;
                        Ok(RoundOutput::sends(vec![Outbound {
                            to: m.counterparty,
                            round: 3,
                            payload: reply,
                        }]))
                    }
                    3 => {
                        m.finished = true;
                        Ok(RoundOutput::done(Artifact::Ed25519Signature(
                            m.context.finalize(&payload)?,
                        )))
                    }
                    _ => Err(EngineError::UnexpectedRound {
                        kind: "ed25519",
                        round,
                    }),
                }
            }
        }
    }
}

fn single(
    mut inbound: Vec<(ParticipantId, String)>,
    kind: &'static str,
) -> EngineResult<String> {
    match inbound.len() {
        1 => Ok(inbound.remove(0).1),
        n => Err(EngineError::Provider(ProviderError::Malformed(format!(
            "{kind} expected exactly one sub-message, got {n}"
        )))),
    }
}
