//! Session data model and lifecycle.
//!
//! Valid transitions:
//! - Pending -> AwaitingParticipants | Ready | Running | Failed
//! - AwaitingParticipants -> Ready | Running | Failed
//! - Ready -> Running | Failed
//! - Running -> Completed | Failed
//!
//! Completed and Failed are terminal; `current_round` is monotone
//! non-decreasing for the session's lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::envelope::SessionSyncData;
use crate::ParticipantId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid transition for session {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session {id} is terminal ({status})")]
    Terminal { id: Uuid, status: SessionStatus },
    #[error("round regression for session {id}: {current} -> {requested}")]
    RoundRegression {
        id: Uuid,
        current: u16,
        requested: u16,
    },
}

/// Protocol executed by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Dkg,
    Refresh,
    EcdsaSign,
    Ed25519Sign,
}

impl SessionKind {
    /// Number of protocol rounds for this kind.
    pub fn rounds(&self) -> u16 {
        3
    }

    pub fn is_sign(&self) -> bool {
        matches!(self, SessionKind::EcdsaSign | SessionKind::Ed25519Sign)
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Dkg => write!(f, "dkg"),
            SessionKind::Refresh => write!(f, "refresh"),
            SessionKind::EcdsaSign => write!(f, "ecdsa_sign"),
            SessionKind::Ed25519Sign => write!(f, "ed25519_sign"),
        }
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    AwaitingParticipants,
    Ready,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::AwaitingParticipants => write!(f, "awaiting_participants"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Whether this node minted the session id or adopted it from a peer.
/// Locally-minted sessions may be renamed when a sync arrives carrying the
/// canonical id for the same conceptual session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Local,
    Remote,
}

/// One run of one protocol across one fixed participant set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub participants: Vec<ParticipantId>,
    pub threshold: u16,
    pub current_round: u16,
    /// Kind-specific string dictionary: message hash, devote pair, key
    /// session reference, failure reason.
    pub data: BTreeMap<String, String>,
    pub origin: SessionOrigin,
    /// Symbolic id of the client that originated the request, when the
    /// session was started over a client transport.
    pub initiated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: Uuid,
        kind: SessionKind,
        participants: Vec<ParticipantId>,
        threshold: u16,
        origin: SessionOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: SessionStatus::Pending,
            participants,
            threshold,
            current_round: 0,
            data: BTreeMap::new(),
            origin,
            initiated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status transition, enforcing the terminal and ordering
    /// invariants.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), SessionError> {
        if self.status == to {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(SessionError::Terminal {
                id: self.id,
                status: self.status,
            });
        }
        let allowed = match to {
            SessionStatus::Pending => false,
            SessionStatus::AwaitingParticipants => self.status == SessionStatus::Pending,
            SessionStatus::Ready => matches!(
                self.status,
                SessionStatus::Pending | SessionStatus::AwaitingParticipants
            ),
            SessionStatus::Running => matches!(
                self.status,
                SessionStatus::Pending | SessionStatus::AwaitingParticipants | SessionStatus::Ready
            ),
            // Mirrored sessions learn about completion via sync or a
            // `*_complete` broadcast without ever entering Running locally.
            SessionStatus::Completed => true,
            SessionStatus::Failed => true,
        };
        if !allowed {
            return Err(SessionError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Advance `current_round`; regression is an invariant violation.
    pub fn advance_round(&mut self, round: u16) -> Result<(), SessionError> {
        if round < self.current_round {
            return Err(SessionError::RoundRegression {
                id: self.id,
                current: self.current_round,
                requested: round,
            });
        }
        self.current_round = round;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Position of a participant in the ordered participant list.
    pub fn position(&self, id: ParticipantId) -> Option<usize> {
        self.participants.iter().position(|p| *p == id)
    }

    /// Snapshot for mirroring to peers.
    pub fn to_sync(&self) -> SessionSyncData {
        SessionSyncData {
            session_id: self.id.to_string(),
            kind: self.kind,
            status: self.status,
            participants: self.participants.iter().map(|p| p.0).collect(),
            threshold: self.threshold,
            current_round: self.current_round,
            data: self.data.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Upsert-then-overlay application of a peer sync. Fields present in the
    /// sync replace local values; dictionary entries are merged key-wise.
    /// Terminal sessions and round regressions are left untouched, which
    /// makes re-application of the same sync a no-op.
    pub fn apply_sync(&mut self, sync: &SessionSyncData) {
        if self.is_terminal() {
            return;
        }
        if !sync.participants.is_empty() {
            self.participants = sync.participants.iter().map(|p| ParticipantId(*p)).collect();
        }
        if sync.threshold > 0 {
            self.threshold = sync.threshold;
        }
        if sync.current_round > self.current_round {
            self.current_round = sync.current_round;
        }
        for (key, value) in &sync.data {
            self.data.insert(key.clone(), value.clone());
        }
        // Status moves forward only; a stale sync cannot rewind the session.
        if self.transition(sync.status).is_ok() {
            self.updated_at = sync.updated_at;
        }
    }

    /// Construct a session from a sync received for an unknown id.
    pub fn from_sync(id: Uuid, sync: &SessionSyncData) -> Self {
        let mut session = Session::new(
            id,
            sync.kind,
            sync.participants.iter().map(|p| ParticipantId(*p)).collect(),
            sync.threshold,
            SessionOrigin::Remote,
        );
        session.status = sync.status;
        session.current_round = sync.current_round;
        session.data = sync.data.clone();
        session.created_at = sync.created_at;
        session.updated_at = sync.updated_at;
        session
    }
}
