//! Shared types for the threshold signing coordinator.
//!
//! Defines participant identities, the session data model, and the wire
//! envelope with its line-delimited JSON codec. Everything that crosses a
//! crate boundary lives here.

use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod session;

pub use envelope::{
    decode_envelope, encode_envelope, AckData, Envelope, ErrorData, KeygenCompleteData,
    KeygenInitData, MessageType, PeerEntry, ReshareCompleteData, ReshareInitData, RoundData,
    SessionFailedData, SessionSyncData, SignCompleteData, SignInitData,
};
pub use session::{Session, SessionKind, SessionOrigin, SessionStatus};

/// Logical identity of a protocol participant (1-based, fixed at startup).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(pub u16);

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ParticipantId {
    fn from(id: u16) -> Self {
        ParticipantId(id)
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u16>().map(ParticipantId)
    }
}

/// A participant as known at process start: logical id plus symbolic name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Elliptic curve a key lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    /// secp256k1, signed with two-party ECDSA.
    Secp256k1,
    /// Ed25519, signed with two-party Schnorr.
    Ed25519,
}

impl std::fmt::Display for CurveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurveKind::Secp256k1 => write!(f, "secp256k1"),
            CurveKind::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl std::str::FromStr for CurveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secp256k1" => Ok(CurveKind::Secp256k1),
            "ed25519" => Ok(CurveKind::Ed25519),
            other => Err(format!("unknown curve: {other}")),
        }
    }
}

/// Deployment role of this coordinator. Gates which session kinds the node
/// will accept; the gate is a predicate over data, not a type distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ThirdParty,
    Enterprise,
    MobileApp,
}

impl Role {
    /// Keygen is accepted everywhere; reshare and sign only on non-third-party
    /// nodes.
    pub fn allows(&self, kind: SessionKind) -> bool {
        match kind {
            SessionKind::Dkg => true,
            SessionKind::Refresh | SessionKind::EcdsaSign | SessionKind::Ed25519Sign => {
                !matches!(self, Role::ThirdParty)
            }
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::ThirdParty => write!(f, "third-party"),
            Role::Enterprise => write!(f, "enterprise"),
            Role::MobileApp => write!(f, "mobile-app"),
        }
    }
}
