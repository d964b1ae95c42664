//! Wire envelope and line-delimited JSON codec.
//!
//! One envelope per line; everything that is not a transport control frame
//! uses this single type. The `round` field always names the round that the
//! *recipient* should deposit the carried sub-message into; senders must
//! translate before dispatch so the scheme is consistent network-wide.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{CurveKind, ParticipantId, SessionKind, SessionStatus};

/// Codec failures. Malformed input is logged and dropped by callers; it never
/// tears down a transport.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message tag: {0}")]
    UnknownTag(String),
    #[error("payload decode failed for {tag}: {reason}")]
    Payload { tag: String, reason: String },
}

/// Message tags, enumerated exactly as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SessionSync,
    KeygenInit,
    KeygenRound1,
    KeygenRound2,
    KeygenRound3,
    ReshareInit,
    ReshareRound,
    SignInit,
    SignRound,
    KeygenComplete,
    ReshareComplete,
    SignComplete,
    SessionFailed,
    Error,
    Heartbeat,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SessionSync => "session_sync",
            MessageType::KeygenInit => "keygen_init",
            MessageType::KeygenRound1 => "keygen_round1",
            MessageType::KeygenRound2 => "keygen_round2",
            MessageType::KeygenRound3 => "keygen_round3",
            MessageType::ReshareInit => "reshare_init",
            MessageType::ReshareRound => "reshare_round",
            MessageType::SignInit => "sign_init",
            MessageType::SignRound => "sign_round",
            MessageType::KeygenComplete => "keygen_complete",
            MessageType::ReshareComplete => "reshare_complete",
            MessageType::SignComplete => "sign_complete",
            MessageType::SessionFailed => "session_failed",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Ack => "ack",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "session_sync" => MessageType::SessionSync,
            "keygen_init" => MessageType::KeygenInit,
            "keygen_round1" => MessageType::KeygenRound1,
            "keygen_round2" => MessageType::KeygenRound2,
            "keygen_round3" => MessageType::KeygenRound3,
            "reshare_init" => MessageType::ReshareInit,
            "reshare_round" => MessageType::ReshareRound,
            "sign_init" => MessageType::SignInit,
            "sign_round" => MessageType::SignRound,
            "keygen_complete" => MessageType::KeygenComplete,
            "reshare_complete" => MessageType::ReshareComplete,
            "sign_complete" => MessageType::SignComplete,
            "session_failed" => MessageType::SessionFailed,
            "error" => MessageType::Error,
            "heartbeat" => MessageType::Heartbeat,
            "ack" => MessageType::Ack,
            _ => return None,
        })
    }

    /// Round-carrying tag for a session kind and deposit round.
    pub fn round_tag(kind: SessionKind, round: u16) -> Self {
        match kind {
            SessionKind::Dkg => match round {
                1 => MessageType::KeygenRound1,
                2 => MessageType::KeygenRound2,
                _ => MessageType::KeygenRound3,
            },
            SessionKind::Refresh => MessageType::ReshareRound,
            SessionKind::EcdsaSign | SessionKind::Ed25519Sign => MessageType::SignRound,
        }
    }

    /// Completion tag for a session kind.
    pub fn complete_tag(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Dkg => MessageType::KeygenComplete,
            SessionKind::Refresh => MessageType::ReshareComplete,
            SessionKind::EcdsaSign | SessionKind::Ed25519Sign => MessageType::SignComplete,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single wire type. `to` empty means broadcast. `data` is a
/// tag-discriminated record; round messages carry a destination-keyed map
/// (see [`RoundData`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub session_id: String,
    pub from: String,
    pub to: String,
    pub round: u16,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(msg_type: MessageType, session_id: impl Into<String>) -> Self {
        Self {
            msg_type,
            session_id: session_id.into(),
            from: String::new(),
            to: String::new(),
            round: 0,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_participant(mut self, id: ParticipantId) -> Self {
        self.from = id.to_string();
        self
    }

    pub fn to_participant(mut self, id: ParticipantId) -> Self {
        self.to = id.to_string();
        self
    }

    pub fn round(mut self, round: u16) -> Self {
        self.round = round;
        self
    }

    pub fn data<T: Serialize>(mut self, payload: &T) -> Self {
        self.data = serde_json::to_value(payload).ok();
        self
    }

    /// Sender participant id, if `from` holds one.
    pub fn sender(&self) -> Option<ParticipantId> {
        self.from.parse().ok()
    }

    /// Session id as a Uuid, if well-formed.
    pub fn session_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.session_id).ok()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }

    /// Decode the `data` record into a typed payload.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CodecError> {
        let value = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| CodecError::Payload {
            tag: self.msg_type.as_str().to_string(),
            reason: e.to_string(),
        })
    }
}

/// One entry of a destination-keyed round payload. Field names are part of
/// the wire format and stay capitalized. `Data` is opaque to the coordinator
/// and handed verbatim to the crypto provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(rename = "From")]
    pub from: u16,
    #[serde(rename = "To")]
    pub to: u16,
    #[serde(rename = "Data")]
    pub data: String,
}

/// Destination-keyed round payload: decimal participant id strings mapping to
/// per-peer sub-messages. A recipient extracts the entry keyed by its own id.
pub type RoundData = BTreeMap<String, PeerEntry>;

/// Build a destination-keyed payload from per-peer sub-messages.
pub fn round_data(from: ParticipantId, per_peer: &BTreeMap<ParticipantId, String>) -> RoundData {
    per_peer
        .iter()
        .map(|(to, data)| {
            (
                to.to_string(),
                PeerEntry {
                    from: from.0,
                    to: to.0,
                    data: data.clone(),
                },
            )
        })
        .collect()
}

/// `keygen_init` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeygenInitData {
    pub threshold: u16,
    pub participants: Vec<u16>,
    pub curve: CurveKind,
}

/// `reshare_init` payload. `session_id` names the DKG session whose key is
/// being refreshed; `devote` selects the two participants contributing
/// secret material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshareInitData {
    pub session_id: String,
    pub threshold: u16,
    pub participants: Vec<u16>,
    pub devote: (u16, u16),
}

/// `sign_init` payload. `message` carries the exact bytes to sign, hex
/// encoded; `signers` is the ordered pair (index 0 acts as P1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignInitData {
    pub session_id: String,
    pub message: String,
    pub signers: Vec<u16>,
}

/// `keygen_complete` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeygenCompleteData {
    pub public_key: String,
    pub participant_id: u16,
    pub private_share: String,
}

/// `reshare_complete` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshareCompleteData {
    pub new_private_share: String,
    pub old_private_share: String,
    pub reshare_completed_at: DateTime<Utc>,
}

/// `sign_complete` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignCompleteData {
    pub signature: String,
    pub signature_r: String,
    pub signature_s: String,
}

/// `session_failed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailedData {
    pub reason: String,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// `ack` payload. The first frame on a fresh transport doubles as a hello:
/// a peer coordinator presents its participant id, a request-originating
/// client presents a symbolic client id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `session_sync` payload mirroring a session to peers. Applied with
/// upsert-then-overlay semantics: present fields replace local values,
/// absent fields are retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSyncData {
    pub session_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub participants: Vec<u16>,
    pub threshold: u16,
    pub current_round: u16,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encode an envelope as a single JSON line (no trailing newline).
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decode one JSON line into an envelope. Unknown tags are rejected before
/// any payload is touched.
pub fn decode_envelope(line: &str) -> Result<Envelope, CodecError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Malformed("missing type tag".to_string()))?;
    if MessageType::from_tag(tag).is_none() {
        return Err(CodecError::UnknownTag(tag.to_string()));
    }
    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}
