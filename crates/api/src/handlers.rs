//! Request handlers for the initiation surface.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tss_types::{CurveKind, Session, SessionKind, SessionStatus};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Uniform response for the three initiation endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct InitiationResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct KeygenRequest {
    pub threshold: u16,
    pub participants: Vec<u16>,
    /// Defaults to secp256k1, the curve the signing wallet flow uses.
    #[serde(default)]
    pub curve: Option<CurveKind>,
}

/// POST /keygen - start a distributed key generation session.
pub async fn keygen(
    State(state): State<AppState>,
    Json(body): Json<KeygenRequest>,
) -> ApiResult<Json<InitiationResponse>> {
    let curve = body.curve.unwrap_or(CurveKind::Secp256k1);
    let session_id = state
        .coordinator
        .start_keygen(body.threshold, body.participants, curve, None)
        .await?;
    Ok(Json(InitiationResponse {
        session_id: session_id.to_string(),
        status: "pending".to_string(),
        message: format!("keygen session created on curve {curve}"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReshareRequest {
    pub session_id: String,
    pub new_threshold: u16,
    pub new_participants: Vec<u16>,
    /// The two participants contributing secret material; defaults to the
    /// first two of `new_participants`.
    #[serde(default)]
    pub devote: Option<(u16, u16)>,
}

/// POST /reshare - refresh the shares of an existing key.
pub async fn reshare(
    State(state): State<AppState>,
    Json(body): Json<ReshareRequest>,
) -> ApiResult<Json<InitiationResponse>> {
    let key_id = parse_uuid(&body.session_id)?;
    let devote = match body.devote {
        Some(pair) => pair,
        None => {
            if body.new_participants.len() < 2 {
                return Err(ApiError::BadRequest(
                    "reshare requires at least two participants".to_string(),
                ));
            }
            (body.new_participants[0], body.new_participants[1])
        }
    };
    let session_id = state
        .coordinator
        .start_reshare(
            key_id,
            body.new_threshold,
            body.new_participants,
            devote,
            None,
        )
        .await?;
    Ok(Json(InitiationResponse {
        session_id: session_id.to_string(),
        status: "pending".to_string(),
        message: format!("reshare session created for key {key_id}"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    pub session_id: String,
    pub message: String,
    pub signers: Vec<u16>,
}

/// POST /sign - start a two-party signing session.
pub async fn sign(
    State(state): State<AppState>,
    Json(body): Json<SignRequest>,
) -> ApiResult<Json<InitiationResponse>> {
    let key_id = parse_uuid(&body.session_id)?;
    let session_id = state
        .coordinator
        .start_sign(key_id, body.message.as_bytes(), body.signers, None)
        .await?;
    Ok(Json(InitiationResponse {
        session_id: session_id.to_string(),
        status: "pending".to_string(),
        message: format!("sign session created for key {key_id}"),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    pub status: Option<SessionStatus>,
    pub kind: Option<SessionKind>,
}

/// GET /sessions - list sessions, optionally filtered by status and kind.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(
        state.coordinator.sessions(query.status, query.kind).await,
    ))
}

/// GET /sessions/:id - session detail.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session_id = parse_uuid(&id)?;
    state
        .coordinator
        .session(session_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub participant_id: u16,
    pub role: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub version: String,
}

/// GET /health - liveness.
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let config = state.coordinator.config();
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        participant_id: config.participant_id,
        role: config.role.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

fn parse_uuid(raw: &str) -> ApiResult<Uuid> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("malformed session id: {raw}")))
}
