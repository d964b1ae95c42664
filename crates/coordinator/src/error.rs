//! Coordinator error types.

use thiserror::Error;
use uuid::Uuid;

use tss_network::NetworkError;
use tss_protocols::EngineError;
use tss_provider::ProviderError;
use tss_types::session::SessionError;
use tss_types::{Role, SessionKind};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    #[error("unknown key {0}")]
    UnknownKey(Uuid),

    #[error("role {role} does not accept {kind} sessions")]
    CapabilityMismatch { role: Role, kind: SessionKind },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session store: {0}")]
    Store(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
