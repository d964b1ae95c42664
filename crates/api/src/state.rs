//! Shared application state for the API server.

use std::sync::Arc;
use tss_coordinator::SessionCoordinator;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The session coordinator driving every protocol run.
    pub coordinator: Arc<SessionCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        Self { coordinator }
    }
}
