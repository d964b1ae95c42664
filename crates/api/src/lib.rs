//! REST initiation surface for the threshold signing coordinator.
//!
//! Thin axum layer over [`tss_coordinator::SessionCoordinator`]:
//! - `POST /keygen`, `POST /reshare`, `POST /sign` start sessions
//! - `GET /sessions`, `GET /sessions/:id` inspect them
//! - `GET /health` is the liveness probe
//!
//! Role gating lives in the coordinator; this layer only translates its
//! errors into status codes (400 malformed, 403 capability mismatch,
//! 404 unknown session, 500 internal).

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Create and configure the API router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/keygen", post(handlers::keygen))
        .route("/reshare", post(handlers::reshare))
        .route("/sign", post(handlers::sign))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/:id", get(handlers::get_session))
        .route("/health", get(handlers::health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Start the API server on the specified address.
pub async fn start_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = create_router(state);
    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;
    use tss_coordinator::{CoordinatorConfig, SessionCoordinator};
    use tss_network::PeerRegistry;
    use tss_provider::CurvProvider;
    use tss_types::{ParticipantId, Role};

    fn app(role: Role) -> Router {
        let config = CoordinatorConfig {
            participant_id: 1,
            name: "node-1".to_string(),
            role,
            ..CoordinatorConfig::default()
        };
        let coordinator = SessionCoordinator::new(
            config,
            Arc::new(CurvProvider::new()),
            Arc::new(PeerRegistry::new(ParticipantId(1))),
        );
        create_router(AppState::new(coordinator))
    }

    async fn request(app: Router, method: &str, uri: &str, body: Option<&str>) -> StatusCode {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(
            request(app(Role::Enterprise), "GET", "/health", None).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn keygen_accepts_valid_request() {
        let status = request(
            app(Role::Enterprise),
            "POST",
            "/keygen",
            Some(r#"{"threshold":2,"participants":[1,2,3],"curve":"ed25519"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn keygen_rejects_bad_threshold() {
        let status = request(
            app(Role::Enterprise),
            "POST",
            "/keygen",
            Some(r#"{"threshold":9,"participants":[1,2,3]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn third_party_gets_forbidden_on_reshare() {
        let status = request(
            app(Role::ThirdParty),
            "POST",
            "/reshare",
            Some(
                r#"{"session_id":"00000000-0000-0000-0000-000000000000","new_threshold":2,"new_participants":[1,2,3]}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found_on_sign() {
        let status = request(
            app(Role::Enterprise),
            "POST",
            "/sign",
            Some(
                r#"{"session_id":"00000000-0000-0000-0000-000000000000","message":"hi","signers":[1,2]}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_detail_is_not_found() {
        let status = request(
            app(Role::Enterprise),
            "GET",
            "/sessions/00000000-0000-0000-0000-000000000000",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_list_filters_parse() {
        let status = request(
            app(Role::Enterprise),
            "GET",
            "/sessions?status=pending&kind=dkg",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
