//! Meridian API -- operator commands and peer registration over HTTP.
//!
//! Operator routes (`add_node`, `update_node`, `remove_node`,
//! `cluster_status`) and the peer-facing registration routes share one
//! router. Every route takes a bearer token. Errors are returned as
//! `{"error": message}` with a matching status code.

pub mod ops;
pub mod peer;

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use meridian_coordinator::{CoordinatorError, CoordinatorHandle};
use meridian_protocol::{PeerIdentity, RegisterRequest, RemoveRequest};
use meridian_registry::{NodeRegistry, RegistryError};
use serde::{Deserialize, Serialize};

pub use ops::{AddNodeRequest, MessageResponse, RemoveNodeRequest};
pub use peer::{HttpPeerClient, PeerClient, PeerFuture};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid bearer token")]
    Unauthorized,
    #[error("peer {url}: {message}")]
    Peer { url: String, message: String },
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("coordinator unavailable: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Peer { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Coordinator(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Registry(_) | ApiError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body shared by every route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Shared state for all API handlers.
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    /// What this node presents to peers during registration.
    pub identity: PeerIdentity,
    pub bearer_token: String,
    pub coordinator: Option<CoordinatorHandle>,
    pub peers: Arc<dyn PeerClient>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/add_node", post(add_node))
        .route("/api/v1/update_node", post(update_node))
        .route("/api/v1/remove_node", post(remove_node))
        .route("/api/v1/cluster_status", post(cluster_status))
        .route("/api/v1/replication/register", post(replication_register))
        .route("/api/v1/replication/remove", post(replication_remove))
        .with_state(state)
}

// ============================================================================
// Auth middleware (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

// ============================================================================
// Operator handlers
// ============================================================================

async fn add_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddNodeRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match ops::add_node(&state, req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "api: add_node failed");
            e.into_response()
        }
    }
}

async fn update_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddNodeRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match ops::update_node(&state, req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "api: update_node failed");
            e.into_response()
        }
    }
}

async fn remove_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RemoveNodeRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match ops::remove_node(&state, req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "api: remove_node failed");
            e.into_response()
        }
    }
}

async fn cluster_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    let Some(coordinator) = &state.coordinator else {
        return ApiError::Coordinator(CoordinatorError::Stopped).into_response();
    };
    match coordinator.cluster_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ============================================================================
// Peer handlers
// ============================================================================

async fn replication_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match ops::register_peer(&state, req) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "api: peer registration rejected");
            e.into_response()
        }
    }
}

async fn replication_remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RemoveRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    match ops::remove_peer(&state, req) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}
