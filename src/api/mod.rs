//! API Routes
//! Mission: The HTTP surface the core speaks to - agent lifecycle,
//! enveloped credential updates, public feeds

mod agents;
mod credentials;
mod public;

use axum::http::StatusCode;
use axum::middleware as axum_mw;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::auth::{auth_middleware, JwtHandler};
use crate::crypto::TransportVault;
use crate::error::CoreError;
use crate::scheduler::AgentScheduler;
use crate::store::Store;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: Arc<AgentScheduler>,
    pub transport: Arc<TransportVault>,
    pub jwt: Arc<JwtHandler>,
}

/// Structured error body with a stable code.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            err.to_string(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match e {
            CoreError::Config(_) | CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::Auth(_) => StatusCode::UNAUTHORIZED,
            CoreError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = e.kind().as_str().to_ascii_lowercase();
        ApiError::new(status, &code, e.to_string())
    }
}

pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/agents", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/agents/:id",
            put(agents::update_agent).delete(agents::delete_agent),
        )
        .route("/agents/:id/start", post(agents::start_agent))
        .route("/agents/:id/stop", post(agents::stop_agent))
        .route("/agents/:id/status", get(agents::agent_status))
        .route("/decisions/latest", get(agents::latest_decisions))
        .route("/equity-history", get(agents::equity_history))
        .route(
            "/models",
            get(credentials::list_models).put(credentials::update_model),
        )
        .route(
            "/exchanges",
            get(credentials::list_exchanges).put(credentials::update_exchange),
        )
        .route(
            "/strategies",
            get(credentials::list_strategies).put(credentials::update_strategy),
        )
        .layer(axum_mw::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    let open = Router::new()
        .route("/crypto/public-key", get(public::public_key))
        .route("/competition", get(public::competition))
        .route("/competition/top", get(public::top));

    Router::new()
        .route("/healthz", get(public::healthz))
        .nest("/api", open.merge(authed))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
