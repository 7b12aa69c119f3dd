//! Public endpoints: liveness, the transport public key, the leaderboard.

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::scheduler::LeaderboardEntry;

pub async fn healthz() -> &'static str {
    "ok"
}

/// PEM of the RSA public key clients seal credential envelopes with.
pub async fn public_key(State(state): State<AppState>) -> String {
    state.transport.public_key_pem().to_string()
}

pub async fn competition(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let entries = state
        .scheduler
        .get_competition()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub n: Option<usize>,
}

pub async fn top(
    Query(q): Query<TopQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let entries = state
        .scheduler
        .get_top(q.n.unwrap_or(10).clamp(1, 100))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(entries))
}
