//! Agent CRUD, lifecycle and per-agent feeds. Every query is scoped to
//! the authenticated user.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::Extension;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::auth::AuthUser;
use crate::models::Agent;
use crate::scheduler::AgentStatus;

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub id: Uuid,
    pub name: String,
    pub model_id: Uuid,
    pub exchange_id: Uuid,
    pub strategy_id: Uuid,
    pub initial_balance: f64,
    pub scan_interval_minutes: u32,
    pub is_cross_margin: bool,
    pub custom_prompt: String,
    pub override_base_prompt: bool,
    pub is_running: bool,
    pub last_error: Option<String>,
    pub created_at: String,
}

impl From<Agent> for AgentView {
    fn from(a: Agent) -> Self {
        Self {
            id: a.id,
            name: a.name,
            model_id: a.model_id,
            exchange_id: a.exchange_id,
            strategy_id: a.strategy_id,
            initial_balance: a.initial_balance,
            scan_interval_minutes: a.scan_interval_minutes,
            is_cross_margin: a.is_cross_margin,
            custom_prompt: a.custom_prompt,
            override_base_prompt: a.override_base_prompt,
            is_running: a.is_running,
            last_error: a.last_error,
            created_at: a.created_at.to_rfc3339(),
        }
    }
}

pub async fn list_agents(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentView>>, ApiError> {
    let agents = state
        .scheduler
        .load_user_agents(user.user_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(agents.into_iter().map(AgentView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct AgentUpsertRequest {
    pub name: String,
    pub model_id: Uuid,
    pub exchange_id: Uuid,
    pub strategy_id: Uuid,
    #[serde(default)]
    pub initial_balance: f64,
    #[serde(default = "default_interval")]
    pub scan_interval_minutes: u32,
    #[serde(default = "default_true")]
    pub is_cross_margin: bool,
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default)]
    pub override_base_prompt: bool,
}

fn default_interval() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

pub async fn create_agent(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(req): Json<AgentUpsertRequest>,
) -> Result<Json<AgentView>, ApiError> {
    // referenced configs must exist for this user before the row lands
    if state
        .store
        .get_model(user.user_id, req.model_id)
        .await
        .map_err(ApiError::internal)?
        .is_none()
    {
        return Err(ApiError::not_found("model config"));
    }
    if state
        .store
        .get_exchange(user.user_id, req.exchange_id)
        .await
        .map_err(ApiError::internal)?
        .is_none()
    {
        return Err(ApiError::not_found("exchange config"));
    }
    if state
        .store
        .get_strategy(user.user_id, req.strategy_id)
        .await
        .map_err(ApiError::internal)?
        .is_none()
    {
        return Err(ApiError::not_found("strategy"));
    }

    let agent = Agent {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        name: req.name,
        model_id: req.model_id,
        exchange_id: req.exchange_id,
        strategy_id: req.strategy_id,
        initial_balance: req.initial_balance,
        scan_interval_minutes: req.scan_interval_minutes,
        is_cross_margin: req.is_cross_margin,
        custom_prompt: req.custom_prompt,
        override_base_prompt: req.override_base_prompt,
        is_running: false,
        last_error: None,
        created_at: Utc::now(),
    };
    let stored = state
        .store
        .upsert_agent(&agent)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(stored.into()))
}

pub async fn update_agent(
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<AgentUpsertRequest>,
) -> Result<Json<AgentView>, ApiError> {
    let existing = state
        .store
        .get_agent_scoped(user.user_id, id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    if existing.is_running {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "agent_running",
            "stop the agent before editing it",
        ));
    }

    let agent = Agent {
        id: existing.id,
        user_id: existing.user_id,
        name: req.name,
        model_id: req.model_id,
        exchange_id: req.exchange_id,
        strategy_id: req.strategy_id,
        initial_balance: req.initial_balance,
        scan_interval_minutes: req.scan_interval_minutes,
        is_cross_margin: req.is_cross_margin,
        custom_prompt: req.custom_prompt,
        override_base_prompt: req.override_base_prompt,
        is_running: existing.is_running,
        last_error: existing.last_error,
        created_at: existing.created_at,
    };
    let stored = state
        .store
        .upsert_agent(&agent)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(stored.into()))
}

pub async fn delete_agent(
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    let existing = state
        .store
        .get_agent_scoped(user.user_id, id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    if existing.is_running {
        state.scheduler.stop(id).await?;
    }
    state
        .store
        .delete_agent(user.user_id, id)
        .await
        .map_err(ApiError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_agent(
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .get_agent_scoped(user.user_id, id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    state.scheduler.start(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_agent(
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .get_agent_scoped(user.user_id, id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    state.scheduler.stop(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn agent_status(
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<AgentStatus>, ApiError> {
    state
        .store
        .get_agent_scoped(user.user_id, id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    let status = state
        .scheduler
        .get_status(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
pub struct AgentFeedQuery {
    pub agent_id: Uuid,
    pub n: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DecisionView {
    pub id: Uuid,
    pub ts: i64,
    pub note: String,
    pub actions: serde_json::Value,
    pub order_ids: Vec<Uuid>,
    pub raw_response: String,
}

/// Newest-first decision list.
pub async fn latest_decisions(
    Extension(user): Extension<AuthUser>,
    Query(q): Query<AgentFeedQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<DecisionView>>, ApiError> {
    state
        .store
        .get_agent_scoped(user.user_id, q.agent_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;

    let decisions = state
        .store
        .decisions(q.agent_id, q.n.unwrap_or(20), true)
        .await
        .map_err(ApiError::internal)?;
    let views = decisions
        .into_iter()
        .map(|d| DecisionView {
            id: d.id,
            ts: d.ts,
            note: d.note,
            actions: serde_json::from_str(&d.actions_json)
                .unwrap_or(serde_json::Value::Array(vec![])),
            order_ids: d.order_ids,
            raw_response: d.raw_response,
        })
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Serialize)]
pub struct EquityPoint {
    pub ts: i64,
    pub total_equity: f64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub pnl_pct: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
}

/// Oldest-first equity series for the chart feed.
pub async fn equity_history(
    Extension(user): Extension<AuthUser>,
    Query(q): Query<AgentFeedQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<EquityPoint>>, ApiError> {
    let agent = state
        .store
        .get_agent_scoped(user.user_id, q.agent_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("agent"))?;

    let series = state
        .store
        .equity_series(q.agent_id, q.n.unwrap_or(500))
        .await
        .map_err(ApiError::internal)?;
    let points = series
        .into_iter()
        .map(|s| EquityPoint {
            ts: s.ts,
            total_equity: s.total_equity,
            balance: s.balance,
            unrealized_pnl: s.unrealized_pnl,
            pnl_pct: if agent.initial_balance > 0.0 {
                (s.total_equity - agent.initial_balance) / agent.initial_balance * 100.0
            } else {
                0.0
            },
            position_count: s.position_count,
            margin_used_pct: s.margin_used_pct,
        })
        .collect();
    Ok(Json(points))
}
