//! Model / exchange credential endpoints and strategy CRUD.
//!
//! Credential PUTs only accept the RSA+AEAD transport envelope; plain
//! JSON bodies are rejected with a stable error code. Secrets never
//! appear in responses.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::auth::AuthUser;
use crate::crypto::{TransportEnvelope, VaultError};
use crate::models::{CoinSource, ExchangeConfig, ModelConfig, PromptVariant, Strategy};

/// Unwrap and decrypt a credential-update body. The two failure layers
/// get distinct codes so clients can tell a stale key from a bad seal.
fn open_envelope(state: &AppState, body: &serde_json::Value) -> Result<String, ApiError> {
    let envelope: TransportEnvelope = serde_json::from_value(body.clone()).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "envelope_required",
            "credential updates must be sent as an encrypted envelope",
        )
    })?;

    state.transport.open_envelope(&envelope).map_err(|e| match e {
        VaultError::Unwrap => ApiError::new(
            StatusCode::BAD_REQUEST,
            "envelope_key_rejected",
            "session key could not be unwrapped; refetch the public key",
        ),
        VaultError::Decrypt => ApiError::new(
            StatusCode::BAD_REQUEST,
            "envelope_invalid",
            "payload failed to decrypt",
        ),
        other => ApiError::new(StatusCode::BAD_REQUEST, "envelope_invalid", other.to_string()),
    })
}

pub async fn list_models(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelConfig>>, ApiError> {
    let models = state
        .store
        .list_models(user.user_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(models.iter().map(|m| m.masked()).collect()))
}

#[derive(Debug, Deserialize)]
struct ModelUpsert {
    id: Option<Uuid>,
    provider: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    model_name: String,
}

fn default_true() -> bool {
    true
}

pub async fn update_model(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ModelConfig>, ApiError> {
    let inner = open_envelope(&state, &body)?;
    let req: ModelUpsert = serde_json::from_str(&inner).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, "bad_payload", e.to_string())
    })?;

    let cfg = ModelConfig {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        user_id: user.user_id,
        provider: req.provider,
        enabled: req.enabled,
        api_key: req.api_key,
        base_url: req.base_url,
        model_name: req.model_name,
    };
    let stored = state
        .store
        .upsert_model(&cfg)
        .await
        .map_err(ApiError::internal)?;
    info!(user = %user.username, provider = %stored.provider, "model config updated");
    Ok(Json(stored.masked()))
}

pub async fn list_exchanges(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExchangeConfig>>, ApiError> {
    let exchanges = state
        .store
        .list_exchanges(user.user_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(exchanges.iter().map(|e| e.masked()).collect()))
}

#[derive(Debug, Deserialize)]
struct ExchangeUpsert {
    id: Option<Uuid>,
    venue: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    testnet: bool,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    secret_key: String,
    #[serde(default)]
    passphrase: String,
}

pub async fn update_exchange(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ExchangeConfig>, ApiError> {
    let inner = open_envelope(&state, &body)?;
    let req: ExchangeUpsert = serde_json::from_str(&inner).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, "bad_payload", e.to_string())
    })?;

    let cfg = ExchangeConfig {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        user_id: user.user_id,
        venue: req.venue,
        enabled: req.enabled,
        testnet: req.testnet,
        api_key: req.api_key,
        secret_key: req.secret_key,
        passphrase: req.passphrase,
    };
    let stored = state
        .store
        .upsert_exchange(&cfg)
        .await
        .map_err(ApiError::internal)?;
    info!(user = %user.username, venue = %stored.venue, "exchange config updated");
    Ok(Json(stored.masked()))
}

pub async fn list_strategies(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Strategy>>, ApiError> {
    let strategies = state
        .store
        .list_strategies(user.user_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(strategies))
}

#[derive(Debug, Deserialize)]
struct StrategyUpsert {
    id: Option<Uuid>,
    name: String,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    coin_sources: Vec<String>,
    #[serde(default)]
    custom_coins: Vec<String>,
    #[serde(default)]
    timeframes: Vec<String>,
    #[serde(default)]
    primary_timeframe: String,
    #[serde(default = "default_kline_count")]
    kline_count: usize,
    #[serde(default = "default_candidate_limit")]
    candidate_limit: usize,
    btc_eth_max_leverage: f64,
    altcoin_max_leverage: f64,
    max_positions: usize,
    #[serde(default)]
    prompt_variant: String,
    #[serde(default)]
    overrides: serde_json::Value,
}

fn default_kline_count() -> usize {
    50
}

fn default_candidate_limit() -> usize {
    12
}

pub async fn update_strategy(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(req): Json<serde_json::Value>,
) -> Result<Json<Strategy>, ApiError> {
    let req: StrategyUpsert = serde_json::from_value(req).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, "bad_payload", e.to_string())
    })?;

    let coin_sources: Vec<CoinSource> = req
        .coin_sources
        .iter()
        .filter_map(|s| CoinSource::parse(s))
        .collect();
    let strategy = Strategy {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        user_id: user.user_id,
        name: req.name,
        is_active: req.is_active,
        coin_sources: if coin_sources.is_empty() {
            vec![CoinSource::DefaultList]
        } else {
            coin_sources
        },
        custom_coins: req.custom_coins,
        timeframes: if req.timeframes.is_empty() {
            vec!["15m".into(), "1h".into()]
        } else {
            req.timeframes
        },
        primary_timeframe: if req.primary_timeframe.is_empty() {
            "15m".into()
        } else {
            req.primary_timeframe
        },
        kline_count: req.kline_count,
        candidate_limit: req.candidate_limit,
        btc_eth_max_leverage: req.btc_eth_max_leverage,
        altcoin_max_leverage: req.altcoin_max_leverage,
        max_positions: req.max_positions,
        prompt_variant: PromptVariant::parse(&req.prompt_variant).unwrap_or(PromptVariant::Default),
        overrides: req.overrides,
    };

    state.store.upsert_strategy(&strategy).await.map_err(|e| {
        // leverage bounds surface as a 400 with the validation code
        match e.downcast::<crate::error::CoreError>() {
            Ok(core) => ApiError::from(core),
            Err(other) => ApiError::internal(other),
        }
    })?;

    let stored = state
        .store
        .get_strategy(user.user_id, strategy.id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("strategy"))?;
    Ok(Json(stored))
}
