//! Process Configuration
//! Mission: Read the environment once, fail fast on missing secrets

use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: String,
    /// Process-wide data-encryption secret for at-rest secret fields.
    pub data_key: String,
    /// PEM file holding the RSA private key for transport envelopes.
    pub rsa_key_path: String,
    pub jwt_secret: String,
    pub market_api_base: String,
    pub ai500_api_base: Option<String>,
    pub oi_api_base: Option<String>,
    /// Order/fill sync cadence in seconds.
    pub fill_sync_secs: u64,
    /// Position sync + equity snapshot cadence in seconds.
    pub position_sync_secs: u64,
    /// Adapter balance/position cache TTL in seconds.
    pub adapter_cache_ttl_secs: u64,
    /// Decisions kept per agent before pruning.
    pub decision_retention: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_key =
            env::var("TRADEFLEET_DATA_KEY").context("TRADEFLEET_DATA_KEY missing (set env var)")?;
        if data_key.trim().len() < 16 {
            anyhow::bail!("TRADEFLEET_DATA_KEY too short (need >= 16 chars)");
        }

        let rsa_key_path = env::var("TRADEFLEET_RSA_KEY_PATH")
            .context("TRADEFLEET_RSA_KEY_PATH missing (set env var)")?;
        let jwt_secret = env::var("TRADEFLEET_JWT_SECRET")
            .context("TRADEFLEET_JWT_SECRET missing (set env var)")?;

        Ok(Self {
            bind_addr: env::var("TRADEFLEET_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            db_path: env::var("TRADEFLEET_DB_PATH").unwrap_or_else(|_| "tradefleet.db".into()),
            data_key,
            rsa_key_path,
            jwt_secret,
            market_api_base: env::var("MARKET_API_BASE")
                .unwrap_or_else(|_| "http://127.0.0.1:9100".into()),
            ai500_api_base: env::var("AI500_API_BASE").ok().filter(|s| !s.is_empty()),
            oi_api_base: env::var("OI_API_BASE").ok().filter(|s| !s.is_empty()),
            fill_sync_secs: env_u64("TRADEFLEET_FILL_SYNC_SECS", 10),
            position_sync_secs: env_u64("TRADEFLEET_POSITION_SYNC_SECS", 60),
            adapter_cache_ttl_secs: env_u64("TRADEFLEET_ADAPTER_CACHE_TTL_SECS", 15),
            decision_retention: env_u64("TRADEFLEET_DECISION_RETENTION", 500) as usize,
        })
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}
