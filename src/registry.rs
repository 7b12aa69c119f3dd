//! Per-agent adapter registry.
//!
//! One adapter instance per (agent, venue) pair keeps rate-limit state
//! and caches isolated. Built lazily from the agent's decrypted config;
//! shared by the scheduler and both reconcilers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::exchange::{build_adapter, ExchangeAdapter};
use crate::store::Store;

pub struct AdapterRegistry {
    http: reqwest::Client,
    cache_ttl: Duration,
    adapters: RwLock<HashMap<Uuid, Arc<dyn ExchangeAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(http: reqwest::Client, cache_ttl: Duration) -> Self {
        Self {
            http,
            cache_ttl,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_build(
        &self,
        store: &Store,
        agent_id: Uuid,
    ) -> CoreResult<Arc<dyn ExchangeAdapter>> {
        if let Some(adapter) = self.adapters.read().get(&agent_id) {
            return Ok(adapter.clone());
        }

        let full = store
            .full_config(agent_id)
            .await
            .map_err(|e| CoreError::Config(format!("load agent {agent_id}: {e}")))?;
        let adapter = build_adapter(self.http.clone(), &full.exchange, self.cache_ttl)?;
        self.adapters.write().insert(agent_id, adapter.clone());
        Ok(adapter)
    }

    /// Inject a ready-made adapter (tests, venue reconfiguration).
    pub fn insert(&self, agent_id: Uuid, adapter: Arc<dyn ExchangeAdapter>) {
        self.adapters.write().insert(agent_id, adapter);
    }

    /// Drop a cached adapter so the next use rebuilds from fresh config.
    pub fn remove(&self, agent_id: Uuid) {
        self.adapters.write().remove(&agent_id);
    }
}
