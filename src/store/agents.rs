//! Agent repo and the full-config loader used by workers.

use anyhow::{Context, Result};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{parse_rfc3339, parse_uuid, Store};
use crate::models::{Agent, AgentFullConfig, MIN_SCAN_INTERVAL_MINUTES};

fn agent_from_row(row: &Row<'_>) -> Result<Agent> {
    Ok(Agent {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        user_id: parse_uuid(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        model_id: parse_uuid(&row.get::<_, String>(3)?)?,
        exchange_id: parse_uuid(&row.get::<_, String>(4)?)?,
        strategy_id: parse_uuid(&row.get::<_, String>(5)?)?,
        initial_balance: row.get(6)?,
        scan_interval_minutes: row.get::<_, i64>(7)? as u32,
        is_cross_margin: row.get::<_, i64>(8)? != 0,
        custom_prompt: row.get(9)?,
        override_base_prompt: row.get::<_, i64>(10)? != 0,
        is_running: row.get::<_, i64>(11)? != 0,
        last_error: row.get(12)?,
        created_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
    })
}

const AGENT_COLS: &str = "id, user_id, name, model_id, exchange_id, strategy_id, \
     initial_balance, scan_interval_minutes, is_cross_margin, custom_prompt, \
     override_base_prompt, is_running, last_error, created_at";

impl Store {
    /// Insert or update an agent. The scan interval is clamped to the
    /// platform minimum at this boundary.
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<Agent> {
        let interval = agent.scan_interval_minutes.max(MIN_SCAN_INTERVAL_MINUTES);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agents
                (id, user_id, name, model_id, exchange_id, strategy_id, initial_balance,
                 scan_interval_minutes, is_cross_margin, custom_prompt, override_base_prompt,
                 is_running, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                model_id = excluded.model_id,
                exchange_id = excluded.exchange_id,
                strategy_id = excluded.strategy_id,
                initial_balance = excluded.initial_balance,
                scan_interval_minutes = excluded.scan_interval_minutes,
                is_cross_margin = excluded.is_cross_margin,
                custom_prompt = excluded.custom_prompt,
                override_base_prompt = excluded.override_base_prompt",
            params![
                agent.id.to_string(),
                agent.user_id.to_string(),
                agent.name,
                agent.model_id.to_string(),
                agent.exchange_id.to_string(),
                agent.strategy_id.to_string(),
                agent.initial_balance,
                interval as i64,
                agent.is_cross_margin as i64,
                agent.custom_prompt,
                agent.override_base_prompt as i64,
                agent.is_running as i64,
                agent.last_error,
                agent.created_at.to_rfc3339(),
            ],
        )
        .context("upsert agent")?;
        drop(conn);

        self.get_agent(agent.id)
            .await?
            .context("agent vanished after upsert")
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(agent_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// User-scoped fetch for the API layer.
    pub async fn get_agent_scoped(&self, user_id: Uuid, id: Uuid) -> Result<Option<Agent>> {
        Ok(self
            .get_agent(id)
            .await?
            .filter(|a| a.user_id == user_id))
    }

    pub async fn list_agents(&self, user_id: Uuid) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![user_id.to_string()])?;
        while let Some(row) = rows.next()? {
            out.push(agent_from_row(row)?);
        }
        Ok(out)
    }

    /// Every agent across users. The scheduler walks this at boot and the
    /// reconcilers walk it each cycle.
    pub async fn list_all_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {AGENT_COLS} FROM agents ORDER BY created_at ASC"
        ))?;
        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            out.push(agent_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn delete_agent(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM agents WHERE user_id = ?1 AND id = ?2",
            params![user_id.to_string(), id.to_string()],
        )?;
        Ok(n > 0)
    }

    pub async fn set_agent_running(
        &self,
        id: Uuid,
        is_running: bool,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agents SET is_running = ?2, last_error = ?3 WHERE id = ?1",
            params![id.to_string(), is_running as i64, last_error],
        )?;
        Ok(())
    }

    pub async fn set_agent_last_error(&self, id: Uuid, last_error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agents SET last_error = ?2 WHERE id = ?1",
            params![id.to_string(), last_error],
        )?;
        Ok(())
    }

    /// Load agent + strategy + model + exchange with all secrets
    /// decrypted. This is the only read path that yields plaintext keys.
    pub async fn full_config(&self, agent_id: Uuid) -> Result<AgentFullConfig> {
        let agent = self
            .get_agent(agent_id)
            .await?
            .with_context(|| format!("agent {agent_id} not found"))?;
        let strategy = self
            .get_strategy(agent.user_id, agent.strategy_id)
            .await?
            .with_context(|| format!("strategy {} not found", agent.strategy_id))?;
        let mut model = self
            .get_model(agent.user_id, agent.model_id)
            .await?
            .with_context(|| format!("model config {} not found", agent.model_id))?;
        let mut exchange = self
            .get_exchange(agent.user_id, agent.exchange_id)
            .await?
            .with_context(|| format!("exchange config {} not found", agent.exchange_id))?;

        model.api_key = self.vault.decrypt_storage(&model.api_key, None)?;
        exchange.api_key = self.vault.decrypt_storage(&exchange.api_key, None)?;
        exchange.secret_key = self.vault.decrypt_storage(&exchange.secret_key, None)?;
        exchange.passphrase = self.vault.decrypt_storage(&exchange.passphrase, None)?;

        Ok(AgentFullConfig {
            agent,
            strategy,
            model,
            exchange,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::models::*;
    use chrono::Utc;
    use uuid::Uuid;

    async fn seed_full(store: &crate::store::Store) -> Agent {
        let user_id = seed_user(store).await;
        let strategy = Strategy {
            id: Uuid::new_v4(),
            user_id,
            name: "s".into(),
            is_active: true,
            coin_sources: vec![CoinSource::DefaultList],
            custom_coins: vec![],
            timeframes: vec!["15m".into()],
            primary_timeframe: "15m".into(),
            kline_count: 50,
            candidate_limit: 12,
            btc_eth_max_leverage: 10.0,
            altcoin_max_leverage: 5.0,
            max_positions: 3,
            prompt_variant: PromptVariant::Default,
            overrides: serde_json::json!({}),
        };
        store.upsert_strategy(&strategy).await.unwrap();

        let model = ModelConfig {
            id: Uuid::new_v4(),
            user_id,
            provider: "deepseek".into(),
            enabled: true,
            api_key: "sk-model".into(),
            base_url: String::new(),
            model_name: "deepseek-chat".into(),
        };
        store.upsert_model(&model).await.unwrap();

        let exchange = ExchangeConfig {
            id: Uuid::new_v4(),
            user_id,
            venue: "mock".into(),
            enabled: true,
            testnet: true,
            api_key: "xk".into(),
            secret_key: "xs".into(),
            passphrase: String::new(),
        };
        store.upsert_exchange(&exchange).await.unwrap();

        let agent = Agent {
            id: Uuid::new_v4(),
            user_id,
            name: "alpha".into(),
            model_id: model.id,
            exchange_id: exchange.id,
            strategy_id: strategy.id,
            initial_balance: 1000.0,
            scan_interval_minutes: 1, // below minimum on purpose
            is_cross_margin: true,
            custom_prompt: String::new(),
            override_base_prompt: false,
            is_running: false,
            last_error: None,
            created_at: Utc::now(),
        };
        store.upsert_agent(&agent).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_clamps_scan_interval() {
        let (store, _f) = open_temp_store();
        let agent = seed_full(&store).await;
        assert_eq!(agent.scan_interval_minutes, 3);
    }

    #[tokio::test]
    async fn full_config_decrypts_secrets() {
        let (store, _f) = open_temp_store();
        let agent = seed_full(&store).await;

        let full = store.full_config(agent.id).await.unwrap();
        assert_eq!(full.model.api_key, "sk-model");
        assert_eq!(full.exchange.api_key, "xk");
        assert_eq!(full.exchange.secret_key, "xs");

        // but plain reads still see ciphertext
        let raw = store
            .get_exchange(agent.user_id, agent.exchange_id)
            .await
            .unwrap()
            .unwrap();
        assert!(raw.api_key.starts_with("enc:v1:"));
    }

    #[tokio::test]
    async fn scoped_get_hides_other_users() {
        let (store, _f) = open_temp_store();
        let agent = seed_full(&store).await;
        let stranger = Uuid::new_v4();
        assert!(store
            .get_agent_scoped(stranger, agent.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_agent_scoped(agent.user_id, agent.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn running_flag_and_last_error() {
        let (store, _f) = open_temp_store();
        let agent = seed_full(&store).await;
        store
            .set_agent_running(agent.id, true, None)
            .await
            .unwrap();
        assert!(store.get_agent(agent.id).await.unwrap().unwrap().is_running);

        store
            .set_agent_running(agent.id, false, Some("AUTH: key rejected"))
            .await
            .unwrap();
        let a = store.get_agent(agent.id).await.unwrap().unwrap();
        assert!(!a.is_running);
        assert_eq!(a.last_error.as_deref(), Some("AUTH: key rejected"));
    }
}
