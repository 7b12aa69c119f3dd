//! Model / exchange credential repos and strategy repo.
//!
//! Credential writes are secret-preserving: an empty secret field on an
//! update means "keep what is stored", never "erase the ciphertext".

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::{parse_uuid, Store};
use crate::error::CoreError;
use crate::models::{CoinSource, ExchangeConfig, ModelConfig, PromptVariant, Strategy};

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, ModelConfig)> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    Ok((
        id.clone(),
        user_id.clone(),
        ModelConfig {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            provider: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            api_key: row.get(4)?,
            base_url: row.get(5)?,
            model_name: row.get(6)?,
        },
    ))
}

fn finish_model(raw: (String, String, ModelConfig)) -> Result<ModelConfig> {
    let (id, user_id, mut cfg) = raw;
    cfg.id = parse_uuid(&id)?;
    cfg.user_id = parse_uuid(&user_id)?;
    Ok(cfg)
}

impl Store {
    /// Insert or update a model config. `api_key` is plaintext from the
    /// transport envelope; empty keeps the stored ciphertext.
    pub async fn upsert_model(&self, input: &ModelConfig) -> Result<ModelConfig> {
        let api_key = if input.api_key.is_empty() {
            self.get_model(input.user_id, input.id)
                .await?
                .map(|m| m.api_key)
                .unwrap_or_default()
        } else {
            self.vault.encrypt_storage(&input.api_key, None)?
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO model_configs (id, user_id, provider, enabled, api_key, base_url, model_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, id) DO UPDATE SET
                provider = excluded.provider,
                enabled = excluded.enabled,
                api_key = excluded.api_key,
                base_url = excluded.base_url,
                model_name = excluded.model_name",
            params![
                input.id.to_string(),
                input.user_id.to_string(),
                input.provider,
                input.enabled as i64,
                api_key,
                input.base_url,
                input.model_name,
            ],
        )
        .context("upsert model config")?;
        drop(conn);

        self.get_model(input.user_id, input.id)
            .await?
            .context("model config vanished after upsert")
    }

    pub async fn get_model(&self, user_id: Uuid, id: Uuid) -> Result<Option<ModelConfig>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, provider, enabled, api_key, base_url, model_name
             FROM model_configs WHERE user_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query(params![user_id.to_string(), id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(finish_model(model_from_row(row)?)?)),
            None => Ok(None),
        }
    }

    pub async fn list_models(&self, user_id: Uuid) -> Result<Vec<ModelConfig>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, provider, enabled, api_key, base_url, model_name
             FROM model_configs WHERE user_id = ?1 ORDER BY provider ASC",
        )?;
        let raws = stmt
            .query_map(params![user_id.to_string()], model_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(finish_model).collect()
    }

    pub async fn delete_model(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM model_configs WHERE user_id = ?1 AND id = ?2",
            params![user_id.to_string(), id.to_string()],
        )?;
        Ok(())
    }

    /// Insert or update venue credentials, secret-preserving on all three
    /// secret fields.
    pub async fn upsert_exchange(&self, input: &ExchangeConfig) -> Result<ExchangeConfig> {
        let existing = self.get_exchange(input.user_id, input.id).await?;
        let keep = |incoming: &str, stored: Option<&str>| -> Result<String> {
            if incoming.is_empty() {
                Ok(stored.unwrap_or_default().to_string())
            } else {
                Ok(self.vault.encrypt_storage(incoming, None)?)
            }
        };
        let api_key = keep(&input.api_key, existing.as_ref().map(|e| e.api_key.as_str()))?;
        let secret_key = keep(
            &input.secret_key,
            existing.as_ref().map(|e| e.secret_key.as_str()),
        )?;
        let passphrase = keep(
            &input.passphrase,
            existing.as_ref().map(|e| e.passphrase.as_str()),
        )?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO exchange_configs
                (id, user_id, venue, enabled, testnet, api_key, secret_key, passphrase)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, id) DO UPDATE SET
                venue = excluded.venue,
                enabled = excluded.enabled,
                testnet = excluded.testnet,
                api_key = excluded.api_key,
                secret_key = excluded.secret_key,
                passphrase = excluded.passphrase",
            params![
                input.id.to_string(),
                input.user_id.to_string(),
                input.venue,
                input.enabled as i64,
                input.testnet as i64,
                api_key,
                secret_key,
                passphrase,
            ],
        )
        .context("upsert exchange config")?;
        drop(conn);

        self.get_exchange(input.user_id, input.id)
            .await?
            .context("exchange config vanished after upsert")
    }

    pub async fn get_exchange(&self, user_id: Uuid, id: Uuid) -> Result<Option<ExchangeConfig>> {
        let conn = self.conn.lock().await;
        Self::get_exchange_inner(&conn, user_id, id)
    }

    fn get_exchange_inner(
        conn: &Connection,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<ExchangeConfig>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, venue, enabled, testnet, api_key, secret_key, passphrase
             FROM exchange_configs WHERE user_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query(params![user_id.to_string(), id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(ExchangeConfig {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            user_id: parse_uuid(&row.get::<_, String>(1)?)?,
            venue: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            testnet: row.get::<_, i64>(4)? != 0,
            api_key: row.get(5)?,
            secret_key: row.get(6)?,
            passphrase: row.get(7)?,
        }))
    }

    pub async fn list_exchanges(&self, user_id: Uuid) -> Result<Vec<ExchangeConfig>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, venue, enabled, testnet, api_key, secret_key, passphrase
             FROM exchange_configs WHERE user_id = ?1 ORDER BY venue ASC",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![user_id.to_string()])?;
        while let Some(row) = rows.next()? {
            out.push(ExchangeConfig {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                user_id: parse_uuid(&row.get::<_, String>(1)?)?,
                venue: row.get(2)?,
                enabled: row.get::<_, i64>(3)? != 0,
                testnet: row.get::<_, i64>(4)? != 0,
                api_key: row.get(5)?,
                secret_key: row.get(6)?,
                passphrase: row.get(7)?,
            });
        }
        Ok(out)
    }

    pub async fn delete_exchange(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM exchange_configs WHERE user_id = ?1 AND id = ?2",
            params![user_id.to_string(), id.to_string()],
        )?;
        Ok(())
    }

    /// Insert or update a strategy. Activating one deactivates the user's
    /// others in the same transaction.
    pub async fn upsert_strategy(&self, strat: &Strategy) -> Result<()> {
        for lev in [strat.btc_eth_max_leverage, strat.altcoin_max_leverage] {
            if !(1.0..=50.0).contains(&lev) {
                return Err(CoreError::validation(
                    "leverage_bounds",
                    format!("leverage {lev} outside [1, 50]"),
                )
                .into());
            }
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if strat.is_active {
            tx.execute(
                "UPDATE strategies SET is_active = 0 WHERE user_id = ?1 AND id != ?2",
                params![strat.user_id.to_string(), strat.id.to_string()],
            )?;
        }
        tx.execute(
            "INSERT INTO strategies
                (id, user_id, name, is_active, coin_sources, custom_coins, timeframes,
                 primary_timeframe, kline_count, candidate_limit, btc_eth_max_leverage,
                 altcoin_max_leverage, max_positions, prompt_variant, overrides)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(user_id, id) DO UPDATE SET
                name = excluded.name,
                is_active = excluded.is_active,
                coin_sources = excluded.coin_sources,
                custom_coins = excluded.custom_coins,
                timeframes = excluded.timeframes,
                primary_timeframe = excluded.primary_timeframe,
                kline_count = excluded.kline_count,
                candidate_limit = excluded.candidate_limit,
                btc_eth_max_leverage = excluded.btc_eth_max_leverage,
                altcoin_max_leverage = excluded.altcoin_max_leverage,
                max_positions = excluded.max_positions,
                prompt_variant = excluded.prompt_variant,
                overrides = excluded.overrides",
            params![
                strat.id.to_string(),
                strat.user_id.to_string(),
                strat.name,
                strat.is_active as i64,
                serde_json::to_string(
                    &strat.coin_sources.iter().map(|s| s.as_str()).collect::<Vec<_>>()
                )?,
                serde_json::to_string(&strat.custom_coins)?,
                serde_json::to_string(&strat.timeframes)?,
                strat.primary_timeframe,
                strat.kline_count as i64,
                strat.candidate_limit as i64,
                strat.btc_eth_max_leverage,
                strat.altcoin_max_leverage,
                strat.max_positions as i64,
                strat.prompt_variant.as_str(),
                serde_json::to_string(&strat.overrides)?,
            ],
        )
        .context("upsert strategy")?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_strategy(&self, user_id: Uuid, id: Uuid) -> Result<Option<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, name, is_active, coin_sources, custom_coins, timeframes,
                    primary_timeframe, kline_count, candidate_limit, btc_eth_max_leverage,
                    altcoin_max_leverage, max_positions, prompt_variant, overrides
             FROM strategies WHERE user_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query(params![user_id.to_string(), id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(strategy_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn active_strategy(&self, user_id: Uuid) -> Result<Option<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, name, is_active, coin_sources, custom_coins, timeframes,
                    primary_timeframe, kline_count, candidate_limit, btc_eth_max_leverage,
                    altcoin_max_leverage, max_positions, prompt_variant, overrides
             FROM strategies WHERE user_id = ?1 AND is_active = 1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![user_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(strategy_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_strategies(&self, user_id: Uuid) -> Result<Vec<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, name, is_active, coin_sources, custom_coins, timeframes,
                    primary_timeframe, kline_count, candidate_limit, btc_eth_max_leverage,
                    altcoin_max_leverage, max_positions, prompt_variant, overrides
             FROM strategies WHERE user_id = ?1 ORDER BY name ASC",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![user_id.to_string()])?;
        while let Some(row) = rows.next()? {
            out.push(strategy_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn delete_strategy(&self, user_id: Uuid, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM strategies WHERE user_id = ?1 AND id = ?2",
            params![user_id.to_string(), id.to_string()],
        )?;
        Ok(())
    }
}

fn strategy_from_row(row: &Row<'_>) -> Result<Strategy> {
    let sources: Vec<String> = serde_json::from_str(&row.get::<_, String>(4)?)?;
    Ok(Strategy {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        user_id: parse_uuid(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        coin_sources: sources
            .iter()
            .filter_map(|s| CoinSource::parse(s))
            .collect(),
        custom_coins: serde_json::from_str(&row.get::<_, String>(5)?)?,
        timeframes: serde_json::from_str(&row.get::<_, String>(6)?)?,
        primary_timeframe: row.get(7)?,
        kline_count: row.get::<_, i64>(8)? as usize,
        candidate_limit: row.get::<_, i64>(9)? as usize,
        btc_eth_max_leverage: row.get(10)?,
        altcoin_max_leverage: row.get(11)?,
        max_positions: row.get::<_, i64>(12)? as usize,
        prompt_variant: PromptVariant::parse(&row.get::<_, String>(13)?)
            .unwrap_or(PromptVariant::Default),
        overrides: serde_json::from_str(&row.get::<_, String>(14)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::models::{CoinSource, ExchangeConfig, ModelConfig, PromptVariant, Strategy};
    use uuid::Uuid;

    fn sample_exchange(user_id: Uuid) -> ExchangeConfig {
        ExchangeConfig {
            id: Uuid::new_v4(),
            user_id,
            venue: "binance".into(),
            enabled: true,
            testnet: false,
            api_key: "ABC".into(),
            secret_key: "DEF".into(),
            passphrase: String::new(),
        }
    }

    fn sample_strategy(user_id: Uuid) -> Strategy {
        Strategy {
            id: Uuid::new_v4(),
            user_id,
            name: "momentum".into(),
            is_active: true,
            coin_sources: vec![CoinSource::DefaultList, CoinSource::Custom],
            custom_coins: vec!["SOLUSDT".into()],
            timeframes: vec!["15m".into(), "1h".into()],
            primary_timeframe: "15m".into(),
            kline_count: 50,
            candidate_limit: 12,
            btc_eth_max_leverage: 10.0,
            altcoin_max_leverage: 5.0,
            max_positions: 3,
            prompt_variant: PromptVariant::Default,
            overrides: serde_json::json!({"note": "x"}),
        }
    }

    #[tokio::test]
    async fn secrets_are_encrypted_at_rest() {
        let (store, _f) = open_temp_store();
        let user_id = seed_user(&store).await;
        let stored = store.upsert_exchange(&sample_exchange(user_id)).await.unwrap();

        assert!(stored.api_key.starts_with("enc:v1:"));
        assert!(stored.secret_key.starts_with("enc:v1:"));
        assert_eq!(stored.passphrase, "");
        assert_eq!(
            store.vault.decrypt_storage(&stored.api_key, None).unwrap(),
            "ABC"
        );
    }

    #[tokio::test]
    async fn empty_secret_preserves_ciphertext() {
        let (store, _f) = open_temp_store();
        let user_id = seed_user(&store).await;
        let cfg = sample_exchange(user_id);
        let stored = store.upsert_exchange(&cfg).await.unwrap();

        // enabled=false + blank secrets must keep the old ciphertext
        let mut update = cfg.clone();
        update.enabled = false;
        update.api_key = String::new();
        update.secret_key = String::new();
        let after = store.upsert_exchange(&update).await.unwrap();

        assert!(!after.enabled);
        assert_eq!(after.api_key, stored.api_key);
        assert_eq!(
            store.vault.decrypt_storage(&after.api_key, None).unwrap(),
            "ABC"
        );
    }

    #[tokio::test]
    async fn nonempty_secret_rotates_ciphertext() {
        let (store, _f) = open_temp_store();
        let user_id = seed_user(&store).await;
        let cfg = sample_exchange(user_id);
        let before = store.upsert_exchange(&cfg).await.unwrap();

        let mut update = cfg.clone();
        update.api_key = "NEW".into();
        update.secret_key = String::new();
        let after = store.upsert_exchange(&update).await.unwrap();

        assert_ne!(after.api_key, before.api_key);
        assert_eq!(
            store.vault.decrypt_storage(&after.api_key, None).unwrap(),
            "NEW"
        );
        assert_eq!(after.secret_key, before.secret_key);
    }

    #[tokio::test]
    async fn model_config_round_trips() {
        let (store, _f) = open_temp_store();
        let user_id = seed_user(&store).await;
        let cfg = ModelConfig {
            id: Uuid::new_v4(),
            user_id,
            provider: "deepseek".into(),
            enabled: true,
            api_key: "sk-123".into(),
            base_url: "https://api.deepseek.com".into(),
            model_name: "deepseek-chat".into(),
        };
        let stored = store.upsert_model(&cfg).await.unwrap();
        assert!(stored.api_key.starts_with("enc:v1:"));

        let listed = store.list_models(user_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].provider, "deepseek");
    }

    #[tokio::test]
    async fn one_active_strategy_per_user() {
        let (store, _f) = open_temp_store();
        let user_id = seed_user(&store).await;
        let a = sample_strategy(user_id);
        let b = sample_strategy(user_id);
        store.upsert_strategy(&a).await.unwrap();
        store.upsert_strategy(&b).await.unwrap();

        let active = store.active_strategy(user_id).await.unwrap().unwrap();
        assert_eq!(active.id, b.id);
        let all = store.list_strategies(user_id).await.unwrap();
        assert_eq!(all.iter().filter(|s| s.is_active).count(), 1);
    }

    #[tokio::test]
    async fn leverage_bounds_rejected() {
        let (store, _f) = open_temp_store();
        let user_id = seed_user(&store).await;
        let mut s = sample_strategy(user_id);
        s.altcoin_max_leverage = 80.0;
        assert!(store.upsert_strategy(&s).await.is_err());
        let mut s2 = sample_strategy(user_id);
        s2.btc_eth_max_leverage = 0.5;
        assert!(store.upsert_strategy(&s2).await.is_err());
    }
}
