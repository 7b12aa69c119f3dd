//! Persistent Store
//! Mission: Durable, user-scoped access to every entity with secrets
//! encrypted at rest

mod agents;
mod configs;
mod trading;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::StorageVault;
use crate::models::User;

/// SQLite-backed store. One connection guarded by an async mutex; every
/// statement goes through `prepare_cached`.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) vault: StorageVault,
}

impl Store {
    pub fn open(db_path: &str, vault: StorageVault) -> Result<Self> {
        let conn = Connection::open(db_path).context("open store db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vault,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                otp_seed TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS model_configs (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                api_key TEXT NOT NULL DEFAULT '',
                base_url TEXT NOT NULL DEFAULT '',
                model_name TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (user_id, id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS exchange_configs (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                venue TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                testnet INTEGER NOT NULL DEFAULT 0,
                api_key TEXT NOT NULL DEFAULT '',
                secret_key TEXT NOT NULL DEFAULT '',
                passphrase TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (user_id, id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                coin_sources TEXT NOT NULL,
                custom_coins TEXT NOT NULL,
                timeframes TEXT NOT NULL,
                primary_timeframe TEXT NOT NULL,
                kline_count INTEGER NOT NULL,
                candidate_limit INTEGER NOT NULL,
                btc_eth_max_leverage REAL NOT NULL,
                altcoin_max_leverage REAL NOT NULL,
                max_positions INTEGER NOT NULL,
                prompt_variant TEXT NOT NULL,
                overrides TEXT NOT NULL,
                PRIMARY KEY (user_id, id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                model_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                initial_balance REAL NOT NULL,
                scan_interval_minutes INTEGER NOT NULL,
                is_cross_margin INTEGER NOT NULL DEFAULT 1,
                custom_prompt TEXT NOT NULL DEFAULT '',
                override_base_prompt INTEGER NOT NULL DEFAULT 0,
                is_running INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_agents_user ON agents(user_id);

            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                system_prompt TEXT NOT NULL,
                user_prompt TEXT NOT NULL,
                raw_response TEXT NOT NULL,
                actions_json TEXT NOT NULL,
                order_ids TEXT NOT NULL,
                note TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_agent_ts ON decisions(agent_id, ts DESC);

            CREATE TABLE IF NOT EXISTS order_intents (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                exchange_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                position_side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                action TEXT NOT NULL,
                qty REAL NOT NULL,
                price REAL,
                status TEXT NOT NULL,
                error TEXT,
                created_ts INTEGER NOT NULL,
                filled_ts INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_intents_agent_ts ON order_intents(agent_id, created_ts DESC);

            CREATE TABLE IF NOT EXISTS fills (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                exchange_config_id TEXT NOT NULL,
                intent_id TEXT,
                exchange_trade_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                position_side TEXT NOT NULL,
                action TEXT NOT NULL,
                price REAL NOT NULL,
                qty REAL NOT NULL,
                commission REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                ts INTEGER NOT NULL,
                is_maker INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_fills_exchange_trade
                ON fills(exchange_config_id, exchange_trade_id);
            CREATE INDEX IF NOT EXISTS idx_fills_agent_ts ON fills(agent_id, ts ASC);

            CREATE TABLE IF NOT EXISTS positions (
                agent_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                avg_entry_price REAL NOT NULL,
                realized_pnl_accum REAL NOT NULL,
                is_open INTEGER NOT NULL DEFAULT 1,
                last_update_ts INTEGER NOT NULL,
                PRIMARY KEY (agent_id, symbol, side)
            );

            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                total_equity REAL NOT NULL,
                balance REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                position_count INTEGER NOT NULL,
                margin_used_pct REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_agent_ts ON equity_snapshots(agent_id, ts ASC);",
        )
        .context("init store schema")?;
        Ok(())
    }

    pub async fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, username, password_hash, otp_seed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                user.id.to_string(),
                user.username,
                user.password_hash,
                user.otp_seed,
                user.created_at.to_rfc3339(),
            ],
        )
        .context("insert user")?;
        Ok(())
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, username, password_hash, otp_seed, created_at FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query(rusqlite::params![id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(User {
            id: parse_uuid(&row.get::<_, String>(0)?)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            otp_seed: row.get(3)?,
            created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        }))
    }

    /// Checkpoint WAL on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").ok();
        Ok(())
    }
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("bad uuid in store: {s}"))
}

pub(crate) fn parse_rfc3339(s: &str) -> Result<chrono::DateTime<Utc>> {
    Ok(chrono::DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in store: {s}"))?
        .with_timezone(&Utc))
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
