//! Decisions, order intents, fills, positions and equity snapshots.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_uuid, Store};
use crate::models::{
    Decision, EquitySnapshot, Fill, OrderIntent, OrderSide, OrderStatus, OrderType, Position,
    PositionSide, TradeAction,
};

fn intent_from_row(row: &Row<'_>) -> Result<OrderIntent> {
    Ok(OrderIntent {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        agent_id: parse_uuid(&row.get::<_, String>(1)?)?,
        exchange_order_id: row.get(2)?,
        symbol: row.get(3)?,
        side: OrderSide::parse(&row.get::<_, String>(4)?).context("bad side in store")?,
        position_side: PositionSide::parse(&row.get::<_, String>(5)?)
            .context("bad position side in store")?,
        order_type: OrderType::parse(&row.get::<_, String>(6)?)
            .context("bad order type in store")?,
        action: TradeAction::parse(&row.get::<_, String>(7)?).context("bad action in store")?,
        qty: row.get(8)?,
        price: row.get(9)?,
        status: OrderStatus::parse(&row.get::<_, String>(10)?)
            .context("bad status in store")?,
        error: row.get(11)?,
        created_ts: row.get(12)?,
        filled_ts: row.get(13)?,
    })
}

fn fill_from_row(row: &Row<'_>) -> Result<Fill> {
    let intent_id: Option<String> = row.get(3)?;
    Ok(Fill {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        agent_id: parse_uuid(&row.get::<_, String>(1)?)?,
        exchange_config_id: parse_uuid(&row.get::<_, String>(2)?)?,
        intent_id: intent_id.as_deref().map(parse_uuid).transpose()?,
        exchange_trade_id: row.get(4)?,
        symbol: row.get(5)?,
        side: OrderSide::parse(&row.get::<_, String>(6)?).context("bad side in store")?,
        position_side: PositionSide::parse(&row.get::<_, String>(7)?)
            .context("bad position side in store")?,
        action: TradeAction::parse(&row.get::<_, String>(8)?).context("bad action in store")?,
        price: row.get(9)?,
        qty: row.get(10)?,
        commission: row.get(11)?,
        realized_pnl: row.get(12)?,
        ts: row.get(13)?,
        is_maker: row.get::<_, i64>(14)? != 0,
    })
}

fn position_from_row(row: &Row<'_>) -> Result<Position> {
    Ok(Position {
        agent_id: parse_uuid(&row.get::<_, String>(0)?)?,
        symbol: row.get(1)?,
        side: PositionSide::parse(&row.get::<_, String>(2)?)
            .context("bad position side in store")?,
        qty: row.get(3)?,
        avg_entry_price: row.get(4)?,
        realized_pnl_accum: row.get(5)?,
        is_open: row.get::<_, i64>(6)? != 0,
        last_update_ts: row.get(7)?,
    })
}

const FILL_COLS: &str = "id, agent_id, exchange_config_id, intent_id, exchange_trade_id, \
     symbol, side, position_side, action, price, qty, commission, realized_pnl, ts, is_maker";

const INTENT_COLS: &str = "id, agent_id, exchange_order_id, symbol, side, position_side, \
     order_type, action, qty, price, status, error, created_ts, filled_ts";

const POSITION_COLS: &str =
    "agent_id, symbol, side, qty, avg_entry_price, realized_pnl_accum, is_open, last_update_ts";

impl Store {
    pub async fn insert_decision(&self, d: &Decision) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO decisions
                (id, agent_id, ts, system_prompt, user_prompt, raw_response, actions_json,
                 order_ids, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                d.id.to_string(),
                d.agent_id.to_string(),
                d.ts,
                d.system_prompt,
                d.user_prompt,
                d.raw_response,
                d.actions_json,
                serde_json::to_string(
                    &d.order_ids.iter().map(|o| o.to_string()).collect::<Vec<_>>()
                )?,
                d.note,
            ],
        )
        .context("insert decision")?;
        Ok(())
    }

    /// Newest-first (API list) or oldest-first (chart feed).
    pub async fn decisions(
        &self,
        agent_id: Uuid,
        n: usize,
        newest_first: bool,
    ) -> Result<Vec<Decision>> {
        let n = n.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let order = if newest_first { "DESC" } else { "ASC" };
        // newest-first takes the last n; oldest-first takes the last n then re-sorts
        let sql = format!(
            "SELECT id, agent_id, ts, system_prompt, user_prompt, raw_response, actions_json,
                    order_ids, note
             FROM (SELECT * FROM decisions WHERE agent_id = ?1 ORDER BY ts DESC LIMIT ?2)
             ORDER BY ts {order}"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![agent_id.to_string(), n])?;
        while let Some(row) = rows.next()? {
            let order_ids: Vec<String> = serde_json::from_str(&row.get::<_, String>(7)?)?;
            out.push(Decision {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                agent_id: parse_uuid(&row.get::<_, String>(1)?)?,
                ts: row.get(2)?,
                system_prompt: row.get(3)?,
                user_prompt: row.get(4)?,
                raw_response: row.get(5)?,
                actions_json: row.get(6)?,
                order_ids: order_ids
                    .iter()
                    .map(|s| parse_uuid(s))
                    .collect::<Result<Vec<_>>>()?,
                note: row.get(8)?,
            });
        }
        Ok(out)
    }

    /// Drop decision rows beyond the newest `keep` for one agent.
    pub async fn prune_decisions(&self, agent_id: Uuid, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM decisions WHERE agent_id = ?1 AND id NOT IN
                (SELECT id FROM decisions WHERE agent_id = ?1 ORDER BY ts DESC LIMIT ?2)",
            params![agent_id.to_string(), keep as i64],
        )?;
        Ok(n)
    }

    pub async fn insert_intent(&self, intent: &OrderIntent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO order_intents
                (id, agent_id, exchange_order_id, symbol, side, position_side, order_type,
                 action, qty, price, status, error, created_ts, filled_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                intent.id.to_string(),
                intent.agent_id.to_string(),
                intent.exchange_order_id,
                intent.symbol,
                intent.side.as_str(),
                intent.position_side.as_str(),
                intent.order_type.as_str(),
                intent.action.as_str(),
                intent.qty,
                intent.price,
                intent.status.as_str(),
                intent.error,
                intent.created_ts,
                intent.filled_ts,
            ],
        )
        .context("insert order intent")?;
        Ok(())
    }

    pub async fn update_intent(
        &self,
        id: Uuid,
        exchange_order_id: Option<&str>,
        status: OrderStatus,
        error: Option<&str>,
        filled_ts: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE order_intents SET
                exchange_order_id = COALESCE(?2, exchange_order_id),
                status = ?3,
                error = ?4,
                filled_ts = COALESCE(?5, filled_ts)
             WHERE id = ?1",
            params![
                id.to_string(),
                exchange_order_id,
                status.as_str(),
                error,
                filled_ts,
            ],
        )?;
        Ok(())
    }

    pub async fn get_intent(&self, id: Uuid) -> Result<Option<OrderIntent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INTENT_COLS} FROM order_intents WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(intent_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn intents_for_agent(&self, agent_id: Uuid, n: usize) -> Result<Vec<OrderIntent>> {
        let n = n.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INTENT_COLS} FROM order_intents
             WHERE agent_id = ?1 ORDER BY created_ts DESC LIMIT ?2"
        ))?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![agent_id.to_string(), n])?;
        while let Some(row) = rows.next()? {
            out.push(intent_from_row(row)?);
        }
        Ok(out)
    }

    /// Latest intent-creation timestamp after a cutoff, used by shutdown
    /// assertions and tests.
    pub async fn intents_created_after(&self, agent_id: Uuid, ts: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_intents WHERE agent_id = ?1 AND created_ts > ?2",
            params![agent_id.to_string(), ts],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// True if the (exchange, trade id) pair is already recorded.
    pub async fn fill_exists(
        &self,
        exchange_config_id: Uuid,
        exchange_trade_id: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM fills WHERE exchange_config_id = ?1 AND exchange_trade_id = ?2",
                params![exchange_config_id.to_string(), exchange_trade_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a fill and the positions it produced in one transaction.
    /// Returns false (and writes nothing) when the fill was already known,
    /// so double ingestion collapses to a no-op.
    pub async fn apply_fill(&self, fill: &Fill, positions: &[Position]) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO fills ({FILL_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                fill.id.to_string(),
                fill.agent_id.to_string(),
                fill.exchange_config_id.to_string(),
                fill.intent_id.map(|i| i.to_string()),
                fill.exchange_trade_id,
                fill.symbol,
                fill.side.as_str(),
                fill.position_side.as_str(),
                fill.action.as_str(),
                fill.price,
                fill.qty,
                fill.commission,
                fill.realized_pnl,
                fill.ts,
                fill.is_maker as i64,
            ],
        )?;

        if inserted == 0 {
            // already ingested; leave positions untouched
            return Ok(false);
        }

        for pos in positions {
            tx.execute(
                "INSERT INTO positions
                    (agent_id, symbol, side, qty, avg_entry_price, realized_pnl_accum,
                     is_open, last_update_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(agent_id, symbol, side) DO UPDATE SET
                    qty = excluded.qty,
                    avg_entry_price = excluded.avg_entry_price,
                    realized_pnl_accum = excluded.realized_pnl_accum,
                    is_open = excluded.is_open,
                    last_update_ts = excluded.last_update_ts",
                params![
                    pos.agent_id.to_string(),
                    pos.symbol,
                    pos.side.as_str(),
                    pos.qty,
                    pos.avg_entry_price,
                    pos.realized_pnl_accum,
                    pos.is_open as i64,
                    pos.last_update_ts,
                ],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Fills for one agent at or after `since`, ascending by timestamp.
    pub async fn fills_since(&self, agent_id: Uuid, since: i64) -> Result<Vec<Fill>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FILL_COLS} FROM fills
             WHERE agent_id = ?1 AND ts >= ?2 ORDER BY ts ASC, exchange_trade_id ASC"
        ))?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![agent_id.to_string(), since])?;
        while let Some(row) = rows.next()? {
            out.push(fill_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn latest_fill_ts(&self, agent_id: Uuid) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(ts) FROM fills WHERE agent_id = ?1",
            params![agent_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    pub async fn get_position(
        &self,
        agent_id: Uuid,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE agent_id = ?1 AND symbol = ?2 AND side = ?3"
        ))?;
        let mut rows = stmt.query(params![agent_id.to_string(), symbol, side.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(position_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn open_positions(&self, agent_id: Uuid) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE agent_id = ?1 AND is_open = 1 ORDER BY symbol ASC, side ASC"
        ))?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![agent_id.to_string()])?;
        while let Some(row) = rows.next()? {
            out.push(position_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn upsert_position(&self, pos: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions
                (agent_id, symbol, side, qty, avg_entry_price, realized_pnl_accum,
                 is_open, last_update_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(agent_id, symbol, side) DO UPDATE SET
                qty = excluded.qty,
                avg_entry_price = excluded.avg_entry_price,
                realized_pnl_accum = excluded.realized_pnl_accum,
                is_open = excluded.is_open,
                last_update_ts = excluded.last_update_ts",
            params![
                pos.agent_id.to_string(),
                pos.symbol,
                pos.side.as_str(),
                pos.qty,
                pos.avg_entry_price,
                pos.realized_pnl_accum,
                pos.is_open as i64,
                pos.last_update_ts,
            ],
        )?;
        Ok(())
    }

    pub async fn insert_equity_snapshot(&self, snap: &EquitySnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO equity_snapshots
                (id, agent_id, ts, total_equity, balance, unrealized_pnl, position_count,
                 margin_used_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snap.id.to_string(),
                snap.agent_id.to_string(),
                snap.ts,
                snap.total_equity,
                snap.balance,
                snap.unrealized_pnl,
                snap.position_count as i64,
                snap.margin_used_pct,
            ],
        )
        .context("insert equity snapshot")?;
        Ok(())
    }

    /// Latest `n` snapshots, oldest-first (the chart feed order).
    pub async fn equity_series(&self, agent_id: Uuid, n: usize) -> Result<Vec<EquitySnapshot>> {
        let n = n.clamp(1, 20_000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, agent_id, ts, total_equity, balance, unrealized_pnl, position_count,
                    margin_used_pct
             FROM (SELECT * FROM equity_snapshots WHERE agent_id = ?1 ORDER BY ts DESC LIMIT ?2)
             ORDER BY ts ASC",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![agent_id.to_string(), n])?;
        while let Some(row) = rows.next()? {
            out.push(EquitySnapshot {
                id: parse_uuid(&row.get::<_, String>(0)?)?,
                agent_id: parse_uuid(&row.get::<_, String>(1)?)?,
                ts: row.get(2)?,
                total_equity: row.get(3)?,
                balance: row.get(4)?,
                unrealized_pnl: row.get(5)?,
                position_count: row.get::<_, i64>(6)? as usize,
                margin_used_pct: row.get(7)?,
            });
        }
        Ok(out)
    }

    pub async fn latest_equity(&self, agent_id: Uuid) -> Result<Option<EquitySnapshot>> {
        Ok(self.equity_series(agent_id, 1).await?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::models::*;
    use crate::store::now_ms;
    use uuid::Uuid;

    fn sample_fill(agent_id: Uuid, exchange_id: Uuid, trade_id: &str, ts: i64) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            agent_id,
            exchange_config_id: exchange_id,
            intent_id: None,
            exchange_trade_id: trade_id.into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            position_side: PositionSide::Long,
            action: TradeAction::OpenLong,
            price: 50_000.0,
            qty: 0.01,
            commission: 0.05,
            realized_pnl: 0.0,
            ts,
            is_maker: false,
        }
    }

    fn sample_position(agent_id: Uuid, qty: f64) -> Position {
        Position {
            agent_id,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            qty,
            avg_entry_price: 50_000.0,
            realized_pnl_accum: 0.0,
            is_open: qty > 0.0,
            last_update_ts: now_ms(),
        }
    }

    #[tokio::test]
    async fn duplicate_fill_collapses() {
        let (store, _f) = open_temp_store();
        let agent_id = Uuid::new_v4();
        let exchange_id = Uuid::new_v4();

        let fill = sample_fill(agent_id, exchange_id, "t-1", now_ms());
        let pos = sample_position(agent_id, 0.01);
        assert!(store.apply_fill(&fill, &[pos.clone()]).await.unwrap());

        // same trade id, different row id: must be ignored entirely
        let mut dup = sample_fill(agent_id, exchange_id, "t-1", now_ms());
        dup.qty = 99.0;
        let bigger = sample_position(agent_id, 99.0);
        assert!(!store.apply_fill(&dup, &[bigger]).await.unwrap());

        let fills = store.fills_since(agent_id, 0).await.unwrap();
        assert_eq!(fills.len(), 1);
        let stored = store
            .get_position(agent_id, "BTCUSDT", PositionSide::Long)
            .await
            .unwrap()
            .unwrap();
        assert!((stored.qty - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn fills_since_is_ordered_ascending() {
        let (store, _f) = open_temp_store();
        let agent_id = Uuid::new_v4();
        let exchange_id = Uuid::new_v4();
        let base = now_ms();
        for (i, off) in [(1, 200i64), (2, 0), (3, 100)] {
            let fill = sample_fill(agent_id, exchange_id, &format!("t-{i}"), base + off);
            store.apply_fill(&fill, &[]).await.unwrap();
        }
        let fills = store.fills_since(agent_id, 0).await.unwrap();
        let ts: Vec<i64> = fills.iter().map(|f| f.ts).collect();
        assert_eq!(ts, vec![base, base + 100, base + 200]);
    }

    #[tokio::test]
    async fn decision_ordering_both_ways() {
        let (store, _f) = open_temp_store();
        let agent_id = Uuid::new_v4();
        let base = now_ms();
        for i in 0..3i64 {
            let d = Decision {
                id: Uuid::new_v4(),
                agent_id,
                ts: base + i,
                system_prompt: "s".into(),
                user_prompt: "u".into(),
                raw_response: String::new(),
                actions_json: "[]".into(),
                order_ids: vec![],
                note: "NO_OP".into(),
            };
            store.insert_decision(&d).await.unwrap();
        }

        let newest = store.decisions(agent_id, 2, true).await.unwrap();
        assert_eq!(newest[0].ts, base + 2);
        let oldest = store.decisions(agent_id, 2, false).await.unwrap();
        assert_eq!(oldest[0].ts, base + 1);
        assert_eq!(oldest[1].ts, base + 2);
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let (store, _f) = open_temp_store();
        let agent_id = Uuid::new_v4();
        let base = now_ms();
        for i in 0..10i64 {
            let d = Decision {
                id: Uuid::new_v4(),
                agent_id,
                ts: base + i,
                system_prompt: String::new(),
                user_prompt: String::new(),
                raw_response: String::new(),
                actions_json: "[]".into(),
                order_ids: vec![],
                note: "OK".into(),
            };
            store.insert_decision(&d).await.unwrap();
        }
        let removed = store.prune_decisions(agent_id, 4).await.unwrap();
        assert_eq!(removed, 6);
        let left = store.decisions(agent_id, 100, true).await.unwrap();
        assert_eq!(left.len(), 4);
        assert_eq!(left[0].ts, base + 9);
    }

    #[tokio::test]
    async fn equity_series_oldest_first() {
        let (store, _f) = open_temp_store();
        let agent_id = Uuid::new_v4();
        let base = now_ms();
        for i in 0..5i64 {
            let snap = EquitySnapshot {
                id: Uuid::new_v4(),
                agent_id,
                ts: base + i,
                total_equity: 1000.0 + i as f64,
                balance: 900.0,
                unrealized_pnl: 0.0,
                position_count: 0,
                margin_used_pct: 0.0,
            };
            store.insert_equity_snapshot(&snap).await.unwrap();
        }
        let series = store.equity_series(agent_id, 3).await.unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].ts, base + 2);
        assert_eq!(series[2].ts, base + 4);
        assert_eq!(
            store.latest_equity(agent_id).await.unwrap().unwrap().ts,
            base + 4
        );
    }

    #[tokio::test]
    async fn intent_lifecycle() {
        let (store, _f) = open_temp_store();
        let agent_id = Uuid::new_v4();
        let intent = OrderIntent {
            id: Uuid::new_v4(),
            agent_id,
            exchange_order_id: None,
            symbol: "ETHUSDT".into(),
            side: OrderSide::Buy,
            position_side: PositionSide::Long,
            order_type: OrderType::Market,
            action: TradeAction::OpenLong,
            qty: 0.5,
            price: None,
            status: OrderStatus::Pending,
            error: None,
            created_ts: now_ms(),
            filled_ts: None,
        };
        store.insert_intent(&intent).await.unwrap();

        store
            .update_intent(intent.id, Some("ex-77"), OrderStatus::Filled, None, Some(now_ms()))
            .await
            .unwrap();

        let loaded = store.get_intent(intent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.exchange_order_id.as_deref(), Some("ex-77"));
        assert!(loaded.filled_ts.is_some());
    }
}
