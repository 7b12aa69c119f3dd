//! Order Executor
//! Mission: Drive validated actions into the venue, intent rows as the
//! audit trail

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use crate::decision::{Action, ActionOp};
use crate::error::ErrorKind;
use crate::exchange::ExchangeAdapter;
use crate::models::{
    Agent, OrderIntent, OrderSide, OrderStatus, OrderType, PositionSide, TradeAction,
};
use crate::store::Store;

/// What one dispatch loop produced. `stop_agent` carries the first
/// AUTH/CONFIG error met, which the scheduler turns into a stop.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub intent_ids: Vec<Uuid>,
    pub stop_agent: Option<String>,
}

pub struct OrderExecutor {
    store: Store,
}

impl OrderExecutor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Dispatch actions strictly in list order. Adapter failures mark the
    /// intent REJECTED and move on; nothing is retried inside the tick
    /// and partial progress is the reconciler's to pick up.
    pub async fn execute(
        &self,
        agent: &Agent,
        adapter: &dyn ExchangeAdapter,
        actions: &[Action],
        equity: f64,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome::default();

        for action in actions {
            match action.op {
                ActionOp::Hold => continue,
                ActionOp::CancelAll => {
                    self.cancel_all(adapter, action).await;
                }
                ActionOp::AdjustStop | ActionOp::AdjustTp => {
                    self.adjust_triggers(adapter, action).await;
                }
                ActionOp::Open | ActionOp::Close => {
                    if let Some(stop) = self.dispatch_order(agent, adapter, action, equity, &mut outcome).await? {
                        outcome.stop_agent = Some(stop);
                        break;
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn cancel_all(&self, adapter: &dyn ExchangeAdapter, action: &Action) {
        let symbols: Vec<String> = if action.symbol.is_empty() {
            match adapter.get_positions().await {
                Ok(positions) => positions.into_iter().map(|p| p.symbol).collect(),
                Err(e) => {
                    warn!("cancel_all skipped, positions unavailable: {e}");
                    return;
                }
            }
        } else {
            vec![action.symbol.clone()]
        };
        for symbol in symbols {
            if let Err(e) = adapter.cancel_all_orders(&symbol).await {
                warn!(symbol, "cancel_all failed: {e}");
            }
        }
    }

    /// Replace the resting trigger orders on one side. Failures are
    /// logged; the position itself is untouched.
    async fn adjust_triggers(&self, adapter: &dyn ExchangeAdapter, action: &Action) {
        let symbol = &action.symbol;
        if let Err(e) = adapter.cancel_stop_orders(symbol).await {
            warn!(symbol, "stop cancel before adjust failed: {e}");
        }

        let qty = match adapter.get_positions().await {
            Ok(positions) => positions
                .iter()
                .find(|p| &p.symbol == symbol && p.side == action.side)
                .map(|p| p.qty)
                .unwrap_or(0.0),
            Err(e) => {
                warn!(symbol, "adjust skipped, positions unavailable: {e}");
                return;
            }
        };
        if qty <= 0.0 {
            return;
        }

        if let Some(stop) = action.stop {
            if let Err(e) = adapter.set_stop_loss(symbol, action.side, qty, stop).await {
                warn!(symbol, "stop adjust failed: {e}");
            }
        }
        if let Some(take) = action.take {
            if let Err(e) = adapter.set_take_profit(symbol, action.side, qty, take).await {
                warn!(symbol, "take adjust failed: {e}");
            }
        }
    }

    /// Returns Some(reason) when the error must stop the agent.
    async fn dispatch_order(
        &self,
        agent: &Agent,
        adapter: &dyn ExchangeAdapter,
        action: &Action,
        equity: f64,
        outcome: &mut ExecutionOutcome,
    ) -> Result<Option<String>> {
        let trade_action = match (action.op, action.side) {
            (ActionOp::Open, PositionSide::Short) => TradeAction::OpenShort,
            (ActionOp::Open, _) => TradeAction::OpenLong,
            (ActionOp::Close, PositionSide::Short) => TradeAction::CloseShort,
            (ActionOp::Close, _) => TradeAction::CloseLong,
            _ => unreachable!("dispatch_order only sees OPEN/CLOSE"),
        };
        let side = match trade_action {
            TradeAction::OpenLong | TradeAction::CloseShort => OrderSide::Buy,
            TradeAction::OpenShort | TradeAction::CloseLong => OrderSide::Sell,
        };
        let leverage = action.leverage.unwrap_or(1.0);

        // Resolve base quantity; qty_pct sizes against current equity.
        let qty = if let Some(q) = action.qty.filter(|q| *q > 0.0) {
            q
        } else if let Some(pct) = action.qty_pct.filter(|p| *p > 0.0) {
            let price = adapter
                .get_market_price(&action.symbol)
                .await
                .ok()
                .filter(|p| *p > 0.0);
            match price {
                Some(price) => equity * (pct / 100.0) * leverage / price,
                None if trade_action.is_open() => {
                    warn!(symbol = %action.symbol, "open skipped: no price for pct sizing");
                    return Ok(None);
                }
                None => 0.0, // close-all sentinel
            }
        } else {
            0.0 // close-all sentinel
        };

        let intent = OrderIntent {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            exchange_order_id: None,
            symbol: action.symbol.clone(),
            side,
            position_side: action.side,
            order_type: OrderType::Market,
            action: trade_action,
            qty,
            price: action.price,
            status: OrderStatus::Pending,
            error: None,
            created_ts: chrono::Utc::now().timestamp_millis(),
            filled_ts: None,
        };
        self.store.insert_intent(&intent).await?;
        outcome.intent_ids.push(intent.id);

        if trade_action.is_open() {
            // margin mode is idempotent and soft-fails with open positions
            if let Err(e) = adapter
                .set_margin_mode(&action.symbol, agent.is_cross_margin)
                .await
            {
                warn!(symbol = %action.symbol, "margin mode not set: {e}");
            }
        }

        let result = match trade_action {
            TradeAction::OpenLong => adapter.open_long(&action.symbol, qty, leverage).await,
            TradeAction::OpenShort => adapter.open_short(&action.symbol, qty, leverage).await,
            TradeAction::CloseLong => adapter.close_long(&action.symbol, qty).await,
            TradeAction::CloseShort => adapter.close_short(&action.symbol, qty).await,
        };

        match result {
            Ok(ack) => {
                let filled = ack.status == OrderStatus::Filled;
                self.store
                    .update_intent(
                        intent.id,
                        Some(&ack.order_id),
                        ack.status,
                        None,
                        filled.then(|| chrono::Utc::now().timestamp_millis()),
                    )
                    .await?;
                info!(
                    agent = %agent.name,
                    symbol = %action.symbol,
                    action = trade_action.as_str(),
                    order_id = %ack.order_id,
                    "order dispatched"
                );

                if trade_action.is_open() {
                    self.place_brackets(adapter, action, qty).await;
                }
                Ok(None)
            }
            Err(e) => {
                let summary = e.summary();
                self.store
                    .update_intent(intent.id, None, OrderStatus::Rejected, Some(&summary), None)
                    .await?;
                warn!(
                    agent = %agent.name,
                    symbol = %action.symbol,
                    action = trade_action.as_str(),
                    "order rejected: {summary}"
                );
                if matches!(e.kind(), ErrorKind::Auth | ErrorKind::Config) {
                    Ok(Some(summary))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Reduce-only brackets after a filled open. Their failure never
    /// rolls the position back.
    async fn place_brackets(&self, adapter: &dyn ExchangeAdapter, action: &Action, qty: f64) {
        if let Some(stop) = action.stop {
            if let Err(e) = adapter
                .set_stop_loss(&action.symbol, action.side, qty, stop)
                .await
            {
                warn!(symbol = %action.symbol, "stop-loss not placed: {e}");
            }
        }
        if let Some(take) = action.take {
            if let Err(e) = adapter
                .set_take_profit(&action.symbol, action.side, qty, take)
                .await
            {
                warn!(symbol = %action.symbol, "take-profit not placed: {e}");
            }
        }
    }
}
