//! Deterministic in-memory venue for tests.
//!
//! Market orders fill instantly at the scripted price, every fill lands
//! in the trade feed, and helpers can simulate venue-side events (manual
//! closes, scripted failures) that the reconciler must absorb.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    AccountBalance, ExchangeAdapter, OrderAck, VenueOrder, VenuePosition, VenueTrade,
};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::models::{OrderSide, OrderStatus, PositionSide, TradeAction};

#[derive(Default)]
struct Inner {
    prices: HashMap<String, f64>,
    balance: f64,
    positions: HashMap<(String, PositionSide), VenuePosition>,
    trades: Vec<VenueTrade>,
    open_orders: Vec<VenueOrder>,
    next_order_id: u64,
    next_trade_id: u64,
    clock_ms: i64,
    fail_next: Option<(ErrorKind, String)>,
    calls: Vec<String>,
}

pub struct MockExchange {
    inner: Mutex<Inner>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                balance: 10_000.0,
                // strictly monotonic event clock anchored to wall time
                clock_ms: chrono::Utc::now().timestamp_millis(),
                ..Inner::default()
            }),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.inner.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: f64) {
        self.inner.lock().balance = balance;
    }

    /// Arrange for the next adapter call to fail with the given kind.
    pub fn fail_next(&self, kind: ErrorKind, msg: &str) {
        self.inner.lock().fail_next = Some((kind, msg.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn trade_count(&self) -> usize {
        self.inner.lock().trades.len()
    }

    /// Simulate the user closing a position directly on the venue. The
    /// close lands in the trade feed like any other fill.
    pub fn external_close(&self, symbol: &str, side: PositionSide) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.positions.remove(&(symbol.to_string(), side)) else {
            return;
        };
        let price = inner.prices.get(symbol).copied().unwrap_or(pos.mark_price);
        let (order_side, action, pnl_sign) = match side {
            PositionSide::Short => (OrderSide::Buy, TradeAction::CloseShort, -1.0),
            _ => (OrderSide::Sell, TradeAction::CloseLong, 1.0),
        };
        let realized = (price - pos.entry_price) * pos.qty * pnl_sign;
        push_trade(
            &mut inner,
            symbol,
            order_side,
            side,
            action,
            price,
            pos.qty,
            realized,
        );
        inner.balance += realized;
    }

    /// Drop a position without a trade feed entry. Exercises the
    /// synthetic-fill path in position sync.
    pub fn external_close_silent(&self, symbol: &str, side: PositionSide) {
        self.inner
            .lock()
            .positions
            .remove(&(symbol.to_string(), side));
    }

    fn take_failure(&self) -> Option<CoreError> {
        let (kind, msg) = self.inner.lock().fail_next.take()?;
        Some(match kind {
            ErrorKind::Auth => CoreError::Auth(msg),
            ErrorKind::RateLimit => CoreError::RateLimit(msg),
            ErrorKind::Timeout => CoreError::Timeout(msg),
            ErrorKind::Config => CoreError::Config(msg),
            ErrorKind::Validation => CoreError::validation("scripted", msg),
            ErrorKind::Provider => CoreError::Provider(msg),
            ErrorKind::TransientIo => CoreError::TransientIo(msg),
            ErrorKind::Fatal => CoreError::Fatal(msg),
        })
    }

    fn record(&self, call: &str) -> CoreResult<()> {
        self.inner.lock().calls.push(call.to_string());
        match self.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn price_of(&self, symbol: &str) -> f64 {
        self.inner.lock().prices.get(symbol).copied().unwrap_or(100.0)
    }

    fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        leverage: f64,
    ) -> CoreResult<OrderAck> {
        if qty <= 0.0 {
            return Err(CoreError::validation("zero_qty", format!("{symbol} qty {qty}")));
        }
        let price = self.price_of(symbol);
        let mut inner = self.inner.lock();

        let key = (symbol.to_string(), side);
        let entry = inner.positions.entry(key).or_insert(VenuePosition {
            symbol: symbol.to_string(),
            side,
            qty: 0.0,
            entry_price: 0.0,
            mark_price: price,
            unrealized_pnl: 0.0,
            leverage,
            liquidation_price: 0.0,
        });
        let total = entry.qty + qty;
        entry.entry_price = (entry.entry_price * entry.qty + price * qty) / total;
        entry.qty = total;
        entry.mark_price = price;
        entry.leverage = leverage;

        let (order_side, action) = match side {
            PositionSide::Short => (OrderSide::Sell, TradeAction::OpenShort),
            _ => (OrderSide::Buy, TradeAction::OpenLong),
        };
        push_trade(&mut inner, symbol, order_side, side, action, price, qty, 0.0);

        let order_id = next_order_id(&mut inner);
        Ok(OrderAck {
            order_id,
            fill_price: price,
            status: OrderStatus::Filled,
        })
    }

    fn close(&self, symbol: &str, side: PositionSide, qty: f64) -> CoreResult<OrderAck> {
        let price = self.price_of(symbol);
        let mut inner = self.inner.lock();

        let key = (symbol.to_string(), side);
        let Some(pos) = inner.positions.get(&key).cloned() else {
            return Err(CoreError::validation(
                "no_position",
                format!("no open {} on {symbol}", side.as_str()),
            ));
        };

        let close_qty = if qty <= 0.0 { pos.qty } else { qty.min(pos.qty) };
        let pnl_sign = if side == PositionSide::Short { -1.0 } else { 1.0 };
        let realized = (price - pos.entry_price) * close_qty * pnl_sign;

        if close_qty >= pos.qty {
            inner.positions.remove(&key);
        } else if let Some(p) = inner.positions.get_mut(&key) {
            p.qty -= close_qty;
        }
        inner.balance += realized;

        let (order_side, action) = match side {
            PositionSide::Short => (OrderSide::Buy, TradeAction::CloseShort),
            _ => (OrderSide::Sell, TradeAction::CloseLong),
        };
        push_trade(
            &mut inner, symbol, order_side, side, action, price, close_qty, realized,
        );

        let order_id = next_order_id(&mut inner);
        Ok(OrderAck {
            order_id,
            fill_price: price,
            status: OrderStatus::Filled,
        })
    }
}

fn next_order_id(inner: &mut Inner) -> String {
    inner.next_order_id += 1;
    format!("mock-{}", inner.next_order_id)
}

#[allow(clippy::too_many_arguments)]
fn push_trade(
    inner: &mut Inner,
    symbol: &str,
    side: OrderSide,
    position_side: PositionSide,
    action: TradeAction,
    price: f64,
    qty: f64,
    realized_pnl: f64,
) {
    inner.next_trade_id += 1;
    inner.clock_ms += 1;
    let trade = VenueTrade {
        trade_id: format!("t-{}", inner.next_trade_id),
        symbol: symbol.to_string(),
        side,
        position_side,
        action,
        price,
        qty,
        commission: price * qty * 0.0004,
        realized_pnl,
        ts: inner.clock_ms,
        is_maker: false,
    };
    inner.trades.push(trade);
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn venue(&self) -> &str {
        "mock"
    }

    async fn get_balance(&self) -> CoreResult<AccountBalance> {
        self.record("get_balance")?;
        let inner = self.inner.lock();
        let unrealized: f64 = inner.positions.values().map(|p| p.unrealized_pnl).sum();
        Ok(AccountBalance {
            total_equity: inner.balance + unrealized,
            available: inner.balance,
            unrealized_pnl: unrealized,
        })
    }

    async fn get_positions(&self) -> CoreResult<Vec<VenuePosition>> {
        self.record("get_positions")?;
        let mut out: Vec<VenuePosition> = self.inner.lock().positions.values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn get_market_price(&self, symbol: &str) -> CoreResult<f64> {
        self.record("get_market_price")?;
        Ok(self.price_of(symbol))
    }

    async fn set_leverage(&self, symbol: &str, _leverage: f64) -> CoreResult<()> {
        self.record(&format!("set_leverage:{symbol}"))
    }

    async fn set_margin_mode(&self, symbol: &str, _cross: bool) -> CoreResult<()> {
        self.record(&format!("set_margin_mode:{symbol}"))
    }

    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck> {
        self.record(&format!("open_long:{symbol}"))?;
        self.open(symbol, PositionSide::Long, qty, leverage)
    }

    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck> {
        self.record(&format!("open_short:{symbol}"))?;
        self.open(symbol, PositionSide::Short, qty, leverage)
    }

    async fn close_long(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck> {
        self.record(&format!("close_long:{symbol}"))?;
        self.close(symbol, PositionSide::Long, qty)
    }

    async fn close_short(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck> {
        self.record(&format!("close_short:{symbol}"))?;
        self.close(symbol, PositionSide::Short, qty)
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck> {
        self.record(&format!("set_stop_loss:{symbol}"))?;
        let mut inner = self.inner.lock();
        let order_id = next_order_id(&mut inner);
        inner.open_orders.push(VenueOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side: if side == PositionSide::Short {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            order_type: "STOP_MARKET".into(),
            qty,
            price: None,
            trigger_price: Some(trigger_price),
            status: OrderStatus::New,
            reduce_only: true,
        });
        Ok(OrderAck {
            order_id,
            fill_price: trigger_price,
            status: OrderStatus::New,
        })
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck> {
        self.record(&format!("set_take_profit:{symbol}"))?;
        let mut inner = self.inner.lock();
        let order_id = next_order_id(&mut inner);
        inner.open_orders.push(VenueOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side: if side == PositionSide::Short {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            order_type: "TAKE_PROFIT_MARKET".into(),
            qty,
            price: None,
            trigger_price: Some(trigger_price),
            status: OrderStatus::New,
            reduce_only: true,
        });
        Ok(OrderAck {
            order_id,
            fill_price: trigger_price,
            status: OrderStatus::New,
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> CoreResult<()> {
        self.record(&format!("cancel_all_orders:{symbol}"))?;
        self.inner.lock().open_orders.retain(|o| o.symbol != symbol);
        Ok(())
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> CoreResult<()> {
        self.record(&format!("cancel_stop_orders:{symbol}"))?;
        self.inner.lock().open_orders.retain(|o| {
            o.symbol != symbol
                || (o.order_type != "STOP_MARKET" && o.order_type != "TAKE_PROFIT_MARKET")
        });
        Ok(())
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> CoreResult<OrderStatus> {
        self.record("get_order_status")?;
        let inner = self.inner.lock();
        Ok(inner
            .open_orders
            .iter()
            .find(|o| o.order_id == order_id)
            .map(|o| o.status)
            .unwrap_or(OrderStatus::Filled))
    }

    async fn get_trades(&self, since_ms: i64, limit: usize) -> CoreResult<Vec<VenueTrade>> {
        self.record("get_trades")?;
        let inner = self.inner.lock();
        let mut out: Vec<VenueTrade> = inner
            .trades
            .iter()
            .filter(|t| t.ts >= since_ms)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.ts.cmp(&b.ts));
        out.truncate(limit.max(1));
        Ok(out)
    }

    async fn get_open_orders(&self, symbol: &str) -> CoreResult<Vec<VenueOrder>> {
        self.record("get_open_orders")?;
        Ok(self
            .inner
            .lock()
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }
}
