//! Exchange Adapter
//! Mission: One trading surface over every supported venue

mod aster;
mod binance;
pub mod mock;

pub use aster::AsterAdapter;
pub use binance::BinanceAdapter;
pub use mock::MockExchange;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};
use crate::models::{ExchangeConfig, OrderSide, OrderStatus, PositionSide, TradeAction};

/// Account balance in quote currency.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub available: f64,
    pub unrealized_pnl: f64,
}

/// An open position as the venue reports it.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub liquidation_price: f64,
}

/// Acknowledgement for an order-placing call.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub fill_price: f64,
    pub status: OrderStatus,
}

/// A fill from the venue's trade feed. `action` carries the venue's own
/// open/close classification; the position builder never re-guesses it.
#[derive(Debug, Clone)]
pub struct VenueTrade {
    pub trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub action: TradeAction,
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    pub ts: i64,
    pub is_maker: bool,
}

/// A resting order, including trigger orders.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub status: OrderStatus,
    pub reduce_only: bool,
}

/// Uniform trading surface. Quantities are base-currency units at this
/// boundary; adapters convert to the venue's native representation and
/// round down to the permitted step. Implementations must tolerate
/// concurrent calls from the executor and the reconcilers.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> &str;

    /// True when the venue nets longs and shorts into a single exposure
    /// per symbol. Drives the validator's position-mode check.
    fn one_way_mode(&self) -> bool {
        false
    }

    async fn get_balance(&self) -> CoreResult<AccountBalance>;
    async fn get_positions(&self) -> CoreResult<Vec<VenuePosition>>;
    async fn get_market_price(&self, symbol: &str) -> CoreResult<f64>;

    /// Idempotent; "already set" counts as success.
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> CoreResult<()>;
    /// Idempotent; "has open position" is a soft failure and succeeds.
    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> CoreResult<()>;

    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck>;
    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck>;
    /// `qty = 0` closes the whole position on that side.
    async fn close_long(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck>;
    async fn close_short(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck>;
    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck>;

    /// Best-effort; succeeds even when nothing was cancelled.
    async fn cancel_all_orders(&self, symbol: &str) -> CoreResult<()>;
    async fn cancel_stop_orders(&self, symbol: &str) -> CoreResult<()>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> CoreResult<OrderStatus>;
    /// Oldest-first after adapter-side sort.
    async fn get_trades(&self, since_ms: i64, limit: usize) -> CoreResult<Vec<VenueTrade>>;
    async fn get_open_orders(&self, symbol: &str) -> CoreResult<Vec<VenueOrder>>;
}

/// Build the adapter for one (agent, venue) pair. Each agent gets its own
/// instance so rate-limit state and caches stay isolated.
pub fn build_adapter(
    http: reqwest::Client,
    cfg: &ExchangeConfig,
    cache_ttl: Duration,
) -> CoreResult<Arc<dyn ExchangeAdapter>> {
    if !cfg.enabled {
        return Err(CoreError::Config(format!(
            "exchange config {} is disabled",
            cfg.id
        )));
    }
    match cfg.venue.to_ascii_lowercase().as_str() {
        "binance" => Ok(Arc::new(BinanceAdapter::new(http, cfg, cache_ttl))),
        "aster" => Ok(Arc::new(AsterAdapter::new(http, cfg, cache_ttl))),
        "mock" => Ok(Arc::new(MockExchange::new())),
        other => Err(CoreError::Config(format!("unsupported venue: {other}"))),
    }
}

/// Canonical symbol form used across the core: uppercase, no separators
/// (`btc-usdt` -> `BTCUSDT`).
pub fn canonical_symbol(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Round a base-currency quantity down to the venue's step size.
pub fn round_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).floor() * step
}

/// Short-TTL balance/position cache shared by the venue adapters. Flushed
/// on every order action so the executor never reads stale state it just
/// changed.
pub(crate) struct AccountCache {
    ttl: Duration,
    balance: RwLock<Option<(Instant, AccountBalance)>>,
    positions: RwLock<Option<(Instant, Vec<VenuePosition>)>>,
}

impl AccountCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            balance: RwLock::new(None),
            positions: RwLock::new(None),
        }
    }

    pub(crate) fn balance(&self) -> Option<AccountBalance> {
        let guard = self.balance.read();
        match guard.as_ref() {
            Some((at, bal)) if at.elapsed() < self.ttl => Some(bal.clone()),
            _ => None,
        }
    }

    pub(crate) fn store_balance(&self, bal: &AccountBalance) {
        *self.balance.write() = Some((Instant::now(), bal.clone()));
    }

    pub(crate) fn positions(&self) -> Option<Vec<VenuePosition>> {
        let guard = self.positions.read();
        match guard.as_ref() {
            Some((at, pos)) if at.elapsed() < self.ttl => Some(pos.clone()),
            _ => None,
        }
    }

    pub(crate) fn store_positions(&self, pos: &[VenuePosition]) {
        *self.positions.write() = Some((Instant::now(), pos.to_vec()));
    }

    pub(crate) fn flush(&self) {
        *self.balance.write() = None;
        *self.positions.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_symbol_strips_separators() {
        assert_eq!(canonical_symbol("btc-usdt"), "BTCUSDT");
        assert_eq!(canonical_symbol("ETH_USDT"), "ETHUSDT");
        assert_eq!(canonical_symbol("sol/usdt"), "SOLUSDT");
        assert_eq!(canonical_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn step_rounding_floors() {
        assert!((round_to_step(0.0157, 0.001) - 0.015).abs() < 1e-12);
        assert!((round_to_step(1.0, 0.001) - 1.0).abs() < 1e-12);
        // no filter known: passthrough
        assert_eq!(round_to_step(0.1234, 0.0), 0.1234);
    }

    #[test]
    fn cache_expires_and_flushes() {
        let cache = AccountCache::new(Duration::from_millis(50));
        assert!(cache.balance().is_none());

        let bal = AccountBalance {
            total_equity: 100.0,
            available: 90.0,
            unrealized_pnl: 0.0,
        };
        cache.store_balance(&bal);
        assert_eq!(cache.balance(), Some(bal.clone()));

        cache.flush();
        assert!(cache.balance().is_none());

        cache.store_balance(&bal);
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.balance().is_none());
    }

    #[test]
    fn factory_rejects_unknown_and_disabled() {
        let http = reqwest::Client::new();
        let mut cfg = crate::models::ExchangeConfig {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            venue: "hollowex".into(),
            enabled: true,
            testnet: false,
            api_key: "k".into(),
            secret_key: "s".into(),
            passphrase: String::new(),
        };
        assert!(build_adapter(http.clone(), &cfg, Duration::from_secs(15)).is_err());

        cfg.venue = "binance".into();
        cfg.enabled = false;
        assert!(build_adapter(http.clone(), &cfg, Duration::from_secs(15)).is_err());

        cfg.enabled = true;
        assert!(build_adapter(http, &cfg, Duration::from_secs(15)).is_ok());
    }
}
