//! Aster adapter. The venue speaks the Binance futures wire format on its
//! own hosts, so this wraps the shared implementation with different base
//! URLs and its own venue tag.

use async_trait::async_trait;
use std::time::Duration;

use super::binance::BinanceAdapter;
use super::{
    AccountBalance, ExchangeAdapter, OrderAck, VenueOrder, VenuePosition, VenueTrade,
};
use crate::error::CoreResult;
use crate::models::{ExchangeConfig, OrderStatus, PositionSide};

const MAINNET_BASE: &str = "https://fapi.asterdex.com";
const TESTNET_BASE: &str = "https://testnet.asterdex.com";

pub struct AsterAdapter {
    inner: BinanceAdapter,
}

impl AsterAdapter {
    pub fn new(http: reqwest::Client, cfg: &ExchangeConfig, cache_ttl: Duration) -> Self {
        let base_url = if cfg.testnet {
            TESTNET_BASE.to_string()
        } else {
            MAINNET_BASE.to_string()
        };
        Self {
            inner: BinanceAdapter::with_base_url(http, cfg, cache_ttl, base_url, "aster"),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for AsterAdapter {
    fn venue(&self) -> &str {
        self.inner.venue()
    }

    async fn get_balance(&self) -> CoreResult<AccountBalance> {
        self.inner.get_balance().await
    }

    async fn get_positions(&self) -> CoreResult<Vec<VenuePosition>> {
        self.inner.get_positions().await
    }

    async fn get_market_price(&self, symbol: &str) -> CoreResult<f64> {
        self.inner.get_market_price(symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> CoreResult<()> {
        self.inner.set_leverage(symbol, leverage).await
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> CoreResult<()> {
        self.inner.set_margin_mode(symbol, cross).await
    }

    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck> {
        self.inner.open_long(symbol, qty, leverage).await
    }

    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck> {
        self.inner.open_short(symbol, qty, leverage).await
    }

    async fn close_long(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck> {
        self.inner.close_long(symbol, qty).await
    }

    async fn close_short(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck> {
        self.inner.close_short(symbol, qty).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck> {
        self.inner.set_stop_loss(symbol, side, qty, trigger_price).await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck> {
        self.inner
            .set_take_profit(symbol, side, qty, trigger_price)
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> CoreResult<()> {
        self.inner.cancel_all_orders(symbol).await
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> CoreResult<()> {
        self.inner.cancel_stop_orders(symbol).await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> CoreResult<OrderStatus> {
        self.inner.get_order_status(symbol, order_id).await
    }

    async fn get_trades(&self, since_ms: i64, limit: usize) -> CoreResult<Vec<VenueTrade>> {
        self.inner.get_trades(since_ms, limit).await
    }

    async fn get_open_orders(&self, symbol: &str) -> CoreResult<Vec<VenueOrder>> {
        self.inner.get_open_orders(symbol).await
    }
}
