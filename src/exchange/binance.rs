//! Binance USDⓈ-M futures adapter.
//!
//! Signing: HMAC-SHA256 over the query string, key in `X-MBX-APIKEY`.
//! Quantities cross this boundary in base currency; the adapter rounds
//! down to the symbol's step size from exchangeInfo.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    canonical_symbol, round_to_step, AccountBalance, AccountCache, ExchangeAdapter, OrderAck,
    VenueOrder, VenuePosition, VenueTrade,
};
use crate::error::{CoreError, CoreResult};
use crate::models::{ExchangeConfig, OrderSide, OrderStatus, PositionSide, TradeAction};

const MAINNET_BASE: &str = "https://fapi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
struct SymbolFilter {
    step_size: f64,
    min_qty: f64,
}

pub struct BinanceAdapter {
    http: reqwest::Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    venue_tag: String,
    cache: AccountCache,
    filters: RwLock<HashMap<String, SymbolFilter>>,
    /// None until the first call that needs it; Some(true) = hedge mode.
    dual_side: RwLock<Option<bool>>,
    /// Symbols this adapter has touched; scopes the per-symbol trade feed.
    traded_symbols: RwLock<HashSet<String>>,
}

impl BinanceAdapter {
    pub fn new(http: reqwest::Client, cfg: &ExchangeConfig, cache_ttl: Duration) -> Self {
        let base_url = if cfg.testnet {
            TESTNET_BASE.to_string()
        } else {
            MAINNET_BASE.to_string()
        };
        Self::with_base_url(http, cfg, cache_ttl, base_url, "binance")
    }

    /// Shared by Binance-compatible venues that differ only in hosts.
    pub(crate) fn with_base_url(
        http: reqwest::Client,
        cfg: &ExchangeConfig,
        cache_ttl: Duration,
        base_url: String,
        venue_tag: &str,
    ) -> Self {
        Self {
            http,
            api_key: cfg.api_key.clone(),
            secret_key: cfg.secret_key.clone(),
            base_url,
            venue_tag: venue_tag.to_string(),
            cache: AccountCache::new(cache_ttl),
            filters: RwLock::new(HashMap::new()),
            dual_side: RwLock::new(None),
            traded_symbols: RwLock::new(HashSet::new()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .unwrap_or_else(|_| unreachable!());
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("recvWindow={RECV_WINDOW_MS}&timestamp={now}"));
        let sig = self.sign(&query);
        format!("{query}&signature={sig}")
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> CoreResult<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::read_response(resp).await
    }

    async fn public_request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> CoreResult<serde_json::Value> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.http.get(&url).timeout(REQUEST_TIMEOUT).send().await?;
        Self::read_response(resp).await
    }

    async fn read_response(resp: reqwest::Response) -> CoreResult<serde_json::Value> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(CoreError::RateLimit(format!("venue {status}: {body}")));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CoreError::Auth(format!("venue {status}: {body}")));
        }
        if !status.is_success() {
            // API error payloads carry {code, msg}
            if let Ok(err) = serde_json::from_str::<ApiError>(&body) {
                if err.code == -2014 || err.code == -2015 {
                    return Err(CoreError::Auth(err.msg));
                }
                if err.code == -1021 {
                    return Err(CoreError::TransientIo(err.msg));
                }
                return Err(CoreError::Provider(format!("{} ({})", err.msg, err.code)));
            }
            let snippet: String = body.chars().take(400).collect();
            return Err(CoreError::Provider(format!("venue {status}: {snippet}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| CoreError::Provider(format!("venue json parse: {e}")))
    }

    async fn ensure_filter(&self, symbol: &str) -> CoreResult<SymbolFilter> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(*f);
        }

        let value = self
            .public_request("/fapi/v1/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;
        let info: ExchangeInfo = serde_json::from_value(value)
            .map_err(|e| CoreError::Provider(format!("exchangeInfo parse: {e}")))?;

        let mut found = None;
        for sym in info.symbols {
            let mut filter = SymbolFilter {
                step_size: 0.0,
                min_qty: 0.0,
            };
            for f in &sym.filters {
                if f.filter_type == "LOT_SIZE" {
                    filter.step_size = f.step_size.as_deref().and_then(parse_f64).unwrap_or(0.0);
                    filter.min_qty = f.min_qty.as_deref().and_then(parse_f64).unwrap_or(0.0);
                }
            }
            if sym.symbol == symbol {
                found = Some(filter);
            }
            self.filters.write().insert(sym.symbol, filter);
        }

        found.ok_or_else(|| CoreError::Config(format!("unknown symbol {symbol}")))
    }

    async fn is_dual_side(&self) -> CoreResult<bool> {
        if let Some(v) = *self.dual_side.read() {
            return Ok(v);
        }
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/positionSide/dual", &[])
            .await?;
        let dual = value
            .get("dualSidePosition")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        *self.dual_side.write() = Some(dual);
        Ok(dual)
    }

    fn note_symbol(&self, symbol: &str) {
        self.traded_symbols.write().insert(symbol.to_string());
    }

    /// Market order shared by the four open/close entry points.
    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        position_side: PositionSide,
        qty: f64,
        reduce_only: bool,
    ) -> CoreResult<OrderAck> {
        let filter = self.ensure_filter(symbol).await?;
        let qty = round_to_step(qty, filter.step_size);
        if qty <= 0.0 || (filter.min_qty > 0.0 && qty < filter.min_qty) {
            return Err(CoreError::validation(
                "zero_qty",
                format!("{symbol} qty rounds below venue minimum"),
            ));
        }

        let dual = self.is_dual_side().await?;
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_qty(qty)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if dual {
            params.push(("positionSide", position_side.as_str().to_string()));
        } else if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        self.note_symbol(symbol);
        self.cache.flush();

        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| CoreError::Provider(format!("order parse: {e}")))?;
        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            fill_price: order.avg_price.as_deref().and_then(parse_f64).unwrap_or(0.0),
            status: OrderStatus::parse(&order.status).unwrap_or(OrderStatus::New),
        })
    }

    async fn trigger_order(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
        order_type: &str,
    ) -> CoreResult<OrderAck> {
        let filter = self.ensure_filter(symbol).await?;
        let qty = round_to_step(qty, filter.step_size);
        if qty <= 0.0 {
            return Err(CoreError::validation(
                "zero_qty",
                format!("{symbol} trigger qty rounds to zero"),
            ));
        }

        // Trigger orders exit the position: a LONG exits with SELL.
        let order_side = match side {
            PositionSide::Short => OrderSide::Buy,
            _ => OrderSide::Sell,
        };

        let dual = self.is_dual_side().await?;
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", order_side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("quantity", format_qty(qty)),
            ("stopPrice", format_qty(trigger_price)),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        if dual {
            params.push(("positionSide", side.as_str().to_string()));
        } else {
            params.push(("reduceOnly", "true".to_string()));
        }

        let value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        self.note_symbol(symbol);
        self.cache.flush();

        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| CoreError::Provider(format!("order parse: {e}")))?;
        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            fill_price: trigger_price,
            status: OrderStatus::parse(&order.status).unwrap_or(OrderStatus::New),
        })
    }

    async fn position_qty(&self, symbol: &str, side: PositionSide) -> CoreResult<f64> {
        let positions = self.get_positions().await?;
        Ok(positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.qty)
            .unwrap_or(0.0))
    }

    /// Venue-specific open/close classifier for the trade feed. In hedge
    /// mode the venue names the side; in one-way mode a fill with
    /// realized pnl reduced exposure, one without opened it.
    fn classify(side: OrderSide, position_side: PositionSide, realized_pnl: f64) -> TradeAction {
        match (position_side, side) {
            (PositionSide::Long, OrderSide::Buy) => TradeAction::OpenLong,
            (PositionSide::Long, OrderSide::Sell) => TradeAction::CloseLong,
            (PositionSide::Short, OrderSide::Sell) => TradeAction::OpenShort,
            (PositionSide::Short, OrderSide::Buy) => TradeAction::CloseShort,
            (PositionSide::Both, OrderSide::Buy) => {
                if realized_pnl != 0.0 {
                    TradeAction::CloseShort
                } else {
                    TradeAction::OpenLong
                }
            }
            (PositionSide::Both, OrderSide::Sell) => {
                if realized_pnl != 0.0 {
                    TradeAction::CloseLong
                } else {
                    TradeAction::OpenShort
                }
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn venue(&self) -> &str {
        &self.venue_tag
    }

    async fn get_balance(&self) -> CoreResult<AccountBalance> {
        if let Some(bal) = self.cache.balance() {
            return Ok(bal);
        }
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/account", &[])
            .await?;
        let account: AccountResponse = serde_json::from_value(value)
            .map_err(|e| CoreError::Provider(format!("account parse: {e}")))?;
        let bal = AccountBalance {
            total_equity: parse_f64(&account.total_margin_balance).unwrap_or(0.0),
            available: parse_f64(&account.available_balance).unwrap_or(0.0),
            unrealized_pnl: parse_f64(&account.total_unrealized_profit).unwrap_or(0.0),
        };
        self.cache.store_balance(&bal);
        Ok(bal)
    }

    async fn get_positions(&self) -> CoreResult<Vec<VenuePosition>> {
        if let Some(pos) = self.cache.positions() {
            return Ok(pos);
        }
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;
        let raw: Vec<PositionRisk> = serde_json::from_value(value)
            .map_err(|e| CoreError::Provider(format!("positionRisk parse: {e}")))?;

        let mut out = Vec::new();
        for p in raw {
            let amt = parse_f64(&p.position_amt).unwrap_or(0.0);
            if amt == 0.0 {
                continue;
            }
            let side = match PositionSide::parse(&p.position_side) {
                Some(PositionSide::Long) => PositionSide::Long,
                Some(PositionSide::Short) => PositionSide::Short,
                // one-way mode: sign of the amount carries the side
                _ if amt > 0.0 => PositionSide::Long,
                _ => PositionSide::Short,
            };
            self.note_symbol(&p.symbol);
            out.push(VenuePosition {
                symbol: canonical_symbol(&p.symbol),
                side,
                qty: amt.abs(),
                entry_price: parse_f64(&p.entry_price).unwrap_or(0.0),
                mark_price: parse_f64(&p.mark_price).unwrap_or(0.0),
                unrealized_pnl: parse_f64(&p.unrealized_profit).unwrap_or(0.0),
                leverage: parse_f64(&p.leverage).unwrap_or(1.0),
                liquidation_price: parse_f64(&p.liquidation_price).unwrap_or(0.0),
            });
        }
        self.cache.store_positions(&out);
        Ok(out)
    }

    async fn get_market_price(&self, symbol: &str) -> CoreResult<f64> {
        let value = self
            .public_request("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        value
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(parse_f64)
            .ok_or_else(|| CoreError::Provider(format!("no price for {symbol}")))
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> CoreResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", format!("{}", leverage.max(1.0).round() as i64)),
        ];
        self.signed_request(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> CoreResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            (
                "marginType",
                if cross { "CROSSED" } else { "ISOLATED" }.to_string(),
            ),
        ];
        match self
            .signed_request(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(CoreError::Provider(msg)) if msg.contains("-4046") => Ok(()), // already set
            Err(CoreError::Provider(msg)) if msg.to_lowercase().contains("position") => {
                warn!(symbol, "margin mode unchanged: open position");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn open_long(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck> {
        self.set_leverage(symbol, leverage).await?;
        self.market_order(symbol, OrderSide::Buy, PositionSide::Long, qty, false)
            .await
    }

    async fn open_short(&self, symbol: &str, qty: f64, leverage: f64) -> CoreResult<OrderAck> {
        self.set_leverage(symbol, leverage).await?;
        self.market_order(symbol, OrderSide::Sell, PositionSide::Short, qty, false)
            .await
    }

    async fn close_long(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck> {
        let open_qty = self.position_qty(symbol, PositionSide::Long).await?;
        if open_qty <= 0.0 {
            return Err(CoreError::validation(
                "no_position",
                format!("no open LONG on {symbol}"),
            ));
        }
        let qty = if qty <= 0.0 { open_qty } else { qty.min(open_qty) };
        self.market_order(symbol, OrderSide::Sell, PositionSide::Long, qty, true)
            .await
    }

    async fn close_short(&self, symbol: &str, qty: f64) -> CoreResult<OrderAck> {
        let open_qty = self.position_qty(symbol, PositionSide::Short).await?;
        if open_qty <= 0.0 {
            return Err(CoreError::validation(
                "no_position",
                format!("no open SHORT on {symbol}"),
            ));
        }
        let qty = if qty <= 0.0 { open_qty } else { qty.min(open_qty) };
        self.market_order(symbol, OrderSide::Buy, PositionSide::Short, qty, true)
            .await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck> {
        self.trigger_order(symbol, side, qty, trigger_price, "STOP_MARKET")
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> CoreResult<OrderAck> {
        self.trigger_order(symbol, side, qty, trigger_price, "TAKE_PROFIT_MARKET")
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> CoreResult<()> {
        let params = vec![("symbol", symbol.to_string())];
        match self
            .signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await
        {
            Ok(_) => Ok(()),
            // nothing resting is still success
            Err(CoreError::Provider(msg)) if msg.contains("-2011") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> CoreResult<()> {
        let orders = self.get_open_orders(symbol).await?;
        for order in orders
            .iter()
            .filter(|o| o.order_type == "STOP_MARKET" || o.order_type == "TAKE_PROFIT_MARKET")
        {
            let params = vec![
                ("symbol", symbol.to_string()),
                ("orderId", order.order_id.clone()),
            ];
            if let Err(e) = self
                .signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params)
                .await
            {
                debug!(symbol, order_id = %order.order_id, "stop cancel skipped: {e}");
            }
        }
        Ok(())
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> CoreResult<OrderStatus> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/order", &params)
            .await?;
        let status = value
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        OrderStatus::parse(status)
            .ok_or_else(|| CoreError::Provider(format!("unknown order status {status}")))
    }

    async fn get_trades(&self, since_ms: i64, limit: usize) -> CoreResult<Vec<VenueTrade>> {
        // The venue scopes its trade feed per symbol; walk every symbol
        // this adapter has touched plus the ones currently open.
        let mut symbols: HashSet<String> = self.traded_symbols.read().clone();
        for p in self.get_positions().await? {
            symbols.insert(p.symbol);
        }

        let mut out = Vec::new();
        for symbol in symbols {
            let params = vec![
                ("symbol", symbol.clone()),
                ("startTime", since_ms.max(0).to_string()),
                ("limit", limit.clamp(1, 1000).to_string()),
            ];
            let value = self
                .signed_request(reqwest::Method::GET, "/fapi/v1/userTrades", &params)
                .await?;
            let raw: Vec<UserTrade> = serde_json::from_value(value)
                .map_err(|e| CoreError::Provider(format!("userTrades parse: {e}")))?;

            for t in raw {
                let side = OrderSide::parse(&t.side).unwrap_or(OrderSide::Buy);
                let position_side =
                    PositionSide::parse(&t.position_side).unwrap_or(PositionSide::Both);
                let realized_pnl = parse_f64(&t.realized_pnl).unwrap_or(0.0);
                out.push(VenueTrade {
                    trade_id: t.id.to_string(),
                    symbol: canonical_symbol(&t.symbol),
                    side,
                    position_side,
                    action: Self::classify(side, position_side, realized_pnl),
                    price: parse_f64(&t.price).unwrap_or(0.0),
                    qty: parse_f64(&t.qty).unwrap_or(0.0),
                    commission: parse_f64(&t.commission).unwrap_or(0.0),
                    realized_pnl,
                    ts: t.time,
                    is_maker: t.maker,
                });
            }
        }

        out.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.trade_id.cmp(&b.trade_id)));
        Ok(out)
    }

    async fn get_open_orders(&self, symbol: &str) -> CoreResult<Vec<VenueOrder>> {
        let params = vec![("symbol", symbol.to_string())];
        let value = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        let raw: Vec<OpenOrder> = serde_json::from_value(value)
            .map_err(|e| CoreError::Provider(format!("openOrders parse: {e}")))?;

        Ok(raw
            .into_iter()
            .map(|o| VenueOrder {
                order_id: o.order_id.to_string(),
                symbol: canonical_symbol(&o.symbol),
                side: OrderSide::parse(&o.side).unwrap_or(OrderSide::Buy),
                order_type: o.order_type,
                qty: o.orig_qty.as_deref().and_then(parse_f64).unwrap_or(0.0),
                price: o.price.as_deref().and_then(parse_f64).filter(|p| *p > 0.0),
                trigger_price: o
                    .stop_price
                    .as_deref()
                    .and_then(parse_f64)
                    .filter(|p| *p > 0.0),
                status: OrderStatus::parse(&o.status).unwrap_or(OrderStatus::New),
                reduce_only: o.reduce_only,
            })
            .collect())
    }
}

fn parse_f64(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Trim trailing zeros the way the venue expects quantities formatted.
fn format_qty(qty: f64) -> String {
    let s = format!("{qty:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeSymbol {
    symbol: String,
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "minQty")]
    min_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(rename = "totalMarginBalance")]
    total_margin_balance: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
    #[serde(rename = "totalUnrealizedProfit")]
    total_unrealized_profit: String,
}

#[derive(Debug, Deserialize)]
struct PositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "positionSide", default)]
    position_side: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    leverage: String,
    #[serde(rename = "liquidationPrice")]
    liquidation_price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: i64,
    status: String,
    #[serde(rename = "avgPrice")]
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserTrade {
    id: i64,
    symbol: String,
    side: String,
    #[serde(rename = "positionSide", default)]
    position_side: String,
    price: String,
    qty: String,
    commission: String,
    #[serde(rename = "realizedPnl")]
    realized_pnl: String,
    time: i64,
    maker: bool,
}

#[derive(Debug, Deserialize)]
struct OpenOrder {
    #[serde(rename = "orderId")]
    order_id: i64,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "origQty")]
    orig_qty: Option<String>,
    price: Option<String>,
    #[serde(rename = "stopPrice")]
    stop_price: Option<String>,
    status: String,
    #[serde(rename = "reduceOnly", default)]
    reduce_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_hedge_mode() {
        use TradeAction::*;
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Buy, PositionSide::Long, 0.0),
            OpenLong
        );
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Sell, PositionSide::Long, 1.5),
            CloseLong
        );
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Sell, PositionSide::Short, 0.0),
            OpenShort
        );
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Buy, PositionSide::Short, -0.2),
            CloseShort
        );
    }

    #[test]
    fn classify_one_way_uses_realized_pnl() {
        use TradeAction::*;
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Buy, PositionSide::Both, 0.0),
            OpenLong
        );
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Buy, PositionSide::Both, 3.0),
            CloseShort
        );
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Sell, PositionSide::Both, 0.0),
            OpenShort
        );
        assert_eq!(
            BinanceAdapter::classify(OrderSide::Sell, PositionSide::Both, -1.0),
            CloseLong
        );
    }

    #[test]
    fn qty_formatting_trims_zeros() {
        assert_eq!(format_qty(0.010000), "0.01");
        assert_eq!(format_qty(5.0), "5");
        assert_eq!(format_qty(0.00012345), "0.00012345");
    }

    #[test]
    fn parse_f64_rejects_garbage() {
        assert_eq!(parse_f64("50000.5"), Some(50000.5));
        assert_eq!(parse_f64("NaN"), None);
        assert_eq!(parse_f64("abc"), None);
    }
}
