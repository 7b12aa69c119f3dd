//! Domain Entities
//! Mission: One vocabulary for agents, strategies, orders and positions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Side of an order as sent to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Which side of the book a position lives on. `Both` is the one-way mode
/// marker used by venues without hedge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Both => "BOTH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            "BOTH" => Some(Self::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "STOP_MARKET" => Some(Self::StopMarket),
            "TAKE_PROFIT_MARKET" => Some(Self::TakeProfitMarket),
            _ => None,
        }
    }
}

/// The trade intent behind an order, from the agent's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::OpenLong => "open_long",
            TradeAction::OpenShort => "open_short",
            TradeAction::CloseLong => "close_long",
            TradeAction::CloseShort => "close_short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open_long" => Some(Self::OpenLong),
            "open_short" => Some(Self::OpenShort),
            "close_long" => Some(Self::CloseLong),
            "close_short" => Some(Self::CloseShort),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    /// The position side this action touches.
    pub fn position_side(&self) -> PositionSide {
        match self {
            TradeAction::OpenLong | TradeAction::CloseLong => PositionSide::Long,
            TradeAction::OpenShort | TradeAction::CloseShort => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    New,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::New => "NEW",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "NEW" => Some(Self::New),
            "PARTIAL" | "PARTIALLY_FILLED" => Some(Self::Partial),
            "FILLED" => Some(Self::Filled),
            "CANCELED" | "CANCELLED" | "EXPIRED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Platform account. Registration and credential checks live outside the
/// core; the store only needs the identity row to scope child entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub otp_seed: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// LLM advisor configuration. `api_key` is stored as an at-rest ciphertext
/// token and only decrypted by the full-config loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub enabled: bool,
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
}

impl ModelConfig {
    /// Copy with secret fields blanked for API responses.
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        out.api_key = String::new();
        out
    }
}

/// Venue credentials. All key fields are at-rest ciphertext tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub venue: String,
    pub enabled: bool,
    pub testnet: bool,
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl ExchangeConfig {
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        out.api_key = String::new();
        out.secret_key = String::new();
        out.passphrase = String::new();
        out
    }
}

/// Where the candidate selector draws symbols from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSource {
    DefaultList,
    Ai500Api,
    OiTopApi,
    Custom,
}

impl CoinSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinSource::DefaultList => "default_list",
            CoinSource::Ai500Api => "ai500_api",
            CoinSource::OiTopApi => "oi_top_api",
            CoinSource::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default_list" => Some(Self::DefaultList),
            "ai500_api" => Some(Self::Ai500Api),
            "oi_top_api" => Some(Self::OiTopApi),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    Default,
    Aggressive,
    Conservative,
}

impl PromptVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptVariant::Default => "default",
            PromptVariant::Aggressive => "aggressive",
            PromptVariant::Conservative => "conservative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "aggressive" => Some(Self::Aggressive),
            "conservative" => Some(Self::Conservative),
            _ => None,
        }
    }
}

/// Strategy configuration consumed by the prompt builder and the
/// validator. Free-form extras ride along in `overrides`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub coin_sources: Vec<CoinSource>,
    pub custom_coins: Vec<String>,
    pub timeframes: Vec<String>,
    pub primary_timeframe: String,
    pub kline_count: usize,
    pub candidate_limit: usize,
    pub btc_eth_max_leverage: f64,
    pub altcoin_max_leverage: f64,
    pub max_positions: usize,
    pub prompt_variant: PromptVariant,
    pub overrides: serde_json::Value,
}

impl Strategy {
    /// Leverage cap for a canonical symbol.
    pub fn leverage_cap(&self, symbol: &str) -> f64 {
        if symbol.starts_with("BTC") || symbol.starts_with("ETH") {
            self.btc_eth_max_leverage
        } else {
            self.altcoin_max_leverage
        }
    }
}

/// The unit the scheduler supervises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub model_id: Uuid,
    pub exchange_id: Uuid,
    pub strategy_id: Uuid,
    pub initial_balance: f64,
    pub scan_interval_minutes: u32,
    pub is_cross_margin: bool,
    pub custom_prompt: String,
    pub override_base_prompt: bool,
    pub is_running: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const MIN_SCAN_INTERVAL_MINUTES: u32 = 3;

impl Agent {
    pub fn scan_interval_secs(&self) -> u64 {
        u64::from(self.scan_interval_minutes.max(MIN_SCAN_INTERVAL_MINUTES)) * 60
    }
}

/// Immutable record of one perceive-decide-act tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub ts: i64,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    /// Parsed (possibly downgraded) actions, JSON-encoded.
    pub actions_json: String,
    /// OrderIntent ids produced by the executor this tick.
    pub order_ids: Vec<Uuid>,
    /// Outcome note: "OK", "NO_OP", or an error kind tag.
    pub note: String,
}

/// Local record of an order sent (or attempted) to a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub action: TradeAction,
    pub qty: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub error: Option<String>,
    pub created_ts: i64,
    pub filled_ts: Option<i64>,
}

/// A unit of execution reported by a venue. Unique per
/// (exchange_config_id, exchange_trade_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub exchange_config_id: Uuid,
    pub intent_id: Option<Uuid>,
    pub exchange_trade_id: String,
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

/// Materialised open exposure on (agent, symbol, side). Derived from the
/// ordered fill stream; never the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub agent_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub realized_pnl_accum: f64,
    pub is_open: bool,
    pub last_update_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub ts: i64,
    pub total_equity: f64,
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
}

/// Everything a worker needs for one agent, secrets decrypted.
#[derive(Debug, Clone)]
pub struct AgentFullConfig {
    pub agent: Agent,
    pub strategy: Strategy,
    pub model: ModelConfig,
    pub exchange: ExchangeConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for s in ["PENDING", "NEW", "PARTIAL", "FILLED", "CANCELED", "REJECTED"] {
            assert_eq!(OrderStatus::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(
            OrderStatus::parse("PARTIALLY_FILLED"),
            Some(OrderStatus::Partial)
        );
        assert_eq!(TradeAction::parse("open_long"), Some(TradeAction::OpenLong));
        assert_eq!(TradeAction::OpenShort.position_side(), PositionSide::Short);
        assert!(TradeAction::parse("hold").is_none());
    }

    #[test]
    fn leverage_cap_by_symbol() {
        let strat = Strategy {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
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
        assert_eq!(strat.leverage_cap("BTCUSDT"), 10.0);
        assert_eq!(strat.leverage_cap("ETHUSDT"), 10.0);
        assert_eq!(strat.leverage_cap("SOLUSDT"), 5.0);
    }

    #[test]
    fn scan_interval_clamped_to_minimum() {
        let agent = Agent {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "a".into(),
            model_id: Uuid::new_v4(),
            exchange_id: Uuid::new_v4(),
            strategy_id: Uuid::new_v4(),
            initial_balance: 1000.0,
            scan_interval_minutes: 1,
            is_cross_margin: true,
            custom_prompt: String::new(),
            override_base_prompt: false,
            is_running: false,
            last_error: None,
            created_at: Utc::now(),
        };
        assert_eq!(agent.scan_interval_secs(), 180);
    }
}
