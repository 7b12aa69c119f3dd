//! Decision Parser & Validator
//! Mission: Turn raw LLM text into risk-checked, totally-ordered actions

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{Position, PositionSide, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionOp {
    Open,
    Close,
    AdjustStop,
    AdjustTp,
    CancelAll,
    Hold,
}

impl ActionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOp::Open => "OPEN",
            ActionOp::Close => "CLOSE",
            ActionOp::AdjustStop => "ADJUST_STOP",
            ActionOp::AdjustTp => "ADJUST_TP",
            ActionOp::CancelAll => "CANCEL_ALL",
            ActionOp::Hold => "HOLD",
        }
    }
}

/// One structured action as the model proposed it, plus the validator's
/// verdict. Downgraded actions keep their original fields so the Decision
/// row shows what was asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub op: ActionOp,
    #[serde(default)]
    pub symbol: String,
    #[serde(default = "default_side")]
    pub side: PositionSide,
    #[serde(default)]
    pub qty: Option<f64>,
    /// Percent of equity to deploy, alternative to `qty`.
    #[serde(default)]
    pub qty_pct: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop: Option<f64>,
    #[serde(default)]
    pub take: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub downgrade_reason: Option<String>,
}

fn default_side() -> PositionSide {
    PositionSide::Both
}

impl Action {
    pub fn hold() -> Self {
        Self {
            op: ActionOp::Hold,
            symbol: String::new(),
            side: PositionSide::Both,
            qty: None,
            qty_pct: None,
            price: None,
            stop: None,
            take: None,
            leverage: None,
            downgrade_reason: None,
        }
    }

    fn downgrade(&mut self, reason: &str) {
        self.op = ActionOp::Hold;
        self.downgrade_reason = Some(reason.to_string());
    }

    pub fn is_downgraded(&self) -> bool {
        self.downgrade_reason.is_some()
    }
}

/// Parse outcome for one tick. An unparseable response is not an error:
/// the tick ends with an empty action list and a `NO_OP` note.
#[derive(Debug, Clone)]
pub struct ParsedDecision {
    pub actions: Vec<Action>,
    pub note: String,
}

/// Strict extraction: a fenced ```json block, or the whole response being
/// a JSON value. Mixed prose without a fence is rejected deliberately.
pub fn parse_decision(raw: &str) -> ParsedDecision {
    let candidate = extract_json_text(raw);
    let Some(text) = candidate else {
        return ParsedDecision {
            actions: vec![],
            note: "NO_OP".into(),
        };
    };

    match parse_actions_json(&text) {
        Some(actions) => ParsedDecision {
            actions,
            note: "OK".into(),
        },
        None => ParsedDecision {
            actions: vec![],
            note: "NO_OP".into(),
        },
    }
}

fn extract_json_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // fenced block first: ```json ... ```
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }
    // tolerate a bare ``` fence around JSON
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            if inner.starts_with('[') || inner.starts_with('{') {
                return Some(inner.to_string());
            }
        }
    }

    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }

    None
}

fn parse_actions_json(text: &str) -> Option<Vec<Action>> {
    // either a bare array or {"actions": [...]}
    if let Ok(actions) = serde_json::from_str::<Vec<Action>>(text) {
        return Some(actions);
    }

    #[derive(Deserialize)]
    struct Wrapper {
        actions: Vec<Action>,
    }
    serde_json::from_str::<Wrapper>(text).ok().map(|w| w.actions)
}

/// Everything the validator needs to judge one tick's actions.
pub struct ValidationContext<'a> {
    pub strategy: &'a Strategy,
    /// Candidate symbols this tick.
    pub candidates: HashSet<String>,
    /// Open positions as the store knows them.
    pub open_positions: &'a [Position],
    /// True when the venue runs one-way position mode.
    pub one_way_mode: bool,
}

impl ValidationContext<'_> {
    fn is_open(&self, symbol: &str, side: PositionSide) -> bool {
        self.open_positions
            .iter()
            .any(|p| p.is_open && p.symbol == symbol && p.side == side)
    }

    fn has_any_open(&self, symbol: &str) -> bool {
        self.open_positions
            .iter()
            .any(|p| p.is_open && p.symbol == symbol)
    }
}

/// Enforce the strategy's risk bounds. A failing action is downgraded to
/// HOLD with its reason; the rest of the list is untouched and order is
/// preserved.
pub fn validate_actions(mut actions: Vec<Action>, ctx: &ValidationContext<'_>) -> Vec<Action> {
    let open_count = ctx
        .open_positions
        .iter()
        .filter(|p| p.is_open)
        .count();
    let mut new_opens: usize = 0;

    for action in actions.iter_mut() {
        match action.op {
            ActionOp::Hold | ActionOp::CancelAll => continue,
            _ => {}
        }

        if action.symbol.is_empty()
            || (!ctx.candidates.contains(&action.symbol) && !ctx.has_any_open(&action.symbol))
        {
            action.downgrade("unknown_symbol");
            continue;
        }

        if action.side == PositionSide::Both {
            // the model must commit to a side even on one-way venues
            action.downgrade("position_mode");
            continue;
        }

        match action.op {
            ActionOp::Open => {
                if ctx.one_way_mode {
                    let opposite = match action.side {
                        PositionSide::Long => PositionSide::Short,
                        _ => PositionSide::Long,
                    };
                    if ctx.is_open(&action.symbol, opposite) {
                        action.downgrade("position_mode");
                        continue;
                    }
                }

                let cap = ctx.strategy.leverage_cap(&action.symbol);
                let leverage = action.leverage.unwrap_or(1.0);
                if leverage > cap {
                    action.downgrade("leverage_cap");
                    continue;
                }

                let qty_ok = action.qty.map(|q| q > 0.0).unwrap_or(false)
                    || action.qty_pct.map(|p| p > 0.0).unwrap_or(false);
                if !qty_ok {
                    action.downgrade("zero_qty");
                    continue;
                }

                let creates_new = !ctx.is_open(&action.symbol, action.side);
                if creates_new && open_count + new_opens + 1 > ctx.strategy.max_positions {
                    action.downgrade("max_positions");
                    continue;
                }

                if !trigger_prices_valid(action) {
                    action.downgrade("bad_trigger");
                    continue;
                }

                if creates_new {
                    new_opens += 1;
                }
            }
            ActionOp::Close => {
                if !ctx.is_open(&action.symbol, action.side) {
                    action.downgrade("no_position");
                    continue;
                }
                if let Some(q) = action.qty {
                    if q < 0.0 {
                        action.downgrade("zero_qty");
                        continue;
                    }
                }
            }
            ActionOp::AdjustStop | ActionOp::AdjustTp => {
                if !ctx.is_open(&action.symbol, action.side) {
                    action.downgrade("no_position");
                    continue;
                }
                if !trigger_prices_valid(action) {
                    action.downgrade("bad_trigger");
                    continue;
                }
            }
            ActionOp::Hold | ActionOp::CancelAll => {}
        }
    }

    actions
}

/// Stop below / take above the reference price for longs, mirrored for
/// shorts. The reference is the action's own limit price when present,
/// otherwise the stop/take pair is checked against each other.
fn trigger_prices_valid(action: &Action) -> bool {
    let long = action.side == PositionSide::Long;

    if let Some(reference) = action.price {
        if let Some(stop) = action.stop {
            let ok = if long { stop < reference } else { stop > reference };
            if !ok {
                return false;
            }
        }
        if let Some(take) = action.take {
            let ok = if long { take > reference } else { take < reference };
            if !ok {
                return false;
            }
        }
        return true;
    }

    if let (Some(stop), Some(take)) = (action.stop, action.take) {
        return if long { stop < take } else { stop > take };
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoinSource, PromptVariant};
    use uuid::Uuid;

    fn strategy() -> Strategy {
        Strategy {
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
            max_positions: 2,
            prompt_variant: PromptVariant::Default,
            overrides: serde_json::json!({}),
        }
    }

    fn open_position(symbol: &str, side: PositionSide) -> Position {
        Position {
            agent_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            qty: 1.0,
            avg_entry_price: 100.0,
            realized_pnl_accum: 0.0,
            is_open: true,
            last_update_ts: 0,
        }
    }

    fn ctx<'a>(
        strategy: &'a Strategy,
        candidates: &[&str],
        positions: &'a [Position],
    ) -> ValidationContext<'a> {
        ValidationContext {
            strategy,
            candidates: candidates.iter().map(|s| s.to_string()).collect(),
            open_positions: positions,
            one_way_mode: false,
        }
    }

    #[test]
    fn parses_fenced_json_array() {
        let raw = r#"Here is my decision:
```json
[{"op": "OPEN", "symbol": "BTCUSDT", "side": "LONG", "qty": 0.01, "leverage": 5}]
```
Good luck."#;
        let parsed = parse_decision(raw);
        assert_eq!(parsed.note, "OK");
        assert_eq!(parsed.actions.len(), 1);
        assert_eq!(parsed.actions[0].op, ActionOp::Open);
        assert_eq!(parsed.actions[0].side, PositionSide::Long);
        assert_eq!(parsed.actions[0].leverage, Some(5.0));
    }

    #[test]
    fn parses_bare_object_with_actions_key() {
        let raw = r#"{"actions": [{"op": "HOLD"}]}"#;
        let parsed = parse_decision(raw);
        assert_eq!(parsed.actions.len(), 1);
        assert_eq!(parsed.actions[0].op, ActionOp::Hold);
    }

    #[test]
    fn prose_without_fence_is_no_op() {
        let parsed = parse_decision("I think BTC goes up, buy some.");
        assert!(parsed.actions.is_empty());
        assert_eq!(parsed.note, "NO_OP");

        let parsed = parse_decision("");
        assert_eq!(parsed.note, "NO_OP");
    }

    #[test]
    fn malformed_json_is_no_op() {
        let parsed = parse_decision("```json\n[{\"op\": \"OPEN\",]\n```");
        assert!(parsed.actions.is_empty());
        assert_eq!(parsed.note, "NO_OP");
    }

    #[test]
    fn leverage_over_cap_downgrades_only_that_action() {
        let strat = strategy();
        let positions = vec![];
        let c = ctx(&strat, &["SOLUSDT", "BTCUSDT"], &positions);

        let raw = r#"[
            {"op": "OPEN", "symbol": "SOLUSDT", "side": "LONG", "qty": 1.0, "leverage": 30},
            {"op": "OPEN", "symbol": "BTCUSDT", "side": "LONG", "qty": 0.01, "leverage": 3}
        ]"#;
        let actions = validate_actions(parse_decision(raw).actions, &c);

        assert_eq!(actions[0].op, ActionOp::Hold);
        assert_eq!(actions[0].downgrade_reason.as_deref(), Some("leverage_cap"));
        assert_eq!(actions[1].op, ActionOp::Open);
        assert!(!actions[1].is_downgraded());
    }

    #[test]
    fn unknown_symbol_downgrades() {
        let strat = strategy();
        let positions = vec![];
        let c = ctx(&strat, &["BTCUSDT"], &positions);
        let actions = vec![Action {
            op: ActionOp::Open,
            symbol: "PEPEUSDT".into(),
            side: PositionSide::Long,
            qty: Some(1.0),
            ..Action::hold()
        }];
        let out = validate_actions(actions, &c);
        assert_eq!(out[0].downgrade_reason.as_deref(), Some("unknown_symbol"));
    }

    #[test]
    fn open_symbol_not_in_candidates_is_still_actionable() {
        let strat = strategy();
        let positions = vec![open_position("DOTUSDT", PositionSide::Long)];
        let c = ctx(&strat, &["BTCUSDT"], &positions);
        let actions = vec![Action {
            op: ActionOp::Close,
            symbol: "DOTUSDT".into(),
            side: PositionSide::Long,
            ..Action::hold()
        }];
        let out = validate_actions(actions, &c);
        assert!(!out[0].is_downgraded());
    }

    #[test]
    fn max_positions_counts_existing_and_new() {
        let strat = strategy(); // max_positions = 2
        let positions = vec![open_position("BTCUSDT", PositionSide::Long)];
        let c = ctx(&strat, &["ETHUSDT", "SOLUSDT"], &positions);

        let actions = vec![
            Action {
                op: ActionOp::Open,
                symbol: "ETHUSDT".into(),
                side: PositionSide::Long,
                qty: Some(1.0),
                leverage: Some(2.0),
                ..Action::hold()
            },
            Action {
                op: ActionOp::Open,
                symbol: "SOLUSDT".into(),
                side: PositionSide::Long,
                qty: Some(1.0),
                leverage: Some(2.0),
                ..Action::hold()
            },
        ];
        let out = validate_actions(actions, &c);
        assert!(!out[0].is_downgraded());
        assert_eq!(out[1].downgrade_reason.as_deref(), Some("max_positions"));
    }

    #[test]
    fn stop_take_must_bracket_entry() {
        let strat = strategy();
        let positions = vec![];
        let c = ctx(&strat, &["BTCUSDT"], &positions);

        // long with stop above entry: wrong side
        let actions = vec![Action {
            op: ActionOp::Open,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            qty: Some(0.01),
            leverage: Some(2.0),
            price: Some(50_000.0),
            stop: Some(51_000.0),
            ..Action::hold()
        }];
        let out = validate_actions(actions, &c);
        assert_eq!(out[0].downgrade_reason.as_deref(), Some("bad_trigger"));

        // short mirrored, correct
        let actions = vec![Action {
            op: ActionOp::Open,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Short,
            qty: Some(0.01),
            leverage: Some(2.0),
            price: Some(50_000.0),
            stop: Some(51_000.0),
            take: Some(48_000.0),
            ..Action::hold()
        }];
        let out = validate_actions(actions, &c);
        assert!(!out[0].is_downgraded());
    }

    #[test]
    fn one_way_mode_blocks_opposite_open() {
        let strat = strategy();
        let positions = vec![open_position("BTCUSDT", PositionSide::Long)];
        let mut c = ctx(&strat, &["BTCUSDT"], &positions);
        c.one_way_mode = true;

        let actions = vec![Action {
            op: ActionOp::Open,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Short,
            qty: Some(0.01),
            leverage: Some(2.0),
            ..Action::hold()
        }];
        let out = validate_actions(actions, &c);
        assert_eq!(out[0].downgrade_reason.as_deref(), Some("position_mode"));
    }

    #[test]
    fn close_without_position_downgrades() {
        let strat = strategy();
        let positions = vec![];
        let c = ctx(&strat, &["BTCUSDT"], &positions);
        let actions = vec![Action {
            op: ActionOp::Close,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            ..Action::hold()
        }];
        let out = validate_actions(actions, &c);
        assert_eq!(out[0].downgrade_reason.as_deref(), Some("no_position"));
    }
}
