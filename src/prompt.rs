//! Prompt Builder
//! Mission: Deterministic system+user prompts from strategy and market state

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::exchange::{AccountBalance, VenuePosition};
use crate::market::MarketMap;
use crate::models::{Agent, PromptVariant, Strategy};
use crate::selector::Candidate;

/// Inputs for one tick's prompts. Everything is borrowed; the builder has
/// no I/O and no clock of its own.
pub struct PromptInputs<'a> {
    pub agent: &'a Agent,
    pub strategy: &'a Strategy,
    pub equity: f64,
    pub balance: &'a AccountBalance,
    pub candidates: &'a [Candidate],
    /// symbol -> timeframe -> klines
    pub market: &'a HashMap<String, MarketMap>,
    pub open_positions: &'a [VenuePosition],
    pub now: DateTime<Utc>,
}

/// The schema block the parser relies on. Kept verbatim in the system
/// prompt so parser and prompt never drift apart.
const OUTPUT_SCHEMA: &str = r#"Respond with ONE fenced JSON block and nothing else outside it:
```json
[
  {"op": "OPEN", "symbol": "BTCUSDT", "side": "LONG", "qty_pct": 10, "leverage": 5, "stop": 48000, "take": 55000},
  {"op": "CLOSE", "symbol": "ETHUSDT", "side": "SHORT", "qty": 0},
  {"op": "HOLD"}
]
```
Rules:
- op is one of OPEN, CLOSE, ADJUST_STOP, ADJUST_TP, CANCEL_ALL, HOLD.
- side is LONG or SHORT and is required for every op except HOLD and CANCEL_ALL.
- Size an OPEN with either qty (base units) or qty_pct (percent of equity).
- CLOSE with qty 0 closes the whole side.
- An empty array means do nothing this cycle."#;

const BASE_DEFAULT: &str = "You are a disciplined crypto perpetual-futures trader managing one \
account. Decide position changes from the data provided; never invent symbols or prices.";

const BASE_AGGRESSIVE: &str = "You are an aggressive crypto perpetual-futures trader hunting \
short-term momentum. Concentrate into your highest-conviction setups, cut losers fast, and \
still obey every risk limit below.";

const BASE_CONSERVATIVE: &str = "You are a capital-preservation-first crypto futures trader. \
Prefer HOLD unless the setup is clear, size small, and always bracket entries with stops.";

/// Build (system_prompt, user_prompt). Pure function of its inputs.
pub fn build_prompts(inputs: &PromptInputs<'_>) -> (String, String) {
    (system_prompt(inputs), user_prompt(inputs))
}

fn system_prompt(inputs: &PromptInputs<'_>) -> String {
    let agent = inputs.agent;
    let strategy = inputs.strategy;

    let base = if agent.override_base_prompt && !agent.custom_prompt.is_empty() {
        agent.custom_prompt.clone()
    } else {
        let mut base = match strategy.prompt_variant {
            PromptVariant::Default => BASE_DEFAULT,
            PromptVariant::Aggressive => BASE_AGGRESSIVE,
            PromptVariant::Conservative => BASE_CONSERVATIVE,
        }
        .to_string();
        if !agent.custom_prompt.is_empty() {
            base.push_str("\n\nOperator notes:\n");
            base.push_str(&agent.custom_prompt);
        }
        base
    };

    let mut out = base;
    out.push_str("\n\nRisk limits (hard, enforced server-side):\n");
    let _ = writeln!(
        out,
        "- Max leverage: {}x on BTC/ETH, {}x on everything else.",
        strategy.btc_eth_max_leverage, strategy.altcoin_max_leverage
    );
    let _ = writeln!(
        out,
        "- Max {} simultaneous open positions.",
        strategy.max_positions
    );
    let _ = writeln!(
        out,
        "- Margin mode: {}.",
        if agent.is_cross_margin { "cross" } else { "isolated" }
    );
    out.push('\n');
    out.push_str(OUTPUT_SCHEMA);
    out
}

fn user_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Time: {}", inputs.now.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(
        out,
        "Account: equity {:.2} | available {:.2} | unrealized pnl {:+.2}",
        inputs.equity, inputs.balance.available, inputs.balance.unrealized_pnl
    );

    out.push_str("\nOpen positions:\n");
    if inputs.open_positions.is_empty() {
        out.push_str("(none)\n");
    } else {
        for p in inputs.open_positions {
            let _ = writeln!(
                out,
                "- {} {} qty {:.6} @ {:.4} | mark {:.4} | upnl {:+.2} | {}x",
                p.symbol,
                p.side.as_str(),
                p.qty,
                p.entry_price,
                p.mark_price,
                p.unrealized_pnl,
                p.leverage
            );
        }
    }

    out.push_str("\nCandidates:\n");
    for cand in inputs.candidates {
        let _ = write!(out, "## {}", cand.symbol);
        if let Some(score) = cand.score {
            let _ = write!(out, " | rank score {score:.2}");
        }
        if let Some(oi) = cand.oi_delta_pct {
            let _ = write!(out, " | OI change {oi:+.1}%");
        }
        out.push('\n');

        if let Some(market) = inputs.market.get(&cand.symbol) {
            for tf in &inputs.strategy.timeframes {
                let Some(klines) = market.get(tf) else { continue };
                if klines.is_empty() {
                    continue;
                }
                let window = &klines[klines.len().saturating_sub(inputs.strategy.kline_count)..];
                let last = &window[window.len() - 1];
                let first = &window[0];
                let high = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
                let low = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
                let volume: f64 = window.iter().map(|k| k.volume).sum();
                let change = if first.open != 0.0 {
                    (last.close - first.open) / first.open * 100.0
                } else {
                    0.0
                };
                let _ = writeln!(
                    out,
                    "  {tf}: close {:.4} | change {change:+.2}% over {} bars | range {low:.4}-{high:.4} | vol {volume:.1}",
                    last.close,
                    window.len(),
                );
            }
        }
    }

    out.push_str("\nDecide the actions for this cycle.");
    out
}
