//! Candidate Selector
//! Mission: Ranked symbol set per agent from the strategy's coin sources

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::CoreResult;
use crate::exchange::canonical_symbol;
use crate::models::{CoinSource, Strategy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Liquid majors used when the strategy asks for the default list.
const DEFAULT_SYMBOLS: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "LINKUSDT",
];

#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol: String,
    pub sources: Vec<CoinSource>,
    /// Rank within the first source that produced it (0 = best).
    pub rank: usize,
    pub score: Option<f64>,
    pub oi_delta_pct: Option<f64>,
}

/// Merges the strategy's sources in order, deduplicating by symbol while
/// keeping first-seen rank. A failing source is logged and skipped.
pub struct CandidateSelector {
    http: reqwest::Client,
    ai500_base: Option<String>,
    oi_base: Option<String>,
}

impl CandidateSelector {
    pub fn new(
        http: reqwest::Client,
        ai500_base: Option<String>,
        oi_base: Option<String>,
    ) -> Self {
        Self {
            http,
            ai500_base,
            oi_base,
        }
    }

    pub async fn select(&self, strategy: &Strategy) -> CoreResult<Vec<Candidate>> {
        let mut out: Vec<Candidate> = Vec::new();

        for source in &strategy.coin_sources {
            let symbols = match source {
                CoinSource::DefaultList => DEFAULT_SYMBOLS
                    .iter()
                    .map(|s| (s.to_string(), None, None))
                    .collect(),
                CoinSource::Custom => strategy
                    .custom_coins
                    .iter()
                    .map(|s| (canonical_symbol(s), None, None))
                    .collect(),
                CoinSource::Ai500Api => match self.fetch_ai500().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(source = source.as_str(), "candidate source skipped: {e}");
                        continue;
                    }
                },
                CoinSource::OiTopApi => match self.fetch_oi_top().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(source = source.as_str(), "candidate source skipped: {e}");
                        continue;
                    }
                },
            };

            for (symbol, score, oi_delta_pct) in symbols {
                if symbol.is_empty() {
                    continue;
                }
                if let Some(existing) = out.iter_mut().find(|c| c.symbol == symbol) {
                    if !existing.sources.contains(source) {
                        existing.sources.push(*source);
                    }
                    existing.score = existing.score.or(score);
                    existing.oi_delta_pct = existing.oi_delta_pct.or(oi_delta_pct);
                } else {
                    out.push(Candidate {
                        symbol,
                        sources: vec![*source],
                        rank: out.len(),
                        score,
                        oi_delta_pct,
                    });
                }
            }
        }

        out.truncate(strategy.candidate_limit.max(1));
        Ok(out)
    }

    async fn fetch_ai500(&self) -> CoreResult<Vec<(String, Option<f64>, Option<f64>)>> {
        let base = self.ai500_base.as_deref().ok_or_else(|| {
            crate::error::CoreError::Config("ai500 source requested but AI500_API_BASE unset".into())
        })?;
        let url = format!("{}/rank", base.trim_end_matches('/'));
        let resp = self.http.get(&url).timeout(REQUEST_TIMEOUT).send().await?;
        let entries: Vec<RankEntry> = resp
            .json()
            .await
            .map_err(|e| crate::error::CoreError::Provider(format!("ai500 parse: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| (canonical_symbol(&e.symbol), Some(e.score), None))
            .collect())
    }

    async fn fetch_oi_top(&self) -> CoreResult<Vec<(String, Option<f64>, Option<f64>)>> {
        let base = self.oi_base.as_deref().ok_or_else(|| {
            crate::error::CoreError::Config("oi_top source requested but OI_API_BASE unset".into())
        })?;
        let url = format!("{}/oi/top", base.trim_end_matches('/'));
        let resp = self.http.get(&url).timeout(REQUEST_TIMEOUT).send().await?;
        let entries: Vec<OiEntry> = resp
            .json()
            .await
            .map_err(|e| crate::error::CoreError::Provider(format!("oi_top parse: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| (canonical_symbol(&e.symbol), None, Some(e.oi_delta_pct)))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct RankEntry {
    symbol: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct OiEntry {
    symbol: String,
    #[serde(rename = "oiDeltaPct")]
    oi_delta_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PromptVariant;
    use uuid::Uuid;

    fn strategy(sources: Vec<CoinSource>, custom: Vec<&str>, limit: usize) -> Strategy {
        Strategy {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "s".into(),
            is_active: true,
            coin_sources: sources,
            custom_coins: custom.into_iter().map(String::from).collect(),
            timeframes: vec!["15m".into()],
            primary_timeframe: "15m".into(),
            kline_count: 50,
            candidate_limit: limit,
            btc_eth_max_leverage: 10.0,
            altcoin_max_leverage: 5.0,
            max_positions: 3,
            prompt_variant: PromptVariant::Default,
            overrides: serde_json::json!({}),
        }
    }

    fn selector() -> CandidateSelector {
        CandidateSelector::new(reqwest::Client::new(), None, None)
    }

    #[tokio::test]
    async fn default_list_preserves_rank_order() {
        let strat = strategy(vec![CoinSource::DefaultList], vec![], 12);
        let out = selector().select(&strat).await.unwrap();
        assert_eq!(out[0].symbol, "BTCUSDT");
        assert_eq!(out[0].rank, 0);
        assert_eq!(out[1].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn custom_merges_and_dedups_with_source_tags() {
        let strat = strategy(
            vec![CoinSource::DefaultList, CoinSource::Custom],
            vec!["btc-usdt", "PEPEUSDT"],
            20,
        );
        let out = selector().select(&strat).await.unwrap();

        let btc = out.iter().find(|c| c.symbol == "BTCUSDT").unwrap();
        assert_eq!(
            btc.sources,
            vec![CoinSource::DefaultList, CoinSource::Custom]
        );
        assert_eq!(out.iter().filter(|c| c.symbol == "BTCUSDT").count(), 1);
        assert!(out.iter().any(|c| c.symbol == "PEPEUSDT"));
    }

    #[tokio::test]
    async fn failing_api_source_is_skipped_not_fatal() {
        // ai500 requested with no base configured: logged and skipped
        let strat = strategy(
            vec![CoinSource::Ai500Api, CoinSource::DefaultList],
            vec![],
            12,
        );
        let out = selector().select(&strat).await.unwrap();
        assert!(!out.is_empty());
        assert!(out.iter().all(|c| c.sources == vec![CoinSource::DefaultList]));
    }

    #[tokio::test]
    async fn limit_truncates() {
        let strat = strategy(vec![CoinSource::DefaultList], vec![], 3);
        let out = selector().select(&strat).await.unwrap();
        assert_eq!(out.len(), 3);
    }
}
