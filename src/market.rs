//! Market Snapshotter
//! Mission: On-demand multi-timeframe kline bundles from the market service

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Kline {
    pub fn change_pct(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open) / self.open * 100.0
    }
}

/// One symbol's klines per timeframe. Always an owned copy; callers may
/// mutate freely.
pub type MarketMap = HashMap<String, Vec<Kline>>;

/// REST client for the external market service, with a short-TTL cache
/// so agents ticking in the same window share fetches.
pub struct MarketSnapshotter {
    http: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<(String, String), (Instant, Vec<Kline>)>>,
    cache_ttl: Duration,
}

impl MarketSnapshotter {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(20),
        }
    }

    /// Bundle of klines per requested timeframe, each truncated to the
    /// newest `count`.
    pub async fn snapshot(
        &self,
        symbol: &str,
        timeframes: &[String],
        count: usize,
    ) -> CoreResult<MarketMap> {
        let mut out = MarketMap::new();
        for tf in timeframes {
            let klines = self.klines(symbol, tf, count).await?;
            out.insert(tf.clone(), klines);
        }
        Ok(out)
    }

    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        count: usize,
    ) -> CoreResult<Vec<Kline>> {
        let key = (symbol.to_string(), interval.to_string());
        if let Some((at, cached)) = self.cache.read().get(&key) {
            if at.elapsed() < self.cache_ttl && cached.len() >= count {
                let mut copy = cached.clone();
                let skip = copy.len().saturating_sub(count);
                copy.drain(..skip);
                return Ok(copy);
            }
        }

        let url = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval,
            count.clamp(1, 1000)
        );
        let resp = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(300).collect();
            return Err(CoreError::Provider(format!(
                "market service {status}: {snippet}"
            )));
        }

        let klines: Vec<Kline> = serde_json::from_str(&body)
            .map_err(|e| CoreError::Provider(format!("klines parse: {e}")))?;
        debug!(symbol, interval, n = klines.len(), "klines fetched");

        self.cache
            .write()
            .insert(key, (Instant::now(), klines.clone()));
        Ok(klines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_pct_handles_zero_open() {
        let k = Kline {
            open_time: 0,
            open: 0.0,
            high: 1.0,
            low: 0.0,
            close: 1.0,
            volume: 0.0,
        };
        assert_eq!(k.change_pct(), 0.0);

        let k = Kline {
            open_time: 0,
            open: 100.0,
            high: 110.0,
            low: 95.0,
            close: 105.0,
            volume: 10.0,
        };
        assert!((k.change_pct() - 5.0).abs() < 1e-12);
    }
}
