// src/market.rs
//! Market-mover feed: 24h ticker statistics used to boost keyword scores.
//! Strictly best-effort; an unreachable feed degrades to "no boost".

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;
use std::time::Duration;

use crate::text;

/// How many movers (by absolute 24h change) feed the boost.
pub const DEFAULT_TOP_MOVERS: usize = 40;

/// Quote-currency suffixes stripped from ticker symbols, probed longest-first
/// so `BTCUSDT` resolves to `BTC` and `ETHBTC` to `ETH`.
const QUOTE_SUFFIXES: [&str; 10] = [
    "FDUSD", "BUSD", "USDT", "USDC", "TUSD", "USD", "EUR", "BTC", "ETH", "BNB",
];

/// One ticker row. The percent field arrives as a string on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct Mover {
    pub symbol: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
}

impl Mover {
    pub fn pct(&self) -> f64 {
        self.price_change_percent.trim().parse().unwrap_or(0.0)
    }
}

/// Mover data reduced to the stems the scorer consumes.
#[derive(Debug, Clone, Default)]
pub struct MarketBoost {
    pub mover_stems: Vec<String>,
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Top `n` movers by absolute 24h percent change.
    async fn top_movers(&self, n: usize) -> Result<Vec<Mover>>;
    fn name(&self) -> &'static str;
}

/// Base asset symbol with any known quote suffix removed. A symbol that IS a
/// quote currency stays intact.
pub fn base_symbol(symbol: &str) -> &str {
    let s = symbol.trim();
    for suffix in QUOTE_SUFFIXES {
        if let Some(base) = s.strip_suffix(suffix) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    s
}

fn rank_movers(mut movers: Vec<Mover>, n: usize) -> Vec<Mover> {
    movers.sort_by(|a, b| b.pct().abs().total_cmp(&a.pct().abs()));
    movers.truncate(n);
    movers
}

/// Reduce ranked movers to unique stems.
pub fn boost_from_movers(movers: &[Mover]) -> MarketBoost {
    let mut stems = Vec::with_capacity(movers.len());
    for m in movers {
        let stem = text::stem(&base_symbol(&m.symbol).to_lowercase());
        if !stem.is_empty() && !stems.contains(&stem) {
            stems.push(stem);
        }
    }
    MarketBoost { mover_stems: stems }
}

/// Fetch boost data, absorbing every failure into `None`. Scoring proceeds
/// unboosted when the feed is down.
pub async fn fetch_boost(feed: &dyn MarketFeed, n: usize) -> Option<MarketBoost> {
    match feed.top_movers(n).await {
        Ok(movers) => Some(boost_from_movers(&movers)),
        Err(e) => {
            tracing::warn!(error = ?e, feed = feed.name(), "market feed unavailable, skipping boost");
            counter!("market_feed_errors_total").increment(1);
            None
        }
    }
}

pub struct HttpMarketFeed {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpMarketFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MarketFeed for HttpMarketFeed {
    async fn top_movers(&self, n: usize) -> Result<Vec<Mover>> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .context("market ticker get()")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("market ticker http status {status}");
        }
        let movers: Vec<Mover> = resp.json().await.context("market ticker json decode")?;
        Ok(rank_movers(movers, n))
    }

    fn name(&self) -> &'static str {
        "ticker-24h"
    }
}

/// Canned movers for tests and offline runs.
pub struct FixtureMarketFeed {
    movers: Vec<Mover>,
}

impl FixtureMarketFeed {
    pub fn new(movers: Vec<Mover>) -> Self {
        Self { movers }
    }
}

#[async_trait]
impl MarketFeed for FixtureMarketFeed {
    async fn top_movers(&self, n: usize) -> Result<Vec<Mover>> {
        Ok(rank_movers(self.movers.clone(), n))
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(symbol: &str, pct: &str) -> Mover {
        Mover {
            symbol: symbol.into(),
            price_change_percent: pct.into(),
        }
    }

    #[test]
    fn base_symbol_strips_longest_suffix_first() {
        assert_eq!(base_symbol("BTCUSDT"), "BTC");
        assert_eq!(base_symbol("ETHBTC"), "ETH");
        assert_eq!(base_symbol("SOLFDUSD"), "SOL");
        // A bare quote currency survives intact
        assert_eq!(base_symbol("BTC"), "BTC");
    }

    #[test]
    fn ranking_is_by_absolute_change() {
        let movers = vec![mv("AUSDT", "2.0"), mv("BUSDT", "-9.5"), mv("CUSDT", "4.0")];
        let ranked = rank_movers(movers, 2);
        let symbols: Vec<_> = ranked.iter().map(|m| m.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BUSDT", "CUSDT"]);
    }

    #[test]
    fn unparseable_percent_ranks_last() {
        let movers = vec![mv("AUSDT", "oops"), mv("BUSDT", "1.0")];
        let ranked = rank_movers(movers, 2);
        assert_eq!(ranked[0].symbol, "BUSDT");
    }

    #[test]
    fn boost_stems_are_unique() {
        let movers = vec![mv("BTCUSDT", "5"), mv("BTCEUR", "4"), mv("ETHUSDT", "3")];
        let boost = boost_from_movers(&movers);
        assert_eq!(boost.mover_stems.len(), 2);
        assert!(boost.mover_stems.contains(&crate::text::stem("btc")));
        assert!(boost.mover_stems.contains(&crate::text::stem("eth")));
    }

    #[tokio::test]
    async fn fixture_feed_respects_n() {
        let feed = FixtureMarketFeed::new(vec![
            mv("AUSDT", "1"),
            mv("BUSDT", "2"),
            mv("CUSDT", "3"),
        ]);
        let top = feed.top_movers(2).await.unwrap();
        assert_eq!(top.len(), 2);
    }

    struct FailingFeed;

    #[async_trait]
    impl MarketFeed for FailingFeed {
        async fn top_movers(&self, _n: usize) -> Result<Vec<Mover>> {
            anyhow::bail!("down")
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn fetch_boost_absorbs_feed_errors() {
        assert!(fetch_boost(&FailingFeed, 40).await.is_none());
    }
}
