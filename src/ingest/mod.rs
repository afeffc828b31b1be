// src/ingest/mod.rs
pub mod dedup;
pub mod providers;
pub mod types;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::ingest::types::{FeedItem, FeedProvider};
use crate::keywords::{self, KeywordConfig, KeywordSummary};
use crate::market::{self, MarketFeed};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_items_total", "Total items parsed from feed providers.");
        describe_counter!("ingest_kept_total", "Items kept after deduplication.");
        describe_counter!("ingest_dedup_total", "Items removed as duplicates.");
        describe_counter!(
            "ingest_provider_errors_total",
            "Provider fetch/parse errors."
        );
        describe_counter!("ingest_runs_total", "Completed refresh cycles.");
        describe_counter!(
            "market_feed_errors_total",
            "Market mover fetches that failed (boost skipped)."
        );
        describe_histogram!("ingest_parse_ms", "Provider parse time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when the refresh pipeline last ran."
        );
        describe_gauge!("ingest_store_articles", "Articles currently held in the store.");
    });
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RefreshStats {
    pub fetched: usize,
    pub duplicates: usize,
    pub kept: usize,
}

/// Shared article state swapped wholesale on each refresh. Readers only ever
/// see a complete, consistently-ranked batch.
#[derive(Default)]
pub struct ArticleStore {
    inner: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    items: Vec<FeedItem>,
    keywords: KeywordSummary,
    last_refresh_unix: u64,
}

impl ArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn replace(&self, items: Vec<FeedItem>, keywords: KeywordSummary) {
        let mut s = self.inner.lock().expect("article store mutex poisoned");
        s.items = items;
        s.keywords = keywords;
        s.last_refresh_unix = chrono::Utc::now().timestamp().max(0) as u64;
    }

    pub fn articles(&self) -> Vec<FeedItem> {
        self.inner
            .lock()
            .expect("article store mutex poisoned")
            .items
            .clone()
    }

    pub fn articles_by_keyword(&self, keyword: &str) -> Vec<FeedItem> {
        let s = self.inner.lock().expect("article store mutex poisoned");
        keywords::filter_by_keyword(&s.items, keyword)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn keyword_summary(&self) -> KeywordSummary {
        self.inner
            .lock()
            .expect("article store mutex poisoned")
            .keywords
            .clone()
    }

    pub fn last_refresh_unix(&self) -> u64 {
        self.inner
            .lock()
            .expect("article store mutex poisoned")
            .last_refresh_unix
    }
}

/// Fetch, dedup, rank and score, then swap the store. Providers fail
/// independently; one dead feed never empties the site.
pub struct IngestPipeline {
    store: Arc<ArticleStore>,
    providers: Vec<Box<dyn FeedProvider>>,
    market: Option<Arc<dyn MarketFeed>>,
    top_movers: usize,
    kw_cfg: KeywordConfig,
}

impl IngestPipeline {
    pub fn new(store: Arc<ArticleStore>, providers: Vec<Box<dyn FeedProvider>>) -> Self {
        ensure_metrics_described();
        Self {
            store,
            providers,
            market: None,
            top_movers: market::DEFAULT_TOP_MOVERS,
            kw_cfg: KeywordConfig::default(),
        }
    }

    pub fn with_market(mut self, feed: Arc<dyn MarketFeed>, top_movers: usize) -> Self {
        self.market = Some(feed);
        self.top_movers = top_movers;
        self
    }

    pub fn with_keyword_config(mut self, cfg: KeywordConfig) -> Self {
        self.kw_cfg = cfg;
        self
    }

    pub async fn run_once(&self) -> RefreshStats {
        let mut raw = Vec::new();
        for p in &self.providers {
            match p.fetch_latest().await {
                Ok(mut v) => raw.append(&mut v),
                Err(e) => {
                    tracing::warn!(error = ?e, provider = p.name(), "provider error");
                    counter!("ingest_provider_errors_total").increment(1);
                }
            }
        }
        let fetched = raw.len();

        // Dedup first (arrival order, first occurrence wins), then order the
        // survivors newest-first and stamp display ranks.
        let (mut kept, duplicates) = dedup::dedup_items(raw);
        kept.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        for (i, item) in kept.iter_mut().enumerate() {
            item.rank = i + 1;
        }

        let boost = match self.market.as_deref() {
            Some(feed) => market::fetch_boost(feed, self.top_movers).await,
            None => None,
        };
        let summary = keywords::score_corpus(&kept, boost.as_ref(), &self.kw_cfg);

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        counter!("ingest_kept_total").increment(kept.len() as u64);
        counter!("ingest_dedup_total").increment(duplicates as u64);
        counter!("ingest_runs_total").increment(1);
        gauge!("ingest_pipeline_last_run_ts").set(now as f64);
        gauge!("ingest_store_articles").set(kept.len() as f64);

        let stats = RefreshStats {
            fetched,
            duplicates,
            kept: kept.len(),
        };
        self.store.replace(kept, summary);
        stats
    }
}

/// Spawn the periodic refresh loop.
pub fn spawn_ingest_scheduler(pipeline: Arc<IngestPipeline>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let stats = pipeline.run_once().await;
            tracing::info!(
                target: "ingest",
                fetched = stats.fetched,
                kept = stats.kept,
                dedup = stats.duplicates,
                "refresh tick"
            );
        }
    })
}
