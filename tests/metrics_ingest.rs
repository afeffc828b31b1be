// tests/metrics_ingest.rs
#![cfg(feature = "strict-metrics")]
use std::sync::Arc;

use crypto_newsdesk::ingest::providers::rss::RssFeedProvider;
use crypto_newsdesk::ingest::types::FeedProvider;
use crypto_newsdesk::ingest::{ArticleStore, IngestPipeline};
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::test]
async fn metrics_exposed_after_refresh() {
    // Install a local recorder for the test
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder().expect("recorder");

    // Run one refresh over the fixture feed
    let xml = std::fs::read_to_string("tests/fixtures/coindesk_rss.xml").expect("fixture");
    let store = Arc::new(ArticleStore::new());
    let providers: Vec<Box<dyn FeedProvider>> = vec![Box::new(
        RssFeedProvider::from_fixture_str("coindesk", "coindesk", &xml),
    )];
    let pipeline = IngestPipeline::new(store, providers);
    let stats = pipeline.run_once().await;
    assert!(stats.kept > 0);

    // Scrape metrics text and check series presence by substring
    let out = handle.render();
    assert!(out.contains("ingest_items_total"));
    assert!(out.contains("ingest_kept_total"));
    assert!(out.contains("ingest_dedup_total"));
    assert!(out.contains("ingest_runs_total"));
    assert!(out.contains("ingest_parse_ms"));
    assert!(out.contains("ingest_store_articles"));
}
