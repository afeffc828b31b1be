//! Crypto Newsdesk — Binary Entrypoint
//! Boots the Axum HTTP server, wiring the feed refresh loop, publish-run
//! orchestration, image generation, and middleware.
//!
//! See `README.md` for quickstart.

use std::sync::Arc;
use std::time::Duration;

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crypto_newsdesk::api::{self, AppState};
use crypto_newsdesk::config::NewsdeskConfig;
use crypto_newsdesk::images::{HttpImageClient, ImageController};
use crypto_newsdesk::ingest::types::FeedProvider;
use crypto_newsdesk::ingest::{spawn_ingest_scheduler, ArticleStore, IngestPipeline};
use crypto_newsdesk::market::HttpMarketFeed;
use crypto_newsdesk::metrics::Metrics;
use crypto_newsdesk::notify::WebhookNotifier;
use crypto_newsdesk::run::export::{ExportSink, HttpExportSink, NullExportSink};
use crypto_newsdesk::run::pipeline::{HttpPipelineClient, PipelineClient};
use crypto_newsdesk::run::RunOrchestrator;

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR SHUTTLE_ENV in {local, development, dev})
///   - NEWSDESK_DEV_LOG=1
fn enable_dev_tracing() {
    let dev_flag = std::env::var("NEWSDESK_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("SHUTTLE_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crypto_newsdesk=info,ingest=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[cfg(feature = "ingest-http")]
fn build_providers(cfg: &NewsdeskConfig) -> Vec<Box<dyn FeedProvider>> {
    use crypto_newsdesk::ingest::providers::rss::RssFeedProvider;
    cfg.feeds
        .iter()
        .map(|f| {
            Box::new(RssFeedProvider::from_url(
                f.display_name().to_string(),
                f.source.clone(),
                f.url.clone(),
            )) as Box<dyn FeedProvider>
        })
        .collect()
}

#[cfg(not(feature = "ingest-http"))]
fn build_providers(_cfg: &NewsdeskConfig) -> Vec<Box<dyn FeedProvider>> {
    tracing::warn!("built without feature `ingest-http`; starting with no live feeds");
    Vec::new()
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    // Initialize dev tracing early (no-op in production).
    enable_dev_tracing();

    let cfg = NewsdeskConfig::load_default().expect("Failed to load newsdesk config");

    let metrics = Metrics::init(cfg.refresh_secs);

    // --- Article ingest ---
    let store = Arc::new(ArticleStore::new());
    let mut pipeline = IngestPipeline::new(store.clone(), build_providers(&cfg))
        .with_keyword_config(cfg.keyword_config());
    if let Some(url) = &cfg.market_url {
        pipeline = pipeline.with_market(Arc::new(HttpMarketFeed::new(url.clone())), cfg.top_movers);
    }
    let pipeline = Arc::new(pipeline);
    // The scheduler's first tick fires immediately and primes the store.
    spawn_ingest_scheduler(pipeline.clone(), Duration::from_secs(cfg.refresh_secs));

    // --- Publish-run orchestration ---
    let pipeline_url = cfg
        .pipeline_url
        .clone()
        .unwrap_or_else(|| "http://localhost:8090".to_string());
    let pipeline_client: Arc<dyn PipelineClient> = Arc::new(HttpPipelineClient::new(pipeline_url));
    let export: Arc<dyn ExportSink> = match &cfg.export_url {
        Some(url) => Arc::new(HttpExportSink::new(url.clone())),
        None => Arc::new(NullExportSink),
    };
    let mut runs = RunOrchestrator::new(pipeline_client, export, cfg.run.to_run_config());
    match cfg.resolved_webhook_url() {
        Ok(Some(url)) => runs = runs.with_notifier(WebhookNotifier::new(url)),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = ?e, "webhook notifications disabled"),
    }

    // --- Image generation ---
    let image_url = cfg
        .images
        .base_url
        .clone()
        .unwrap_or_else(|| "http://localhost:8091".to_string());
    let images = ImageController::new(
        Arc::new(HttpImageClient::new(image_url)),
        runs.clone(),
        cfg.images.to_image_config(),
    );

    let state = AppState {
        store,
        pipeline,
        runs,
        images,
    };
    let router = api::create_router(state).merge(metrics.router());

    Ok(router.into())
}
