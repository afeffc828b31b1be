// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// The router is exercised directly via tower::ServiceExt::oneshot, with the
// external pipeline and image service replaced by scripted mocks.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use serde_json::json;
use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::Request,
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use crypto_newsdesk::api::{self, AppState};
use crypto_newsdesk::images::{ImageConfig, ImageController, ImageOutcome, MockImageClient};
use crypto_newsdesk::ingest::providers::rss::RssFeedProvider;
use crypto_newsdesk::ingest::types::FeedProvider;
use crypto_newsdesk::ingest::{ArticleStore, IngestPipeline};
use crypto_newsdesk::run::export::MockExportSink;
use crypto_newsdesk::run::pipeline::{MockPipeline, TriggerAck};
use crypto_newsdesk::run::{RunConfig, RunOrchestrator};

const COINDESK_XML: &str = include_str!("fixtures/coindesk_rss.xml");
const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

struct TestApp {
    router: Router,
    publish: Arc<MockPipeline>,
    image_service: Arc<MockImageClient>,
}

/// Build the same Router the binary uses, on top of the fixture feed and
/// scripted collaborators. `ack` seeds the publish pipeline's trigger reply.
fn test_app(ack: TriggerAck) -> TestApp {
    let store = Arc::new(ArticleStore::new());
    let providers: Vec<Box<dyn FeedProvider>> = vec![Box::new(
        RssFeedProvider::from_fixture_str("coindesk", "coindesk", COINDESK_XML),
    )];
    let pipeline = Arc::new(IngestPipeline::new(store.clone(), providers));

    let publish = Arc::new(MockPipeline::new().with_ack(ack));
    let run_cfg = RunConfig {
        status_poll: Duration::from_millis(25),
        log_poll: Duration::from_millis(25),
        fast_verify: Duration::from_millis(20),
        run_timeout: Duration::from_secs(10),
        log_tail_lines: 40,
        staging_path: std::env::temp_dir()
            .join(format!("newsdesk-staging-{}.json", rand::random::<u64>())),
    };
    let runs = RunOrchestrator::new(publish.clone(), Arc::new(MockExportSink::new()), run_cfg);

    let image_service = Arc::new(MockImageClient::new());
    let image_cfg = ImageConfig {
        readiness_poll: Duration::from_millis(10),
        readiness_timeout: Duration::from_millis(200),
        ..ImageConfig::default()
    };
    let images = ImageController::new(image_service.clone(), runs.clone(), image_cfg);

    let state = AppState {
        store,
        pipeline,
        runs,
        images,
    };
    TestApp {
        router: api::create_router(state),
        publish,
        image_service,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET request")
}

fn post_json(uri: &str, payload: &Json) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("build POST request")
}

async fn body_json(resp: shuttle_axum::axum::response::Response) -> Json {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    serde_json::from_slice(&bytes).expect("parse json body")
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let app = test_app(TriggerAck::default()).router;

    let resp = app.oneshot(get("/health")).await.expect("oneshot /health");
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    assert_eq!(String::from_utf8(bytes).expect("utf8").trim(), "ok");
}

#[tokio::test]
async fn api_refresh_populates_articles_and_keywords() {
    let app = test_app(TriggerAck::default()).router;

    let resp = app
        .clone()
        .oneshot(post_json("/refresh", &json!({})))
        .await
        .expect("oneshot /refresh");
    assert_eq!(resp.status(), StatusCode::OK);
    let stats = body_json(resp).await;
    assert_eq!(stats["fetched"], 3);
    assert_eq!(stats["duplicates"], 0);
    assert_eq!(stats["kept"], 3);

    let resp = app
        .clone()
        .oneshot(get("/articles"))
        .await
        .expect("oneshot /articles");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["count"], 3);
    // Newest first, display ranks stamped.
    assert_eq!(v["articles"][0]["id"], "cd-1001");
    assert_eq!(v["articles"][0]["rank"], 1);
    assert_eq!(v["articles"][2]["id"], "cd-1004");

    // Keyword filter narrows the view.
    let resp = app
        .clone()
        .oneshot(get("/articles?keyword=bitcoin"))
        .await
        .expect("oneshot filtered /articles");
    let v = body_json(resp).await;
    assert_eq!(v["count"], 1);
    assert_eq!(v["articles"][0]["id"], "cd-1001");

    let resp = app
        .oneshot(get("/keywords"))
        .await
        .expect("oneshot /keywords");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert!(v["top_keywords"].as_array().is_some_and(|a| !a.is_empty()));
    assert!(v["most_frequent"].is_array());
}

#[tokio::test]
async fn api_runs_lifecycle() {
    let TestApp {
        router: app,
        publish,
        ..
    } = test_app(TriggerAck::default());
    *publish.log_lines.lock().unwrap() = vec!["staging selection".to_string()];

    // Nothing has run yet.
    let resp = app
        .clone()
        .oneshot(get("/runs/current"))
        .await
        .expect("oneshot current");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .clone()
        .oneshot(post_json("/runs", &json!({ "item_ids": [] })))
        .await
        .expect("oneshot empty runs");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    app.clone()
        .oneshot(post_json("/refresh", &json!({})))
        .await
        .expect("oneshot /refresh");

    let resp = app
        .clone()
        .oneshot(post_json("/runs", &json!({ "item_ids": ["missing"] })))
        .await
        .expect("oneshot unknown id");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let v = body_json(resp).await;
    assert!(v["error"].as_str().unwrap_or("").contains("unknown article id"));

    let resp = app
        .clone()
        .oneshot(post_json("/runs", &json!({ "item_ids": ["cd-1001", "cd-1004"] })))
        .await
        .expect("oneshot start run");
    assert_eq!(resp.status(), StatusCode::OK);
    let snap = body_json(resp).await;
    let token = snap["token"].as_str().expect("token").to_string();
    assert!(token.starts_with("run-"));
    assert_eq!(snap["phase"], "polling");
    assert_eq!(snap["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(snap["items"][0]["state"], "running");

    // Second run while one is active is refused.
    let resp = app
        .clone()
        .oneshot(post_json("/runs", &json!({ "item_ids": ["cd-1001"] })))
        .await
        .expect("oneshot second run");
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = app
        .clone()
        .oneshot(get("/runs/current"))
        .await
        .expect("oneshot current");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["token"], token.as_str());

    // Give the log poll a tick, then read the tail.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let resp = app
        .clone()
        .oneshot(get("/runs/current/logs"))
        .await
        .expect("oneshot logs");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v, json!(["staging selection"]));

    let resp = app
        .clone()
        .oneshot(post_json("/runs/current/abandon", &json!({})))
        .await
        .expect("oneshot abandon");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["phase"], "timed_out");
    assert_eq!(v["items"][0]["state"], "failed");

    // The archived run still answers.
    let resp = app
        .clone()
        .oneshot(get("/runs/current"))
        .await
        .expect("oneshot current after abandon");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["phase"], "timed_out");

    // And abandoning again has nothing to act on.
    let resp = app
        .oneshot(post_json("/runs/current/abandon", &json!({})))
        .await
        .expect("oneshot second abandon");
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn api_image_generate_and_two_phase_attach() {
    // Positional ack id: the single selected item resolves to 801 right away.
    let TestApp {
        router: app,
        image_service,
        ..
    } = test_app(TriggerAck {
        ids: Some(vec![801]),
        ..TriggerAck::default()
    });
    image_service.push(ImageOutcome::Ready {
        url: "https://img.test/cd-1001.png".into(),
    });

    app.clone()
        .oneshot(post_json("/refresh", &json!({})))
        .await
        .expect("oneshot /refresh");
    let resp = app
        .clone()
        .oneshot(post_json("/runs", &json!({ "item_ids": ["cd-1001"] })))
        .await
        .expect("oneshot start run");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(post_json("/images/generate", &json!({ "item_id": "cd-1001" })))
        .await
        .expect("oneshot generate");
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["item_id"], "cd-1001");
    assert_eq!(v["url"], "https://img.test/cd-1001.png");

    let resp = app
        .clone()
        .oneshot(post_json("/images/attach", &json!({ "item_id": "cd-1001" })))
        .await
        .expect("oneshot attach request");
    assert_eq!(resp.status(), StatusCode::OK);
    let ticket = body_json(resp).await["ticket"]
        .as_str()
        .expect("ticket")
        .to_string();
    // Requesting the ticket writes nothing.
    assert!(image_service.attached.lock().unwrap().is_empty());

    let resp = app
        .clone()
        .oneshot(post_json(
            "/images/attach/confirm",
            &json!({ "ticket": ticket }),
        ))
        .await
        .expect("oneshot attach confirm");
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        image_service.attached.lock().unwrap().as_slice(),
        &[(801, "https://img.test/cd-1001.png".to_string())]
    );

    // A ticket is single-use.
    let resp = app
        .oneshot(post_json(
            "/images/attach/confirm",
            &json!({ "ticket": ticket }),
        ))
        .await
        .expect("oneshot repeat confirm");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_image_batch_endpoints() {
    let TestApp {
        router: app,
        image_service,
        ..
    } = test_app(TriggerAck {
        ids: Some(vec![901, 902]),
        ..TriggerAck::default()
    });
    image_service.push(ImageOutcome::Ready {
        url: "https://img.test/cover.png".into(),
    });

    app.clone()
        .oneshot(post_json("/refresh", &json!({})))
        .await
        .expect("oneshot /refresh");
    app.clone()
        .oneshot(post_json("/runs", &json!({ "item_ids": ["cd-1001", "cd-1004"] })))
        .await
        .expect("oneshot start run");

    let resp = app
        .clone()
        .oneshot(get("/images/batch"))
        .await
        .expect("oneshot batch status");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["running"], false);

    let resp = app
        .clone()
        .oneshot(post_json("/images/batch", &json!({})))
        .await
        .expect("oneshot batch start");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["queued"], 2);

    // Wait out the sequential batch via the status endpoint.
    let mut finished = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let resp = app
            .clone()
            .oneshot(get("/images/batch"))
            .await
            .expect("oneshot batch poll");
        let v = body_json(resp).await;
        if v["running"] == false {
            assert_eq!(v["done"], 2);
            assert_eq!(v["failed"], 0);
            assert_eq!(v["cancelled"], false);
            finished = true;
            break;
        }
    }
    assert!(finished, "batch never finished");

    // Cancel outside a running batch just reports current state.
    let resp = app
        .oneshot(post_json("/images/batch/cancel", &json!({})))
        .await
        .expect("oneshot batch cancel");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["running"], false);
}
