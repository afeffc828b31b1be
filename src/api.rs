use std::collections::HashMap;
use std::sync::Arc;

use shuttle_axum::axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::images::{BatchStatus, BatchTarget, ImageController};
use crate::identity::SelectionItem;
use crate::ingest::types::FeedItem;
use crate::ingest::{ArticleStore, IngestPipeline, RefreshStats};
use crate::keywords::KeywordSummary;
use crate::run::{RunOrchestrator, RunSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ArticleStore>,
    pub pipeline: Arc<IngestPipeline>,
    pub runs: RunOrchestrator,
    pub images: ImageController,
}

/// Handler-level failures mapped onto HTTP statuses. Internal causes are
/// logged, never leaked.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(s) => (StatusCode::BAD_REQUEST, s),
            ApiError::NotFound(s) => (StatusCode::NOT_FOUND, s),
            ApiError::Conflict(s) => (StatusCode::CONFLICT, s),
            ApiError::Internal(e) => {
                tracing::error!(error = ?e, "internal api error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/articles", get(articles))
        .route("/keywords", get(keywords))
        .route("/refresh", post(refresh))
        .route("/runs", post(start_run))
        .route("/runs/current", get(current_run))
        .route("/runs/current/logs", get(current_run_logs))
        .route("/runs/current/abandon", post(abandon_run))
        .route("/images/generate", post(generate_image))
        .route("/images/batch", post(start_image_batch).get(image_batch_status))
        .route("/images/batch/cancel", post(cancel_image_batch))
        .route("/images/attach", post(request_attach))
        .route("/images/attach/confirm", post(confirm_attach))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct ArticlesResp {
    count: usize,
    last_refresh_unix: u64,
    articles: Vec<FeedItem>,
}

async fn articles(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<ArticlesResp> {
    let articles = match q.get("keyword").map(String::as_str) {
        Some(kw) if !kw.trim().is_empty() => state.store.articles_by_keyword(kw),
        _ => state.store.articles(),
    };
    Json(ArticlesResp {
        count: articles.len(),
        last_refresh_unix: state.store.last_refresh_unix(),
        articles,
    })
}

async fn keywords(State(state): State<AppState>) -> Json<KeywordSummary> {
    Json(state.store.keyword_summary())
}

async fn refresh(State(state): State<AppState>) -> Json<RefreshStats> {
    Json(state.pipeline.run_once().await)
}

#[derive(serde::Deserialize)]
struct StartRunReq {
    item_ids: Vec<String>,
}

async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunReq>,
) -> Result<Json<RunSnapshot>, ApiError> {
    if body.item_ids.is_empty() {
        return Err(ApiError::BadRequest("item_ids must not be empty".into()));
    }
    let articles = state.store.articles();
    let mut batch = Vec::with_capacity(body.item_ids.len());
    for id in &body.item_ids {
        match articles.iter().find(|a| &a.id == id) {
            Some(item) => batch.push(SelectionItem::from_feed_item(item)),
            None => return Err(ApiError::NotFound(format!("unknown article id {id}"))),
        }
    }
    state
        .runs
        .start_run(batch)
        .await
        .map(Json)
        .map_err(|e| ApiError::Conflict(e.to_string()))
}

async fn current_run(State(state): State<AppState>) -> Result<Json<RunSnapshot>, ApiError> {
    state
        .runs
        .snapshot()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no run yet".into()))
}

async fn current_run_logs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.runs.logs_snapshot())
}

async fn abandon_run(State(state): State<AppState>) -> Result<Json<RunSnapshot>, ApiError> {
    state
        .runs
        .abandon_run()
        .await
        .map(Json)
        .map_err(|e| ApiError::Conflict(e.to_string()))
}

#[derive(serde::Deserialize)]
struct GenerateImageReq {
    item_id: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    reference_url: Option<String>,
}

#[derive(serde::Serialize)]
struct GenerateImageResp {
    item_id: String,
    url: String,
}

async fn generate_image(
    State(state): State<AppState>,
    Json(body): Json<GenerateImageReq>,
) -> Result<Json<GenerateImageResp>, ApiError> {
    let url = state
        .images
        .generate_for_item(&body.item_id, body.prompt, body.reference_url)
        .await
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(GenerateImageResp {
        item_id: body.item_id,
        url,
    }))
}

#[derive(serde::Serialize)]
struct BatchStartResp {
    queued: usize,
}

async fn start_image_batch(
    State(state): State<AppState>,
    Json(target): Json<BatchTarget>,
) -> Result<Json<BatchStartResp>, ApiError> {
    state
        .images
        .start_batch(target)
        .map(|queued| Json(BatchStartResp { queued }))
        .map_err(|e| ApiError::Conflict(e.to_string()))
}

async fn image_batch_status(State(state): State<AppState>) -> Json<BatchStatus> {
    Json(state.images.batch_status())
}

async fn cancel_image_batch(State(state): State<AppState>) -> Json<BatchStatus> {
    state.images.cancel_batch();
    Json(state.images.batch_status())
}

#[derive(serde::Deserialize)]
struct AttachReq {
    item_id: String,
}

#[derive(serde::Serialize)]
struct AttachResp {
    ticket: String,
}

async fn request_attach(
    State(state): State<AppState>,
    Json(body): Json<AttachReq>,
) -> Result<Json<AttachResp>, ApiError> {
    state
        .images
        .request_attach(&body.item_id)
        .map(|ticket| Json(AttachResp { ticket }))
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

#[derive(serde::Deserialize)]
struct ConfirmAttachReq {
    ticket: String,
}

async fn confirm_attach(
    State(state): State<AppState>,
    Json(body): Json<ConfirmAttachReq>,
) -> Result<StatusCode, ApiError> {
    state
        .images
        .confirm_attach(&body.ticket)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}
