// src/images.rs
//! Image generation against a rate-limited external service: per-item
//! generation gated on run readiness, capped exponential backoff on
//! "not ready" responses, strictly sequential batches with cooperative
//! cancellation, and a two-phase (request, confirm) attach step so a durable
//! write never happens by accident.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::run::{ItemSnapshot, RunOrchestrator};
use crate::text;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("image_requests_total", "Generation attempts sent to the image service.");
        describe_counter!("image_retries_total", "Not-ready responses that scheduled a retry.");
        describe_counter!("image_timeouts_total", "Generations abandoned after exhausting retries.");
        describe_counter!("image_attach_total", "Confirmed durable attachments.");
    });
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub readiness_poll: Duration,
    pub readiness_timeout: Duration,
    pub backoff_start: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub size: String,
    pub style: String,
    pub model: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            readiness_poll: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(60),
            backoff_start: Duration::from_secs(1),
            backoff_factor: 1.6,
            backoff_cap: Duration::from_secs(15),
            max_attempts: 12,
            size: "1024x1024".into(),
            style: "editorial".into(),
            model: "sdxl".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub id: u64,
    pub slug: String,
    pub title: String,
    pub excerpt: Option<String>,
    pub prompt: Option<String>,
    pub reference_url: Option<String>,
    pub size: String,
    pub style: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Ready { url: String },
    NotReady { retry_after: Option<Duration> },
}

#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn generate(&self, req: &ImageRequest) -> Result<ImageOutcome>;
    async fn attach(&self, id: u64, url: &str) -> Result<()>;
}

/// Wait scheduling behind a seam so retry policies are testable without
/// real sleeps.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, d: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Which run items a batch covers, probed in this order: an explicit
/// multi-select, else a keyword-filtered view, else the whole run.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchTarget {
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchStatus {
    pub running: bool,
    pub cancelled: bool,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub current: Option<String>,
}

struct PendingAttach {
    id: u64,
    url: String,
}

#[derive(Clone)]
pub struct ImageController {
    inner: Arc<ImagesInner>,
}

struct ImagesInner {
    client: Arc<dyn ImageClient>,
    runs: RunOrchestrator,
    cfg: ImageConfig,
    sleeper: Arc<dyn Sleeper>,
    batch_cancel: Arc<AtomicBool>,
    batch: Mutex<BatchStatus>,
    generated: Mutex<HashMap<String, String>>,
    pending_attach: Mutex<HashMap<String, PendingAttach>>,
}

impl ImageController {
    pub fn new(client: Arc<dyn ImageClient>, runs: RunOrchestrator, cfg: ImageConfig) -> Self {
        ensure_metrics_described();
        Self::with_sleeper(client, runs, cfg, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        client: Arc<dyn ImageClient>,
        runs: RunOrchestrator,
        cfg: ImageConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(ImagesInner {
                client,
                runs,
                cfg,
                sleeper,
                batch_cancel: Arc::new(AtomicBool::new(false)),
                batch: Mutex::new(BatchStatus::default()),
                generated: Mutex::new(HashMap::new()),
                pending_attach: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn generated_url(&self, item_id: &str) -> Option<String> {
        self.inner
            .generated
            .lock()
            .expect("generated map mutex poisoned")
            .get(item_id)
            .cloned()
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.inner.batch.lock().expect("batch mutex poisoned").clone()
    }

    /// Cooperative cancel; takes effect between items, never mid-request.
    pub fn cancel_batch(&self) {
        self.inner.batch_cancel.store(true, Ordering::SeqCst);
        let mut b = self.inner.batch.lock().expect("batch mutex poisoned");
        if b.running {
            b.cancelled = true;
        }
    }

    /// Generate one image for a run item, waiting for its id to resolve
    /// first. Returns the image URL on success.
    pub async fn generate_for_item(
        &self,
        item_id: &str,
        prompt: Option<String>,
        reference_url: Option<String>,
    ) -> Result<String> {
        let resolved = self.wait_until_ready(item_id).await?;
        let snapshot_item = self
            .run_item(item_id)
            .with_context(|| format!("item {item_id} not part of the current run"))?;
        let req = self.build_request(resolved, &snapshot_item, prompt, reference_url);
        let url = self.generate_with_backoff(&req).await?;
        self.inner
            .generated
            .lock()
            .expect("generated map mutex poisoned")
            .insert(item_id.to_string(), url.clone());
        Ok(url)
    }

    /// Readiness = the orchestrator has resolved this item's numeric id.
    /// Polls until the readiness window closes.
    async fn wait_until_ready(&self, item_id: &str) -> Result<u64> {
        let deadline_polls = (self.inner.cfg.readiness_timeout.as_millis()
            / self.inner.cfg.readiness_poll.as_millis().max(1))
            as u64;
        let mut polls = 0u64;
        loop {
            if let Some(id) = self.inner.runs.resolved_id(item_id) {
                return Ok(id);
            }
            if polls >= deadline_polls {
                anyhow::bail!("item {item_id} never reached id-resolved state");
            }
            polls += 1;
            self.inner.sleeper.sleep(self.inner.cfg.readiness_poll).await;
        }
    }

    fn run_item(&self, item_id: &str) -> Option<ItemSnapshot> {
        self.inner
            .runs
            .snapshot()?
            .items
            .into_iter()
            .find(|it| it.item_id == item_id)
    }

    fn build_request(
        &self,
        id: u64,
        item: &ItemSnapshot,
        prompt: Option<String>,
        reference_url: Option<String>,
    ) -> ImageRequest {
        ImageRequest {
            id,
            slug: item.slug.clone(),
            title: item.title.clone(),
            excerpt: (!item.summary.is_empty()).then(|| item.summary.clone()),
            prompt,
            reference_url,
            size: self.inner.cfg.size.clone(),
            style: self.inner.cfg.style.clone(),
            model: self.inner.cfg.model.clone(),
        }
    }

    /// Retry "not ready" with exponential backoff: scheduled waits never
    /// shrink and never exceed the cap. A server-provided minimum wait is
    /// honored in full for the wait it arrives on and ratchets the schedule
    /// up to the cap, so later waits never fall back below it. Transient
    /// transport errors burn an attempt too.
    async fn generate_with_backoff(&self, req: &ImageRequest) -> Result<String> {
        let cfg = &self.inner.cfg;
        let mut backoff = cfg.backoff_start;
        for attempt in 1..=cfg.max_attempts {
            counter!("image_requests_total").increment(1);
            match self.inner.client.generate(req).await {
                Ok(ImageOutcome::Ready { url }) => return Ok(url),
                Ok(ImageOutcome::NotReady { retry_after }) => {
                    counter!("image_retries_total").increment(1);
                    if attempt == cfg.max_attempts {
                        break;
                    }
                    if let Some(hint) = retry_after {
                        backoff = backoff.max(hint.min(cfg.backoff_cap));
                    }
                    let wait = retry_after.map_or(backoff, |hint| backoff.max(hint));
                    tracing::debug!(
                        slug = %req.slug,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "image not ready, backing off"
                    );
                    self.inner.sleeper.sleep(wait).await;
                }
                Err(e) => {
                    if attempt == cfg.max_attempts {
                        return Err(e).context("image generation");
                    }
                    tracing::warn!(error = ?e, slug = %req.slug, attempt, "image request failed, retrying");
                    self.inner.sleeper.sleep(backoff).await;
                }
            }
            backoff = Duration::from_secs_f64(
                (backoff.as_secs_f64() * cfg.backoff_factor).min(cfg.backoff_cap.as_secs_f64()),
            );
        }
        counter!("image_timeouts_total").increment(1);
        Err(anyhow!(
            "image generation for {} still not ready after {} attempts",
            req.slug,
            cfg.max_attempts
        ))
    }

    /// Start a sequential batch over the resolved target set. Returns the
    /// number of items queued; progress is observable via `batch_status`.
    pub fn start_batch(&self, target: BatchTarget) -> Result<usize> {
        let snapshot = self
            .inner
            .runs
            .snapshot()
            .context("no run to generate images for")?;
        let items = resolve_targets(&snapshot.items, &target);
        anyhow::ensure!(!items.is_empty(), "batch target matched no items");

        {
            let mut b = self.inner.batch.lock().expect("batch mutex poisoned");
            anyhow::ensure!(!b.running, "an image batch is already running");
            *b = BatchStatus {
                running: true,
                cancelled: false,
                total: items.len(),
                done: 0,
                failed: 0,
                current: None,
            };
        }
        self.inner.batch_cancel.store(false, Ordering::SeqCst);

        let controller = self.clone();
        let queued = items.len();
        tokio::spawn(async move {
            controller.run_batch(items).await;
        });
        Ok(queued)
    }

    // The external generator is rate-limited; one in-flight request at a time.
    async fn run_batch(&self, items: Vec<ItemSnapshot>) {
        for item in items {
            if self.inner.batch_cancel.load(Ordering::SeqCst) {
                tracing::info!("image batch cancelled between items");
                break;
            }
            {
                let mut b = self.inner.batch.lock().expect("batch mutex poisoned");
                b.current = Some(item.item_id.clone());
            }
            let outcome = self.generate_for_item(&item.item_id, None, None).await;
            let mut b = self.inner.batch.lock().expect("batch mutex poisoned");
            match outcome {
                Ok(_) => b.done += 1,
                Err(e) => {
                    tracing::warn!(error = ?e, item = %item.item_id, "batch item failed");
                    b.failed += 1;
                }
            }
        }
        let mut b = self.inner.batch.lock().expect("batch mutex poisoned");
        b.running = false;
        b.current = None;
    }

    /// Phase one of attach: record the intent, hand back a ticket. Nothing
    /// durable happens yet.
    pub fn request_attach(&self, item_id: &str) -> Result<String> {
        let id = self
            .inner
            .runs
            .resolved_id(item_id)
            .with_context(|| format!("item {item_id} has no resolved id"))?;
        let url = self
            .generated_url(item_id)
            .with_context(|| format!("item {item_id} has no generated image"))?;
        let ticket = attach_ticket(item_id, &url);
        self.inner
            .pending_attach
            .lock()
            .expect("attach mutex poisoned")
            .insert(ticket.clone(), PendingAttach { id, url });
        Ok(ticket)
    }

    /// Phase two: only a ticket from `request_attach` performs the write.
    pub async fn confirm_attach(&self, ticket: &str) -> Result<()> {
        let pending = self
            .inner
            .pending_attach
            .lock()
            .expect("attach mutex poisoned")
            .remove(ticket)
            .context("unknown or already-confirmed attach ticket")?;
        self.inner
            .client
            .attach(pending.id, &pending.url)
            .await
            .context("attach write")?;
        counter!("image_attach_total").increment(1);
        tracing::info!(id = pending.id, url = %pending.url, "image attached");
        Ok(())
    }
}

fn attach_ticket(item_id: &str, url: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(item_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(url.as_bytes());
    hasher.update(chrono::Utc::now().timestamp_millis().to_be_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn resolve_targets(items: &[ItemSnapshot], target: &BatchTarget) -> Vec<ItemSnapshot> {
    if !target.item_ids.is_empty() {
        return items
            .iter()
            .filter(|it| target.item_ids.iter().any(|id| id == &it.item_id))
            .cloned()
            .collect();
    }
    if let Some(keyword) = target.keyword.as_deref() {
        let toks = text::tokenize(keyword);
        let wanted = match toks.first() {
            Some(t) => text::stem(t),
            None => text::stem(keyword.trim().to_lowercase().as_str()),
        };
        return items
            .iter()
            .filter(|it| {
                text::stem_tokens(&format!("{} {}", it.title, it.summary))
                    .iter()
                    .any(|s| s == &wanted)
            })
            .cloned()
            .collect();
    }
    items.to_vec()
}

pub struct HttpImageClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpImageClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    url: Option<String>,
    #[serde(alias = "retryAfterSecs", alias = "retry_after")]
    retry_after_secs: Option<u64>,
}

#[async_trait]
impl ImageClient for HttpImageClient {
    async fn generate(&self, req: &ImageRequest) -> Result<ImageOutcome> {
        let resp = self
            .client
            .post(format!("{}/generate", self.base_url))
            .timeout(self.timeout)
            .json(req)
            .send()
            .await
            .context("image generate post")?;
        let status = resp.status();
        // 202/503 are the service's retryable "still rendering" answers.
        if status == reqwest::StatusCode::ACCEPTED
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            let body: GenerateResponse = resp.json().await.unwrap_or(GenerateResponse {
                url: None,
                retry_after_secs: None,
            });
            return Ok(ImageOutcome::NotReady {
                retry_after: body.retry_after_secs.map(Duration::from_secs),
            });
        }
        resp.error_for_status_ref().context("image generate status")?;
        let body: GenerateResponse = resp.json().await.context("image generate decode")?;
        match body.url {
            Some(url) => Ok(ImageOutcome::Ready { url }),
            None => Ok(ImageOutcome::NotReady {
                retry_after: body.retry_after_secs.map(Duration::from_secs),
            }),
        }
    }

    async fn attach(&self, id: u64, url: &str) -> Result<()> {
        #[derive(Serialize)]
        struct AttachRequest<'a> {
            id: u64,
            url: &'a str,
        }
        let resp = self
            .client
            .post(format!("{}/attach", self.base_url))
            .timeout(self.timeout)
            .json(&AttachRequest { id, url })
            .send()
            .await
            .context("image attach post")?;
        resp.error_for_status().context("image attach status")?;
        Ok(())
    }
}

// --- Test helpers ---
/// Scripted image service: outcomes drain in order (the last repeats),
/// attaches are recorded.
pub struct MockImageClient {
    pub outcomes: Mutex<std::collections::VecDeque<ImageOutcome>>,
    pub generate_calls: std::sync::atomic::AtomicUsize,
    pub attached: Mutex<Vec<(u64, String)>>,
}

impl MockImageClient {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(std::collections::VecDeque::new()),
            generate_calls: std::sync::atomic::AtomicUsize::new(0),
            attached: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: ImageOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }
}

impl Default for MockImageClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageClient for MockImageClient {
    async fn generate(&self, _req: &ImageRequest) -> Result<ImageOutcome> {
        self.generate_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut q = self.outcomes.lock().unwrap();
        let outcome = if q.len() > 1 {
            q.pop_front()
        } else {
            q.front().cloned()
        };
        Ok(outcome.unwrap_or(ImageOutcome::NotReady { retry_after: None }))
    }

    async fn attach(&self, id: u64, url: &str) -> Result<()> {
        self.attached.lock().unwrap().push((id, url.to_string()));
        Ok(())
    }
}

/// Records requested waits instead of sleeping.
pub struct RecordingSleeper {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self {
            waits: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, d: Duration) {
        self.waits.lock().unwrap().push(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_prefer_explicit_ids_then_keyword_then_all() {
        let items = vec![
            ItemSnapshot {
                item_id: "a".into(),
                title: "Bitcoin rallies".into(),
                slug: "bitcoin-rallies".into(),
                summary: String::new(),
                state: crate::run::ItemState::Done,
                resolved_id: Some(1),
                diagnostics: None,
            },
            ItemSnapshot {
                item_id: "b".into(),
                title: "Ether slips".into(),
                slug: "ether-slips".into(),
                summary: String::new(),
                state: crate::run::ItemState::Done,
                resolved_id: Some(2),
                diagnostics: None,
            },
        ];

        let explicit = resolve_targets(
            &items,
            &BatchTarget {
                item_ids: vec!["b".into()],
                keyword: Some("bitcoin".into()),
            },
        );
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].item_id, "b");

        let filtered = resolve_targets(
            &items,
            &BatchTarget {
                item_ids: vec![],
                keyword: Some("bitcoin".into()),
            },
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].item_id, "a");

        let all = resolve_targets(
            &items,
            &BatchTarget {
                item_ids: vec![],
                keyword: None,
            },
        );
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn attach_tickets_are_distinct_per_item() {
        let t1 = attach_ticket("a", "https://img/1.png");
        let t2 = attach_ticket("b", "https://img/1.png");
        assert_ne!(t1, t2);
    }
}
