// src/run/pipeline.rs
//! Client for the external publish pipeline: trigger, status/log polling,
//! selection echo, and authoritative record lookups. Every call carries an
//! explicit timeout; a stuck pipeline can slow a run down but never hang it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::identity::{SelectionItem, SummaryItem};

/// Acknowledgement from the pipeline trigger. Everything is optional; the
/// orchestrator falls back to client-derived expectations for absent fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerAck {
    pub count: Option<usize>,
    pub ids: Option<Vec<u64>>,
    pub slugs: Option<Vec<String>>,
    pub token: Option<String>,
    #[serde(alias = "invocationId")]
    pub invocation_id: Option<String>,
}

/// The pipeline's reported outcome: a count plus result items, optionally
/// echoing the run token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultSummary {
    pub count: Option<usize>,
    #[serde(default)]
    pub items: Vec<SummaryItem>,
    pub token: Option<String>,
}

impl ResultSummary {
    pub fn reported_count(&self) -> usize {
        self.count.unwrap_or(self.items.len())
    }

    /// Token on the summary itself or on any of its items.
    pub fn carries_token(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
            || self.items.iter().any(|i| i.token.as_deref() == Some(token))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineStatus {
    #[serde(default)]
    pub finished: bool,
    pub summary: Option<ResultSummary>,
}

/// Echo of the selection the pipeline is processing; a fallback identity
/// source while the result summary is still pending.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectionStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub items: Vec<SummaryItem>,
}

/// Authoritative record as stored; the id-keyed lookup is the only terminal
/// confirmation the orchestrator trusts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecordDetail {
    pub id: u64,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub thumbnail: Option<String>,
}

#[async_trait]
pub trait PipelineClient: Send + Sync {
    async fn trigger(&self, batch: &[SelectionItem], token: &str) -> Result<TriggerAck>;
    async fn status(&self, since: u64) -> Result<PipelineStatus>;
    /// Display-only log tail; never used for state decisions.
    async fn logs(&self, lines: usize, since: u64) -> Result<Vec<String>>;
    async fn selection_status(&self) -> Result<SelectionStatus>;
    async fn record_by_id(&self, id: u64) -> Result<Option<RecordDetail>>;
    /// Lower-trust search path, for operator diagnostics only.
    async fn record_by_title(&self, query: &str) -> Result<Option<RecordDetail>>;
}

#[derive(Serialize)]
struct TriggerItem<'a> {
    slug: &'a str,
    title: &'a str,
    summary: &'a str,
}

#[derive(Serialize)]
struct TriggerRequest<'a> {
    token: &'a str,
    items: Vec<TriggerItem<'a>>,
}

// Log responses come wrapped or bare depending on pipeline version.
#[derive(Deserialize)]
#[serde(untagged)]
enum LogsAny {
    Wrapped { lines: Vec<String> },
    Bare(Vec<String>),
}

pub struct HttpPipelineClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPipelineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl PipelineClient for HttpPipelineClient {
    async fn trigger(&self, batch: &[SelectionItem], token: &str) -> Result<TriggerAck> {
        let req = TriggerRequest {
            token,
            items: batch
                .iter()
                .map(|s| TriggerItem {
                    slug: &s.slug,
                    title: &s.title,
                    summary: &s.summary,
                })
                .collect(),
        };
        let resp = self
            .client
            .post(self.url("/pipeline/trigger"))
            .timeout(self.timeout)
            .json(&req)
            .send()
            .await
            .context("pipeline trigger post")?;
        resp.error_for_status_ref().context("pipeline trigger status")?;
        resp.json().await.context("pipeline trigger decode")
    }

    async fn status(&self, since: u64) -> Result<PipelineStatus> {
        let resp = self
            .client
            .get(self.url("/pipeline/status"))
            .query(&[("since", since)])
            .timeout(self.timeout)
            .send()
            .await
            .context("pipeline status get")?;
        resp.error_for_status_ref().context("pipeline status code")?;
        resp.json().await.context("pipeline status decode")
    }

    async fn logs(&self, lines: usize, since: u64) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/pipeline/logs"))
            .query(&[("lines", lines as u64), ("since", since)])
            .timeout(self.timeout)
            .send()
            .await
            .context("pipeline logs get")?;
        resp.error_for_status_ref().context("pipeline logs code")?;
        let any: LogsAny = resp.json().await.context("pipeline logs decode")?;
        Ok(match any {
            LogsAny::Wrapped { lines } => lines,
            LogsAny::Bare(lines) => lines,
        })
    }

    async fn selection_status(&self) -> Result<SelectionStatus> {
        let resp = self
            .client
            .get(self.url("/pipeline/selection"))
            .timeout(self.timeout)
            .send()
            .await
            .context("selection status get")?;
        resp.error_for_status_ref().context("selection status code")?;
        resp.json().await.context("selection status decode")
    }

    async fn record_by_id(&self, id: u64) -> Result<Option<RecordDetail>> {
        let resp = self
            .client
            .get(self.url(&format!("/records/{id}")))
            .timeout(self.timeout)
            .send()
            .await
            .context("record lookup get")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.error_for_status_ref().context("record lookup code")?;
        let detail: RecordDetail = resp.json().await.context("record lookup decode")?;
        Ok(Some(detail))
    }

    async fn record_by_title(&self, query: &str) -> Result<Option<RecordDetail>> {
        let resp = self
            .client
            .get(self.url("/records/search"))
            .query(&[("title", query)])
            .timeout(self.timeout)
            .send()
            .await
            .context("record search get")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.error_for_status_ref().context("record search code")?;
        // Search endpoints answer with a single best hit or an array.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SearchAny {
            One(RecordDetail),
            Many(Vec<RecordDetail>),
        }
        let any: SearchAny = resp.json().await.context("record search decode")?;
        Ok(match any {
            SearchAny::One(d) => Some(d),
            SearchAny::Many(v) => v.into_iter().next(),
        })
    }
}

// --- Test helper ---
/// Scripted pipeline: statuses are consumed in order (the last one repeats),
/// records come from a fixed map, every call is counted.
pub struct MockPipeline {
    pub ack: std::sync::Mutex<TriggerAck>,
    pub statuses: std::sync::Mutex<std::collections::VecDeque<PipelineStatus>>,
    pub selection: std::sync::Mutex<SelectionStatus>,
    pub records: std::sync::Mutex<std::collections::HashMap<u64, RecordDetail>>,
    pub log_lines: std::sync::Mutex<Vec<String>>,
    pub trigger_calls: std::sync::atomic::AtomicUsize,
    pub status_calls: std::sync::atomic::AtomicUsize,
    pub record_calls: std::sync::atomic::AtomicUsize,
}

impl MockPipeline {
    pub fn new() -> Self {
        Self {
            ack: std::sync::Mutex::new(TriggerAck::default()),
            statuses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            selection: std::sync::Mutex::new(SelectionStatus::default()),
            records: std::sync::Mutex::new(std::collections::HashMap::new()),
            log_lines: std::sync::Mutex::new(Vec::new()),
            trigger_calls: std::sync::atomic::AtomicUsize::new(0),
            status_calls: std::sync::atomic::AtomicUsize::new(0),
            record_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_ack(self, ack: TriggerAck) -> Self {
        *self.ack.lock().unwrap() = ack;
        self
    }

    pub fn push_status(&self, status: PipelineStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn insert_record(&self, detail: RecordDetail) {
        self.records.lock().unwrap().insert(detail.id, detail);
    }
}

impl Default for MockPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineClient for MockPipeline {
    async fn trigger(&self, _batch: &[SelectionItem], _token: &str) -> Result<TriggerAck> {
        self.trigger_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.ack.lock().unwrap().clone())
    }

    async fn status(&self, _since: u64) -> Result<PipelineStatus> {
        self.status_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut q = self.statuses.lock().unwrap();
        if q.len() > 1 {
            Ok(q.pop_front().unwrap_or_default())
        } else {
            Ok(q.front().cloned().unwrap_or_default())
        }
    }

    async fn logs(&self, lines: usize, _since: u64) -> Result<Vec<String>> {
        let all = self.log_lines.lock().unwrap();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].to_vec())
    }

    async fn selection_status(&self) -> Result<SelectionStatus> {
        Ok(self.selection.lock().unwrap().clone())
    }

    async fn record_by_id(&self, id: u64) -> Result<Option<RecordDetail>> {
        self.record_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn record_by_title(&self, query: &str) -> Result<Option<RecordDetail>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|d| d.title.as_deref() == Some(query))
            .cloned())
    }
}
