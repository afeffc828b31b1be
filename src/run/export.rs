// src/run/export.rs
//! Final run report and the sink that receives it. Fire-and-forget past a
//! success response; the guard against double export lives in the
//! orchestrator, not here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{ItemState, RunPhase};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportItem {
    pub item_id: String,
    pub title: String,
    pub slug: String,
    pub state: ItemState,
    pub resolved_id: Option<u64>,
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub token: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub outcome: RunPhase,
    pub items: Vec<ReportItem>,
}

impl RunReport {
    pub fn done_count(&self) -> usize {
        self.items.iter().filter(|i| i.state == ItemState::Done).count()
    }

    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|i| i.state == ItemState::Failed).count()
    }
}

#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn store(&self, report: &RunReport) -> Result<()>;
}

pub struct HttpExportSink {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpExportSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ExportSink for HttpExportSink {
    async fn store(&self, report: &RunReport) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(report)
            .send()
            .await
            .context("export post")?;
        resp.error_for_status().context("export status")?;
        Ok(())
    }
}

/// Sink for deployments without an export collaborator; logs and succeeds.
pub struct NullExportSink;

#[async_trait]
impl ExportSink for NullExportSink {
    async fn store(&self, report: &RunReport) -> Result<()> {
        tracing::info!(
            token = %report.token,
            done = report.done_count(),
            failed = report.failed_count(),
            "run report (no export sink configured)"
        );
        Ok(())
    }
}

// --- Test helper ---
pub struct MockExportSink {
    pub reports: std::sync::Mutex<Vec<RunReport>>,
}

impl MockExportSink {
    pub fn new() -> Self {
        Self {
            reports: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for MockExportSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExportSink for MockExportSink {
    async fn store(&self, report: &RunReport) -> Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}
