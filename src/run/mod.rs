// src/run/mod.rs
//! Publish-run orchestration. One run at a time moves through
//! `staging → dispatched → polling → reconciling → {completed | timed_out}`,
//! with three concurrent loops (status poll, log poll, fast-verify) hanging
//! off a single run-scoped cancellation token. Any terminal transition
//! cancels the token, so the loops always stop together and can never bleed
//! into a later run.

pub mod export;
pub mod pipeline;

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::identity::{self, Match, MatchDiagnostics, SelectionItem};
use crate::notify::WebhookNotifier;
use export::{ExportSink, ReportItem, RunReport};
use pipeline::{PipelineClient, ResultSummary};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("run_started_total", "Publish runs dispatched.");
        describe_counter!("run_completed_total", "Runs that reached completed.");
        describe_counter!("run_timed_out_total", "Runs that reached timed_out.");
        describe_counter!("run_items_done_total", "Selection items confirmed done.");
        describe_counter!("run_items_failed_total", "Selection items marked failed.");
        describe_counter!(
            "run_summaries_ignored_total",
            "Result summaries rejected by the acceptance checks."
        );
        describe_histogram!("run_duration_seconds", "Wall time from dispatch to terminal state.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Staging,
    Dispatched,
    Polling,
    Reconciling,
    Completed,
    TimedOut,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::TimedOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Running,
    Done,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub status_poll: Duration,
    pub log_poll: Duration,
    pub fast_verify: Duration,
    pub run_timeout: Duration,
    /// How many log lines each poll asks the pipeline for.
    pub log_tail_lines: usize,
    pub staging_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            status_poll: Duration::from_secs(2),
            log_poll: Duration::from_secs(2),
            fast_verify: Duration::from_secs(1),
            run_timeout: Duration::from_secs(300),
            log_tail_lines: 80,
            staging_path: PathBuf::from("state/staged_selection.json"),
        }
    }
}

/// Identity signals captured at dispatch, used to decide whether a summary
/// belongs to this run and not a stale prior one.
#[derive(Debug, Clone, Serialize)]
pub struct ExpectedIdentity {
    pub token: String,
    pub ids: Vec<u64>,
    pub slugs: Vec<String>,
    pub count: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SummaryVerdict {
    Accept(&'static str),
    /// Explicitly-finished pipeline with nothing to validate against;
    /// accepted with a warning rather than deadlocking the run.
    AcceptLoose,
    Reject(String),
}

/// Acceptance checks, in priority order: token, count, slugs, ids.
pub fn accept_summary(
    expected: &ExpectedIdentity,
    finished: bool,
    summary: &ResultSummary,
) -> SummaryVerdict {
    if summary.carries_token(&expected.token) {
        return SummaryVerdict::Accept("token");
    }
    if summary.reported_count() >= expected.count {
        return SummaryVerdict::Accept("count");
    }
    if !expected.slugs.is_empty()
        && expected.slugs.iter().all(|s| {
            summary
                .items
                .iter()
                .any(|c| c.slug.as_deref() == Some(s.as_str()))
        })
    {
        return SummaryVerdict::Accept("slugs");
    }
    if !expected.ids.is_empty()
        && expected
            .ids
            .iter()
            .all(|id| summary.items.iter().any(|c| c.matches_id(*id)))
    {
        return SummaryVerdict::Accept("ids");
    }
    let no_signals = summary.token.is_none()
        && summary
            .items
            .iter()
            .all(|i| i.token.is_none() && i.any_id().is_none() && i.slug.is_none());
    if finished && no_signals {
        return SummaryVerdict::AcceptLoose;
    }
    SummaryVerdict::Reject(format!(
        "count {} < expected {} and no token/slug/id signal matched",
        summary.reported_count(),
        expected.count
    ))
}

#[derive(Debug)]
struct RunItem {
    selection: SelectionItem,
    state: ItemState,
    resolved_id: Option<u64>,
    diagnostics: Option<MatchDiagnostics>,
}

fn set_state(item: &mut RunItem, next: ItemState) {
    if item.state == next || item.state.is_terminal() {
        return;
    }
    item.state = next;
    match next {
        ItemState::Done => counter!("run_items_done_total").increment(1),
        ItemState::Failed => counter!("run_items_failed_total").increment(1),
        _ => {}
    }
}

struct ActiveRun {
    token: String,
    started_at: u64,
    phase: RunPhase,
    items: Vec<RunItem>,
    expected: ExpectedIdentity,
    invocation_id: Option<String>,
    cancel: CancellationToken,
    exported: Arc<AtomicBool>,
    notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    pub item_id: String,
    pub title: String,
    pub slug: String,
    pub summary: String,
    pub state: ItemState,
    pub resolved_id: Option<u64>,
    pub diagnostics: Option<MatchDiagnostics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub token: String,
    pub started_at: u64,
    pub phase: RunPhase,
    pub expected_count: usize,
    pub invocation_id: Option<String>,
    pub items: Vec<ItemSnapshot>,
    pub notes: Vec<String>,
}

fn snapshot_of(run: &ActiveRun) -> RunSnapshot {
    RunSnapshot {
        token: run.token.clone(),
        started_at: run.started_at,
        phase: run.phase,
        expected_count: run.expected.count,
        invocation_id: run.invocation_id.clone(),
        items: run
            .items
            .iter()
            .map(|it| ItemSnapshot {
                item_id: it.selection.item_id.clone(),
                title: it.selection.title.clone(),
                slug: it.selection.slug.clone(),
                summary: it.selection.summary.clone(),
                state: it.state,
                resolved_id: it.resolved_id,
                diagnostics: it.diagnostics.clone(),
            })
            .collect(),
        notes: run.notes.clone(),
    }
}

fn build_report(run: &ActiveRun, outcome: RunPhase, finished_at: u64) -> RunReport {
    RunReport {
        token: run.token.clone(),
        started_at: run.started_at,
        finished_at,
        outcome,
        items: run
            .items
            .iter()
            .map(|it| ReportItem {
                item_id: it.selection.item_id.clone(),
                title: it.selection.title.clone(),
                slug: it.selection.slug.clone(),
                state: it.state,
                resolved_id: it.resolved_id,
                excerpt: (!it.selection.summary.is_empty()).then(|| it.selection.summary.clone()),
            })
            .collect(),
    }
}

fn derive_token(started_at: u64, batch: &[SelectionItem]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(started_at.to_be_bytes());
    for s in batch {
        hasher.update(s.item_id.as_bytes());
        hasher.update(b"\x1f");
    }
    let digest = hasher.finalize();
    let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("run-{hex}")
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

struct Inner {
    pipeline: Arc<dyn PipelineClient>,
    export: Arc<dyn ExportSink>,
    notifier: Option<WebhookNotifier>,
    cfg: RunConfig,
    current: Mutex<Option<ActiveRun>>,
    last: Mutex<Option<RunSnapshot>>,
    logs: Mutex<VecDeque<String>>,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    pub fn new(
        pipeline: Arc<dyn PipelineClient>,
        export: Arc<dyn ExportSink>,
        cfg: RunConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            inner: Arc::new(Inner {
                pipeline,
                export,
                notifier: None,
                cfg,
                current: Mutex::new(None),
                last: Mutex::new(None),
                logs: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_notifier must be called before the orchestrator is shared");
        inner.notifier = Some(notifier);
        self
    }

    /// Run `f` on the active run iff its token matches. `None` means the run
    /// is gone or was replaced; callers treat that as "stop quietly".
    fn with_run<T>(&self, token: &str, f: impl FnOnce(&mut ActiveRun) -> T) -> Option<T> {
        let mut cur = self.inner.current.lock().expect("run mutex poisoned");
        match cur.as_mut() {
            Some(run) if run.token == token => Some(f(run)),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<RunSnapshot> {
        let cur = self.inner.current.lock().expect("run mutex poisoned");
        if let Some(run) = cur.as_ref() {
            return Some(snapshot_of(run));
        }
        drop(cur);
        self.inner.last.lock().expect("last-run mutex poisoned").clone()
    }

    pub fn logs_snapshot(&self) -> Vec<String> {
        self.inner
            .logs
            .lock()
            .expect("log buffer mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Resolved numeric id for an item, consulting the active run first and
    /// the archived last run second. The image controller keys off this.
    pub fn resolved_id(&self, item_id: &str) -> Option<u64> {
        {
            let cur = self.inner.current.lock().expect("run mutex poisoned");
            if let Some(run) = cur.as_ref() {
                return run
                    .items
                    .iter()
                    .find(|it| it.selection.item_id == item_id)
                    .and_then(|it| it.resolved_id);
            }
        }
        let last = self.inner.last.lock().expect("last-run mutex poisoned");
        last.as_ref()?
            .items
            .iter()
            .find(|it| it.item_id == item_id)
            .and_then(|it| it.resolved_id)
    }

    /// Stage, dispatch, and begin polling a new run. Fails if another run is
    /// still active or the pipeline refuses the trigger.
    pub async fn start_run(&self, batch: Vec<SelectionItem>) -> Result<RunSnapshot> {
        anyhow::ensure!(!batch.is_empty(), "selection batch is empty");
        let started_at = now_unix();
        let token = derive_token(started_at, &batch);
        let cancel = CancellationToken::new();

        {
            let mut cur = self.inner.current.lock().expect("run mutex poisoned");
            if let Some(run) = cur.as_ref() {
                if !run.phase.is_terminal() {
                    anyhow::bail!("run {} is still active", run.token);
                }
            }
            *cur = Some(ActiveRun {
                token: token.clone(),
                started_at,
                phase: RunPhase::Staging,
                items: batch
                    .iter()
                    .map(|s| RunItem {
                        selection: s.clone(),
                        state: ItemState::Queued,
                        resolved_id: None,
                        diagnostics: None,
                    })
                    .collect(),
                expected: ExpectedIdentity {
                    token: token.clone(),
                    ids: Vec::new(),
                    slugs: batch.iter().map(|s| s.slug.clone()).collect(),
                    count: batch.len(),
                },
                invocation_id: None,
                cancel: cancel.clone(),
                exported: Arc::new(AtomicBool::new(false)),
                notes: Vec::new(),
            });
        }
        self.inner.logs.lock().expect("log buffer mutex poisoned").clear();

        // Staging file is a hint for concurrent readers, not a source of
        // truth; failure to write it never aborts the run.
        if let Err(e) = self.write_staging(&batch, &token, started_at).await {
            tracing::warn!(error = ?e, "staged selection write failed");
        }

        let ack = match self.inner.pipeline.trigger(&batch, &token).await {
            Ok(ack) => ack,
            Err(e) => {
                let mut cur = self.inner.current.lock().expect("run mutex poisoned");
                if cur.as_ref().is_some_and(|r| r.token == token) {
                    *cur = None;
                }
                return Err(e).context("pipeline trigger");
            }
        };
        counter!("run_started_total").increment(1);

        let snapshot = self
            .with_run(&token, |run| {
                run.phase = RunPhase::Dispatched;
                run.invocation_id = ack.invocation_id.clone();
                if let Some(ids) = ack.ids.as_ref() {
                    run.expected.ids = ids.clone();
                    // Positional id mapping only holds when counts line up.
                    if ids.len() == run.items.len() {
                        for (it, id) in run.items.iter_mut().zip(ids) {
                            it.resolved_id = Some(*id);
                            it.selection.known_id = Some(*id);
                        }
                    }
                }
                if let Some(slugs) = ack.slugs.as_ref() {
                    if !slugs.is_empty() {
                        run.expected.slugs = slugs.clone();
                    }
                }
                if let Some(count) = ack.count.filter(|c| *c > 0) {
                    run.expected.count = count;
                }
                run.phase = RunPhase::Polling;
                for it in &mut run.items {
                    set_state(it, ItemState::Running);
                }
                snapshot_of(run)
            })
            .context("run vanished during dispatch")?;

        self.spawn_status_loop(token.clone(), cancel.clone());
        self.spawn_log_loop(token.clone(), cancel.clone());
        self.spawn_fast_verify_loop(token.clone(), cancel.clone());
        self.spawn_timeout(token, cancel);

        Ok(snapshot)
    }

    /// Operator bail-out: cancels the loops and fails the stragglers.
    pub async fn abandon_run(&self) -> Result<RunSnapshot> {
        let token = {
            let cur = self.inner.current.lock().expect("run mutex poisoned");
            match cur.as_ref() {
                Some(run) if !run.phase.is_terminal() => run.token.clone(),
                _ => anyhow::bail!("no active run to abandon"),
            }
        };
        self.with_run(&token, |run| run.notes.push("abandoned by operator".into()));
        self.finalize(&token, RunPhase::TimedOut).await;
        self.snapshot().context("run state missing after abandon")
    }

    async fn write_staging(
        &self,
        batch: &[SelectionItem],
        token: &str,
        staged_at: u64,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Staged<'a> {
            token: &'a str,
            staged_at: u64,
            items: &'a [SelectionItem],
        }
        let path = &self.inner.cfg.staging_path;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .context("create staging dir")?;
            }
        }
        let body = serde_json::to_vec_pretty(&Staged {
            token,
            staged_at,
            items: batch,
        })
        .context("serialize staged selection")?;
        tokio::fs::write(path, body)
            .await
            .context("write staged selection")?;
        Ok(())
    }

    fn spawn_status_loop(&self, token: String, cancel: CancellationToken) {
        let orch = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.inner.cfg.status_poll);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => orch.poll_status_once(&token).await,
                }
            }
        });
    }

    fn spawn_log_loop(&self, token: String, cancel: CancellationToken) {
        let orch = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.inner.cfg.log_poll);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => orch.poll_logs_once(&token).await,
                }
            }
        });
    }

    fn spawn_fast_verify_loop(&self, token: String, cancel: CancellationToken) {
        let orch = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(orch.inner.cfg.fast_verify);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => orch.fast_verify_once(&token).await,
                }
            }
        });
    }

    fn spawn_timeout(&self, token: String, cancel: CancellationToken) {
        let orch = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(orch.inner.cfg.run_timeout) => {
                    tracing::warn!(token = %token, "run timed out waiting for reconciliation");
                    orch.with_run(&token, |run| {
                        run.notes.push("timed out before an accepted summary reconciled".into());
                    });
                    orch.finalize(&token, RunPhase::TimedOut).await;
                }
            }
        });
    }

    async fn poll_status_once(&self, token: &str) {
        let started_at = match self.with_run(token, |r| r.started_at) {
            Some(s) => s,
            None => return,
        };
        let status = match self.inner.pipeline.status(started_at).await {
            Ok(st) => st,
            Err(e) => {
                tracing::warn!(error = ?e, "status poll failed");
                return;
            }
        };
        let finished = status.finished;
        let Some(summary) = status.summary else {
            return;
        };

        let verdict = match self.with_run(token, |r| accept_summary(&r.expected, finished, &summary))
        {
            Some(v) => v,
            None => return,
        };

        let reconcile = match verdict {
            SummaryVerdict::Accept(reason) => {
                tracing::info!(token, reason, "result summary accepted");
                true
            }
            SummaryVerdict::AcceptLoose => {
                tracing::warn!(
                    token,
                    "pipeline finished with zero identity signals; proceeding on trust"
                );
                self.with_run(token, |r| {
                    r.notes
                        .push("accepted finished summary carrying no identity signals".into())
                });
                true
            }
            SummaryVerdict::Reject(why) => {
                counter!("run_summaries_ignored_total").increment(1);
                tracing::warn!(token, %why, "result summary ignored");
                self.with_run(token, |r| r.notes.push(format!("ignored summary: {why}")));
                false
            }
        };
        if !reconcile {
            return;
        }

        // Only the first acceptance moves the run into reconciling.
        let proceed = self
            .with_run(token, |run| {
                if matches!(run.phase, RunPhase::Polling | RunPhase::Dispatched) {
                    run.phase = RunPhase::Reconciling;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if proceed {
            self.reconcile(token, &summary).await;
        }
    }

    /// Match every pending item against the accepted summary and confirm by
    /// numeric id against the authoritative store. Done only on a confirmed
    /// id; anything else fails with a "why" diagnostic attached.
    async fn reconcile(&self, token: &str, summary: &ResultSummary) {
        let pending: Vec<(usize, SelectionItem)> = match self.with_run(token, |run| {
            run.items
                .iter()
                .enumerate()
                .filter(|(_, it)| !it.state.is_terminal())
                .map(|(i, it)| (i, it.selection.clone()))
                .collect()
        }) {
            Some(p) => p,
            None => return,
        };

        for (idx, sel) in pending {
            // Run-level validation already happened at acceptance; matching
            // here is per-item, so the token is deliberately withheld.
            let resolved = match identity::match_selection(&sel, None, &summary.items) {
                Match::Item(c) => c.any_id(),
                Match::WholeRun | Match::NotFound => None,
            };

            match resolved {
                Some(id) => {
                    let confirmed = match self.inner.pipeline.record_by_id(id).await {
                        Ok(found) => found.is_some(),
                        Err(e) => {
                            tracing::warn!(error = ?e, id, "confirmation read failed");
                            false
                        }
                    };
                    let diag = (!confirmed)
                        .then(|| identity::diagnose(&sel, None, &summary.items));
                    self.with_run(token, |run| {
                        let it = &mut run.items[idx];
                        it.resolved_id = Some(id);
                        if confirmed {
                            set_state(it, ItemState::Done);
                        } else {
                            it.diagnostics = diag.clone();
                            set_state(it, ItemState::Failed);
                        }
                    });
                }
                None => {
                    let diag = identity::diagnose(&sel, None, &summary.items);
                    self.with_run(token, |run| {
                        let it = &mut run.items[idx];
                        it.diagnostics = Some(diag.clone());
                        set_state(it, ItemState::Failed);
                    });
                }
            }
        }

        self.finalize(token, RunPhase::Completed).await;
    }

    /// Early id-based confirmations; finishing every item here cancels the
    /// slower polling paths without waiting for a summary.
    async fn fast_verify_once(&self, token: &str) {
        self.harvest_selection_ids(token).await;

        let pending: Vec<(usize, u64)> = match self.with_run(token, |run| {
            run.items
                .iter()
                .enumerate()
                .filter(|(_, it)| !it.state.is_terminal())
                .filter_map(|(i, it)| it.resolved_id.map(|id| (i, id)))
                .collect::<Vec<_>>()
        }) {
            Some(p) => p,
            None => return,
        };
        if pending.is_empty() {
            return;
        }

        let lookups = pending
            .iter()
            .map(|(_, id)| self.inner.pipeline.record_by_id(*id));
        let results = futures::future::join_all(lookups).await;

        let confirmed: Vec<usize> = pending
            .iter()
            .zip(results)
            .filter_map(|((idx, _), res)| matches!(res, Ok(Some(_))).then_some(*idx))
            .collect();
        if confirmed.is_empty() {
            return;
        }

        let all_done = self
            .with_run(token, |run| {
                for idx in &confirmed {
                    set_state(&mut run.items[*idx], ItemState::Done);
                }
                run.items.iter().all(|it| it.state.is_terminal())
            })
            .unwrap_or(false);

        if all_done {
            self.finalize(token, RunPhase::Completed).await;
        }
    }

    /// The pipeline's selection echo is a fallback identity source while the
    /// summary is pending; harvest ids for items that still lack one.
    async fn harvest_selection_ids(&self, token: &str) {
        let missing: Vec<(usize, SelectionItem)> = match self.with_run(token, |run| {
            run.items
                .iter()
                .enumerate()
                .filter(|(_, it)| !it.state.is_terminal() && it.resolved_id.is_none())
                .map(|(i, it)| (i, it.selection.clone()))
                .collect::<Vec<_>>()
        }) {
            Some(m) => m,
            None => return,
        };
        if missing.is_empty() {
            return;
        }
        let echo = match self.inner.pipeline.selection_status().await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = ?e, "selection status unavailable");
                return;
            }
        };
        if echo.items.is_empty() {
            return;
        }
        for (idx, sel) in missing {
            if let Match::Item(c) = identity::match_selection(&sel, None, &echo.items) {
                if let Some(id) = c.any_id() {
                    self.with_run(token, |run| {
                        let it = &mut run.items[idx];
                        it.resolved_id = Some(id);
                        it.selection.known_id = Some(id);
                    });
                }
            }
        }
    }

    async fn poll_logs_once(&self, token: &str) {
        let since = match self.with_run(token, |r| r.started_at) {
            Some(s) => s,
            None => return,
        };
        match self
            .inner
            .pipeline
            .logs(self.inner.cfg.log_tail_lines, since)
            .await
        {
            Ok(lines) => {
                // Display-only tail; each poll replaces the buffer wholesale.
                let mut buf = self.inner.logs.lock().expect("log buffer mutex poisoned");
                buf.clear();
                buf.extend(lines);
            }
            Err(e) => tracing::debug!(error = ?e, "log poll failed"),
        }
    }

    /// Single exit point for terminal transitions. The phase check and the
    /// exported flag together make export once-per-run even when fast-verify
    /// and reconciliation finish within the same tick.
    async fn finalize(&self, token: &str, outcome: RunPhase) {
        let finished_at = now_unix();
        let report = {
            let mut cur = self.inner.current.lock().expect("run mutex poisoned");
            let Some(run) = cur.as_mut().filter(|r| r.token == token) else {
                return;
            };
            if run.phase.is_terminal() {
                return;
            }
            if outcome == RunPhase::TimedOut {
                for it in &mut run.items {
                    set_state(it, ItemState::Failed);
                }
            }
            run.phase = outcome;
            run.cancel.cancel();
            if run.exported.swap(true, Ordering::SeqCst) {
                None
            } else {
                Some(build_report(run, outcome, finished_at))
            }
        };

        let Some(report) = report else { return };

        match outcome {
            RunPhase::Completed => counter!("run_completed_total").increment(1),
            RunPhase::TimedOut => counter!("run_timed_out_total").increment(1),
            _ => {}
        }
        histogram!("run_duration_seconds")
            .record(finished_at.saturating_sub(report.started_at) as f64);
        tracing::info!(
            token,
            outcome = ?outcome,
            done = report.done_count(),
            failed = report.failed_count(),
            "run finished"
        );

        if let Err(e) = self.inner.export.store(&report).await {
            tracing::warn!(error = ?e, token, "export sink rejected run report");
        }
        if let Some(notifier) = &self.inner.notifier {
            let outcome_label = match outcome {
                RunPhase::TimedOut => "timed_out",
                _ => "completed",
            };
            if let Err(e) = notifier
                .send_run_summary(token, outcome_label, report.done_count(), report.failed_count())
                .await
            {
                tracing::warn!(error = ?e, "run notification failed");
            }
        }

        // Archive the terminal snapshot, then drop the record itself.
        let snapshot = self.with_run(token, |run| snapshot_of(run));
        if let Some(snapshot) = snapshot {
            *self.inner.last.lock().expect("last-run mutex poisoned") = Some(snapshot);
        }
        let mut cur = self.inner.current.lock().expect("run mutex poisoned");
        if cur.as_ref().is_some_and(|r| r.token == token) {
            *cur = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SummaryItem;

    fn expected() -> ExpectedIdentity {
        ExpectedIdentity {
            token: "run-abc".into(),
            ids: vec![11, 12],
            slugs: vec!["one".into(), "two".into()],
            count: 2,
        }
    }

    fn item(slug: Option<&str>, id: Option<u64>) -> SummaryItem {
        SummaryItem {
            slug: slug.map(str::to_string),
            id,
            ..SummaryItem::default()
        }
    }

    #[test]
    fn token_accepts_regardless_of_count() {
        let summary = ResultSummary {
            count: Some(0),
            items: vec![],
            token: Some("run-abc".into()),
        };
        assert_eq!(
            accept_summary(&expected(), false, &summary),
            SummaryVerdict::Accept("token")
        );
    }

    #[test]
    fn count_at_or_above_expected_accepts() {
        let summary = ResultSummary {
            count: Some(2),
            items: vec![],
            token: None,
        };
        assert_eq!(
            accept_summary(&expected(), false, &summary),
            SummaryVerdict::Accept("count")
        );
    }

    #[test]
    fn short_count_without_signals_rejects_while_running() {
        let summary = ResultSummary {
            count: Some(1),
            items: vec![],
            token: None,
        };
        assert!(matches!(
            accept_summary(&expected(), false, &summary),
            SummaryVerdict::Reject(_)
        ));
    }

    #[test]
    fn all_expected_slugs_accept_even_below_count() {
        let summary = ResultSummary {
            count: Some(1),
            items: vec![item(Some("one"), None), item(Some("two"), None)],
            token: None,
        };
        assert_eq!(
            accept_summary(&expected(), false, &summary),
            SummaryVerdict::Accept("slugs")
        );
    }

    #[test]
    fn all_expected_ids_accept_even_below_count() {
        let mut a = item(Some("different-a"), None);
        a.post_id = Some(11);
        let b = item(Some("different-b"), Some(12));
        let summary = ResultSummary {
            count: Some(1),
            items: vec![a, b],
            token: None,
        };
        assert_eq!(
            accept_summary(&expected(), false, &summary),
            SummaryVerdict::Accept("ids")
        );
    }

    #[test]
    fn finished_with_zero_signals_accepts_loosely() {
        let summary = ResultSummary {
            count: Some(0),
            items: vec![],
            token: None,
        };
        assert_eq!(
            accept_summary(&expected(), true, &summary),
            SummaryVerdict::AcceptLoose
        );
    }

    #[test]
    fn finished_with_mismatched_signals_still_rejects() {
        let summary = ResultSummary {
            count: Some(1),
            items: vec![item(Some("stale-slug"), Some(999))],
            token: None,
        };
        assert!(matches!(
            accept_summary(&expected(), true, &summary),
            SummaryVerdict::Reject(_)
        ));
    }

    #[test]
    fn derived_token_is_stable_per_batch_and_time() {
        let sel = SelectionItem {
            item_id: "a".into(),
            title: "T".into(),
            summary: String::new(),
            url: None,
            slug: "t".into(),
            prior_slugs: vec![],
            known_id: None,
        };
        let t1 = derive_token(100, std::slice::from_ref(&sel));
        let t2 = derive_token(100, std::slice::from_ref(&sel));
        let t3 = derive_token(101, std::slice::from_ref(&sel));
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert!(t1.starts_with("run-"));
    }

    #[test]
    fn item_state_transitions_are_monotonic() {
        let mut it = RunItem {
            selection: SelectionItem {
                item_id: "a".into(),
                title: "T".into(),
                summary: String::new(),
                url: None,
                slug: "t".into(),
                prior_slugs: vec![],
                known_id: None,
            },
            state: ItemState::Queued,
            resolved_id: None,
            diagnostics: None,
        };
        set_state(&mut it, ItemState::Running);
        set_state(&mut it, ItemState::Done);
        // Terminal states never regress.
        set_state(&mut it, ItemState::Failed);
        assert_eq!(it.state, ItemState::Done);
    }
}
