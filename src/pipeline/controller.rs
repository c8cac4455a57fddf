//! Pipeline controller: one cycle of fetch → dedupe → extract → filter →
//! render → print → record, isolated per source.
//!
//! Failure policy by stage:
//! - Fetch: retried and breaker-guarded; a failing source is skipped.
//! - Extract: at most one retry, then the batch is skipped unrecorded.
//! - Render / Print: isolated to the one task; unprinted tasks are parked.
//! - Ledger I/O: aborts the cycle.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{DatabaseError, PipelineError, SourceError};
use crate::pipeline::daemon::Shutdown;
use crate::pipeline::summary::{CycleSummary, SourceStatus, SourceSummary, Stage};
use crate::pipeline::types::{Extractor, Item, Printer, Renderer, Source, Task};
use crate::resilience::{
    BreakerRegistry, CircuitOpen, HealthMonitor, RetryError, RetryPolicy, retry,
    retry_with_refresh,
};
use crate::store::{Ledger, LedgerEntry, LedgerKey};

/// Parameters for a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub threshold: u8,
    pub dry_run: bool,
    pub force_reprint: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threshold: crate::config::DEFAULT_THRESHOLD,
            dry_run: false,
            force_reprint: false,
        }
    }
}

impl From<&RunConfig> for RunOptions {
    fn from(run: &RunConfig) -> Self {
        Self {
            threshold: run.threshold,
            dry_run: run.dry_run,
            force_reprint: run.force_reprint,
        }
    }
}

enum FetchOutcome {
    Items(Vec<Item>),
    NotConfigured,
    CircuitOpen(CircuitOpen),
    Failed(RetryError<SourceError>),
}

/// A task waiting for render and print, with its parked state.
struct Pending {
    task: Task,
    key: LedgerKey,
    parked: bool,
}

/// Orchestrates one pipeline cycle at a time.
pub struct PipelineController {
    sources: Vec<Arc<dyn Source>>,
    extractor: Arc<dyn Extractor>,
    renderer: Arc<dyn Renderer>,
    printer: Arc<dyn Printer>,
    ledger: Arc<dyn Ledger>,
    breakers: Arc<BreakerRegistry>,
    retry_policy: RetryPolicy,
    /// Held for the whole cycle so cycles never overlap.
    cycle_lock: Mutex<()>,
}

impl PipelineController {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        breakers: Arc<BreakerRegistry>,
        extractor: Arc<dyn Extractor>,
        renderer: Arc<dyn Renderer>,
        printer: Arc<dyn Printer>,
    ) -> Self {
        Self {
            sources: Vec::new(),
            extractor,
            renderer,
            printer,
            ledger,
            breakers,
            retry_policy: RetryPolicy::default(),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Arc<dyn Source>>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn health(&self) -> HealthMonitor {
        HealthMonitor::new(self.breakers.clone())
    }

    /// Load persisted breaker state into the registry.
    pub async fn restore_source_records(&self) -> Result<usize, DatabaseError> {
        let records = self.ledger.load_source_records().await?;
        let count = records.len();
        self.breakers.restore(records).await;
        Ok(count)
    }

    /// Operator override: close a source's breaker and clear its streak,
    /// both in memory and in the ledger. Returns whether anything was known
    /// about the source.
    pub async fn reset_source(&self, name: &str) -> Result<bool, DatabaseError> {
        let _cycle = self.cycle_lock.lock().await;
        let in_memory = self.breakers.reset(name).await;
        if in_memory {
            if let Some(record) = self
                .breakers
                .records()
                .await
                .into_iter()
                .find(|r| r.source == name)
            {
                self.ledger.save_source_record(&record).await?;
                return Ok(true);
            }
        }
        self.ledger.reset_source_record(name).await
    }

    /// Run one full cycle across all sources.
    ///
    /// Returns `Err` only when the cycle could not run: no sources, or the
    /// ledger failed. Everything else is reported in the summary.
    pub async fn run_cycle(
        &self,
        opts: &RunOptions,
        shutdown: &Shutdown,
    ) -> Result<CycleSummary, PipelineError> {
        let _cycle = self.cycle_lock.lock().await;

        if self.sources.is_empty() {
            return Err(PipelineError::NoSources);
        }

        let mut summary = CycleSummary::new(opts.dry_run);
        info!(
            cycle = %summary.short_id(),
            sources = self.sources.len(),
            threshold = opts.threshold,
            dry_run = opts.dry_run,
            force_reprint = opts.force_reprint,
            "Cycle started"
        );

        // ── Stage 1: fetch, sources independent of each other ─────────
        let outcomes = join_all(self.sources.iter().map(|s| self.fetch_source(s.as_ref()))).await;

        if !opts.dry_run {
            for record in self.breakers.records().await {
                self.ledger.save_source_record(&record).await?;
            }
        }

        for (source, outcome) in self.sources.iter().zip(outcomes) {
            let name = source.name();

            if shutdown.is_triggered() {
                summary
                    .sources
                    .push(SourceSummary::with_status(name, SourceStatus::Cancelled));
                summary.cancelled = true;
                continue;
            }

            let mut source_summary = match outcome {
                FetchOutcome::NotConfigured => {
                    debug!(source = name, "Source not configured, skipping");
                    SourceSummary::with_status(name, SourceStatus::NotConfigured)
                }
                FetchOutcome::CircuitOpen(open) => {
                    info!(source = name, "{open}");
                    let mut s = SourceSummary::with_status(name, SourceStatus::CircuitOpen);
                    s.error(Stage::Fetch, open.to_string());
                    s
                }
                FetchOutcome::Failed(err) => {
                    warn!(source = name, error = %err, "Fetch failed, skipping source this cycle");
                    let mut s = SourceSummary::with_status(name, SourceStatus::FetchFailed);
                    s.error(Stage::Fetch, err.to_string());
                    s
                }
                FetchOutcome::Items(items) => {
                    let mut s = SourceSummary::new(name);
                    self.process_source(name, items, opts, shutdown, &mut s)
                        .await?;
                    summary.sources.push(s);
                    continue;
                }
            };
            // Parked tasks carry their full payload; printing them needs no fetch.
            self.retry_parked(name, opts, shutdown, &mut source_summary)
                .await?;
            summary.sources.push(source_summary);
        }

        // Sources dropped from the configuration may still have parked tasks.
        if !opts.dry_run && !shutdown.is_triggered() {
            let configured: HashSet<&str> = self.sources.iter().map(|s| s.name()).collect();
            for name in self.ledger.deferred_sources().await? {
                if configured.contains(name.as_str()) {
                    continue;
                }
                let mut s = SourceSummary::new(name.as_str());
                self.retry_parked(&name, opts, shutdown, &mut s).await?;
                summary.sources.push(s);
            }
        }

        if summary
            .sources
            .iter()
            .any(|s| s.status == SourceStatus::Cancelled)
        {
            summary.cancelled = true;
        }

        summary.finished_at = Some(Utc::now());
        let totals = summary.totals();
        info!(
            cycle = %summary.short_id(),
            fetched = totals.fetched,
            deduped = totals.deduped,
            extracted = totals.extracted,
            filtered = totals.filtered,
            printed = totals.printed,
            failed = totals.failed,
            cancelled = summary.cancelled,
            "Cycle finished"
        );
        Ok(summary)
    }

    async fn fetch_source(&self, source: &dyn Source) -> FetchOutcome {
        if !source.is_configured() {
            return FetchOutcome::NotConfigured;
        }

        let name = source.name();
        let breaker = self.breakers.get_or_create(name).await;
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => return FetchOutcome::CircuitOpen(open),
        };

        let label = format!("fetch:{name}");
        let result = retry_with_refresh(
            &self.retry_policy,
            &label,
            || source.fetch_items(),
            || source.refresh(),
        )
        .await;

        match result {
            Ok(items) => {
                breaker.on_success(permit);
                debug!(source = name, count = items.len(), "Fetched items");
                FetchOutcome::Items(items)
            }
            Err(err) => {
                breaker.on_failure(permit, &err.last().to_string());
                FetchOutcome::Failed(err)
            }
        }
    }

    /// Stages 2 to 7 for one source.
    async fn process_source(
        &self,
        name: &str,
        items: Vec<Item>,
        opts: &RunOptions,
        shutdown: &Shutdown,
        summary: &mut SourceSummary,
    ) -> Result<(), PipelineError> {
        // ── Stage 2: dedupe items ──────────────────────────────────────
        let fresh = self.dedupe_items(items, opts, summary).await?;

        if shutdown.is_triggered() {
            summary.status = SourceStatus::Cancelled;
            return Ok(());
        }

        // ── Stage 3: extract and record item keys ──────────────────────
        let tasks = if fresh.is_empty() {
            Vec::new()
        } else {
            self.extract(name, &fresh, opts, summary).await?
        };

        // ── Stage 4: filter ────────────────────────────────────────────
        let mut queue: Vec<Pending> = Vec::new();
        let mut seen: HashSet<LedgerKey> = HashSet::new();
        for task in tasks {
            if !task.passes(opts.threshold) {
                debug!(source = name, title = %task.title, score = task.score, "Below threshold");
                continue;
            }
            summary.filtered += 1;
            let key = task.print_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            if !opts.force_reprint && self.ledger.has(&key).await? {
                debug!(source = name, title = %task.title, "Already printed, skipping");
                continue;
            }
            queue.push(Pending {
                task,
                key,
                parked: false,
            });
        }

        if !opts.dry_run {
            self.requeue_parked(name, opts, &mut seen, &mut queue, summary)
                .await?;
        }
        queue.sort_by(|a, b| b.task.score.cmp(&a.task.score));

        if queue.is_empty() {
            return Ok(());
        }
        if shutdown.is_triggered() {
            // Item keys are already recorded, so unparked tasks would be lost.
            summary.status = SourceStatus::Cancelled;
            if !opts.dry_run {
                let mut parked = 0;
                for pending in queue.iter().filter(|p| !p.parked) {
                    self.park(name, &pending.task, &pending.key, "cycle cancelled")
                        .await?;
                    parked += 1;
                }
                info!(source = name, parked, "Cycle cancelled, tasks parked for next run");
            }
            return Ok(());
        }

        // ── Stages 5 to 7: render, print, record ───────────────────────
        // Not interruptible once started.
        self.render_and_print(name, queue, opts, summary).await
    }

    async fn dedupe_items(
        &self,
        items: Vec<Item>,
        opts: &RunOptions,
        summary: &mut SourceSummary,
    ) -> Result<Vec<Item>, PipelineError> {
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            let key = item.key();
            if !seen.insert(key.clone()) {
                continue;
            }
            if !opts.force_reprint && self.ledger.has(&key).await? {
                summary.deduped += 1;
                continue;
            }
            fresh.push(item);
        }
        summary.fetched = fresh.len();
        Ok(fresh)
    }

    async fn extract(
        &self,
        name: &str,
        items: &[Item],
        opts: &RunOptions,
        summary: &mut SourceSummary,
    ) -> Result<Vec<Task>, PipelineError> {
        let label = format!("extract:{name}:{}", self.extractor.name());
        let result = retry(&self.retry_policy.single_retry(), &label, || {
            self.extractor.process(items)
        })
        .await;

        let tasks = match result {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(source = name, items = items.len(), error = %err, "Extraction failed, batch skipped");
                summary.failed += items.len();
                summary.error(Stage::Extract, err.to_string());
                return Ok(Vec::new());
            }
        };

        let batch_keys: HashSet<LedgerKey> = items.iter().map(|i| i.key()).collect();
        let tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|t| {
                let valid = !t.origin_item_keys.is_empty()
                    && t.origin_item_keys.iter().all(|k| batch_keys.contains(k));
                if !valid {
                    warn!(source = name, title = %t.title, "Dropping task with unknown origin items");
                }
                valid
            })
            .map(|mut t| {
                t.source_name = name.to_string();
                t
            })
            .collect();
        summary.extracted = tasks.len();

        if !opts.dry_run {
            for item in items {
                let key = item.key();
                let produced = tasks
                    .iter()
                    .filter(|t| t.origin_item_keys.contains(&key))
                    .count() as u32;
                self.ledger
                    .record(&LedgerEntry::item(
                        &item.source_name,
                        &item.source_id,
                        &item.title,
                        produced,
                    ))
                    .await?;
            }
        }

        info!(
            source = name,
            items = items.len(),
            tasks = tasks.len(),
            "Extraction complete"
        );
        Ok(tasks)
    }

    /// Add tasks parked by earlier cycles for this source.
    async fn requeue_parked(
        &self,
        name: &str,
        opts: &RunOptions,
        seen: &mut HashSet<LedgerKey>,
        queue: &mut Vec<Pending>,
        summary: &mut SourceSummary,
    ) -> Result<(), PipelineError> {
        for parked in self.ledger.deferred_prints(name).await? {
            if !seen.insert(parked.key.clone()) {
                if let Some(p) = queue.iter_mut().find(|p| p.key == parked.key) {
                    p.parked = true;
                }
                continue;
            }
            if !opts.force_reprint && self.ledger.has(&parked.key).await? {
                self.ledger.clear_deferred(&parked.key).await?;
                continue;
            }
            match serde_json::from_str::<Task>(&parked.payload) {
                Ok(task) => {
                    debug!(source = name, title = %task.title, attempts = parked.attempts, "Retrying parked print");
                    summary.retried += 1;
                    queue.push(Pending {
                        task,
                        key: parked.key,
                        parked: true,
                    });
                }
                Err(e) => {
                    warn!(source = name, key = %parked.key, "Dropping unreadable parked task: {e}");
                    self.ledger.clear_deferred(&parked.key).await?;
                }
            }
        }
        Ok(())
    }

    /// Render and print the parked tasks of a source that was not fetched
    /// this cycle.
    async fn retry_parked(
        &self,
        name: &str,
        opts: &RunOptions,
        shutdown: &Shutdown,
        summary: &mut SourceSummary,
    ) -> Result<(), PipelineError> {
        if opts.dry_run || shutdown.is_triggered() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        let mut queue = Vec::new();
        self.requeue_parked(name, opts, &mut seen, &mut queue, summary)
            .await?;
        if queue.is_empty() {
            return Ok(());
        }
        queue.sort_by(|a, b| b.task.score.cmp(&a.task.score));
        self.render_and_print(name, queue, opts, summary).await
    }

    async fn render_and_print(
        &self,
        name: &str,
        queue: Vec<Pending>,
        opts: &RunOptions,
        summary: &mut SourceSummary,
    ) -> Result<(), PipelineError> {
        let printer_ready = opts.dry_run || self.printer.is_available().await;
        if !printer_ready {
            warn!(source = name, printer = self.printer.name(), "Printer unavailable, parking tasks");
            summary.error(Stage::Print, format!("printer {} unavailable", self.printer.name()));
        }

        for Pending { task, key, parked } in queue {
            let label = match self.renderer.render(&task) {
                Ok(label) => label,
                Err(e) => {
                    warn!(source = name, title = %task.title, error = %e, "Render failed");
                    summary.failed += 1;
                    summary.error(Stage::Render, e.to_string());
                    if parked && !opts.dry_run {
                        self.ledger.clear_deferred(&key).await?;
                    }
                    continue;
                }
            };
            summary.rendered += 1;

            if opts.dry_run {
                info!(source = name, title = %task.title, score = task.score, "Dry run: would print");
                continue;
            }

            if !printer_ready {
                summary.failed += 1;
                self.park(name, &task, &key, "printer unavailable").await?;
                continue;
            }

            match self.printer.print(&label).await {
                Ok(()) => {
                    summary.printed += 1;
                    self.ledger
                        .record(&LedgerEntry::print(key.clone(), name, &task.title, task.score))
                        .await?;
                    if parked {
                        self.ledger.clear_deferred(&key).await?;
                    }
                    info!(source = name, title = %task.title, score = task.score, "Label printed");
                }
                Err(e) => {
                    warn!(source = name, title = %task.title, error = %e, "Print failed");
                    summary.failed += 1;
                    summary.error(Stage::Print, e.to_string());
                    self.park(name, &task, &key, &e.to_string()).await?;
                }
            }
        }
        Ok(())
    }

    async fn park(
        &self,
        name: &str,
        task: &Task,
        key: &LedgerKey,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(task)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.ledger.defer_print(key, name, &payload, reason).await?;
        Ok(())
    }
}
