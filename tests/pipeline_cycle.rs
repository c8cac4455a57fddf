//! End-to-end cycles over a JSON file source, the file printer and a real
//! libSQL ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use taskprint::error::{ExtractError, PrinterError};
use taskprint::pipeline::{
    Extractor, Item, LabelImage, PipelineController, Printer, RunOptions, Shutdown, SourceStatus,
    Task,
};
use taskprint::printer::FilePrinter;
use taskprint::render::TextLabelRenderer;
use taskprint::resilience::{BreakerConfig, BreakerRegistry, BreakerState, RetryPolicy};
use taskprint::sources::LocalFileSource;
use taskprint::store::{Ledger, LedgerKey, LibSqlLedger};

/// Groups items by their `group` field (or id) into one task each, scored by
/// the highest `score` field in the group and titled by `task`.
struct GroupingExtractor;

#[async_trait]
impl Extractor for GroupingExtractor {
    fn name(&self) -> &str {
        "grouping"
    }

    async fn process(&self, items: &[Item]) -> Result<Vec<Task>, ExtractError> {
        let mut groups: BTreeMap<String, Vec<&Item>> = BTreeMap::new();
        for item in items {
            let group = item.raw_payload["group"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| item.source_id.clone());
            groups.entry(group).or_default().push(item);
        }
        Ok(groups
            .into_values()
            .map(|group| {
                let score = group
                    .iter()
                    .filter_map(|i| i.raw_payload["score"].as_u64())
                    .max()
                    .unwrap_or(0) as u8;
                let title = group[0].raw_payload["task"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| group[0].title.clone());
                Task::from_items(&group, title, score)
            })
            .collect())
    }
}

/// File printer that fails the first `failures` jobs.
struct FlakyPrinter {
    inner: FilePrinter,
    failures: AtomicU32,
}

#[async_trait]
impl Printer for FlakyPrinter {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn print(&self, label: &LabelImage) -> Result<(), PrinterError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(PrinterError::JobFailed {
                name: "flaky".into(),
                reason: "out of paper".into(),
            });
        }
        self.inner.print(label).await
    }
}

const THREE_ITEMS: &str = r#"{"tasks": [
    {"id": "a", "title": "Invoice ACME", "group": "pay", "task": "Pay ACME invoice", "score": 85},
    {"id": "b", "title": "ACME reminder", "group": "pay", "score": 60},
    {"id": "c", "title": "Tidy desk", "score": 40}
]}"#;

struct Setup {
    _dir: tempfile::TempDir,
    tasks_file: PathBuf,
    out_dir: PathBuf,
    db_path: PathBuf,
}

fn setup(tasks: &str) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let tasks_file = dir.path().join("tasks.json");
    std::fs::write(&tasks_file, tasks).unwrap();
    Setup {
        tasks_file,
        out_dir: dir.path().join("labels"),
        db_path: dir.path().join("data").join("ledger.db"),
        _dir: dir,
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    }
}

async fn controller_with(
    ledger: Arc<LibSqlLedger>,
    source_files: &[&Path],
    printer: Arc<dyn Printer>,
) -> PipelineController {
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: 2,
        ..BreakerConfig::default()
    }));
    let controller = PipelineController::new(
        ledger,
        breakers,
        Arc::new(GroupingExtractor),
        Arc::new(TextLabelRenderer::default()),
        printer,
    )
    .with_sources(
        source_files
            .iter()
            .map(|p| Arc::new(LocalFileSource::new(*p)) as Arc<dyn taskprint::pipeline::Source>),
    )
    .with_retry_policy(fast_retries());
    controller.restore_source_records().await.unwrap();
    controller
}

fn label_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn prints_only_tasks_above_threshold_and_records_everything() {
    let s = setup(THREE_ITEMS);
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger.clone(),
        &[s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;

    let summary = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    let name = format!("local:{}", s.tasks_file.display());
    let stats = summary.source(&name).unwrap();

    assert_eq!(stats.status, SourceStatus::Ok);
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.extracted, 2);
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.rendered, 1);
    assert_eq!(stats.printed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(label_count(&s.out_dir), 1);

    for id in ["a", "b", "c"] {
        assert!(ledger.has(&LedgerKey::for_item(&name, id)).await.unwrap());
    }
    let printed = ledger.recent_prints(10).await.unwrap();
    assert_eq!(printed.len(), 1);
    assert_eq!(printed[0].title.as_deref(), Some("Pay ACME invoice"));
    assert_eq!(printed[0].score, Some(85));

    let totals = ledger.stats().await.unwrap();
    assert_eq!(totals.items, 3);
    assert_eq!(totals.printed, 1);
}

#[tokio::test]
async fn second_cycle_prints_nothing() {
    let s = setup(THREE_ITEMS);
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger.clone(),
        &[s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;

    controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    let again = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();

    let totals = again.totals();
    assert_eq!(totals.fetched, 0);
    assert_eq!(totals.deduped, 3);
    assert_eq!(totals.extracted, 0);
    assert_eq!(totals.printed, 0);
    assert_eq!(label_count(&s.out_dir), 1);
    assert_eq!(ledger.stats().await.unwrap().printed, 1);
}

#[tokio::test]
async fn ledger_survives_restart() {
    let s = setup(THREE_ITEMS);
    {
        let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
        let controller = controller_with(
            ledger,
            &[s.tasks_file.as_path()],
            Arc::new(FilePrinter::new(&s.out_dir)),
        )
        .await;
        controller
            .run_cycle(&RunOptions::default(), &Shutdown::new())
            .await
            .unwrap();
    }

    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger,
        &[s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;
    let summary = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(summary.totals().printed, 0);
    assert_eq!(label_count(&s.out_dir), 1);
}

#[tokio::test]
async fn failed_print_is_retried_next_cycle() {
    let s = setup(THREE_ITEMS);
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let printer = Arc::new(FlakyPrinter {
        inner: FilePrinter::new(&s.out_dir),
        failures: AtomicU32::new(1),
    });
    let controller = controller_with(ledger.clone(), &[s.tasks_file.as_path()], printer).await;

    let first = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(first.totals().printed, 0);
    assert_eq!(first.totals().failed, 1);
    assert_eq!(ledger.stats().await.unwrap().deferred, 1);
    assert_eq!(ledger.stats().await.unwrap().printed, 0);

    let second = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(second.totals().fetched, 0);
    assert_eq!(second.totals().retried, 1);
    assert_eq!(second.totals().printed, 1);
    assert_eq!(ledger.stats().await.unwrap().deferred, 0);

    let third = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(third.totals().printed, 0);
    assert_eq!(label_count(&s.out_dir), 1);
}

#[tokio::test]
async fn threshold_is_inclusive() {
    let s = setup(
        r#"{"tasks": [
            {"id": "at", "title": "At threshold", "score": 70},
            {"id": "below", "title": "Just below", "score": 69}
        ]}"#,
    );
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger.clone(),
        &[s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;

    let summary = controller
        .run_cycle(
            &RunOptions {
                threshold: 70,
                ..RunOptions::default()
            },
            &Shutdown::new(),
        )
        .await
        .unwrap();
    assert_eq!(summary.totals().filtered, 1);
    assert_eq!(summary.totals().printed, 1);
    let printed = ledger.recent_prints(10).await.unwrap();
    assert_eq!(printed[0].title.as_deref(), Some("At threshold"));
}

#[tokio::test]
async fn dry_run_leaves_no_trace() {
    let s = setup(THREE_ITEMS);
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger.clone(),
        &[s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;

    let dry = controller
        .run_cycle(
            &RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
            &Shutdown::new(),
        )
        .await
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.totals().rendered, 1);
    assert_eq!(dry.totals().printed, 0);
    assert_eq!(label_count(&s.out_dir), 0);
    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.items, 0);
    assert!(ledger.load_source_records().await.unwrap().is_empty());

    let real = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(real.totals().printed, 1);
}

#[tokio::test]
async fn force_reprint_bypasses_the_ledger() {
    let s = setup(THREE_ITEMS);
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger.clone(),
        &[s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;

    controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    let forced = controller
        .run_cycle(
            &RunOptions {
                force_reprint: true,
                ..RunOptions::default()
            },
            &Shutdown::new(),
        )
        .await
        .unwrap();
    assert_eq!(forced.totals().fetched, 3);
    assert_eq!(forced.totals().printed, 1);
    assert_eq!(label_count(&s.out_dir), 2);

    // Entries are not duplicated.
    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.items, 3);
    assert_eq!(stats.printed, 1);
}

#[tokio::test]
async fn broken_source_opens_its_breaker_without_affecting_others() {
    let s = setup(THREE_ITEMS);
    let missing = s.tasks_file.with_file_name("missing.json");
    let ledger = Arc::new(LibSqlLedger::new_local(&s.db_path).await.unwrap());
    let controller = controller_with(
        ledger.clone(),
        &[missing.as_path(), s.tasks_file.as_path()],
        Arc::new(FilePrinter::new(&s.out_dir)),
    )
    .await;
    let broken = format!("local:{}", missing.display());

    for _ in 0..2 {
        let summary = controller
            .run_cycle(&RunOptions::default(), &Shutdown::new())
            .await
            .unwrap();
        assert_eq!(summary.source(&broken).unwrap().status, SourceStatus::FetchFailed);
    }

    let third = controller
        .run_cycle(&RunOptions::default(), &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(third.source(&broken).unwrap().status, SourceStatus::CircuitOpen);
    assert_eq!(third.failed_sources(), vec![broken.as_str()]);
    assert_eq!(label_count(&s.out_dir), 1);

    let health = controller.health().unhealthy().await;
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].state, BreakerState::Open);

    let persisted = ledger.load_source_records().await.unwrap();
    let record = persisted.iter().find(|r| r.source == broken).unwrap();
    assert_eq!(record.state, BreakerState::Open);
    assert_eq!(record.consecutive_failures, 2);
}
