use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use taskprint::config::{AppConfig, RunMode};
use taskprint::extract::build_extractor;
use taskprint::pipeline::{Daemon, PipelineController, RunOptions, Shutdown, spawn_signal_listener};
use taskprint::printer::build_printer;
use taskprint::render::TextLabelRenderer;
use taskprint::resilience::{BreakerRegistry, format_report};
use taskprint::sources::build_sources;
use taskprint::store::{Ledger, LibSqlLedger};

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskprint.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Read before the full config so that config errors are logged too.
    let log_dir = std::env::var_os("TASKPRINT_LOG_DIR").map(std::path::PathBuf::from);
    let _log_guard = init_tracing(log_dir.as_deref());

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    let ledger = Arc::new(
        LibSqlLedger::new_local(&config.db_path)
            .await
            .with_context(|| format!("could not open ledger at {}", config.db_path.display()))?,
    );

    eprintln!("🏷️  taskprint v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {:?}", config.run.mode);
    eprintln!("   Ledger: {}", config.db_path.display());
    eprintln!("   Sources: {}", config.sources.len());

    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let controller = Arc::new(
        PipelineController::new(
            ledger.clone(),
            breakers,
            build_extractor(&config.llm),
            Arc::new(TextLabelRenderer::default()),
            build_printer(&config.printer),
        )
        .with_sources(build_sources(&config.sources))
        .with_retry_policy(config.retry.clone()),
    );

    let restored = controller
        .restore_source_records()
        .await
        .context("could not load source records")?;
    if restored > 0 {
        tracing::debug!(sources = restored, "Restored breaker state");
    }

    match config.run.mode {
        RunMode::Stats => print_stats(ledger.as_ref()).await?,
        RunMode::Health => {
            let snapshot = controller.health().snapshot().await;
            println!("{}", format_report(&snapshot));
        }
        RunMode::Reset => {
            let name = config.run.reset_source.as_deref().unwrap_or_default();
            if controller.reset_source(name).await.context("reset failed")? {
                println!("Reset {name}");
            } else {
                println!("No state recorded for {name}");
            }
        }
        RunMode::Once => {
            let shutdown = Shutdown::new();
            spawn_signal_listener(shutdown.clone());
            let summary = controller
                .run_cycle(&RunOptions::from(&config.run), &shutdown)
                .await
                .context("cycle could not run")?;
            eprintln!("{summary}");
        }
        RunMode::Daemon => {
            let shutdown = Shutdown::new();
            spawn_signal_listener(shutdown.clone());
            let report = Daemon::new(controller, &config.run, shutdown).run().await;
            eprintln!("Daemon stopped: {report}");
            match ledger.stats().await {
                Ok(stats) => eprintln!(
                    "Ledger: {} items seen, {} labels printed",
                    stats.items, stats.printed
                ),
                Err(e) => tracing::warn!("Could not read ledger stats: {e}"),
            }
        }
    }
    Ok(())
}

async fn print_stats(ledger: &dyn Ledger) -> anyhow::Result<()> {
    let stats = ledger.stats().await.context("could not read ledger stats")?;

    println!("Items seen:       {}", stats.items);
    println!("Labels printed:   {}", stats.printed);
    if let Some(avg) = stats.average_printed_score {
        println!("Average score:    {avg:.1}");
    }
    println!("Awaiting reprint: {}", stats.deferred);
    for (source, count) in &stats.printed_by_source {
        println!("  {source:<32} {count}");
    }

    let recent = ledger
        .recent_prints(10)
        .await
        .context("could not list recent prints")?;
    if !recent.is_empty() {
        println!("\nRecent prints:");
        for entry in recent {
            println!(
                "  {} [{}] {}",
                entry.recorded_at.format("%Y-%m-%d %H:%M"),
                entry.score.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                entry.title.unwrap_or_default()
            );
        }
    }
    Ok(())
}
