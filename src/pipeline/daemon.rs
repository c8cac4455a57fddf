//! Supervised daemon loop.
//!
//! Each cycle runs in its own task so that an error or a panic inside it is
//! caught here and nowhere else. The loop only ends on a shutdown request or
//! after `max_iterations` cycles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::pipeline::controller::{PipelineController, RunOptions};
use crate::pipeline::summary::CycleSummary;

/// Consecutive failed cycles before the extra wait kicks in.
const ESCALATE_AFTER: u32 = 3;
const ESCALATION_STEP: Duration = Duration::from_secs(60);
const MAX_ESCALATION: Duration = Duration::from_secs(600);

/// Cooperative shutdown flag shared by the daemon, the controller and the
/// signal listener.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Trigger `shutdown` on Ctrl-C or SIGTERM.
pub fn spawn_signal_listener(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Interrupt received, stopping"),
                        _ = term.recv() => info!("SIGTERM received, stopping"),
                    }
                }
                Err(e) => {
                    warn!("Could not install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Interrupt received, stopping");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupt received, stopping");
        }
        shutdown.trigger();
    })
}

/// Extra wait after `failures` consecutive failed cycles.
pub fn escalation_delay(failures: u32) -> Duration {
    if failures < ESCALATE_AFTER {
        return Duration::ZERO;
    }
    (ESCALATION_STEP * failures).min(MAX_ESCALATION)
}

/// Totals reported when the daemon stops.
#[derive(Debug, Clone, Default)]
pub struct DaemonReport {
    pub iterations: u64,
    pub total_printed: usize,
    pub failed_cycles: u64,
    pub last_summary: Option<CycleSummary>,
}

impl fmt::Display for DaemonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iterations={} printed={} failed_cycles={}",
            self.iterations, self.total_printed, self.failed_cycles
        )
    }
}

pub struct Daemon {
    controller: Arc<PipelineController>,
    opts: RunOptions,
    interval: Duration,
    max_iterations: Option<u64>,
    shutdown: Shutdown,
}

impl Daemon {
    pub fn new(controller: Arc<PipelineController>, run: &RunConfig, shutdown: Shutdown) -> Self {
        Self {
            controller,
            opts: RunOptions::from(run),
            interval: run.interval,
            max_iterations: run.max_iterations,
            shutdown,
        }
    }

    pub async fn run(&self) -> DaemonReport {
        let mut report = DaemonReport::default();
        let mut consecutive_failures = 0u32;

        info!(
            interval_secs = self.interval.as_secs(),
            threshold = self.opts.threshold,
            max_iterations = ?self.max_iterations,
            "Daemon started"
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            if self.max_iterations.is_some_and(|max| report.iterations >= max) {
                info!(iterations = report.iterations, "Max iterations reached");
                break;
            }
            report.iterations += 1;

            let controller = self.controller.clone();
            let opts = self.opts;
            let shutdown = self.shutdown.clone();
            let cycle =
                tokio::spawn(async move { controller.run_cycle(&opts, &shutdown).await });

            match cycle.await {
                Ok(Ok(summary)) => {
                    consecutive_failures = 0;
                    report.total_printed += summary.totals().printed;
                    info!(iteration = report.iterations, "\n{summary}");
                    report.last_summary = Some(summary);
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    report.failed_cycles += 1;
                    error!(iteration = report.iterations, error = %e, "Cycle failed");
                }
                Err(join_err) => {
                    consecutive_failures += 1;
                    report.failed_cycles += 1;
                    error!(iteration = report.iterations, error = %join_err, "Cycle aborted unexpectedly");
                }
            }

            let unhealthy = self.controller.health().unhealthy().await;
            if !unhealthy.is_empty() {
                let names: Vec<&str> = unhealthy.iter().map(|h| h.source.as_str()).collect();
                warn!(sources = %names.join(", "), "Unhealthy sources");
            }

            if self.shutdown.is_triggered()
                || self.max_iterations.is_some_and(|max| report.iterations >= max)
            {
                continue;
            }

            let extra = escalation_delay(consecutive_failures);
            if !extra.is_zero() {
                warn!(
                    failures = consecutive_failures,
                    extra_secs = extra.as_secs(),
                    "Repeated cycle failures, backing off"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval + extra) => {}
                _ = self.shutdown.wait() => {}
            }
        }

        info!(%report, "Daemon stopped");
        report
    }
}
