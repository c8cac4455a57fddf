//! Printer transports.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{PrinterKind, PrinterSettings};
use crate::error::PrinterError;
use crate::pipeline::{LabelImage, Printer};

pub fn build_printer(settings: &PrinterSettings) -> Arc<dyn Printer> {
    match &settings.kind {
        PrinterKind::File => Arc::new(FilePrinter::new(&settings.output_dir)),
        PrinterKind::Lp { queue } => Arc::new(LpPrinter::new(
            queue.clone(),
            &settings.output_dir,
            settings.timeout,
        )),
    }
}

async fn write_label(dir: &Path, label: &LabelImage) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let job = Uuid::new_v4().simple().to_string();
    let path = dir.join(format!("{stamp}_{}_{}", &job[..8], label.file_name));
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(&label.bytes).await?;
    file.sync_all().await?;
    Ok(path)
}

/// Writes each label to the output directory. A print is confirmed once the
/// file is flushed to disk.
pub struct FilePrinter {
    dir: PathBuf,
    name: String,
}

impl FilePrinter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            name: format!("file:{}", dir.display()),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Printer for FilePrinter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        tokio::fs::create_dir_all(&self.dir).await.is_ok()
    }

    async fn print(&self, label: &LabelImage) -> Result<(), PrinterError> {
        let path = write_label(&self.dir, label)
            .await
            .map_err(|e| PrinterError::JobFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(path = %path.display(), "Label written");
        Ok(())
    }
}

/// Delay between `lpstat` polls while waiting for a job to finish.
const COMPLETION_POLL: Duration = Duration::from_secs(1);

/// Spools labels through CUPS `lp`. A print is confirmed only once CUPS lists
/// the job as completed; `timeout` bounds spooling and completion together.
pub struct LpPrinter {
    queue: Option<String>,
    spool_dir: PathBuf,
    timeout: Duration,
    name: String,
}

impl LpPrinter {
    pub fn new(queue: Option<String>, spool_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let name = match &queue {
            Some(q) => format!("lp:{q}"),
            None => "lp".to_string(),
        };
        Self {
            queue,
            spool_dir: spool_dir.into(),
            timeout,
            name,
        }
    }

    fn command(&self, file: &Path) -> Command {
        let mut cmd = Command::new("lp");
        if let Some(queue) = &self.queue {
            cmd.arg("-d").arg(queue);
        }
        cmd.arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn completed_jobs_command(&self) -> Command {
        let mut cmd = Command::new("lpstat");
        cmd.arg("-W").arg("completed").arg("-o");
        if let Some(queue) = &self.queue {
            cmd.arg(queue);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn timed_out(&self) -> PrinterError {
        PrinterError::Timeout {
            name: self.name.clone(),
            timeout: self.timeout,
        }
    }

    /// Poll CUPS until `job` shows up among completed jobs.
    async fn wait_for_completion(&self, job: &str, deadline: Instant) -> Result<(), PrinterError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.completed_jobs_command().output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    if job_completed(&String::from_utf8_lossy(&output.stdout), job) {
                        return Ok(());
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(PrinterError::Unavailable {
                        name: self.name.clone(),
                        reason: format!("could not run lpstat: {e}"),
                    });
                }
                Err(_) => return Err(self.timed_out()),
            }

            if Instant::now() + COMPLETION_POLL >= deadline {
                tracing::warn!(printer = %self.name, job, "Print job still pending at timeout");
                return Err(self.timed_out());
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }
}

/// Job id from `lp` output such as `request id is Munbyn-42 (1 file(s))`.
fn parse_job_id(stdout: &str) -> Option<&str> {
    stdout
        .split_whitespace()
        .skip_while(|word| *word != "is")
        .nth(1)
}

/// Whether an `lpstat -W completed -o` listing contains `job`.
fn job_completed(listing: &str, job: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().next() == Some(job))
}

#[async_trait]
impl Printer for LpPrinter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        let mut cmd = Command::new("lpstat");
        match &self.queue {
            Some(q) => cmd.arg("-p").arg(q),
            None => cmd.arg("-r"),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        matches!(
            tokio::time::timeout(Duration::from_secs(5), cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    async fn print(&self, label: &LabelImage) -> Result<(), PrinterError> {
        let deadline = Instant::now() + self.timeout;
        let path = write_label(&self.spool_dir, label)
            .await
            .map_err(|e| PrinterError::JobFailed {
                name: self.name.clone(),
                reason: format!("spool file: {e}"),
            })?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let output = tokio::time::timeout(remaining, self.command(&path).output())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| PrinterError::Unavailable {
                name: self.name.clone(),
                reason: format!("could not run lp: {e}"),
            })?;

        if !output.status.success() {
            return Err(PrinterError::JobFailed {
                name: self.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job = parse_job_id(&stdout).ok_or_else(|| PrinterError::JobFailed {
            name: self.name.clone(),
            reason: format!("lp reported no job id: {}", stdout.trim()),
        })?;
        tracing::debug!(printer = %self.name, job, "Label spooled, waiting for completion");

        self.wait_for_completion(job, deadline).await?;
        tracing::debug!(printer = %self.name, job, "Print job completed");
        Ok(())
    }
}
