//! Per-cycle reporting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Pipeline stage, used to tag reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extract,
    Render,
    Print,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Render => "render",
            Self::Print => "print",
        }
    }
}

/// How far a source got in this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Every stage completed without a reported error.
    Ok,
    /// Ran to the end but some items or tasks failed.
    Partial,
    /// Rejected by an open circuit breaker; nothing was fetched.
    CircuitOpen,
    /// Fetch failed after retries.
    FetchFailed,
    /// The source reported itself as not configured.
    NotConfigured,
    /// The cycle was cancelled before this source finished.
    Cancelled,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::CircuitOpen => "circuit_open",
            Self::FetchFailed => "fetch_failed",
            Self::NotConfigured => "not_configured",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

/// Counts for one source in one cycle.
///
/// `fetched` counts items not seen before; `deduped` counts items dropped
/// because the ledger already had them.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub status: SourceStatus,
    pub fetched: usize,
    pub deduped: usize,
    pub extracted: usize,
    pub filtered: usize,
    pub rendered: usize,
    pub printed: usize,
    pub failed: usize,
    /// Parked tasks from earlier cycles that were re-submitted.
    pub retried: usize,
    pub errors: Vec<StageError>,
}

impl SourceSummary {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: SourceStatus::Ok,
            fetched: 0,
            deduped: 0,
            extracted: 0,
            filtered: 0,
            rendered: 0,
            printed: 0,
            failed: 0,
            retried: 0,
            errors: Vec::new(),
        }
    }

    pub fn with_status(source: impl Into<String>, status: SourceStatus) -> Self {
        Self {
            status,
            ..Self::new(source)
        }
    }

    /// Record a stage failure. Marks an otherwise healthy source as partial.
    pub fn error(&mut self, stage: Stage, message: impl Into<String>) {
        self.errors.push(StageError {
            stage,
            message: message.into(),
        });
        if self.status == SourceStatus::Ok {
            self.status = SourceStatus::Partial;
        }
    }
}

/// Counts summed across sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub fetched: usize,
    pub deduped: usize,
    pub extracted: usize,
    pub filtered: usize,
    pub rendered: usize,
    pub printed: usize,
    pub failed: usize,
    pub retried: usize,
}

impl fmt::Display for Totals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} deduped={} extracted={} filtered={} rendered={} printed={} failed={}",
            self.fetched,
            self.deduped,
            self.extracted,
            self.filtered,
            self.rendered,
            self.printed,
            self.failed
        )?;
        if self.retried > 0 {
            write!(f, " retried={}", self.retried)?;
        }
        Ok(())
    }
}

/// Outcome of one pipeline cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub sources: Vec<SourceSummary>,
}

impl CycleSummary {
    pub fn new(dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            cancelled: false,
            sources: Vec::new(),
        }
    }

    pub fn source(&self, name: &str) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.source == name)
    }

    pub fn totals(&self) -> Totals {
        self.sources.iter().fold(Totals::default(), |mut t, s| {
            t.fetched += s.fetched;
            t.deduped += s.deduped;
            t.extracted += s.extracted;
            t.filtered += s.filtered;
            t.rendered += s.rendered;
            t.printed += s.printed;
            t.failed += s.failed;
            t.retried += s.retried;
            t
        })
    }

    /// Sources that could not be fetched this cycle.
    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SourceStatus::FetchFailed | SourceStatus::CircuitOpen
                )
            })
            .map(|s| s.source.as_str())
            .collect()
    }

    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cycle {}", self.short_id())?;
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        if let Some(done) = self.finished_at {
            let ms = (done - self.started_at).num_milliseconds().max(0);
            write!(f, " in {ms}ms")?;
        }
        writeln!(f)?;
        for s in &self.sources {
            writeln!(
                f,
                "  {:<32} {:<14} fetched={} deduped={} extracted={} filtered={} rendered={} printed={} failed={}",
                s.source,
                s.status.as_str(),
                s.fetched,
                s.deduped,
                s.extracted,
                s.filtered,
                s.rendered,
                s.printed,
                s.failed
            )?;
            for e in &s.errors {
                writeln!(f, "      {}: {}", e.stage.as_str(), e.message)?;
            }
        }
        write!(f, "  total: {}", self.totals())
    }
}
