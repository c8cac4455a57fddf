//! Shared types for the label pipeline.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExtractError, PrinterError, RenderError, SourceError};
use crate::store::LedgerKey;

// ── Priority ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Lenient parse; unknown values fall back to `Medium`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "low" | "basse" => Self::Low,
            "high" | "haute" => Self::High,
            "urgent" | "urgente" | "critique" | "critical" => Self::Urgent,
            _ => Self::Medium,
        }
    }

    /// Priority implied by a 0..=100 score.
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => Self::Urgent,
            65..=79 => Self::High,
            40..=64 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Glyph printed in front of the label title.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Low => "○",
            Self::Medium => "●",
            Self::High => "▲",
            Self::Urgent => "⚠",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Item ────────────────────────────────────────────────────────────

/// One unit fetched from a source. Lives for a single cycle.
///
/// Identity is `(source_name, source_id)` only; nothing derived from the
/// content takes part in deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Source-local identifier (message id, task id, ...).
    pub source_id: String,
    pub source_name: String,
    pub title: String,
    pub description: Option<String>,
    /// Priority as declared by the source, if any.
    pub priority: Option<Priority>,
    pub category: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
    /// Untouched source payload.
    pub raw_payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl Item {
    pub fn new(source_name: impl Into<String>, source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: source_name.into(),
            title: title.into(),
            description: None,
            priority: None,
            category: None,
            due_date: None,
            created_at: None,
            raw_payload: serde_json::Value::Null,
            fetched_at: Utc::now(),
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::for_item(&self.source_name, &self.source_id)
    }
}

// ── Task ────────────────────────────────────────────────────────────

/// A candidate label extracted from one or more items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    pub description: Option<String>,
    /// 0..=100, higher is more important.
    pub score: u8,
    pub priority: Priority,
    pub origin_item_keys: Vec<LedgerKey>,
    /// Why the task was kept, printed on the label.
    pub reason: Option<String>,
    pub source_name: String,
    pub due_date: Option<NaiveDate>,
    pub category: Option<String>,
}

impl Task {
    /// Start a task derived from `items` (must be non-empty for a meaningful key).
    pub fn from_items(items: &[&Item], title: impl Into<String>, score: u8) -> Self {
        let mut keys: Vec<LedgerKey> = items.iter().map(|i| i.key()).collect();
        keys.sort();
        keys.dedup();
        let first = items.first();
        Self {
            title: title.into(),
            description: None,
            score: score.min(100),
            priority: Priority::from_score(score),
            origin_item_keys: keys,
            reason: None,
            source_name: first.map(|i| i.source_name.clone()).unwrap_or_default(),
            due_date: first.and_then(|i| i.due_date),
            category: first.and_then(|i| i.category.clone()),
        }
    }

    pub fn print_key(&self) -> LedgerKey {
        LedgerKey::for_print(&self.origin_item_keys, &self.title)
    }

    /// Inclusive lower bound: a task scoring exactly `threshold` is kept.
    pub fn passes(&self, threshold: u8) -> bool {
        self.score >= threshold
    }
}

// ── Label ───────────────────────────────────────────────────────────

/// Opaque rendered label, ready for the printer.
#[derive(Debug, Clone)]
pub struct LabelImage {
    pub bytes: Vec<u8>,
    /// Suggested file name, no directory.
    pub file_name: String,
    pub title: String,
}

// ── Collaborator traits ─────────────────────────────────────────────

/// A place tasks come from.
#[async_trait]
pub trait Source: Send + Sync {
    /// Unique source name, used for ledger keys and breaker state.
    fn name(&self) -> &str;

    /// Whether the source has what it needs to be polled.
    fn is_configured(&self) -> bool;

    async fn fetch_items(&self) -> Result<Vec<Item>, SourceError>;

    /// Refresh credentials after a recoverable failure.
    async fn refresh(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Turns items into scored tasks.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Process one batch of items from a single source. Returning no tasks is
    /// a valid outcome.
    async fn process(&self, items: &[Item]) -> Result<Vec<Task>, ExtractError>;
}

pub trait Renderer: Send + Sync {
    fn render(&self, task: &Task) -> Result<LabelImage, RenderError>;
}

#[async_trait]
pub trait Printer: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    /// Returns `Ok` only once the label is confirmed printed.
    async fn print(&self, label: &LabelImage) -> Result<(), PrinterError>;
}
