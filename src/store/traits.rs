//! `Ledger` trait: the single async interface for persistence.
//!
//! Entries are append-only. Deferred prints and source records are the only
//! mutable state.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DatabaseError;
use crate::resilience::SourceRecord;

/// Stable fingerprint identifying an item or a printed task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerKey(String);

impl LedgerKey {
    /// Key for a raw item, derived from its source and source-local id.
    pub fn for_item(source_name: &str, source_id: &str) -> Self {
        Self::digest(&format!(
            "{}|{}",
            normalize(source_name),
            normalize(source_id)
        ))
    }

    /// Key for a printed task. Order of the origin keys does not matter.
    pub fn for_print(origin_keys: &[LedgerKey], title: &str) -> Self {
        let mut origins: Vec<&str> = origin_keys.iter().map(|k| k.as_str()).collect();
        origins.sort_unstable();
        origins.dedup();
        Self::digest(&format!("{}|{}", origins.join(","), normalize(title)))
    }

    fn digest(raw: &str) -> Self {
        let hash = Sha256::digest(raw.as_bytes());
        let hex: String = hash.iter().take(8).map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize(part: &str) -> String {
    part.trim().to_lowercase()
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LedgerKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// What a ledger entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// An item that went through extraction.
    Item,
    /// A task whose label was physically printed.
    Print,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Print => "print",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "print" => Self::Print,
            _ => Self::Item,
        }
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub key: LedgerKey,
    pub kind: EntryKind,
    pub source: String,
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub score: Option<u8>,
    pub tasks_extracted: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry for an item that has been through extraction.
    pub fn item(source: &str, source_id: &str, title: &str, tasks_extracted: u32) -> Self {
        Self {
            key: LedgerKey::for_item(source, source_id),
            kind: EntryKind::Item,
            source: source.to_string(),
            source_id: Some(source_id.to_string()),
            title: Some(title.to_string()),
            score: None,
            tasks_extracted: Some(tasks_extracted),
            recorded_at: Utc::now(),
        }
    }

    /// Entry for a confirmed print.
    pub fn print(key: LedgerKey, source: &str, title: &str, score: u8) -> Self {
        Self {
            key,
            kind: EntryKind::Print,
            source: source.to_string(),
            source_id: None,
            title: Some(title.to_string()),
            score: Some(score),
            tasks_extracted: None,
            recorded_at: Utc::now(),
        }
    }
}

/// Result of `Ledger::record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// The key was already present; the existing row was left untouched.
    AlreadyRecorded,
}

/// Aggregate counters for `TASKPRINT_MODE=stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub items: u64,
    pub printed: u64,
    pub printed_by_source: Vec<(String, u64)>,
    pub average_printed_score: Option<f64>,
    pub deferred: u64,
}

/// A task that passed the filter but could not be printed yet.
#[derive(Debug, Clone)]
pub struct DeferredPrint {
    pub key: LedgerKey,
    pub source: String,
    /// Serialized task.
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create tables if missing. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    async fn has(&self, key: &LedgerKey) -> Result<bool, DatabaseError>;

    /// Persist an entry. Recording an existing key is a no-op.
    async fn record(&self, entry: &LedgerEntry) -> Result<RecordOutcome, DatabaseError>;

    async fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, DatabaseError>;

    async fn stats(&self) -> Result<LedgerStats, DatabaseError>;

    /// Latest printed entries, newest first.
    async fn recent_prints(&self, limit: usize) -> Result<Vec<LedgerEntry>, DatabaseError>;

    // ── Deferred prints ─────────────────────────────────────────────

    /// Park a task for a later print attempt. Re-parking bumps `attempts`.
    async fn defer_print(
        &self,
        key: &LedgerKey,
        source: &str,
        payload: &str,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Parked tasks for one source, oldest first.
    async fn deferred_prints(&self, source: &str) -> Result<Vec<DeferredPrint>, DatabaseError>;

    async fn clear_deferred(&self, key: &LedgerKey) -> Result<(), DatabaseError>;

    /// Names of sources that have parked tasks.
    async fn deferred_sources(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Source records ──────────────────────────────────────────────

    async fn load_source_records(&self) -> Result<Vec<SourceRecord>, DatabaseError>;

    async fn save_source_record(&self, record: &SourceRecord) -> Result<(), DatabaseError>;

    /// Drop a persisted record. Returns false when none existed.
    async fn reset_source_record(&self, source: &str) -> Result<bool, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_key_is_normalized() {
        let a = LedgerKey::for_item("local:tasks.json", "json-001");
        let b = LedgerKey::for_item("LOCAL:tasks.json", "JSON-001 ");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn item_key_differs_by_source() {
        let a = LedgerKey::for_item("local:a.json", "1");
        let b = LedgerKey::for_item("local:b.json", "1");
        assert_ne!(a, b);
    }

    #[test]
    fn print_key_ignores_origin_order() {
        let x = LedgerKey::for_item("s", "1");
        let y = LedgerKey::for_item("s", "2");
        let k1 = LedgerKey::for_print(&[x.clone(), y.clone()], "Pay rent");
        let k2 = LedgerKey::for_print(&[y, x], "  pay RENT ");
        assert_eq!(k1, k2);
    }

    #[test]
    fn print_key_trims_leading_title_whitespace() {
        let x = LedgerKey::for_item("s", "1");
        let k1 = LedgerKey::for_print(std::slice::from_ref(&x), "Pay rent");
        let k2 = LedgerKey::for_print(&[x], "\tPay rent");
        assert_eq!(k1, k2);
    }

    #[test]
    fn print_key_differs_by_title() {
        let x = LedgerKey::for_item("s", "1");
        let k1 = LedgerKey::for_print(std::slice::from_ref(&x), "Pay rent");
        let k2 = LedgerKey::for_print(&[x], "Pay gas bill");
        assert_ne!(k1, k2);
    }

    #[test]
    fn entry_kind_parse() {
        assert_eq!(EntryKind::parse("print"), EntryKind::Print);
        assert_eq!(EntryKind::parse("item"), EntryKind::Item);
        assert_eq!(EntryKind::Print.as_str(), "print");
    }
}
