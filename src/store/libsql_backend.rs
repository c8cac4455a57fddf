//! libSQL backend: async `Ledger` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::resilience::{BreakerState, SourceRecord};
use crate::store::migrations;
use crate::store::traits::{
    DeferredPrint, EntryKind, Ledger, LedgerEntry, LedgerKey, LedgerStats, RecordOutcome,
};

/// libSQL ledger backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn count(&self, sql: &str, op: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

const ENTRY_COLUMNS: &str =
    "key, kind, source, source_id, title, score, tasks_extracted, recorded_at";

fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry, libsql::Error> {
    let kind: String = row.get(1)?;
    let recorded: String = row.get(7)?;
    Ok(LedgerEntry {
        key: LedgerKey::from(row.get::<String>(0)?),
        kind: EntryKind::parse(&kind),
        source: row.get(2)?,
        source_id: row.get(3).ok(),
        title: row.get(4).ok(),
        score: row
            .get::<i64>(5)
            .ok()
            .map(|s| s.clamp(0, 100) as u8),
        tasks_extracted: row.get::<i64>(6).ok().map(|n| n.max(0) as u32),
        recorded_at: parse_datetime(&recorded),
    })
}

const RECORD_COLUMNS: &str = "source, state, consecutive_failures, opened_at, cooldown_ms, reopen_count, last_success, last_failure, last_error, total_calls, total_failures";

fn row_to_source_record(row: &libsql::Row) -> Result<SourceRecord, libsql::Error> {
    let state: String = row.get(1)?;
    let opened_at: Option<String> = row.get(3).ok();
    let last_success: Option<String> = row.get(6).ok();
    let last_failure: Option<String> = row.get(7).ok();
    Ok(SourceRecord {
        source: row.get(0)?,
        state: BreakerState::parse(&state),
        consecutive_failures: row.get::<i64>(2)?.max(0) as u32,
        opened_at: parse_optional_datetime(&opened_at),
        cooldown: Duration::from_millis(row.get::<i64>(4)?.max(0) as u64),
        reopen_count: row.get::<i64>(5)?.max(0) as u32,
        last_success: parse_optional_datetime(&last_success),
        last_failure: parse_optional_datetime(&last_failure),
        last_error: row.get(8).ok(),
        total_calls: row.get::<i64>(9)?.max(0) as u64,
        total_failures: row.get::<i64>(10)?.max(0) as u64,
    })
}

fn row_to_deferred(row: &libsql::Row) -> Result<DeferredPrint, libsql::Error> {
    let created: String = row.get(5)?;
    Ok(DeferredPrint {
        key: LedgerKey::from(row.get::<String>(0)?),
        source: row.get(1)?,
        payload: row.get(2)?,
        attempts: row.get::<i64>(3)?.max(0) as u32,
        last_error: row.get(4).ok(),
        created_at: parse_datetime(&created),
    })
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Drain a result set. A failed step aborts with the error; a row that does
/// not decode is logged and skipped.
async fn collect_rows<T, F>(
    mut rows: libsql::Rows,
    op: &str,
    decode: F,
) -> Result<Vec<T>, DatabaseError>
where
    F: Fn(&libsql::Row) -> Result<T, libsql::Error>,
{
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        match decode(&row) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!(op, "Skipping unreadable row: {e}"),
        }
    }
    Ok(out)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn has(&self, key: &LedgerKey) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM ledger_entries WHERE key = ?1 LIMIT 1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has: {e}")))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("has: {e}"))),
        }
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<RecordOutcome, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO ledger_entries ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) ON CONFLICT(key) DO NOTHING"
                ),
                params![
                    entry.key.as_str(),
                    entry.kind.as_str(),
                    entry.source.as_str(),
                    opt_text(entry.source_id.as_deref()),
                    opt_text(entry.title.as_deref()),
                    opt_int(entry.score.map(i64::from)),
                    opt_int(entry.tasks_extracted.map(i64::from)),
                    entry.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record: {e}")))?;

        if inserted == 0 {
            debug!(key = %entry.key, kind = entry.kind.as_str(), "Ledger key already recorded");
            Ok(RecordOutcome::AlreadyRecorded)
        } else {
            debug!(key = %entry.key, kind = entry.kind.as_str(), "Ledger entry recorded");
            Ok(RecordOutcome::Inserted)
        }
    }

    async fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE key = ?1"),
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_entry(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
        }
    }

    async fn stats(&self) -> Result<LedgerStats, DatabaseError> {
        let items = self
            .count(
                "SELECT COUNT(*) FROM ledger_entries WHERE kind = 'item'",
                "stats items",
            )
            .await?;
        let printed = self
            .count(
                "SELECT COUNT(*) FROM ledger_entries WHERE kind = 'print'",
                "stats printed",
            )
            .await?;
        let deferred = self
            .count("SELECT COUNT(*) FROM deferred_prints", "stats deferred")
            .await?;

        let rows = self
            .conn()
            .query(
                "SELECT source, COUNT(*) FROM ledger_entries WHERE kind = 'print' GROUP BY source ORDER BY COUNT(*) DESC, source",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats by source: {e}")))?;
        let printed_by_source = collect_rows(rows, "stats by source", |row| {
            Ok((row.get::<String>(0)?, row.get::<i64>(1)?.max(0) as u64))
        })
        .await?;

        let mut rows = self
            .conn()
            .query(
                "SELECT AVG(score) FROM ledger_entries WHERE kind = 'print' AND score IS NOT NULL",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats average: {e}")))?;
        let average_printed_score = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats average: {e}")))?
            .and_then(|row| row.get::<f64>(0).ok());

        Ok(LedgerStats {
            items,
            printed,
            printed_by_source,
            average_printed_score,
            deferred,
        })
    }

    async fn recent_prints(&self, limit: usize) -> Result<Vec<LedgerEntry>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE kind = 'print' ORDER BY recorded_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_prints: {e}")))?;

        collect_rows(rows, "recent_prints", row_to_entry).await
    }

    // ── Deferred prints ─────────────────────────────────────────────

    async fn defer_print(
        &self,
        key: &LedgerKey,
        source: &str,
        payload: &str,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO deferred_prints (key, source, payload, attempts, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    attempts = attempts + 1,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                params![key.as_str(), source, payload, error, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("defer_print: {e}")))?;

        debug!(key = %key, source, "Print deferred");
        Ok(())
    }

    async fn deferred_prints(&self, source: &str) -> Result<Vec<DeferredPrint>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT key, source, payload, attempts, last_error, created_at FROM deferred_prints WHERE source = ?1 ORDER BY created_at ASC",
                params![source],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deferred_prints: {e}")))?;

        collect_rows(rows, "deferred_prints", row_to_deferred).await
    }

    async fn clear_deferred(&self, key: &LedgerKey) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM deferred_prints WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_deferred: {e}")))?;
        Ok(())
    }

    async fn deferred_sources(&self) -> Result<Vec<String>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT DISTINCT source FROM deferred_prints ORDER BY source",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deferred_sources: {e}")))?;

        collect_rows(rows, "deferred_sources", |row| row.get::<String>(0)).await
    }

    // ── Source records ──────────────────────────────────────────────

    async fn load_source_records(&self) -> Result<Vec<SourceRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM source_health ORDER BY source"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_source_records: {e}")))?;

        collect_rows(rows, "load_source_records", row_to_source_record).await
    }

    async fn save_source_record(&self, record: &SourceRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO source_health ({RECORD_COLUMNS}, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(source) DO UPDATE SET
                        state = excluded.state,
                        consecutive_failures = excluded.consecutive_failures,
                        opened_at = excluded.opened_at,
                        cooldown_ms = excluded.cooldown_ms,
                        reopen_count = excluded.reopen_count,
                        last_success = excluded.last_success,
                        last_failure = excluded.last_failure,
                        last_error = excluded.last_error,
                        total_calls = excluded.total_calls,
                        total_failures = excluded.total_failures,
                        updated_at = excluded.updated_at"
                ),
                params![
                    record.source.as_str(),
                    record.state.as_str(),
                    i64::from(record.consecutive_failures),
                    opt_datetime(record.opened_at),
                    record.cooldown.as_millis() as i64,
                    i64::from(record.reopen_count),
                    opt_datetime(record.last_success),
                    opt_datetime(record.last_failure),
                    opt_text(record.last_error.as_deref()),
                    record.total_calls as i64,
                    record.total_failures as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_source_record: {e}")))?;
        Ok(())
    }

    async fn reset_source_record(&self, source: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM source_health WHERE source = ?1",
                params![source],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_source_record: {e}")))?;
        if deleted > 0 {
            info!(source, "Source record reset");
        }
        Ok(deleted > 0)
    }
}
