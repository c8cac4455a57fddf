//! Version-tracked database migrations for the libSQL ledger.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                source_id TEXT,
                title TEXT,
                score INTEGER,
                tasks_extracted INTEGER,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_kind ON ledger_entries(kind);
            CREATE INDEX IF NOT EXISTS idx_ledger_source ON ledger_entries(source);
            CREATE INDEX IF NOT EXISTS idx_ledger_recorded ON ledger_entries(recorded_at);
        "#,
    },
    Migration {
        version: 2,
        name: "deferred_prints",
        sql: r#"
            CREATE TABLE IF NOT EXISTS deferred_prints (
                key TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deferred_source ON deferred_prints(source);
        "#,
    },
    Migration {
        version: 3,
        name: "source_health",
        sql: r#"
            CREATE TABLE IF NOT EXISTS source_health (
                source TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT,
                cooldown_ms INTEGER NOT NULL,
                reopen_count INTEGER NOT NULL DEFAULT 0,
                last_success TEXT,
                last_failure TEXT,
                last_error TEXT,
                total_calls INTEGER NOT NULL DEFAULT 0,
                total_failures INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Ledger migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "ledger_entries",
            "deferred_prints",
            "source_health",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn migrations_run_on_a_spawned_task() {
        let conn = test_conn().await;
        let handle = tokio::spawn(async move { run_migrations(&conn).await });
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn existing_rows_survive_rerun() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO ledger_entries (key, kind, source, recorded_at) VALUES ('abc', 'item', 's', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM ledger_entries", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "ledger");

        let row3 = {
            rows.next().await.unwrap().unwrap();
            rows.next().await.unwrap().unwrap()
        };
        let n3: String = row3.get(1).unwrap();
        assert_eq!(n3, "source_health");
    }
}
