//! Persistence layer: the libSQL-backed deduplication ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{
    DeferredPrint, EntryKind, Ledger, LedgerEntry, LedgerKey, LedgerStats, RecordOutcome,
};
