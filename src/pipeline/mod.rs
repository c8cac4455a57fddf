//! Label pipeline.
//!
//! Every cycle runs the same stages for each configured source:
//! 1. Fetch, guarded by the source's circuit breaker and the retry executor
//! 2. Dedupe against the ledger by item key
//! 3. Extract scored tasks, then record the item keys
//! 4. Filter by score threshold and print key
//! 5. Render
//! 6. Print
//! 7. Record the print key
//!
//! A failure in one source, item or task never stops the others. Only a
//! ledger failure aborts the cycle.

pub mod controller;
pub mod daemon;
pub mod summary;
pub mod types;

pub use controller::{PipelineController, RunOptions};
pub use daemon::{Daemon, DaemonReport, Shutdown, spawn_signal_listener};
pub use summary::{CycleSummary, SourceStatus, SourceSummary, Stage, StageError, Totals};
pub use types::{Extractor, Item, LabelImage, Printer, Priority, Renderer, Source, Task};
