//! taskprint: pulls tasks from sources, scores them, and prints the important
//! ones as labels, at most once each.

pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod pipeline;
pub mod printer;
pub mod render;
pub mod resilience;
pub mod sources;
pub mod store;
