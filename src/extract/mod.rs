//! Extractors: turn a batch of items into scored tasks.

pub mod llm;
pub mod rules;

pub use llm::LlmExtractor;
pub use rules::RuleScorer;

use std::sync::Arc;

use crate::config::LlmSettings;
use crate::pipeline::Extractor;

/// LLM extraction when an API key is configured, rule scoring otherwise.
pub fn build_extractor(settings: &LlmSettings) -> Arc<dyn Extractor> {
    if settings.api_key.is_none() {
        tracing::info!("No LLM API key configured, using rule-based scoring");
        return Arc::new(RuleScorer::new());
    }
    match crate::llm::create_completer(settings) {
        Ok(completer) => Arc::new(LlmExtractor::new(completer)),
        Err(e) => {
            tracing::warn!("LLM unavailable ({e}), using rule-based scoring");
            Arc::new(RuleScorer::new())
        }
    }
}
