//! LLM-backed extraction: one completion per source batch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ExtractError;
use crate::llm::Completer;
use crate::pipeline::{Extractor, Item, Priority, Task};

const DEFAULT_SCORE: f64 = 50.0;
const MAX_DESCRIPTION_CHARS: usize = 320;

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    tasks: Vec<ExtractedTask>,
}

#[derive(Debug, Deserialize)]
struct ExtractedTask {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "description")]
    desc: Option<String>,
    #[serde(default)]
    score: Option<Value>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct LlmExtractor {
    completer: Arc<dyn Completer>,
    today: Option<NaiveDate>,
}

impl LlmExtractor {
    pub fn new(completer: Arc<dyn Completer>) -> Self {
        Self {
            completer,
            today: None,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn build_prompt(&self, items: &[Item]) -> String {
        let today = self.today.unwrap_or_else(|| Utc::now().date_naive());
        let mut prompt = format!(
            "Turn these to-do items into ACTIONABLE tasks worth printing as labels.\n\n\
             TODAY: {today}\n\nITEMS:\n"
        );

        for (i, item) in items.iter().enumerate() {
            prompt.push_str(&format!("[{i}] {}\n", item.title));
            if let Some(desc) = &item.description {
                prompt.push_str(&format!("    Description: {desc}\n"));
            }
            if let Some(due) = item.due_date {
                let days = (due - today).num_days();
                let due_info = match days {
                    d if d < 0 => format!("OVERDUE by {} days", -d),
                    0 => "DUE TODAY".to_string(),
                    d => format!("due in {d} days"),
                };
                prompt.push_str(&format!("    Due: {due} ({due_info})\n"));
            }
            if let Some(created) = item.created_at {
                let age = (today - created.date_naive()).num_days();
                prompt.push_str(&format!("    Created: {age} days ago\n"));
            }
            if let Some(priority) = item.priority {
                prompt.push_str(&format!("    Priority: {priority}\n"));
            }
            if let Some(category) = &item.category {
                prompt.push_str(&format!("    Category: {category}\n"));
            }
        }

        prompt.push_str(
            "\nSCORING:\n\
             90-100: CRITICAL (overdue, blocking)\n\
             70-89: HIGH (due soon, important)\n\
             50-69: MEDIUM (normal)\n\
             0-49: LOW/SKIP\n\n\
             RULES:\n\
             - An item can give 0, 1 or several tasks; several items can merge into one task\n\
             - \"items\" lists the [index] of every item a task comes from\n\
             - Titles start with an action verb, 25 chars max, same language as the item\n\
             - Descriptions are specific, 280 chars max\n\n\
             Respond JSON only:\n\
             {\"tasks\": [{\"items\": [<index>], \"title\": \"<25 chars>\", \"desc\": \"<280 chars>\", \
             \"score\": <0-100>, \"priority\": \"<urgent|high|medium|low>\", \"reason\": \"<10 words max>\"}]}\n",
        );
        prompt
    }

    fn parse_response(&self, items: &[Item], text: &str) -> Result<Vec<Task>, ExtractError> {
        let json = extract_json_object(text);
        let response: ExtractionResponse =
            serde_json::from_str(&json).map_err(|e| ExtractError::InvalidResponse {
                provider: self.completer.provider().to_string(),
                reason: format!("{e}"),
            })?;

        let tasks = response
            .tasks
            .into_iter()
            .map(|raw| {
                let origins: Vec<&Item> = raw
                    .items
                    .iter()
                    .filter_map(index_of)
                    .filter_map(|i| items.get(i))
                    .collect();

                let score = raw
                    .score
                    .as_ref()
                    .and_then(score_of)
                    .unwrap_or(DEFAULT_SCORE)
                    .clamp(0.0, 100.0)
                    .round() as u8;

                let first = origins.first();
                let title = raw
                    .title
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .or_else(|| first.map(|i| i.title.clone()))
                    .unwrap_or_default();

                let mut task = Task::from_items(&origins, title, score);
                task.description = raw
                    .desc
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .or_else(|| {
                        first
                            .and_then(|i| i.description.as_deref())
                            .map(|d| d.chars().take(MAX_DESCRIPTION_CHARS).collect())
                    });
                if let Some(p) = raw.priority.as_deref().filter(|p| !p.trim().is_empty()) {
                    task.priority = Priority::parse(p);
                }
                task.reason = raw.reason.filter(|r| !r.trim().is_empty());
                task
            })
            .collect();
        Ok(tasks)
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn process(&self, items: &[Item]) -> Result<Vec<Task>, ExtractError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = self.build_prompt(items);
        let text = self.completer.complete(&prompt).await?;
        let tasks = self.parse_response(items, &text)?;
        tracing::debug!(
            provider = self.completer.provider(),
            model = self.completer.model_name(),
            items = items.len(),
            tasks = tasks.len(),
            "LLM extraction"
        );
        Ok(tasks)
    }
}

fn index_of(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().trim_matches(['[', ']']).parse().ok(),
        _ => None,
    }
}

fn score_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Pull a JSON object out of a model response that may be wrapped in prose
/// or a markdown code block.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
