//! Tasks from a local JSON file.
//!
//! Expected shape:
//!
//! ```json
//! { "tasks": [ { "id": "task-001", "title": "Call the bank", "priority": "high",
//!                "category": "Admin", "due_date": "2025-12-15" } ] }
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::SourceError;
use crate::pipeline::{Item, Priority, Source};

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Value>,
}

pub struct LocalFileSource {
    name: String,
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("local:{}", path.display()),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_entry(&self, raw: &Value, index: usize) -> Result<Option<Item>, String> {
        let obj = raw.as_object().ok_or("entry is not an object")?;

        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or("missing 'title'")?;

        let status = obj.get("status").and_then(Value::as_str).unwrap_or("pending");
        if matches!(status, "completed" | "cancelled") {
            return Ok(None);
        }

        let id = match obj.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => format!("json-{index:03}"),
        };

        let text = |field: &str| {
            obj.get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let mut item = Item::new(&self.name, id, title);
        item.description = text("description");
        item.category = text("category");
        item.priority = text("priority").map(|p| Priority::parse(&p));
        item.due_date = text("due_date").and_then(|d| parse_date(&d));
        item.created_at = text("created_at").and_then(|d| parse_datetime(&d));
        item.raw_payload = raw.clone();
        Ok(Some(item))
    }
}

#[async_trait]
impl Source for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }

    async fn fetch_items(&self) -> Result<Vec<Item>, SourceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::fatal(
                    &self.name,
                    format!("file not found: {}", self.path.display()),
                ));
            }
            Err(e) => {
                return Err(SourceError::transient(
                    &self.name,
                    format!("read failed: {e}"),
                ));
            }
        };

        let file: TaskFile = serde_json::from_str(&content)
            .map_err(|e| SourceError::fatal(&self.name, format!("invalid JSON: {e}")))?;

        let mut items = Vec::with_capacity(file.tasks.len());
        for (index, raw) in file.tasks.iter().enumerate() {
            match self.parse_entry(raw, index) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!(source = %self.name, index, "Skipping malformed task: {reason}");
                }
            }
        }
        Ok(items)
    }
}

/// ISO date, ISO datetime, or `DD/MM/YYYY`.
fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(value).map(|dt| dt.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(value, "%d/%m/%Y").ok())
}

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
