//! Fixed-width text labels.

use crate::error::RenderError;
use crate::pipeline::{LabelImage, Renderer, Task};

/// Characters per line on a 6 cm label at the printer's smallest font.
pub const DEFAULT_WIDTH: usize = 32;
const MAX_DESCRIPTION_LINES: usize = 4;

/// Renders a task as a small monochrome text block:
/// priority symbol and title, wrapped description, reason, then source.
#[derive(Debug, Clone)]
pub struct TextLabelRenderer {
    width: usize,
}

impl Default for TextLabelRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH)
    }
}

impl TextLabelRenderer {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(12),
        }
    }

    pub fn render_text(&self, task: &Task) -> Result<String, RenderError> {
        let title = task.title.trim();
        if title.is_empty() {
            return Err(RenderError {
                title: task.title.clone(),
                reason: "empty title".into(),
            });
        }

        let rule = "-".repeat(self.width);
        let mut lines = Vec::new();

        let head = format!("{} {}", task.priority.symbol(), title.to_uppercase());
        lines.extend(wrap(&head, self.width).into_iter().take(2));
        lines.push(rule.clone());

        if let Some(desc) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let mut wrapped = wrap(desc, self.width);
            if wrapped.len() > MAX_DESCRIPTION_LINES {
                wrapped.truncate(MAX_DESCRIPTION_LINES);
                if let Some(last) = wrapped.last_mut() {
                    ellipsize(last, self.width);
                }
            }
            lines.extend(wrapped);
            lines.push(rule);
        }

        if let Some(reason) = task.reason.as_deref().filter(|r| !r.trim().is_empty()) {
            lines.extend(wrap(&format!("Why: {reason}"), self.width).into_iter().take(2));
        }

        let mut meta = format!("Score: {}", task.score);
        if let Some(due) = task.due_date {
            meta = format!("Due: {due}  {meta}");
        }
        lines.push(meta);
        if let Some(category) = &task.category {
            lines.push(truncate(&format!("[{category}] {}", task.source_name), self.width));
        } else {
            lines.push(truncate(&task.source_name, self.width));
        }

        Ok(lines.join("\n") + "\n")
    }
}

impl Renderer for TextLabelRenderer {
    fn render(&self, task: &Task) -> Result<LabelImage, RenderError> {
        let text = self.render_text(task)?;
        Ok(LabelImage {
            bytes: text.into_bytes(),
            file_name: format!("label_{}.txt", task.print_key()),
            title: task.title.clone(),
        })
    }
}

/// Greedy word wrap on character count. Words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if len > 0 {
                lines.push(std::mem::take(&mut current));
                len = 0;
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }
        if word.is_empty() {
            continue;
        }
        let needed = if len == 0 { word.len() } else { len + 1 + word.len() };
        if needed > width {
            lines.push(std::mem::take(&mut current));
            len = 0;
        }
        if len > 0 {
            current.push(' ');
            len += 1;
        }
        current.extend(word.iter());
        len += word.len();
    }
    if len > 0 {
        lines.push(current);
    }
    lines
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn ellipsize(line: &mut String, width: usize) {
    let count = line.chars().count();
    if count >= width {
        *line = line.chars().take(width - 1).collect();
    }
    line.push('…');
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::pipeline::{Item, Priority};

    fn task() -> Task {
        let item = Item::new("local:tasks.json", "7", "Call the bank");
        let mut task = Task::from_items(&[&item], "Call the bank", 85);
        task.description = Some("Ask about the mortgage rate and the missing statement from March".into());
        task.reason = Some("Due tomorrow".into());
        task.due_date = NaiveDate::from_ymd_opt(2025, 6, 16);
        task
    }

    #[test]
    fn label_layout() {
        let text = TextLabelRenderer::default().render_text(&task()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "⚠ CALL THE BANK");
        assert!(lines.iter().all(|l| l.chars().count() <= DEFAULT_WIDTH));
        assert!(text.contains("Why: Due tomorrow"));
        assert!(text.contains("Due: 2025-06-16  Score: 85"));
        assert!(text.ends_with("local:tasks.json\n"));
    }

    #[test]
    fn symbol_follows_priority() {
        let mut t = task();
        t.priority = Priority::Low;
        let text = TextLabelRenderer::default().render_text(&t).unwrap();
        assert!(text.starts_with("○ "));
    }

    #[test]
    fn long_description_is_cut() {
        let mut t = task();
        t.description = Some("word ".repeat(200));
        let text = TextLabelRenderer::new(20).render_text(&t).unwrap();
        assert!(text.contains('…'));
        assert!(text.lines().count() < 12);
    }

    #[test]
    fn empty_title_fails() {
        let mut t = task();
        t.title = "   ".into();
        assert!(TextLabelRenderer::default().render(&t).is_err());
    }

    #[test]
    fn file_name_is_stable_per_task() {
        let r = TextLabelRenderer::default();
        let a = r.render(&task()).unwrap();
        let b = r.render(&task()).unwrap();
        assert_eq!(a.file_name, b.file_name);
        assert!(a.file_name.starts_with("label_"));
        assert_eq!(a.title, "Call the bank");
    }

    #[test]
    fn wrap_splits_long_words() {
        let lines = wrap("a verylongwordindeed b", 8);
        assert_eq!(lines, vec!["a", "verylong", "wordinde", "ed b"]);
    }
}
