//! Deterministic scoring, used when no LLM is configured.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::error::ExtractError;
use crate::pipeline::{Extractor, Item, Priority, Task};

const BASE_SCORE: i32 = 50;
const URGENT_KEYWORDS: &[&str] = &["urgent", "asap", "important", "critical", "deadline", "now"];

/// Scores each item on its own: one task per item.
#[derive(Debug, Clone, Default)]
pub struct RuleScorer {
    today: Option<NaiveDate>,
}

impl RuleScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin "today" instead of reading the clock.
    pub fn with_today(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Score one item. Returns the clamped score and the rules that fired.
    pub fn score(&self, item: &Item) -> (u8, Vec<String>) {
        let today = self.today();
        let mut score = BASE_SCORE;
        let mut reasons = Vec::new();

        if let Some(due) = item.due_date {
            if due < today {
                let overdue = (today - due).num_days();
                score += (overdue * 5).min(30) as i32;
                reasons.push(format!("Overdue {overdue}d"));
            } else {
                let until = (due - today).num_days();
                if until <= 1 {
                    score += 25;
                    reasons.push("Due very soon".to_string());
                } else if until <= 3 {
                    score += 15;
                    reasons.push("Due soon".to_string());
                }
            }
        }

        if let Some(created) = item.created_at {
            let age = (today - created.date_naive()).num_days();
            if age > 14 {
                score += 15;
                reasons.push(format!("Old task ({age}d)"));
            } else if age > 7 {
                score += 10;
                reasons.push(format!("Pending {age}d"));
            }
        }

        score += match item.priority {
            Some(Priority::Urgent) => 20,
            Some(Priority::High) => 10,
            Some(Priority::Low) => -10,
            Some(Priority::Medium) | None => 0,
        };

        let title = item.title.to_lowercase();
        if URGENT_KEYWORDS.iter().any(|kw| title.contains(kw)) {
            score += 15;
            reasons.push("Urgent keywords".to_string());
        }

        (score.clamp(0, 100) as u8, reasons)
    }
}

#[async_trait]
impl Extractor for RuleScorer {
    fn name(&self) -> &str {
        "rules"
    }

    async fn process(&self, items: &[Item]) -> Result<Vec<Task>, ExtractError> {
        Ok(items
            .iter()
            .map(|item| {
                let (score, reasons) = self.score(item);
                let mut task = Task::from_items(&[item], item.title.clone(), score);
                task.description = item.description.clone();
                task.reason = Some(if reasons.is_empty() {
                    "Default scoring".to_string()
                } else {
                    reasons.join("; ")
                });
                task
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
    }

    fn item(title: &str) -> Item {
        Item::new("local:t.json", title, title)
    }

    #[test]
    fn plain_item_gets_base_score() {
        let (score, reasons) = RuleScorer::with_today(today()).score(&item("Water plants"));
        assert_eq!(score, 50);
        assert!(reasons.is_empty());
    }

    #[test]
    fn overdue_bonus_is_capped() {
        let scorer = RuleScorer::with_today(today());
        let mut a = item("a");
        a.due_date = NaiveDate::from_ymd_opt(2025, 6, 13);
        assert_eq!(scorer.score(&a).0, 60);

        let mut b = item("b");
        b.due_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        assert_eq!(scorer.score(&b).0, 80);
    }

    #[test]
    fn due_soon_bands() {
        let scorer = RuleScorer::with_today(today());
        let mut tomorrow = item("a");
        tomorrow.due_date = NaiveDate::from_ymd_opt(2025, 6, 16);
        assert_eq!(scorer.score(&tomorrow).0, 75);

        let mut in_three = item("b");
        in_three.due_date = NaiveDate::from_ymd_opt(2025, 6, 18);
        assert_eq!(scorer.score(&in_three).0, 65);

        let mut later = item("c");
        later.due_date = NaiveDate::from_ymd_opt(2025, 7, 1);
        assert_eq!(scorer.score(&later).0, 50);
    }

    #[test]
    fn age_priority_and_keywords_stack_and_clamp() {
        let scorer = RuleScorer::with_today(today());
        let mut it = item("URGENT: renew passport");
        it.priority = Some(Priority::Urgent);
        it.created_at = Some(Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap());
        it.due_date = NaiveDate::from_ymd_opt(2025, 6, 1);
        let (score, reasons) = scorer.score(&it);
        assert_eq!(score, 100);
        assert_eq!(reasons.len(), 3);

        let mut low = item("someday");
        low.priority = Some(Priority::Low);
        assert_eq!(scorer.score(&low).0, 40);
    }

    #[tokio::test]
    async fn one_task_per_item_with_reason() {
        let scorer = RuleScorer::with_today(today());
        let mut a = item("Pay invoice asap");
        a.description = Some("Invoice #42".into());
        let b = item("Sort photos");

        let tasks = scorer.process(&[a.clone(), b]).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].score, 65);
        assert_eq!(tasks[0].priority, Priority::High);
        assert_eq!(tasks[0].origin_item_keys, vec![a.key()]);
        assert_eq!(tasks[0].description.as_deref(), Some("Invoice #42"));
        assert_eq!(tasks[0].reason.as_deref(), Some("Urgent keywords"));
        assert_eq!(tasks[1].reason.as_deref(), Some("Default scoring"));
    }
}
