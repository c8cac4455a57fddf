//! Read-only view over breaker state for reporting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resilience::breaker::{BreakerRegistry, BreakerState, SourceRecord};

/// Health of one source at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: String,
    pub state: BreakerState,
    pub failure_streak: u32,
    pub since_last_success: Option<Duration>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub next_trial_at: Option<DateTime<Utc>>,
}

impl SourceHealth {
    pub fn from_record(record: &SourceRecord, now: DateTime<Utc>) -> Self {
        Self {
            source: record.source.clone(),
            state: record.state,
            failure_streak: record.consecutive_failures,
            since_last_success: record
                .last_success
                .and_then(|t| (now - t).to_std().ok()),
            last_success: record.last_success,
            total_calls: record.total_calls,
            total_failures: record.total_failures,
            last_error: record.last_error.clone(),
            next_trial_at: record.retry_at(),
        }
    }

    /// Healthy means closed with no failures since the last success.
    pub fn is_healthy(&self) -> bool {
        self.state == BreakerState::Closed && self.failure_streak == 0
    }

    /// Share of calls that failed, `0.0` when nothing was called yet.
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64
        }
    }
}

impl fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self.state {
            BreakerState::Closed if self.failure_streak == 0 => "✓",
            BreakerState::Closed => "!",
            BreakerState::HalfOpen => "~",
            BreakerState::Open => "✗",
        };
        write!(
            f,
            "{symbol} {:<32} {:<9} streak={:<3} calls={} failed={:.0}%",
            self.source,
            self.state.as_str(),
            self.failure_streak,
            self.total_calls,
            self.failure_rate() * 100.0
        )?;
        match self.since_last_success {
            Some(d) => write!(f, " last_ok={}s ago", d.as_secs())?,
            None => write!(f, " last_ok=never")?,
        }
        if let Some(at) = self.next_trial_at {
            write!(f, " next_trial={}", at.format("%H:%M:%S"))?;
        }
        if !self.is_healthy() {
            if let Some(err) = &self.last_error {
                write!(f, "\n    last error: {err}")?;
            }
        }
        Ok(())
    }
}

/// Aggregates breaker records. Never mutates them.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<BreakerRegistry>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn snapshot(&self) -> Vec<SourceHealth> {
        self.snapshot_at(Utc::now()).await
    }

    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<SourceHealth> {
        self.registry
            .records()
            .await
            .iter()
            .map(|r| SourceHealth::from_record(r, now))
            .collect()
    }

    pub async fn unhealthy(&self) -> Vec<SourceHealth> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|h| !h.is_healthy())
            .collect()
    }
}

/// Render a health table, one source per line.
pub fn format_report(health: &[SourceHealth]) -> String {
    if health.is_empty() {
        return "No source health recorded yet.".to_string();
    }
    health
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
