//! Per-source circuit breaker.
//!
//! ```text
//!   CLOSED ──(threshold consecutive failures)──► OPEN
//!     ▲                                           │
//!     │                                    (cooldown elapsed)
//!  (trial ok)                                     ▼
//!     └──────────────── HALF_OPEN ◄───────────────┘
//!                          │
//!                    (trial failed) ──► OPEN, cooldown grows
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Wait before the first trial call.
    pub cooldown: Duration,
    /// Growth factor applied to the cooldown each time a trial fails.
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(3600),
        }
    }
}

impl BreakerConfig {
    fn cooldown_after(&self, reopens: u32) -> Duration {
        let factor = self.cooldown_multiplier.max(1.0).powi(reopens.min(64) as i32);
        let secs = (self.cooldown.as_secs_f64() * factor).min(self.max_cooldown.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Persisted health and breaker state of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub source: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Cooldown currently in force; grows on failed trials.
    pub cooldown: Duration,
    pub reopen_count: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_calls: u64,
    pub total_failures: u64,
}

impl SourceRecord {
    pub fn new(source: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            source: source.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown: config.cooldown,
            reopen_count: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            total_calls: 0,
            total_failures: 0,
        }
    }

    /// When an open breaker will admit its trial call.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            BreakerState::Closed => None,
            _ => self
                .opened_at
                .and_then(|t| t.checked_add_signed(to_chrono(self.cooldown))),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Call rejected without touching the source.
#[derive(Debug, Clone)]
pub struct CircuitOpen {
    pub source_name: String,
    pub retry_at: Option<DateTime<Utc>>,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit open for {}", self.source_name)?;
        if let Some(at) = self.retry_at {
            write!(f, ", next trial at {}", at.to_rfc3339())?;
        }
        Ok(())
    }
}

impl std::error::Error for CircuitOpen {}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]. Hand it
/// back through `on_success` or `on_failure` once the call completes.
#[derive(Debug)]
#[must_use]
pub struct CallPermit {
    trial: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug)]
struct Inner {
    record: SourceRecord,
    /// Start of the outstanding trial call, if any.
    trial_started: Option<DateTime<Utc>>,
}

impl Inner {
    /// A trial that has not reported back within one cooldown is treated as
    /// lost (its caller panicked or was dropped) and no longer blocks.
    fn trial_expires_at(&self) -> Option<DateTime<Utc>> {
        self.trial_started
            .and_then(|t| t.checked_add_signed(to_chrono(self.record.cooldown)))
    }
}

/// Circuit breaker guarding one source.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(source: impl Into<String>, config: BreakerConfig) -> Self {
        let record = SourceRecord::new(source, &config);
        Self::from_record(record, config)
    }

    /// Resume from a persisted record. A half-open record gets a fresh trial.
    pub fn from_record(record: SourceRecord, config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                record,
                trial_started: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self) -> Result<CallPermit, CircuitOpen> {
        self.try_acquire_at(Utc::now())
    }

    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Result<CallPermit, CircuitOpen> {
        let mut inner = self.lock();
        match inner.record.state {
            BreakerState::Closed => Ok(CallPermit { trial: false }),
            BreakerState::Open => {
                let due = inner.record.retry_at().is_none_or(|at| now >= at);
                if due {
                    inner.record.state = BreakerState::HalfOpen;
                    inner.trial_started = Some(now);
                    tracing::info!(source = %inner.record.source, "Circuit half-open, allowing trial call");
                    Ok(CallPermit { trial: true })
                } else {
                    Err(CircuitOpen {
                        source_name: inner.record.source.clone(),
                        retry_at: inner.record.retry_at(),
                    })
                }
            }
            BreakerState::HalfOpen => match inner.trial_expires_at() {
                Some(expires) if now < expires => Err(CircuitOpen {
                    source_name: inner.record.source.clone(),
                    retry_at: Some(expires),
                }),
                stale => {
                    if stale.is_some() {
                        tracing::warn!(source = %inner.record.source, "Trial call never reported back, allowing another");
                    }
                    inner.trial_started = Some(now);
                    Ok(CallPermit { trial: true })
                }
            },
        }
    }

    pub fn on_success(&self, permit: CallPermit) {
        self.on_success_at(permit, Utc::now());
    }

    pub fn on_success_at(&self, permit: CallPermit, now: DateTime<Utc>) {
        let mut inner = self.lock();
        let rec = &mut inner.record;
        rec.total_calls += 1;
        rec.consecutive_failures = 0;
        rec.last_success = Some(now);
        if permit.trial || rec.state != BreakerState::Closed {
            tracing::info!(source = %rec.source, "Trial call succeeded, circuit closed");
            rec.state = BreakerState::Closed;
            rec.opened_at = None;
            rec.reopen_count = 0;
            rec.cooldown = self.config.cooldown;
        }
        inner.trial_started = None;
    }

    pub fn on_failure(&self, permit: CallPermit, error: &str) {
        self.on_failure_at(permit, Utc::now(), error);
    }

    pub fn on_failure_at(&self, permit: CallPermit, now: DateTime<Utc>, error: &str) {
        let mut inner = self.lock();
        let rec = &mut inner.record;
        rec.total_calls += 1;
        rec.total_failures += 1;
        rec.consecutive_failures += 1;
        rec.last_failure = Some(now);
        rec.last_error = Some(error.to_string());

        if permit.trial || rec.state == BreakerState::HalfOpen {
            rec.reopen_count += 1;
            rec.cooldown = self.config.cooldown_after(rec.reopen_count);
            rec.state = BreakerState::Open;
            rec.opened_at = Some(now);
            tracing::warn!(
                source = %rec.source,
                reopens = rec.reopen_count,
                cooldown_secs = rec.cooldown.as_secs(),
                "Trial call failed, circuit reopened"
            );
        } else if rec.state == BreakerState::Closed
            && rec.consecutive_failures >= self.config.failure_threshold
        {
            rec.state = BreakerState::Open;
            rec.opened_at = Some(now);
            rec.cooldown = self.config.cooldown;
            tracing::warn!(
                source = %rec.source,
                failures = rec.consecutive_failures,
                cooldown_secs = rec.cooldown.as_secs(),
                "Failure threshold reached, circuit opened"
            );
        }
        inner.trial_started = None;
    }

    /// Snapshot of the current record.
    pub fn record(&self) -> SourceRecord {
        self.lock().record.clone()
    }

    pub fn state(&self) -> BreakerState {
        self.lock().record.state
    }

    /// Operator override: close the breaker and clear the streak.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let mut fresh = SourceRecord::new(inner.record.source.clone(), &self.config);
        fresh.last_success = inner.record.last_success;
        fresh.total_calls = inner.record.total_calls;
        fresh.total_failures = inner.record.total_failures;
        inner.record = fresh;
        inner.trial_started = None;
    }
}

/// All breakers, keyed by source name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub async fn get_or_create(&self, source: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(source) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(source, self.config.clone())))
            .clone()
    }

    /// Install persisted records, replacing any breaker with the same name.
    pub async fn restore(&self, records: Vec<SourceRecord>) {
        let mut breakers = self.breakers.write().await;
        for record in records {
            if record.state != BreakerState::Closed {
                tracing::info!(source = %record.source, state = %record.state, "Restored breaker state");
            }
            breakers.insert(
                record.source.clone(),
                Arc::new(CircuitBreaker::from_record(record, self.config.clone())),
            );
        }
    }

    /// Records of every known source, sorted by name.
    pub async fn records(&self) -> Vec<SourceRecord> {
        let mut records: Vec<SourceRecord> = self
            .breakers
            .read()
            .await
            .values()
            .map(|b| b.record())
            .collect();
        records.sort_by(|a, b| a.source.cmp(&b.source));
        records
    }

    /// Returns false when the source is unknown.
    pub async fn reset(&self, source: &str) -> bool {
        match self.breakers.read().await.get(source) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(source, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }
}
