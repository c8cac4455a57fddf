//! Failure isolation around source calls: retry, circuit breaking, health.

pub mod breaker;
pub mod health;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerState, CallPermit, CircuitBreaker, CircuitOpen,
    SourceRecord,
};
pub use health::{HealthMonitor, SourceHealth, format_report};
pub use retry::{RetryError, RetryPolicy, retry, retry_with_refresh};
