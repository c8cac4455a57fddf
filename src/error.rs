//! Error types for taskprint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a failed external call should be handled by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blip, rate limit, 5xx. Retry with backoff.
    Transient,
    /// Expired credential or quota. Refresh once, then retry.
    Recoverable,
    /// Misconfiguration. Never retried.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Recoverable => "recoverable",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their own retry classification.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown source kind '{kind}' in spec '{spec}'")]
    UnknownSource { kind: String, spec: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors. Any of these threatens the at-most-once
/// guarantee, so the pipeline never swallows them.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failure reported by a source connector.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{source_name} ({class}): {message}")]
pub struct SourceError {
    pub source_name: String,
    pub class: ErrorClass,
    pub message: String,
}

impl SourceError {
    pub fn new(source_name: impl Into<String>, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            class,
            message: message.into(),
        }
    }

    pub fn transient(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_name, ErrorClass::Transient, message)
    }

    pub fn recoverable(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_name, ErrorClass::Recoverable, message)
    }

    pub fn fatal(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_name, ErrorClass::Fatal, message)
    }
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Extraction/scoring collaborator errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl Classify for ExtractError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::RequestFailed { reason, .. } => classify_message(reason),
            Self::RateLimited { .. } | Self::AuthFailed { .. } => ErrorClass::Recoverable,
            Self::InvalidResponse { .. } => ErrorClass::Fatal,
        }
    }
}

/// Label rendering failed for one task.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Render failed for '{title}': {reason}")]
pub struct RenderError {
    pub title: String,
    pub reason: String,
}

/// Printing failed or could not be confirmed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrinterError {
    #[error("Printer {name} is not available: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Print job on {name} failed: {reason}")]
    JobFailed { name: String, reason: String },

    #[error("Print job on {name} not confirmed after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Cycle-level failures. A cycle that returns one of these did not run to
/// completion; stage-local failures are reported in the summary instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ledger unavailable: {0}")]
    Storage(#[from] DatabaseError),

    #[error("No sources configured")]
    NoSources,
}

/// Classify a foreign error message by its text.
///
/// Used for errors coming out of HTTP clients and subprocesses that carry no
/// structured status. Unknown failures default to `Recoverable`: they get one
/// more attempt but are never hammered.
pub fn classify_message(message: &str) -> ErrorClass {
    patterns::classify(message)
}

mod patterns {
    use std::sync::OnceLock;

    use regex::RegexSet;

    use super::ErrorClass;

    const TRANSIENT: &[&str] = &[
        r"timed? ?out",
        r"connection",
        r"network",
        r"rate.?limit",
        r"too many requests",
        r"\b(429|502|503|504)\b",
        r"temporarily unavailable",
        r"\b(ssl|tls|certificate|handshake)\b",
        r"reset by peer",
        r"broken pipe",
    ];

    fn transient() -> &'static RegexSet {
        static SET: OnceLock<RegexSet> = OnceLock::new();
        SET.get_or_init(|| {
            RegexSet::new(TRANSIENT.iter().map(|p| format!("(?i){p}")))
                .unwrap_or_else(|_| RegexSet::empty())
        })
    }

    pub(super) fn classify(message: &str) -> ErrorClass {
        // Credential and quota failures fall through to Recoverable.
        if transient().is_match(message) {
            ErrorClass::Transient
        } else {
            ErrorClass::Recoverable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_network_failures_as_transient() {
        assert_eq!(classify_message("connection refused"), ErrorClass::Transient);
        assert_eq!(classify_message("Request timed out"), ErrorClass::Transient);
        assert_eq!(classify_message("HTTP 503 Service Unavailable"), ErrorClass::Transient);
        assert_eq!(classify_message("Rate limit exceeded"), ErrorClass::Transient);
    }

    #[test]
    fn classify_auth_failures_as_recoverable() {
        assert_eq!(classify_message("invalid_grant: Token has been expired"), ErrorClass::Recoverable);
        assert_eq!(classify_message("HTTP 401"), ErrorClass::Recoverable);
        assert_eq!(classify_message("insufficient quota"), ErrorClass::Recoverable);
    }

    #[test]
    fn unknown_failures_are_never_fatal() {
        assert_eq!(classify_message("something odd happened"), ErrorClass::Recoverable);
    }

    #[test]
    fn extract_error_classes() {
        let rate = ExtractError::RateLimited {
            provider: "openai".into(),
            retry_after: None,
        };
        assert_eq!(rate.class(), ErrorClass::Recoverable);

        let bad = ExtractError::InvalidResponse {
            provider: "openai".into(),
            reason: "not json".into(),
        };
        assert_eq!(bad.class(), ErrorClass::Fatal);

        let net = ExtractError::RequestFailed {
            provider: "openai".into(),
            reason: "connection reset by peer".into(),
        };
        assert_eq!(net.class(), ErrorClass::Transient);
    }

    #[test]
    fn source_error_display_includes_class() {
        let err = SourceError::fatal("local:tasks.json", "file not found");
        assert_eq!(err.to_string(), "local:tasks.json (fatal): file not found");
        assert_eq!(err.class(), ErrorClass::Fatal);
    }
}
