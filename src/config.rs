//! Configuration types.
//!
//! Everything is read once at startup into an immutable [`AppConfig`] and
//! handed to components by reference. The environment is the only surface.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::LlmBackend;
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::sources::SourceSpec;

/// Default score threshold (inclusive lower bound).
pub const DEFAULT_THRESHOLD: u8 = 70;

/// Default daemon interval: 5 minutes.
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// What the binary should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run a single cycle and exit.
    Once,
    /// Repeat cycles on a fixed interval until told to stop.
    Daemon,
    /// Print ledger statistics and exit.
    Stats,
    /// Print persisted source health and exit.
    Health,
    /// Close the breaker of `TASKPRINT_RESET_SOURCE` and exit.
    Reset,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "once" | "" => Ok(Self::Once),
            "daemon" => Ok(Self::Daemon),
            "stats" => Ok(Self::Stats),
            "health" => Ok(Self::Health),
            "reset" => Ok(Self::Reset),
            other => Err(format!("expected once|daemon|stats|health|reset, got '{other}'")),
        }
    }
}

/// Per-run parameters.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    /// Tasks scoring below this are dropped.
    pub threshold: u8,
    /// Compute and report, but never print or write the ledger.
    pub dry_run: bool,
    /// Bypass ledger checks for this run without deleting entries.
    pub force_reprint: bool,
    /// Daemon tick interval.
    pub interval: Duration,
    /// Stop the daemon after this many cycles.
    pub max_iterations: Option<u64>,
    /// Source whose breaker `RunMode::Reset` closes.
    pub reset_source: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Once,
            threshold: DEFAULT_THRESHOLD,
            dry_run: false,
            force_reprint: false,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            max_iterations: None,
            reset_source: None,
        }
    }
}

/// LLM extraction settings. Without an API key the rule-based scorer is used.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub api_key: Option<SecretString>,
    pub model: String,
}

/// Which printer transport to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrinterKind {
    /// Write labels to the output directory.
    File,
    /// Spool through `lp`, optionally to a named queue.
    Lp { queue: Option<String> },
}

#[derive(Debug, Clone)]
pub struct PrinterSettings {
    pub kind: PrinterKind,
    pub output_dir: PathBuf,
    /// Upper bound on waiting for a job confirmation.
    pub timeout: Duration,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub run: RunConfig,
    pub sources: Vec<SourceSpec>,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub llm: LlmSettings,
    pub printer: PrinterSettings,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let threshold: u8 = env.parse("TASKPRINT_THRESHOLD", DEFAULT_THRESHOLD)?;
        if threshold > 100 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPRINT_THRESHOLD".into(),
                message: format!("{threshold} is outside 0..=100"),
            });
        }

        let interval_secs: u64 = env.parse("TASKPRINT_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPRINT_INTERVAL_SECS".into(),
                message: "interval must be at least 1 second".into(),
            });
        }

        let run = RunConfig {
            mode: env.parse("TASKPRINT_MODE", RunMode::Once)?,
            threshold,
            dry_run: env.flag("TASKPRINT_DRY_RUN")?,
            force_reprint: env.flag("TASKPRINT_FORCE_REPRINT")?,
            interval: Duration::from_secs(interval_secs),
            max_iterations: env.parse_opt("TASKPRINT_MAX_ITERATIONS")?,
            reset_source: env
                .get("TASKPRINT_RESET_SOURCE")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        };
        if run.mode == RunMode::Reset && run.reset_source.is_none() {
            return Err(ConfigError::MissingEnvVar("TASKPRINT_RESET_SOURCE".into()));
        }

        let sources = env
            .get("TASKPRINT_SOURCES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(SourceSpec::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env.parse("TASKPRINT_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: env.millis("TASKPRINT_RETRY_BASE_DELAY_MS", defaults.base_delay)?,
            multiplier: env.parse("TASKPRINT_RETRY_MULTIPLIER", defaults.multiplier)?,
            max_delay: env.millis("TASKPRINT_RETRY_MAX_DELAY_MS", defaults.max_delay)?,
            jitter: env.parse("TASKPRINT_RETRY_JITTER", defaults.jitter)?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKPRINT_RETRY_MAX_ATTEMPTS".into(),
                message: "at least one attempt is required".into(),
            });
        }

        let defaults = BreakerConfig::default();
        let breaker = BreakerConfig {
            failure_threshold: env
                .parse("TASKPRINT_BREAKER_THRESHOLD", defaults.failure_threshold)?,
            cooldown: env.secs("TASKPRINT_BREAKER_COOLDOWN_SECS", defaults.cooldown)?,
            cooldown_multiplier: env
                .parse("TASKPRINT_BREAKER_BACKOFF", defaults.cooldown_multiplier)?,
            max_cooldown: env.secs("TASKPRINT_BREAKER_MAX_COOLDOWN_SECS", defaults.max_cooldown)?,
        };

        let backend: LlmBackend = env.parse("TASKPRINT_LLM_BACKEND", LlmBackend::OpenAi)?;
        let key_var = match backend {
            LlmBackend::OpenAi => "OPENAI_API_KEY",
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        };
        let llm = LlmSettings {
            backend,
            api_key: env
                .get(key_var)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: env
                .get("TASKPRINT_MODEL")
                .unwrap_or_else(|| backend.default_model().to_string()),
        };

        let output_dir = env
            .get("TASKPRINT_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./output"));
        let kind = match env.get("TASKPRINT_PRINTER").as_deref().map(str::trim) {
            None | Some("") | Some("file") => PrinterKind::File,
            Some("lp") => PrinterKind::Lp { queue: None },
            Some(other) => match other.strip_prefix("lp:") {
                Some(queue) if !queue.is_empty() => PrinterKind::Lp {
                    queue: Some(queue.to_string()),
                },
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "TASKPRINT_PRINTER".into(),
                        message: format!("expected file|lp|lp:<queue>, got '{other}'"),
                    });
                }
            },
        };
        let printer = PrinterSettings {
            kind,
            output_dir,
            timeout: env.secs("TASKPRINT_PRINT_TIMEOUT_SECS", Duration::from_secs(60))?,
        };

        Ok(Self {
            run,
            sources,
            retry,
            breaker,
            llm,
            printer,
            db_path: env
                .get("TASKPRINT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/taskprint.db")),
            log_dir: env.get("TASKPRINT_LOG_DIR").map(PathBuf::from),
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.trim().to_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "" | "0" | "false" | "no" | "off" => Ok(false),
                "1" | "true" | "yes" | "on" => Ok(true),
                other => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a boolean, got '{other}'"),
                }),
            },
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::sources::SourceKind;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.run.mode, RunMode::Once);
        assert_eq!(config.run.threshold, 70);
        assert!(!config.run.dry_run);
        assert!(!config.run.force_reprint);
        assert_eq!(config.run.interval, Duration::from_secs(300));
        assert!(config.sources.is_empty());
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.printer.kind, PrinterKind::File);
        assert_eq!(config.db_path, PathBuf::from("./data/taskprint.db"));
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn parses_run_parameters() {
        let config = config_from(&[
            ("TASKPRINT_MODE", "daemon"),
            ("TASKPRINT_THRESHOLD", "80"),
            ("TASKPRINT_DRY_RUN", "yes"),
            ("TASKPRINT_FORCE_REPRINT", "1"),
            ("TASKPRINT_INTERVAL_SECS", "60"),
            ("TASKPRINT_MAX_ITERATIONS", "3"),
        ])
        .unwrap();
        assert_eq!(config.run.mode, RunMode::Daemon);
        assert_eq!(config.run.threshold, 80);
        assert!(config.run.dry_run);
        assert!(config.run.force_reprint);
        assert_eq!(config.run.interval, Duration::from_secs(60));
        assert_eq!(config.run.max_iterations, Some(3));
    }

    #[test]
    fn parses_source_list() {
        let config = config_from(&[(
            "TASKPRINT_SOURCES",
            "local:data/a.json, local:data/b.json,",
        )])
        .unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].kind, SourceKind::LocalFile);
        assert_eq!(config.sources[1].target, "data/b.json");
    }

    #[test]
    fn unknown_source_kind_is_rejected() {
        let err = config_from(&[("TASKPRINT_SOURCES", "fax:1234")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSource { .. }));
    }

    #[test]
    fn reset_mode_needs_a_source() {
        let err = config_from(&[("TASKPRINT_MODE", "reset")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));

        let config = config_from(&[
            ("TASKPRINT_MODE", "reset"),
            ("TASKPRINT_RESET_SOURCE", "local:a.json"),
        ])
        .unwrap();
        assert_eq!(config.run.mode, RunMode::Reset);
        assert_eq!(config.run.reset_source.as_deref(), Some("local:a.json"));
    }

    #[test]
    fn threshold_above_100_is_rejected() {
        let err = config_from(&[("TASKPRINT_THRESHOLD", "101")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn garbage_number_is_rejected() {
        let err = config_from(&[("TASKPRINT_INTERVAL_SECS", "soon")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "TASKPRINT_INTERVAL_SECS"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn api_key_follows_backend() {
        let config = config_from(&[
            ("TASKPRINT_LLM_BACKEND", "anthropic"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
        ])
        .unwrap();
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert_eq!(config.llm.api_key.unwrap().expose_secret(), "sk-ant");
    }

    #[test]
    fn printer_spec_variants() {
        let lp = config_from(&[("TASKPRINT_PRINTER", "lp:Munbyn")]).unwrap();
        assert_eq!(
            lp.printer.kind,
            PrinterKind::Lp {
                queue: Some("Munbyn".into())
            }
        );

        let default_queue = config_from(&[("TASKPRINT_PRINTER", "lp")]).unwrap();
        assert_eq!(default_queue.printer.kind, PrinterKind::Lp { queue: None });

        assert!(config_from(&[("TASKPRINT_PRINTER", "fax")]).is_err());
    }

    #[test]
    fn retry_settings_override_defaults() {
        let config = config_from(&[
            ("TASKPRINT_RETRY_MAX_ATTEMPTS", "5"),
            ("TASKPRINT_RETRY_BASE_DELAY_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));

        assert!(config_from(&[("TASKPRINT_RETRY_MAX_ATTEMPTS", "0")]).is_err());
    }
}
