//! Source connectors and the registry that builds them from config.

pub mod local_file;

pub use local_file::LocalFileSource;

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::pipeline::Source;

/// Connector kinds that can appear in `TASKPRINT_SOURCES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    LocalFile,
}

type Constructor = fn(&str) -> Arc<dyn Source>;

/// Prefix → kind → constructor.
const REGISTRY: &[(&str, SourceKind, Constructor)] = &[("local", SourceKind::LocalFile, local_file)];

fn local_file(target: &str) -> Arc<dyn Source> {
    Arc::new(LocalFileSource::new(PathBuf::from(target)))
}

impl SourceKind {
    pub fn prefix(&self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(_, kind, _)| kind == self)
            .map(|(prefix, _, _)| *prefix)
            .unwrap_or("unknown")
    }

    fn constructor(&self) -> Option<Constructor> {
        REGISTRY
            .iter()
            .find(|(_, kind, _)| kind == self)
            .map(|(_, _, ctor)| *ctor)
    }
}

/// One configured source, e.g. `local:data/tasks.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub target: String,
}

impl SourceSpec {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        let (prefix, target) = spec.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
            key: "TASKPRINT_SOURCES".into(),
            message: format!("expected <kind>:<target>, got '{spec}'"),
        })?;

        let kind = REGISTRY
            .iter()
            .find(|(p, _, _)| p.eq_ignore_ascii_case(prefix.trim()))
            .map(|(_, kind, _)| *kind)
            .ok_or_else(|| ConfigError::UnknownSource {
                kind: prefix.to_string(),
                spec: spec.to_string(),
            })?;

        let target = target.trim();
        if target.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TASKPRINT_SOURCES".into(),
                message: format!("empty target in '{spec}'"),
            });
        }

        Ok(Self {
            kind,
            target: target.to_string(),
        })
    }

    pub fn build(&self) -> Option<Arc<dyn Source>> {
        self.kind.constructor().map(|ctor| ctor(&self.target))
    }
}

impl std::fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.target)
    }
}

/// Instantiate every configured source.
pub fn build_sources(specs: &[SourceSpec]) -> Vec<Arc<dyn Source>> {
    specs
        .iter()
        .filter_map(|spec| {
            let source = spec.build();
            if source.is_none() {
                tracing::warn!(spec = %spec, "No connector registered for source kind");
            }
            source
        })
        .collect()
}
