//! LLM access for task extraction.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Everything above this module talks to a [`Completer`], so extraction can be
//! tested without a network.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::{Agent, AgentBuilder};
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::ExposeSecret;

use crate::config::LlmSettings;
use crate::error::ExtractError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenAi => "gpt-4o-mini",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "open_ai" | "gpt" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}' (expected openai|anthropic)")),
        }
    }
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot text completion.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Provider name for logs and errors.
    fn provider(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, ExtractError>;
}

const SYSTEM_PROMPT: &str = "You turn to-do items into printable task labels. \
Respond only with valid JSON.";
const TEMPERATURE: f64 = 0.3;
const MAX_TOKENS: u64 = 1200;

/// [`Completer`] over a rig agent.
pub struct RigCompleter<M: CompletionModel> {
    agent: Agent<M>,
    provider: &'static str,
    model_name: String,
}

impl<M: CompletionModel> RigCompleter<M> {
    /// Must be called from within a tokio runtime; the agent spawns its tool
    /// server on construction.
    pub fn new(model: M, provider: &'static str, model_name: &str) -> Self {
        let agent = AgentBuilder::new(model)
            .preamble(SYSTEM_PROMPT)
            .temperature(TEMPERATURE)
            .max_tokens(MAX_TOKENS)
            .build();
        Self {
            agent,
            provider,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> Completer for RigCompleter<M>
where
    M: CompletionModel + 'static,
{
    fn provider(&self) -> &str {
        self.provider
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, prompt: &str) -> Result<String, ExtractError> {
        self.agent
            .prompt(prompt)
            .await
            .map_err(|e| map_provider_error(self.provider, &e.to_string()))
    }
}

/// Map a provider failure message to an [`ExtractError`].
///
/// Credential and quota problems are recoverable, anything else is left to
/// message classification.
pub fn map_provider_error(provider: &str, message: &str) -> ExtractError {
    let lower = message.to_lowercase();
    if ["401", "403", "unauthorized", "invalid api key", "invalid x-api-key", "authentication"]
        .iter()
        .any(|p| lower.contains(p))
    {
        ExtractError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if ["429", "rate limit", "rate_limit", "quota", "overloaded"]
        .iter()
        .any(|p| lower.contains(p))
    {
        ExtractError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else {
        ExtractError::RequestFailed {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    }
}

/// Create a completer from configuration. Requires an API key.
pub fn create_completer(config: &LlmSettings) -> Result<Arc<dyn Completer>, ExtractError> {
    let provider = config.backend.as_str().to_string();
    let api_key = config
        .api_key
        .as_ref()
        .ok_or(ExtractError::AuthFailed { provider })?;
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_completer(api_key.expose_secret(), &config.model),
        LlmBackend::OpenAi => create_openai_completer(api_key.expose_secret(), &config.model),
    }
}

fn create_anthropic_completer(api_key: &str, model: &str) -> Result<Arc<dyn Completer>, ExtractError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key).map_err(|e| ExtractError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: format!("Failed to create Anthropic client: {}", e),
        })?;

    let completion_model = client.completion_model(model);
    tracing::info!("Using Anthropic (model: {})", model);
    Ok(Arc::new(RigCompleter::new(completion_model, "anthropic", model)))
}

fn create_openai_completer(api_key: &str, model: &str) -> Result<Arc<dyn Completer>, ExtractError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(api_key).map_err(|e| ExtractError::RequestFailed {
            provider: "openai".to_string(),
            reason: format!("Failed to create OpenAI client: {}", e),
        })?;

    let completion_model = client.completion_model(model);
    tracing::info!("Using OpenAI (model: {})", model);
    Ok(Arc::new(RigCompleter::new(completion_model, "openai", model)))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::error::{Classify, ErrorClass};

    fn settings(backend: LlmBackend, key: Option<&str>, model: &str) -> LlmSettings {
        LlmSettings {
            backend,
            api_key: key.map(SecretString::from),
            model: model.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_anthropic_completer() {
        // rig-core clients accept any string as API key at construction time.
        let completer = create_completer(&settings(
            LlmBackend::Anthropic,
            Some("test-key"),
            "claude-3-5-haiku-latest",
        ))
        .unwrap();
        assert_eq!(completer.provider(), "anthropic");
        assert_eq!(completer.model_name(), "claude-3-5-haiku-latest");
    }

    #[tokio::test]
    async fn test_create_openai_completer() {
        let completer =
            create_completer(&settings(LlmBackend::OpenAi, Some("sk-test"), "gpt-4o")).unwrap();
        assert_eq!(completer.provider(), "openai");
        assert_eq!(completer.model_name(), "gpt-4o");
    }

    #[test]
    fn missing_key_is_an_auth_failure() {
        let err = create_completer(&settings(LlmBackend::OpenAi, None, "gpt-4o"))
            .err()
            .unwrap();
        assert!(matches!(err, ExtractError::AuthFailed { .. }));
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("OpenAI".parse::<LlmBackend>().unwrap(), LlmBackend::OpenAi);
        assert_eq!("claude".parse::<LlmBackend>().unwrap(), LlmBackend::Anthropic);
        assert!("mistral".parse::<LlmBackend>().is_err());
    }

    #[test]
    fn provider_errors_are_classified() {
        let auth = map_provider_error("openai", "HTTP 401 Unauthorized: invalid api key");
        assert!(matches!(auth, ExtractError::AuthFailed { .. }));
        assert_eq!(auth.class(), ErrorClass::Recoverable);

        let quota = map_provider_error("openai", "429: You exceeded your current quota");
        assert!(matches!(quota, ExtractError::RateLimited { .. }));
        assert_eq!(quota.class(), ErrorClass::Recoverable);

        let net = map_provider_error("anthropic", "error sending request: connection reset");
        assert_eq!(net.class(), ErrorClass::Transient);
    }
}
