//! Language model capability used by the query pipeline.
//!
//! The pipeline only ever needs `generate(prompt) -> text`. Providers are plain
//! HTTP clients selected by [`build_models`]; none of them is trusted to return
//! well-formed or deterministic output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;

mod anthropic;
mod google;
mod mock;
mod openai;

pub use anthropic::AnthropicModel;
pub use google::GoogleModel;
pub use mock::{DevModel, ScriptedModel};
pub use openai::OpenAiModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptPurpose {
    Generate,
    Audit,
    PermissionCheck,
}

impl PromptPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptPurpose::Generate => "generate",
            PromptPurpose::Audit => "audit",
            PromptPurpose::PermissionCheck => "permission_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub purpose: PromptPurpose,
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(purpose: PromptPurpose, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug)]
pub enum ModelError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(u16),
    InvalidResponse,
    Empty,
    NotConfigured(&'static str),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Timeout => write!(f, "model request timed out"),
            ModelError::Http(err) => write!(f, "model HTTP error: {}", err),
            ModelError::BadStatus(status) => write!(f, "model returned status {}", status),
            ModelError::InvalidResponse => write!(f, "model returned an unparseable response"),
            ModelError::Empty => write!(f, "model returned no text"),
            ModelError::NotConfigured(what) => write!(f, "model is not configured: {}", what),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(value)
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String, ModelError>;
}

/// Calls `model` inside a `model.generate` span and records latency and outcome.
pub async fn generate_traced(
    model: &dyn LanguageModel,
    prompt: &Prompt,
) -> Result<String, ModelError> {
    let span = tracing::info_span!(
        "model.generate",
        model = %model.name(),
        purpose = %prompt.purpose.as_str(),
        prompt_bytes = (prompt.system.len() + prompt.user.len()) as u64,
        response_bytes = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        let result = model.generate(prompt).await.and_then(|text| {
            if text.trim().is_empty() {
                Err(ModelError::Empty)
            } else {
                Ok(text)
            }
        });

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        match &result {
            Ok(text) => {
                tracing::Span::current().record("response_bytes", text.len() as u64);
                tracing::Span::current().record("outcome", "ok");
            }
            Err(err) => {
                tracing::Span::current().record("outcome", "error");
                tracing::warn!(error = %err, "model call failed");
            }
        }
        result
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    OpenAi,
    Anthropic,
    Google,
    Mock,
}

impl ModelProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ModelProvider::OpenAi),
            "anthropic" => Some(ModelProvider::Anthropic),
            "google" => Some(ModelProvider::Google),
            "mock" => Some(ModelProvider::Mock),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "openai",
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::Google => "google",
            ModelProvider::Mock => "mock",
        }
    }

    /// `(chat, fast)` model names used when none are configured.
    pub fn default_models(self) -> (&'static str, &'static str) {
        match self {
            ModelProvider::OpenAi => ("gpt-4o", "gpt-4o-mini"),
            ModelProvider::Anthropic => ("claude-3-5-sonnet-latest", "claude-3-5-haiku-latest"),
            ModelProvider::Google => ("gemini-1.5-pro", "gemini-1.5-flash"),
            ModelProvider::Mock => ("mock-chat", "mock-fast"),
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "https://api.openai.com/v1",
            ModelProvider::Anthropic => "https://api.anthropic.com/v1",
            ModelProvider::Google => "https://generativelanguage.googleapis.com/v1beta",
            ModelProvider::Mock => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub provider: ModelProvider,
    pub api_key: Option<String>,
    pub chat_model: Option<String>,
    pub fast_model: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Settings shared by the HTTP providers for a single model name.
#[derive(Debug, Clone)]
pub(crate) struct ClientSettings {
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) temperature: f32,
    pub(crate) max_tokens: u32,
}

/// The two model tiers the pipeline uses: `chat` for generation and auditing,
/// `fast` for the cheap permission pre-check.
#[derive(Clone)]
pub struct ModelSet {
    pub chat: Arc<dyn LanguageModel>,
    pub fast: Arc<dyn LanguageModel>,
}

impl ModelSet {
    pub fn uniform(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            chat: model.clone(),
            fast: model,
        }
    }
}

pub fn build_models(settings: &ModelSettings) -> Result<ModelSet, ModelError> {
    let provider = settings.provider;
    if provider == ModelProvider::Mock {
        return Ok(ModelSet::uniform(Arc::new(DevModel)));
    }

    let api_key = settings
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(ModelError::NotConfigured("missing API key"))?
        .to_string();

    let http = reqwest::Client::builder()
        .timeout(settings.timeout)
        .build()
        .map_err(ModelError::Http)?;

    let base_url = settings
        .base_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| provider.default_base_url().to_string());
    let (default_chat, default_fast) = provider.default_models();

    let client_settings = |model: &Option<String>, fallback: &str| ClientSettings {
        base_url: base_url.trim_end_matches('/').to_string(),
        api_key: api_key.clone(),
        model: model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string()),
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
    };
    let chat = client_settings(&settings.chat_model, default_chat);
    let fast = client_settings(&settings.fast_model, default_fast);

    let set = match provider {
        ModelProvider::OpenAi => ModelSet {
            chat: Arc::new(OpenAiModel::new(http.clone(), chat)),
            fast: Arc::new(OpenAiModel::new(http, fast)),
        },
        ModelProvider::Anthropic => ModelSet {
            chat: Arc::new(AnthropicModel::new(http.clone(), chat)),
            fast: Arc::new(AnthropicModel::new(http, fast)),
        },
        ModelProvider::Google => ModelSet {
            chat: Arc::new(GoogleModel::new(http.clone(), chat)),
            fast: Arc::new(GoogleModel::new(http, fast)),
        },
        ModelProvider::Mock => ModelSet::uniform(Arc::new(DevModel)),
    };

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider: ModelProvider, api_key: Option<&str>) -> ModelSettings {
        ModelSettings {
            provider,
            api_key: api_key.map(|k| k.to_string()),
            chat_model: None,
            fast_model: Some("custom-fast".to_string()),
            base_url: None,
            timeout: Duration::from_secs(5),
            temperature: 0.0,
            max_tokens: 256,
        }
    }

    #[test]
    fn hosted_providers_require_an_api_key() {
        for provider in [
            ModelProvider::OpenAi,
            ModelProvider::Anthropic,
            ModelProvider::Google,
        ] {
            let err = build_models(&settings(provider, None)).err();
            assert!(matches!(err, Some(ModelError::NotConfigured(_))));
            let err = build_models(&settings(provider, Some("  "))).err();
            assert!(matches!(err, Some(ModelError::NotConfigured(_))));
        }
    }

    #[test]
    fn factory_applies_default_and_override_model_names() {
        let set = build_models(&settings(ModelProvider::Anthropic, Some("k"))).unwrap();
        assert_eq!(set.chat.name(), "claude-3-5-sonnet-latest");
        assert_eq!(set.fast.name(), "custom-fast");
    }

    #[test]
    fn mock_provider_needs_no_key() {
        let set = build_models(&settings(ModelProvider::Mock, None)).unwrap();
        assert_eq!(set.chat.name(), "dev-mock");
    }

    #[test]
    fn provider_names_parse_case_insensitively() {
        assert_eq!(ModelProvider::parse("OpenAI"), Some(ModelProvider::OpenAi));
        assert_eq!(ModelProvider::parse(" google "), Some(ModelProvider::Google));
        assert_eq!(ModelProvider::parse("azure"), None);
    }

    #[tokio::test]
    async fn traced_generate_treats_blank_text_as_empty() {
        let model = ScriptedModel::new().reply(PromptPurpose::Generate, "   ");
        let prompt = Prompt::new(PromptPurpose::Generate, "sys", "user");
        let err = generate_traced(&model, &prompt).await.unwrap_err();
        assert!(matches!(err, ModelError::Empty));
    }
}
