//! The model-client seam.
//!
//! Everything that talks to a language model goes through [`ModelClient`].
//! Production runs use [`LlmProviderClient`], a thin adapter over an
//! `edgequake-llm` provider; tests use [`crate::testing::ScriptedClient`].
//!
//! A client performs exactly one outbound call per [`ModelClient::complete`]
//! and classifies its failure as a [`DispatchError`]. Retrying is the
//! caller's job.

use crate::config::PipelineConfig;
use crate::document::ImageBlob;
use crate::error::{DispatchError, PipelineError};
use crate::output::TokenUsage;
use async_trait::async_trait;
use edgequake_llm::{
    ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError, ProviderFactory,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// One model request: a system prompt and a user turn, with optional images.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
    pub images: Vec<ImageBlob>,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// The text of a model reply plus token accounting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelReply {
    pub content: String,
    pub usage: TokenUsage,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// A language-model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short name for logs ("openai/gpt-4.1-mini", "scripted", ...).
    fn name(&self) -> &str;

    /// Make exactly one call.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, DispatchError>;
}

/// [`ModelClient`] backed by an `edgequake-llm` provider.
pub struct LlmProviderClient {
    provider: Arc<dyn LLMProvider>,
    name: String,
}

impl LlmProviderClient {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    fn messages(request: &ModelRequest) -> Vec<ChatMessage> {
        let user = if request.images.is_empty() {
            ChatMessage::user(request.prompt.as_str())
        } else {
            let images = request
                .images
                .iter()
                .map(|img| ImageData::new(img.data.clone(), img.mime_type.as_str()).with_detail("high"))
                .collect();
            ChatMessage::user_with_images(request.prompt.as_str(), images)
        };
        vec![ChatMessage::system(request.system.as_str()), user]
    }
}

#[async_trait]
impl ModelClient for LlmProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, DispatchError> {
        let messages = Self::messages(request);
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_llm_error(&e))?;
        debug!(
            client = %self.name,
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "model call complete"
        );
        Ok(ModelReply {
            content: response.content,
            usage: TokenUsage {
                input_tokens: response.prompt_tokens as u64,
                output_tokens: response.completion_tokens as u64,
            },
        })
    }
}

/// Map a typed provider error onto a [`DispatchError`].
///
/// Errors the provider already knows to be permanent (bad request, missing
/// model, unsupported feature, context overflow, configuration) are never
/// retried. Only the free-form variants fall back to message classification.
pub fn classify_llm_error(err: &LlmError) -> DispatchError {
    match err {
        LlmError::AuthError(msg) => DispatchError::Auth(msg.clone()),
        LlmError::RateLimited(msg) => DispatchError::RateLimited {
            retry_after_secs: retry_after_hint(&msg.to_ascii_lowercase()),
        },
        LlmError::Timeout => DispatchError::Timeout { secs: 0 },
        LlmError::InvalidRequest(_)
        | LlmError::ModelNotFound(_)
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_)
        | LlmError::TokenLimitExceeded { .. } => DispatchError::Permanent(err.to_string()),
        LlmError::NetworkError(msg) => DispatchError::Transport(msg.clone()),
        LlmError::ApiError(_)
        | LlmError::ProviderError(_)
        | LlmError::SerializationError(_)
        | LlmError::Unknown(_) => classify_provider_error(&err.to_string()),
    }
}

static RE_STATUS_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d{2})\b").unwrap());

/// Map a free-form provider error message onto a [`DispatchError`].
///
/// The HTTP status, when present, is recovered from the text as a standalone
/// three-digit number. 408 and 5xx are retryable, every other 4xx is
/// permanent. Messages with no recognisable status or keyword are treated as
/// transport errors and therefore retried.
pub fn classify_provider_error(message: &str) -> DispatchError {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let status = RE_STATUS_CODE
        .captures_iter(&lower)
        .filter_map(|caps| caps[1].parse::<u16>().ok())
        .next();

    if status == Some(429) || has(&["rate limit", "rate_limit", "too many requests", "quota"]) {
        return DispatchError::RateLimited {
            retry_after_secs: retry_after_hint(&lower),
        };
    }
    if matches!(status, Some(401 | 403))
        || has(&["unauthorized", "forbidden", "invalid api key", "invalid_api_key", "authentication"])
    {
        return DispatchError::Auth(message.to_string());
    }
    if has(&["timed out", "timeout", "deadline"]) {
        return DispatchError::Timeout { secs: 0 };
    }
    match status {
        Some(code) if code == 408 || code >= 500 => {
            return DispatchError::Status {
                code,
                message: message.to_string(),
            }
        }
        Some(_) => return DispatchError::Permanent(message.to_string()),
        None => {}
    }
    if has(&["context length", "context_length", "invalid request", "content_filter", "model not found"]) {
        return DispatchError::Permanent(message.to_string());
    }
    if has(&["overloaded", "unavailable", "bad gateway", "internal server error"]) {
        return DispatchError::Status {
            code: 503,
            message: message.to_string(),
        };
    }
    DispatchError::Transport(message.to_string())
}

fn retry_after_hint(lower: &str) -> Option<u64> {
    let rest = &lower[lower.find("retry after")? + "retry after".len()..];
    let digits: String = rest
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn create_client(provider_name: &str, model: &str) -> Result<Arc<dyn ModelClient>, PipelineError> {
    let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok(Arc::new(LlmProviderClient::new(provider, format!("{provider_name}/{model}"))))
}

/// Resolve the model client, from most-specific to least-specific.
///
/// 1. **Pre-built client** (`config.client`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model` or
///    [`DEFAULT_MODEL`].
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **OpenAI key** present: OpenAI with the configured or default model.
/// 5. **Auto-detection** via `ProviderFactory::from_env`.
pub fn resolve_client(config: &PipelineConfig) -> Result<Arc<dyn ModelClient>, PipelineError> {
    if let Some(client) = &config.client {
        return Ok(Arc::clone(client));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(name) = &config.provider_name {
        return create_client(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_client(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_client("openai", model);
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {e}"
            ),
        })?;
    Ok(Arc::new(LlmProviderClient::new(provider, "auto")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;

    #[test]
    fn classifies_common_provider_failures() {
        assert_eq!(
            classify_provider_error("HTTP 429 Too Many Requests, retry after 12 seconds"),
            DispatchError::RateLimited { retry_after_secs: Some(12) }
        );
        assert!(matches!(classify_provider_error("401 Unauthorized"), DispatchError::Auth(_)));
        assert!(matches!(
            classify_provider_error("request timed out"),
            DispatchError::Timeout { .. }
        ));
        assert!(matches!(
            classify_provider_error("API error 503: service unavailable"),
            DispatchError::Status { code: 503, .. }
        ));
        assert!(matches!(
            classify_provider_error("400 Bad Request: context length exceeded"),
            DispatchError::Permanent(_)
        ));
        assert!(matches!(
            classify_provider_error("connection reset by peer"),
            DispatchError::Transport(_)
        ));
    }

    #[test]
    fn rate_limit_without_hint() {
        assert_eq!(
            classify_provider_error("rate limit exceeded"),
            DispatchError::RateLimited { retry_after_secs: None }
        );
    }

    #[test]
    fn typed_permanent_errors_are_not_retried() {
        let permanent = [
            LlmError::InvalidRequest("max_tokens is too large: 16500".into()),
            LlmError::TokenLimitExceeded { max: 128_000, got: 150_000 },
            LlmError::ConfigError("missing base url".into()),
            LlmError::NotSupported("vision".into()),
            LlmError::ModelNotFound("gpt-9".into()),
        ];
        for err in permanent {
            let classified = classify_llm_error(&err);
            assert!(
                matches!(classified, DispatchError::Permanent(_)),
                "{err} classified as {classified:?}"
            );
            assert!(!classified.is_retryable());
        }
    }

    #[test]
    fn typed_transient_errors_are_retried() {
        assert!(matches!(
            classify_llm_error(&LlmError::AuthError("bad key".into())),
            DispatchError::Auth(_)
        ));
        assert_eq!(
            classify_llm_error(&LlmError::RateLimited("retry after 7s".into())),
            DispatchError::RateLimited { retry_after_secs: Some(7) }
        );
        assert_eq!(
            classify_llm_error(&LlmError::Timeout),
            DispatchError::Timeout { secs: 0 }
        );
        assert_eq!(
            classify_llm_error(&LlmError::NetworkError("connection reset".into())),
            DispatchError::Transport("connection reset".into())
        );
        assert!(matches!(
            classify_llm_error(&LlmError::ApiError("502 bad gateway".into())),
            DispatchError::Status { code: 502, .. }
        ));
        assert!(matches!(
            classify_llm_error(&LlmError::ApiError("404 no such deployment".into())),
            DispatchError::Permanent(_)
        ));
        assert!(classify_llm_error(&LlmError::Unknown("stream closed".into())).is_retryable());
    }

    #[test]
    fn status_codes_match_whole_numbers_only() {
        assert!(matches!(
            classify_provider_error("max_tokens is too large: 16500"),
            DispatchError::Transport(_)
        ));
        assert!(matches!(
            classify_provider_error("HTTP 422: schema rejected"),
            DispatchError::Permanent(_)
        ));
        assert!(matches!(
            classify_provider_error("upstream returned 408"),
            DispatchError::Status { code: 408, .. }
        ));
    }

    #[test]
    fn prebuilt_client_wins() {
        let client: Arc<dyn ModelClient> = Arc::new(ScriptedClient::new());
        let config = PipelineConfig::builder()
            .client(Arc::clone(&client))
            .provider_name("nonexistent")
            .build()
            .unwrap();
        let resolved = resolve_client(&config).unwrap();
        assert_eq!(resolved.name(), "scripted");
    }

    #[test]
    fn multimodal_messages_carry_images() {
        let req = ModelRequest {
            system: "sys".into(),
            prompt: "extract".into(),
            images: vec![ImageBlob {
                id: "a.png".into(),
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            }],
            temperature: 0.2,
            max_tokens: 100,
        };
        let messages = LlmProviderClient::messages(&req);
        assert_eq!(messages.len(), 2);
    }
}
