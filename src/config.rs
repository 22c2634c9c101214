//! Configuration types for the extraction pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The config is immutable once built and is
//! passed explicitly to [`crate::Pipeline::new`]; nothing in the library
//! reads ambient global state after construction.

use crate::client::ModelClient;
use crate::error::PipelineError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::sanitize::{RepairPolicy, RepairStrategy};
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an extraction run.
///
/// # Example
/// ```rust
/// use litextract::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_images(3)
///     .max_attempts(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_images, 3);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// LLM model identifier, e.g. "gpt-4.1-mini", "claude-sonnet-4-20250514".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `client`, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed model client. Takes precedence over `provider_name`.
    pub client: Option<Arc<dyn ModelClient>>,

    /// Sampling temperature for extraction calls. Default: 0.2.
    pub temperature: f32,

    /// Sampling temperature for contract synthesis and summary graphs. Default: 0.3.
    pub synthesis_temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Backoff schedule for extraction and summary calls. Default: 3 attempts,
    /// 500 ms base, ×2 per attempt, capped at 30 s.
    pub retry: RetryPolicy,

    /// Attempts allowed for contract synthesis, counting malformed replies. Default: 3.
    pub contract_attempts: u32,

    /// Per-call timeout in seconds, independent of the retry ceiling. Default: 60.
    pub api_timeout_secs: u64,

    /// Images kept per document, first N in document order. Default: 5.
    ///
    /// Multimodal requests have a practical payload ceiling; beyond it quality
    /// drops rather than the call failing, so extra images are dropped.
    pub max_images: usize,

    /// Truncate document text to this many characters. Default: None (unbounded).
    pub max_text_chars: Option<usize>,

    /// Documents processed at once in a batch. Default: 1 (sequential).
    ///
    /// Raising this parallelises independent documents; keep it within the
    /// provider's rate limit.
    pub concurrency: usize,

    /// Repairs tried, in order, when a reply does not parse strictly.
    pub repair_order: Vec<RepairStrategy>,

    /// Diagram language for summary graphs. Default: Mermaid flowchart.
    pub diagram: DiagramSyntax,

    /// Longest node label kept in a rendered diagram. Default: 60.
    pub max_label_chars: usize,

    /// Deepest summary-graph level kept. Default: 6.
    pub max_graph_depth: usize,

    /// Custom extraction system prompt. If None, uses built-in default.
    pub system_prompt: Option<String>,

    /// Optional per-document progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            client: None,
            temperature: 0.2,
            synthesis_temperature: 0.3,
            max_tokens: 4096,
            retry: RetryPolicy::default(),
            contract_attempts: 3,
            api_timeout_secs: 60,
            max_images: 5,
            max_text_chars: None,
            concurrency: 1,
            repair_order: RepairStrategy::default_order(),
            diagram: DiagramSyntax::default(),
            max_label_chars: 60,
            max_graph_depth: 6,
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("client", &self.client.as_ref().map(|c| c.name().to_string()))
            .field("temperature", &self.temperature)
            .field("synthesis_temperature", &self.synthesis_temperature)
            .field("max_tokens", &self.max_tokens)
            .field("retry", &self.retry)
            .field("contract_attempts", &self.contract_attempts)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_images", &self.max_images)
            .field("max_text_chars", &self.max_text_chars)
            .field("concurrency", &self.concurrency)
            .field("repair_order", &self.repair_order)
            .field("diagram", &self.diagram)
            .field("max_label_chars", &self.max_label_chars)
            .field("max_graph_depth", &self.max_graph_depth)
            .field(
                "system_prompt",
                &self.system_prompt.as_ref().map(|p| format!("<{} chars>", p.chars().count())),
            )
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Retry schedule for contract synthesis: the extraction schedule with
    /// its own attempt ceiling.
    pub fn contract_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.contract_attempts,
            ..self.retry.clone()
        }
    }

    pub fn repair_policy(&self) -> RepairPolicy {
        RepairPolicy::new(self.repair_order.clone())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.config.client = Some(client);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn synthesis_temperature(mut self, t: f32) -> Self {
        self.config.synthesis_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    /// Total attempts per extraction/summary call (first try included).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay = Duration::from_millis(ms);
        self
    }

    pub fn retry_multiplier(mut self, m: f64) -> Self {
        self.config.retry.multiplier = m;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay = Duration::from_millis(ms);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn contract_attempts(mut self, n: u32) -> Self {
        self.config.contract_attempts = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_images(mut self, n: usize) -> Self {
        self.config.max_images = n;
        self
    }

    pub fn max_text_chars(mut self, n: usize) -> Self {
        self.config.max_text_chars = Some(n);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn repair_order(mut self, order: Vec<RepairStrategy>) -> Self {
        self.config.repair_order = order;
        self
    }

    pub fn diagram(mut self, syntax: DiagramSyntax) -> Self {
        self.config.diagram = syntax;
        self
    }

    pub fn max_label_chars(mut self, n: usize) -> Self {
        self.config.max_label_chars = n.max(4);
        self
    }

    pub fn max_graph_depth(mut self, n: usize) -> Self {
        self.config.max_graph_depth = n.max(1);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.retry.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max attempts must be ≥ 1".into(),
            ));
        }
        if c.contract_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "contract attempts must be ≥ 1".into(),
            ));
        }
        if !(c.retry.multiplier.is_finite() && c.retry.multiplier >= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "retry multiplier must be ≥ 1.0, got {}",
                c.retry.multiplier
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "API timeout must be ≥ 1s".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(PipelineError::InvalidConfig(
                "max tokens must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Diagram language used to render a summary graph.
///
/// | Syntax | Output |
/// |--------|--------|
/// | `Flowchart` | `graph TD` node declarations + `-->` edges (default) |
/// | `Mindmap` | Mermaid `mindmap`, indentation encodes the tree |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagramSyntax {
    #[default]
    Flowchart,
    Mindmap,
}
