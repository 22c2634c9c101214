//! Extraction dispatch: one document, one contract, one model call.
//!
//! The dispatcher picks text-only or multimodal mode, builds the request and
//! makes exactly one outbound call under a per-call timeout. Retrying is done
//! one level up by [`crate::pipeline::retry::RetryPolicy`].

use crate::client::{ModelClient, ModelReply, ModelRequest};
use crate::contract::ExtractionContract;
use crate::document::DocumentContent;
use crate::error::DispatchError;
use crate::output::DispatchMode;
use crate::prompts::{extraction_prompt, DEFAULT_EXTRACTION_SYSTEM_PROMPT};
use std::time::Duration;
use tracing::debug;

/// Call parameters shared by every document in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

/// Multimodal when the content carries images, text-only otherwise.
pub fn mode_for(content: &DocumentContent) -> DispatchMode {
    if content.images().is_empty() {
        DispatchMode::TextOnly
    } else {
        DispatchMode::Multimodal
    }
}

/// Build the extraction request for one document.
pub fn build_request(
    contract: &ExtractionContract,
    content: &DocumentContent,
    options: &DispatchOptions,
) -> ModelRequest {
    ModelRequest {
        system: options
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_EXTRACTION_SYSTEM_PROMPT.to_string()),
        prompt: extraction_prompt(contract, content),
        images: content.images().to_vec(),
        temperature: options.temperature,
        max_tokens: options.max_tokens,
    }
}

/// Make exactly one call, bounded by `timeout`.
///
/// A reply with no visible text is reported as [`DispatchError::EmptyReply`].
pub async fn send(
    client: &dyn ModelClient,
    request: &ModelRequest,
    timeout: Duration,
) -> Result<ModelReply, DispatchError> {
    let reply = tokio::time::timeout(timeout, client.complete(request))
        .await
        .map_err(|_| DispatchError::Timeout {
            secs: timeout.as_secs(),
        })??;
    if reply.content.trim().is_empty() {
        return Err(DispatchError::EmptyReply);
    }
    Ok(reply)
}

/// Dispatch one document: build the request and send it once.
pub async fn dispatch(
    client: &dyn ModelClient,
    contract: &ExtractionContract,
    content: &DocumentContent,
    options: &DispatchOptions,
) -> Result<ModelReply, DispatchError> {
    let request = build_request(contract, content, options);
    debug!(
        source_id = content.source_id(),
        mode = ?mode_for(content),
        images = request.images.len(),
        prompt_chars = request.prompt.len(),
        "dispatching extraction"
    );
    send(client, &request, options.timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FieldKind, FieldSpec};
    use crate::document::{assemble, ImageBlob, RawDocument};
    use crate::testing::ScriptedClient;

    fn contract() -> ExtractionContract {
        ExtractionContract::builder("x")
            .field("a", FieldSpec::new(FieldKind::Number, ""))
            .build()
            .unwrap()
    }

    fn options() -> DispatchOptions {
        DispatchOptions {
            system_prompt: None,
            temperature: 0.2,
            max_tokens: 256,
            timeout: Duration::from_secs(5),
        }
    }

    fn image() -> ImageBlob {
        ImageBlob {
            id: "f.png".into(),
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        }
    }

    #[test]
    fn mode_follows_images() {
        let text = assemble(RawDocument::new("d", "t"), 5, None);
        assert_eq!(mode_for(&text), DispatchMode::TextOnly);
        let multi = assemble(RawDocument::new("d", "t").with_image(image()), 5, None);
        assert_eq!(mode_for(&multi), DispatchMode::Multimodal);
        let req = build_request(&contract(), &multi, &options());
        assert_eq!(req.images.len(), 1);
        assert_eq!(req.system, DEFAULT_EXTRACTION_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn exactly_one_call_per_dispatch() {
        let client = ScriptedClient::new().fail(DispatchError::Transport("reset".into()));
        let content = assemble(RawDocument::new("d", "t"), 5, None);
        let err = dispatch(&client, &contract(), &content, &options()).await.unwrap_err();
        assert_eq!(err, DispatchError::Transport("reset".into()));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn blank_reply_is_empty_error() {
        let client = ScriptedClient::new().reply("   \n");
        let content = assemble(RawDocument::new("d", "t"), 5, None);
        let err = dispatch(&client, &contract(), &content, &options()).await.unwrap_err();
        assert_eq!(err, DispatchError::EmptyReply);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let client = ScriptedClient::new()
            .reply("{\"a\": 1}")
            .with_delay(Duration::from_millis(200));
        let content = assemble(RawDocument::new("d", "t"), 5, None);
        let opts = DispatchOptions {
            timeout: Duration::from_millis(20),
            ..options()
        };
        let err = dispatch(&client, &contract(), &content, &opts).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
    }
}
