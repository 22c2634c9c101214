//! Streaming batch API: emit document outcomes as they complete.
//!
//! ## Why stream?
//!
//! A batch of a few hundred papers takes a while. Streaming lets callers
//! write each document's output as soon as it is ready and show partial
//! results, instead of waiting for [`crate::Pipeline::run_batch`] to collect
//! every outcome.
//!
//! With `concurrency > 1` outcomes arrive in completion order; sort by
//! [`DocumentOutcome::index`] if input order matters. With the default
//! `concurrency = 1` they arrive in input order.

use crate::contract::ExtractionContract;
use crate::document::RawDocument;
use crate::extract::Pipeline;
use crate::output::DocumentOutcome;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A boxed stream of per-document outcomes.
pub type OutcomeStream = Pin<Box<dyn Stream<Item = DocumentOutcome> + Send>>;

/// Run a batch, yielding one [`DocumentOutcome`] per document as it finishes.
///
/// Every input document produces exactly one item, including documents
/// skipped because `cancel` fired before they started. The progress
/// callback's `on_run_complete` fires once the last item has been yielded.
///
/// # Example
/// ```rust,no_run
/// use litextract::{run_batch_stream, Pipeline, PipelineConfig, RawDocument};
/// use futures::StreamExt;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Arc::new(Pipeline::new(PipelineConfig::default())?);
/// let contract = pipeline.synthesize_contract("material and bandgap", None).await?;
/// let docs = vec![RawDocument::new("paper-1", "ZnO has a bandgap of 3.37 eV.")];
/// let mut outcomes = run_batch_stream(pipeline, contract, docs, CancellationToken::new());
/// while let Some(outcome) = outcomes.next().await {
///     println!("{}: success={}", outcome.source_id, outcome.is_success());
/// }
/// # Ok(())
/// # }
/// ```
pub fn run_batch_stream(
    pipeline: Arc<Pipeline>,
    contract: Arc<ExtractionContract>,
    documents: Vec<RawDocument>,
    cancel: CancellationToken,
) -> OutcomeStream {
    let total = documents.len();
    let concurrency = pipeline.config().concurrency.max(1);
    info!(total, concurrency, "starting streaming batch");
    let callback = pipeline.config().progress_callback.clone();
    if let Some(cb) = &callback {
        cb.on_run_start(total);
    }
    let succeeded = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&succeeded);

    let outcomes = stream::iter(documents.into_iter().enumerate().map(move |(index, raw)| {
        let pipeline = Arc::clone(&pipeline);
        let contract = Arc::clone(&contract);
        let cancel = cancel.clone();
        async move {
            pipeline
                .run_document(index, total, &contract, raw, &cancel)
                .await
        }
    }))
    .buffer_unordered(concurrency)
    .inspect(move |outcome| {
        if outcome.is_success() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    let finish = stream::once(async move {
        let succeeded = succeeded.load(Ordering::Relaxed);
        if let Some(cb) = callback {
            cb.on_run_complete(total, succeeded);
        }
        info!(total, succeeded, "streaming batch complete");
    })
    .filter_map(|()| async { None::<DocumentOutcome> });

    Box::pin(outcomes.chain(finish))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::contract::{FieldKind, FieldSpec};
    use crate::progress::PipelineProgressCallback;
    use crate::testing::ScriptedClient;

    fn contract() -> Arc<ExtractionContract> {
        Arc::new(
            ExtractionContract::builder("x")
                .field("a", FieldSpec::new(FieldKind::Number, ""))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn yields_one_outcome_per_document() {
        let client = Arc::new(
            ScriptedClient::new()
                .on_prompt_containing("concise hierarchy", vec![Ok(r#"{"label": "A"}"#.into())])
                .fallback(r#"{"a": 1}"#),
        );
        let cfg = PipelineConfig::builder().concurrency(2).build().unwrap();
        let pipeline = Arc::new(Pipeline::with_client(cfg, client));
        let docs = (0..3)
            .map(|i| RawDocument::new(format!("doc-{i}"), "text"))
            .collect();

        let mut outcomes: Vec<DocumentOutcome> =
            run_batch_stream(pipeline, contract(), docs, CancellationToken::new())
                .collect()
                .await;
        outcomes.sort_by_key(|o| o.index);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert_eq!(outcomes[2].source_id, "doc-2");
    }

    #[derive(Default)]
    struct RunTotals {
        started: AtomicUsize,
        finished: AtomicUsize,
        succeeded: AtomicUsize,
    }

    impl PipelineProgressCallback for RunTotals {
        fn on_run_start(&self, _total: usize) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_complete(&self, _total: usize, success_count: usize) {
            self.finished.fetch_add(1, Ordering::SeqCst);
            self.succeeded.store(success_count, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn run_complete_fires_after_last_outcome() {
        let client = Arc::new(
            ScriptedClient::new()
                .on_prompt_containing("concise hierarchy", vec![Ok(r#"{"label": "A"}"#.into())])
                .on_prompt_containing("broken", vec![Ok("no data here".into())])
                .fallback(r#"{"a": 1}"#),
        );
        let totals = Arc::new(RunTotals::default());
        let cfg = PipelineConfig::builder()
            .concurrency(2)
            .progress_callback(totals.clone())
            .build()
            .unwrap();
        let pipeline = Arc::new(Pipeline::with_client(cfg, client));
        let docs = vec![
            RawDocument::new("a", "text"),
            RawDocument::new("b", "broken text"),
            RawDocument::new("c", "text"),
        ];

        let mut outcomes = run_batch_stream(pipeline, contract(), docs, CancellationToken::new());
        let mut seen = 0;
        while let Some(_outcome) = outcomes.next().await {
            seen += 1;
            assert_eq!(totals.finished.load(Ordering::SeqCst), 0);
        }
        assert_eq!(seen, 3);
        assert_eq!(totals.started.load(Ordering::SeqCst), 1);
        assert_eq!(totals.finished.load(Ordering::SeqCst), 1);
        assert_eq!(totals.succeeded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_yields_cancelled_outcomes() {
        let client = Arc::new(ScriptedClient::new().fallback(r#"{"a": 1}"#));
        let pipeline = Arc::new(Pipeline::with_client(PipelineConfig::default(), client.clone()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let docs = vec![RawDocument::new("a", "t"), RawDocument::new("b", "t")];

        let outcomes: Vec<DocumentOutcome> = run_batch_stream(pipeline, contract(), docs, cancel)
            .collect()
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.is_success()));
        assert_eq!(client.call_count(), 0);
    }
}
