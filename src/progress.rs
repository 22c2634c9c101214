//! Progress-callback trait for per-document pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline processes each document.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a channel, a terminal progress bar or a
//! database record without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because documents may be
//! processed concurrently.
//!
//! # Example
//!
//! ```rust
//! use litextract::{PipelineProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, index: usize, total: usize, source_id: &str) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}/{} done: {}", index + 1, total, source_id);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. With `concurrency > 1` the per-document methods may
/// be called concurrently from different tasks.
///
/// `index` is the 0-indexed position of the document in the batch.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any document is processed.
    fn on_run_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a document starts its first stage.
    fn on_document_start(&self, index: usize, total: usize, source_id: &str) {
        let _ = (index, total, source_id);
    }

    /// Called when a document reaches `Done`.
    fn on_document_complete(&self, index: usize, total: usize, source_id: &str) {
        let _ = (index, total, source_id);
    }

    /// Called when a document ends in `Failed`.
    ///
    /// # Arguments
    /// * `error`: human-readable failure description
    fn on_document_error(&self, index: usize, total: usize, source_id: &str, error: &str) {
        let _ = (index, total, source_id, error);
    }

    /// Called once after every document has an outcome.
    fn on_run_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        succeeded: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_document_start(&self, _index: usize, _total: usize, _source_id: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_complete(&self, _index: usize, _total: usize, _source_id: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_error(&self, _index: usize, _total: usize, _source_id: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_complete(&self, _total: usize, success_count: usize) {
            self.succeeded.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_run_start(2);
        cb.on_document_start(0, 2, "a");
        cb.on_document_error(0, 2, "a", "boom");
        cb.on_run_complete(2, 1);
    }

    #[tokio::test]
    async fn batch_run_reports_every_document() {
        use crate::config::PipelineConfig;
        use crate::contract::{ExtractionContract, FieldKind, FieldSpec};
        use crate::document::RawDocument;
        use crate::extract::Pipeline;
        use crate::testing::ScriptedClient;

        let client = Arc::new(
            ScriptedClient::new()
                .on_prompt_containing("concise hierarchy", vec![Ok(r#"{"label": "A"}"#.into())])
                .on_prompt_containing("unreadable paper", vec![Ok("I cannot help with that.".into())])
                .fallback(r#"{"a": 1}"#),
        );
        let tracker = Arc::new(TrackingCallback::default());
        let config = PipelineConfig::builder()
            .progress_callback(tracker.clone())
            .build()
            .unwrap();
        let pipeline = Pipeline::with_client(config, client);
        let contract = ExtractionContract::builder("a")
            .field("a", FieldSpec::new(FieldKind::Number, ""))
            .build()
            .unwrap();
        let docs = vec![
            RawDocument::new("a", "a readable paper"),
            RawDocument::new("b", "an unreadable paper"),
        ];

        let run = pipeline.run_batch(&contract, docs).await;

        assert_eq!(run.stats.succeeded, 1);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.succeeded.load(Ordering::SeqCst), 1);
    }
}
