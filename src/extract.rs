//! The pipeline orchestrator.
//!
//! [`Pipeline`] owns the configuration and the model client and drives each
//! document through
//!
//! ```text
//! Pending → ContentAssembled → ContractApplied → Extracted → Validated → Summarized → Done
//! ```
//!
//! with `Failed(reason)` reachable from every step. In single-document mode
//! ([`Pipeline::process_document`]) a failure is returned as a
//! [`PipelineError`]; in batch mode ([`Pipeline::run_batch`]) it is recorded
//! on the document's [`DocumentOutcome`] and the run carries on.

use crate::client::{resolve_client, ModelClient, ModelReply, ModelRequest};
use crate::config::PipelineConfig;
use crate::contract::{ExtractionContract, RecordShape};
use crate::document::{assemble, BatchInput, DocumentContent, RawDocument};
use crate::error::{DispatchError, DocumentError, PipelineError};
use crate::output::{
    DocumentOutcome, DocumentState, ExtractionResult, OutcomeStatus, PipelineRun, ProcessedDocument,
    RunStats, SummaryGraph,
};
use crate::pipeline::dispatch::{self, DispatchOptions};
use crate::pipeline::retry::{Attempted, Decision, RetryError};
use crate::pipeline::sanitize::{sanitize_as, sanitize_reply, RepairPolicy};
use crate::pipeline::summary::{self, SummaryOptions};
use crate::prompts::{contract_prompt, summary_prompt, CONTRACT_SYSTEM_PROMPT, SUMMARY_SYSTEM_PROMPT};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs extraction contracts against documents.
pub struct Pipeline {
    config: PipelineConfig,
    client: Arc<dyn ModelClient>,
    repair: RepairPolicy,
    cancel: CancellationToken,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("client", &self.client.name())
            .field("config", &self.config)
            .finish()
    }
}

/// A failed document, before it is turned into an error or a record.
struct Failure {
    stage: DocumentState,
    error: PipelineError,
    extraction: Option<ExtractionResult>,
}

impl Failure {
    fn at(stage: DocumentState, error: PipelineError) -> Self {
        Self {
            stage,
            error,
            extraction: None,
        }
    }
}

/// A reply obtained through the retry loop.
struct Fetched {
    reply: ModelReply,
    attempts: u32,
    duration_ms: u64,
}

/// Why one contract-synthesis attempt failed.
#[derive(Debug)]
enum ContractAttemptError {
    Dispatch(DispatchError),
    Malformed(String),
}

impl fmt::Display for ContractAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractAttemptError::Dispatch(e) => write!(f, "{e}"),
            ContractAttemptError::Malformed(reason) => write!(f, "malformed contract reply: {reason}"),
        }
    }
}

impl ContractAttemptError {
    fn decision(&self) -> Decision {
        match self {
            ContractAttemptError::Dispatch(e) => Decision::for_dispatch(e),
            ContractAttemptError::Malformed(_) => Decision::Retry,
        }
    }
}

fn retry_to_pipeline(err: RetryError<DispatchError>) -> PipelineError {
    if err.is_cancelled() {
        return PipelineError::Cancelled;
    }
    let attempts = err.attempts();
    match err.into_last() {
        Some(source) => PipelineError::Dispatch { attempts, source },
        None => PipelineError::Cancelled,
    }
}

impl Pipeline {
    /// Build a pipeline, resolving the model client from the configuration.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let client = resolve_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Build a pipeline around an explicit client.
    pub fn with_client(config: PipelineConfig, client: Arc<dyn ModelClient>) -> Self {
        let repair = config.repair_policy();
        Self {
            config,
            client,
            repair,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Token that cancels [`Pipeline::run_batch`] and single-document calls.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            system_prompt: self.config.system_prompt.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: self.config.api_timeout(),
        }
    }

    fn summary_options(&self) -> SummaryOptions {
        SummaryOptions {
            syntax: self.config.diagram,
            max_label_chars: self.config.max_label_chars,
            max_depth: self.config.max_graph_depth,
        }
    }

    // ── Contract synthesis ───────────────────────────────────────────────

    /// Turn a free-form requirement into an extraction contract.
    ///
    /// Malformed replies count against `contract_attempts` just like
    /// retryable call failures. `feedback` refines an earlier contract.
    pub async fn synthesize_contract(
        &self,
        requirement: &str,
        feedback: Option<&str>,
    ) -> Result<Arc<ExtractionContract>, PipelineError> {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            return Err(PipelineError::InvalidRequirement);
        }

        let policy = self.config.contract_retry();
        let timeout = self.config.api_timeout();
        let last_problem: Mutex<Option<String>> = Mutex::new(None);
        info!(max_attempts = policy.max_attempts, "synthesizing extraction contract");

        let result = policy
            .run(
                "contract synthesis",
                &self.cancel,
                ContractAttemptError::decision,
                |attempt| {
                    let previous = last_problem
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    let request = ModelRequest {
                        system: CONTRACT_SYSTEM_PROMPT.to_string(),
                        prompt: contract_prompt(requirement, feedback, previous.as_deref()),
                        images: Vec::new(),
                        temperature: self.config.synthesis_temperature,
                        max_tokens: self.config.max_tokens,
                    };
                    let last_problem = &last_problem;
                    async move {
                        debug!(attempt, "requesting contract");
                        let reply = dispatch::send(self.client.as_ref(), &request, timeout)
                            .await
                            .map_err(ContractAttemptError::Dispatch)?;
                        self.parse_contract_reply(requirement, &reply.content).map_err(|reason| {
                            *last_problem.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(reason.clone());
                            ContractAttemptError::Malformed(reason)
                        })
                    }
                },
            )
            .await;

        match result {
            Ok(Attempted { value, attempts }) => {
                info!(
                    attempts,
                    fields = value.target_schema().len(),
                    criteria = value.validation_criteria().len(),
                    shape = ?value.record_shape(),
                    "extraction contract ready"
                );
                Ok(Arc::new(value))
            }
            Err(e) if e.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) => {
                let attempts = e.attempts();
                let detail = e
                    .into_last()
                    .map(|last| last.to_string())
                    .unwrap_or_else(|| "no attempt completed".to_string());
                Err(PipelineError::ContractSynthesisFailed { attempts, detail })
            }
        }
    }

    fn parse_contract_reply(&self, requirement: &str, raw: &str) -> Result<ExtractionContract, String> {
        let sanitized = sanitize_as(raw, &self.repair, Some(RecordShape::Single));
        let value = sanitized.value.ok_or_else(|| {
            sanitized
                .issues
                .first()
                .map(|i| i.message.clone())
                .unwrap_or_else(|| "reply is not JSON".to_string())
        })?;
        ExtractionContract::from_reply(requirement, &value)
    }

    // ── Per-stage operations ─────────────────────────────────────────────

    /// Normalise a raw document and apply the image and text caps.
    pub fn assemble(&self, raw: RawDocument) -> DocumentContent {
        assemble(raw, self.config.max_images, self.config.max_text_chars)
    }

    /// Extract one document under `contract`.
    ///
    /// Returns `Err` only when the model call fails after all retries or the
    /// run is cancelled. An unparseable reply is an `Ok` result with
    /// `is_valid() == false`.
    pub async fn extract(
        &self,
        contract: &ExtractionContract,
        content: &DocumentContent,
    ) -> Result<ExtractionResult, PipelineError> {
        let fetched = self.fetch_extraction(contract, content, &self.cancel).await?;
        Ok(self.sanitize_extraction(contract, content, fetched))
    }

    async fn fetch_extraction(
        &self,
        contract: &ExtractionContract,
        content: &DocumentContent,
        cancel: &CancellationToken,
    ) -> Result<Fetched, PipelineError> {
        let start = Instant::now();
        let options = self.dispatch_options();
        let Attempted { value, attempts } = self
            .config
            .retry
            .run("extraction", cancel, Decision::for_dispatch, |_| {
                dispatch::dispatch(self.client.as_ref(), contract, content, &options)
            })
            .await
            .map_err(retry_to_pipeline)?;
        Ok(Fetched {
            reply: value,
            attempts,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn sanitize_extraction(
        &self,
        contract: &ExtractionContract,
        content: &DocumentContent,
        fetched: Fetched,
    ) -> ExtractionResult {
        let result = sanitize_reply(content.source_id(), &fetched.reply.content, contract, &self.repair)
            .with_call_stats(
                dispatch::mode_for(content),
                fetched.attempts,
                fetched.reply.usage,
                fetched.duration_ms,
            );
        if result.is_valid() {
            debug!(
                source_id = result.source_id(),
                issues = result.issues().len(),
                repairs = result.repairs().len(),
                input_tokens = result.usage().input_tokens,
                output_tokens = result.usage().output_tokens,
                "extraction parsed"
            );
        } else {
            warn!(
                source_id = result.source_id(),
                issues = result.issues().len(),
                "extraction reply could not be recovered"
            );
        }
        result
    }

    /// Build the summary graph for a valid extraction.
    ///
    /// A failed or unparseable summary reply yields a degraded root-only
    /// graph, never an error; `Err` is returned for invalid input or
    /// cancellation.
    pub async fn summarize(&self, result: &ExtractionResult) -> Result<SummaryGraph, PipelineError> {
        self.summarize_with_cancel(result, &self.cancel).await
    }

    async fn summarize_with_cancel(
        &self,
        result: &ExtractionResult,
        cancel: &CancellationToken,
    ) -> Result<SummaryGraph, PipelineError> {
        if !result.is_valid() {
            return Err(PipelineError::InvalidExtraction {
                source_id: result.source_id().to_string(),
                issues: result.issues().to_vec(),
            });
        }
        let request = ModelRequest {
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            prompt: summary_prompt(result.data(), result.source_id()),
            images: Vec::new(),
            temperature: self.config.synthesis_temperature,
            max_tokens: self.config.max_tokens,
        };
        let timeout = self.config.api_timeout();
        let options = self.summary_options();

        let reply = self
            .config
            .retry
            .run("summary", cancel, Decision::for_dispatch, |_| {
                dispatch::send(self.client.as_ref(), &request, timeout)
            })
            .await;
        match reply {
            Ok(Attempted { value, .. }) => {
                let graph = summary::graph_from_reply(&value.content, &self.repair, &options);
                if let Some(reason) = &graph.diagnostic {
                    warn!(source_id = result.source_id(), reason = %reason, "summary graph degraded");
                }
                Ok(graph)
            }
            Err(e) if e.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) => {
                warn!(source_id = result.source_id(), error = %e, "summary request failed");
                Ok(summary::degraded_graph(&format!("summary request failed: {e}"), &options))
            }
        }
    }

    // ── Whole documents ──────────────────────────────────────────────────

    /// Run one document through every stage; failures are returned as errors.
    pub async fn process_document(
        &self,
        contract: &ExtractionContract,
        raw: RawDocument,
    ) -> Result<ProcessedDocument, PipelineError> {
        let mut trace = vec![DocumentState::Pending];
        self.drive(contract, raw, &self.cancel, &mut trace)
            .await
            .map_err(|failure| failure.error)
    }

    async fn drive(
        &self,
        contract: &ExtractionContract,
        raw: RawDocument,
        cancel: &CancellationToken,
        trace: &mut Vec<DocumentState>,
    ) -> Result<ProcessedDocument, Failure> {
        if cancel.is_cancelled() {
            return Err(Failure::at(DocumentState::Pending, PipelineError::Cancelled));
        }

        let content = self.assemble(raw);
        trace.push(DocumentState::ContentAssembled);
        if cancel.is_cancelled() {
            return Err(Failure::at(DocumentState::ContentAssembled, PipelineError::Cancelled));
        }

        trace.push(DocumentState::ContractApplied);
        let fetched = self
            .fetch_extraction(contract, &content, cancel)
            .await
            .map_err(|e| Failure::at(DocumentState::ContractApplied, e))?;
        trace.push(DocumentState::Extracted);

        let extraction = self.sanitize_extraction(contract, &content, fetched);
        if !extraction.is_valid() {
            return Err(Failure {
                stage: DocumentState::Extracted,
                error: PipelineError::InvalidExtraction {
                    source_id: extraction.source_id().to_string(),
                    issues: extraction.issues().to_vec(),
                },
                extraction: Some(extraction),
            });
        }
        trace.push(DocumentState::Validated);

        let graph = match self.summarize_with_cancel(&extraction, cancel).await {
            Ok(graph) => graph,
            Err(error) => {
                return Err(Failure {
                    stage: DocumentState::Validated,
                    error,
                    extraction: Some(extraction),
                })
            }
        };
        trace.push(DocumentState::Summarized);
        Ok(ProcessedDocument { extraction, graph })
    }

    /// Run one document and record its outcome; never fails.
    pub(crate) async fn run_document(
        &self,
        index: usize,
        total: usize,
        contract: &ExtractionContract,
        raw: RawDocument,
        cancel: &CancellationToken,
    ) -> DocumentOutcome {
        let source_id = raw.source_id.clone();
        let callback = self.config.progress_callback.as_ref();
        if let Some(cb) = callback {
            cb.on_document_start(index, total, &source_id);
        }
        debug!(index, source_id = %source_id, "document started");

        let mut trace = vec![DocumentState::Pending];
        let status = match self.drive(contract, raw, cancel, &mut trace).await {
            Ok(processed) => {
                trace.push(DocumentState::Done);
                info!(
                    "Document {}/{} '{}' done ({} issue(s), {} graph node(s))",
                    index + 1,
                    total,
                    source_id,
                    processed.extraction.issues().len(),
                    processed.graph.nodes.len()
                );
                if let Some(cb) = callback {
                    cb.on_document_complete(index, total, &source_id);
                }
                OutcomeStatus::Succeeded(processed)
            }
            Err(Failure {
                stage,
                error,
                extraction,
            }) => {
                let reason = error.to_string();
                trace.push(DocumentState::Failed(reason.clone()));
                warn!(
                    "Document {}/{} '{}' failed at {:?}: {}",
                    index + 1,
                    total,
                    source_id,
                    stage,
                    reason
                );
                if let Some(cb) = callback {
                    cb.on_document_error(index, total, &source_id, &reason);
                }
                OutcomeStatus::Failed {
                    stage,
                    error: DocumentError::from_pipeline(&source_id, error),
                    extraction,
                }
            }
        };

        DocumentOutcome {
            index,
            source_id,
            trace,
            status,
        }
    }

    fn unreadable_outcome(
        &self,
        index: usize,
        total: usize,
        source_id: String,
        detail: String,
    ) -> DocumentOutcome {
        let error = DocumentError::LoadFailed {
            source_id: source_id.clone(),
            detail,
        };
        let reason = error.to_string();
        warn!("Document {}/{} '{}' skipped: {}", index + 1, total, source_id, reason);
        if let Some(cb) = self.config.progress_callback.as_ref() {
            cb.on_document_start(index, total, &source_id);
            cb.on_document_error(index, total, &source_id, &reason);
        }
        DocumentOutcome {
            index,
            source_id,
            trace: vec![DocumentState::Pending, DocumentState::Failed(reason)],
            status: OutcomeStatus::Failed {
                stage: DocumentState::Pending,
                error,
                extraction: None,
            },
        }
    }

    // ── Batches ──────────────────────────────────────────────────────────

    /// Process every document; one outcome per input, in input order.
    pub async fn run_batch(&self, contract: &ExtractionContract, documents: Vec<RawDocument>) -> PipelineRun {
        self.run_batch_with_cancel(contract, documents, self.cancel.clone())
            .await
    }

    /// Like [`Pipeline::run_batch`], stopping early when `cancel` fires.
    ///
    /// Documents not yet started when the token fires are recorded as
    /// cancelled; calls already in flight are allowed to finish.
    pub async fn run_batch_with_cancel(
        &self,
        contract: &ExtractionContract,
        documents: Vec<RawDocument>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let inputs = documents.into_iter().map(BatchInput::from).collect();
        self.run_inputs_with_cancel(contract, inputs, cancel).await
    }

    /// Process a batch that may include inputs which could not be loaded.
    ///
    /// Each [`BatchInput::Unreadable`] entry becomes a failed outcome at the
    /// `Pending` stage, in its input position, without a model call.
    pub async fn run_inputs(&self, contract: &ExtractionContract, inputs: Vec<BatchInput>) -> PipelineRun {
        self.run_inputs_with_cancel(contract, inputs, self.cancel.clone())
            .await
    }

    /// Like [`Pipeline::run_inputs`], stopping early when `cancel` fires.
    pub async fn run_inputs_with_cancel(
        &self,
        contract: &ExtractionContract,
        inputs: Vec<BatchInput>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let start = Instant::now();
        let total = inputs.len();
        let concurrency = self.config.concurrency.max(1);
        info!(total, concurrency, client = self.client.name(), "starting batch");
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_start(total);
        }

        let cancel = &cancel;
        let mut outcomes: Vec<DocumentOutcome> = stream::iter(inputs.into_iter().enumerate())
            .map(|(index, input)| async move {
                match input {
                    BatchInput::Loaded(raw) => {
                        self.run_document(index, total, contract, raw, cancel).await
                    }
                    BatchInput::Unreadable { source_id, detail } => {
                        self.unreadable_outcome(index, total, source_id, detail)
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.index);

        let stats = RunStats::from_outcomes(&outcomes, start.elapsed().as_millis() as u64);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_complete(total, stats.succeeded);
        }
        info!(
            "Batch complete: {}/{} succeeded, {} failed ({} cancelled) in {}ms",
            stats.succeeded, stats.total, stats.failed, stats.cancelled, stats.total_duration_ms
        );
        PipelineRun { outcomes, stats }
    }
}
