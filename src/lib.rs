//! # litextract
//!
//! Requirement-driven structured extraction from parsed documents with LLMs.
//!
//! ## Why this crate?
//!
//! Pulling the same handful of facts out of hundreds of research papers is
//! tedious and error-prone by hand, and hand-writing an extraction prompt and
//! JSON schema for every new question is not much better. Here the user
//! states what they want in plain language; the model turns that into an
//! extraction contract (target JSON structure, instructions, validation
//! criteria) once, and every document is then extracted under the same
//! contract. Replies are repaired and validated before anyone relies on them.
//!
//! ## Pipeline Overview
//!
//! ```text
//! requirement ──▶ contract (once per run)
//!                    │
//! document ──┬─ 1. Assemble   normalise text, cap images, pick mode
//!            ├─ 2. Dispatch   one model call per attempt, bounded retry
//!            ├─ 3. Sanitize   strip fences, repair JSON, validate vs contract
//!            ├─ 4. Summarize  hierarchy → graph → Mermaid diagram
//!            └─ 5. Output     ExtractionResult + SummaryGraph per document
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use litextract::{Pipeline, PipelineConfig, RawDocument};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let pipeline = Pipeline::new(PipelineConfig::default())?;
//!     let contract = pipeline
//!         .synthesize_contract("material name and bandgap", None)
//!         .await?;
//!     let doc = RawDocument::new("paper-1", "ZnO has a bandgap of 3.37 eV.");
//!     let processed = pipeline.process_document(&contract, doc).await?;
//!     println!("{}", processed.extraction.data());
//!     println!("{}", processed.graph.diagram);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `litextract` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! litextract = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod contract;
pub mod document;
pub mod error;
pub mod extract;
pub mod output;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;
pub mod testing;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{LlmProviderClient, ModelClient, ModelReply, ModelRequest};
pub use config::{DiagramSyntax, PipelineConfig, PipelineConfigBuilder};
pub use contract::{
    ContractBuilder, ExtractionContract, FieldKind, FieldSpec, RecordShape, ValidationCriterion,
};
pub use document::{BatchInput, DocumentContent, ImageBlob, RawDocument};
pub use error::{DispatchError, DocumentError, PipelineError};
pub use extract::Pipeline;
pub use output::{
    DispatchMode, DocumentOutcome, DocumentState, ExtractionResult, GraphNode, IssueKind,
    OutcomeStatus, PipelineRun, ProcessedDocument, RunStats, SummaryGraph, TokenUsage,
    ValidationIssue,
};
pub use pipeline::retry::RetryPolicy;
pub use pipeline::sanitize::{RepairPolicy, RepairStrategy};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use stream::{run_batch_stream, OutcomeStream};
