//! Error types for the litextract library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal** to the call that returned it. Raised when no contract
//!   could be synthesized, the provider is not configured, or (in
//!   single-document mode) the one document could not be extracted.
//!
//! * [`DispatchError`]: a single outbound model call failed. Each variant
//!   is classified retryable or permanent by [`DispatchError::is_retryable`];
//!   the retry policy absorbs the retryable ones up to its attempt ceiling.
//!
//! * [`DocumentError`]: **Non-fatal** in batch mode. One document failed
//!   but the run continues. Stored in the document's
//!   [`crate::output::OutcomeStatus::Failed`] record so callers can see which
//!   input failed and why.

use std::path::PathBuf;
use thiserror::Error;

use crate::output::ValidationIssue;

/// All fatal errors returned by the litextract library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Contract errors ───────────────────────────────────────────────────
    /// The requirement was empty; nothing can be synthesized from it.
    #[error("Extraction requirement is empty")]
    InvalidRequirement,

    /// No usable extraction contract after all attempts. Fatal to the run.
    #[error("Could not synthesize an extraction contract after {attempts} attempt(s): {detail}")]
    ContractSynthesisFailed { attempts: u32, detail: String },

    /// A saved contract file could not be read or parsed.
    #[error("Failed to load contract from '{path}': {detail}")]
    ContractLoad { path: PathBuf, detail: String },

    // ── Document errors ───────────────────────────────────────────────────
    /// A parsed-document directory could not be read.
    #[error("Failed to load document '{path}': {detail}")]
    DocumentLoad { path: PathBuf, detail: String },

    /// The model call for a document failed after all retries.
    #[error("Model call failed after {attempts} attempt(s): {source}")]
    Dispatch {
        attempts: u32,
        #[source]
        source: DispatchError,
    },

    /// The reply for a document could not be recovered as the declared shape.
    #[error("Extraction for '{source_id}' is not valid: {}", summarize_issues(.issues))]
    InvalidExtraction {
        source_id: String,
        issues: Vec<ValidationIssue>,
    },

    /// The run's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    // ── Provider / config errors ──────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize_issues(issues: &[ValidationIssue]) -> String {
    match issues.first() {
        Some(first) if issues.len() > 1 => format!("{} (+{} more)", first, issues.len() - 1),
        Some(first) => first.to_string(),
        None => "no diagnostics".to_string(),
    }
}

/// A failed outbound model call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Connection refused, DNS failure, reset stream, …
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// HTTP 429. `retry_after_secs` is the server's hint, if it gave one.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The call exceeded its own timeout.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The call succeeded but the reply had no text.
    #[error("model returned an empty reply")]
    EmptyReply,

    /// 401/403; retrying will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Any other error the provider marked as permanent (bad request, …).
    #[error("{0}")]
    Permanent(String),
}

impl DispatchError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Transport(_)
            | DispatchError::RateLimited { .. }
            | DispatchError::Timeout { .. }
            | DispatchError::EmptyReply => true,
            DispatchError::Status { code, .. } => *code == 408 || *code >= 500,
            DispatchError::Auth(_) | DispatchError::Permanent(_) => false,
        }
    }

    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DispatchError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

/// A non-fatal failure for a single document in a batch.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DocumentError {
    /// The extraction call failed after retries.
    #[error("{source_id}: model call failed after {attempts} attempt(s): {detail}")]
    DispatchFailed {
        source_id: String,
        attempts: u32,
        detail: String,
    },

    /// The reply could not be parsed as the contract's shape.
    #[error("{source_id}: extraction is not valid ({issue_count} issue(s)): {detail}")]
    InvalidExtraction {
        source_id: String,
        issue_count: usize,
        detail: String,
    },

    /// The run was cancelled before this document finished.
    #[error("{source_id}: cancelled")]
    Cancelled { source_id: String },

    /// The document's input could not be read, so it never reached the model.
    #[error("{source_id}: could not be loaded: {detail}")]
    LoadFailed { source_id: String, detail: String },
}

impl DocumentError {
    /// Convert a single-document failure into its batch record.
    pub(crate) fn from_pipeline(source_id: &str, err: PipelineError) -> Self {
        match err {
            PipelineError::Dispatch { attempts, source } => DocumentError::DispatchFailed {
                source_id: source_id.to_string(),
                attempts,
                detail: source.to_string(),
            },
            PipelineError::InvalidExtraction { issues, .. } => DocumentError::InvalidExtraction {
                source_id: source_id.to_string(),
                issue_count: issues.len(),
                detail: summarize_issues(&issues),
            },
            PipelineError::Cancelled => DocumentError::Cancelled {
                source_id: source_id.to_string(),
            },
            PipelineError::DocumentLoad { detail, .. } => DocumentError::LoadFailed {
                source_id: source_id.to_string(),
                detail,
            },
            other => DocumentError::DispatchFailed {
                source_id: source_id.to_string(),
                attempts: 0,
                detail: other.to_string(),
            },
        }
    }
}
