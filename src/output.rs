//! Result types produced by the pipeline.
//!
//! Everything here is `Serialize + Deserialize` so shells can write results
//! to disk, print them as JSON, or ship them over the wire unchanged.

use crate::error::DocumentError;
use crate::pipeline::sanitize::RepairStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Validation issues ────────────────────────────────────────────────────

/// Category of a [`ValidationIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// No structured value could be recovered from the reply.
    Parse,
    /// A value was recovered but it is not the contract's record shape.
    Shape,
    /// A schema field is absent.
    MissingField,
    /// A schema field holds a value of the wrong JSON type.
    TypeMismatch,
    /// A machine-checkable validation criterion was not met.
    Criterion,
}

impl IssueKind {
    /// Issues of these kinds make a result invalid; the rest are advisory.
    pub fn is_fatal(self) -> bool {
        matches!(self, IssueKind::Parse | IssueKind::Shape)
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueKind::Parse => "parse",
            IssueKind::Shape => "shape",
            IssueKind::MissingField => "missing-field",
            IssueKind::TypeMismatch => "type-mismatch",
            IssueKind::Criterion => "criterion",
        };
        f.write_str(s)
    }
}

/// One diagnostic attached to an [`ExtractionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Dotted field path the issue refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, path: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "[{}] {}: {}", self.kind, p, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

// ── Extraction result ────────────────────────────────────────────────────

/// Whether a request carried images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    TextOnly,
    Multimodal,
}

/// Token accounting for one or more model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Structured data recovered from one model reply.
///
/// Constructed only by the sanitizer, so `valid` always agrees with the
/// issue list: it is `false` exactly when a [`IssueKind::Parse`] or
/// [`IssueKind::Shape`] issue is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    source_id: String,
    data: serde_json::Value,
    valid: bool,
    issues: Vec<ValidationIssue>,
    repairs: Vec<RepairStrategy>,
    mode: DispatchMode,
    attempts: u32,
    usage: TokenUsage,
    duration_ms: u64,
}

impl ExtractionResult {
    pub(crate) fn new(
        source_id: impl Into<String>,
        data: serde_json::Value,
        issues: Vec<ValidationIssue>,
        repairs: Vec<RepairStrategy>,
    ) -> Self {
        let valid = !issues.iter().any(|i| i.kind.is_fatal());
        Self {
            source_id: source_id.into(),
            data: if valid { data } else { serde_json::Value::Null },
            valid,
            issues,
            repairs,
            mode: DispatchMode::TextOnly,
            attempts: 0,
            usage: TokenUsage::default(),
            duration_ms: 0,
        }
    }

    pub(crate) fn with_call_stats(
        mut self,
        mode: DispatchMode,
        attempts: u32,
        usage: TokenUsage,
        duration_ms: u64,
    ) -> Self {
        self.mode = mode;
        self.attempts = attempts;
        self.usage = usage;
        self.duration_ms = duration_ms;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// The recovered value; `Null` when the result is not valid.
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Repairs the sanitizer had to apply before the reply parsed.
    pub fn repairs(&self) -> &[RepairStrategy] {
        &self.repairs
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Model calls made, including retries.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Look up a dotted path (`"meta.name"`, `"items.0.value"`) in the data.
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        lookup_path(&self.data, path)
    }
}

/// Resolve a dotted path; numeric segments index into arrays.
pub(crate) fn lookup_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(value, |v, seg| match v {
            serde_json::Value::Object(map) => map.get(seg),
            serde_json::Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

// ── Summary graph ────────────────────────────────────────────────────────

/// A node in a [`SummaryGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    /// Ids of this node's children, in order.
    pub children: Vec<String>,
}

/// Hierarchical summary of one extraction result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryGraph {
    /// Id of the root node (always `nodes[0].id`).
    pub root: String,
    /// Nodes in pre-order.
    pub nodes: Vec<GraphNode>,
    /// Rendered diagram text.
    pub diagram: String,
    /// Why the graph degraded to a single root node, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl SummaryGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn root_node(&self) -> Option<&GraphNode> {
        self.node(&self.root)
    }

    pub fn is_degraded(&self) -> bool {
        self.diagnostic.is_some()
    }
}

// ── Per-document outcome ─────────────────────────────────────────────────

/// Lifecycle of one document through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Pending,
    ContentAssembled,
    ContractApplied,
    Extracted,
    Validated,
    Summarized,
    Done,
    Failed(String),
}

impl DocumentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentState::Done | DocumentState::Failed(_))
    }
}

/// A successfully processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub extraction: ExtractionResult,
    pub graph: SummaryGraph,
}

/// Final status of one document in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded(ProcessedDocument),
    Failed {
        /// Last state reached before failing.
        stage: DocumentState,
        error: DocumentError,
        /// The invalid result, when the failure happened after extraction.
        #[serde(skip_serializing_if = "Option::is_none")]
        extraction: Option<ExtractionResult>,
    },
}

/// One entry of a [`PipelineRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    /// Position in the input batch (0-indexed).
    pub index: usize,
    pub source_id: String,
    /// Every state the document passed through, ending in `Done` or `Failed`.
    pub trace: Vec<DocumentState>,
    pub status: OutcomeStatus,
}

impl DocumentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Succeeded(_))
    }

    pub fn processed(&self) -> Option<&ProcessedDocument> {
        match &self.status {
            OutcomeStatus::Succeeded(p) => Some(p),
            OutcomeStatus::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&DocumentError> {
        match &self.status {
            OutcomeStatus::Succeeded(_) => None,
            OutcomeStatus::Failed { error, .. } => Some(error),
        }
    }
}

/// Aggregate statistics for a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed documents whose failure was cancellation.
    pub cancelled: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

impl RunStats {
    /// Tally outcomes. Token counts include the extraction attached to
    /// failed outcomes.
    pub(crate) fn from_outcomes(outcomes: &[DocumentOutcome], total_duration_ms: u64) -> Self {
        let mut stats = RunStats {
            total: outcomes.len(),
            total_duration_ms,
            ..Default::default()
        };
        for outcome in outcomes {
            let extraction = match &outcome.status {
                OutcomeStatus::Succeeded(p) => {
                    stats.succeeded += 1;
                    Some(&p.extraction)
                }
                OutcomeStatus::Failed {
                    error, extraction, ..
                } => {
                    stats.failed += 1;
                    if matches!(error, DocumentError::Cancelled { .. }) {
                        stats.cancelled += 1;
                    }
                    extraction.as_ref()
                }
            };
            if let Some(e) = extraction {
                stats.total_input_tokens += e.usage().input_tokens;
                stats.total_output_tokens += e.usage().output_tokens;
            }
        }
        stats
    }
}

/// Output of a batch run: one outcome per input document, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub outcomes: Vec<DocumentOutcome>,
    pub stats: RunStats,
}

impl PipelineRun {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}
