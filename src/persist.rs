//! Writing run results to disk and reloading saved contracts.
//!
//! Layout under the output directory:
//!
//! ```text
//! <out>/
//!   contract.json          the contract every document was extracted with
//!   run.json               stats + one status entry per document
//!   results.json           every successful extraction, keyed by source id
//!   report.md              batch overview: status table + data previews
//!   <source id>/
//!     extraction.json      ExtractionResult (data, issues, call stats)
//!     graph.json           SummaryGraph
//!     graph.mmd            rendered diagram
//!     report.md            human-readable summary of the above
//!   <failed source id>/
//!     error.json           the full DocumentOutcome, trace included
//! ```
//!
//! Every file is written to a `.tmp` sibling first and renamed into place, so
//! an interrupted run never leaves a half-written file behind.

use crate::contract::ExtractionContract;
use crate::error::PipelineError;
use crate::output::{DocumentOutcome, OutcomeStatus, PipelineRun, ProcessedDocument, RunStats};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONTRACT_FILE: &str = "contract.json";
pub const RUN_FILE: &str = "run.json";
pub const EXTRACTION_FILE: &str = "extraction.json";
pub const GRAPH_FILE: &str = "graph.json";
pub const DIAGRAM_FILE: &str = "graph.mmd";
pub const REPORT_FILE: &str = "report.md";
pub const ERROR_FILE: &str = "error.json";
pub const RESULTS_FILE: &str = "results.json";

/// Characters of extracted JSON shown per document in the batch report.
const PREVIEW_CHARS: usize = 200;

/// Summary written to `run.json`.
#[derive(Debug, Serialize)]
struct RunManifest<'a> {
    requirement: &'a str,
    stats: &'a RunStats,
    documents: Vec<ManifestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    index: usize,
    source_id: &'a str,
    succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Directory, relative to the output root, holding this document's files.
    output: String,
}

/// Every successful extraction of a run in one file.
#[derive(Debug, Serialize)]
struct MergedResults<'a> {
    requirement: &'a str,
    documents: usize,
    succeeded: usize,
    /// Records across all documents; a `many` document counts each element.
    records: usize,
    results: IndexMap<&'a str, &'a Value>,
}

/// Map a source id onto a single safe path component.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`; empty and dot-only names
/// fall back to `document`.
pub fn safe_dir_name(source_id: &str) -> String {
    let name: String = source_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "document".to_string()
    } else {
        name
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    let write_err = |source| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    tokio::fs::write(&tmp_path, contents).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote output file");
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("serialise {}: {e}", path.display())))?;
    write_atomic(path, &json).await
}

/// Save a contract so later runs can reuse it with [`load_contract`].
pub async fn save_contract(contract: &ExtractionContract, path: &Path) -> Result<(), PipelineError> {
    write_json(path, contract).await
}

/// Load a contract previously written by [`save_contract`].
pub async fn load_contract(path: &Path) -> Result<ExtractionContract, PipelineError> {
    let load_err = |detail: String| PipelineError::ContractLoad {
        path: path.to_path_buf(),
        detail,
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| load_err(e.to_string()))?;
    let contract: ExtractionContract =
        serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;
    if contract.target_schema().is_empty() {
        return Err(load_err("target schema is empty".into()));
    }
    Ok(contract)
}

/// Markdown report for one processed document.
pub fn render_report(processed: &ProcessedDocument) -> String {
    let extraction = &processed.extraction;
    let data = serde_json::to_string_pretty(extraction.data())
        .unwrap_or_else(|_| extraction.data().to_string());

    let mut md = format!("# {}\n\n", extraction.source_id());
    md.push_str(&format!(
        "- Mode: {:?}\n- Attempts: {}\n- Tokens: {} in / {} out\n- Duration: {} ms\n",
        extraction.mode(),
        extraction.attempts(),
        extraction.usage().input_tokens,
        extraction.usage().output_tokens,
        extraction.duration_ms()
    ));
    if !extraction.repairs().is_empty() {
        let repairs: Vec<String> = extraction.repairs().iter().map(|r| r.to_string()).collect();
        md.push_str(&format!("- Repairs: {}\n", repairs.join(", ")));
    }

    md.push_str("\n## Extracted data\n\n```json\n");
    md.push_str(&data);
    md.push_str("\n```\n");

    if !extraction.issues().is_empty() {
        md.push_str("\n## Issues\n\n");
        for issue in extraction.issues() {
            md.push_str(&format!("- {issue}\n"));
        }
    }

    md.push_str("\n## Summary graph\n\n");
    if let Some(reason) = &processed.graph.diagnostic {
        md.push_str(&format!("> {reason}\n\n"));
    }
    md.push_str("```mermaid\n");
    md.push_str(processed.graph.diagram.trim_end());
    md.push_str("\n```\n");
    md
}

/// Write one outcome's files into `dir`.
pub async fn write_outcome(dir: &Path, outcome: &DocumentOutcome) -> Result<(), PipelineError> {
    match &outcome.status {
        OutcomeStatus::Succeeded(processed) => {
            write_json(&dir.join(EXTRACTION_FILE), &processed.extraction).await?;
            write_json(&dir.join(GRAPH_FILE), &processed.graph).await?;
            write_atomic(&dir.join(DIAGRAM_FILE), processed.graph.diagram.as_bytes()).await?;
            write_atomic(&dir.join(REPORT_FILE), render_report(processed).as_bytes()).await
        }
        OutcomeStatus::Failed { .. } => write_json(&dir.join(ERROR_FILE), outcome).await,
    }
}

/// Pick one output directory name per outcome.
///
/// Names are safe source ids. A name already taken, by an earlier document
/// or by a run-level file, gets `-{index}` appended, then a counter until it
/// is unused.
pub fn output_names(outcomes: &[DocumentOutcome]) -> Vec<String> {
    let mut used: HashSet<String> = [CONTRACT_FILE, RUN_FILE, RESULTS_FILE, REPORT_FILE]
        .into_iter()
        .map(String::from)
        .collect();
    outcomes
        .iter()
        .map(|outcome| {
            let base = safe_dir_name(&outcome.source_id);
            let mut name = base.clone();
            let mut suffix = outcome.index;
            while !used.insert(name.clone()) {
                name = format!("{base}-{suffix}");
                suffix += 1;
            }
            name
        })
        .collect()
}

fn record_count(data: &Value) -> usize {
    match data {
        Value::Array(items) => items.len(),
        Value::Null => 0,
        _ => 1,
    }
}

fn merge_results<'a>(requirement: &'a str, run: &'a PipelineRun, names: &'a [String]) -> MergedResults<'a> {
    let mut results: IndexMap<&str, &Value> = IndexMap::new();
    for (outcome, name) in run.outcomes.iter().zip(names) {
        let Some(processed) = outcome.processed() else {
            continue;
        };
        let key = if results.contains_key(outcome.source_id.as_str()) {
            name.as_str()
        } else {
            outcome.source_id.as_str()
        };
        results.insert(key, processed.extraction.data());
    }
    MergedResults {
        requirement,
        documents: run.outcomes.len(),
        succeeded: results.len(),
        records: results.values().map(|v| record_count(v)).sum(),
        results,
    }
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn preview(data: &Value) -> String {
    let text = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text,
    }
}

/// Markdown overview of a whole run.
pub fn render_run_report(requirement: &str, run: &PipelineRun, names: &[String]) -> String {
    let stats = &run.stats;
    let mut md = String::from("# Extraction run\n\n");
    md.push_str(&format!("- Requirement: {}\n", requirement.trim()));
    md.push_str(&format!(
        "- Documents: {} ({} succeeded, {} failed, {} cancelled)\n",
        stats.total, stats.succeeded, stats.failed, stats.cancelled
    ));
    md.push_str(&format!(
        "- Tokens: {} in / {} out\n- Duration: {} ms\n",
        stats.total_input_tokens, stats.total_output_tokens, stats.total_duration_ms
    ));

    md.push_str("\n| # | Source | Status | Records | Issues | Output |\n");
    md.push_str("|---|---|---|---|---|---|\n");
    for (outcome, name) in run.outcomes.iter().zip(names) {
        let (status, records, issues) = match &outcome.status {
            OutcomeStatus::Succeeded(p) => (
                "ok".to_string(),
                record_count(p.extraction.data()).to_string(),
                p.extraction.issues().len().to_string(),
            ),
            OutcomeStatus::Failed { error, .. } => {
                (format!("failed: {error}"), "-".to_string(), "-".to_string())
            }
        };
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | `{}/` |\n",
            outcome.index + 1,
            table_cell(&outcome.source_id),
            table_cell(&status),
            records,
            issues,
            name
        ));
    }

    let mut previews = run.succeeded().peekable();
    if previews.peek().is_some() {
        md.push_str("\n## Previews\n");
        for outcome in previews {
            if let Some(p) = outcome.processed() {
                md.push_str(&format!("\n### {}\n\n```json\n", outcome.source_id));
                md.push_str(&preview(p.extraction.data()));
                md.push_str("\n```\n");
            }
        }
    }
    md
}

/// Write the contract, every outcome and the run-level files under `out_dir`.
///
/// Run-level files are `run.json`, the merged `results.json` and the
/// `report.md` overview. Directory names come from [`output_names`].
pub async fn write_run(
    out_dir: &Path,
    contract: &ExtractionContract,
    run: &PipelineRun,
) -> Result<(), PipelineError> {
    save_contract(contract, &out_dir.join(CONTRACT_FILE)).await?;

    let names = output_names(&run.outcomes);
    let mut documents = Vec::with_capacity(run.outcomes.len());
    for (outcome, name) in run.outcomes.iter().zip(&names) {
        write_outcome(&out_dir.join(name), outcome).await?;
        documents.push(ManifestEntry {
            index: outcome.index,
            source_id: &outcome.source_id,
            succeeded: outcome.is_success(),
            error: outcome.error().map(|e| e.to_string()),
            output: name.clone(),
        });
    }

    let manifest = RunManifest {
        requirement: contract.requirement(),
        stats: &run.stats,
        documents,
    };
    write_json(&out_dir.join(RUN_FILE), &manifest).await?;

    let merged = merge_results(contract.requirement(), run, &names);
    write_json(&out_dir.join(RESULTS_FILE), &merged).await?;
    let report = render_run_report(contract.requirement(), run, &names);
    write_atomic(&out_dir.join(REPORT_FILE), report.as_bytes()).await?;

    info!(
        dir = %out_dir.display(),
        documents = run.outcomes.len(),
        records = merged.records,
        "run output written"
    );
    Ok(())
}
