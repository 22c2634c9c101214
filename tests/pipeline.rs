//! Integration tests for the extraction pipeline.
//!
//! Every test drives the public API against `ScriptedClient`, so no network
//! access or API key is needed:
//!
//!   cargo test --test pipeline

use litextract::document::load_batch;
use litextract::persist::{load_contract, write_run, CONTRACT_FILE, REPORT_FILE, RESULTS_FILE, RUN_FILE};
use litextract::testing::ScriptedClient;
use litextract::{
    DiagramSyntax, DispatchError, DocumentError, DocumentState, ExtractionContract, FieldKind,
    FieldSpec, ImageBlob, IssueKind, OutcomeStatus, Pipeline, PipelineConfig, PipelineError,
    PipelineProgressCallback, RawDocument, RecordShape,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Needles that pick out each kind of request.
const CONTRACT_CALL: &str = "prompt engineer";
const SUMMARY_CALL: &str = "concise hierarchy";

const CONTRACT_REPLY: &str = r#"{
  "extraction_prompt": "Extract the material studied and its bandgap.",
  "target_json_structure": {
    "material_name": "string - name of the material",
    "bandgap": "string - bandgap value with unit"
  },
  "validation_criteria": [
    {"field": "material_name", "check": "required"},
    {"field": "bandgap", "check": "pattern", "pattern": "eV$"}
  ],
  "special_instructions": ["Report the bandgap exactly as written."]
}"#;

const SUMMARY_REPLY: &str = r#"{"label": "ZnO", "children": [{"label": "Bandgap", "children": ["3.37 eV"]}]}"#;

/// Route library logs through the test harness; `RUST_LOG=litextract=debug`
/// shows them for a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn fast_config() -> PipelineConfig {
    init_tracing();
    PipelineConfig::builder()
        .retry_backoff_ms(1)
        .retry_max_delay_ms(5)
        .build()
        .expect("valid config")
}

fn bandgap_contract() -> ExtractionContract {
    ExtractionContract::builder("extract material name and bandgap value")
        .field("material_name", FieldSpec::new(FieldKind::String, "name of the material"))
        .field("bandgap", FieldSpec::new(FieldKind::String, "bandgap with unit"))
        .build()
        .expect("valid contract")
}

fn summary_rule(client: ScriptedClient) -> ScriptedClient {
    client.on_prompt_containing(SUMMARY_CALL, vec![Ok(SUMMARY_REPLY.into())])
}

#[derive(Default)]
struct Counting {
    starts: AtomicUsize,
    completes: AtomicUsize,
    errors: AtomicUsize,
    run_successes: AtomicUsize,
}

impl PipelineProgressCallback for Counting {
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
        self.run_successes.store(success_count, Ordering::SeqCst);
    }
}

// ── Single document ──────────────────────────────────────────────────────────

#[tokio::test]
async fn requirement_to_summary_graph() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new()
            .on_prompt_containing(CONTRACT_CALL, vec![Ok(CONTRACT_REPLY.into())])
            .reply(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#)
            .with_usage(120, 30),
    ));
    let pipeline = Pipeline::with_client(fast_config(), client.clone());

    let contract = pipeline
        .synthesize_contract("extract material name and bandgap value", None)
        .await
        .expect("contract");
    assert_eq!(contract.record_shape(), RecordShape::Single);
    assert_eq!(contract.target_schema().len(), 2);
    assert_eq!(contract.validation_criteria().len(), 2);

    let doc = RawDocument::new(
        "zno-paper",
        "The synthesized material, ZnO, has a bandgap of 3.37 eV.",
    );
    let processed = pipeline
        .process_document(&contract, doc)
        .await
        .expect("processed");

    let result = &processed.extraction;
    assert!(result.is_valid());
    assert!(result.issues().is_empty(), "issues: {:?}", result.issues());
    assert_eq!(result.get("material_name"), Some(&json!("ZnO")));
    assert_eq!(result.get("bandgap"), Some(&json!("3.37 eV")));
    assert_eq!(result.usage().input_tokens, 120);

    let graph = &processed.graph;
    assert!(!graph.is_degraded());
    assert_eq!(graph.nodes.len(), 3);
    assert_eq!(graph.root_node().map(|n| n.label.as_str()), Some("ZnO"));
    assert!(graph.diagram.starts_with("graph TD"));

    // contract, extraction, summary
    assert_eq!(client.call_count(), 3);
    let extraction_call = &client.calls()[1];
    assert!(extraction_call.prompt.contains("Report the bandgap exactly as written."));
    assert!(extraction_call.prompt.contains("3.37 eV"));
}

#[tokio::test]
async fn fenced_reply_is_recovered() {
    let client = Arc::new(ScriptedClient::new().reply("```json\n{\"a\":1}\n```"));
    let pipeline = Pipeline::with_client(fast_config(), client);
    let contract = ExtractionContract::builder("a")
        .field("a", FieldSpec::new(FieldKind::Number, ""))
        .build()
        .unwrap();

    let content = pipeline.assemble(RawDocument::new("d", "a is one"));
    let result = assert_ok!(pipeline.extract(&contract, &content).await);
    assert!(result.is_valid());
    assert_eq!(result.data(), &json!({"a": 1}));
}

#[tokio::test]
async fn refusal_is_an_invalid_result() {
    let client = Arc::new(ScriptedClient::new().reply("Sorry, I cannot help."));
    let pipeline = Pipeline::with_client(fast_config(), client);
    let content = pipeline.assemble(RawDocument::new("d", "text"));

    let result = assert_ok!(pipeline.extract(&bandgap_contract(), &content).await);
    assert!(!result.is_valid());
    assert!(result.data().is_null());
    assert!(result.issues().iter().any(|i| i.kind == IssueKind::Parse));

    let err = assert_err!(pipeline.summarize(&result).await);
    assert!(matches!(err, PipelineError::InvalidExtraction { .. }));
}

#[tokio::test]
async fn transient_failures_then_success() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new()
            .fail(DispatchError::Transport("connection reset".into()))
            .fail(DispatchError::RateLimited { retry_after_secs: None })
            .reply(r#"{"material_name": "TiO2", "bandgap": "3.2 eV"}"#),
    ));
    let pipeline = Pipeline::with_client(fast_config(), client.clone());
    let processed = pipeline
        .process_document(&bandgap_contract(), RawDocument::new("d", "TiO2, 3.2 eV"))
        .await
        .expect("third attempt succeeds");
    assert_eq!(processed.extraction.attempts(), 3);
    assert_eq!(client.call_count(), 4);
}

#[tokio::test]
async fn exhausted_retries_surface_last_error() {
    let client = Arc::new(ScriptedClient::new().fallback("").with_usage(1, 1));
    let cfg = PipelineConfig::builder()
        .max_attempts(2)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    let pipeline = Pipeline::with_client(cfg, client.clone());
    let err = pipeline
        .process_document(&bandgap_contract(), RawDocument::new("d", "t"))
        .await
        .unwrap_err();
    match err {
        PipelineError::Dispatch { attempts, source } => {
            assert_eq!(attempts, 2);
            assert_eq!(source, DispatchError::EmptyReply);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.call_count(), 2);
}

#[tokio::test]
async fn contract_synthesis_stops_at_ceiling() {
    let client = Arc::new(ScriptedClient::new().fallback("Here is what I would extract: the bandgap."));
    let pipeline = Pipeline::with_client(fast_config(), client.clone());
    let err = pipeline.synthesize_contract("bandgap", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::ContractSynthesisFailed { attempts: 3, .. }));
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn multimodal_request_carries_capped_images() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new().reply(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#),
    ));
    let cfg = PipelineConfig::builder()
        .max_images(2)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    let pipeline = Pipeline::with_client(cfg, client.clone());
    let mut doc = RawDocument::new("d", "see figures");
    for i in 0..4 {
        doc = doc.with_image(ImageBlob {
            id: format!("fig{i}.png"),
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        });
    }

    let processed = pipeline
        .process_document(&bandgap_contract(), doc)
        .await
        .unwrap();
    assert_eq!(processed.extraction.mode(), litextract::DispatchMode::Multimodal);
    let sent = &client.calls()[0];
    assert_eq!(sent.images.len(), 2);
    assert_eq!(sent.images[0].id, "fig0.png");
    // the summary call is text-only
    assert!(client.calls()[1].images.is_empty());
}

#[tokio::test]
async fn mindmap_diagram_option() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new().reply(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#),
    ));
    let cfg = PipelineConfig::builder()
        .diagram(DiagramSyntax::Mindmap)
        .build()
        .unwrap();
    let pipeline = Pipeline::with_client(cfg, client);
    let processed = pipeline
        .process_document(&bandgap_contract(), RawDocument::new("d", "t"))
        .await
        .unwrap();
    assert!(processed.graph.diagram.starts_with("mindmap\n"));
}

// ── Batches ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_keeps_input_order_and_isolates_failures() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new()
            .on_prompt_containing("text of doc-2", vec![Ok("Sorry, I cannot help.".into())])
            .fallback(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#),
    ));
    let counting = Arc::new(Counting::default());
    let cfg = PipelineConfig::builder()
        .concurrency(3)
        .progress_callback(counting.clone())
        .build()
        .unwrap();
    let pipeline = Pipeline::with_client(cfg, client);
    let docs: Vec<RawDocument> = (0..5)
        .map(|i| RawDocument::new(format!("doc-{i}"), format!("text of doc-{i}")))
        .collect();

    let run = pipeline.run_batch(&bandgap_contract(), docs).await;
    assert_eq!(run.len(), 5);
    for (i, outcome) in run.outcomes.iter().enumerate() {
        assert_eq!(outcome.index, i);
        assert_eq!(outcome.source_id, format!("doc-{i}"));
        assert!(outcome.trace.last().is_some_and(DocumentState::is_terminal));
        assert_eq!(outcome.is_success(), i != 2, "doc-{i}");
    }
    match &run.outcomes[2].status {
        OutcomeStatus::Failed { stage, error, .. } => {
            assert_eq!(*stage, DocumentState::Extracted);
            assert!(matches!(error, DocumentError::InvalidExtraction { .. }));
        }
        other => panic!("unexpected: {other:?}"),
    }

    assert_eq!(run.stats.total, 5);
    assert_eq!(run.stats.succeeded, 4);
    assert_eq!(run.stats.failed, 1);
    assert_eq!(run.stats.cancelled, 0);
    assert_eq!(counting.starts.load(Ordering::SeqCst), 5);
    assert_eq!(counting.completes.load(Ordering::SeqCst), 4);
    assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
    assert_eq!(counting.run_successes.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn concurrent_batch_results_match_sequential() {
    let script = || {
        summary_rule(ScriptedClient::new())
            .on_prompt_containing("text of doc-1", vec![Err(DispatchError::Auth("revoked".into()))])
            .fallback(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#)
            .with_delay(Duration::from_millis(5))
    };
    let docs = || -> Vec<RawDocument> {
        (0..6)
            .map(|i| RawDocument::new(format!("doc-{i}"), format!("text of doc-{i}")))
            .collect()
    };

    let sequential = Pipeline::with_client(fast_config(), Arc::new(script()))
        .run_batch(&bandgap_contract(), docs())
        .await;
    let parallel_cfg = PipelineConfig::builder()
        .concurrency(4)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    let parallel = Pipeline::with_client(parallel_cfg, Arc::new(script()))
        .run_batch(&bandgap_contract(), docs())
        .await;

    let summary = |run: &litextract::PipelineRun| -> Vec<(String, bool)> {
        run.outcomes
            .iter()
            .map(|o| (o.source_id.clone(), o.is_success()))
            .collect()
    };
    assert_eq!(summary(&sequential), summary(&parallel));
    assert!(!parallel.outcomes[1].is_success());
}

#[tokio::test]
async fn cancellation_records_every_document() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new()
            .fallback(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#)
            .with_delay(Duration::from_millis(100)),
    ));
    let pipeline = Pipeline::with_client(fast_config(), client.clone());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let docs: Vec<RawDocument> = (0..4)
        .map(|i| RawDocument::new(format!("doc-{i}"), "t"))
        .collect();
    let run = pipeline
        .run_batch_with_cancel(&bandgap_contract(), docs, cancel)
        .await;

    assert_eq!(run.len(), 4);
    assert_eq!(run.stats.cancelled, 4);
    assert!(run
        .outcomes
        .iter()
        .all(|o| matches!(o.error(), Some(DocumentError::Cancelled { .. }))));
    // the extraction already in flight finished; nothing new was started
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn empty_batch_is_empty_run() {
    let pipeline = Pipeline::with_client(fast_config(), Arc::new(ScriptedClient::new()));
    let run = pipeline.run_batch(&bandgap_contract(), Vec::new()).await;
    assert!(run.is_empty());
    assert_eq!(run.stats.total, 0);
}

// ── Persistence ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_output_is_written_and_contract_reloads() {
    let client = Arc::new(summary_rule(
        ScriptedClient::new()
            .on_prompt_containing("text of bad", vec![Ok("no json here".into())])
            .fallback(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#),
    ));
    let pipeline = Pipeline::with_client(fast_config(), client);
    let contract = bandgap_contract();
    let docs = vec![
        RawDocument::new("good paper", "text of good"),
        RawDocument::new("bad", "text of bad"),
    ];
    let run = pipeline.run_batch(&contract, docs).await;

    let out = tempfile::tempdir().unwrap();
    write_run(out.path(), &contract, &run).await.unwrap();

    let good = out.path().join("good_paper");
    for file in ["extraction.json", "graph.json", "graph.mmd", "report.md"] {
        assert!(good.join(file).is_file(), "missing {file}");
    }
    assert!(out.path().join("bad").join("error.json").is_file());

    let report = std::fs::read_to_string(good.join("report.md")).unwrap();
    assert!(report.contains("```mermaid"));
    assert!(report.contains("3.37 eV"));

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.path().join(RUN_FILE)).unwrap()).unwrap();
    assert_eq!(manifest["stats"]["succeeded"], json!(1));
    assert_eq!(manifest["documents"][0]["output"], json!("good_paper"));
    assert_eq!(manifest["documents"][1]["succeeded"], json!(false));

    let merged: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.path().join(RESULTS_FILE)).unwrap()).unwrap();
    assert_eq!(merged["results"]["good paper"]["material_name"], json!("ZnO"));
    assert_eq!(merged["succeeded"], json!(1));
    let overview = std::fs::read_to_string(out.path().join(REPORT_FILE)).unwrap();
    assert!(overview.contains("| 2 | bad | failed:"), "{overview}");

    let reloaded = load_contract(&out.path().join(CONTRACT_FILE)).await.unwrap();
    assert_eq!(reloaded, contract);
}

#[tokio::test]
async fn unloadable_directories_are_reported_as_failures() {
    let root = tempfile::tempdir().unwrap();
    let good = root.path().join("zno");
    std::fs::create_dir_all(&good).unwrap();
    std::fs::write(good.join("full.md"), "ZnO has a bandgap of 3.37 eV.").unwrap();
    let missing = root.path().join("not-parsed");
    std::fs::create_dir_all(&missing).unwrap();

    let client = Arc::new(summary_rule(
        ScriptedClient::new().fallback(r#"{"material_name": "ZnO", "bandgap": "3.37 eV"}"#),
    ));
    let pipeline = Pipeline::with_client(fast_config(), client);
    let inputs = load_batch(&[missing, good]).await;
    let run = pipeline.run_inputs(&bandgap_contract(), inputs).await;

    assert_eq!(run.stats.total, 2);
    assert_eq!(run.stats.succeeded, 1);
    assert_eq!(run.outcomes[0].source_id, "not-parsed");
    assert!(matches!(run.outcomes[0].error(), Some(DocumentError::LoadFailed { .. })));
    assert!(run.outcomes[1].is_success());
}
