//! CLI binary for litextract.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs a batch and writes or prints the results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use litextract::document::{discover_document_dirs, load_batch};
use litextract::persist::{load_contract, save_contract, write_run, CONTRACT_FILE};
use litextract::{
    DiagramSyntax, ExtractionContract, OutcomeStatus, Pipeline, PipelineConfig,
    BatchInput, PipelineProgressCallback, ProgressCallback,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished document. Documents may
/// finish out of order when `--concurrency` is above 1.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting from {total} document(s)…"))
        ));
    }

    fn on_document_start(&self, index: usize, _total: usize, source_id: &str) {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, Instant::now());
        self.bar.set_message(source_id.to_string());
    }

    fn on_document_complete(&self, index: usize, total: usize, source_id: &str) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            green("✓"),
            index + 1,
            total,
            source_id,
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, index: usize, total: usize, source_id: &str, error: &str) {
        let secs = self.elapsed_secs(index);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}  {}",
            red("✗"),
            index + 1,
            total,
            source_id,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total: usize, success_count: usize) {
        let failed = total.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} document(s) extracted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} document(s) extracted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract from every parsed paper under papers/ and write results to out/
  litextract -r "material name, synthesis method and bandgap" papers/ -o out

  # Review the synthesized contract before running anything
  litextract -r "material name and bandgap" --contract-only -o out

  # Refine the contract, then reuse it for a second batch
  litextract -r "material name and bandgap" --feedback "bandgap as a number in eV" --contract-only -o out
  litextract --contract out/contract.json more-papers/ -o out2

  # JSON to stdout, four documents at a time, mind-map diagrams
  litextract -r "catalyst and turnover frequency" --json --concurrency 4 --diagram mindmap papers/

DOCUMENT DIRECTORIES:
  A document directory holds full.md (or exactly one *.md file) and an
  optional images/ folder. A directory whose subdirectories are document
  directories is expanded into all of them.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Extract structured data from parsed documents with an LLM.
#[derive(Parser, Debug)]
#[command(
    name = "litextract",
    version,
    about = "Extract structured data from parsed documents using LLMs",
    long_about = "Turn a plain-language requirement into an extraction contract, then apply it \
to every document directory: one multimodal model call per document, JSON repair and \
validation, and a Mermaid summary graph per result.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Parsed-document directories, or directories containing them.
    inputs: Vec<PathBuf>,

    /// What to extract, in plain language.
    #[arg(short, long, env = "LITEXTRACT_REQUIREMENT",
          conflicts_with_all = ["requirement_file", "contract"])]
    requirement: Option<String>,

    /// Read the requirement from a text file.
    #[arg(long, conflicts_with = "contract")]
    requirement_file: Option<PathBuf>,

    /// Reuse a contract saved by an earlier run instead of synthesizing one.
    #[arg(long, env = "LITEXTRACT_CONTRACT")]
    contract: Option<PathBuf>,

    /// Extra guidance used to refine the synthesized contract.
    #[arg(long)]
    feedback: Option<String>,

    /// Synthesize the contract, print or save it, and exit.
    #[arg(long)]
    contract_only: bool,

    /// Write per-document results and run.json into this directory.
    #[arg(short, long, env = "LITEXTRACT_OUTPUT")]
    output: Option<PathBuf>,

    /// Print the whole run as JSON on stdout.
    #[arg(long, env = "LITEXTRACT_JSON")]
    json: bool,

    /// LLM model ID (e.g. gpt-4.1-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Images sent per document (first N in document order).
    #[arg(long, env = "LITEXTRACT_MAX_IMAGES", default_value_t = 5)]
    max_images: usize,

    /// Truncate document text to this many characters.
    #[arg(long, env = "LITEXTRACT_MAX_TEXT_CHARS")]
    max_text_chars: Option<usize>,

    /// Documents processed at once.
    #[arg(short, long, env = "LITEXTRACT_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Total attempts per model call, first try included.
    #[arg(long, env = "LITEXTRACT_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Wait before the first retry, in milliseconds (doubles per retry).
    #[arg(long, env = "LITEXTRACT_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Per-call model timeout in seconds.
    #[arg(long, env = "LITEXTRACT_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Extraction temperature (0.0–2.0).
    #[arg(long, env = "LITEXTRACT_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Max output tokens per model call.
    #[arg(long, env = "LITEXTRACT_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Summary diagram syntax.
    #[arg(long, value_enum, default_value = "flowchart")]
    diagram: DiagramArg,

    /// Path to a text file containing a custom extraction system prompt.
    #[arg(long, env = "LITEXTRACT_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "LITEXTRACT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "LITEXTRACT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "LITEXTRACT_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DiagramArg {
    Flowchart,
    Mindmap,
}

impl From<DiagramArg> for DiagramSyntax {
    fn from(v: DiagramArg) -> Self {
        match v {
            DiagramArg::Flowchart => DiagramSyntax::Flowchart,
            DiagramArg::Mindmap => DiagramSyntax::Mindmap,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.contract_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;
    let pipeline = Pipeline::new(config).context("Failed to set up the model client")?;

    // ── Ctrl-C cancels the run ───────────────────────────────────────────
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} cancelling, waiting for in-flight calls…", cyan("◆"));
            cancel.cancel();
        }
    });

    // ── Contract ─────────────────────────────────────────────────────────
    let contract = obtain_contract(&cli, &pipeline).await?;
    if cli.contract_only {
        match &cli.output {
            Some(dir) => {
                let path = dir.join(CONTRACT_FILE);
                save_contract(&contract, &path)
                    .await
                    .context("Failed to save contract")?;
                if !cli.quiet {
                    eprintln!("{} contract saved to {}", green("✔"), bold(&path.display().to_string()));
                }
            }
            None => println!(
                "{}",
                serde_json::to_string_pretty(contract.as_ref()).context("Failed to serialise contract")?
            ),
        }
        return Ok(());
    }

    // ── Documents ────────────────────────────────────────────────────────
    let inputs = load_inputs(&cli.inputs, cli.quiet).await?;
    if inputs.is_empty() {
        anyhow::bail!("No document directories found in the given inputs");
    }

    let run = pipeline.run_inputs(&contract, inputs).await;

    // ── Output ───────────────────────────────────────────────────────────
    if let Some(dir) = &cli.output {
        write_run(dir, &contract, &run)
            .await
            .with_context(|| format!("Failed to write results to {}", dir.display()))?;
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&run).context("Failed to serialise run")?
        );
    } else if cli.output.is_none() {
        for outcome in &run.outcomes {
            match &outcome.status {
                OutcomeStatus::Succeeded(p) => {
                    println!("{}\t{}", outcome.source_id, p.extraction.data());
                }
                OutcomeStatus::Failed { error, .. } => {
                    println!("{}\terror: {}", outcome.source_id, error);
                }
            }
        }
    }

    if !cli.quiet {
        let stats = &run.stats;
        eprintln!(
            "   {}/{} documents  {} tokens in  /  {} tokens out  —  {}ms total{}",
            stats.succeeded,
            stats.total,
            dim(&stats.total_input_tokens.to_string()),
            dim(&stats.total_output_tokens.to_string()),
            stats.total_duration_ms,
            cli.output
                .as_ref()
                .map(|d| format!("  →  {}", bold(&d.display().to_string())))
                .unwrap_or_default(),
        );
    }

    if run.stats.succeeded == 0 {
        anyhow::bail!("All {} document(s) failed", run.stats.total);
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .max_images(cli.max_images)
        .concurrency(cli.concurrency)
        .max_attempts(cli.max_attempts)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .api_timeout_secs(cli.api_timeout)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .diagram(cli.diagram.into());

    if let Some(n) = cli.max_text_chars {
        builder = builder.max_text_chars(n);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Load a saved contract or synthesize a new one from the requirement.
async fn obtain_contract(cli: &Cli, pipeline: &Pipeline) -> Result<Arc<ExtractionContract>> {
    if let Some(ref path) = cli.contract {
        let contract = load_contract(path).await.context("Failed to load contract")?;
        return Ok(Arc::new(contract));
    }

    let requirement = match (&cli.requirement, &cli.requirement_file) {
        (Some(r), _) => r.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read requirement from {:?}", path))?,
        (None, None) => anyhow::bail!("Provide --requirement, --requirement-file or --contract"),
    };

    if !cli.quiet {
        eprintln!("{} synthesizing extraction contract…", cyan("◆"));
    }
    let contract = pipeline
        .synthesize_contract(&requirement, cli.feedback.as_deref())
        .await
        .context("Contract synthesis failed")?;
    if !cli.quiet {
        eprintln!(
            "{} contract ready: {} field(s), {} criteria",
            green("✔"),
            bold(&contract.target_schema().len().to_string()),
            contract.validation_criteria().len()
        );
    }
    Ok(contract)
}

/// Expand every input into document directories and load them.
///
/// A directory that fails to load stays in the batch as an unreadable
/// input, so it is reported as a failed document rather than dropped.
async fn load_inputs(inputs: &[PathBuf], quiet: bool) -> Result<Vec<BatchInput>> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for input in inputs {
        let children = discover_document_dirs(input)
            .await
            .with_context(|| format!("Cannot read {}", input.display()))?;
        if children.is_empty() {
            dirs.push(input.clone());
        } else {
            dirs.extend(children);
        }
    }

    let loaded = load_batch(&dirs).await;
    if !quiet {
        for input in &loaded {
            if let BatchInput::Unreadable { source_id, detail } = input {
                eprintln!("{} cannot load {}: {}", red("✗"), source_id, detail);
            }
        }
    }
    Ok(loaded)
}
