//! CLI binary for edgequake-dispatch.
//!
//! A thin shim over the library crate: maps CLI flags to
//! `DispatcherConfig`, submits every input through one dispatcher, and
//! writes the results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_dispatch::{
    input, ConversionOutcome, ConversionResponse, DispatchObserver, Dispatcher, DispatcherConfig,
    InitMode, JobId, JobState, OcrBackend, OcrSettings, OcrTrigger, PageSeparator, PdfiumLoader,
};
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

// ── Progress observer ────────────────────────────────────────────────────────

/// One bar for the whole batch; a log line per finished job.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new(total: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} jobs  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl DispatchObserver for CliObserver {
    fn on_transition(&self, job: JobId, _from: JobState, to: JobState) {
        if to == JobState::Running {
            self.bar.set_message(format!("running {}", short(job)));
        }
    }

    fn on_job_finished(&self, job: JobId, outcome: &ConversionOutcome) {
        let line = match outcome {
            ConversionOutcome::Success { stats, .. } => format!(
                "  {} {}  {} pages  {}",
                green("✓"),
                short(job),
                stats.total_pages,
                dim(&format!(
                    "{} ocr, {} failed, {:.1}s",
                    stats.ocr_pages,
                    stats.failed_pages,
                    stats.total_duration_ms as f64 / 1000.0
                )),
            ),
            ConversionOutcome::Failure { kind, message } => {
                let first = message.lines().next().unwrap_or_default();
                format!("  {} {}  {}: {}", red("✗"), short(job), kind, red(first))
            }
            ConversionOutcome::TimedOut { deadline_ms } => {
                format!("  {} {}  deadline of {}ms exceeded", yellow("⏱"), short(job), deadline_ms)
            }
            ConversionOutcome::Cancelled => format!("  {} {}  cancelled", yellow("∅"), short(job)),
        };
        self.bar.println(line);
        self.bar.inc(1);
    }
}

fn short(job: JobId) -> String {
    job.to_string().chars().take(8).collect()
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document to stdout
  pdf2md-dispatch report.pdf

  # Convert a batch, two at a time, into a directory
  pdf2md-dispatch -c 2 -o out/ a.pdf b.pdf https://arxiv.org/pdf/1706.03762

  # JSON responses, one line per input, 30 s per document
  pdf2md-dispatch --json --deadline 30 *.pdf

  # Text layer only, never OCR
  pdf2md-dispatch --ocr off scan.pdf

ENVIRONMENT VARIABLES:
  PDF2MD_PDFIUM_DIR       Directory holding libpdfium (default: system library)
  OPENAI_API_KEY          OpenAI API key (OCR fallback)
  ANTHROPIC_API_KEY       Anthropic API key (OCR fallback)
  EDGEQUAKE_LLM_PROVIDER  Override OCR provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override OCR model ID
  RUST_LOG                Log filter, e.g. edgequake_dispatch=debug
"#;

/// Convert PDF files and URLs through one shared, bounded conversion service.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-dispatch",
    version,
    about = "Convert PDF files and URLs to text with bounded concurrency and per-document deadlines",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file paths or HTTP/HTTPS URLs.
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<String>,

    /// Write one `<name>.md` per input into this directory instead of stdout.
    #[arg(short, long, env = "PDF2MD_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Print one JSON response per input instead of Markdown.
    #[arg(long, env = "PDF2MD_JSON")]
    json: bool,

    /// Conversions allowed to hold the model at once.
    #[arg(short = 'c', long, env = "PDF2MD_MAX_CONCURRENT", default_value_t = 2)]
    max_concurrent: usize,

    /// Per-document deadline in seconds, queueing included.
    #[arg(long, env = "PDF2MD_DEADLINE", default_value_t = 120)]
    deadline: u64,

    /// Async worker threads.
    #[arg(long, env = "PDF2MD_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Load the model on the first job instead of at startup.
    #[arg(long, env = "PDF2MD_LAZY_INIT")]
    lazy_init: bool,

    /// How long abandoned work may take to stop, in milliseconds.
    #[arg(long, env = "PDF2MD_CANCEL_GRACE_MS", default_value_t = 5_000)]
    cancel_grace_ms: u64,

    /// Directory holding the pdfium shared library.
    #[arg(long, env = "PDF2MD_PDFIUM_DIR")]
    pdfium_dir: Option<PathBuf>,

    /// OCR engine: auto, vision, off.
    #[arg(long, env = "PDF2MD_OCR", value_enum, default_value = "auto")]
    ocr: OcrArg,

    /// When to OCR a page: a minimum character count, "empty", or "never".
    #[arg(long, env = "PDF2MD_OCR_TRIGGER", default_value = "50")]
    ocr_trigger: String,

    /// Concurrent OCR calls within one document.
    #[arg(long, env = "PDF2MD_OCR_CONCURRENCY", default_value_t = 4)]
    ocr_concurrency: usize,

    /// Longest edge, in pixels, of pages rendered for OCR.
    #[arg(long, env = "PDF2MD_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// OCR provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// OCR model ID (e.g. gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// OCR temperature (0.0–2.0).
    #[arg(long, env = "PDF2MD_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Max OCR output tokens per page.
    #[arg(long, env = "PDF2MD_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Per-page OCR call timeout in seconds.
    #[arg(long, env = "PDF2MD_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Path to a text file containing a custom OCR prompt.
    #[arg(long, env = "PDF2MD_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "PDF2MD_SEPARATOR", default_value = "none")]
    separator: String,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2MD_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "PDF2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2MD_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum OcrArg {
    Auto,
    Vision,
    Off,
}

impl From<OcrArg> for OcrBackend {
    fn from(v: OcrArg) -> Self {
        match v {
            OcrArg::Auto => OcrBackend::Auto,
            OcrArg::Vision => OcrBackend::Vision,
            OcrArg::Off => OcrBackend::Disabled,
        }
    }
}

/// One JSON output line.
#[derive(Serialize)]
struct JsonLine<'a> {
    input: &'a str,
    #[serde(flatten)]
    response: ConversionResponse,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would fight the progress bar; the bar's own lines
    // carry the per-job feedback.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match run(cli, show_progress) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(true)` when every input converted successfully.
fn run(cli: Cli, show_progress: bool) -> Result<bool> {
    let config = build_config(&cli)?;
    let runtime = config.build_runtime().context("Failed to start runtime")?;
    runtime.block_on(run_batch(cli, config, show_progress))
}

async fn run_batch(cli: Cli, config: DispatcherConfig, show_progress: bool) -> Result<bool> {
    let loader = Arc::new(PdfiumLoader::new(config.model_path.clone(), config.ocr.clone()));
    let separator = config.page_separator.clone();

    let mut dispatcher = Dispatcher::start(config, loader)
        .await
        .context("Parsing model failed to start")?;
    let observer = show_progress.then(|| CliObserver::new(cli.inputs.len()));
    if let Some(ref obs) = observer {
        dispatcher = dispatcher.with_observer(Arc::clone(obs) as Arc<dyn DispatchObserver>);
    }
    let dispatcher = Arc::new(dispatcher);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", yellow("Interrupted, cancelling jobs…"));
            on_signal.cancel();
        }
    });

    let download_timeout = cli.download_timeout;
    let conversions = cli.inputs.iter().map(|source| {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        async move {
            let outcome = match input::load_job(source, download_timeout).await {
                Ok(job) => {
                    let id = job.id();
                    (id, dispatcher.submit_with_cancel(job, cancel).await)
                }
                Err(e) => (JobId::new(), ConversionOutcome::failure(e.kind(), e.to_string())),
            };
            (source.as_str(), outcome)
        }
    });
    let finished = join_all(conversions).await;

    if let Some(obs) = observer {
        obs.bar.finish_and_clear();
    }

    let mut all_ok = true;
    let mut used_names = HashSet::new();
    let stdout = io::stdout();
    let multiple = finished.len() > 1;

    for (source, (job_id, outcome)) in finished {
        all_ok &= outcome.is_success();

        if cli.json {
            let line = JsonLine {
                input: source,
                response: outcome.into_response(job_id),
            };
            let json = serde_json::to_string(&line).context("Failed to serialise response")?;
            writeln!(stdout.lock(), "{json}").context("Failed to write to stdout")?;
            continue;
        }

        let Some(result) = outcome.result() else {
            if !show_progress && !cli.quiet {
                let reason = match &outcome {
                    ConversionOutcome::Failure { message, .. } => message.clone(),
                    ConversionOutcome::TimedOut { deadline_ms } => format!("deadline of {deadline_ms}ms exceeded"),
                    _ => "cancelled".to_string(),
                };
                eprintln!("{} {}: {}", red("✗"), source, reason);
            }
            continue;
        };
        let markdown = result.to_markdown(&separator);

        match cli.output_dir {
            Some(ref dir) => {
                let name = unique_name(&input::output_stem(source), &mut used_names);
                let path = dir.join(format!("{name}.md"));
                write_atomic(&path, markdown.as_bytes()).await?;
                if !cli.quiet {
                    eprintln!("{} {} → {}", green("✔"), source, path.display());
                }
            }
            None => {
                let mut handle = stdout.lock();
                if multiple {
                    writeln!(handle, "<!-- source: {source} -->").context("Failed to write to stdout")?;
                }
                handle
                    .write_all(markdown.as_bytes())
                    .context("Failed to write to stdout")?;
            }
        }
    }

    if !cli.quiet && !cli.json {
        let snap = dispatcher.gate().snapshot();
        eprintln!(
            "{}",
            dim(&format!(
                "{} jobs, peak {} concurrent of {}",
                snap.acquired, snap.peak_in_flight, snap.capacity
            ))
        );
    }

    Ok(all_ok)
}

/// Map CLI args to `DispatcherConfig`.
fn build_config(cli: &Cli) -> Result<DispatcherConfig> {
    let system_prompt = match cli.system_prompt {
        Some(ref path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        ),
        None => None,
    };

    let ocr = OcrSettings {
        backend: cli.ocr.clone().into(),
        provider_name: cli.provider.clone(),
        model: cli.model.clone(),
        temperature: cli.temperature,
        max_tokens: cli.max_tokens,
        api_timeout_secs: cli.api_timeout,
        system_prompt,
    };

    let mut builder = DispatcherConfig::builder()
        .max_concurrent_conversions(cli.max_concurrent)
        .per_job_deadline(Duration::from_secs(cli.deadline))
        .worker_count(cli.workers)
        .init_mode(if cli.lazy_init { InitMode::Lazy } else { InitMode::Eager })
        .cancel_grace(Duration::from_millis(cli.cancel_grace_ms))
        .ocr_trigger(parse_trigger(&cli.ocr_trigger)?)
        .ocr_concurrency(cli.ocr_concurrency)
        .max_rendered_pixels(cli.max_pixels)
        .page_separator(parse_separator(&cli.separator))
        .ocr(ocr);

    if let Some(ref dir) = cli.pdfium_dir {
        builder = builder.model_path(dir);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--ocr-trigger` into an [`OcrTrigger`].
fn parse_trigger(s: &str) -> Result<OcrTrigger> {
    match s.trim().to_lowercase().as_str() {
        "empty" => Ok(OcrTrigger::NoTextLayer),
        "never" | "off" => Ok(OcrTrigger::Never),
        n => {
            let chars: usize = n
                .parse()
                .with_context(|| format!("Invalid --ocr-trigger '{s}': expected a number, 'empty' or 'never'"))?;
            Ok(OcrTrigger::MinChars(chars))
        }
    }
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}

fn unique_name(stem: &str, used: &mut HashSet<String>) -> String {
    let mut name = stem.to_string();
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{stem}-{n}");
        n += 1;
    }
    name
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.md".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move output into place at {}", path.display()))?;
    Ok(())
}
