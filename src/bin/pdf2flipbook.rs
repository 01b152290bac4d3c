//! CLI binary for pdf2flipbook.
//!
//! A thin shim over the library crate: maps flags to `GenerationConfig`,
//! keeps artifacts in a directory-backed store between invocations, and
//! renders run progress with indicatif.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2flipbook::{
    DirectorySink, Engine, FileStore, GenerationConfig, ProgressHandle, ProgressObserver,
    ProgressState, RetryPolicy, RunKind, StatusValue,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
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
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished item. Items in a
/// fan-out stage finish out of order; lines are printed as they land.
struct CliProgress {
    bar: ProgressBar,
    started: Mutex<HashMap<String, Instant>>,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            started: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, key: &str) -> String {
        let secs = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressObserver for CliProgress {
    fn on_run_start(&self, run: RunKind, snapshot: &ProgressState) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len}  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_style(style);
        self.bar.set_length(snapshot.total as u64);
        self.bar.set_position(snapshot.current as u64);
        self.bar.set_prefix(match run {
            RunKind::Images => "Images",
            RunKind::Videos => "Videos",
        });
        self.bar.reset_eta();
    }

    fn on_transition(&self, _run: RunKind, key: &str, snapshot: &ProgressState) {
        match snapshot.status.get(key) {
            Some(StatusValue::Generating) => {
                self.started
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string(), Instant::now());
                self.bar.set_message(key.to_string());
            }
            Some(StatusValue::Retrying { attempt, max }) => {
                self.bar.println(format!(
                    "  {} {:<14} attempt {}/{} failed, retrying",
                    yellow("↻"),
                    key,
                    attempt,
                    max
                ));
            }
            Some(StatusValue::Complete) => {
                self.bar
                    .println(format!("  {} {:<14} {}", green("✓"), key, self.elapsed(key)));
            }
            Some(StatusValue::Failed) => {
                self.bar
                    .println(format!("  {} {:<14} {}", red("✗"), key, self.elapsed(key)));
            }
            Some(StatusValue::Pending) | None => {}
        }
        self.bar.set_position(snapshot.current as u64);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Rasterise a PDF into the store (clears earlier results)
  pdf2flipbook extract book.pdf

  # Generate the cover and every spread, saving files to ./out
  pdf2flipbook --output-dir out images

  # Generate the opening clip and page flips, three at a time
  pdf2flipbook --flip-batch-width 3 --output-dir out videos

  # Redo one failed item
  pdf2flipbook regenerate spread-4
  pdf2flipbook regenerate spread-2-3

  # Where are we?
  pdf2flipbook status

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY            Image generation key
  REPLICATE_API_TOKEN       Video generation token
  PDF2FLIPBOOK_STORE_DIR    Artifact store directory (default .pdf2flipbook)
  PDF2FLIPBOOK_OUTPUT_DIR   Auto-download directory
  PDFIUM_LIB_PATH           Path to libpdfium (otherwise the system library,
                            or a cached download with --features auto-pdfium)
"#;

/// Turn a PDF into AI-generated spread images and page-flip videos.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2flipbook",
    version,
    about = "Turn a PDF into AI-generated spread images and page-flip videos",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding extracted pages and generation records.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_STORE_DIR", default_value = ".pdf2flipbook")]
    store_dir: PathBuf,

    /// Save every finished artifact into this directory.
    #[arg(short, long, global = true, env = "PDF2FLIPBOOK_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Image generation API key.
    #[arg(long, global = true, env = "GEMINI_API_KEY", hide_env_values = true)]
    image_api_key: Option<String>,

    /// Video generation API token.
    #[arg(long, global = true, env = "REPLICATE_API_TOKEN", hide_env_values = true)]
    video_api_key: Option<String>,

    /// Image API base URL (e.g. a proxy that attaches credentials).
    #[arg(long, global = true, env = "PDF2FLIPBOOK_IMAGE_API_BASE")]
    image_api_base: Option<String>,

    /// Video API base URL.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_VIDEO_API_BASE")]
    video_api_base: Option<String>,

    /// Image model ID.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_IMAGE_MODEL")]
    image_model: Option<String>,

    /// Video model as owner/name.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_VIDEO_MODEL")]
    video_model: Option<String>,

    /// Image aspect ratio, e.g. 1:1 or 4:3.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_IMAGE_ASPECT_RATIO")]
    image_aspect_ratio: Option<String>,

    /// Image size tier, e.g. 1K or 2K.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_IMAGE_SIZE")]
    image_size: Option<String>,

    /// Video resolution, e.g. 720p or 1080p.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_VIDEO_RESOLUTION")]
    video_resolution: Option<String>,

    /// Video aspect ratio.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_VIDEO_ASPECT_RATIO")]
    video_aspect_ratio: Option<String>,

    /// Video frame rate.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_VIDEO_FPS")]
    video_fps: Option<u32>,

    /// Opening clip length in seconds.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_OPENING_DURATION")]
    opening_duration: Option<u32>,

    /// Page-flip clip length in seconds.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_FLIP_DURATION")]
    flip_duration: Option<u32>,

    /// Page-flip videos generated concurrently per batch.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_FLIP_BATCH_WIDTH", default_value_t = 5)]
    flip_batch_width: usize,

    /// Attempts per item, including the first.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Per-request API timeout in seconds.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "PDF2FLIPBOOK_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2FLIPBOOK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2FLIPBOOK_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rasterise a PDF (path or URL) and make it the current document.
    Extract {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
    },
    /// Generate the cover and every spread image.
    Images,
    /// Generate the opening clip and every page-flip video.
    Videos,
    /// Regenerate one image (cover, spread-N) or video (opening, spread-N-M).
    Regenerate {
        key: String,
    },
    /// Show image and video progress.
    Status {
        /// Print the progress snapshots as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Clear every stored artifact.
    Reset,
}

impl Command {
    fn shows_progress(&self) -> bool {
        matches!(self, Command::Images | Command::Videos | Command::Regenerate { .. })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar gives all the feedback that matters; INFO logs would tear it.
    let show_progress = !cli.quiet && !cli.no_progress && cli.command.shows_progress();
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

    let progress = show_progress.then(CliProgress::new);
    let engine = build_engine(&cli, progress.clone())?;

    let outcome = run(&cli, &engine).await;
    if let Some(p) = &progress {
        p.finish();
    }
    outcome?;

    if !cli.quiet && cli.command.shows_progress() {
        print_summary(&engine);
    }
    Ok(())
}

async fn run(cli: &Cli, engine: &Engine) -> Result<()> {
    match &cli.command {
        Command::Extract { input } => {
            #[cfg(feature = "auto-pdfium")]
            ensure_pdf_engine(cli.quiet)?;
            let pages = engine
                .ingest(input)
                .await
                .with_context(|| format!("Failed to extract pages from {input}"))?;
            if !cli.quiet {
                eprintln!(
                    "{} {} pages → {} spreads  {}",
                    green("✔"),
                    bold(&pages.len().to_string()),
                    bold(&pages.spread_count().to_string()),
                    dim(&cli.store_dir.display().to_string()),
                );
            }
        }
        Command::Images => {
            let pages = engine
                .artifacts()
                .load_pages()
                .await
                .context("Failed to read the store")?
                .context("No extracted pages; run `pdf2flipbook extract <pdf>` first")?;
            engine
                .run_image_generation(&pages)
                .await
                .context("Image generation stopped")?;
        }
        Command::Videos => {
            let images = engine
                .artifacts()
                .load_images()
                .await
                .context("Failed to read the store")?;
            if images.is_empty() {
                anyhow::bail!("No generated images; run `pdf2flipbook images` first");
            }
            engine
                .run_video_generation(&images)
                .await
                .context("Video generation stopped")?;
        }
        Command::Regenerate { key } => {
            engine
                .regenerate_one(key)
                .await
                .with_context(|| format!("Failed to regenerate {key}"))?;
        }
        Command::Status { json } => print_status(engine, *json).await?,
        Command::Reset => {
            engine
                .start_over()
                .await
                .context("Failed to clear the store")?;
            if !cli.quiet {
                eprintln!("{} store cleared", green("✔"));
            }
        }
    }
    Ok(())
}

/// Download libpdfium once, with a byte-level progress bar.
#[cfg(feature = "auto-pdfium")]
fn ensure_pdf_engine(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {bytes}/{total_bytes}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    bar.set_prefix("PDF engine");
    bar.enable_steady_tick(Duration::from_millis(80));

    let progress = bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                progress.set_length(t);
            }
            progress.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;
    bar.finish_and_clear();
    Ok(())
}

/// Map CLI args to an `Engine`.
fn build_engine(cli: &Cli, progress: Option<Arc<CliProgress>>) -> Result<Engine> {
    let retry = RetryPolicy {
        max_attempts: cli.max_attempts,
        ..RetryPolicy::default()
    };
    let mut builder = GenerationConfig::builder()
        .image_retry(retry)
        .video_retry(retry)
        .flip_batch_width(cli.flip_batch_width)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref key) = cli.image_api_key {
        builder = builder.image_api_key(key);
    }
    if let Some(ref key) = cli.video_api_key {
        builder = builder.video_api_key(key);
    }
    if let Some(ref base) = cli.image_api_base {
        builder = builder.image_api_base(base);
    }
    if let Some(ref base) = cli.video_api_base {
        builder = builder.video_api_base(base);
    }
    if let Some(ref model) = cli.image_model {
        builder = builder.image_model(model);
    }
    if let Some(ref model) = cli.video_model {
        builder = builder.video_model(model);
    }
    if let Some(ref ratio) = cli.image_aspect_ratio {
        builder = builder.image_aspect_ratio(ratio);
    }
    if let Some(ref size) = cli.image_size {
        builder = builder.image_size(size);
    }
    if let Some(ref resolution) = cli.video_resolution {
        builder = builder.video_resolution(resolution);
    }
    if let Some(ref ratio) = cli.video_aspect_ratio {
        builder = builder.video_aspect_ratio(ratio);
    }
    if let Some(fps) = cli.video_fps {
        builder = builder.video_fps(fps);
    }
    if let Some(secs) = cli.opening_duration {
        builder = builder.opening_duration_secs(secs);
    }
    if let Some(secs) = cli.flip_duration {
        builder = builder.flip_duration_secs(secs);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd);
    }
    let config = builder.build().context("Invalid configuration")?;

    let mut engine = Engine::builder(config).store(Arc::new(FileStore::new(&cli.store_dir)));
    if let Some(ref dir) = cli.output_dir {
        let sink = DirectorySink::new(dir, cli.download_timeout)
            .context("Failed to set up the output directory")?;
        engine = engine.sink(Arc::new(sink));
    }
    if let Some(p) = progress {
        engine = engine.observer(p as ProgressHandle);
    }
    engine.build().context("Failed to set up generation clients")
}

async fn print_status(engine: &Engine, json: bool) -> Result<()> {
    let images = engine
        .tracker(RunKind::Images)
        .await
        .context("Failed to read image progress")?
        .map(|t| t.snapshot());
    let videos = engine
        .tracker(RunKind::Videos)
        .await
        .context("Failed to read video progress")?
        .map(|t| t.snapshot());

    if json {
        let value = serde_json::json!({ "images": images, "videos": videos });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise progress")?
        );
        return Ok(());
    }

    for (label, state) in [("Images", &images), ("Videos", &videos)] {
        match state {
            None => println!("{}  {}", bold(label), dim("nothing to generate yet")),
            Some(s) => {
                println!("{}  {}/{}", bold(label), s.current, s.total);
                for (key, status) in &s.status {
                    let mark = match status {
                        StatusValue::Complete => green("✓"),
                        StatusValue::Failed => red("✗"),
                        StatusValue::Pending => dim("·"),
                        _ => yellow("…"),
                    };
                    println!("  {mark} {key:<14} {status}");
                }
            }
        }
    }
    Ok(())
}

fn print_summary(engine: &Engine) {
    for run in [RunKind::Images, RunKind::Videos] {
        let snapshot = match run {
            RunKind::Images => engine.image_progress(),
            RunKind::Videos => engine.video_progress(),
        };
        let Some(s) = snapshot else { continue };
        let failed = s.failed_keys();
        if failed.is_empty() {
            eprintln!("{} {}/{} {}s complete", green("✔"), s.current, s.total, run);
        } else {
            eprintln!(
                "{} {}/{} {}s complete  ({} failed: {})",
                yellow("⚠"),
                s.current,
                s.total,
                run,
                failed.len(),
                red(&failed.join(", ")),
            );
            eprintln!(
                "   {}",
                dim("retry with `pdf2flipbook regenerate <key>`")
            );
        }
    }
}
