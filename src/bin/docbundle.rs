//! CLI binary for docbundle.
//!
//! `serve` runs the HTTP job service with its cleanup loop; `convert` runs
//! the same pipeline once, in process, and writes the bundle to disk.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docbundle::pipeline::docling::DoclingEngine;
use docbundle::pipeline::input::resolve_input;
use docbundle::store::IMAGES_DIR;
use docbundle::{
    archive, server, AcceleratorDevice, CleanupScheduler, ConversionPipeline, JobService,
    ProcessingOptions, ServiceConfig, TableFormat,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
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

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the HTTP service on the default port
  docbundle serve

  # Keep results for six hours, allow 100 MB uploads
  docbundle serve --ttl-hours 6 --max-file-size-mb 100

  # One-off conversion of a local file
  docbundle convert report.docx -o report.zip

  # Scanned PDF from a URL, OCR every page
  docbundle convert https://example.org/scan.pdf --force-ocr

HTTP API:
  POST /documents/process              multipart: file, force_ocr, table_format
  GET  /documents/{task_id}/status     pending | processing | completed | failed
  GET  /documents/{task_id}/download   application/zip once completed

EXTERNAL TOOLS:
  docling   document conversion and OCR (tesseract)
  soffice   LibreOffice, only needed for .doc and .xls uploads

ENVIRONMENT VARIABLES:
  Every flag has a DOCBUNDLE_* counterpart, e.g. DOCBUNDLE_PORT=9000.
  A .env file in the working directory is loaded first.
  RUST_LOG overrides the log filter.
"#;

#[derive(Parser, Debug)]
#[command(
    name = "docbundle",
    version,
    about = "Convert documents to Markdown + images bundles",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, global = true, env = "DOCBUNDLE_VERBOSE")]
    verbose: bool,

    #[arg(short, long, global = true, env = "DOCBUNDLE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP job service.
    Serve(ServeArgs),
    /// Convert a single document and write the zip bundle.
    Convert(ConvertArgs),
}

/// Engine and bridge settings shared by both commands.
#[derive(Args, Debug)]
struct EngineArgs {
    #[arg(long, env = "DOCBUNDLE_ACCELERATOR", default_value = "cpu")]
    accelerator: AcceleratorDevice,

    #[arg(long, env = "DOCBUNDLE_NUM_THREADS", default_value_t = 4)]
    num_threads: usize,

    /// Comma-separated tesseract language codes.
    #[arg(long, env = "DOCBUNDLE_OCR_LANGS", default_value = "rus,eng", value_delimiter = ',')]
    ocr_langs: Vec<String>,

    #[arg(long, env = "DOCBUNDLE_DOCLING", default_value = "docling")]
    docling: PathBuf,

    #[arg(long, env = "DOCBUNDLE_SOFFICE", default_value = "soffice")]
    soffice: PathBuf,

    #[arg(long, env = "DOCBUNDLE_BRIDGE_TIMEOUT", default_value_t = 60)]
    bridge_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "DOCBUNDLE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "DOCBUNDLE_PORT", default_value_t = 8000)]
    port: u16,

    #[arg(long, env = "DOCBUNDLE_STORAGE_ROOT", default_value = "/tmp/docbundle")]
    storage_root: PathBuf,

    #[arg(long, env = "DOCBUNDLE_TTL_HOURS", default_value_t = 24)]
    ttl_hours: u64,

    #[arg(long, env = "DOCBUNDLE_MAX_FILE_SIZE_MB", default_value_t = 50)]
    max_file_size_mb: u64,

    #[arg(long, env = "DOCBUNDLE_MAX_CONCURRENT_JOBS", default_value_t = 2)]
    max_concurrent_jobs: usize,

    #[arg(long, env = "DOCBUNDLE_CLEANUP_INTERVAL", default_value_t = 3600)]
    cleanup_interval_secs: u64,

    #[arg(long, env = "DOCBUNDLE_CLEANUP_RETRY", default_value_t = 300)]
    cleanup_retry_secs: u64,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local path or http(s) URL.
    input: String,

    /// Output zip. Default: `<input-stem>.zip` in the current directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    force_ocr: bool,

    #[arg(long, default_value = "auto")]
    table_format: TableFormat,

    #[arg(long, env = "DOCBUNDLE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    #[arg(long)]
    no_progress: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = matches!(&cli.command, Command::Convert(a) if !a.no_progress) && !cli.quiet;
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

    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Convert(args) => run_convert(args, show_progress, cli.quiet).await,
    }
}

fn apply_engine(
    builder: docbundle::ServiceConfigBuilder,
    engine: &EngineArgs,
) -> docbundle::ServiceConfigBuilder {
    builder
        .accelerator(engine.accelerator)
        .num_threads(engine.num_threads)
        .ocr_languages(engine.ocr_langs.iter().map(|l| l.trim().to_string()))
        .engine_program(&engine.docling)
        .bridge_program(&engine.soffice)
        .bridge_timeout(Duration::from_secs(engine.bridge_timeout_secs))
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = apply_engine(ServiceConfig::builder(), &args.engine)
        .host(&args.host)
        .port(args.port)
        .storage_root(&args.storage_root)
        .ttl_hours(args.ttl_hours)
        .max_upload_mb(args.max_file_size_mb)
        .max_concurrent_jobs(args.max_concurrent_jobs)
        .cleanup_interval(Duration::from_secs(args.cleanup_interval_secs))
        .cleanup_retry_interval(Duration::from_secs(args.cleanup_retry_secs))
        .build()
        .context("Invalid configuration")?;

    probe_engine(&config).await;

    let service = Arc::new(JobService::from_config(config.clone()).context("Failed to open storage")?);
    let cleanup = CleanupScheduler::new(
        Arc::clone(service.store()),
        config.ttl,
        config.cleanup_interval,
        config.cleanup_retry_interval,
    )
    .spawn();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        "docbundle {} serving from {}",
        env!("CARGO_PKG_VERSION"),
        config.storage_root.display()
    );
    server::serve(Arc::clone(&service), listener, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    cleanup.shutdown().await;
    service.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Log whether the conversion engine can be launched. Never fatal: jobs
/// fail individually with the launch error instead.
async fn probe_engine(config: &ServiceConfig) {
    let engine = DoclingEngine::new("probe", &config.engine_program, config.pipeline_options(false));
    match tokio::task::spawn_blocking(move || engine.probe()).await {
        Ok(Ok(version)) => tracing::info!("Conversion engine: {}", version),
        Ok(Err(e)) => tracing::warn!("Conversion engine unavailable: {}", e),
        Err(e) => tracing::warn!("Engine probe did not finish: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining");
}

async fn run_convert(args: ConvertArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let started = Instant::now();
    let resolved = resolve_input(&args.input, args.download_timeout)
        .await
        .context("Failed to resolve input")?;

    let output = match args.output {
        Some(p) => p,
        None => default_output(resolved.path()),
    };

    let work = tempfile::Builder::new()
        .prefix("docbundle-")
        .tempdir()
        .context("Failed to create working directory")?;
    let config = apply_engine(ServiceConfig::builder(), &args.engine)
        .storage_root(work.path())
        .build()
        .context("Invalid configuration")?;
    let pipeline = ConversionPipeline::from_config(&config);

    let bundle_dir = work.path().join("bundle");
    tokio::fs::create_dir_all(bundle_dir.join(IMAGES_DIR))
        .await
        .context("Failed to create bundle directory")?;

    let bar = show_progress.then(|| spinner(resolved.path()));
    let options = ProcessingOptions {
        force_ocr: args.force_ocr,
        table_format: args.table_format,
    };

    let result = async {
        let document = pipeline
            .process(resolved.path(), &bundle_dir, &options)
            .await
            .context("Conversion failed")?;
        if let Some(bar) = &bar {
            bar.set_message("packaging…");
        }
        let archive = archive::pack(&bundle_dir).await.context("Packaging failed")?;
        tokio::fs::copy(&archive, &output)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
        anyhow::Ok(document)
    }
    .await;

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    match result {
        Ok(document) => {
            if !quiet {
                let pages = document
                    .page_count
                    .map(|p| format!("{p} pages  "))
                    .unwrap_or_default();
                eprintln!(
                    "{}  {}{} images  {}ms  →  {}",
                    green("✔"),
                    pages,
                    document.image_count,
                    started.elapsed().as_millis(),
                    bold(&output.display().to_string()),
                );
            }
            Ok(())
        }
        Err(e) => {
            if !quiet {
                eprintln!("{} {}", red("✘"), dim(&args.input));
            }
            Err(e)
        }
    }
}

fn spinner(input: &Path) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    bar.set_prefix("Converting");
    bar.set_message(
        input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    PathBuf::from(format!("{stem}.zip"))
}
