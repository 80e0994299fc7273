//! rcx: encrypted key-ring chunk transfers
//!
//! Commands:
//!   seal <file>             - split, encrypt and publish a file as a key ring
//!   pull <resource-hash>    - download and decrypt a published ring
//!   push <file>             - resumable upload of plaintext chunks
//!   list                    - persisted transfers with status and progress
//!   resume <id>             - continue a paused or failed transfer
//!   cancel <id>             - abort a transfer and discard its state
//!   cleanup [--days n]      - sweep expired transfer state
//!   config show             - print the merged configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use prometheus_client::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use rcx_core::config::{expand_tilde, RcxConfig};
use rcx_core::types::{DestinationStrategy, TransferDirection, TransferStatus, TransferTask};
use rcx_crypto::Algorithm;
use rcx_storage::{build_operator, Credentials, OperatorTransport};
use rcx_transfer::metrics::render;
use rcx_transfer::writer::{output_path, sanitize_file_name};
use rcx_transfer::{
    DirSinkFactory, DownloadRequest, ManifestLocations, Orchestrator, SinkOutput, StoreBackend,
    TransferContext, TransferEvent, TransferMetrics, TransferStore,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "rcx",
    version,
    about = "Encrypted key-ring chunk transfers",
    long_about = "rcx: seal files into encrypted key rings and move them with resumable transfers"
)]
struct Cli {
    /// Path to the rcx TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "RCX_CONFIG",
        default_value = "~/.config/rcx/config.toml"
    )]
    config: PathBuf,

    /// Log level or filter directive (overrides [log] level)
    #[arg(long, env = "RCX_LOG")]
    log: Option<String>,

    /// Log format (overrides [log] format)
    #[arg(long, env = "RCX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Print transfer metrics in Prometheus text format when done
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Cipher {
    /// AES-256-GCM
    AesGcm,
    /// ChaCha20-Poly1305
    Chacha20,
}

impl From<Cipher> for Algorithm {
    fn from(c: Cipher) -> Self {
        match c {
            Cipher::AesGcm => Algorithm::Aes256Gcm,
            Cipher::Chacha20 => Algorithm::ChaCha20Poly1305,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split a file, encrypt it into a key ring and publish frames + manifest
    Seal {
        /// Local file to seal
        file: PathBuf,
        /// Storage prefix (default: [storage] prefix)
        #[arg(long, short = 'p')]
        prefix: Option<String>,
        #[arg(long, default_value = "aes-gcm")]
        algorithm: Cipher,
        /// Plaintext bytes per chunk (default: [transfer] chunk_size)
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Download and decrypt a published resource
    Pull {
        /// Resource hash printed by `rcx seal`
        resource_hash: String,
        /// Directory the file is written to
        #[arg(long, short = 'o', default_value = ".")]
        out: PathBuf,
        #[arg(long, short = 'p')]
        prefix: Option<String>,
        /// Decrypt straight into the output file regardless of size
        #[arg(long)]
        streaming: bool,
        /// Replace an existing file of the same name instead of writing
        /// alongside it
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Upload a local file as plaintext chunks (resumable)
    ///
    /// S3 credentials are read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY.
    Push {
        file: PathBuf,
        #[arg(long, short = 'p')]
        prefix: Option<String>,
    },

    /// List persisted transfers that have not completed
    List,

    /// Continue a paused transfer or retry a failed one
    Resume {
        id: String,
        /// Directory downloads are written to
        #[arg(long, short = 'o', default_value = ".")]
        out: PathBuf,
        #[arg(long, short = 'p')]
        prefix: Option<String>,
        /// Replace an existing file of the same name
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Abort a transfer and discard everything persisted for it
    Cancel {
        id: String,
        #[arg(long, short = 'p')]
        prefix: Option<String>,
    },

    /// Remove transfer state older than the expiry threshold
    Cleanup {
        /// Age threshold in days (default: [state] expiry_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (defaults merged with the config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut config = RcxConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;
    if let Some(level) = cli.log {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format.as_str().to_string();
    }
    init_logging(&config.log.level, &config.log.format);

    let mut registry = Registry::default();
    let metrics = cli.metrics.then(|| TransferMetrics::new(&mut registry));
    let app = App { config, metrics };

    match cli.command {
        Commands::Seal {
            file,
            prefix,
            algorithm,
            chunk_size,
        } => cmd_seal(&app, &file, prefix.as_deref(), algorithm.into(), chunk_size).await?,
        Commands::Pull {
            resource_hash,
            out,
            prefix,
            streaming,
            force,
        } => {
            let output = Output { dir: out, force };
            cmd_pull(&app, &resource_hash, &output, prefix.as_deref(), streaming).await?
        }
        Commands::Push { file, prefix } => cmd_push(&app, &file, prefix.as_deref()).await?,
        Commands::List => cmd_list(&app)?,
        Commands::Resume {
            id,
            out,
            prefix,
            force,
        } => {
            let output = Output { dir: out, force };
            cmd_resume(&app, &id, &output, prefix.as_deref()).await?
        }
        Commands::Cancel { id, prefix } => cmd_cancel(&app, &id, prefix.as_deref()).await?,
        Commands::Cleanup { days } => cmd_cleanup(&app, days)?,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&app, &config_path)?,
    }

    if cli.metrics {
        print!("{}", render(&registry).context("encoding metrics")?);
    }
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command output; logs go to stderr.
    if format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

struct App {
    config: RcxConfig,
    metrics: Option<TransferMetrics>,
}

/// Where downloaded files go.
#[derive(Debug, Clone)]
struct Output {
    dir: PathBuf,
    /// Replace existing files instead of picking a free name.
    force: bool,
}

impl App {
    fn operator(&self) -> Result<opendal::Operator> {
        build_operator(&self.config.storage, Credentials::from_env().as_ref())
            .context("building storage operator")
    }

    fn prefix(&self, override_prefix: Option<&str>) -> String {
        override_prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.config.storage.prefix.clone())
    }

    fn store(&self) -> Result<Arc<StoreBackend>> {
        StoreBackend::open(&self.config.state)
            .map(Arc::new)
            .with_context(|| format!("opening transfer state: {}", self.config.state.path.display()))
    }

    /// Orchestrator over the configured operator; `out` enables streaming
    /// downloads into that directory.
    fn orchestrator(&self, prefix: &str, out: Option<&Output>) -> Result<Orchestrator> {
        let op = self.operator()?;
        let mut ctx = TransferContext::new(
            self.store()?,
            Arc::new(OperatorTransport::new(op.clone())),
            Arc::new(ManifestLocations::new(op, prefix)),
        )
        .with_config(&self.config);
        if let Some(out) = out {
            ctx = ctx.with_sinks(Arc::new(
                DirSinkFactory::new(&out.dir).overwrite(out.force),
            ));
        }
        if let Some(metrics) = &self.metrics {
            ctx = ctx.with_metrics(metrics.clone());
        }
        Ok(Orchestrator::new(ctx))
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(bar_style());
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Drive a progress bar from the event stream until the task stops running.
async fn follow(orch: &Orchestrator, id: &str, label: &str) -> Result<TransferStatus> {
    let mut events = orch.subscribe();
    let pb = make_progress_bar(0, label);
    if let Some(p) = orch.progress(id) {
        pb.set_length(p.total_chunks as u64);
        pb.set_position(p.completed_chunks as u64);
    }

    let status = loop {
        let status = orch
            .task(id)
            .with_context(|| format!("transfer {id} disappeared"))?
            .status;
        if !status.is_active() && status != TransferStatus::Pending {
            break status;
        }
        match events.recv().await {
            Ok(TransferEvent::Progress { id: ev, progress }) if ev == id => {
                pb.set_length(progress.total_chunks as u64);
                pb.set_position(progress.completed_chunks as u64);
                pb.set_message(fmt_bytes(progress.bytes));
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("transfer events closed"),
        }
    };

    if status == TransferStatus::Completed {
        pb.finish_with_message("done");
    } else {
        pb.abandon_with_message(status.to_string());
    }
    Ok(status)
}

/// Follow a running transfer to the end. Ctrl-C pauses it instead.
async fn run_to_end(orch: &Orchestrator, id: &str, label: &str, out: &Output) -> Result<()> {
    let status = tokio::select! {
        status = follow(orch, id, label) => status?,
        _ = tokio::signal::ctrl_c() => {
            orch.shutdown().await;
            println!();
            println!("Paused. Continue with: rcx resume {id}");
            return Ok(());
        }
    };

    let task = orch
        .task(id)
        .with_context(|| format!("transfer {id} disappeared"))?;
    match status {
        TransferStatus::Completed => report_completed(orch, &task, out).await,
        TransferStatus::Failed => {
            let reason = task
                .failure
                .map(|f| format!("{:?}: {}", f.kind, f.message))
                .unwrap_or_else(|| "unknown failure".to_string());
            anyhow::bail!("transfer {id} failed ({reason})\nretry with: rcx resume {id}")
        }
        other => {
            println!("Transfer {id} is {other}");
            Ok(())
        }
    }
}

async fn report_completed(orch: &Orchestrator, task: &TransferTask, out: &Output) -> Result<()> {
    println!();
    match (task.direction, orch.take_output(&task.id)) {
        (_, Some(SinkOutput::Memory(bytes))) => {
            let name = sanitize_file_name(&task.file_name);
            let path = output_path(&out.dir, &name, out.force)
                .await
                .with_context(|| format!("choosing output name in {}", out.dir.display()))?;
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Downloaded:");
            println!("  local:  {}", path.display());
            println!("  bytes:  {}", fmt_bytes(bytes.len() as u64));
        }
        (_, Some(SinkOutput::File(path))) => {
            let bytes = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .unwrap_or_default();
            println!("Downloaded:");
            println!("  local:  {}", path.display());
            println!("  bytes:  {}", fmt_bytes(bytes));
        }
        (TransferDirection::Upload, None) => {
            println!("Uploaded:");
            println!("  resource: {}", task.resource_hash);
            println!("  chunks:   {}", task.total_chunks);
            println!("  bytes:    {}", fmt_bytes(task.file_size.unwrap_or_default()));
        }
        (TransferDirection::Download, None) => {
            println!("Transfer {} completed; output was already taken", task.id);
        }
    }
    Ok(())
}

// ── `rcx seal` ────────────────────────────────────────────────────────────────

async fn cmd_seal(
    app: &App,
    file: &Path,
    prefix: Option<&str>,
    algorithm: Algorithm,
    chunk_size: Option<u64>,
) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sealed".to_string());
    let chunk_size = chunk_size.unwrap_or(app.config.transfer.chunk_size).max(1);
    let prefix = app.prefix(prefix);
    let svc = ManifestLocations::new(app.operator()?, &prefix);

    let pb = make_spinner("seal");
    pb.set_message(name.clone());
    let (hash, key) = svc
        .publish_sealed(
            &name,
            "application/octet-stream",
            &data,
            chunk_size as usize,
            algorithm,
        )
        .await
        .with_context(|| format!("sealing {}", file.display()))?;
    pb.finish_with_message("done");

    println!("Sealed {} → {}", file.display(), svc.manifest_path(&hash));
    println!("  resource:    {hash}");
    println!("  algorithm:   {algorithm:?}");
    println!(
        "  chunks:      {}",
        (data.len() as u64).div_ceil(chunk_size).max(1)
    );
    println!("  bytes:       {}", fmt_bytes(data.len() as u64));
    println!("  initial key: {key}");
    Ok(())
}

// ── `rcx pull` ────────────────────────────────────────────────────────────────

async fn cmd_pull(
    app: &App,
    resource_hash: &str,
    out: &Output,
    prefix: Option<&str>,
    streaming: bool,
) -> Result<()> {
    tokio::fs::create_dir_all(&out.dir)
        .await
        .with_context(|| format!("creating {}", out.dir.display()))?;
    let orch = app.orchestrator(&app.prefix(prefix), Some(out))?;
    let id = orch
        .start_download(DownloadRequest {
            force_strategy: streaming.then_some(DestinationStrategy::Streaming),
            ..DownloadRequest::owned(resource_hash)
        })
        .await
        .with_context(|| format!("starting download of {resource_hash}"))?;

    println!("Pulling {resource_hash} → {} (task {id})", out.dir.display());
    run_to_end(&orch, &id, "pull", out).await
}

// ── `rcx push` ────────────────────────────────────────────────────────────────

async fn cmd_push(app: &App, file: &Path, prefix: Option<&str>) -> Result<()> {
    let prefix = app.prefix(prefix);
    let orch = app.orchestrator(&prefix, None)?;
    let id = orch
        .start_upload(file)
        .await
        .with_context(|| format!("starting upload of {}", file.display()))?;

    println!("Pushing {} → {prefix} (task {id})", file.display());
    let out = Output {
        dir: PathBuf::from("."),
        force: false,
    };
    run_to_end(&orch, &id, "push", &out).await
}

// ── `rcx list` ────────────────────────────────────────────────────────────────

fn cmd_list(app: &App) -> Result<()> {
    let store = app.store()?;
    let tasks = store.list_pending_tasks().context("listing transfers")?;
    if tasks.is_empty() {
        println!("No pending transfers");
    } else {
        println!(
            "{:<46} {:<9} {:<12} {:>11}  NAME",
            "ID", "DIRECTION", "STATUS", "CHUNKS"
        );
        for task in &tasks {
            let held = store.chunk_count(&task.id)?.min(task.total_chunks);
            println!(
                "{:<46} {:<9} {:<12} {:>11}  {}",
                task.id,
                task.direction.as_str(),
                task.status.as_str(),
                format!("{held}/{}", task.total_chunks),
                task.file_name,
            );
            if let Some(failure) = &task.failure {
                println!("    {:?}: {}", failure.kind, failure.message);
            }
        }
    }

    if let Some(usage) = store.storage_usage() {
        match usage.quota {
            Some(quota) => println!(
                "State: {} of {} used",
                fmt_bytes(usage.used),
                fmt_bytes(quota)
            ),
            None => println!("State: {} used", fmt_bytes(usage.used)),
        }
    }
    Ok(())
}

// ── `rcx resume` / `rcx cancel` ───────────────────────────────────────────────

async fn cmd_resume(app: &App, id: &str, out: &Output, prefix: Option<&str>) -> Result<()> {
    tokio::fs::create_dir_all(&out.dir)
        .await
        .with_context(|| format!("creating {}", out.dir.display()))?;
    let orch = app.orchestrator(&app.prefix(prefix), Some(out))?;
    orch.restore().await.context("restoring transfers")?;
    let task = orch
        .task(id)
        .with_context(|| format!("no pending transfer {id}"))?;
    match task.status {
        TransferStatus::Paused => orch.resume(id).await?,
        TransferStatus::Failed => orch.retry(id).await?,
        other => anyhow::bail!("transfer {id} is {other}, nothing to resume"),
    }

    let label = match task.direction {
        TransferDirection::Download => "pull",
        TransferDirection::Upload => "push",
    };
    println!("Resuming {} ({id})", task.file_name);
    run_to_end(&orch, id, label, out).await
}

async fn cmd_cancel(app: &App, id: &str, prefix: Option<&str>) -> Result<()> {
    let orch = app.orchestrator(&app.prefix(prefix), None)?;
    orch.restore().await.context("restoring transfers")?;
    orch.cancel(id)
        .await
        .with_context(|| format!("cancelling {id}"))?;
    println!("Cancelled {id}");
    Ok(())
}

// ── `rcx cleanup` ─────────────────────────────────────────────────────────────

fn cmd_cleanup(app: &App, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(app.config.state.expiry_days);
    let store = app.store()?;
    let swept = store
        .cleanup_expired(days)
        .context("sweeping expired transfers")?;
    println!("Removed {swept} transfer(s) older than {days} day(s)");
    Ok(())
}

// ── `rcx config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(app: &App, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    print!("{}", app.config.to_toml().context("serializing config")?);
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
