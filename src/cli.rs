use crate::{
    chunk_plan,
    client::OpenAiClient,
    config::Config,
    job::JobStatus,
    journal::FileJournal,
    metadata::{JsonFileStore, MetadataStore},
    orchestrator::{Callbacks, JobOrchestrator, RunOptions},
    postprocess::clean_output,
    progress::Progress,
    util::{ensure_dir, sibling_path},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "batch-translate")]
#[command(about = "Resumable batch document translator (chunking + bounded workers + adaptive retry)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./batch-translate.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the chunk plan for a document as JSON.
    Plan {
        #[arg(long)]
        input: PathBuf,
    },
    /// Translate a document, resuming stored progress unless --fresh is given.
    Run {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Only re-dispatch chunks that failed or never finished last time.
        #[arg(long)]
        retry_failed_only: bool,
        /// Ignore stored progress and translate every chunk.
        #[arg(long, conflicts_with = "retry_failed_only")]
        fresh: bool,
    },
    /// Print the stored progress snapshot for a document.
    Status {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;

    match &args.cmd {
        Command::Plan { input } => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            plan(&cfg, input)
        }
        Command::Run {
            input,
            out_dir,
            retry_failed_only,
            fresh,
        } => run(
            &args,
            &cfg,
            input,
            out_dir.as_deref(),
            RunFlags {
                retry_failed_only: *retry_failed_only,
                fresh: *fresh,
            },
        ),
        Command::Status { input, out_dir } => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            status(&cfg, input, out_dir.as_deref())
        }
    }
}

fn load_config(user: Option<&Path>) -> Result<Config> {
    if let Some(p) = user {
        return Config::load(p);
    }
    let default = PathBuf::from("batch-translate.toml");
    if default.exists() {
        Config::load(&default)
    } else {
        Ok(Config::default())
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn plan(cfg: &Config, input: &Path) -> Result<()> {
    let text = read_input(input)?;
    let plan = chunk_plan::plan(&text, cfg.chunking.max_chunk_size)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "job_id": job_key(input),
            "config_fingerprint": cfg.fingerprint(),
            "plan": plan,
        }))?
    );
    Ok(())
}

struct RunFlags {
    retry_failed_only: bool,
    fresh: bool,
}

fn run(args: &Args, cfg: &Config, input: &Path, out_override: Option<&Path>, flags: RunFlags) -> Result<()> {
    let out_dir = resolve_out_dir(cfg, out_override);
    ensure_dir(&out_dir)?;

    let log_path = resolve_log_path(cfg, Some(&out_dir));
    let _guard = init_logging(args, cfg, log_path.as_deref())?;

    let text = read_input(input)?;
    let key = job_key(input);
    info!("job_id={key} out={}", out_dir.display());

    let client = OpenAiClient::new(cfg)?;
    let store = JsonFileStore::new(&out_dir, cfg.paths.metadata_suffix.clone());
    let journal = FileJournal::new(&out_dir, cfg.paths.journal_suffix.clone());

    let callbacks = Callbacks {
        progress: Some(Arc::new(|p: &Progress| {
            info!(
                processed = p.processed_chunks,
                total = p.total_chunks,
                failed = p.failed_chunks,
                "{}",
                p.message
            );
        })),
        status: Some(Arc::new(|msg: &str| info!("{msg}"))),
    };

    let orchestrator = JobOrchestrator::new(
        cfg.clone(),
        Arc::new(client),
        Arc::new(store),
        Arc::new(journal),
    )
    .with_callbacks(callbacks);

    let opts = RunOptions {
        resume: cfg.global.resume && !flags.fresh,
        retry_failed_only: flags.retry_failed_only,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")?;

    let outcome = runtime.block_on(async {
        let job = orchestrator.create_job(&key, &text)?;
        let running = orchestrator.start(job, opts).await?;

        let handle = running.handle().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling job {}", handle.id());
                handle.cancel();
            }
        });

        Ok::<_, anyhow::Error>(running.wait().await?)
    })?;

    let translated_path = sibling_path(&out_dir, input, &cfg.output.translated_suffix);
    if outcome.status != JobStatus::Cancelled {
        let cleaned = clean_output(cfg, &outcome.output)?;
        std::fs::write(&translated_path, cleaned)
            .with_context(|| format!("writing {}", translated_path.display()))?;
    }

    if cfg.output.write_report_json {
        let report_path = sibling_path(&out_dir, input, &cfg.output.report_suffix);
        std::fs::write(&report_path, serde_json::to_string_pretty(&outcome.report)?)
            .with_context(|| format!("writing {}", report_path.display()))?;
    }

    if cfg.global.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "job_id": key,
                "status": outcome.status,
                "total_chunks": outcome.progress.total_chunks,
                "succeeded": outcome.progress.succeeded_chunks,
                "failed": outcome.progress.failed_chunks,
                "skipped": outcome.progress.skipped_chunks,
                "output": (outcome.status != JobStatus::Cancelled).then_some(&translated_path),
            }))?
        );
    }

    if outcome.status == JobStatus::PartiallyFailed {
        return Err(anyhow!(
            "{} chunk(s) failed; rerun with --retry-failed-only to retry them",
            outcome.progress.failed_chunks
        ));
    }
    Ok(())
}

fn status(cfg: &Config, input: &Path, out_override: Option<&Path>) -> Result<()> {
    let out_dir = resolve_out_dir(cfg, out_override);
    let store = JsonFileStore::new(&out_dir, cfg.paths.metadata_suffix.clone());
    let key = job_key(input);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")?;
    let meta = runtime
        .block_on(store.load(&key))?
        .ok_or_else(|| anyhow!("no stored progress at {}", store.path_for(&key).display()))?;

    let fingerprint_matches = meta.config_fingerprint == cfg.fingerprint();
    if !fingerprint_matches {
        warn!("stored progress was made with different settings; a run would start over");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "fingerprint_matches": fingerprint_matches,
            "metadata": meta,
        }))?
    );
    Ok(())
}

fn read_input(input: &Path) -> Result<String> {
    if !input.is_file() {
        return Err(anyhow!("input does not exist: {}", input.display()));
    }
    std::fs::read_to_string(input).with_context(|| format!("reading input: {}", input.display()))
}

/// Jobs are keyed by the input's file stem, so a rerun on the same file finds
/// its stored progress.
fn job_key(input: &Path) -> String {
    input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string()
}

fn resolve_out_dir(cfg: &Config, out_override: Option<&Path>) -> PathBuf {
    out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.out_dir))
}

fn resolve_log_path(cfg: &Config, out_dir: Option<&Path>) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    if let Some(out_dir) = out_dir {
        return Some(out_dir.join("batch-translate.log"));
    }

    Some(PathBuf::from(&cfg.paths.out_dir).join("batch-translate.log"))
}
