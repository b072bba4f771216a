//! # Incident Snapshot CLI (`incsnap`)
//!
//! The `incsnap` binary runs the snapshot pipeline once, on a schedule, or
//! against a local archive, and writes the ranked incident feed.
//!
//! ## Usage
//!
//! ```bash
//! incsnap --config ./config/incsnap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `incsnap run` | Locate, download and process the newest snapshot once |
//! | `incsnap locate` | Print the URL of the newest snapshot archive |
//! | `incsnap inspect <archive>` | Process a local `.tar.bz2` archive |
//! | `incsnap watch` | Re-run on an interval, skipping unchanged snapshots |
//!
//! A run that finds no usable data still exits with status 0 and writes a
//! result with `ok: false`; the reason is printed on stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use incident_snapshot::cache::{MemoryCache, ResultCache};
use incident_snapshot::config::{self, Config};
use incident_snapshot::error::ReasonCode;
use incident_snapshot::locator::fetch_snapshot_reference;
use incident_snapshot::models::PipelineResult;
use incident_snapshot::persist::{render_result, write_result};
use incident_snapshot::pipeline::{run_archive, run_pipeline_async};
use incident_snapshot::progress::{ProgressMode, ProgressReporter};
use incident_snapshot::transport::{CancelToken, HttpTransport};

/// Incident Snapshot CLI: publish a ranked feed of recent incidents from
/// the newest incident-database snapshot.
#[derive(Parser)]
#[command(
    name = "incsnap",
    about = "Build a ranked incident feed from the newest incident-database snapshot",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults are used when
    /// omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress output on stderr: `off`, `human` or `json`.
    ///
    /// Defaults to `human` when stderr is a terminal, otherwise `off`.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once and write the result.
    Run {
        /// Output file. Overrides `output.path` from config.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the result JSON on stdout instead of writing a file.
        #[arg(long)]
        stdout: bool,
    },

    /// Print the URL of the newest snapshot archive.
    Locate,

    /// Process a local `.tar.bz2` archive and print the result JSON.
    Inspect {
        /// Path to the archive.
        archive: PathBuf,
    },

    /// Re-run the pipeline on an interval until interrupted.
    ///
    /// Results are cached per archive, so an unchanged snapshot is not
    /// downloaded again while its cached result is fresh. Ctrl-C cancels
    /// the in-flight run.
    Watch {
        /// Seconds between runs.
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,

        /// Stop after this many runs.
        #[arg(long)]
        max_runs: Option<u64>,

        /// Output file. Overrides `output.path` from config.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s).ok_or_else(|| format!("expected off, human or json, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let cfg = Config::default();
            config::validate(&cfg)?;
            cfg
        }
    };
    let progress: Arc<dyn ProgressReporter> =
        Arc::from(cli.progress.unwrap_or_else(ProgressMode::default_for_tty).reporter());

    match cli.command {
        Commands::Run { output, stdout } => {
            let cfg = Arc::new(cfg);
            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone(), None);

            let result = run_pipeline_async(Arc::clone(&cfg), None, progress, cancel).await;
            report_outcome(&result);
            if stdout {
                println!("{}", render_result(&result)?);
            } else {
                let path = output.unwrap_or_else(|| cfg.output.path.clone());
                persist(&path, &result)?;
            }
        }
        Commands::Locate => {
            let source = cfg.source.clone();
            let http = cfg.http.clone();
            let reference = tokio::task::spawn_blocking(move || -> Result<_> {
                let transport = HttpTransport::new(&http)?;
                Ok(fetch_snapshot_reference(
                    &transport,
                    &source,
                    &CancelToken::new(),
                )?)
            })
            .await??;
            println!("{}", reference.resolved_url);
            eprintln!(
                "{} (timestamp {})",
                reference.archive_name, reference.timestamp
            );
        }
        Commands::Inspect { archive } => {
            let file = std::fs::File::open(&archive)
                .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
            let label = archive.display().to_string();
            let result = tokio::task::spawn_blocking(move || {
                run_archive(
                    std::io::BufReader::new(file),
                    &label,
                    &cfg,
                    &*progress,
                    &CancelToken::new(),
                )
            })
            .await?;
            report_outcome(&result);
            println!("{}", render_result(&result)?);
        }
        Commands::Watch {
            interval_secs,
            max_runs,
            output,
        } => {
            let path = output.unwrap_or_else(|| cfg.output.path.clone());
            let cache: Arc<dyn ResultCache> =
                Arc::new(MemoryCache::new(Duration::from_secs(cfg.cache.ttl_secs)));
            let cfg = Arc::new(cfg);
            let cancel = CancelToken::new();
            let stop = Arc::new(tokio::sync::Notify::new());
            cancel_on_ctrl_c(cancel.clone(), Some(Arc::clone(&stop)));

            let mut runs = 0u64;
            loop {
                let result = run_pipeline_async(
                    Arc::clone(&cfg),
                    Some(Arc::clone(&cache)),
                    Arc::clone(&progress),
                    cancel.clone(),
                )
                .await;
                report_outcome(&result);
                persist(&path, &result)?;

                runs += 1;
                if cancel.is_cancelled() || max_runs.is_some_and(|max| runs >= max) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                    _ = stop.notified() => break,
                }
            }
            eprintln!("incsnap: watch stopped after {} run(s)", runs);
        }
    }

    Ok(())
}

/// Cancel `cancel` (and wake `stop`) on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancelToken, stop: Option<Arc<tokio::sync::Notify>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("incsnap: interrupted, cancelling");
            cancel.cancel();
            if let Some(stop) = stop {
                stop.notify_one();
            }
        }
    });
}

/// Write the result unless the run was cancelled before producing one.
fn persist(path: &std::path::Path, result: &PipelineResult) -> Result<()> {
    if result.reason_code() == Some(ReasonCode::Cancelled) {
        eprintln!("incsnap: run cancelled, {} left unchanged", path.display());
        return Ok(());
    }
    write_result(path, result)?;
    eprintln!(
        "incsnap: wrote {} incidents to {}",
        result.incidents.len(),
        path.display()
    );
    Ok(())
}

fn report_outcome(result: &PipelineResult) {
    if let Some(diag) = &result.meta.diagnostic {
        let label = if result.ok() { "warning" } else { "no data" };
        eprintln!("incsnap: {} [{}]: {}", label, diag.reason_code, diag.details);
    }
}
