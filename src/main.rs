//! CLI entry point for match-archiver.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use match_archiver::{
    FetchSummary, FileConfig, LifecycleState, Pipeline, PipelineConfig, StateCounts,
};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::{Args, Command, FetchArgs, PageRange};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;
    let pipeline = Pipeline::open_sqlite(config)
        .await
        .context("failed to open pipeline")?;

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_signal = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_signal.store(true, Ordering::SeqCst);
        }
    });

    match args.command.clone() {
        Command::Discover(range) => discover(&pipeline, range).await?,
        Command::Fetch(fetch_args) => fetch(&pipeline, fetch_args, &args, &cancel).await?,
        Command::Transform => transform(&pipeline, &cancel).await?,
        Command::Run(range) => {
            discover(&pipeline, range).await?;
            let until_idle = FetchArgs {
                limit: None,
                concurrency: None,
                until_idle: true,
            };
            fetch(&pipeline, until_idle, &args, &cancel).await?;
            if cancel.load(Ordering::SeqCst) {
                warn!("interrupted; skipping transform");
            } else {
                transform(&pipeline, &cancel).await?;
            }
            print_counts(&pipeline.stats().await?);
        }
        Command::Stats { json } => {
            let counts = pipeline.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                print_counts(&counts);
            }
        }
        Command::RequeueFailed => {
            let requeued = pipeline.requeue_failed().await?;
            println!("Requeued {requeued} failed record(s)");
        }
        Command::ExportCsv { output } => {
            let written = pipeline.export_csv(&output).await?;
            println!("Exported {written} record(s) to {}", output.display());
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let file = match &args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => FileConfig::load_default()?.map(|(path, file)| {
            debug!(path = %path.display(), "loaded default config file");
            file
        }),
    };

    let mut config = PipelineConfig::default();
    if let Some(file) = &file {
        config = config.with_file(file);
    }
    if let Some(db) = &args.db {
        config.db_path.clone_from(db);
    }
    config.validate()?;
    Ok(config)
}

async fn discover(pipeline: &Pipeline, range: PageRange) -> Result<()> {
    if range.start_page > range.end_page {
        bail!(
            "--start-page {} is after --end-page {}",
            range.start_page,
            range.end_page
        );
    }
    let summary = pipeline
        .discover_batch(range.start_page..=range.end_page)
        .await?;
    println!(
        "Discovered {} record(s) on {} page(s): {} new, {} rejected",
        summary.records_seen,
        summary.pages_requested,
        summary.records_inserted,
        summary.records_rejected
    );
    for failure in &summary.pages_failed {
        println!("  page {} failed: {}", failure.page, failure.error);
    }
    Ok(())
}

async fn fetch(
    pipeline: &Pipeline,
    fetch_args: FetchArgs,
    args: &Args,
    cancel: &Arc<AtomicBool>,
) -> Result<()> {
    let limit = fetch_args
        .limit
        .map(usize::try_from)
        .transpose()
        .context("--limit is too large")?;
    let concurrency = fetch_args.concurrency.map(usize::from);

    let use_spinner = progress::should_use_spinner(
        io::stderr().is_terminal(),
        args.quiet,
        progress::is_dumb_terminal(),
    );
    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(use_spinner, Arc::clone(pipeline.store()));

    let result = if fetch_args.until_idle {
        pipeline
            .fetch_until_idle(limit, concurrency, Arc::clone(cancel))
            .await
    } else {
        pipeline
            .fetch_pending(limit, concurrency, Arc::clone(cancel))
            .await
            .map(|summary| vec![summary])
    };

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    if let Err(e) = &result
        && e.is_store_busy()
    {
        warn!("state database stayed busy; raise db_busy_timeout_ms or re-run later");
    }
    let batches = result?;
    let recovered: u64 = batches.iter().map(|b| b.recovered).sum();
    if recovered > 0 {
        println!("Recovered {recovered} interrupted record(s)");
    }
    for (idx, summary) in batches.iter().enumerate() {
        print_fetch_summary(idx + 1, summary);
    }
    if batches.iter().any(|b| b.interrupted) {
        info!("fetch interrupted; re-run to continue");
    }
    Ok(())
}

async fn transform(pipeline: &Pipeline, cancel: &Arc<AtomicBool>) -> Result<()> {
    let summary = pipeline.transform_succeeded(Arc::clone(cancel)).await?;
    println!(
        "Transformed {} record(s), {} game(s); {} failed, {} payload(s) pruned",
        summary.transformed.len(),
        summary.games(),
        summary.failed.len(),
        summary.pruned
    );
    for failed in &summary.failed {
        println!(
            "  record {}: {}",
            failed.id,
            failed.detail.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_fetch_summary(batch: usize, summary: &FetchSummary) {
    println!(
        "Batch {batch}: {} eligible, {} succeeded, {} retry scheduled, {} failed, {} skipped ({} requests){}",
        summary.snapshot_size,
        summary.succeeded,
        summary.retry_scheduled,
        summary.failed,
        summary.skipped,
        summary.requests,
        if summary.interrupted { ", interrupted" } else { "" }
    );
    for failed in &summary.newly_failed {
        let kind = failed
            .error_kind
            .map_or_else(|| "unknown".to_string(), |k| k.to_string());
        println!("  record {} failed ({kind})", failed.id);
    }
}

fn print_counts(counts: &StateCounts) {
    println!("{:<12} {:>10}", "state", "records");
    for state in LifecycleState::ALL {
        println!("{:<12} {:>10}", state.as_str(), counts.get(state));
    }
    println!("{:<12} {:>10}", "total", counts.total());
}
