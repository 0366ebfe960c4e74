//! Tunedrop - fetch media over HTTP with resume, priorities and conversion.
//!
//! This is the command-line entry point for the transfer engine.

mod cli;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use clap::Parser;
use cli::Args;
use logging::LoggingConfig;
use tracing::{error, info, warn};
use tunedrop_core::{
    EngineConfig, FfmpegConverter, HttpFetcher, LogNotifier, Transfer, TransferContext,
    TransferEvent, TransferScheduler, TransferStatus, sanitize_filename,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match logging::init(&LoggingConfig::for_cli(args.verbose)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: {e}");
            None
        }
    };

    info!("Starting Tunedrop with {} URL(s)", args.urls.len());

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Fetch every URL. Returns whether all of them completed.
async fn run(args: Args) -> tunedrop_core::Result<bool> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(dest) = &args.dest {
        config.download_directory.clone_from(dest);
    }
    if let Some(jobs) = args.jobs {
        config.scheduler.max_concurrent_transfers = usize::from(jobs);
    }
    if let Some(format) = args.format {
        config.conversion.format = Some(format.into());
    }
    config.validate();

    info!("Download directory: {}", config.download_directory.display());

    let fetcher = Arc::new(HttpFetcher::new(config.fetch.clone())?);
    let mut context =
        TransferContext::from_config(fetcher, &config).with_notifier(Arc::new(LogNotifier));
    if config.conversion.format.is_some() {
        context = context.with_post_processor(Arc::new(FfmpegConverter::new(&config.conversion)));
    }

    let scheduler = TransferScheduler::with_config(config.scheduler.clone());
    let priority = args.priority.into();
    let transfers: Vec<Transfer> = args
        .urls
        .iter()
        .map(|url| {
            let transfer = Transfer::new(context.clone());
            // Keyed by URL so an interrupted run resumes the same partial file.
            transfer.set_id(url.as_str());
            transfer.set_url(url.as_str());
            transfer.set_download_path(&config.download_directory);
            transfer.set_priority(priority);
            transfer.set_conversion_format(config.conversion.format);
            if let Some(name) = file_name_from_url(url) {
                transfer.set_file_name(name);
            }
            let last_logged = AtomicU8::new(u8::MAX);
            transfer.subscribe(move |transfer, event| {
                log_progress(transfer, event, &last_logged);
            });
            scheduler.attach(&transfer);
            transfer.queue();
            transfer
        })
        .collect();

    tokio::select! {
        () = wait_all(&transfers) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Interrupted, pausing transfers so they can resume later");
            scheduler.pause();
            for transfer in transfers.iter().filter(|t| t.status().is_active()) {
                transfer.pause().await;
            }
        }
    }

    let stats = scheduler.stats();
    info!(
        "Finished: {} completed, {} failed, {} canceled, {} unfinished",
        stats.completed,
        stats.failed,
        stats.canceled,
        stats.total - stats.completed - stats.failed - stats.canceled
    );
    for transfer in &transfers {
        match transfer.output_path() {
            Some(path) if transfer.status() == TransferStatus::Completed => {
                info!("{} -> {}", transfer.url(), path.display());
            }
            _ => warn!("{}: {}", transfer.url(), transfer.status_string()),
        }
    }

    if args.json {
        let snapshots: Vec<_> = transfers.iter().map(Transfer::snapshot).collect();
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    }

    Ok(stats.completed == transfers.len())
}

async fn wait_all(transfers: &[Transfer]) {
    for transfer in transfers {
        transfer.wait_until_finished().await;
    }
}

/// Log every tenth percent once.
fn log_progress(transfer: &Transfer, event: &TransferEvent, last_logged: &AtomicU8) {
    if let TransferEvent::ProgressChanged {
        bytes_transferred,
        progress,
    } = event
        && progress % 10 == 0
        && last_logged.swap(*progress, Ordering::Relaxed) != *progress
    {
        info!(
            "{}: {}% ({} bytes)",
            transfer.file_name(),
            progress,
            bytes_transferred
        );
    }
}

/// Last path segment of `url`, without query or fragment.
fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, segment) = path.rsplit_once('/')?;
    let name = sanitize_filename(segment);
    (!name.is_empty()).then_some(name)
}
