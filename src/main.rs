//! photowall: a photo kiosk.
//!
//! Capture devices upload photos into a backend (a local SQLite table with
//! filesystem blobs, or a hosted table and storage API). Display surfaces
//! follow one shared live collection that is kept consistent with the
//! backend by reconciling an initial snapshot with the change feed.

#![warn(clippy::all)]

mod backend;
mod cli;
mod config;
mod hub;
mod photo;
mod reconcile;
mod retry;
mod shutdown;
mod surface;
mod types;
mod upload;

use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use backend::{Backend, SortOrder};
use cli::Command;
use hub::{FeedHub, HubSettings};
use photo::{DeviceType, PhotoRecord};
use reconcile::InsertStrategy;
use retry::RetryConfig;
use upload::Uploader;

/// Poll interval used when a command does not take `--poll-interval`.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Consecutive failed reconnects before `watch --reconnect` gives up.
const RECONNECT_ATTEMPTS: u32 = 10;

fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    match ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        Ok(style) => pb.set_style(style.progress_chars("=> ")),
        Err(e) => tracing::debug!(error = %e, "Using default progress style"),
    }
    pb
}

fn print_photo(photo: &PhotoRecord) {
    println!(
        "{}  {}  {}  {}",
        photo.id,
        photo.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        photo.device_type,
        photo.file_url
    );
}

/// Upload each file in turn. Stops early on shutdown; fails if any file
/// failed.
async fn run_upload(
    uploader: &Uploader,
    args: cli::UploadArgs,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let device = DeviceType::from_user_agent(&args.user_agent);
    let total = args.files.len();
    let pb = create_progress_bar(args.no_progress_bar || total < 2, total as u64);

    let mut uploaded = 0usize;
    let mut failed = 0usize;
    for path in &args.files {
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, skipping remaining uploads");
            break;
        }
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        pb.set_message(name.clone());

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to read file");
                failed += 1;
                pb.inc(1);
                continue;
            }
        };
        match uploader.upload(&name, bytes, device).await {
            Ok(record) => {
                uploaded += 1;
                pb.suspend(|| println!("{}  {}", record.id, path));
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Upload failed");
                failed += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!("Uploaded {uploaded} of {total} photos ({device})");
    if failed > 0 {
        anyhow::bail!("{failed} upload(s) failed");
    }
    Ok(())
}

async fn run_list(backend: &Backend, args: cli::ListArgs) -> anyhow::Result<()> {
    let since = args
        .since
        .as_deref()
        .map(config::parse_date_or_interval)
        .transpose()?
        .map(|dt| dt.with_timezone(&Utc));

    let photos = backend
        .feed
        .query(SortOrder::NewestFirst)
        .await
        .context("Failed to load photos")?;
    let shown: Vec<&PhotoRecord> = photos
        .iter()
        .filter(|p| since.map_or(true, |since| p.created_at >= since))
        .take(args.limit.unwrap_or(usize::MAX))
        .collect();

    if shown.is_empty() {
        println!("No photos");
        return Ok(());
    }
    for photo in &shown {
        print_photo(photo);
    }
    println!();
    println!("{} of {} photos", shown.len(), photos.len());
    Ok(())
}

async fn run_delete(uploader: &Uploader, args: cli::DeleteArgs) -> anyhow::Result<()> {
    let record = uploader.find(&args.id).await?;
    uploader.delete(&record).await?;
    println!("Deleted photo {}", record.id);
    Ok(())
}

async fn run_download(uploader: &Uploader, args: cli::DownloadArgs) -> anyhow::Result<()> {
    let record = uploader.find(&args.id).await?;
    let directory = config::expand_tilde(&args.directory);
    let path = uploader.download(&record, &directory).await?;
    println!("Saved {}", path.display());
    Ok(())
}

async fn run_watch(
    backend: &Backend,
    retry: &RetryConfig,
    args: cli::WatchArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let settings = HubSettings {
        strategy: if args.prepend_only {
            InsertStrategy::PrependOnly
        } else {
            InsertStrategy::Positional
        },
        reconnect: args.reconnect.then(|| RetryConfig {
            max_retries: RECONNECT_ATTEMPTS,
            ..retry.clone()
        }),
        ..HubSettings::default()
    };
    tracing::debug!(?settings, "Starting photo feed");
    let hub = FeedHub::start(backend.feed.clone(), settings);

    surface::run_surface(
        args.surface,
        hub.view(),
        shutdown,
        Duration::from_secs(args.slide_interval.max(1)),
    )
    .await;

    hub.teardown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let poll_interval = match &cli.command {
        Command::Watch(args) => args.poll_interval,
        _ => DEFAULT_POLL_INTERVAL_SECS,
    };
    let config = config::Config::from_cli(&cli.backend, poll_interval)?;
    tracing::debug!(?config, "Resolved configuration");

    let backend = Backend::connect(&config)
        .await
        .context("Failed to open backend")?;
    let uploader = Uploader::new(backend.uploads.clone(), config.retry.clone());
    let shutdown = shutdown::install_signal_handler();

    match cli.command {
        Command::Upload(args) => run_upload(&uploader, args, &shutdown).await,
        Command::List(args) => run_list(&backend, args).await,
        Command::Delete(args) => run_delete(&uploader, args).await,
        Command::Download(args) => run_download(&uploader, args).await,
        Command::Watch(args) => run_watch(&backend, &config.retry, args, shutdown).await,
    }
}
