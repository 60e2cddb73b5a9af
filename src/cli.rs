use clap::{Args, Parser, Subcommand};

use crate::types::{BackendKind, LogLevel, SurfaceKind};

#[derive(Parser, Debug)]
#[command(
    name = "photowall",
    version,
    about = "Upload photos and show them live on kiosk surfaces"
)]
pub struct Cli {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

/// Where photos live, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Backend to use
    #[arg(long, value_enum, default_value = "local", global = true)]
    pub backend: BackendKind,

    /// Data directory for the local backend
    #[arg(long, default_value = "~/.photowall", global = true)]
    pub data_dir: String,

    /// Base URL of the hosted backend
    #[arg(long, env = "PHOTOWALL_URL", global = true)]
    pub url: Option<String>,

    /// API key for the hosted backend.
    /// Prefer the PHOTOWALL_API_KEY environment variable: flags are visible
    /// in process listings.
    #[arg(long, env = "PHOTOWALL_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Storage bucket holding photo blobs
    #[arg(long, default_value = "photos", global = true)]
    pub bucket: String,

    /// Table holding photo records
    #[arg(long, default_value = "photos", global = true)]
    pub table: String,

    /// Max retries on transient backend errors (0 = no retries)
    #[arg(long, default_value_t = 2, global = true)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 1, global = true)]
    pub retry_delay: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload photo files
    Upload(UploadArgs),

    /// List stored photos, newest first
    List(ListArgs),

    /// Delete a photo and its blob
    Delete(DeleteArgs),

    /// Save a stored photo to disk
    Download(DownloadArgs),

    /// Show photos live on a surface until interrupted
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<String>,

    /// User agent of the uploading device, used to tag it mobile or desktop
    #[arg(long, default_value = "")]
    pub user_agent: String,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only photos created after this date or interval (e.g. 2025-01-02 or 20d)
    #[arg(long)]
    pub since: Option<String>,

    /// Show at most this many photos
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Photo id
    pub id: String,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Photo id
    pub id: String,

    /// Directory to save into
    #[arg(short = 'd', long, default_value = ".")]
    pub directory: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Surface to show
    #[arg(long, value_enum, default_value = "gallery")]
    pub surface: SurfaceKind,

    /// Resubscribe with backoff when the live feed drops
    #[arg(long)]
    pub reconnect: bool,

    /// Seconds between polls of the photo table
    #[arg(long, default_value_t = 2)]
    pub poll_interval: u64,

    /// Seconds each slideshow photo stays on screen
    #[arg(long, default_value_t = 4)]
    pub slide_interval: u64,

    /// Insert new photos at the front instead of their sorted position
    #[arg(long)]
    pub prepend_only: bool,
}
