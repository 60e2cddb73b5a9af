use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};

use crate::cli::BackendArgs;
use crate::retry::RetryConfig;
use crate::types::BackendKind;

/// Ceiling for the exponential retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local {
        data_dir: PathBuf,
    },
    Rest {
        url: String,
        api_key: String,
        table: String,
        bucket: String,
    },
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendConfig::Local { data_dir } => f
                .debug_struct("Local")
                .field("data_dir", data_dir)
                .finish(),
            BackendConfig::Rest {
                url, table, bucket, ..
            } => f
                .debug_struct("Rest")
                .field("url", url)
                .field("api_key", &"<redacted>")
                .field("table", table)
                .field("bucket", bucket)
                .finish(),
        }
    }
}

/// Application configuration, resolved once from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(args: &BackendArgs, poll_interval_secs: u64) -> anyhow::Result<Self> {
        if poll_interval_secs == 0 {
            anyhow::bail!("--poll-interval must be at least 1 second");
        }

        let backend = match args.backend {
            BackendKind::Local => BackendConfig::Local {
                data_dir: expand_tilde(&args.data_dir),
            },
            BackendKind::Rest => {
                let url = args
                    .url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        anyhow::anyhow!("The rest backend needs --url or PHOTOWALL_URL")
                    })?;
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    anyhow::bail!("Backend URL must start with http:// or https://, got '{url}'");
                }
                let api_key = args
                    .api_key
                    .as_deref()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| {
                        anyhow::anyhow!("The rest backend needs --api-key or PHOTOWALL_API_KEY")
                    })?;
                BackendConfig::Rest {
                    url: url.trim_end_matches('/').to_string(),
                    api_key: api_key.to_string(),
                    table: args.table.clone(),
                    bucket: args.bucket.clone(),
                }
            }
        };

        Ok(Self {
            backend,
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay: Duration::from_secs(args.retry_delay),
                max_delay: MAX_RETRY_DELAY,
            },
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }
}

/// Parse a human-friendly date spec into a concrete timestamp.
///
/// Supports three formats:
/// - Relative interval: `"20d"` (20 days ago from now)
/// - ISO date: `"2025-01-02"` (midnight local time)
/// - ISO datetime: `"2025-01-02T14:30:00"` (local time)
pub(crate) fn parse_date_or_interval(s: &str) -> anyhow::Result<DateTime<Local>> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            return Ok(Local::now() - chrono::Duration::days(days));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            if let Some(dt) = naive_dt.and_local_timezone(Local).single() {
                return Ok(dt);
            }
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        if let Some(local) = dt.and_local_timezone(Local).single() {
            return Ok(local);
        }
    }
    anyhow::bail!(
        "Cannot parse '{}' as a date. Expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), or interval (20d)",
        s
    )
}
