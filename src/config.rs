use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SyncError;

/// The environment variable that overrides `TransferOptions::max_retry`.
pub const MAX_RETRY_ENV: &str = "VC_MAX_REQUEST_RETRY";

/// Which sides a `LocalVersionUpdateQueue` commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateTargets {
    /// Only send updates to the server.
    Server,
    /// Only write the local tables (offline operations).
    Local,
    /// Write the local tables, then tell the server.
    Both,
}

impl UpdateTargets {
    pub fn includes_server(self) -> bool {
        self != UpdateTargets::Local
    }

    pub fn includes_local(self) -> bool {
        self != UpdateTargets::Server
    }
}

/// Batching limits of the local version update queue.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// A flush starts once this many updates are pending.
    pub flush_trigger_level: usize,
    /// Callers block while this many updates are pending.
    pub maximum_level: usize,
    /// A flush starts once the oldest pending update is this old.
    pub time_trigger: Duration,
    /// How long a blocked caller sleeps before rechecking the queue.
    pub sleep_interval: Duration,
    pub targets: UpdateTargets,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            flush_trigger_level: 400,
            maximum_level: 1600,
            time_trigger: Duration::from_secs(15),
            sleep_interval: Duration::from_secs(2),
            targets: UpdateTargets::Both,
        }
    }
}

impl QueueOptions {
    pub fn new(targets: UpdateTargets) -> Self {
        QueueOptions {
            targets,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.flush_trigger_level >= self.maximum_level {
            return Err(SyncError::InvalidUpdate(format!(
                "flush trigger level {} must be below the maximum level {}",
                self.flush_trigger_level, self.maximum_level
            )));
        }
        if self.time_trigger == Duration::from_millis(0) {
            return Err(SyncError::InvalidUpdate("the time trigger must be positive".to_owned()));
        }
        Ok(())
    }
}

/// Retry policy and connection settings for content transfers.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub max_retry: u32,
    /// Base of the exponential backoff: attempt `n` waits `retry_delay * 2^(n-1)`.
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Optional download proxy, tried before the primary server until it fails once.
    pub download_proxy: Option<String>,
    pub buffer_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            max_retry: 3,
            retry_delay: Duration::from_millis(10_000),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            download_proxy: None,
            buffer_size: 64 * 1024,
        }
    }
}

impl TransferOptions {
    /// The defaults, with `max_retry` taken from `VC_MAX_REQUEST_RETRY` when it parses.
    pub fn from_env() -> Self {
        let mut options = TransferOptions::default();
        if let Ok(value) = env::var(MAX_RETRY_ENV) {
            match value.trim().parse::<u32>() {
                Ok(retries) if retries > 0 => options.max_retry = retries,
                _ => warn!("Ignoring invalid {}={:?}", MAX_RETRY_ENV, value),
            }
        }
        options
    }

    /// The delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_delay * 2u32.pow(exponent)
    }
}

/// Where baselines live and how they are fetched.
#[derive(Clone, Debug)]
pub struct BaselineOptions {
    pub root: PathBuf,
    /// Maximum number of concurrent baseline transfers.
    pub max_concurrency: usize,
    /// Store baselines copied from disk gzip-compressed.
    pub compress_local_copies: bool,
}

impl BaselineOptions {
    pub fn new(root: PathBuf) -> Self {
        BaselineOptions {
            root,
            max_concurrency: 8,
            compress_local_copies: true,
        }
    }
}

/// Per-workspace behaviour switches.
#[derive(Clone, Debug, Default)]
pub struct WorkspaceOptions {
    /// Files get their check-in time as modification time, so check-in dates are mandatory.
    pub set_file_time_to_checkin: bool,
}
