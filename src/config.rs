//! Configuration types for podcast-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Queue behavior configuration (files, directories, concurrency)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Persisted queue file (default: "./queue.json")
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,

    /// Directory relative destinations are resolved against (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum concurrent transfers (default: 1)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Start queued items automatically (default: true)
    ///
    /// When disabled, scheduling ticks admit nothing; transfers that are
    /// already running are left alone.
    #[serde(default = "default_true")]
    pub auto_download: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_file: default_queue_file(),
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            auto_download: true,
        }
    }
}

/// Per-transfer HTTP settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// TCP/TLS connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Maximum time without receiving body data before the transfer fails (default: 60 seconds)
    #[serde(default = "default_stall_timeout", with = "duration_serde")]
    pub stall_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            stall_timeout: default_stall_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// How failed transfers are retried
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Failed items wait for an explicit retry command
    #[default]
    Manual,
    /// Retryable failures are re-queued after an exponential backoff
    Automatic,
}

/// Retry configuration for failed transfers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry policy (default: manual)
    #[serde(default)]
    pub policy: RetryPolicy,

    /// Maximum number of automatic retries per item (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 300 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Manual,
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for the queue controller
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Queue files, directories and concurrency
    #[serde(default)]
    pub queue: QueueConfig,

    /// HTTP transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry behavior for failed transfers
    #[serde(default)]
    pub retry: RetryConfig,

    /// How long shutdown waits for cancelled transfers to stop (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Check settings that would leave the controller unable to work
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent_downloads == 0 {
            return Err(Error::Config {
                message: "max_concurrent_downloads must be at least 1".to_string(),
                key: Some("max_concurrent_downloads".to_string()),
            });
        }
        if self.queue.queue_file.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "queue_file must not be empty".to_string(),
                key: Some("queue_file".to_string()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: "backoff_multiplier must be at least 1.0".to_string(),
                key: Some("backoff_multiplier".to_string()),
            });
        }
        Ok(())
    }
}

fn default_queue_file() -> PathBuf {
    PathBuf::from("./queue.json")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_user_agent() -> String {
    format!("podcast-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
