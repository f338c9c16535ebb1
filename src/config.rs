//! Server configuration
//!
//! Defaults mirror the constants the chat room has always run with; a few
//! of them can be overridden through `CHAT_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Default listen address
pub const DEFAULT_ADDR: &str = "0.0.0.0:9000";

/// Default data directory for the WAL and snapshot
pub const DEFAULT_DATA_DIR: &str = "./chatdata";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    /// Per-client outgoing queue capacity
    pub mailbox_capacity: usize,
    /// Actor command channel capacity
    pub command_buffer: usize,
    /// History entries sent on join
    pub join_history: usize,
    pub handshake_timeout: Duration,
    /// Re-armed before every line read
    pub read_timeout: Duration,
    pub idle_display_after: Duration,
    /// Reaper evicts clients idle beyond this
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub snapshot_interval: Duration,
    /// Periodic snapshots only when history is longer than this
    pub snapshot_threshold: usize,
    pub session_expiry: Duration,
    /// Probability that a connection is throttled as a slow consumer
    pub slow_client_ratio: f64,
    pub slow_client_max_delay: Duration,
    /// How long `/quit` waits for queued output to reach the socket
    pub quit_drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ADDR.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mailbox_capacity: 10,
            command_buffer: 256,
            join_history: 10,
            handshake_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(5 * 60),
            idle_display_after: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
            reaper_interval: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(5 * 60),
            snapshot_threshold: 100,
            session_expiry: Duration::from_secs(60 * 60),
            slow_client_ratio: 0.0,
            slow_client_max_delay: Duration::from_millis(500),
            quit_drain_timeout: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Defaults with `CHAT_*` environment overrides applied
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(dir) = lookup("CHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("CHAT_MAILBOX_CAPACITY") {
            config.mailbox_capacity = parse("CHAT_MAILBOX_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("CHAT_SNAPSHOT_THRESHOLD") {
            config.snapshot_threshold = parse("CHAT_SNAPSHOT_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("CHAT_SLOW_CLIENT_RATIO") {
            config.slow_client_ratio = parse("CHAT_SLOW_CLIENT_RATIO", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.mailbox_capacity == 0 {
            return Err(AppError::Config("mailbox capacity must be at least 1".to_string()));
        }
        if self.command_buffer == 0 {
            return Err(AppError::Config("command buffer must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.slow_client_ratio) {
            return Err(AppError::Config(format!(
                "slow client ratio {} is outside 0..=1",
                self.slow_client_ratio
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{}={} is not valid", key, value)))
}
