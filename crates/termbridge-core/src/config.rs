//! Configuration for the session manager.
//!
//! Loads from a TOML file with sensible defaults; a missing file yields
//! the defaults unchanged.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Session manager configuration.
///
/// All durations are stored in milliseconds so the TOML surface stays
/// flat; use the accessor methods for `Duration` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Executable spawned for every new session, resolved from `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Deadline for `send` (race-to-terminal-event).
    pub reply_timeout_ms: u64,
    /// Quiet interval for `send_settled`.
    pub settle_window_ms: u64,
    /// Time between the graceful signal and the forceful kill.
    pub grace_period_ms: u64,
    /// How long `start` collects initial output before returning.
    /// Zero returns immediately with whatever has already arrived.
    pub startup_window_ms: u64,
    /// Placeholder returned when a settled reply is empty.
    pub empty_reply: String,
}

impl Config {
    const DEFAULT_PROGRAM: &str = "opencode";
    const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;
    const DEFAULT_SETTLE_WINDOW_MS: u64 = 500;
    const DEFAULT_GRACE_PERIOD_MS: u64 = 1_000;
    const DEFAULT_EMPTY_REPLY: &str = "(no output)";

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program: Self::DEFAULT_PROGRAM.to_string(),
            args: Vec::new(),
            reply_timeout_ms: Self::DEFAULT_REPLY_TIMEOUT_MS,
            settle_window_ms: Self::DEFAULT_SETTLE_WINDOW_MS,
            grace_period_ms: Self::DEFAULT_GRACE_PERIOD_MS,
            startup_window_ms: 0,
            empty_reply: Self::DEFAULT_EMPTY_REPLY.to_string(),
        }
    }
}
