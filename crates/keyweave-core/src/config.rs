//! Persistent configuration for keyweave.
//!
//! Stores user defaults in `~/.keyweave/config.json`. Every field is
//! optional in the file; anything missing takes its default, and a missing
//! or unreadable file yields [`KeyweaveConfig::default`].
//!
//! # Example
//!
//! ```no_run
//! use keyweave_core::config::KeyweaveConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = KeyweaveConfig::load();
//! let settings = config.executor_settings();
//!
//! println!("while loops stop after {} iterations", settings.while_iteration_limit);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::color::DEFAULT_TOLERANCE;
use crate::commands::DEFAULT_TYPE_DELAY;

const CONFIG_FILENAME: &str = "config.json";

/// Hard ceiling on `while` iterations unless configured otherwise.
pub const DEFAULT_WHILE_LIMIT: u64 = 100_000;

/// Returns the keyweave state directory (`~/.keyweave/`), creating it if
/// needed.
///
/// Falls back to `./.keyweave` when the home directory cannot be
/// determined.
pub fn keyweave_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".keyweave");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Persistent keyweave configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyweaveConfig {
    /// Speed multiplier used when a run does not specify one.
    pub default_speed: f64,
    /// How many times a script runs when not told otherwise.
    pub default_iterations: u32,
    pub while_iteration_limit: u64,
    /// Delay between characters typed by `type`, before speed scaling.
    pub type_delay_ms: u64,
    /// Tolerance for `pixel` conditions that do not give one.
    pub pixel_tolerance: f64,
}

impl Default for KeyweaveConfig {
    fn default() -> Self {
        Self {
            default_speed: 1.0,
            default_iterations: 1,
            while_iteration_limit: DEFAULT_WHILE_LIMIT,
            type_delay_ms: DEFAULT_TYPE_DELAY.as_millis() as u64,
            pixel_tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl KeyweaveConfig {
    pub fn path() -> PathBuf {
        keyweave_dir().join(CONFIG_FILENAME)
    }

    /// Load config from `~/.keyweave/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.keyweave/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            while_iteration_limit: self.while_iteration_limit.max(1),
            type_delay: Duration::from_millis(self.type_delay_ms),
            pixel_tolerance: self.pixel_tolerance,
        }
    }
}

/// Tunables consumed by [`MacroExecutor`](crate::executor::MacroExecutor).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub while_iteration_limit: u64,
    pub type_delay: Duration,
    pub pixel_tolerance: f64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        KeyweaveConfig::default().executor_settings()
    }
}
