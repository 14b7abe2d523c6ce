//! Capture configuration
//!
//! A [`CaptureConfig`] is assembled once from the command line and an
//! optional TOML file, validated, and never mutated afterwards.

use crate::error::CaptureError;
use crate::serial::PortConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SUCCESS_TOKEN: &str = "SYSTEM READY";
pub const DEFAULT_TIME_BUDGET_SECS: f64 = 60.0;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long DTR stays deasserted during a reset pulse
pub const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Settings for one capture run
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub port: PortConfig,
    /// Literal text whose appearance means the boot succeeded
    pub success_token: String,
    /// Caller-supplied fault regexes, checked after the built-ins
    pub fault_patterns: Vec<String>,
    pub time_budget: Duration,
    /// Upper bound on one device read; also the port read timeout
    pub poll_interval: Duration,
    pub timestamps: bool,
    pub color: bool,
    pub reset_pulse: bool,
    pub transcript: Option<PathBuf>,
}

impl CaptureConfig {
    /// Defaults for the given device path
    pub fn new(port_path: &str) -> Self {
        Self {
            port: PortConfig::new(port_path).with_timeout(DEFAULT_POLL_INTERVAL),
            success_token: DEFAULT_SUCCESS_TOKEN.to_string(),
            fault_patterns: Vec::new(),
            time_budget: Duration::from_secs_f64(DEFAULT_TIME_BUDGET_SECS),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timestamps: false,
            color: false,
            reset_pulse: false,
            transcript: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.port = self.port.with_baud_rate(baud_rate);
        self
    }

    pub fn with_success_token(mut self, token: &str) -> Result<Self, CaptureError> {
        if token.is_empty() {
            return Err(CaptureError::InvalidConfig(
                "success token must not be empty".to_string(),
            ));
        }
        self.success_token = token.to_string();
        Ok(self)
    }

    /// Set the time budget from fractional seconds
    pub fn with_time_budget_secs(mut self, secs: f64) -> Result<Self, CaptureError> {
        self.time_budget = Duration::try_from_secs_f64(secs).map_err(|_| {
            CaptureError::InvalidConfig(format!(
                "timeout must be a non-negative number of seconds, got {}",
                secs
            ))
        })?;
        Ok(self)
    }

    /// Set the per-read poll interval (also the port read timeout)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.port = self.port.with_timeout(interval);
        self
    }

    pub fn with_fault_patterns(mut self, patterns: Vec<String>) -> Self {
        self.fault_patterns = patterns;
        self
    }

    pub fn with_transcript(mut self, path: Option<PathBuf>) -> Self {
        self.transcript = path;
        self
    }

    pub fn with_timestamps(mut self, on: bool) -> Self {
        self.timestamps = on;
        self
    }

    pub fn with_color(mut self, on: bool) -> Self {
        self.color = on;
        self
    }

    pub fn with_reset_pulse(mut self, on: bool) -> Self {
        self.reset_pulse = on;
        self
    }
}

/// Optional settings loaded from a TOML file. Command-line flags win.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub baud: Option<u32>,
    pub expect: Option<String>,
    pub timeout: Option<f64>,
    pub fail_patterns: Vec<String>,
    pub timestamp: Option<bool>,
    pub reset_dtr: Option<bool>,
    pub color: Option<bool>,
    pub output: Option<PathBuf>,
}

impl FileSettings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, CaptureError> {
        let text = fs::read_to_string(path).map_err(|source| CaptureError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| CaptureError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}
