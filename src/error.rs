//! Error taxonomy for a capture run
//!
//! Configuration errors are raised before any device I/O. Stream errors
//! end a run that has already started talking to the device.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced while configuring or running a capture
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A fault pattern failed to compile
    #[error("invalid fault pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A capture setting is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The config file could not be read
    #[error("failed to read config file {}: {source}", .path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The config file is not valid TOML for our settings
    #[error("failed to parse config file {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The transcript file (or its parent directory) could not be created
    #[error("cannot open transcript {}: {source}", .path.display())]
    Transcript {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The serial device could not be opened
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    /// Toggling a modem control line failed
    #[error("failed to drive control line: {0}")]
    Control(#[source] serialport::Error),

    /// Reading from an open device failed
    #[error("serial read failed: {0}")]
    Read(#[source] io::Error),
}

impl CaptureError {
    /// Whether this error belongs to the configuration class (raised before
    /// any device I/O) rather than the stream class
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CaptureError::InvalidPattern { .. }
                | CaptureError::InvalidConfig(_)
                | CaptureError::ConfigFile { .. }
                | CaptureError::ConfigParse { .. }
                | CaptureError::Transcript { .. }
        )
    }
}
