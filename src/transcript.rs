//! Live display and durable transcript for a capture run
//!
//! The display gets decorated text; the transcript file only ever gets the
//! raw line text, so it is identical whatever the color and timestamp
//! settings were.

use crate::error::CaptureError;
use chrono::Local;
use colored::Color;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Role of a line, used to pick its color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Plain,
    Info,
    Notice,
    Success,
    Failure,
}

/// Display formatting policy for one run.
///
/// Escape codes are written directly, so colored output depends only on
/// `color` and never on the terminal or environment.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    color: bool,
    timestamps: bool,
}

impl Style {
    pub fn new(color: bool, timestamps: bool) -> Self {
        Self { color, timestamps }
    }

    /// Color `text` for its tone, or return it untouched when color is off
    pub fn paint(&self, text: &str, tone: Tone) -> String {
        let color = match tone {
            Tone::Plain => None,
            Tone::Info => Some(Color::Cyan),
            Tone::Notice => Some(Color::Yellow),
            Tone::Success => Some(Color::Green),
            Tone::Failure => Some(Color::Red),
        };
        match color {
            Some(color) if self.color => ansi(&color.to_fg_str(), text),
            _ => text.to_string(),
        }
    }

    /// Display form of a device line: optional timestamp prefix, then color
    pub fn decorate_line(&self, line: &str, tone: Tone) -> String {
        let painted = self.paint(line, tone);
        if !self.timestamps {
            return painted;
        }

        let stamp = format!("[{}]", Local::now().format("%H:%M:%S%.3f"));
        if self.color {
            format!("{} {}", ansi(DIM, &stamp), painted)
        } else {
            format!("{} {}", stamp, painted)
        }
    }
}

const DIM: &str = "2";

fn ansi(code: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", code, text)
}

/// Mirrors captured lines to the display and, optionally, a transcript file
pub struct TranscriptSink<W: Write> {
    display: W,
    file: Option<File>,
    path: Option<PathBuf>,
    style: Style,
}

impl<W: Write> TranscriptSink<W> {
    /// Create the sink, creating the transcript file and its parent
    /// directories if a path is given
    pub fn open(display: W, path: Option<&Path>, style: Style) -> Result<Self, CaptureError> {
        let file = match path {
            Some(path) => Some(create_transcript(path)?),
            None => None,
        };

        Ok(Self {
            display,
            file,
            path: path.map(Path::to_path_buf),
            style,
        })
    }

    pub fn style(&self) -> &Style {
        &self.style
    }

    pub fn transcript_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write `decorated` to the display and `raw` to the transcript file.
    ///
    /// The file is flushed after every line so a tail shows live progress.
    pub fn emit(&mut self, raw: &str, decorated: &str) {
        self.notice(decorated);

        if let Some(file) = self.file.as_mut() {
            let written = writeln!(file, "{}", raw).and_then(|_| file.flush());
            if let Err(e) = written {
                log::warn!("transcript write failed: {}", e);
            }
        }
    }

    /// Write to the display only
    pub fn notice(&mut self, decorated: &str) {
        let written = writeln!(self.display, "{}", decorated).and_then(|_| self.display.flush());
        if let Err(e) = written {
            log::warn!("display write failed: {}", e);
        }
    }
}

fn create_transcript(path: &Path) -> Result<File, CaptureError> {
    let wrap = |source: io::Error| CaptureError::Transcript {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    File::create(path).map_err(wrap)
}
