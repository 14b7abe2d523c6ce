//! Line framing over a bounded-read byte stream
//!
//! Each call to [`LineSource::next_line`] performs at most one read, so the
//! caller regains control at least once per poll interval.

use crate::error::CaptureError;
use std::io::{self, Read};

const READ_CHUNK: usize = 512;

/// Longest run of bytes held without a newline before it is emitted as a line
const MAX_LINE_BYTES: usize = 4096;

/// Result of one poll of the line source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete, non-empty, newline-stripped line
    Line(String),
    /// No complete line this poll
    Empty,
}

/// Splits a device byte stream into decoded text lines
pub struct LineSource<R> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: Read> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Return the next non-empty line, or `Empty` if none is ready yet.
    ///
    /// A poll that yields no bytes while a partial line is buffered flushes
    /// that partial line, so a prompt printed without a trailing newline is
    /// still seen.
    pub fn next_line(&mut self) -> Result<ReadOutcome, CaptureError> {
        if let Some(line) = self.take_buffered_line() {
            return Ok(ReadOutcome::Line(line));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let read = match self.reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if is_empty_poll(&e) => 0,
            Err(e) => return Err(CaptureError::Read(e)),
        };

        if read == 0 {
            return Ok(self.flush_pending());
        }

        self.pending.extend_from_slice(&chunk[..read]);
        if let Some(line) = self.take_buffered_line() {
            return Ok(ReadOutcome::Line(line));
        }
        if self.pending.len() >= MAX_LINE_BYTES {
            return Ok(self.flush_pending());
        }
        Ok(ReadOutcome::Empty)
    }

    /// Emit whatever is buffered as a line, newline or not
    fn flush_pending(&mut self) -> ReadOutcome {
        let partial = std::mem::take(&mut self.pending);
        match decode(&partial) {
            Some(line) => ReadOutcome::Line(line),
            None => ReadOutcome::Empty,
        }
    }

    /// Pop complete lines off the buffer until a non-empty one turns up
    fn take_buffered_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = decode(&raw) {
                return Some(line);
            }
        }
        None
    }
}

fn is_empty_poll(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Lossy UTF-8 decode with trailing CR/LF removed; `None` for blank lines
fn decode(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}
