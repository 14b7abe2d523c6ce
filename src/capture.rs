//! Capture state machine
//!
//! Drives one run: open the device, optionally pulse reset, then classify
//! each line until a terminal verdict. Per iteration the loop checks, in
//! order: the time budget, the interrupt flag, then one bounded read.
//! A line is checked against fault patterns before the success token, so a
//! line carrying both is a fault.

use crate::config::{CaptureConfig, RESET_SETTLE};
use crate::error::CaptureError;
use crate::patterns::PatternRegistry;
use crate::serial::{Device, LineSource, ReadOutcome};
use crate::transcript::{Style, Tone, TranscriptSink};
use std::fmt;
use std::io::{self, Stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RULE_WIDTH: usize = 60;

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Timeout,
    FaultDetected { pattern: String, line: String },
    Interrupted,
    StreamError(String),
    ConfigError(String),
}

impl Verdict {
    /// Process exit status for this verdict
    pub fn exit_code(&self) -> u8 {
        match self {
            Verdict::Success => 0,
            Verdict::Timeout | Verdict::Interrupted => 1,
            Verdict::FaultDetected { .. } => 2,
            Verdict::StreamError(_) => 3,
            Verdict::ConfigError(_) => 4,
        }
    }
}

impl From<CaptureError> for Verdict {
    fn from(err: CaptureError) -> Self {
        if err.is_config() {
            Verdict::ConfigError(err.to_string())
        } else {
            Verdict::StreamError(err.to_string())
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Success => write!(f, "success"),
            Verdict::Timeout => write!(f, "timeout"),
            Verdict::FaultDetected { pattern, .. } => write!(f, "fault ({})", pattern),
            Verdict::Interrupted => write!(f, "interrupted"),
            Verdict::StreamError(msg) => write!(f, "stream error: {}", msg),
            Verdict::ConfigError(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

/// Counters reported when a run ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub elapsed: Duration,
    /// Non-empty lines processed
    pub lines: usize,
}

/// Verdict plus stats for a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub verdict: Verdict,
    pub stats: RunStats,
}

impl CaptureReport {
    pub fn exit_code(&self) -> u8 {
        self.verdict.exit_code()
    }
}

/// A configured run, ready to open the device
pub struct CaptureSession<W: Write> {
    config: CaptureConfig,
    registry: PatternRegistry,
    sink: TranscriptSink<W>,
    interrupt: Arc<AtomicBool>,
}

impl CaptureSession<Stdout> {
    /// Prepare a run that displays on stdout
    pub fn prepare(config: CaptureConfig) -> Result<Self, CaptureError> {
        Self::with_display(config, io::stdout())
    }
}

impl<W: Write> CaptureSession<W> {
    /// Compile patterns and open the transcript. Every configuration error
    /// surfaces here, before the device is touched.
    pub fn with_display(config: CaptureConfig, display: W) -> Result<Self, CaptureError> {
        let registry = PatternRegistry::new(&config.success_token, &config.fault_patterns)?;
        log::debug!(
            "fault patterns: {:?}",
            registry
                .fault_patterns()
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
        );
        let style = Style::new(config.color, config.timestamps);
        let sink = TranscriptSink::open(display, config.transcript.as_deref(), style)?;

        Ok(Self {
            config,
            registry,
            sink,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that requests a cooperative stop when set
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Run to a verdict. The device and transcript are closed before this
    /// returns, whatever the outcome.
    pub fn run<D, F>(mut self, open: F) -> CaptureReport
    where
        D: Device,
        F: FnOnce(&CaptureConfig) -> Result<D, CaptureError>,
    {
        self.print_header();

        let mut device = match open(&self.config) {
            Ok(device) => device,
            Err(e) => return self.finish(Verdict::from(e), RunStats::default(), false),
        };

        if self.config.reset_pulse {
            if let Err(e) = device.pulse_reset(RESET_SETTLE) {
                drop(device);
                return self.finish(Verdict::from(e), RunStats::default(), false);
            }
            let msg = "[INFO] DTR toggled, reset pulse sent";
            let shown = self.sink.style().paint(msg, Tone::Notice);
            self.sink.notice(&shown);
        }

        log::debug!(
            "capturing for {:?}, polling every {:?}",
            self.config.time_budget,
            self.config.poll_interval
        );
        let mut source = LineSource::new(device);
        let started = Instant::now();
        let mut lines = 0usize;

        let verdict = loop {
            if started.elapsed() >= self.config.time_budget {
                break Verdict::Timeout;
            }
            if self.interrupt.load(Ordering::SeqCst) {
                break Verdict::Interrupted;
            }

            let line = match source.next_line() {
                Ok(ReadOutcome::Line(line)) => line,
                Ok(ReadOutcome::Empty) => continue,
                Err(e) => break Verdict::from(e),
            };
            lines += 1;

            if let Some(pattern) = self.registry.match_fault(&line) {
                let kind = if pattern.is_builtin() { "built-in" } else { "custom" };
                let pattern = pattern.as_str().to_string();
                log::debug!("line {} matched {} fault pattern {:?}", lines, kind, pattern);
                self.emit_line(&line, Tone::Failure);
                break Verdict::FaultDetected { pattern, line };
            }
            if self.registry.match_success(&line) {
                log::debug!("line {} contains the success token", lines);
                self.emit_line(&line, Tone::Success);
                break Verdict::Success;
            }
            self.emit_line(&line, Tone::Plain);
        };

        drop(source);

        let stats = RunStats {
            elapsed: started.elapsed(),
            lines,
        };
        self.finish(verdict, stats, true)
    }

    fn emit_line(&mut self, line: &str, tone: Tone) {
        let shown = self.sink.style().decorate_line(line, tone);
        self.sink.emit(line, &shown);
    }

    fn print_header(&mut self) {
        let port = &self.config.port;
        let header = format!(
            "[boot-capture] port={}  baud={}  timeout={}s  expect='{}'",
            port.port_path,
            port.baud_rate,
            self.config.time_budget.as_secs_f64(),
            self.config.success_token
        );
        let shown = self.sink.style().paint(&header, Tone::Info);
        self.sink.notice(&shown);
        if let Some(path) = self.sink.transcript_path() {
            let msg = format!("[boot-capture] transcript={}", path.display());
            let shown = self.sink.style().paint(&msg, Tone::Info);
            self.sink.notice(&shown);
        }
        self.sink.notice(&"-".repeat(RULE_WIDTH));
    }

    /// Report the verdict and drop the sink, closing the transcript.
    ///
    /// A run that failed to open or reset the device leaves the transcript
    /// file empty.
    fn finish(mut self, verdict: Verdict, stats: RunStats, captured: bool) -> CaptureReport {
        self.sink.notice(&"-".repeat(RULE_WIDTH));

        let (summary, tone) = self.summarize(&verdict, &stats);
        let shown = self.sink.style().paint(&summary, tone);
        if captured {
            self.sink.emit(&summary, &shown);
        } else {
            self.sink.notice(&shown);
        }

        let elapsed = format!(
            "[boot-capture] elapsed {:.1}s, {} lines",
            stats.elapsed.as_secs_f64(),
            stats.lines
        );
        self.sink.notice(&elapsed);

        log::debug!("verdict: {} after {:?}", verdict, stats.elapsed);
        CaptureReport { verdict, stats }
    }

    /// Verdict line for the transcript. Holds no wall-clock values so that
    /// identical device output gives an identical transcript.
    fn summarize(&self, verdict: &Verdict, stats: &RunStats) -> (String, Tone) {
        let token = &self.config.success_token;
        match verdict {
            Verdict::Success => (
                format!("[SUCCESS] '{}' received, boot succeeded ({} lines)", token, stats.lines),
                Tone::Success,
            ),
            Verdict::Timeout => (
                format!(
                    "[TIMEOUT] '{}' not received within {}s ({} lines)",
                    token,
                    self.config.time_budget.as_secs_f64(),
                    stats.lines
                ),
                Tone::Notice,
            ),
            Verdict::FaultDetected { pattern, line } => (
                format!("[FAIL] runtime fault detected ({}): {}", pattern, line),
                Tone::Failure,
            ),
            Verdict::Interrupted => (
                format!("[INTERRUPTED] stopped by user ({} lines)", stats.lines),
                Tone::Notice,
            ),
            Verdict::StreamError(msg) => (format!("[ERROR] {}", msg), Tone::Failure),
            Verdict::ConfigError(msg) => (format!("[ERROR] {}", msg), Tone::Failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::fs;
    use std::io::{self, Read, Write};
    use std::path::Path;
    use std::rc::Rc;

    const POLL: Duration = Duration::from_millis(5);

    enum Step {
        Data(&'static [u8]),
        Fail(io::ErrorKind),
    }

    /// Device that replays a script, then stays silent
    struct ScriptedDevice {
        steps: VecDeque<Step>,
        resets: Rc<Cell<usize>>,
        reads_before_reset: Rc<Cell<usize>>,
        reads: usize,
        reset_fails: bool,
        closed: Rc<Cell<bool>>,
    }

    impl ScriptedDevice {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                resets: Rc::default(),
                reads_before_reset: Rc::default(),
                reads: 0,
                reset_fails: false,
                closed: Rc::default(),
            }
        }

        fn lines(data: &'static [u8]) -> Self {
            Self::new(vec![Step::Data(data)])
        }
    }

    impl Read for ScriptedDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.steps.pop_front() {
                Some(Step::Data(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
                None => {
                    std::thread::sleep(POLL);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "poll"))
                }
            }
        }
    }

    impl Device for ScriptedDevice {
        fn pulse_reset(&mut self, _settle: Duration) -> Result<(), CaptureError> {
            self.resets.set(self.resets.get() + 1);
            self.reads_before_reset.set(self.reads);
            if self.reset_fails {
                return Err(CaptureError::Control(serialport::Error::new(
                    serialport::ErrorKind::Io(io::ErrorKind::BrokenPipe),
                    "dtr",
                )));
            }
            Ok(())
        }
    }

    impl Drop for ScriptedDevice {
        fn drop(&mut self) {
            self.closed.set(true);
        }
    }

    /// Display buffer readable after the session is consumed
    #[derive(Clone, Default)]
    struct Screen(Rc<RefCell<Vec<u8>>>);

    impl Write for Screen {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Screen {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn config(token: &str, budget_secs: f64) -> CaptureConfig {
        CaptureConfig::new("/dev/scripted")
            .with_success_token(token)
            .unwrap()
            .with_time_budget_secs(budget_secs)
            .unwrap()
            .with_poll_interval(POLL)
    }

    fn run_with(config: CaptureConfig, device: ScriptedDevice) -> (CaptureReport, String) {
        let screen = Screen::default();
        let session = CaptureSession::with_display(config, screen.clone()).unwrap();
        let report = session.run(|_| Ok(device));
        (report, screen.text())
    }

    fn transcript(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_success_token_observed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let config = config("READY", 5.0).with_transcript(Some(log.clone()));

        let (report, screen) = run_with(config, ScriptedDevice::lines(b"boot\nREADY\n"));

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.stats.lines, 2);

        let lines = transcript(&log);
        assert_eq!(&lines[..2], ["boot", "READY"]);
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("[SUCCESS]"));
        assert!(lines[2].contains("READY"));

        assert!(screen.contains("port=/dev/scripted"));
        assert!(screen.contains("[SUCCESS] 'READY' received"));
        assert!(screen.contains("elapsed"));
    }

    #[test]
    fn test_hard_fault_detected() {
        let (report, _) = run_with(
            config("SYSTEM READY", 5.0),
            ScriptedDevice::lines(b"booting\n... HardFault ...\nSYSTEM READY\n"),
        );

        assert_eq!(
            report.verdict,
            Verdict::FaultDetected {
                pattern: "HardFault".to_string(),
                line: "... HardFault ...".to_string(),
            }
        );
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.stats.lines, 2);
    }

    #[test]
    fn test_fault_beats_success_on_same_line() {
        let (report, _) = run_with(
            config("SYSTEM READY", 5.0),
            ScriptedDevice::lines(b"SYSTEM READY Guru Meditation Error: Core 0\n"),
        );
        assert!(matches!(
            report.verdict,
            Verdict::FaultDetected { ref pattern, .. } if pattern == "Guru Meditation Error"
        ));
    }

    #[test]
    fn test_first_declared_pattern_reported() {
        let (report, _) = run_with(
            config("READY", 5.0),
            ScriptedDevice::lines(b"panic_abort Backtrace: 0x400d WDT reset\n"),
        );
        assert!(matches!(
            report.verdict,
            Verdict::FaultDetected { ref pattern, .. } if pattern == "WDT reset"
        ));
    }

    #[test]
    fn test_custom_pattern_detected() {
        let config = config("READY", 5.0)
            .with_fault_patterns(vec![r"E \(\d+\) boot: .*invalid".to_string()]);
        let (report, _) = run_with(
            config,
            ScriptedDevice::lines(b"E (311) boot: image header invalid\n"),
        );
        assert!(matches!(
            report.verdict,
            Verdict::FaultDetected { ref pattern, .. } if pattern == r"E \(\d+\) boot: .*invalid"
        ));
    }

    #[test]
    fn test_timeout_respects_budget() {
        let budget = Duration::from_millis(250);
        let start = Instant::now();
        let (report, screen) = run_with(
            config("READY", budget.as_secs_f64()),
            ScriptedDevice::new(vec![]),
        );
        let took = start.elapsed();

        assert_eq!(report.verdict, Verdict::Timeout);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.stats.lines, 0);
        assert!(report.stats.elapsed >= budget);
        assert!(took < budget + Duration::from_secs(1));
        assert!(screen.contains("[TIMEOUT] 'READY' not received within 0.25s (0 lines)"));
    }

    #[test]
    fn test_zero_budget_times_out_without_reading() {
        // The success line is ready, but the budget is checked before any read
        let (report, _) = run_with(config("READY", 0.0), ScriptedDevice::lines(b"READY\n"));
        assert_eq!(report.verdict, Verdict::Timeout);
        assert_eq!(report.stats.lines, 0);
    }

    #[test]
    fn test_only_non_empty_lines_counted() {
        let device = ScriptedDevice::new(vec![
            Step::Data(b"\r\n"),
            Step::Fail(io::ErrorKind::TimedOut),
            Step::Data(b"one\r\n\r\n\n"),
            Step::Data(b""),
            Step::Data(b"two\n\ntwo and a half"),
            Step::Fail(io::ErrorKind::TimedOut),
            Step::Data(b"\n\n"),
        ]);
        let (report, _) = run_with(config("READY", 0.2), device);

        assert_eq!(report.verdict, Verdict::Timeout);
        assert_eq!(report.stats.lines, 3);
    }

    #[test]
    fn test_interrupt_closes_device() {
        let device = ScriptedDevice::lines(b"READY\n");
        let closed = Rc::clone(&device.closed);

        let screen = Screen::default();
        let session = CaptureSession::with_display(config("READY", 5.0), screen.clone()).unwrap();
        session.interrupt_flag().store(true, Ordering::SeqCst);
        let report = session.run(|_| Ok(device));

        assert_eq!(report.verdict, Verdict::Interrupted);
        assert_eq!(report.exit_code(), 1);
        assert!(closed.get());
        assert!(screen.text().contains("[INTERRUPTED]"));
    }

    #[test]
    fn test_interrupt_during_silence() {
        let screen = Screen::default();
        let session = CaptureSession::with_display(config("READY", 30.0), screen).unwrap();
        let flag = session.interrupt_flag();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        let report = session.run(|_| Ok(ScriptedDevice::new(vec![])));
        stopper.join().unwrap();

        assert_eq!(report.verdict, Verdict::Interrupted);
        assert!(report.stats.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_read_error_mid_capture() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let device = ScriptedDevice::new(vec![
            Step::Data(b"rst:0x1 (POWERON_RESET)\n"),
            Step::Fail(io::ErrorKind::BrokenPipe),
        ]);
        let closed = Rc::clone(&device.closed);

        let (report, _) = run_with(config("READY", 5.0).with_transcript(Some(log.clone())), device);

        assert!(matches!(report.verdict, Verdict::StreamError(ref m) if m.contains("scripted failure")));
        assert_eq!(report.exit_code(), 3);
        assert_eq!(report.stats.lines, 1);
        assert!(closed.get());

        let lines = transcript(&log);
        assert_eq!(lines[0], "rst:0x1 (POWERON_RESET)");
        assert!(lines[1].starts_with("[ERROR] serial read failed"));
    }

    #[test]
    fn test_open_failure_leaves_transcript_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let screen = Screen::default();
        let session = CaptureSession::with_display(
            config("READY", 5.0).with_transcript(Some(log.clone())),
            screen.clone(),
        )
        .unwrap();

        let report = session.run(|config| {
            Err::<ScriptedDevice, _>(CaptureError::Open {
                path: config.port.port_path.clone(),
                source: serialport::Error::new(serialport::ErrorKind::NoDevice, "no such device"),
            })
        });

        assert!(matches!(report.verdict, Verdict::StreamError(_)));
        assert_eq!(report.exit_code(), 3);
        assert_eq!(report.stats, RunStats::default());
        assert_eq!(fs::read_to_string(&log).unwrap(), "");
        assert!(screen.text().contains("failed to open serial port /dev/scripted"));
    }

    #[test]
    fn test_invalid_pattern_fails_before_open() {
        let config = config("READY", 5.0).with_fault_patterns(vec!["(unclosed".to_string()]);
        let err = CaptureSession::with_display(config, Screen::default()).err().unwrap();
        assert_eq!(Verdict::from(err).exit_code(), 4);
    }

    #[test]
    fn test_reset_pulse_precedes_reads() {
        let device = ScriptedDevice::lines(b"READY\n");
        let resets = Rc::clone(&device.resets);
        let reads_before_reset = Rc::clone(&device.reads_before_reset);

        let (report, screen) = run_with(config("READY", 5.0).with_reset_pulse(true), device);

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(resets.get(), 1);
        assert_eq!(reads_before_reset.get(), 0);
        assert!(screen.contains("reset pulse sent"));
    }

    #[test]
    fn test_reset_failure_is_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let mut device = ScriptedDevice::lines(b"READY\n");
        device.reset_fails = true;
        let closed = Rc::clone(&device.closed);

        let (report, screen) = run_with(
            config("READY", 5.0)
                .with_reset_pulse(true)
                .with_transcript(Some(log.clone())),
            device,
        );

        assert_eq!(
            report.verdict,
            Verdict::StreamError("failed to drive control line: dtr".to_string())
        );
        assert_eq!(report.exit_code(), 3);
        assert_eq!(report.stats, RunStats::default());
        assert!(closed.get());
        assert_eq!(fs::read_to_string(&log).unwrap(), "");
        assert!(screen.contains("[ERROR] failed to drive control line"));
        assert!(!screen.contains("reset pulse sent"));
    }

    #[test]
    fn test_no_reset_unless_requested() {
        let device = ScriptedDevice::lines(b"READY\n");
        let resets = Rc::clone(&device.resets);
        run_with(config("READY", 5.0), device);
        assert_eq!(resets.get(), 0);
    }

    #[test]
    fn test_malformed_bytes_do_not_end_run() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let (report, _) = run_with(
            config("READY", 5.0).with_transcript(Some(log.clone())),
            ScriptedDevice::lines(b"\xfe\xffgarbage\nREADY\n"),
        );

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(transcript(&log)[0], "\u{FFFD}\u{FFFD}garbage");
    }

    #[test]
    fn test_transcript_independent_of_decoration() {
        let dir = tempfile::tempdir().unwrap();
        let output = b"boot\nI (30) app: starting\nREADY\n";

        let plain = dir.path().join("plain.log");
        run_with(
            config("READY", 5.0).with_transcript(Some(plain.clone())),
            ScriptedDevice::lines(output),
        );

        let fancy = dir.path().join("fancy.log");
        run_with(
            config("READY", 5.0)
                .with_transcript(Some(fancy.clone()))
                .with_color(true)
                .with_timestamps(true),
            ScriptedDevice::lines(output),
        );

        assert_eq!(fs::read(&plain).unwrap(), fs::read(&fancy).unwrap());
    }

    #[test]
    fn test_colored_display_keeps_file_plain() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("boot.log");
        let (report, screen) = run_with(
            config("READY", 5.0)
                .with_transcript(Some(log.clone()))
                .with_color(true),
            ScriptedDevice::lines(b"boot\nREADY\n"),
        );

        assert_eq!(report.verdict, Verdict::Success);
        assert!(screen.contains("\x1b[32mREADY\x1b[0m"));

        let written = fs::read_to_string(&log).unwrap();
        assert!(written.starts_with("boot\nREADY\n[SUCCESS]"));
        assert!(!written.contains('\x1b'));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Verdict::Success.exit_code(), 0);
        assert_eq!(Verdict::Timeout.exit_code(), 1);
        assert_eq!(Verdict::Interrupted.exit_code(), 1);
        assert_eq!(
            Verdict::FaultDetected {
                pattern: "BusFault".to_string(),
                line: "BusFault".to_string()
            }
            .exit_code(),
            2
        );
        assert_eq!(Verdict::StreamError("gone".to_string()).exit_code(), 3);
        assert_eq!(Verdict::ConfigError("bad".to_string()).exit_code(), 4);
    }
}
