//! Boot Capture
//!
//! Watches an embedded device's serial console and decides whether it
//! booted: the success token was seen, a runtime fault was printed, or
//! neither happened within the time budget.
//!
//! # Usage
//!
//! ```bash
//! # Wait up to 60s for "SYSTEM READY", resetting the board first
//! boot-capture capture -p /dev/ttyUSB0 --reset-dtr --output logs/boot.log
//!
//! # Custom token, budget and extra fault pattern
//! boot-capture capture -p /dev/ttyACM0 -e "app_main ready" -t 20 \
//!     --fail-pattern 'E \(\d+\) boot:'
//!
//! # List available serial ports
//! boot-capture ports
//! ```
//!
//! # Exit status
//!
//! | Code | Meaning |
//! |---|---|
//! | 0 | success token received |
//! | 1 | timeout, or interrupted with Ctrl+C |
//! | 2 | fault pattern matched |
//! | 3 | serial port open/read error |
//! | 4 | configuration error |

mod capture;
mod config;
mod error;
mod patterns;
mod serial;
mod transcript;

use clap::{error::ErrorKind, Args, Parser, Subcommand};
use colored::Colorize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capture::{CaptureSession, Verdict};
use config::{CaptureConfig, FileSettings};
use error::CaptureError;
use serial::SerialConnection;

/// Boot Capture
///
/// Capture an embedded device's boot output and classify the outcome
#[derive(Parser)]
#[command(name = "boot-capture")]
#[command(author = "Prasanna Gautam")]
#[command(version)]
#[command(about = "Capture embedded boot output over serial and classify the outcome")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture serial output until the success token, a fault, or timeout
    Capture(CaptureArgs),

    /// List available serial ports
    Ports,
}

#[derive(Args)]
struct CaptureArgs {
    /// Serial port path (e.g., /dev/ttyUSB0, /dev/ttyACM0, COM3)
    #[arg(short, long)]
    port: String,

    /// Baud rate [default: 115200]
    #[arg(short, long)]
    baud: Option<u32>,

    /// Write an undecorated transcript to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Text that marks a successful boot [default: "SYSTEM READY"]
    #[arg(short, long)]
    expect: Option<String>,

    /// Time budget in seconds [default: 60]
    #[arg(short, long, allow_negative_numbers = true)]
    timeout: Option<f64>,

    /// Extra fault pattern (regex), may be given more than once
    #[arg(long = "fail-pattern", value_name = "PATTERN")]
    fail_patterns: Vec<String>,

    /// Disable ANSI colors
    #[arg(long)]
    no_color: bool,

    /// Prefix each displayed line with a timestamp
    #[arg(long)]
    timestamp: bool,

    /// Toggle DTR when the port opens to reset the board
    #[arg(long)]
    reset_dtr: bool,

    /// Read defaults from a TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl CaptureArgs {
    /// Merge flags over the config file over built-in defaults
    fn into_config(self) -> Result<CaptureConfig, CaptureError> {
        let file = match self.config {
            Some(ref path) => FileSettings::load(path)?,
            None => FileSettings::default(),
        };

        let mut config = CaptureConfig::new(&self.port);
        if let Some(baud) = self.baud.or(file.baud) {
            config = config.with_baud_rate(baud);
        }
        if let Some(token) = self.expect.as_deref().or(file.expect.as_deref()) {
            config = config.with_success_token(token)?;
        }
        if let Some(secs) = self.timeout.or(file.timeout) {
            config = config.with_time_budget_secs(secs)?;
        }

        let mut patterns = file.fail_patterns;
        patterns.extend(self.fail_patterns);

        let color = !self.no_color
            && file.color.unwrap_or(true)
            && std::io::stdout().is_terminal();

        Ok(config
            .with_fault_patterns(patterns)
            .with_transcript(self.output.or(file.output))
            .with_timestamps(self.timestamp || file.timestamp.unwrap_or(false))
            .with_reset_pulse(self.reset_dtr || file.reset_dtr.unwrap_or(false))
            .with_color(color))
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => exit_code(&Verdict::ConfigError(err.to_string())),
            };
        }
    };

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Commands::Capture(args) => handle_capture(args),
        Commands::Ports => match serial::port::print_ports() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{} {:#}", "[ERROR]".red().bold(), e);
                exit_code(&listing_failure(e))
            }
        },
    }
}

/// A port listing that cannot enumerate devices is a stream error, so it
/// never shares a status with a capture timeout
fn listing_failure(err: anyhow::Error) -> Verdict {
    Verdict::StreamError(format!("{:#}", err))
}

fn handle_capture(args: CaptureArgs) -> ExitCode {
    let session = match args.into_config().and_then(|config| {
        if !config.port.is_common_baud_rate() {
            log::warn!("unusual baud rate {}", config.port.baud_rate);
        }
        CaptureSession::prepare(config)
    }) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            return exit_code(&Verdict::from(e));
        }
    };

    install_interrupt_handler(session.interrupt_flag());

    let report = session.run(|config| SerialConnection::open(config.port.clone()));
    ExitCode::from(report.exit_code())
}

/// Ctrl+C only raises the flag; the capture loop notices it within one
/// poll interval and shuts down cleanly
fn install_interrupt_handler(flag: Arc<AtomicBool>) {
    let installed = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    });
    if let Err(e) = installed {
        log::warn!("Ctrl+C handler unavailable, interrupt will kill the capture: {}", e);
    }
}

fn exit_code(verdict: &Verdict) -> ExitCode {
    ExitCode::from(verdict.exit_code())
}
