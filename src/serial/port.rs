//! Serial port configuration and connection management
//!
//! Opens the device under capture with 8N1 framing and a read timeout equal
//! to the capture poll interval, and drives the DTR line for reset pulses.

use crate::error::CaptureError;
use anyhow::{Context, Result};
use colored::Colorize;
use serialport::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits,
};
use std::io::{self, Read};
use std::time::Duration;

/// Baud rates commonly used by embedded boot consoles
pub const COMMON_BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600, 1000000,
];

/// Default console baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Configuration for serial port connection
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Serial port path (e.g., /dev/ttyUSB0, /dev/ttyACM0, COM3)
    pub port_path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Upper bound for a single read
    pub timeout: Duration,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_path: String::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeout: Duration::from_secs(1),
        }
    }
}

impl PortConfig {
    /// Create a new 8N1 configuration at the default baud rate
    pub fn new(port_path: &str) -> Self {
        Self {
            port_path: port_path.to_string(),
            ..Default::default()
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_common_baud_rate(&self) -> bool {
        COMMON_BAUD_RATES.contains(&self.baud_rate)
    }
}

/// A byte stream from the device under capture.
///
/// Reads must return within the configured poll interval; an empty poll is
/// reported as `Ok(0)` or a `TimedOut` error.
pub trait Device: Read {
    /// Force a reboot: deassert DTR, wait `settle`, assert DTR again
    fn pulse_reset(&mut self, settle: Duration) -> Result<(), CaptureError>;
}

/// An open serial port
pub struct SerialConnection {
    port: Box<dyn SerialPort>,
    config: PortConfig,
}

impl SerialConnection {
    /// Open a serial connection with the given configuration
    pub fn open(config: PortConfig) -> Result<Self, CaptureError> {
        log::debug!(
            "opening {} at {} baud (read timeout {:?})",
            config.port_path,
            config.baud_rate,
            config.timeout
        );

        let port = serialport::new(&config.port_path, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(config.flow_control)
            .timeout(config.timeout)
            .open()
            .map_err(|source| CaptureError::Open {
                path: config.port_path.clone(),
                source,
            })?;

        Ok(Self { port, config })
    }

    /// Set DTR (Data Terminal Ready) signal
    pub fn set_dtr(&mut self, level: bool) -> Result<(), CaptureError> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(CaptureError::Control)
    }
}

impl Read for SerialConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Device for SerialConnection {
    fn pulse_reset(&mut self, settle: Duration) -> Result<(), CaptureError> {
        log::debug!("pulsing DTR on {} ({:?} settle)", self.config.port_path, settle);
        self.set_dtr(false)?;
        std::thread::sleep(settle);
        self.set_dtr(true)
    }
}

/// Bus and USB identity of a detected port, e.g. `usb 10c4:ea60 Silicon Labs CP2102`
fn describe_port(port: &SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut desc = format!("usb {:04x}:{:04x}", usb.vid, usb.pid);
            for name in [&usb.manufacturer, &usb.product].into_iter().flatten() {
                desc.push(' ');
                desc.push_str(name);
            }
            if let Some(ref serial) = usb.serial_number {
                desc.push_str(&format!(" serial={}", serial));
            }
            desc
        }
        SerialPortType::PciPort => "pci".to_string(),
        SerialPortType::BluetoothPort => "bluetooth".to_string(),
        SerialPortType::Unknown => "unknown".to_string(),
    }
}

/// Serial ports present on this host, sorted by path
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let mut ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(ports)
}

/// Print one line per port, ready to paste into `capture --port`
pub fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("{}", "no serial ports found".yellow());
        return Ok(());
    }

    for port in &ports {
        let path = format!("{:<24}", port.port_name);
        println!("{} {}", path.bold(), describe_port(port));
    }
    Ok(())
}
