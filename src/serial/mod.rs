//! Serial device access for boot capture
//!
//! - Opening the device under capture and driving its reset line
//! - Listing available serial ports
//! - Framing the raw byte stream into text lines

pub mod lines;
pub mod port;

pub use lines::{LineSource, ReadOutcome};
pub use port::{Device, PortConfig, SerialConnection};
