//! Transport traits for the serial link.
//!
//! [`Transport`] abstracts over one open port: a duplex byte stream with a
//! fallible close. [`PortProvider`] abstracts over the platform's port
//! catalogue: which ports are already authorized, prompting for a new one,
//! and opening a port at a baud rate.
//!
//! The link engine in `kartlink-link` only ever talks to these traits, so
//! the same code drives a real `tokio-serial` port and the scripted
//! `MockTransport` from `kartlink-test-harness`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Identifies a serial endpoint that can be opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortInfo {
    /// OS path or name of the port (e.g. `/dev/ttyUSB0`, `COM3`).
    pub name: String,
    /// Optional human-readable description (USB product string, etc.).
    pub description: Option<String>,
}

impl PortInfo {
    /// Create a port description with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    /// Attach a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{} ({})", self.name, desc),
            None => f.write_str(&self.name),
        }
    }
}

/// Asynchronous byte-level transport over one open port.
///
/// Implementations are owned exclusively by a single session IO task.
#[async_trait]
pub trait Transport: Send {
    /// Write raw bytes to the port.
    ///
    /// Returns once every byte has been handed to the underlying device.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the port into the provided buffer.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the stream ended.
    /// Waits up to `timeout` and returns
    /// [`Error::Timeout`](crate::error::Error::Timeout) if nothing arrived.
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no data.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the port.
    ///
    /// After `close()`, `send()` and `receive()` return
    /// [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Whether the port is currently open.
    fn is_connected(&self) -> bool;
}

/// The platform's catalogue of serial ports.
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// Ports the user has already authorized for this application.
    async fn known_ports(&self) -> Result<Vec<PortInfo>>;

    /// Ask the user to pick a port.
    ///
    /// Returns `Ok(None)` when the prompt was cancelled.
    async fn request_port(&self) -> Result<Option<PortInfo>>;

    /// Open the given port at `baud_rate`.
    async fn open(&self, port: &PortInfo, baud_rate: u32) -> Result<Box<dyn Transport>>;
}
