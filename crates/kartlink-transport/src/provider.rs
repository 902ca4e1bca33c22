//! Serial port catalogue.
//!
//! [`SerialPortProvider`] answers the three questions the port selector
//! asks: which ports are already authorized, which port the user picks
//! when prompted, and how to open one. Picking a port through the prompt
//! authorizes it, so the next startup can select it without asking.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_serial::SerialPortType;
use tracing::{debug, warn};

use kartlink_core::error::{Error, Result};
use kartlink_core::transport::{PortInfo, PortProvider, Transport};

use crate::serial::{SerialConfig, SerialTransport};

/// Shows the port prompt.
#[async_trait]
pub trait PortChooser: Send + Sync {
    /// Pick one of `candidates`, or `None` if the user cancelled.
    ///
    /// Implementations may return a port not in `candidates`.
    async fn choose(&self, candidates: &[PortInfo]) -> Result<Option<PortInfo>>;
}

/// A chooser that always cancels. Used when no prompt is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

#[async_trait]
impl PortChooser for NoPrompt {
    async fn choose(&self, _candidates: &[PortInfo]) -> Result<Option<PortInfo>> {
        Ok(None)
    }
}

/// [`PortProvider`] backed by the operating system's serial ports.
pub struct SerialPortProvider {
    config: SerialConfig,
    authorized: Mutex<Vec<PortInfo>>,
    chooser: Arc<dyn PortChooser>,
}

impl SerialPortProvider {
    pub fn new(chooser: Arc<dyn PortChooser>) -> Self {
        Self {
            config: SerialConfig::default(),
            authorized: Mutex::new(Vec::new()),
            chooser,
        }
    }

    /// Line settings used for every open. The baud rate is taken from the
    /// open request.
    pub fn with_config(mut self, config: SerialConfig) -> Self {
        self.config = config;
        self
    }

    /// Treat `port` as already authorized.
    pub fn authorize(self, port: PortInfo) -> Self {
        self.remember(port);
        self
    }

    /// Ports authorized so far.
    pub fn authorized(&self) -> Vec<PortInfo> {
        self.lock().clone()
    }

    fn remember(&self, port: PortInfo) {
        let mut authorized = self.lock();
        if !authorized.iter().any(|p| p.name == port.name) {
            authorized.push(port);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PortInfo>> {
        self.authorized.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Every serial port the operating system reports.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Transport(format!("failed to enumerate serial ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(usb) => usb
                    .product
                    .or(usb.manufacturer)
                    .or_else(|| Some(format!("USB {:04x}:{:04x}", usb.vid, usb.pid))),
                SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                SerialPortType::PciPort => Some("PCI".to_string()),
                SerialPortType::Unknown => None,
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

#[async_trait]
impl PortProvider for SerialPortProvider {
    async fn known_ports(&self) -> Result<Vec<PortInfo>> {
        let authorized = self.authorized();
        if !authorized.is_empty() {
            return Ok(authorized);
        }
        available_ports()
    }

    async fn request_port(&self) -> Result<Option<PortInfo>> {
        let candidates = available_ports().unwrap_or_else(|e| {
            warn!(error = %e, "offering no candidates");
            Vec::new()
        });
        debug!(candidates = candidates.len(), "prompting for port");

        let choice = self.chooser.choose(&candidates).await?;
        if let Some(port) = &choice {
            self.remember(port.clone());
        }
        Ok(choice)
    }

    async fn open(&self, port: &PortInfo, baud_rate: u32) -> Result<Box<dyn Transport>> {
        let config = SerialConfig {
            baud_rate,
            ..self.config.clone()
        };
        let transport = SerialTransport::open_with_config(&port.name, &config).await?;
        Ok(Box::new(transport))
    }
}
