//! Serial transport for kartlink.
//!
//! - [`SerialTransport`]: the [`Transport`](kartlink_core::Transport) over
//!   a `tokio-serial` port
//! - [`SerialPortProvider`]: the [`PortProvider`](kartlink_core::PortProvider)
//!   over the operating system's port list, with a pluggable
//!   [`PortChooser`] for the interactive prompt

pub mod provider;
pub mod serial;

pub use provider::{NoPrompt, PortChooser, SerialPortProvider, available_ports};
pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
