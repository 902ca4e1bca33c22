//! kartlink-core: Core traits, wire types, and error definitions for kartlink.
//!
//! This crate defines the abstractions the link engine is written against.
//! Dashboards and tools depend on these types without pulling in a specific
//! serial backend.
//!
//! # Key types
//!
//! - [`Transport`] / [`PortProvider`] -- byte-level port access
//! - [`Telemetry`], [`CommandMessage`], [`CommandAck`] -- wire records
//! - [`LinkEvent`] -- asynchronous lifecycle notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::LinkEvent;
pub use transport::{PortInfo, PortProvider, Transport};
pub use types::{AckData, COMMAND_ACK_TYPE, CommandAck, CommandMessage, Telemetry, TelemetryData};
