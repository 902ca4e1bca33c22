//! kartlink-test-harness: Mock transports and port providers for kartlink.
//!
//! This crate provides [`MockTransport`] / [`MockPort`] for driving a link
//! session without a radio attached, and [`MockPortProvider`] for testing
//! port selection and reconnection.

pub mod mock_provider;
pub mod mock_serial;

pub use mock_provider::MockPortProvider;
pub use mock_serial::{MockPort, MockTransport};
