//! kartlink-link: the protocol core of the kart telemetry link.
//!
//! Bytes from the radio port go through a chain of small stages:
//!
//! - [`framer`] -- CRLF line framing over arbitrary read chunks
//! - [`session`] -- one open port, one IO task owning it
//! - [`envelope`] -- JSON decode, split into telemetry and acknowledgments
//! - [`selector`] -- which port is in use, and its session lifecycle
//! - [`correlator`] -- command writes, acknowledgment matching, retries
//! - [`liveness`] -- whether telemetry is still arriving
//!
//! Most applications use the `kartlink` facade crate, which wires these
//! together behind a builder.

pub mod config;
pub mod correlator;
pub mod envelope;
pub mod framer;
pub mod liveness;
pub mod selector;
pub mod session;

pub use config::{LinkConfig, RetryPolicy, SessionConfig};
pub use correlator::{Correlator, PendingCommand};
pub use envelope::{DispatchStats, Dispatcher, Envelope, EnvelopeKind, classify, decode};
pub use framer::{Line, LineFramer};
pub use liveness::{LastSeen, LivenessMonitor};
pub use selector::{PortSelector, SelectionState, SessionLink};
pub use session::{LineHandler, Session};
