//! # kartlink -- Telemetry and commands over a kart tracker radio
//!
//! `kartlink` talks to the base-station radio of a kart GPS tracker over a
//! serial port. The radio streams one JSON record per CRLF-terminated line:
//! position telemetry from every kart, and acknowledgments for commands the
//! base station sent. `kartlink` splits that stream into typed telemetry and
//! acknowledgments, and gives commands reliable delivery by re-sending them
//! until the radio acknowledges them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kartlink::LinkBuilder;
//! use kartlink::transport::NoPrompt;
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let link = LinkBuilder::serial(Arc::new(NoPrompt)).build().await?;
//!
//!     let mut telemetry = link.subscribe_telemetry();
//!     let pending = link.submit("box this lap")?;
//!
//!     while let Ok(record) = telemetry.recv().await {
//!         println!("{} at {:?},{:?}", record.sender, record.data.lat, record.data.lng);
//!     }
//!     pending.outcome().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                   | Purpose                                          |
//! |-------------------------|--------------------------------------------------|
//! | `kartlink-core`         | Traits ([`Transport`], [`PortProvider`]), types, errors |
//! | `kartlink-transport`    | `tokio-serial` transport and port provider       |
//! | `kartlink-link`         | Framing, session IO, decoding, retries, liveness |
//! | `kartlink-test-harness` | Scripted mock port and provider for tests        |
//! | **`kartlink`**          | This facade crate -- builder and [`Link`]        |
//!
//! ## Feature Flags
//!
//! | Feature  | Enables                                    | Default |
//! |----------|--------------------------------------------|---------|
//! | `serial` | [`transport`] module and `LinkBuilder::serial` | yes |
//!
//! ## Events
//!
//! Session and command lifecycle changes are published as [`LinkEvent`]s:
//!
//! ```no_run
//! use kartlink::{Link, LinkEvent};
//! # async fn example(link: &Link) {
//! let mut events = link.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     if let LinkEvent::CommandFailed { uuid, retries } = event {
//!         eprintln!("{uuid} gave up after {retries} retries");
//!     }
//! }
//! # }
//! ```

pub mod builder;
pub mod link;

pub use kartlink_core::*;
pub use kartlink_link::{
    DispatchStats, LastSeen, LinkConfig, PendingCommand, RetryPolicy, SelectionState,
    SessionConfig,
};

pub use builder::LinkBuilder;
pub use link::Link;

/// Serial port transport.
#[cfg(feature = "serial")]
pub mod transport {
    pub use kartlink_transport::*;
}
