//! Link lifecycle events.
//!
//! Events are published through a [`tokio::sync::broadcast`] channel owned by
//! the link. Dashboards subscribe to them to show connection state and
//! command delivery progress without polling.

use uuid::Uuid;

use crate::transport::PortInfo;

/// An event emitted when link state changes.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A port became the active selection.
    PortSelected { port: PortInfo },

    /// A session opened on the selected port.
    SessionOpened { port: PortInfo, generation: u64 },

    /// Opening the selected port failed. The selection is kept but nothing
    /// streams until the next forced connect.
    OpenFailed { port: PortInfo, reason: String },

    /// The session stopped because a read or write on its port failed.
    /// The link does not reconnect on its own.
    SessionFailed { generation: u64, reason: String },

    /// A session ended and its port was closed.
    SessionClosed { generation: u64 },

    /// A command was re-sent after its acknowledgment wait expired.
    CommandRetried { uuid: Uuid, retry_counter: u32 },

    /// The radio acknowledged a command.
    CommandAcknowledged { uuid: Uuid },

    /// A command exhausted its retry budget.
    CommandFailed { uuid: Uuid, retries: u32 },
}
