//! The assembled telemetry link.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use kartlink_core::error::Result;
use kartlink_core::events::LinkEvent;
use kartlink_core::types::{CommandAck, CommandMessage, Telemetry};
use kartlink_link::config::LinkConfig;
use kartlink_link::correlator::{Correlator, PendingCommand};
use kartlink_link::envelope::{DispatchStats, Dispatcher};
use kartlink_link::liveness::{LastSeen, LivenessMonitor};
use kartlink_link::selector::{PortSelector, SelectionState};

/// A connection to the tracker radio.
///
/// Built by [`LinkBuilder`](crate::LinkBuilder). All methods take `&self`,
/// so a `Link` can be shared behind an `Arc` between a display task and a
/// command task.
pub struct Link {
    config: LinkConfig,
    selector: PortSelector,
    dispatcher: Arc<Dispatcher>,
    correlator: Correlator,
    liveness: LivenessMonitor,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl Link {
    pub(crate) fn new(
        config: LinkConfig,
        selector: PortSelector,
        dispatcher: Arc<Dispatcher>,
        correlator: Correlator,
        liveness: LivenessMonitor,
        event_tx: broadcast::Sender<LinkEvent>,
    ) -> Self {
        Self {
            config,
            selector,
            dispatcher,
            correlator,
            liveness,
            event_tx,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Prompt for a port and connect to it. See
    /// [`PortSelector::connect`] for the `force` semantics.
    pub async fn connect(&self, force: bool) -> Result<()> {
        self.selector.connect(force).await
    }

    /// Send a command to the karts. Completes once it is queued; await
    /// [`PendingCommand::outcome`] for the acknowledgment.
    pub fn submit(&self, text: impl Into<String>) -> Result<PendingCommand> {
        self.correlator.submit(text)
    }

    /// Telemetry from every session this link opens.
    ///
    /// The stream outlives individual sessions, so a failed read does not
    /// close it. Watch [`Link::subscribe_events`] for
    /// [`LinkEvent::SessionFailed`] to learn that a session ended in error;
    /// records keep arriving once [`Link::connect`] opens a new one.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<Telemetry> {
        self.dispatcher.subscribe_telemetry()
    }

    pub fn subscribe_acks(&self) -> broadcast::Receiver<CommandAck> {
        self.dispatcher.subscribe_acks()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    pub fn selection(&self) -> watch::Receiver<SelectionState> {
        self.selector.selection()
    }

    /// Telemetry liveness: `true` while records keep arriving.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.liveness.connected()
    }

    pub fn last_seen(&self) -> Option<LastSeen> {
        self.liveness.last_seen()
    }

    pub fn seconds_since_last(&self) -> Option<u64> {
        self.liveness.seconds_since_last()
    }

    /// Every submitted command, newest first.
    pub fn commands(&self) -> Vec<CommandMessage> {
        self.correlator.commands()
    }

    /// Generation of the open session, if one is open.
    pub fn current_generation(&self) -> Option<u64> {
        self.selector.current_generation()
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Close the open session. The selected port is remembered, so
    /// `connect(false)` afterwards does nothing; use `connect(true)` to
    /// open a session again.
    pub async fn shutdown(&self) {
        debug!("shutting down link");
        self.selector.shutdown().await;
    }
}
