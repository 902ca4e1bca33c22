//! Port selection state machine.
//!
//! The selector decides which port the link talks to and owns the live
//! [`Session`] on it. Every transition into [`SelectionState::Selected`]
//! tears down the previous session before opening exactly one new one, and
//! each new session gets a fresh generation number so that work started on
//! an old session can tell it is stale.
//!
//! Operations are serialised by an async mutex: a second `connect` waits
//! for the first to finish (including the port prompt) before it starts.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use kartlink_core::error::Result;
use kartlink_core::events::LinkEvent;
use kartlink_core::transport::{PortInfo, PortProvider};

use crate::config::SessionConfig;
use crate::session::{LineHandler, Session};

/// Where the selector is in choosing a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionState {
    Unselected,
    /// The port prompt is showing.
    Selecting,
    Selected(PortInfo),
}

impl SelectionState {
    pub fn port(&self) -> Option<&PortInfo> {
        match self {
            SelectionState::Selected(port) => Some(port),
            _ => None,
        }
    }
}

/// What writers need to reach the live session.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub generation: u64,
    pub outbound: mpsc::UnboundedSender<String>,
}

impl SessionLink {
    /// Whether the session behind this link has ended.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

struct Inner {
    session: Option<Session>,
    generation: u64,
}

/// Chooses a port and keeps one session open on it.
pub struct PortSelector {
    provider: Arc<dyn PortProvider>,
    config: SessionConfig,
    handler: Arc<dyn LineHandler>,
    event_tx: broadcast::Sender<LinkEvent>,
    state_tx: watch::Sender<SelectionState>,
    link_tx: watch::Sender<Option<SessionLink>>,
    inner: Mutex<Inner>,
}

impl PortSelector {
    pub fn new(
        provider: Arc<dyn PortProvider>,
        config: SessionConfig,
        handler: Arc<dyn LineHandler>,
        event_tx: broadcast::Sender<LinkEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SelectionState::Unselected);
        let (link_tx, _) = watch::channel(None);
        Self {
            provider,
            config,
            handler,
            event_tx,
            state_tx,
            link_tx,
            inner: Mutex::new(Inner {
                session: None,
                generation: 0,
            }),
        }
    }

    /// Startup: auto-select the port if exactly one is already authorized.
    ///
    /// With zero or several known ports the selector stays unselected and
    /// waits for [`connect`](Self::connect).
    pub async fn init(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut known = self.provider.known_ports().await?;
        debug!(count = known.len(), "known ports");

        match known.len() {
            1 => {
                let port = known.remove(0);
                self.select(&mut inner, port).await
            }
            _ => {
                self.state_tx.send_replace(SelectionState::Unselected);
                Ok(())
            }
        }
    }

    /// Ask for a port and connect to it.
    ///
    /// Without `force` this only prompts when nothing is selected yet. With
    /// `force` the prompt always shows and a chosen port replaces the
    /// current session even if it is the same port. Cancelling the prompt
    /// leaves the previous selection and its session untouched.
    pub async fn connect(&self, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = self.state_tx.borrow().clone();

        if !force && matches!(previous, SelectionState::Selected(_)) {
            debug!("port already selected");
            return Ok(());
        }

        self.state_tx.send_replace(SelectionState::Selecting);
        let choice = match self.provider.request_port().await {
            Ok(choice) => choice,
            Err(e) => {
                warn!(error = %e, "port prompt failed");
                self.restore(previous);
                return Err(e);
            }
        };

        match choice {
            Some(port) => self.select(&mut inner, port).await,
            None => {
                debug!("port prompt cancelled");
                self.restore(previous);
                Ok(())
            }
        }
    }

    /// Close the live session, if any. The selection is kept.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
    }

    /// Observe the selection state.
    pub fn selection(&self) -> watch::Receiver<SelectionState> {
        self.state_tx.subscribe()
    }

    /// Observe the live session. `None` while no session is open.
    pub fn session_link(&self) -> watch::Receiver<Option<SessionLink>> {
        self.link_tx.subscribe()
    }

    /// Generation of the live session, or `None` when there is none.
    pub fn current_generation(&self) -> Option<u64> {
        self.link_tx
            .borrow()
            .as_ref()
            .filter(|link| !link.is_closed())
            .map(|link| link.generation)
    }

    fn restore(&self, previous: SelectionState) {
        let state = match previous {
            SelectionState::Selected(port) => SelectionState::Selected(port),
            _ => SelectionState::Unselected,
        };
        self.state_tx.send_replace(state);
    }

    async fn teardown(&self, inner: &mut Inner) {
        self.link_tx.send_replace(None);
        if let Some(session) = inner.session.take() {
            debug!(port = %session.port(), generation = session.generation(), "tearing down session");
            session.close().await;
        }
    }

    async fn select(&self, inner: &mut Inner, port: PortInfo) -> Result<()> {
        self.teardown(inner).await;

        info!(port = %port, "port selected");
        self.state_tx
            .send_replace(SelectionState::Selected(port.clone()));
        let _ = self
            .event_tx
            .send(LinkEvent::PortSelected { port: port.clone() });

        inner.generation += 1;
        let generation = inner.generation;

        match Session::open(
            self.provider.as_ref(),
            &port,
            &self.config,
            generation,
            Arc::clone(&self.handler),
        )
        .await
        {
            Ok(session) => {
                self.link_tx.send_replace(Some(SessionLink {
                    generation,
                    outbound: session.outbound(),
                }));
                inner.session = Some(session);
                let _ = self
                    .event_tx
                    .send(LinkEvent::SessionOpened { port, generation });
                Ok(())
            }
            Err(e) => {
                let _ = self.event_tx.send(LinkEvent::OpenFailed {
                    port,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}
