//! Command/acknowledgment correlation.
//!
//! [`Correlator::submit`] writes a command to the live session and hands
//! back a [`PendingCommand`]. A background task per command watches the
//! acknowledgment stream for the command's uuid. If none arrives within the
//! acknowledgment timeout the same command is written again with its
//! `retryCounter` bumped, until the [`RetryPolicy`] runs out.
//!
//! Each wait is tied to the session generation the command was written on.
//! When that session is replaced or ends, the wait resolves with
//! [`Error::SessionChanged`] instead of writing into the new session.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kartlink_core::error::{Error, Result};
use kartlink_core::events::LinkEvent;
use kartlink_core::types::{CommandAck, CommandMessage};

use crate::config::RetryPolicy;
use crate::selector::SessionLink;

/// Every command submitted so far, in submission order.
#[derive(Debug, Default, Clone)]
struct CommandLog {
    entries: Arc<Mutex<Vec<CommandMessage>>>,
}

impl CommandLog {
    fn push(&self, message: CommandMessage) {
        self.lock().push(message);
    }

    fn update(&self, message: &CommandMessage) {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.uuid == message.uuid) {
            *entry = message.clone();
        }
    }

    fn newest_first(&self) -> Vec<CommandMessage> {
        self.lock().iter().rev().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CommandMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Matches outbound commands to acknowledgments by uuid.
pub struct Correlator {
    ack_tx: broadcast::Sender<CommandAck>,
    link: watch::Receiver<Option<SessionLink>>,
    event_tx: broadcast::Sender<LinkEvent>,
    ack_timeout: Duration,
    retry: RetryPolicy,
    log: CommandLog,
}

impl Correlator {
    pub fn new(
        ack_tx: broadcast::Sender<CommandAck>,
        link: watch::Receiver<Option<SessionLink>>,
        event_tx: broadcast::Sender<LinkEvent>,
        ack_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ack_tx,
            link,
            event_tx,
            ack_timeout,
            retry,
            log: CommandLog::default(),
        }
    }

    /// Write `text` as a new command and start waiting for its
    /// acknowledgment.
    ///
    /// Returns as soon as the command is queued for writing.
    pub fn submit(&self, text: impl Into<String>) -> Result<PendingCommand> {
        let text = text.into();
        if text.is_empty() {
            return Err(Error::InvalidParameter("command text is empty".into()));
        }

        let link = match self.link.borrow().clone() {
            Some(link) if !link.is_closed() => link,
            _ => return Err(Error::NotConnected),
        };

        let message = CommandMessage::new(text);
        let wire = message.to_wire()?;

        // Subscribe before writing so a fast acknowledgment is not missed.
        let acks = self.ack_tx.subscribe();
        link.outbound
            .send(wire)
            .map_err(|_| Error::NotConnected)?;
        debug!(uuid = %message.uuid, generation = link.generation, "command submitted");
        self.log.push(message.clone());

        let wait = AckWait {
            message: message.clone(),
            acks,
            link,
            live: self.link.clone(),
            event_tx: self.event_tx.clone(),
            ack_timeout: self.ack_timeout,
            retry: self.retry,
            log: self.log.clone(),
        };
        let task = tokio::spawn(wait.run());

        Ok(PendingCommand { message, task })
    }

    /// Every submitted command, newest first, with its current delivery
    /// state.
    pub fn commands(&self) -> Vec<CommandMessage> {
        self.log.newest_first()
    }
}

/// A submitted command whose acknowledgment is still outstanding.
///
/// Dropping it leaves the wait running in the background; the command log
/// still records the result.
#[derive(Debug)]
pub struct PendingCommand {
    message: CommandMessage,
    task: JoinHandle<Result<CommandMessage>>,
}

impl PendingCommand {
    pub fn uuid(&self) -> Uuid {
        self.message.uuid
    }

    /// The command as first written.
    pub fn message(&self) -> &CommandMessage {
        &self.message
    }

    /// Wait for the command to be acknowledged or given up on.
    ///
    /// On success the returned message has `ack` set.
    pub async fn outcome(self) -> Result<CommandMessage> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(uuid = %self.message.uuid, error = %e, "ack wait task did not finish");
                Err(Error::ConnectionLost)
            }
        }
    }

    /// Stop waiting. No further retries are written.
    pub fn abandon(self) {
        debug!(uuid = %self.message.uuid, "command abandoned");
        self.task.abort();
    }
}

struct AckWait {
    message: CommandMessage,
    acks: broadcast::Receiver<CommandAck>,
    link: SessionLink,
    live: watch::Receiver<Option<SessionLink>>,
    event_tx: broadcast::Sender<LinkEvent>,
    ack_timeout: Duration,
    retry: RetryPolicy,
    log: CommandLog,
}

impl AckWait {
    async fn run(mut self) -> Result<CommandMessage> {
        let uuid = self.message.uuid;
        loop {
            match tokio::time::timeout(self.ack_timeout, next_match(&mut self.acks, uuid)).await {
                Ok(true) => {
                    info!(uuid = %uuid, retries = self.message.retry_counter.unwrap_or(0), "command acknowledged");
                    self.message.ack = true;
                    self.log.update(&self.message);
                    let _ = self.event_tx.send(LinkEvent::CommandAcknowledged { uuid });
                    return Ok(self.message);
                }
                Ok(false) => {
                    warn!(uuid = %uuid, "ack stream closed");
                    return Err(self.give_up(Error::ConnectionLost));
                }
                Err(_) => {}
            }

            if !self.session_is_current() {
                debug!(uuid = %uuid, generation = self.link.generation, "session changed, dropping wait");
                return Err(self.give_up(Error::SessionChanged { uuid }));
            }

            let retries = self.message.retry_counter.unwrap_or(0);
            if !self.retry.allows(retries) {
                warn!(uuid = %uuid, retries, "command not acknowledged, giving up");
                let _ = self
                    .event_tx
                    .send(LinkEvent::CommandFailed { uuid, retries });
                return Err(self.give_up(Error::CommandFailed { uuid, retries }));
            }

            let retry_counter = self.message.increment_retry();
            let wire = self.message.to_wire()?;
            if self.link.outbound.send(wire).is_err() {
                return Err(self.give_up(Error::SessionChanged { uuid }));
            }
            debug!(uuid = %uuid, retry_counter, "ack timed out, command re-sent");
            self.log.update(&self.message);
            let _ = self.event_tx.send(LinkEvent::CommandRetried {
                uuid,
                retry_counter,
            });
        }
    }

    fn session_is_current(&self) -> bool {
        match self.live.borrow().as_ref() {
            Some(live) => live.generation == self.link.generation && !live.is_closed(),
            None => false,
        }
    }

    fn give_up(&mut self, error: Error) -> Error {
        self.message.failed = Some(true);
        self.log.update(&self.message);
        error
    }
}

/// Wait for an acknowledgment of `uuid`. Returns `false` if the stream
/// closed first.
async fn next_match(acks: &mut broadcast::Receiver<CommandAck>, uuid: Uuid) -> bool {
    loop {
        match acks.recv().await {
            Ok(ack) => match ack.command_uuid() {
                Ok(id) if id == uuid => return true,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ignoring malformed acknowledgment"),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "ack subscriber lagged");
            }
            Err(RecvError::Closed) => return false,
        }
    }
}
