//! Mock port catalogue for testing port selection.
//!
//! [`MockPortProvider`] implements [`PortProvider`] with scripted answers:
//! the list of already-authorized ports, the queue of results the port
//! chooser returns, and ports that refuse to open. Every successful open
//! creates a fresh [`MockTransport`] pair and keeps its [`MockPort`]
//! controller so tests can drive the session that owns it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kartlink_core::error::{Error, Result};
use kartlink_core::transport::{PortInfo, PortProvider, Transport};

use crate::mock_serial::{MockPort, MockTransport};

#[derive(Debug, Default)]
struct State {
    known: Vec<PortInfo>,
    choices: VecDeque<Option<PortInfo>>,
    failing: HashSet<String>,
    opened: Vec<(PortInfo, u32, MockPort)>,
    prompts: usize,
}

/// A scripted [`PortProvider`].
#[derive(Debug, Clone, Default)]
pub struct MockPortProvider {
    state: Arc<Mutex<State>>,
}

impl MockPortProvider {
    /// Create a provider with no known ports and an empty chooser queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ports reported by [`PortProvider::known_ports`].
    pub fn with_known_ports(self, ports: Vec<PortInfo>) -> Self {
        self.lock().known = ports;
        self
    }

    /// Queue the result of the next port prompt. `None` cancels the prompt.
    ///
    /// Prompts with nothing queued are cancelled.
    pub fn queue_choice(&self, choice: Option<PortInfo>) {
        self.lock().choices.push_back(choice);
    }

    /// Make every open of `name` fail.
    pub fn fail_open(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Let `name` open again.
    pub fn allow_open(&self, name: &str) {
        self.lock().failing.remove(name);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    /// Number of times the chooser was shown.
    pub fn prompt_count(&self) -> usize {
        self.lock().prompts
    }

    /// Controllers for every opened port, oldest first.
    pub fn opened(&self) -> Vec<MockPort> {
        self.lock().opened.iter().map(|(_, _, p)| p.clone()).collect()
    }

    /// Controller for the most recently opened port.
    pub fn last_opened(&self) -> Option<MockPort> {
        self.lock().opened.last().map(|(_, _, p)| p.clone())
    }

    /// Baud rate used for the most recent open.
    pub fn last_baud_rate(&self) -> Option<u32> {
        self.lock().opened.last().map(|(_, baud, _)| *baud)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PortProvider for MockPortProvider {
    async fn known_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.lock().known.clone())
    }

    async fn request_port(&self) -> Result<Option<PortInfo>> {
        let mut state = self.lock();
        state.prompts += 1;
        Ok(state.choices.pop_front().flatten())
    }

    async fn open(&self, port: &PortInfo, baud_rate: u32) -> Result<Box<dyn Transport>> {
        let mut state = self.lock();
        if state.failing.contains(&port.name) {
            return Err(Error::Transport(format!(
                "failed to open mock port {}",
                port.name
            )));
        }

        let (transport, controller) = MockTransport::pair(&port.name);
        state.opened.push((port.clone(), baud_rate, controller));
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_ports_are_reported() {
        let provider = MockPortProvider::new().with_known_ports(vec![PortInfo::new("a")]);
        assert_eq!(provider.known_ports().await.unwrap(), vec![PortInfo::new("a")]);
    }

    #[tokio::test]
    async fn chooser_queue_and_cancellation() {
        let provider = MockPortProvider::new();
        provider.queue_choice(Some(PortInfo::new("b")));
        provider.queue_choice(None);

        assert_eq!(
            provider.request_port().await.unwrap(),
            Some(PortInfo::new("b"))
        );
        assert_eq!(provider.request_port().await.unwrap(), None);
        // Nothing queued: cancelled.
        assert_eq!(provider.request_port().await.unwrap(), None);
        assert_eq!(provider.prompt_count(), 3);
    }

    #[tokio::test]
    async fn open_records_controller() {
        let provider = MockPortProvider::new();
        let transport = provider.open(&PortInfo::new("c"), 115_200).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(provider.open_count(), 1);
        assert_eq!(provider.last_baud_rate(), Some(115_200));
        assert_eq!(provider.last_opened().unwrap().name(), "c");
    }

    #[tokio::test]
    async fn failing_open() {
        let provider = MockPortProvider::new();
        provider.fail_open("d");
        let result = provider.open(&PortInfo::new("d"), 9600).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(provider.open_count(), 0);

        provider.allow_open("d");
        assert!(provider.open(&PortInfo::new("d"), 9600).await.is_ok());
    }
}
