//! Mock serial port for deterministic testing of the link engine.
//!
//! [`MockTransport::pair`] returns the port-side [`MockTransport`] (handed to
//! a session) and a [`MockPort`] controller for the test to act as the
//! radio: it scripts inbound chunks, injects read failures or end of
//! stream, and inspects what the session wrote and how often it closed.
//!
//! # Example
//!
//! ```
//! use kartlink_test_harness::MockTransport;
//!
//! let (transport, port) = MockTransport::pair("/dev/ttyMOCK0");
//! port.push(b"{\"data\":{\"timestamp\":\"2024-01-01T00:00:00Z\"}}\r\n");
//! assert_eq!(port.close_count(), 0);
//! # drop(transport);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use kartlink_core::error::{Error, Result};
use kartlink_core::transport::Transport;

/// One scripted event on the inbound side of the mock.
#[derive(Debug)]
enum Inbound {
    Chunk(Vec<u8>),
    Fail(String),
    Eof,
}

/// State shared between a [`MockTransport`] and its [`MockPort`].
#[derive(Debug)]
struct Shared {
    name: String,
    sent: Mutex<Vec<Vec<u8>>>,
    writes: watch::Sender<usize>,
    closes: AtomicUsize,
    fail_writes: AtomicBool,
}

/// A mock [`Transport`] driven by a [`MockPort`] controller.
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    /// Bytes of a scripted chunk that did not fit the caller's buffer.
    leftover: Vec<u8>,
    connected: bool,
}

/// Test-side controller for a [`MockTransport`].
///
/// Cheap to clone; every clone drives the same port.
#[derive(Debug, Clone)]
pub struct MockPort {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MockTransport {
    /// Create a connected mock transport and its controller.
    pub fn pair(name: &str) -> (MockTransport, MockPort) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (writes, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            writes,
            closes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        });

        let transport = MockTransport {
            shared: Arc::clone(&shared),
            inbound: inbound_rx,
            leftover: Vec::new(),
            connected: true,
        };
        let port = MockPort {
            shared,
            inbound: inbound_tx,
        };
        (transport, port)
    }

    /// Name the mock was created with.
    pub fn port_name(&self) -> &str {
        &self.shared.name
    }

    fn take_into(&mut self, data: Vec<u8>, buf: &mut [u8]) -> usize {
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.leftover = data[n..].to_vec();
        n
    }
}

impl MockPort {
    /// Name of the port this controller drives.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Deliver a chunk of bytes to the session reading this port.
    pub fn push(&self, chunk: &[u8]) {
        let _ = self.inbound.send(Inbound::Chunk(chunk.to_vec()));
    }

    /// Deliver a string chunk.
    pub fn push_str(&self, chunk: &str) {
        self.push(chunk.as_bytes());
    }

    /// Deliver one line terminated with CRLF.
    pub fn push_line(&self, line: &str) {
        self.push(format!("{line}\r\n").as_bytes());
    }

    /// Make the next read fail with an I/O error.
    pub fn fail_read(&self, reason: &str) {
        let _ = self.inbound.send(Inbound::Fail(reason.to_string()));
    }

    /// Signal end of stream: the next read returns zero bytes.
    pub fn end(&self) {
        let _ = self.inbound.send(Inbound::Eof);
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every payload written to the port, one entry per `send()` call.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Written payloads decoded as UTF-8.
    pub fn sent_strings(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .collect()
    }

    /// Number of completed writes.
    pub fn write_count(&self) -> usize {
        *self.shared.writes.borrow()
    }

    /// Wait until at least `count` writes have completed.
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.shared.writes.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// How many times the transport was closed.
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost);
        }

        if let Ok(mut sent) = self.shared.sent.lock() {
            sent.push(data.to_vec());
        }
        self.shared.writes.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        if !self.leftover.is_empty() {
            let data = std::mem::take(&mut self.leftover);
            return Ok(self.take_into(data, buf));
        }

        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(Inbound::Chunk(data))) => Ok(self.take_into(data, buf)),
            Ok(Some(Inbound::Fail(reason))) => Err(Error::Io(std::io::Error::other(reason))),
            Ok(Some(Inbound::Eof)) | Ok(None) => Ok(0),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
