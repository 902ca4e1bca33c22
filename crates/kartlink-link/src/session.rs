//! Duplex session over one open port.
//!
//! A [`Session`] owns exactly one transport. One tokio task owns the
//! transport exclusively and multiplexes, in priority order:
//!
//! 1. Cancellation (session replaced, closed, or dropped)
//! 2. Outbound writes, one at a time, each completed before the next
//! 3. Idle reads, fed through the [`LineFramer`] and delivered in order
//!
//! When the loop exits for any reason the transport is closed exactly once
//! and the [`LineHandler`] is told how the session ended.
//!
//! Reads and writes are independent in order and outcome, but not in time:
//! while a write is in flight no read is polled. Commands are a few hundred
//! bytes at serial speed, and the OS receive buffer holds inbound bytes
//! meanwhile, so nothing is lost; lines are only delivered late by up to one
//! write. [`Transport`] takes `&mut self` for both directions, which keeps
//! a single owner per port.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use kartlink_core::error::{Error, Result};
use kartlink_core::transport::{PortInfo, PortProvider, Transport};

use crate::config::SessionConfig;
use crate::framer::{Line, LineFramer};

/// Receives the lines produced by a session.
///
/// Called from the session IO task; implementations must not block.
pub trait LineHandler: Send + Sync + 'static {
    /// A complete line arrived on session `generation`.
    fn on_line(&self, generation: u64, line: Line);

    /// Session `generation` ended. `error` is set when a read or write
    /// failure ended it.
    fn on_end(&self, _generation: u64, _error: Option<&Error>) {}
}

/// Lets a plain channel act as the lazy line sequence of a session.
impl LineHandler for mpsc::UnboundedSender<Line> {
    fn on_line(&self, _generation: u64, line: Line) {
        let _ = self.send(line);
    }
}

/// Handle to a running session.
///
/// Dropping the handle tears the session down.
pub struct Session {
    generation: u64,
    port: PortInfo,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    /// Open `port` through `provider` and start the IO task.
    ///
    /// If the port fails to open no task is started and the error is
    /// returned as is.
    pub async fn open(
        provider: &dyn PortProvider,
        port: &PortInfo,
        config: &SessionConfig,
        generation: u64,
        handler: Arc<dyn LineHandler>,
    ) -> Result<Session> {
        let transport = provider.open(port, config.baud_rate).await.map_err(|e| {
            error!(port = %port, error = %e, "failed to open port");
            e
        })?;
        Ok(Self::spawn(transport, port.clone(), config, generation, handler))
    }

    /// Start the IO task over an already open transport.
    pub fn spawn(
        transport: Box<dyn Transport>,
        port: PortInfo,
        config: &SessionConfig,
        generation: u64,
        handler: Arc<dyn LineHandler>,
    ) -> Session {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        debug!(port = %port, generation, "session opened");
        let task = tokio::spawn(io_loop(
            transport,
            port.name.clone(),
            generation,
            config.clone(),
            handler,
            outbound_rx,
            cancel.clone(),
        ));

        Session {
            generation,
            port,
            outbound,
            cancel,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn port(&self) -> &PortInfo {
        &self.port
    }

    /// A sender for the outbound write queue.
    ///
    /// Items sent after the session ended are silently discarded.
    pub fn outbound(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Queue a string for writing.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.outbound
            .send(text.into())
            .map_err(|_| Error::NotConnected)
    }

    /// Tear the session down and wait until its port is closed.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The session IO loop. Runs as a spawned tokio task.
async fn io_loop(
    mut transport: Box<dyn Transport>,
    port_name: String,
    generation: u64,
    config: SessionConfig,
    handler: Arc<dyn LineHandler>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    let failure = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(port = %port_name, generation, "session cancelled");
                break None;
            }

            item = outbound_rx.recv() => {
                let Some(text) = item else {
                    debug!(port = %port_name, generation, "outbound channel closed");
                    break None;
                };
                if text.is_empty() {
                    continue;
                }
                trace!(port = %port_name, generation, bytes = text.len(), "writing");
                if let Err(e) = transport.send(text.as_bytes()).await {
                    error!(port = %port_name, generation, error = %e, "write failed");
                    break Some(e);
                }
            }

            read = transport.receive(&mut buf, config.read_poll_interval) => {
                match read {
                    Ok(0) => {
                        debug!(port = %port_name, generation, "end of stream");
                        if let Some(line) = framer.flush() {
                            handler.on_line(generation, line);
                        }
                        break None;
                    }
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            handler.on_line(generation, line);
                        }
                        trace!(
                            port = %port_name,
                            generation,
                            bytes = n,
                            buffered = framer.pending_len(),
                            "read"
                        );
                    }
                    Err(Error::Timeout) => {}
                    Err(e) => {
                        error!(port = %port_name, generation, error = %e, "read failed");
                        break Some(Error::ReadFailed(e.to_string()));
                    }
                }
            }
        }
    };
    outbound_rx.close();

    if let Err(e) = transport.close().await {
        warn!(port = %port_name, generation, error = %e, "failed to close port");
    }
    debug!(port = %port_name, generation, "session closed");
    handler.on_end(generation, failure.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kartlink_test_harness::{MockPort, MockPortProvider, MockTransport};

    #[derive(Debug, PartialEq)]
    enum Seen {
        Line(u64, String),
        End(u64, Option<String>),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    impl LineHandler for Recorder {
        fn on_line(&self, generation: u64, line: Line) {
            let _ = self.0.send(Seen::Line(generation, line));
        }

        fn on_end(&self, generation: u64, error: Option<&Error>) {
            let _ = self.0.send(Seen::End(generation, error.map(|e| e.to_string())));
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            read_poll_interval: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    fn start(generation: u64) -> (Session, MockPort, mpsc::UnboundedReceiver<Seen>) {
        let (transport, port) = MockTransport::pair("/dev/ttyMOCK0");
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            Box::new(transport),
            PortInfo::new("/dev/ttyMOCK0"),
            &config(),
            generation,
            Arc::new(Recorder(tx)),
        );
        (session, port, rx)
    }

    #[tokio::test]
    async fn lines_arrive_in_order_across_chunks() {
        let (session, port, mut rx) = start(1);
        port.push(b"first\r\nsec");
        port.push(b"ond\r\nthird\r\n");

        assert_eq!(rx.recv().await, Some(Seen::Line(1, "first".into())));
        assert_eq!(rx.recv().await, Some(Seen::Line(1, "second".into())));
        assert_eq!(rx.recv().await, Some(Seen::Line(1, "third".into())));

        session.close().await;
    }

    #[tokio::test]
    async fn channel_handler_yields_lazy_line_sequence() {
        let (transport, port) = MockTransport::pair("mock");
        let (tx, mut lines) = mpsc::unbounded_channel::<Line>();
        let session = Session::spawn(
            Box::new(transport),
            PortInfo::new("mock"),
            &config(),
            1,
            Arc::new(tx),
        );

        port.push(b"a\r\nb\r\n");
        assert_eq!(lines.recv().await.as_deref(), Some("a"));
        assert_eq!(lines.recv().await.as_deref(), Some("b"));
        session.close().await;
    }

    #[tokio::test]
    async fn writes_are_serialized_and_empty_items_skipped() {
        let (session, port, _rx) = start(1);
        session.send("one").unwrap();
        session.send("").unwrap();
        session.send("two").unwrap();

        port.wait_for_writes(2).await;
        assert_eq!(port.sent_strings(), vec!["one", "two"]);

        session.close().await;
        assert_eq!(port.write_count(), 2);
    }

    #[tokio::test]
    async fn reads_and_writes_interleave_without_loss() {
        let (session, port, mut rx) = start(2);
        for i in 0..20 {
            session.send(format!("cmd-{i}")).unwrap();
            port.push_line(&format!("line-{i}"));
        }

        for i in 0..20 {
            assert_eq!(rx.recv().await, Some(Seen::Line(2, format!("line-{i}"))));
        }
        port.wait_for_writes(20).await;
        let expected: Vec<String> = (0..20).map(|i| format!("cmd-{i}")).collect();
        assert_eq!(port.sent_strings(), expected);

        session.close().await;
    }

    #[tokio::test]
    async fn writes_do_not_append_a_terminator() {
        let (session, port, _rx) = start(1);
        session.send(r#"{"message":"hi"}"#).unwrap();
        port.wait_for_writes(1).await;
        assert_eq!(port.sent()[0], br#"{"message":"hi"}"#.to_vec());
        session.close().await;
    }

    #[tokio::test]
    async fn close_closes_port_once() {
        let (session, port, mut rx) = start(4);
        session.close().await;
        assert_eq!(port.close_count(), 1);
        assert_eq!(rx.recv().await, Some(Seen::End(4, None)));
    }

    #[tokio::test]
    async fn drop_closes_port_once() {
        let (session, port, mut rx) = start(2);
        drop(session);
        assert_eq!(rx.recv().await, Some(Seen::End(2, None)));
        assert_eq!(port.close_count(), 1);
    }

    #[tokio::test]
    async fn read_failure_ends_session_with_error() {
        let (session, port, mut rx) = start(3);
        port.push(b"ok\r\n");
        port.fail_read("device unplugged");

        assert_eq!(rx.recv().await, Some(Seen::Line(3, "ok".into())));
        match rx.recv().await {
            Some(Seen::End(3, Some(reason))) => assert!(reason.contains("device unplugged")),
            other => panic!("expected failed end, got {other:?}"),
        }
        assert_eq!(port.close_count(), 1);

        // Closing an already ended session does not close the port again.
        session.close().await;
        assert_eq!(port.close_count(), 1);
    }

    #[tokio::test]
    async fn write_failure_ends_session_with_error() {
        let (session, port, mut rx) = start(5);
        port.fail_writes(true);
        session.send("doomed").unwrap();

        assert!(matches!(rx.recv().await, Some(Seen::End(5, Some(_)))));
        assert_eq!(port.close_count(), 1);
    }

    #[tokio::test]
    async fn end_of_stream_flushes_fragment() {
        let (_session, port, mut rx) = start(1);
        port.push(b"complete\r\ntail");
        port.end();

        assert_eq!(rx.recv().await, Some(Seen::Line(1, "complete".into())));
        assert_eq!(rx.recv().await, Some(Seen::Line(1, "tail".into())));
        assert_eq!(rx.recv().await, Some(Seen::End(1, None)));
        assert_eq!(port.close_count(), 1);
    }

    #[tokio::test]
    async fn open_failure_starts_nothing() {
        let provider = MockPortProvider::new();
        provider.fail_open("/dev/ttyBAD");
        let (tx, _rx) = mpsc::unbounded_channel::<Line>();

        let result = Session::open(
            &provider,
            &PortInfo::new("/dev/ttyBAD"),
            &config(),
            1,
            Arc::new(tx),
        )
        .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(provider.open_count(), 0);
    }

    #[tokio::test]
    async fn open_uses_configured_baud_rate() {
        let provider = MockPortProvider::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Line>();
        let session = Session::open(
            &provider,
            &PortInfo::new("/dev/ttyUSB0"),
            &SessionConfig {
                baud_rate: 57_600,
                ..config()
            },
            9,
            Arc::new(tx),
        )
        .await
        .unwrap();

        assert_eq!(session.generation(), 9);
        assert_eq!(session.port().name, "/dev/ttyUSB0");
        assert_eq!(provider.last_baud_rate(), Some(57_600));
        session.close().await;
    }
}
