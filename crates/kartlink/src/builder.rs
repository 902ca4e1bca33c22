//! LinkBuilder -- fluent builder for constructing [`Link`] instances.
//!
//! Every setting has a default matching the tracker radio, so the simplest
//! use is:
//!
//! ```no_run
//! use kartlink::LinkBuilder;
//! use kartlink::transport::NoPrompt;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> kartlink::Result<()> {
//! let link = LinkBuilder::serial(Arc::new(NoPrompt))
//!     .ack_timeout(Duration::from_secs(5))
//!     .max_retries(5)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use kartlink_core::error::{Error, Result};
use kartlink_core::transport::PortProvider;
use kartlink_link::config::{LinkConfig, RetryPolicy};
use kartlink_link::correlator::Correlator;
use kartlink_link::envelope::Dispatcher;
use kartlink_link::liveness::LivenessMonitor;
use kartlink_link::selector::PortSelector;

use crate::link::Link;

/// Fluent builder for [`Link`].
pub struct LinkBuilder {
    provider: Arc<dyn PortProvider>,
    config: LinkConfig,
}

impl LinkBuilder {
    /// Create a builder over any port provider.
    pub fn new(provider: impl PortProvider + 'static) -> Self {
        Self::with_provider(Arc::new(provider))
    }

    pub fn with_provider(provider: Arc<dyn PortProvider>) -> Self {
        LinkBuilder {
            provider,
            config: LinkConfig::default(),
        }
    }

    /// Create a builder over the operating system's serial ports, using
    /// `chooser` when a port prompt is needed.
    #[cfg(feature = "serial")]
    pub fn serial(chooser: Arc<dyn kartlink_transport::PortChooser>) -> Self {
        Self::new(kartlink_transport::SerialPortProvider::new(chooser))
    }

    /// Serial speed used to open ports (default: 115200).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.config.session.baud_rate = baud;
        self
    }

    /// How long to wait for an acknowledgment before re-sending
    /// (default: 5s).
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Give up on a command after `n` unacknowledged retries (default: 10).
    ///
    /// This bound differs from the wire protocol, which defines no give-up
    /// point and re-sends until acknowledged. Here a kart out of range
    /// surfaces as [`Error::CommandFailed`](crate::Error::CommandFailed);
    /// use [`unbounded_retries`](Self::unbounded_retries) for the protocol's
    /// behavior.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry = RetryPolicy::bounded(n);
        self
    }

    /// Re-send unacknowledged commands until the session changes.
    pub fn unbounded_retries(mut self) -> Self {
        self.config.retry = RetryPolicy::unbounded();
        self
    }

    /// Telemetry silence after which the link reports down (default: 10s).
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness_timeout = timeout;
        self
    }

    /// How long an idle read waits before the IO task checks for pending
    /// writes (default: 100ms).
    pub fn read_poll_interval(mut self, interval: Duration) -> Self {
        self.config.session.read_poll_interval = interval;
        self
    }

    /// Capacity of the telemetry, acknowledgment and event channels
    /// (default: 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    fn validate(&self) -> Result<()> {
        let config = &self.config;
        if config.channel_capacity == 0 {
            return Err(Error::InvalidParameter(
                "event_capacity must be greater than zero".into(),
            ));
        }
        if config.ack_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "ack_timeout must be greater than zero".into(),
            ));
        }
        if config.liveness_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "liveness_timeout must be greater than zero".into(),
            ));
        }
        if config.session.read_poll_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "read_poll_interval must be greater than zero".into(),
            ));
        }
        if config.session.baud_rate == 0 {
            return Err(Error::InvalidParameter("baud_rate must be non-zero".into()));
        }
        Ok(())
    }

    /// Wire up the link and run startup port selection.
    ///
    /// A port that fails to open at startup does not fail the build; the
    /// failure is published as [`LinkEvent::OpenFailed`](crate::LinkEvent)
    /// and [`Link::connect`] can be retried.
    pub async fn build(self) -> Result<Link> {
        self.validate()?;
        let config = self.config;

        let (event_tx, _) = broadcast::channel(config.channel_capacity);
        let dispatcher = Arc::new(Dispatcher::new(config.channel_capacity, event_tx.clone()));
        let selector = PortSelector::new(
            self.provider,
            config.session.clone(),
            dispatcher.clone(),
            event_tx.clone(),
        );
        let correlator = Correlator::new(
            dispatcher.ack_sender(),
            selector.session_link(),
            event_tx.clone(),
            config.ack_timeout,
            config.retry,
        );
        let liveness =
            LivenessMonitor::spawn(dispatcher.subscribe_telemetry(), config.liveness_timeout);

        if let Err(e) = selector.init().await {
            warn!(error = %e, "startup port selection failed");
        }

        Ok(Link::new(
            config, selector, dispatcher, correlator, liveness, event_tx,
        ))
    }
}
