//! Envelope decoding and classification.
//!
//! Every line from the radio is a JSON object. The `data.type` field decides
//! where it goes: `"command_ack"` records are acknowledgments, everything
//! else is telemetry. Lines that are not JSON are dropped without error.
//!
//! [`Dispatcher`] runs the decode step once per line and fans the result out
//! over two independent broadcast channels, so any number of consumers see
//! the same decoded value and a slow telemetry consumer never holds up
//! acknowledgment matching.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use kartlink_core::error::Error;
use kartlink_core::events::LinkEvent;
use kartlink_core::types::{COMMAND_ACK_TYPE, CommandAck, Telemetry};

use crate::framer::Line;
use crate::session::LineHandler;

/// Which sub-stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Telemetry,
    CommandAck,
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Telemetry(Telemetry),
    CommandAck(CommandAck),
    /// A non-acknowledgment object that is not valid telemetry.
    Unknown(Value),
}

impl Envelope {
    pub fn kind(&self) -> Option<EnvelopeKind> {
        match self {
            Envelope::Telemetry(_) => Some(EnvelopeKind::Telemetry),
            Envelope::CommandAck(_) => Some(EnvelopeKind::CommandAck),
            Envelope::Unknown(_) => None,
        }
    }
}

/// Route a JSON record by its `data.type` discriminator.
pub fn classify(value: &Value) -> EnvelopeKind {
    let kind = value
        .get("data")
        .and_then(|data| data.get("type"))
        .and_then(Value::as_str);
    match kind {
        Some(COMMAND_ACK_TYPE) => EnvelopeKind::CommandAck,
        _ => EnvelopeKind::Telemetry,
    }
}

/// Decode one line.
///
/// Returns `None` for anything that is not a JSON object; those lines are
/// logged and dropped. Every object whose `data.type` is `"command_ack"`
/// becomes an acknowledgment, whatever its other fields hold. Other objects
/// that do not validate as telemetry come back as [`Envelope::Unknown`].
pub fn decode(line: &str) -> Option<Envelope> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, line, "dropping malformed line");
            return None;
        }
    };
    if !value.is_object() {
        debug!(line, "dropping non-object line");
        return None;
    }

    let envelope = match classify(&value) {
        EnvelopeKind::CommandAck => Envelope::CommandAck(CommandAck::from_value(&value)),
        EnvelopeKind::Telemetry => match Telemetry::deserialize(&value) {
            Ok(telemetry) => Envelope::Telemetry(telemetry),
            Err(e) => {
                debug!(error = %e, "telemetry failed validation");
                Envelope::Unknown(value)
            }
        },
    };
    Some(envelope)
}

/// Counters kept by a [`Dispatcher`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub telemetry: u64,
    pub acks: u64,
    pub malformed: u64,
    pub unknown: u64,
}

/// Single decode stage feeding the telemetry and acknowledgment streams.
pub struct Dispatcher {
    telemetry_tx: broadcast::Sender<Telemetry>,
    ack_tx: broadcast::Sender<CommandAck>,
    event_tx: broadcast::Sender<LinkEvent>,
    telemetry: AtomicU64,
    acks: AtomicU64,
    malformed: AtomicU64,
    unknown: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher with its own channels of the given capacity.
    pub fn new(capacity: usize, event_tx: broadcast::Sender<LinkEvent>) -> Self {
        let (telemetry_tx, _) = broadcast::channel(capacity);
        let (ack_tx, _) = broadcast::channel(capacity);
        Self {
            telemetry_tx,
            ack_tx,
            event_tx,
            telemetry: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<Telemetry> {
        self.telemetry_tx.subscribe()
    }

    pub fn subscribe_acks(&self) -> broadcast::Receiver<CommandAck> {
        self.ack_tx.subscribe()
    }

    /// Sender side of the acknowledgment stream, for components that need
    /// to subscribe later (the correlator subscribes once per command).
    pub fn ack_sender(&self) -> broadcast::Sender<CommandAck> {
        self.ack_tx.clone()
    }

    /// Decode a line and publish it. Returns the stream it went to.
    pub fn dispatch(&self, line: &str) -> Option<EnvelopeKind> {
        if line.trim().is_empty() {
            return None;
        }

        match decode(line) {
            Some(Envelope::Telemetry(telemetry)) => {
                self.telemetry.fetch_add(1, Ordering::Relaxed);
                trace!(sender = %telemetry.sender, "telemetry");
                let _ = self.telemetry_tx.send(telemetry);
                Some(EnvelopeKind::Telemetry)
            }
            Some(Envelope::CommandAck(ack)) => {
                self.acks.fetch_add(1, Ordering::Relaxed);
                trace!(sender = %ack.sender, "command ack");
                let _ = self.ack_tx.send(ack);
                Some(EnvelopeKind::CommandAck)
            }
            Some(Envelope::Unknown(value)) => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                warn!(record = %value, "dropping record of unknown shape");
                None
            }
            None => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            telemetry: self.telemetry.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

impl LineHandler for Dispatcher {
    fn on_line(&self, _generation: u64, line: Line) {
        self.dispatch(&line);
    }

    fn on_end(&self, generation: u64, error: Option<&Error>) {
        if let Some(e) = error {
            let _ = self.event_tx.send(LinkEvent::SessionFailed {
                generation,
                reason: e.to_string(),
            });
        }
        let _ = self.event_tx.send(LinkEvent::SessionClosed { generation });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kartlink_core::types::timestamp;

    const TELEMETRY: &str = r#"{"recipient":"base","sender":"kart-3","rssi":-80,"snr":9.25,"data":{"lat":1,"lng":2,"altitude":3,"speed":4,"course":5,"battery":6,"hdop":7,"satellites":8,"timestamp":"2024-01-01T00:00:00Z"}}"#;

    fn ack_line(uuid: &str) -> String {
        let inner = serde_json::json!({ "uuid": uuid }).to_string();
        serde_json::json!({
            "recipient": "base",
            "sender": "kart-3",
            "data": { "type": "command_ack", "content": { "content": inner } }
        })
        .to_string()
    }

    fn dispatcher() -> Dispatcher {
        let (event_tx, _) = broadcast::channel(16);
        Dispatcher::new(16, event_tx)
    }

    #[test]
    fn classify_by_data_type() {
        let ack: Value = serde_json::from_str(r#"{"data":{"type":"command_ack"}}"#).unwrap();
        let other: Value = serde_json::from_str(r#"{"data":{"type":"position"}}"#).unwrap();
        let absent: Value = serde_json::from_str(r#"{"data":{}}"#).unwrap();
        let no_data: Value = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(classify(&ack), EnvelopeKind::CommandAck);
        assert_eq!(classify(&other), EnvelopeKind::Telemetry);
        assert_eq!(classify(&absent), EnvelopeKind::Telemetry);
        assert_eq!(classify(&no_data), EnvelopeKind::Telemetry);
    }

    #[test]
    fn decode_telemetry_parses_timestamp() {
        match decode(TELEMETRY) {
            Some(Envelope::Telemetry(t)) => {
                assert_eq!(t.sender, "kart-3");
                assert_eq!(t.data.lat, Some(1.0));
                assert_eq!(t.data.satellites, Some(8.0));
                assert_eq!(
                    t.data.timestamp,
                    timestamp::parse("2024-01-01T00:00:00Z").unwrap()
                );
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn decode_ack() {
        let envelope = decode(&ack_line("abc")).unwrap();
        assert_eq!(envelope.kind(), Some(EnvelopeKind::CommandAck));
    }

    #[test]
    fn decode_malformed_is_none() {
        assert_eq!(decode("not json"), None);
        assert_eq!(decode("{\"data\":"), None);
    }

    #[test]
    fn decode_non_object_is_none() {
        assert_eq!(decode("null"), None);
        assert_eq!(decode("42"), None);
    }

    #[test]
    fn telemetry_without_timestamp_is_unknown() {
        let envelope = decode(r#"{"data":{"lat":1}}"#).unwrap();
        assert!(matches!(envelope, Envelope::Unknown(_)));
        assert_eq!(envelope.kind(), None);
    }

    #[test]
    fn ack_with_type_only_still_routes_to_acks() {
        // Content is checked later by the correlator, not here.
        let envelope = decode(r#"{"data":{"type":"command_ack"}}"#).unwrap();
        assert_eq!(envelope.kind(), Some(EnvelopeKind::CommandAck));
    }

    #[test]
    fn ack_with_mistyped_header_reaches_ack_stream() {
        let d = dispatcher();
        let mut acks = d.subscribe_acks();
        let inner = serde_json::json!({ "uuid": "7d3f0f4e-8f43-4c1e-9d6b-4c1a3b2e5f60" }).to_string();
        let line = serde_json::json!({
            "recipient": null,
            "sender": false,
            "rssi": "n/a",
            "snr": {},
            "data": { "type": "command_ack", "content": { "content": inner } }
        })
        .to_string();

        assert_eq!(d.dispatch(&line), Some(EnvelopeKind::CommandAck));
        let ack = acks.try_recv().unwrap();
        assert_eq!(
            ack.command_uuid().unwrap().to_string(),
            "7d3f0f4e-8f43-4c1e-9d6b-4c1a3b2e5f60"
        );
        assert_eq!(d.stats().acks, 1);
        assert_eq!(d.stats().unknown, 0);
    }

    #[test]
    fn telemetry_with_null_sender_reaches_telemetry_stream() {
        let d = dispatcher();
        let mut telemetry = d.subscribe_telemetry();
        let line = r#"{"sender":null,"rssi":"weak","data":{"lat":1,"timestamp":"2024-01-01T00:00:00Z"}}"#;

        assert_eq!(d.dispatch(line), Some(EnvelopeKind::Telemetry));
        let record = telemetry.try_recv().unwrap();
        assert_eq!(record.sender, "");
        assert_eq!(record.rssi, None);
        assert_eq!(record.data.lat, Some(1.0));
    }

    #[test]
    fn two_line_chunk_yields_decoded_telemetry() {
        use crate::framer::LineFramer;

        let d = dispatcher();
        let mut rx = d.subscribe_telemetry();
        let mut framer = LineFramer::new();
        let line = r#"{"data":{"lat":1,"lng":2,"timestamp":"2024-01-01T00:00:00Z"}}"#;
        let chunk = format!("{line}\r\n{line}\r\n");

        for l in framer.push(chunk.as_bytes()) {
            d.dispatch(&l);
        }

        let expected = timestamp::parse("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(rx.try_recv().unwrap().data.timestamp, expected);
        assert_eq!(rx.try_recv().unwrap().data.timestamp, expected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_line_is_dropped_and_next_line_decodes() {
        let d = dispatcher();
        let mut telemetry = d.subscribe_telemetry();
        let mut acks = d.subscribe_acks();

        assert_eq!(d.dispatch("not json"), None);
        assert_eq!(d.dispatch(TELEMETRY), Some(EnvelopeKind::Telemetry));

        assert!(telemetry.try_recv().is_ok());
        assert!(telemetry.try_recv().is_err());
        assert!(acks.try_recv().is_err());
        assert_eq!(
            d.stats(),
            DispatchStats {
                telemetry: 1,
                acks: 0,
                malformed: 1,
                unknown: 0
            }
        );
    }

    #[test]
    fn acks_never_reach_telemetry() {
        let d = dispatcher();
        let mut telemetry = d.subscribe_telemetry();
        let mut acks = d.subscribe_acks();

        assert_eq!(d.dispatch(&ack_line("1")), Some(EnvelopeKind::CommandAck));
        assert!(acks.try_recv().is_ok());
        assert!(telemetry.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_sees_each_record_once() {
        let d = dispatcher();
        let mut a = d.subscribe_telemetry();
        let mut b = d.subscribe_telemetry();

        d.dispatch(TELEMETRY);

        assert_eq!(a.try_recv().unwrap(), b.try_recv().unwrap());
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
        assert_eq!(d.stats().telemetry, 1);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let d = dispatcher();
        assert_eq!(d.dispatch(""), None);
        assert_eq!(d.dispatch("   "), None);
        assert_eq!(d.stats(), DispatchStats::default());
    }

    #[test]
    fn session_end_publishes_events() {
        let (event_tx, mut events) = broadcast::channel(16);
        let d = Dispatcher::new(16, event_tx);

        d.on_end(3, Some(&Error::ReadFailed("gone".into())));
        d.on_end(4, None);

        assert!(matches!(
            events.try_recv().unwrap(),
            LinkEvent::SessionFailed { generation: 3, .. }
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            LinkEvent::SessionClosed { generation: 3 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            LinkEvent::SessionClosed { generation: 4 }
        );
    }
}
