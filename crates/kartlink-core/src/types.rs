//! Wire types carried over the link.
//!
//! Inbound lines are JSON objects of two shapes: [`Telemetry`] from the kart
//! tracker, and [`CommandAck`] when the radio confirms delivery of a
//! command. Outbound commands are serialized [`CommandMessage`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Value of `data.type` that marks a command acknowledgment.
pub const COMMAND_ACK_TYPE: &str = "command_ack";

/// One telemetry record from a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Address the radio delivered this packet to.
    #[serde(default, deserialize_with = "lenient::string")]
    pub recipient: String,
    /// Address of the transmitting tracker.
    #[serde(default, deserialize_with = "lenient::string")]
    pub sender: String,
    /// Received signal strength in dBm.
    #[serde(default, deserialize_with = "lenient::number")]
    pub rssi: Option<f64>,
    /// Signal-to-noise ratio in dB.
    #[serde(default, deserialize_with = "lenient::number")]
    pub snr: Option<f64>,
    /// GNSS and battery readings.
    pub data: TelemetryData,
}

/// GNSS fix and housekeeping carried inside a [`Telemetry`] record.
///
/// Readings that are missing, null or not numbers decode as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryData {
    #[serde(default, deserialize_with = "lenient::number")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub lng: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub altitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub course: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub battery: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub hdop: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub satellites: Option<f64>,
    /// Fix time. Always a parsed instant once decoded.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// An outbound command and its delivery bookkeeping.
///
/// Serialized with camelCase keys; `retryCounter` and `failed` are omitted
/// until they carry a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub uuid: Uuid,
    pub message: String,
    pub ack: bool,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_counter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<bool>,
}

impl CommandMessage {
    /// Create a fresh, unacknowledged command with a random identifier.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            message: message.into(),
            ack: false,
            timestamp: Utc::now(),
            retry_counter: None,
            failed: None,
        }
    }

    /// Serialize to the single-string form written to the port.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Bump the retry counter, treating an absent counter as zero.
    pub fn increment_retry(&mut self) -> u32 {
        let next = self.retry_counter.unwrap_or(0) + 1;
        self.retry_counter = Some(next);
        next
    }
}

/// A command acknowledgment relayed by the radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    #[serde(default, deserialize_with = "lenient::string")]
    pub recipient: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub sender: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub rssi: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub snr: Option<f64>,
    pub data: AckData,
}

/// Payload of a [`CommandAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckData {
    /// Always [`COMMAND_ACK_TYPE`] for a decoded acknowledgment.
    #[serde(rename = "type")]
    pub kind: String,
    /// Relayed packet. Its `content` field holds the original command as
    /// a JSON-encoded string.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AckedCommand {
    uuid: Uuid,
}

impl CommandAck {
    /// Build an acknowledgment from any JSON record.
    ///
    /// Never fails: header fields of the wrong type are blanked, and
    /// `data.content` is kept as is for [`CommandAck::command_uuid`] to
    /// inspect.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let number = |key: &str| value.get(key).and_then(serde_json::Value::as_f64);
        Self {
            recipient: text("recipient"),
            sender: text("sender"),
            rssi: number("rssi"),
            snr: number("snr"),
            data: AckData {
                kind: COMMAND_ACK_TYPE.to_owned(),
                content: value
                    .get("data")
                    .and_then(|data| data.get("content"))
                    .cloned(),
            },
        }
    }

    /// Identifier of the command this acknowledgment confirms.
    ///
    /// The identifier lives inside `data.content.content`, which is itself
    /// a JSON document encoded as a string.
    pub fn command_uuid(&self) -> Result<Uuid> {
        let encoded = self
            .data
            .content
            .as_ref()
            .and_then(|content| content.get("content"))
            .ok_or_else(|| Error::AckParse("missing data.content.content".into()))?
            .as_str()
            .ok_or_else(|| Error::AckParse("data.content.content is not a string".into()))?;

        let acked: AckedCommand =
            serde_json::from_str(encoded).map_err(|e| Error::AckParse(e.to_string()))?;
        Ok(acked.uuid)
    }
}

/// Field deserializers that accept any JSON value.
///
/// Radios relay whatever the tracker put in a packet, so a header or
/// reading of the wrong type is blanked instead of rejecting the record.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// A string, or empty for null and non-string values.
    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            _ => String::new(),
        })
    }

    /// A number, or `None` for null and non-numeric values.
    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(Value::deserialize(d)?.as_f64())
    }
}

/// Serde adapter for instants on the wire.
///
/// Serializes as RFC 3339 with millisecond precision. Deserializes either an
/// RFC 3339 string or a count of Unix milliseconds. Fractional milliseconds
/// are truncated.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        d.deserialize_any(TimestampVisitor)
    }

    /// Parse a textual timestamp.
    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an RFC 3339 timestamp or Unix milliseconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse(v).ok_or_else(|| E::custom(format!("invalid timestamp {v:?}")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Utc.timestamp_millis_opt(v)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp {v} out of range")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            let millis = i64::try_from(v).map_err(|_| E::custom("timestamp out of range"))?;
            self.visit_i64(millis)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            let millis = v.trunc();
            if !millis.is_finite() {
                return Err(E::custom(format!("timestamp {v} out of range")));
            }
            self.visit_i64(millis as i64)
        }
    }
}
