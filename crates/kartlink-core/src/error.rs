//! Error types for kartlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport failures, decode failures,
//! and command-delivery outcomes are all captured here.

use uuid::Uuid;

/// The error type for all kartlink operations.
///
/// Only a few variants ever reach a caller. Decode and ack-parse errors are
/// recovered inside the link engine (the offending line is dropped or the
/// acknowledgment treated as a non-match) and only surface in logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial port could not be opened or enumerated.
    #[error("transport error: {0}")]
    Transport(String),

    /// A read from an open port failed mid-stream.
    ///
    /// Terminates the session that owned the port. The link does not
    /// reconnect on its own.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// No data arrived within a transport poll interval.
    #[error("timeout waiting for data")]
    Timeout,

    /// No session is currently open.
    #[error("not connected")]
    NotConnected,

    /// The port went away underneath an open session.
    #[error("connection lost")]
    ConnectionLost,

    /// An invalid parameter was passed to a link operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The content of a command acknowledgment could not be parsed.
    #[error("malformed command acknowledgment: {0}")]
    AckParse(String),

    /// A line was not a valid JSON envelope.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A command exhausted its retry budget without being acknowledged.
    #[error("command {uuid} not acknowledged after {retries} retries")]
    CommandFailed {
        /// Identifier of the abandoned command.
        uuid: Uuid,
        /// Number of retries that were sent after the first attempt.
        retries: u32,
    },

    /// The session that carried a command was replaced before it was
    /// acknowledged.
    #[error("session changed before command {uuid} was acknowledged")]
    SessionChanged {
        /// Identifier of the orphaned command.
        uuid: Uuid,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_read_failed() {
        let e = Error::ReadFailed("device unplugged".into());
        assert_eq!(e.to_string(), "read failed: device unplugged");
    }

    #[test]
    fn error_display_not_connected() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_ack_parse() {
        let e = Error::AckParse("missing uuid".into());
        assert_eq!(e.to_string(), "malformed command acknowledgment: missing uuid");
    }

    #[test]
    fn error_display_command_failed() {
        let uuid = Uuid::nil();
        let e = Error::CommandFailed { uuid, retries: 3 };
        assert_eq!(
            e.to_string(),
            "command 00000000-0000-0000-0000-000000000000 not acknowledged after 3 retries"
        );
    }

    #[test]
    fn error_display_session_changed() {
        let e = Error::SessionChanged { uuid: Uuid::nil() };
        assert!(e.to_string().starts_with("session changed"));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let e: Error = json_err.into();
        assert!(matches!(e, Error::Json(_)));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
