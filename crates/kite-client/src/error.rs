//! Session and socket error taxonomy
//!
//! [`SessionError`] covers failures scoped to the whole session;
//! [`SocketError`] failures scoped to one tunnel socket. Socket failures
//! never take the session down.

use std::fmt;

use kite_proto::signaling::LineError;
use kite_proto::WireError;
use kite_transport::TransportError;
use thiserror::Error;

use crate::session::SessionState;

/// Why an application open was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No response within the app-open timeout.
    Timeout,
    /// The appliance answered with an errno.
    Error(u32),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Timeout => write!(f, "timeout"),
            DenyReason::Error(errno) => write!(f, "errno {errno}"),
        }
    }
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed wire bytes. Fatal for the affected channel.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The flock does not know the requested appliance. Recoverable: choose
    /// another appliance or retry against a different signaling endpoint.
    #[error("appliance not known to this flock")]
    ApplianceNotFound,

    /// The appliance rejected the login exchange. Recoverable: re-prompt for
    /// credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The appliance denied opening an application. Recoverable per
    /// application.
    #[error("application {name:?} denied: {reason}")]
    ApplicationDenied { name: String, reason: DenyReason },

    /// Failure reported by the peer-transport collaborator.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A signaling line arrived outside the transition table. Terminal.
    #[error("unexpected line {code} in state {state:?}")]
    UnexpectedLine { state: SessionState, code: u16 },

    /// The operation requires a session phase that has not been reached.
    #[error("session not ready for this operation")]
    NotReady,

    /// The session has been closed.
    #[error("session closed")]
    Closed,
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        SessionError::ProtocolViolation(err.to_string())
    }
}

impl From<LineError> for SessionError {
    fn from(err: LineError) -> Self {
        SessionError::ProtocolViolation(err.to_string())
    }
}

/// Errors scoped to one tunnel socket
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The appliance refused the socket connect with an errno.
    #[error("remote refused connect: errno {errno}")]
    Remote { errno: u32 },

    /// The datagram connect retry budget ran out without a response.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The operation is not valid in the socket's current state.
    #[error("operation invalid in current socket state")]
    InvalidState,

    /// The socket has been closed.
    #[error("socket closed")]
    Closed,

    /// Malformed frame on the socket channel. Fatal for the socket.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Failure reported by the underlying channel.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for SocketError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ChannelClosed => SocketError::Closed,
            other => SocketError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_reason_display() {
        assert_eq!(DenyReason::Timeout.to_string(), "timeout");
        assert_eq!(DenyReason::Error(13).to_string(), "errno 13");
    }

    #[test]
    fn wire_errors_map_to_protocol_violation() {
        let err: SessionError = WireError::UnknownTag(9).into();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn closed_channel_maps_to_socket_closed() {
        let err: SocketError = TransportError::ChannelClosed.into();
        assert_eq!(err, SocketError::Closed);
    }
}
