//! Relay error types.

use crate::protocol::Status;
use ferry_core::{CodecError, ConnectionError, TransportError};
use std::borrow::Cow;
use thiserror::Error;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Framing, size or decode failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Status code outside the registry
    #[error("unknown status code {0}")]
    UnknownStatus(u32),

    /// Peer id bytes were not a valid id
    #[error("invalid peer id")]
    InvalidPeerId,

    /// A required field was absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Message of the wrong type for this point in the exchange
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected type
        expected: &'static str,
        /// Received type
        actual: String,
    },
}

impl ProtocolError {
    /// Whether the remote sent bytes that do not decode
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::Codec(CodecError::Decode(_) | CodecError::TooLarge { .. })
                | ProtocolError::UnknownStatus(_)
                | ProtocolError::InvalidPeerId
                | ProtocolError::MissingField(_)
        )
    }
}

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Remote answered with a non-OK status
    #[error("relay responded with status {0}")]
    Status(Status),

    /// Dial through a circuit address that is itself relayed
    #[error("cannot dial through a relayed address: {0}")]
    RelayedDial(String),

    /// Circuit address is unusable
    #[error("invalid circuit address: {0}")]
    InvalidAddress(Cow<'static, str>),

    /// Reservation voucher failed verification
    #[error("invalid reservation voucher: {0}")]
    InvalidVoucher(Cow<'static, str>),

    /// Handshake did not complete in time
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Relay service or transport has not been started
    #[error("relay not started")]
    NotStarted,

    /// Wire protocol failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Transport failure while reaching the relay
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Stable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Status(status) => status.error_code(),
            RelayError::RelayedDial(_) => "ERR_RELAYED_DIAL",
            RelayError::InvalidAddress(_) => "ERR_INVALID_MULTIADDR",
            RelayError::InvalidVoucher(_) => "ERR_INVALID_VOUCHER",
            RelayError::Timeout(_) => "ERR_TIMEOUT",
            RelayError::Config(_) => "ERR_INVALID_CONFIG",
            RelayError::NotStarted => "ERR_NOT_STARTED",
            RelayError::Protocol(_) => "ERR_INVALID_MESSAGE",
            RelayError::Connection(e) => e.code(),
            RelayError::Transport(e) => e.code(),
        }
    }
}

impl From<RelayError> for TransportError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Transport(e) => e,
            RelayError::Connection(e) => TransportError::Connection(e),
            other => {
                let code = other.code();
                TransportError::other(code, other)
            }
        }
    }
}

/// Result type for relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            RelayError::Status(Status::NoReservation).code(),
            "ERR_NO_RESERVATION"
        );
        assert_eq!(
            RelayError::RelayedDial("x".into()).code(),
            "ERR_RELAYED_DIAL"
        );
        assert_eq!(
            RelayError::InvalidAddress("x".into()).code(),
            "ERR_INVALID_MULTIADDR"
        );
    }

    #[test]
    fn test_into_transport_error_keeps_code() {
        let err: TransportError = RelayError::RelayedDial("addr".into()).into();
        assert_eq!(err.code(), "ERR_RELAYED_DIAL");
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::RelayedDial(_))
        ));

        let err: TransportError =
            RelayError::Connection(ConnectionError::TransientConnection {
                protocol: "/p".into(),
            })
            .into();
        assert_eq!(err.code(), "ERR_TRANSIENT_CONNECTION");
    }

    #[test]
    fn test_malformed_classification() {
        assert!(ProtocolError::Codec(CodecError::Decode("bad".into())).is_malformed());
        assert!(!ProtocolError::Codec(CodecError::UnexpectedEof).is_malformed());
    }
}
