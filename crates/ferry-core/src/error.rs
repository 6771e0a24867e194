//! Error types for the Ferry host substrate.
//!
//! Errors are split by layer so callers can match on the failure they care
//! about. Every error that can reach an application exposes a stable
//! [`code`](ConnectionError::code) string, mirroring the codes carried over the
//! wire by peers written against other stacks.

use crate::multiaddr::Multiaddr;
use std::borrow::Cow;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error used for transport-specific failures
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Identity and key handling errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Byte slice had the wrong length for a peer id or key
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Text form was not valid hex
    #[error("invalid peer id encoding: {0}")]
    InvalidEncoding(String),

    /// Public key bytes are not a valid Ed25519 point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature failed verification
    #[error("signature verification failed")]
    InvalidSignature,
}

/// Multiaddr parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MultiaddrError {
    /// Text form must start with `/`
    #[error("multiaddr must start with '/'")]
    MissingLeadingSlash,

    /// Unknown protocol name
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Protocol requires a value that was not supplied
    #[error("missing value for protocol {0}")]
    MissingValue(&'static str),

    /// Protocol value could not be parsed
    #[error("invalid value {value:?} for protocol {protocol}")]
    InvalidValue {
        /// Protocol name
        protocol: &'static str,
        /// Offending value
        value: String,
    },

    /// Binary form could not be decoded
    #[error("invalid binary multiaddr: {0}")]
    Decode(String),
}

/// Multiplexer frame errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Header could not be read completely
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Invalid frame type byte
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// Declared payload exceeds the maximum frame payload
    #[error("frame payload of {0} bytes exceeds maximum")]
    PayloadTooLarge(usize),
}

/// Length-prefixed message codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Stream ended before a complete message arrived
    #[error("stream ended before message was complete")]
    UnexpectedEof,

    /// Declared message length exceeds the limit
    #[error("message of {size} bytes exceeds limit of {max}")]
    TooLarge {
        /// Declared size
        size: usize,
        /// Limit in force
        max: usize,
    },

    /// Message could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),

    /// Message bytes could not be deserialized
    #[error("decode failed: {0}")]
    Decode(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::UnexpectedEof
        } else {
            CodecError::Io(err)
        }
    }
}

/// Connection and stream errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection has been closed
    #[error("connection closed")]
    Closed,

    /// Stream refused by the transient gate
    #[error("cannot open protocol stream {protocol} on a transient connection")]
    TransientConnection {
        /// Protocol that was refused
        protocol: String,
    },

    /// Remote peer refused the protocol (unsupported or gated)
    #[error("protocol {0} rejected by remote")]
    ProtocolRejected(String),

    /// Stream was reset by the remote or the connection went away
    #[error("stream reset")]
    StreamReset,

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Identity handshake failed
    #[error("handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Remote identity differed from the one expected by the dialer
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerMismatch {
        /// Expected peer id
        expected: String,
        /// Peer id presented by the remote
        actual: String,
    },

    /// Multiplexer framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Message codec error on a control stream
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Stable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::Closed => "ERR_CONNECTION_CLOSED",
            ConnectionError::TransientConnection { .. } => "ERR_TRANSIENT_CONNECTION",
            ConnectionError::ProtocolRejected(_) => "ERR_UNSUPPORTED_PROTOCOL",
            ConnectionError::StreamReset => "ERR_STREAM_RESET",
            ConnectionError::Timeout(_) => "ERR_TIMEOUT",
            ConnectionError::Handshake(_) => "ERR_HANDSHAKE",
            ConnectionError::PeerMismatch { .. } => "ERR_INVALID_PEER",
            ConnectionError::Frame(_) => "ERR_INVALID_FRAME",
            ConnectionError::Codec(_) => "ERR_INVALID_MESSAGE",
            ConnectionError::Io(_) => "ERR_IO",
        }
    }
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// No registered transport accepts the address
    #[error("no transport available for address {0}")]
    NoTransport(Multiaddr),

    /// Nothing is listening at the address
    #[error("connection refused: {0}")]
    ConnectionRefused(Multiaddr),

    /// Address is not usable for the requested operation
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress {
        /// Offending address
        addr: Multiaddr,
        /// Why it was rejected
        reason: Cow<'static, str>,
    },

    /// Peer has no known addresses
    #[error("no addresses known for peer {0}")]
    NoAddresses(String),

    /// The host has been stopped
    #[error("host is not running")]
    NotRunning,

    /// Connection upgrade failed
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Transport-specific failure carrying its own code
    #[error("{source}")]
    Other {
        /// Stable error code
        code: &'static str,
        /// Underlying error
        source: BoxError,
    },
}

impl TransportError {
    /// Wrap a transport-specific error with a stable code
    pub fn other<E>(code: &'static str, err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        TransportError::Other {
            code,
            source: Box::new(err),
        }
    }

    /// Stable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NoTransport(_) => "ERR_TRANSPORT_UNAVAILABLE",
            TransportError::ConnectionRefused(_) => "ERR_CONNECTION_REFUSED",
            TransportError::InvalidAddress { .. } => "ERR_INVALID_MULTIADDR",
            TransportError::NoAddresses(_) => "ERR_NO_VALID_ADDRESSES",
            TransportError::NotRunning => "ERR_NODE_NOT_STARTED",
            TransportError::Connection(e) => e.code(),
            TransportError::Other { code, .. } => code,
        }
    }

    /// Downcast a transport-specific error to a concrete type
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            TransportError::Other { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type for connection operations
pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;
