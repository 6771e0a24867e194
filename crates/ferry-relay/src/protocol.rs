//! Circuit relay wire messages.
//!
//! HOP runs between a client and the relay; STOP runs from the relay to the
//! destination. Each message is a bincode body behind a 4-byte big-endian
//! length, at most [`MAX_MESSAGE_SIZE`] bytes.

use crate::error::ProtocolError;
use ferry_core::codec;
use ferry_core::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// HOP protocol id
pub const HOP_PROTOCOL: &str = "/ferry/circuit/relay/0.2.0/hop";

/// STOP protocol id
pub const STOP_PROTOCOL: &str = "/ferry/circuit/relay/0.2.0/stop";

/// Maximum encoded message size
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Status {
    /// Request succeeded
    Ok = 100,
    /// Relay refused the reservation
    ReservationRefused = 200,
    /// Relay is out of circuit capacity
    ResourceLimitExceeded = 201,
    /// Request not permitted
    PermissionDenied = 202,
    /// Relay could not reach the destination
    ConnectionFailed = 203,
    /// Destination holds no reservation
    NoReservation = 204,
    /// Message could not be decoded
    MalformedMessage = 400,
    /// Message type not valid here
    UnexpectedMessage = 401,
}

impl Status {
    /// Numeric wire code
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Stable error code for a non-OK status
    #[must_use]
    pub fn error_code(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::ReservationRefused => "ERR_RESERVATION_REFUSED",
            Status::ResourceLimitExceeded => "ERR_RESOURCE_LIMIT_EXCEEDED",
            Status::PermissionDenied => "ERR_PERMISSION_DENIED",
            Status::ConnectionFailed => "ERR_CONNECTION_FAILED",
            Status::NoReservation => "ERR_NO_RESERVATION",
            Status::MalformedMessage => "ERR_MALFORMED_MESSAGE",
            Status::UnexpectedMessage => "ERR_UNEXPECTED_MESSAGE",
        }
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> u32 {
        status.code()
    }
}

impl TryFrom<u32> for Status {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            100 => Ok(Status::Ok),
            200 => Ok(Status::ReservationRefused),
            201 => Ok(Status::ResourceLimitExceeded),
            202 => Ok(Status::PermissionDenied),
            203 => Ok(Status::ConnectionFailed),
            204 => Ok(Status::NoReservation),
            400 => Ok(Status::MalformedMessage),
            401 => Ok(Status::UnexpectedMessage),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Peer description carried in CONNECT messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Raw peer id bytes
    pub id: Vec<u8>,
    /// Binary multiaddrs
    pub addrs: Vec<Vec<u8>>,
}

impl Peer {
    /// Describe `peer` with optional addresses
    #[must_use]
    pub fn new(peer: PeerId, addrs: &[Multiaddr]) -> Self {
        Self {
            id: peer.to_vec(),
            addrs: addrs.iter().map(Multiaddr::to_bytes).collect(),
        }
    }

    /// Decode the peer id
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPeerId`] if the bytes are not a peer id.
    pub fn peer_id(&self) -> Result<PeerId, ProtocolError> {
        PeerId::from_bytes(&self.id).map_err(|_| ProtocolError::InvalidPeerId)
    }

    /// Decode the addresses, skipping malformed entries
    #[must_use]
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        decode_addrs(&self.addrs)
    }
}

/// Reservation details returned by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    /// Expiry as unix seconds
    pub expire: u64,
    /// Relay addresses usable in circuit addresses
    pub addrs: Vec<Vec<u8>>,
    /// Signed reservation voucher
    pub voucher: Option<Vec<u8>>,
}

impl ReservationInfo {
    /// Decode the relay addresses, skipping malformed entries
    #[must_use]
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        decode_addrs(&self.addrs)
    }
}

/// Limit as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLimit {
    /// Maximum duration in milliseconds
    pub duration: Option<u32>,
    /// Maximum bytes per direction
    pub data: Option<u64>,
}

/// HOP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopType {
    /// Request a reservation
    Reserve,
    /// Request a circuit to a peer
    Connect,
    /// Response
    Status,
}

/// HOP protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopMessage {
    /// Message type
    pub kind: HopType,
    /// CONNECT target
    pub peer: Option<Peer>,
    /// Reservation details in a RESERVE response
    pub reservation: Option<ReservationInfo>,
    /// Limit requested or in force
    pub limit: Option<WireLimit>,
    /// Response status
    pub status: Option<Status>,
}

impl HopMessage {
    /// RESERVE request
    #[must_use]
    pub fn reserve() -> Self {
        Self {
            kind: HopType::Reserve,
            peer: None,
            reservation: None,
            limit: None,
            status: None,
        }
    }

    /// CONNECT request for `peer`
    #[must_use]
    pub fn connect(peer: Peer) -> Self {
        Self {
            kind: HopType::Connect,
            peer: Some(peer),
            reservation: None,
            limit: None,
            status: None,
        }
    }

    /// Bare STATUS response
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            kind: HopType::Status,
            peer: None,
            reservation: None,
            limit: None,
            status: Some(status),
        }
    }

    /// Attach a limit
    #[must_use]
    pub fn with_limit(mut self, limit: Option<WireLimit>) -> Self {
        self.limit = limit;
        self
    }

    /// Attach reservation details
    #[must_use]
    pub fn with_reservation(mut self, reservation: ReservationInfo) -> Self {
        self.reservation = Some(reservation);
        self
    }
}

/// STOP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopType {
    /// Relay announces an incoming circuit
    Connect,
    /// Response
    Status,
}

/// STOP protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMessage {
    /// Message type
    pub kind: StopType,
    /// Circuit initiator
    pub peer: Option<Peer>,
    /// Limit in force for the circuit
    pub limit: Option<WireLimit>,
    /// Response status
    pub status: Option<Status>,
}

impl StopMessage {
    /// CONNECT from the relay naming the initiator
    #[must_use]
    pub fn connect(initiator: Peer, limit: Option<WireLimit>) -> Self {
        Self {
            kind: StopType::Connect,
            peer: Some(initiator),
            limit,
            status: None,
        }
    }

    /// STATUS response
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            kind: StopType::Status,
            peer: None,
            limit: None,
            status: Some(status),
        }
    }
}

/// Read one relay message
///
/// # Errors
///
/// Returns [`ProtocolError::Codec`] on I/O, size or decode failures.
pub async fn read_message<R, M>(io: &mut R) -> Result<M, ProtocolError>
where
    R: AsyncRead + Unpin,
    M: serde::de::DeserializeOwned,
{
    Ok(codec::read_message(io, MAX_MESSAGE_SIZE).await?)
}

/// Write one relay message
///
/// # Errors
///
/// Returns [`ProtocolError::Codec`] on I/O or size failures.
pub async fn write_message<W, M>(io: &mut W, message: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    Ok(codec::write_message(io, message, MAX_MESSAGE_SIZE).await?)
}

fn decode_addrs(addrs: &[Vec<u8>]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter_map(|bytes| Multiaddr::from_bytes(bytes).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.code(), 100);
        assert_eq!(Status::ReservationRefused.code(), 200);
        assert_eq!(Status::ResourceLimitExceeded.code(), 201);
        assert_eq!(Status::PermissionDenied.code(), 202);
        assert_eq!(Status::ConnectionFailed.code(), 203);
        assert_eq!(Status::NoReservation.code(), 204);
        assert_eq!(Status::MalformedMessage.code(), 400);
        assert_eq!(Status::UnexpectedMessage.code(), 401);
        assert_eq!(Status::try_from(204).unwrap(), Status::NoReservation);
        assert!(matches!(
            Status::try_from(999),
            Err(ProtocolError::UnknownStatus(999))
        ));
    }

    #[test]
    fn test_status_serialized_as_numeric_code() {
        let bytes = bincode::serialize(&Status::NoReservation).unwrap();
        assert_eq!(bytes, 204u32.to_le_bytes());

        let bogus = bincode::serialize(&777u32).unwrap();
        assert!(bincode::deserialize::<Status>(&bogus).is_err());
    }

    #[test]
    fn test_peer_decoding() {
        let id = PeerId::random();
        let addr: Multiaddr = "/memory/7".parse().unwrap();
        let mut peer = Peer::new(id, std::slice::from_ref(&addr));
        peer.addrs.push(vec![0xFF]);

        assert_eq!(peer.peer_id().unwrap(), id);
        assert_eq!(peer.multiaddrs(), vec![addr]);

        let short = Peer {
            id: vec![1, 2, 3],
            addrs: Vec::new(),
        };
        assert!(matches!(short.peer_id(), Err(ProtocolError::InvalidPeerId)));
    }

    #[tokio::test]
    async fn test_hop_exchange() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let request = HopMessage::connect(Peer::new(PeerId::random(), &[]));
        write_message(&mut a, &request).await.unwrap();
        let received: HopMessage = read_message(&mut b).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut a, _b) = tokio::io::duplex(8192);
        let peer = Peer {
            id: vec![0; MAX_MESSAGE_SIZE],
            addrs: Vec::new(),
        };
        let result = write_message(&mut a, &StopMessage::connect(peer, None)).await;
        assert!(result.is_err());
    }
}
