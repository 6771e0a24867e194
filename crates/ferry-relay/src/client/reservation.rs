//! Client side of RESERVE.

use crate::error::{ProtocolError, RelayError, Result};
use crate::limit::Limit;
use crate::protocol::{HOP_PROTOCOL, HopMessage, HopType, Status, read_message, write_message};
use crate::server::store::unix_now;
use crate::voucher::SignedVoucher;
use ferry_core::{Connection, Multiaddr, PeerId, StreamOptions};
use std::time::{Duration, Instant};

/// A reservation we hold on a relay
#[derive(Debug, Clone)]
pub struct ActiveReservation {
    /// Relay holding the slot
    pub relay: PeerId,
    /// Expiry as UNIX seconds, as reported by the relay
    pub expire: u64,
    /// Local deadline derived from `expire`
    pub expires_at: Instant,
    /// Relay addresses to advertise circuit addresses under
    pub addrs: Vec<Multiaddr>,
    /// Limit the relay will apply to our circuits
    pub limit: Option<Limit>,
    /// Verified voucher, if the relay sent one
    pub voucher: Option<SignedVoucher>,
}

impl ActiveReservation {
    /// Time left before expiry
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Send RESERVE over `connection` and wait for the relay's answer
///
/// # Errors
///
/// Returns [`RelayError::Status`] if the relay refuses,
/// [`RelayError::InvalidVoucher`] if its voucher does not bind it to `local`,
/// [`RelayError::Timeout`] if no answer arrives within `timeout`, and
/// stream or protocol errors otherwise.
pub async fn reserve(connection: &Connection, local: PeerId, timeout: Duration) -> Result<ActiveReservation> {
    let relay = connection.remote_peer();

    let exchange = async {
        let mut stream = connection
            .new_stream(HOP_PROTOCOL, StreamOptions::default())
            .await?;
        write_message(&mut stream, &HopMessage::reserve()).await?;
        let reply: HopMessage = read_message(&mut stream).await?;
        Ok::<_, RelayError>(reply)
    };
    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| RelayError::Timeout("reservation"))??;

    if reply.kind != HopType::Status {
        return Err(ProtocolError::UnexpectedMessage {
            expected: "STATUS",
            actual: format!("{:?}", reply.kind),
        }
        .into());
    }
    match reply.status {
        Some(Status::Ok) => {}
        Some(status) => return Err(RelayError::Status(status)),
        None => return Err(ProtocolError::MissingField("status").into()),
    }

    let info = reply
        .reservation
        .ok_or(ProtocolError::MissingField("reservation"))?;

    let voucher = match &info.voucher {
        Some(bytes) => {
            let voucher = SignedVoucher::from_bytes(bytes)?;
            voucher.verify(relay, local)?;
            Some(voucher)
        }
        None => None,
    };

    let remaining = Duration::from_secs(info.expire.saturating_sub(unix_now()));
    let addrs = info
        .multiaddrs()
        .into_iter()
        .filter(|addr| !addr.is_circuit())
        .collect();

    tracing::debug!(
        "Reservation on {} granted until {} ({:?} left)",
        relay.short(),
        info.expire,
        remaining
    );

    Ok(ActiveReservation {
        relay,
        expire: info.expire,
        expires_at: Instant::now() + remaining,
        addrs,
        limit: reply.limit.map(Limit::from_wire),
        voucher,
    })
}
