//! Byte bridging between the two halves of a circuit.

use crate::limit::{Admit, LimitTracker};
use crate::server::metrics::RelayMetrics;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer size for each direction
pub const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// Why a circuit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Both sides finished writing
    Completed,
    /// Byte budget exhausted
    DataLimit,
    /// Duration budget exhausted
    DurationLimit,
    /// A stream failed
    Error,
}

#[derive(Debug)]
enum CopyStop {
    LimitReached,
    Io(io::Error),
}

/// Forward bytes both ways until both sides finish or a limit is hit
///
/// Consumes both streams; when this returns they have been dropped, which
/// closes them.
pub async fn bridge<A, B>(
    initiator: A,
    target: B,
    tracker: &LimitTracker,
    metrics: &RelayMetrics,
) -> BridgeOutcome
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut initiator_rx, mut initiator_tx) = tokio::io::split(initiator);
    let (mut target_rx, mut target_tx) = tokio::io::split(target);

    let copies = async {
        tokio::try_join!(
            copy_limited(&mut initiator_rx, &mut target_tx, tracker, metrics),
            copy_limited(&mut target_rx, &mut initiator_tx, tracker, metrics),
        )
    };
    let deadline = async {
        match tracker.deadline() {
            Some(at) => tokio::time::sleep_until(at.into()).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = copies => match result {
            Ok(_) => BridgeOutcome::Completed,
            Err(CopyStop::LimitReached) => BridgeOutcome::DataLimit,
            Err(CopyStop::Io(e)) => {
                tracing::trace!("Circuit stream failed: {}", e);
                BridgeOutcome::Error
            }
        },
        () = deadline => BridgeOutcome::DurationLimit,
    }
}

async fn copy_limited<R, W>(
    reader: &mut R,
    writer: &mut W,
    tracker: &LimitTracker,
    metrics: &RelayMetrics,
) -> Result<(), CopyStop>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await.map_err(CopyStop::Io)?;
        if n == 0 {
            // Propagate the half-close and let the other direction continue
            let _ = writer.shutdown().await;
            return Ok(());
        }

        let admit = tracker.admit(n as u64);
        if admit == Admit::Refused {
            return Err(CopyStop::LimitReached);
        }

        writer.write_all(&buf[..n]).await.map_err(CopyStop::Io)?;
        writer.flush().await.map_err(CopyStop::Io)?;
        metrics.add_bytes(n as u64);

        if admit == Admit::Final {
            return Err(CopyStop::LimitReached);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::Limit;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_unlimited_bridge_completes() {
        let (initiator, mut initiator_remote) = tokio::io::duplex(64 * 1024);
        let (target, mut target_remote) = tokio::io::duplex(64 * 1024);
        let tracker = LimitTracker::new(Limit::unlimited());
        let metrics = RelayMetrics::new();

        let remote = tokio::spawn(async move {
            initiator_remote.write_all(b"hello").await.unwrap();
            initiator_remote.shutdown().await.unwrap();
            let mut buf = [0u8; 5];
            target_remote.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            target_remote.write_all(b"world").await.unwrap();
            target_remote.shutdown().await.unwrap();
            let mut reply = Vec::new();
            initiator_remote.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let outcome = bridge(initiator, target, &tracker, &metrics).await;
        assert_eq!(outcome, BridgeOutcome::Completed);
        assert_eq!(remote.await.unwrap(), b"world");
        assert_eq!(metrics.snapshot().bytes_forwarded, 10);
    }

    #[tokio::test]
    async fn test_data_limit_stops_forwarding() {
        let (initiator, mut initiator_remote) = tokio::io::duplex(64 * 1024);
        let (target, mut target_remote) = tokio::io::duplex(256 * 1024);
        let tracker = LimitTracker::new(Limit {
            data: Some(1024),
            duration: None,
        });
        let metrics = RelayMetrics::new();

        let sender = tokio::spawn(async move {
            for _ in 0..64 {
                if initiator_remote.write_all(&[7u8; 2048]).await.is_err() {
                    break;
                }
            }
        });

        let outcome = bridge(initiator, target, &tracker, &metrics).await;
        assert_eq!(outcome, BridgeOutcome::DataLimit);

        let mut received = Vec::new();
        target_remote.read_to_end(&mut received).await.unwrap();
        assert!(!received.is_empty());
        assert!(received.len() < 1024 + BRIDGE_BUFFER_SIZE);
        assert!(received.len() < 64 * 2048);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_duration_limit_closes() {
        let (initiator, _initiator_remote) = tokio::io::duplex(1024);
        let (target, mut target_remote) = tokio::io::duplex(1024);
        let tracker = LimitTracker::new(Limit {
            data: None,
            duration: Some(Duration::from_millis(100)),
        });
        let metrics = RelayMetrics::new();

        let started = Instant::now();
        let outcome = bridge(initiator, target, &tracker, &metrics).await;
        assert_eq!(outcome, BridgeOutcome::DurationLimit);
        assert!(started.elapsed() >= Duration::from_millis(90));

        let mut buf = [0u8; 1];
        assert_eq!(target_remote.read(&mut buf).await.unwrap(), 0);
    }
}
