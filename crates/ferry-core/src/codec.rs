//! Length-prefixed bincode messages over byte streams.
//!
//! Control protocols (identify, relay HOP/STOP) exchange one message at a time
//! as a `u32` big-endian length followed by the bincode body.

use crate::error::CodecError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Serialize `message` and write it with a length prefix
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if the encoded message exceeds `max_size`,
/// or an I/O error from the underlying stream.
pub async fn write_message<W, M>(io: &mut W, message: &M, max_size: usize) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    if body.len() > max_size {
        return Err(CodecError::TooLarge {
            size: body.len(),
            max: max_size,
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed message
///
/// # Errors
///
/// Returns [`CodecError::UnexpectedEof`] if the stream ends early,
/// [`CodecError::TooLarge`] for oversized declarations and
/// [`CodecError::Decode`] for malformed bodies.
pub async fn read_message<R, M>(io: &mut R, max_size: usize) -> Result<M, CodecError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    io.read_exact(&mut prefix).await?;
    let size = u32::from_be_bytes(prefix) as usize;
    if size > max_size {
        return Err(CodecError::TooLarge {
            size,
            max: max_size,
        });
    }

    let mut body = vec![0u8; size];
    io.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[tokio::test]
    async fn test_message_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let ping = Ping {
            seq: 3,
            note: "hi".into(),
        };
        write_message(&mut a, &ping, 1024).await.unwrap();
        let received: Ping = read_message(&mut b, 1024).await.unwrap();
        assert_eq!(received, ping);
    }

    #[tokio::test]
    async fn test_oversized_declaration_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&10_000u32.to_be_bytes()).await.unwrap();
        let result: Result<Ping, _> = read_message(&mut b, 4096).await;
        assert!(matches!(result, Err(CodecError::TooLarge { size: 10_000, .. })));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let ping = Ping {
            seq: 1,
            note: "x".repeat(100),
        };
        assert!(matches!(
            write_message(&mut a, &ping, 16).await,
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_before_message() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let result: Result<Ping, _> = read_message(&mut b, 1024).await;
        assert!(matches!(result, Err(CodecError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_garbage_body() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&2u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xFF, 0xFF]).await.unwrap();
        let result: Result<Ping, _> = read_message(&mut b, 1024).await;
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    proptest::proptest! {
        #[test]
        fn prop_declared_size_over_max_rejected(max in 0usize..4096, excess in 1u32..100_000) {
            let declared = max as u32 + excess;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let result: Result<Ping, _> = runtime.block_on(async {
                let (mut a, mut b) = tokio::io::duplex(64);
                a.write_all(&declared.to_be_bytes()).await.unwrap();
                read_message(&mut b, max).await
            });

            let rejected = matches!(result, Err(CodecError::TooLarge { size, .. }) if size == declared as usize);
            proptest::prop_assert!(rejected);
        }
    }
}
