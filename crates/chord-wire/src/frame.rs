//! Length-prefixed JSON framing: 4-byte big-endian length prefix + JSON
//! payload. Used for the agent's control channel and, wrapped in
//! [`crate::remoting::Message`], for `Communicate` stream frames. Transport
//! family is left to the caller — this module only frames an ordered byte
//! stream, whether that stream rides over a Unix socket or TCP.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single-message size (16 MiB) — guards against a malformed length
/// prefix causing an unbounded allocation.
pub const MAX_MESSAGE_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("read/write timeout")]
    Timeout,
    #[error("message exceeds maximum size ({0} bytes)")]
    TooLarge(u32),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize `value` as length-prefixed JSON.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::TooLarge(u32::MAX))?;
    let mut buf = Vec::with_capacity(payload.len() + 4);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a length-prefixed JSON payload (without the length prefix).
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read one length-prefixed message from `reader`, applying `timeout`.
pub async fn read_message<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, async {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed)
            }
            Err(e) => return Err(ProtocolError::Io(e)),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(payload)
    })
    .await
    .map_err(|_| ProtocolError::Timeout)?
}

/// Write one length-prefixed message to `writer`, applying `timeout`.
pub async fn write_message<W>(
    writer: &mut W,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    })
    .await
    .map_err(|_| ProtocolError::Timeout)?
}

/// Read and decode a typed message.
pub async fn read_typed<T, R>(reader: &mut R, timeout: Duration) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let payload = read_message(reader, timeout).await?;
    decode(&payload)
}

/// Encode and write a typed message.
pub async fn write_typed<T, W>(writer: &mut W, value: &T, timeout: Duration) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let framed = encode(value)?;
    write_message(writer, &framed, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Sample {
        a: String,
        b: u32,
    }

    #[tokio::test]
    async fn round_trips_through_an_in_memory_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let value = Sample { a: "hello".to_string(), b: 42 };
        write_typed(&mut client, &value, Duration::from_secs(1)).await.unwrap();
        let got: Sample = read_typed(&mut server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, got);
    }

    #[tokio::test]
    async fn closed_connection_yields_connection_closed() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);
        let err = read_message(&mut server, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let huge_len = (MAX_MESSAGE_BYTES + 1).to_be_bytes();
        client.write_all(&huge_len).await.unwrap();
        let err = read_message(&mut server, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge(_)));
    }
}
