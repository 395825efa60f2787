//! Framed transport: one length-prefixed frame at a time over any byte stream.

use std::io::ErrorKind;
use std::time::Duration;

use p2pdi_core::wire::{self, FrameError, LEN_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest single write issued while sending a frame.
pub const MAX_BUFFER_SIZE: usize = 8192;

const WOULD_BLOCK_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("connection closed while writing")]
    WriteZero,
}

/// Send `body` as one frame: 4-byte big-endian length, then the body, in
/// chunks of at most `MAX_BUFFER_SIZE`. Transient would-block conditions are
/// retried after a short pause.
pub async fn send_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(body)?;
    let mut sent = 0;
    while sent < frame.len() {
        let upto = (frame.len() - sent).min(MAX_BUFFER_SIZE);
        match writer.write(&frame[sent..sent + upto]).await {
            Ok(0) => return Err(TransportError::WriteZero),
            Ok(n) => sent += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                tokio::time::sleep(WOULD_BLOCK_PAUSE).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Receive one frame body. `Ok(None)` means the peer closed the connection
/// (including a short read part way through a frame).
pub async fn recv_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_SIZE];
    if !read_full(reader, &mut prefix).await? {
        return Ok(None);
    }
    let len = wire::frame_length(prefix)?;
    let mut body = vec![0u8; len];
    if !read_full(reader, &mut body).await? {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Fill `buf` completely. Returns false if the stream ended first.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let upto = (buf.len() - filled).min(MAX_BUFFER_SIZE);
        match reader.read(&mut buf[filled..filled + upto]).await {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof) => {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let body = b"Register<fs>P2Pv1<cs>127.0.0.1<fs>65431".to_vec();
        let expected = body.clone();
        let writer = tokio::spawn(async move { send_frame(&mut a, &body).await });
        let got = recv_frame(&mut b).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(got, Some(expected));
    }

    #[tokio::test]
    async fn large_frame_is_chunked() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let body: Vec<u8> = (0..(3 * MAX_BUFFER_SIZE + 17)).map(|i| i as u8).collect();
        let expected = body.clone();
        let writer = tokio::spawn(async move { send_frame(&mut a, &body).await });
        let got = recv_frame(&mut b).await.unwrap().unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn empty_stream_is_closed_not_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(recv_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_body_is_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, b'x', b'y']).await.unwrap();
        drop(a);
        assert!(recv_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            recv_frame(&mut b).await,
            Err(TransportError::Frame(FrameError::TooLarge(_)))
        ));
    }

    #[tokio::test]
    async fn back_to_back_frames() {
        let (mut a, mut b) = tokio::io::duplex(256);
        send_frame(&mut a, b"one").await.unwrap();
        send_frame(&mut a, b"").await.unwrap();
        send_frame(&mut a, b"three").await.unwrap();
        assert_eq!(recv_frame(&mut b).await.unwrap().unwrap(), b"one");
        assert_eq!(recv_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(recv_frame(&mut b).await.unwrap().unwrap(), b"three");
    }
}
