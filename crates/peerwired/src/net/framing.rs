//! TCP framing — identity preamble, then length-prefixed frames.
//!
//! Each side first writes its 32-byte node id. After that every packet is a
//! [`FrameHeader`] followed by `length` payload bytes.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use zerocopy::{AsBytes, FromBytes};

use peerwire_core::wire::{FrameHeader, NodeId, Packet, WireError};

const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("identity exchange timed out")]
    Timeout,
}

/// Write our node id and read the peer's.
pub async fn exchange_identity<R, W>(
    reader: &mut R,
    writer: &mut W,
    local_id: &NodeId,
    timeout: Duration,
) -> Result<NodeId, FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(local_id).await?;
    writer.flush().await?;

    let mut remote_id = [0u8; 32];
    tokio::time::timeout(timeout, reader.read_exact(&mut remote_id))
        .await
        .map_err(|_| FrameError::Timeout)??;
    Ok(remote_id)
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Packet>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::read_from(&header_buf[..]).ok_or(WireError::Malformed {
        code: 0,
        reason: "short frame header".into(),
    })?;
    header.validate()?;

    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Packet::new(header.code, Bytes::from(payload))))
}

pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader::new(packet.code, packet.data.len())?;
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&packet.data).await?;
    Ok(())
}

/// Pump frames from the socket into the session's inbound queue.
///
/// Returns when the stream ends, a frame is invalid, or the session is gone.
/// Dropping `inbound` is what tells the driver the transport closed.
pub async fn read_loop<R>(mut reader: R, inbound: mpsc::Sender<Packet>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(packet)) => {
                if inbound.send(packet).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "frame read failed");
                return;
            }
        }
    }
}

/// Drain the outbound queue onto the socket, then shut the write side.
pub async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Packet>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &packet).await {
            tracing::debug!(error = %e, "frame write failed");
            return;
        }
        if outbound.is_empty() {
            if let Err(e) = writer.flush().await {
                tracing::debug!(error = %e, "flush failed");
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ar, aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);

        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        tokio::spawn(write_loop(aw, out_rx));
        tokio::spawn(read_loop(br, in_tx));

        out_tx.send(Packet::new(0x10, &b"status"[..])).await.unwrap();
        out_tx.send(Packet::new(0x02, Bytes::new())).await.unwrap();
        drop(out_tx);

        let first = in_rx.recv().await.unwrap();
        assert_eq!(first.code, 0x10);
        assert_eq!(&first.data[..], b"status");
        assert_eq!(in_rx.recv().await.unwrap().code, 0x02);
        assert!(in_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_frame_version_ends_the_stream() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut header = FrameHeader::new(0x00, 0).unwrap();
        header.version = 9;
        a.write_all(header.as_bytes()).await.unwrap();

        let (in_tx, mut in_rx) = mpsc::channel(8);
        tokio::spawn(read_loop(b, in_tx));
        assert!(in_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn identities_are_swapped() {
        let (a, b) = tokio::io::duplex(64);
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let timeout = Duration::from_secs(1);
        let (ra, rb) = tokio::join!(
            exchange_identity(&mut ar, &mut aw, &[1; 32], timeout),
            exchange_identity(&mut br, &mut bw, &[2; 32], timeout),
        );
        assert_eq!(ra.unwrap(), [2; 32]);
        assert_eq!(rb.unwrap(), [1; 32]);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (a, _b) = tokio::io::duplex(64);
        let (mut ar, mut aw) = tokio::io::split(a);
        let err = exchange_identity(&mut ar, &mut aw, &[1; 32], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout));
    }
}
