//! Stream framing.
//!
//! Frame layout, one packet envelope per frame:
//!
//! ```text
//! offset size  field
//! 0      8     frame_id        u64 little-endian, sender-assigned
//! 8      4     payload_length  i32 little-endian, 0 < len <= 5_000_000
//! 12     len   payload         serialized packet envelope
//! ```
//!
//! `frame_id` increases monotonically on each sender; receivers do not
//! require strict monotonicity. The payload bound exists so a hostile peer
//! cannot make the receiver allocate arbitrary amounts of memory.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TransportError, TransportResult};

/// Bytes of frame header preceding the payload.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Upper bound on a frame payload.
pub const MAX_PAYLOAD_SIZE: i32 = 5_000_000;

/// Write one frame.
///
/// The header and payload are assembled into a single buffer and written
/// with one `write_all`, so a frame's bytes are contiguous as long as the
/// caller serializes writers (the connection's send mutex does).
///
/// # Errors
///
/// [`TransportError::InvalidDataLength`] when the payload is empty or over
/// [`MAX_PAYLOAD_SIZE`]; I/O errors from the underlying stream otherwise.
pub async fn write_frame<W>(writer: &mut W, frame_id: u64, payload: &[u8]) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let length = i32::try_from(payload.len()).unwrap_or(i32::MAX);
    if length <= 0 || length > MAX_PAYLOAD_SIZE {
        return Err(TransportError::InvalidDataLength { length });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&frame_id.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a frame
/// boundary. EOF in the middle of a frame is [`TransportError::Disconnected`];
/// an out-of-bounds declared length is [`TransportError::InvalidDataLength`]
/// and must terminate the connection.
pub async fn read_frame<R>(reader: &mut R) -> TransportResult<Option<(u64, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut id_buf = [0u8; 8];
    if !read_or_clean_eof(reader, &mut id_buf).await? {
        return Ok(None);
    }
    let frame_id = u64::from_le_bytes(id_buf);

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(eof_is_disconnect)?;
    let length = i32::from_le_bytes(len_buf);
    if length <= 0 || length > MAX_PAYLOAD_SIZE {
        return Err(TransportError::InvalidDataLength { length });
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_is_disconnect)?;

    Ok(Some((frame_id, payload)))
}

/// Fill `buf` completely, looping over short reads.
///
/// `Ok(false)` means the stream ended before the first byte, i.e. the
/// peer closed cleanly between frames. EOF after the field started is a
/// mid-frame truncation and reported as [`TransportError::Disconnected`].
async fn read_or_clean_eof<R>(reader: &mut R, buf: &mut [u8]) -> TransportResult<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(TransportError::Disconnected);
        }
        filled += n;
    }
    Ok(true)
}

fn eof_is_disconnect(error: std::io::Error) -> TransportError {
    if error.kind() == ErrorKind::UnexpectedEof {
        TransportError::Disconnected
    } else {
        TransportError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut tx, mut rx) = duplex(4096);
        write_frame(&mut tx, 7, b"payload").await.expect("write");

        let (frame_id, payload) = read_frame(&mut rx)
            .await
            .expect("read")
            .expect("one frame present");
        assert_eq!(frame_id, 7);
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn several_frames_in_sequence() {
        let (mut tx, mut rx) = duplex(4096);
        for id in 1..=3u64 {
            write_frame(&mut tx, id, &[id as u8; 4]).await.expect("write");
        }
        drop(tx);

        for id in 1..=3u64 {
            let (frame_id, payload) = read_frame(&mut rx).await.expect("read").expect("frame");
            assert_eq!(frame_id, id);
            assert_eq!(payload, vec![id as u8; 4]);
        }
        assert!(read_frame(&mut rx).await.expect("clean eof").is_none());
    }

    #[tokio::test]
    async fn minimum_payload_is_accepted() {
        let (mut tx, mut rx) = duplex(64);
        write_frame(&mut tx, 1, &[0xAB]).await.expect("write");
        let (_, payload) = read_frame(&mut rx).await.expect("read").expect("frame");
        assert_eq!(payload, vec![0xAB]);
    }

    #[tokio::test]
    async fn maximum_payload_is_accepted() {
        let payload = vec![0x5A; MAX_PAYLOAD_SIZE as usize];
        let (mut tx, mut rx) = duplex(1 << 20);

        let writer = tokio::spawn(async move {
            write_frame(&mut tx, 2, &payload).await.expect("write");
        });
        let (frame_id, received) = read_frame(&mut rx).await.expect("read").expect("frame");
        writer.await.expect("writer task");

        assert_eq!(frame_id, 2);
        assert_eq!(received.len(), MAX_PAYLOAD_SIZE as usize);
    }

    #[tokio::test]
    async fn zero_length_is_rejected() {
        let (mut tx, mut rx) = duplex(64);
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.extend_from_slice(&0i32.to_le_bytes());
        tx.write_all(&raw).await.expect("raw write");

        let err = read_frame(&mut rx).await.expect_err("zero length");
        assert!(matches!(err, TransportError::InvalidDataLength { length: 0 }));
    }

    #[tokio::test]
    async fn oversize_length_is_rejected() {
        let (mut tx, mut rx) = duplex(64);
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());
        tx.write_all(&raw).await.expect("raw write");

        let err = read_frame(&mut rx).await.expect_err("oversize length");
        assert!(matches!(
            err,
            TransportError::InvalidDataLength { length } if length == MAX_PAYLOAD_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn negative_length_is_rejected() {
        let (mut tx, mut rx) = duplex(64);
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.extend_from_slice(&(-1i32).to_le_bytes());
        tx.write_all(&raw).await.expect("raw write");

        let err = read_frame(&mut rx).await.expect_err("negative length");
        assert!(matches!(err, TransportError::InvalidDataLength { length: -1 }));
    }

    #[tokio::test]
    async fn oversize_outbound_payload_is_rejected() {
        let (mut tx, _rx) = duplex(64);
        let payload = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
        let err = write_frame(&mut tx, 1, &payload)
            .await
            .expect_err("oversize payload");
        assert!(matches!(err, TransportError::InvalidDataLength { .. }));
    }

    #[tokio::test]
    async fn eof_mid_header_is_disconnect() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&[1, 2, 3]).await.expect("partial write");
        drop(tx);

        let err = read_frame(&mut rx).await.expect_err("partial header");
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test]
    async fn eof_mid_payload_is_disconnect() {
        let (mut tx, mut rx) = duplex(64);
        let mut raw = Vec::new();
        raw.extend_from_slice(&9u64.to_le_bytes());
        raw.extend_from_slice(&100i32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 10]);
        tx.write_all(&raw).await.expect("partial write");
        drop(tx);

        let err = read_frame(&mut rx).await.expect_err("partial payload");
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_is_none() {
        let (tx, mut rx) = duplex(64);
        drop(tx);
        assert!(read_frame(&mut rx).await.expect("clean eof").is_none());
    }
}
