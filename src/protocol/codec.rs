//! Frame codec for the wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   payload              │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind byte) + sizeof(payload), NOT including the 4-byte prefix.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame from the stream.
///
/// Returns `(kind, payload)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the accepted frame length.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Bytes)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Frame too short: missing kind byte",
        ));
    }

    let mut frame = BytesMut::zeroed(frame_len as usize);
    reader.read_exact(&mut frame).await?;

    let mut frame = frame.freeze();
    let kind = frame[0];
    let payload = frame.split_off(1);

    Ok(Some((kind, payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "payload exceeds u32 length")
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_from_mock_stream() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 3])
            .read(&[0x1C, 0xAA, 0xBB])
            .build();

        let (kind, payload) = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(kind, 0x1C);
        assert_eq!(&payload[..], &[0xAA, 0xBB]);
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_frame_layout() {
        let mut writer = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 3])
            .write(&[0x02])
            .write(&[0x10, 0x20])
            .build();
        write_frame(&mut writer, 0x02, &[0x10, 0x20]).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut reader = tokio_test::io::Builder::new().read(&[0, 0, 4, 0]).build();
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let mut reader = tokio_test::io::Builder::new().read(&[0, 0, 0, 0]).build();
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error_not_eof() {
        let mut reader = tokio_test::io::Builder::new().read(&[0, 0, 0, 5, 1, 2]).build();
        assert!(read_frame(&mut reader, 16).await.is_err());
    }
}
