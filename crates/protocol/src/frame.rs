use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Magic bytes opening every frame on the control channel.
pub const MAGIC: &[u8; 5] = b"POPPO";

/// Upper bound on a single frame's JSON payload, guarding against a
/// malformed or hostile length prefix forcing an unbounded allocation.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Write one frame: `[MAGIC][4-byte BE length][UTF-8 JSON payload]`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(ProtocolError::Frame(format!(
            "payload of {} bytes exceeds max frame length {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }

    writer.write_all(MAGIC).await?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, validating the magic header and returning the raw JSON
/// payload bytes. Returns `Err(ProtocolError::Closed)` wrapped as an EOF io
/// error if the peer closed before a full frame arrived.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut magic = [0u8; 5];
    reader.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(ProtocolError::Frame(format!(
            "bad magic header: {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Frame(format!(
            "frame length {len} exceeds max {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, br#"{"type":"auth","token":"t"}"#).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, br#"{"type":"auth","token":"t"}"#);
    }

    #[tokio::test]
    async fn read_rejects_bad_magic() {
        let mut cursor = std::io::Cursor::new(b"WRONG\x00\x00\x00\x00".to_vec());
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Frame(_))));
    }

    #[tokio::test]
    async fn two_frames_concatenated_in_one_write_are_read_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, br#"{"type":"auth","token":"t"}"#).await.unwrap();
        write_frame(&mut buf, br#"{"type":"command","command":"daemon.status"}"#)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first = read_frame(&mut cursor).await.unwrap();
        let second = read_frame(&mut cursor).await.unwrap();

        assert_eq!(first, br#"{"type":"auth","token":"t"}"#);
        assert_eq!(second, br#"{"type":"command","command":"daemon.status"}"#);

        // No residual bytes remain.
        let mut trailing = [0u8; 1];
        let eof = cursor.read(&mut trailing).await.unwrap();
        assert_eq!(eof, 0);
    }
}
