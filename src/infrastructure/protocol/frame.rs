use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::code;

pub const KIND_JSON: u8 = b'J';
pub const KIND_BINARY: u8 = b'B';

/// Payload cap per frame. The length field is a signed 32-bit integer on
/// the wire, so this is also its maximum representable non-negative value
/// minus one.
pub const MAX_FRAME_BYTES: usize = (1 << 30) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Json,
    Binary,
}

impl FrameKind {
    fn wire_byte(self) -> u8 {
        match self {
            Self::Json => KIND_JSON,
            Self::Binary => KIND_BINARY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Write one frame: kind byte, big-endian signed 32-bit length, payload.
/// Flushes so interactive messages are not held in a buffer. Callers must
/// not interleave writers on one stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> AppResult<()> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(AppError::new(code::BAD_REQUEST, "frame payload too large")
            .with_ctx("length", payload.len().to_string()));
    }

    let mut header = [0u8; 5];
    header[0] = kind.wire_byte();
    header[1..5].copy_from_slice(&(payload.len() as i32).to_be_bytes());

    writer.write_all(&header).await.map_err(io_to_error)?;
    writer.write_all(payload).await.map_err(io_to_error)?;
    writer.flush().await.map_err(io_to_error)?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end-of-stream before the kind
/// byte; a stream that ends mid-frame is an error, not a short frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> AppResult<Option<Frame>> {
    let mut kind_byte = [0u8; 1];
    match reader.read_exact(&mut kind_byte).await {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(io_to_error(error)),
    }

    let kind = match kind_byte[0] {
        KIND_JSON => FrameKind::Json,
        KIND_BINARY => FrameKind::Binary,
        other => {
            return Err(AppError::new(code::BAD_REQUEST, "unknown frame kind byte")
                .with_ctx("byte", format!("{other:#04x}")));
        }
    };

    let mut length_bytes = [0u8; 4];
    reader
        .read_exact(&mut length_bytes)
        .await
        .map_err(io_to_error)?;
    let length = i32::from_be_bytes(length_bytes);
    if length < 0 || length as usize > MAX_FRAME_BYTES {
        return Err(AppError::new(code::BAD_REQUEST, "invalid frame length")
            .with_ctx("length", length.to_string()));
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(payload.as_mut_slice())
        .await
        .map_err(io_to_error)?;

    Ok(Some(Frame { kind, payload }))
}

/// Timed variants for the control path and for transfer reads, which
/// inherit the same bound.
pub async fn read_frame_timed<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> AppResult<Option<Frame>> {
    match tokio::time::timeout(timeout, read_frame(reader)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::new(code::TIMEOUT, "read timed out")),
    }
}

pub async fn write_frame_timed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
    timeout: Duration,
) -> AppResult<()> {
    match tokio::time::timeout(timeout, write_frame(writer, kind, payload)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::new(code::TIMEOUT, "write timed out")),
    }
}

fn io_to_error(error: io::Error) -> AppError {
    match error.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => {
            AppError::new(code::CONNECTION_CLOSED, "connection closed")
                .with_detail(error.to_string())
        }
        _ => AppError::new(code::IO_ERROR, "socket i/o failed").with_detail(error.to_string()),
    }
}
