use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::envelope::{
    self, ControlMessage, Decoded, ErrorBody, FileInfo,
};
use crate::infrastructure::protocol::frame::{
    FrameKind, read_frame_timed, write_frame_timed,
};
use crate::infrastructure::protocol::hashing::hex_encode;
use crate::infrastructure::protocol::{CONTROL_TIMEOUT, code};

/// Bytes per FILE_CHUNK body.
pub const CHUNK_BYTES: usize = 256 * 1024;

/// What the sending side of a FILE_END carried, plus the receiver's own
/// running digest over the full file.
#[derive(Debug)]
pub struct ChunkStreamEnd {
    pub running_sha256: String,
    pub end_ok: bool,
    pub end_error: Option<ErrorBody>,
    pub end_file: Option<FileInfo>,
}

pub async fn open_source(path: &Path) -> AppResult<tokio::fs::File> {
    tokio::fs::File::open(path).await.map_err(|error| {
        AppError::new(code::IO_ERROR, "source open failed")
            .with_detail(format!("{}: {error}", path.display()))
    })
}

/// Open a transfer destination for read+write without truncating, creating
/// it (and its parent directories) when absent. Reading back is what lets
/// resume seed the running hash over the committed prefix.
pub async fn open_destination(path: &Path) -> AppResult<tokio::fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|error| {
            AppError::new(code::IO_ERROR, "destination directory create failed")
                .with_detail(format!("{}: {error}", parent.display()))
        })?;
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(|error| {
            AppError::new(code::IO_ERROR, "destination open failed")
                .with_detail(format!("{}: {error}", path.display()))
        })
}

fn canceled_error() -> AppError {
    AppError::new(code::CANCELED, "transfer canceled")
}

/// Stream `[start_offset, total_size)` of an open file as FILE_CHUNK
/// header + binary frame pairs, folding every sent byte into the running
/// hasher. The caller has already seeded the hasher over
/// `[0, start_offset)` and left the cursor there. Returns the full-file
/// digest; the caller sends FILE_END.
pub async fn send_file_chunks<W: AsyncWrite + Unpin>(
    writer: &mut W,
    file: &mut tokio::fs::File,
    transfer_id: &str,
    start_offset: u64,
    total_size: u64,
    mut hasher: Sha256,
    canceled: Option<&AtomicBool>,
    mut on_progress: impl FnMut(u64),
) -> AppResult<String> {
    let mut offset = start_offset;
    let mut buffer = vec![0u8; CHUNK_BYTES];

    while offset < total_size {
        if let Some(flag) = canceled
            && flag.load(Ordering::Relaxed)
        {
            return Err(canceled_error());
        }

        let want = (total_size - offset).min(CHUNK_BYTES as u64) as usize;
        let read_count = file.read(&mut buffer[..want]).await.map_err(|error| {
            AppError::new(code::IO_ERROR, "chunk read failed").with_detail(error.to_string())
        })?;
        if read_count == 0 {
            return Err(AppError::new(code::IO_ERROR, "file shrank mid-transfer")
                .with_ctx("offset", offset.to_string()));
        }

        hasher.update(&buffer[..read_count]);
        let header = ControlMessage::FileChunk {
            transfer_id: transfer_id.to_string(),
            offset,
            length: read_count as u64,
        };
        write_frame_timed(writer, FrameKind::Json, &envelope::encode(&header)?, CONTROL_TIMEOUT)
            .await?;
        write_frame_timed(writer, FrameKind::Binary, &buffer[..read_count], CONTROL_TIMEOUT)
            .await?;

        offset += read_count as u64;
        on_progress(offset);
    }

    Ok(hex_encode(hasher.finalize().as_slice()))
}

/// Receive FILE_CHUNK pairs until FILE_END, writing at the receiver's own
/// cursor (chunk-header offsets are informational only) and folding every
/// byte into the running hasher. Enforces header/body length agreement and
/// the declared total. Unexpected end-of-stream is a failure, never
/// success.
pub async fn receive_file_chunks<R: AsyncRead + Unpin>(
    reader: &mut R,
    file: &mut tokio::fs::File,
    start_offset: u64,
    declared_total: u64,
    mut hasher: Sha256,
    canceled: Option<&AtomicBool>,
    mut on_progress: impl FnMut(u64),
) -> AppResult<ChunkStreamEnd> {
    let mut written = start_offset;

    loop {
        if let Some(flag) = canceled
            && flag.load(Ordering::Relaxed)
        {
            return Err(canceled_error());
        }

        let Some(frame) = read_frame_timed(reader, CONTROL_TIMEOUT).await? else {
            return Err(AppError::new(
                code::CONNECTION_CLOSED,
                "stream ended before FILE_END",
            ));
        };
        if frame.kind != FrameKind::Json {
            return Err(AppError::new(
                code::BAD_REQUEST,
                "binary frame without a chunk header",
            ));
        }

        match envelope::decode(&frame.payload)? {
            Decoded::Control(ControlMessage::FileChunk { length, .. }) => {
                let Some(body) = read_frame_timed(reader, CONTROL_TIMEOUT).await? else {
                    return Err(AppError::new(
                        code::CONNECTION_CLOSED,
                        "stream ended inside a chunk",
                    ));
                };
                if body.kind != FrameKind::Binary || body.payload.len() as u64 != length {
                    return Err(AppError::new(
                        code::BAD_REQUEST,
                        "chunk body does not match its header",
                    )
                    .with_ctx("headerLength", length.to_string())
                    .with_ctx("bodyLength", body.payload.len().to_string()));
                }
                if written + length > declared_total {
                    return Err(AppError::new(
                        code::BAD_REQUEST,
                        "chunks exceed the declared size",
                    )
                    .with_ctx("declaredTotal", declared_total.to_string()));
                }

                file.write_all(&body.payload).await.map_err(|error| {
                    AppError::new(code::IO_ERROR, "chunk write failed")
                        .with_detail(error.to_string())
                })?;
                hasher.update(&body.payload);
                written += length;
                on_progress(written);
            }
            Decoded::Control(ControlMessage::FileEnd {
                ok, error, file: end_file, ..
            }) => {
                file.flush().await.map_err(|err| {
                    AppError::new(code::IO_ERROR, "destination flush failed")
                        .with_detail(err.to_string())
                })?;
                return Ok(ChunkStreamEnd {
                    running_sha256: hex_encode(hasher.finalize().as_slice()),
                    end_ok: ok,
                    end_error: error,
                    end_file,
                });
            }
            _ => {
                return Err(AppError::new(
                    code::BAD_REQUEST,
                    "unexpected message inside a transfer",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocol::hashing::{seed_prefix, sha256_hex};
    use tokio::io::AsyncSeekExt;
    use uuid::Uuid;

    fn temp_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("netshare-transfer-{label}-{}", Uuid::new_v4()))
    }

    async fn pump_transfer(
        source_bytes: &[u8],
        resume_offset: u64,
    ) -> (String, ChunkStreamEnd, Vec<u8>) {
        let source_path = temp_path("src");
        let dest_path = temp_path("dst");
        std::fs::write(&source_path, source_bytes).expect("write source");
        std::fs::write(&dest_path, &source_bytes[..resume_offset as usize])
            .expect("seed destination prefix");

        let total = source_bytes.len() as u64;
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        let src = source_path.clone();
        let sender = tokio::spawn(async move {
            let mut file = open_source(&src).await.expect("open source");
            let mut hasher = Sha256::new();
            seed_prefix(&mut file, resume_offset, &mut hasher)
                .await
                .expect("seed sender");
            let sent_hex = send_file_chunks(
                &mut server_end,
                &mut file,
                "t-1",
                resume_offset,
                total,
                hasher,
                None,
                |_| {},
            )
            .await
            .expect("send chunks");
            let end = ControlMessage::FileEnd {
                transfer_id: "t-1".to_string(),
                ok: true,
                error: None,
                file: Some(FileInfo {
                    size: total,
                    sha256: sent_hex.clone(),
                }),
            };
            write_frame_timed(
                &mut server_end,
                FrameKind::Json,
                &envelope::encode(&end).expect("encode end"),
                CONTROL_TIMEOUT,
            )
            .await
            .expect("write end");
            sent_hex
        });

        let mut dest = open_destination(&dest_path).await.expect("open dest");
        let mut hasher = Sha256::new();
        seed_prefix(&mut dest, resume_offset, &mut hasher)
            .await
            .expect("seed receiver");
        dest.seek(std::io::SeekFrom::Start(resume_offset))
            .await
            .expect("seek");
        let end = receive_file_chunks(
            &mut client_end,
            &mut dest,
            resume_offset,
            total,
            hasher,
            None,
            |_| {},
        )
        .await
        .expect("receive chunks");

        let sent_hex = sender.await.expect("sender task");
        let received = std::fs::read(&dest_path).expect("read dest");
        let _ = std::fs::remove_file(source_path);
        let _ = std::fs::remove_file(dest_path);
        (sent_hex, end, received)
    }

    #[tokio::test]
    async fn full_transfer_should_produce_identical_bytes_and_hashes() {
        let payload = (0..300_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let (sent_hex, end, received) = pump_transfer(&payload, 0).await;

        assert_eq!(received, payload);
        assert_eq!(sent_hex, sha256_hex(&payload));
        assert_eq!(end.running_sha256, sent_hex);
        assert_eq!(end.end_file.expect("end file").sha256, sent_hex);
        assert!(end.end_ok);
    }

    #[tokio::test]
    async fn resumed_transfer_should_cover_the_prefix_in_the_hash() {
        let payload = b"hello world".to_vec();
        let (sent_hex, end, received) = pump_transfer(&payload, 6).await;

        assert_eq!(received, payload);
        assert_eq!(
            sent_hex,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(end.running_sha256, sent_hex);
    }

    #[tokio::test]
    async fn zero_byte_file_should_transfer_cleanly() {
        let (sent_hex, end, received) = pump_transfer(&[], 0).await;
        assert!(received.is_empty());
        assert_eq!(end.running_sha256, sent_hex);
    }

    #[tokio::test]
    async fn overshoot_should_fail_with_bad_request() {
        let dest_path = temp_path("overshoot");
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        let writer = tokio::spawn(async move {
            let header = ControlMessage::FileChunk {
                transfer_id: "t-2".to_string(),
                offset: 0,
                length: 8,
            };
            write_frame_timed(
                &mut server_end,
                FrameKind::Json,
                &envelope::encode(&header).expect("encode"),
                CONTROL_TIMEOUT,
            )
            .await
            .expect("write header");
            write_frame_timed(
                &mut server_end,
                FrameKind::Binary,
                b"12345678",
                CONTROL_TIMEOUT,
            )
            .await
            .expect("write body");
            server_end
        });

        let mut dest = open_destination(&dest_path).await.expect("open dest");
        let error = receive_file_chunks(
            &mut client_end,
            &mut dest,
            0,
            5,
            Sha256::new(),
            None,
            |_| {},
        )
        .await
        .expect_err("expected overshoot rejection");
        assert_eq!(error.code, code::BAD_REQUEST);

        drop(writer.await.expect("writer task"));
        let _ = std::fs::remove_file(dest_path);
    }

    #[tokio::test]
    async fn header_body_length_mismatch_should_fail() {
        let dest_path = temp_path("mismatch");
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        let writer = tokio::spawn(async move {
            let header = ControlMessage::FileChunk {
                transfer_id: "t-3".to_string(),
                offset: 0,
                length: 4,
            };
            write_frame_timed(
                &mut server_end,
                FrameKind::Json,
                &envelope::encode(&header).expect("encode"),
                CONTROL_TIMEOUT,
            )
            .await
            .expect("write header");
            write_frame_timed(&mut server_end, FrameKind::Binary, b"123", CONTROL_TIMEOUT)
                .await
                .expect("write body");
            server_end
        });

        let mut dest = open_destination(&dest_path).await.expect("open dest");
        let error = receive_file_chunks(
            &mut client_end,
            &mut dest,
            0,
            100,
            Sha256::new(),
            None,
            |_| {},
        )
        .await
        .expect_err("expected mismatch rejection");
        assert_eq!(error.code, code::BAD_REQUEST);

        drop(writer.await.expect("writer task"));
        let _ = std::fs::remove_file(dest_path);
    }

    #[tokio::test]
    async fn early_stream_end_should_be_a_failure() {
        let dest_path = temp_path("early-eof");
        let (mut client_end, server_end) = tokio::io::duplex(1024);
        drop(server_end);

        let mut dest = open_destination(&dest_path).await.expect("open dest");
        let error = receive_file_chunks(
            &mut client_end,
            &mut dest,
            0,
            10,
            Sha256::new(),
            None,
            |_| {},
        )
        .await
        .expect_err("expected eof failure");
        assert_eq!(error.code, code::CONNECTION_CLOSED);
        let _ = std::fs::remove_file(dest_path);
    }
}
