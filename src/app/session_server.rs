use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tokio::net::TcpStream;

use crate::app::share_registry::ShareRegistry;
use crate::app::transfer;
use crate::core::models::{DirEntry, FileStat};
use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::envelope::{
    self, ControlMessage, Decoded, FileInfo, ShareInfo,
};
use crate::infrastructure::protocol::frame::{FrameKind, read_frame_timed, write_frame_timed};
use crate::infrastructure::protocol::{
    AUTH_OPEN, AUTH_PSK, CONTROL_TIMEOUT, PROTOCOL_VERSION, auth, code, hashing, sandbox,
};
use crate::infrastructure::runtime::run_blocking;

/// Per-connection session state. The tagged form keeps pre-AUTH requests
/// and double-AUTH from ever reaching an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitHello,
    AwaitAuth,
    Ready,
    Transfer,
    Closed,
}

/// Everything a connection handler needs from the node, cheap to clone per
/// accept.
#[derive(Clone)]
pub struct ServerContext {
    pub device_id: String,
    pub device_name: String,
    pub open_mode: bool,
    pub shared_key: Option<String>,
    pub shares: Arc<ShareRegistry>,
}

impl ServerContext {
    fn auth_modes(&self) -> Vec<String> {
        if self.open_mode {
            vec![AUTH_OPEN.to_string(), AUTH_PSK.to_string()]
        } else {
            vec![AUTH_PSK.to_string()]
        }
    }
}

struct Session {
    peer_device_id: String,
    server_nonce: [u8; auth::NONCE_BYTES],
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &ControlMessage) -> AppResult<()> {
    write_frame_timed(writer, FrameKind::Json, &envelope::encode(message)?, CONTROL_TIMEOUT).await
}

async fn send_raw<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> AppResult<()> {
    write_frame_timed(writer, FrameKind::Json, payload, CONTROL_TIMEOUT).await
}

pub async fn handle_connection(ctx: ServerContext, stream: TcpStream) -> AppResult<()> {
    let peer_addr = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(event = "session_accepted", peer = peer_addr);

    let (mut reader, mut writer) = stream.into_split();
    let mut state = SessionState::AwaitHello;
    let mut session = Session {
        peer_device_id: String::new(),
        server_nonce: [0u8; auth::NONCE_BYTES],
    };

    while state != SessionState::Closed {
        let Some(frame) = read_frame_timed(&mut reader, CONTROL_TIMEOUT).await? else {
            tracing::info!(event = "session_closed_by_peer", peer = peer_addr);
            return Ok(());
        };
        if frame.kind != FrameKind::Json {
            let payload = envelope::failure_payload(
                "UNKNOWN",
                "",
                code::BAD_REQUEST,
                "binary frame outside a transfer",
            )?;
            send_raw(&mut writer, &payload).await?;
            return Ok(());
        }

        let message = match envelope::decode(&frame.payload) {
            Ok(Decoded::Control(message)) => message,
            Ok(Decoded::Unrecognized { msg_type, req_id }) => {
                let payload = envelope::failure_payload(
                    &msg_type,
                    &req_id,
                    code::BAD_REQUEST,
                    "unknown or malformed request",
                )?;
                send_raw(&mut writer, &payload).await?;
                return Ok(());
            }
            Err(error) => {
                let payload = envelope::failure_payload(
                    "UNKNOWN",
                    "",
                    code::BAD_REQUEST,
                    &error.message,
                )?;
                send_raw(&mut writer, &payload).await?;
                return Ok(());
            }
        };

        match (state, message) {
            (
                SessionState::AwaitHello,
                ControlMessage::Hello {
                    req_id,
                    proto,
                    device_id,
                    auth: requested_auth,
                    ..
                },
            ) => {
                if proto != PROTOCOL_VERSION {
                    send(
                        &mut writer,
                        &hello_failure(&req_id, code::UNSUPPORTED_VERSION, "protocol version mismatch"),
                    )
                    .await?;
                    return Ok(());
                }
                if requested_auth != AUTH_OPEN && requested_auth != AUTH_PSK {
                    send(
                        &mut writer,
                        &hello_failure(&req_id, code::BAD_REQUEST, "unsupported auth mode"),
                    )
                    .await?;
                    return Ok(());
                }

                session.server_nonce = auth::generate_nonce();
                session.peer_device_id = device_id;

                // advertised policy is the server's, not an echo of the
                // client's request
                let auth_required = !ctx.open_mode;
                let selected_auth = if ctx.open_mode { AUTH_OPEN } else { AUTH_PSK };
                send(
                    &mut writer,
                    &ControlMessage::HelloAck {
                        req_id,
                        ok: true,
                        error: None,
                        server_id: Some(ctx.device_id.clone()),
                        nonce: Some(auth::encode_base64(&session.server_nonce)),
                        auth: ctx.auth_modes(),
                        auth_required: Some(auth_required),
                        selected_auth: Some(selected_auth.to_string()),
                    },
                )
                .await?;
                state = if ctx.open_mode {
                    SessionState::Ready
                } else {
                    SessionState::AwaitAuth
                };
            }

            (
                SessionState::AwaitAuth,
                ControlMessage::Auth {
                    req_id,
                    client_nonce,
                    mac,
                },
            ) => {
                let Some(shared_key) = ctx.shared_key.as_deref() else {
                    send(
                        &mut writer,
                        &auth_failure(&req_id, code::AUTH_REQUIRED, "server has no key configured"),
                    )
                    .await?;
                    return Ok(());
                };
                let client_nonce = auth::decode_base64(&client_nonce)?;
                let presented = auth::decode_base64(&mac)?;
                let verified = auth::verify_mac(
                    shared_key,
                    &session.server_nonce,
                    &client_nonce,
                    &ctx.device_id,
                    &session.peer_device_id,
                    &presented,
                )?;
                if !verified {
                    tracing::warn!(
                        event = "session_auth_failed",
                        peer_device_id = session.peer_device_id
                    );
                    send(
                        &mut writer,
                        &auth_failure(&req_id, code::AUTH_FAILED, "mac verification failed"),
                    )
                    .await?;
                    return Ok(());
                }
                send(
                    &mut writer,
                    &ControlMessage::AuthOk {
                        req_id,
                        ok: true,
                        error: None,
                    },
                )
                .await?;
                state = SessionState::Ready;
            }

            // an open-mode server tolerates an unnecessary AUTH
            (SessionState::Ready, ControlMessage::Auth { req_id, .. }) => {
                send(
                    &mut writer,
                    &ControlMessage::AuthOk {
                        req_id,
                        ok: true,
                        error: None,
                    },
                )
                .await?;
            }

            (SessionState::Ready, ControlMessage::Ping { req_id }) => {
                send(
                    &mut writer,
                    &ControlMessage::Pong {
                        req_id,
                        ok: true,
                        error: None,
                    },
                )
                .await?;
            }

            (SessionState::Ready, ControlMessage::ListShares { req_id }) => {
                let shares = ctx
                    .shares
                    .list()
                    .into_iter()
                    .map(|share| ShareInfo {
                        share_id: share.share_id,
                        name: share.name,
                        read_only: share.read_only,
                    })
                    .collect();
                send(
                    &mut writer,
                    &ControlMessage::ListSharesResp {
                        req_id,
                        ok: true,
                        error: None,
                        shares,
                    },
                )
                .await?;
            }

            (SessionState::Ready, ControlMessage::ListDir { req_id, share_id, path }) => {
                match op_list_dir(&ctx, &share_id, &path).await {
                    Ok(entries) => {
                        send(
                            &mut writer,
                            &ControlMessage::ListDirResp {
                                req_id,
                                ok: true,
                                error: None,
                                entries,
                            },
                        )
                        .await?;
                    }
                    Err(error) => {
                        send(
                            &mut writer,
                            &ControlMessage::ListDirResp {
                                req_id,
                                ok: false,
                                error: Some(envelope::error_body(&error)),
                                entries: Vec::new(),
                            },
                        )
                        .await?;
                    }
                }
            }

            (SessionState::Ready, ControlMessage::Stat { req_id, share_id, path }) => {
                match op_stat(&ctx, &share_id, &path).await {
                    Ok(stat) => {
                        send(
                            &mut writer,
                            &ControlMessage::StatResp {
                                req_id,
                                ok: true,
                                error: None,
                                stat: Some(stat),
                            },
                        )
                        .await?;
                    }
                    Err(error) => {
                        send(
                            &mut writer,
                            &ControlMessage::StatResp {
                                req_id,
                                ok: false,
                                error: Some(envelope::error_body(&error)),
                                stat: None,
                            },
                        )
                        .await?;
                    }
                }
            }

            (
                SessionState::Ready,
                ControlMessage::HashReq {
                    req_id,
                    share_id,
                    path,
                    offset,
                    length,
                },
            ) => {
                match op_hash(&ctx, &share_id, &path, offset, length).await {
                    Ok(sha256) => {
                        send(
                            &mut writer,
                            &ControlMessage::HashResp {
                                req_id,
                                ok: true,
                                error: None,
                                sha256: Some(sha256),
                            },
                        )
                        .await?;
                    }
                    Err(error) => {
                        send(
                            &mut writer,
                            &ControlMessage::HashResp {
                                req_id,
                                ok: false,
                                error: Some(envelope::error_body(&error)),
                                sha256: None,
                            },
                        )
                        .await?;
                    }
                }
            }

            (
                SessionState::Ready,
                ControlMessage::DownloadReq {
                    req_id,
                    transfer_id,
                    share_id,
                    path,
                    offset,
                },
            ) => {
                state = SessionState::Transfer;
                tracing::debug!(event = "session_state", state = ?state);
                serve_download(&ctx, &mut writer, req_id, transfer_id, share_id, path, offset)
                    .await?;
                state = SessionState::Closed;
            }

            (
                SessionState::Ready,
                ControlMessage::UploadReq {
                    req_id,
                    transfer_id,
                    share_id,
                    path,
                    file,
                },
            ) => {
                state = SessionState::Transfer;
                tracing::debug!(event = "session_state", state = ?state);
                serve_upload(
                    &ctx,
                    &mut reader,
                    &mut writer,
                    req_id,
                    transfer_id,
                    share_id,
                    path,
                    file,
                )
                .await?;
                state = SessionState::Closed;
            }

            (SessionState::AwaitAuth, other) => {
                let payload = envelope::failure_payload(
                    type_name_of(&other),
                    req_id_of(&other),
                    code::AUTH_REQUIRED,
                    "authenticate before issuing requests",
                )?;
                send_raw(&mut writer, &payload).await?;
                return Ok(());
            }

            (_, other) => {
                let payload = envelope::failure_payload(
                    type_name_of(&other),
                    req_id_of(&other),
                    code::BAD_REQUEST,
                    "request not valid in this session state",
                )?;
                send_raw(&mut writer, &payload).await?;
                return Ok(());
            }
        }
    }

    Ok(())
}

fn hello_failure(req_id: &str, error_code: &str, message: &str) -> ControlMessage {
    ControlMessage::HelloAck {
        req_id: req_id.to_string(),
        ok: false,
        error: Some(envelope::ErrorBody {
            code: error_code.to_string(),
            message: message.to_string(),
        }),
        server_id: None,
        nonce: None,
        auth: Vec::new(),
        auth_required: None,
        selected_auth: None,
    }
}

fn auth_failure(req_id: &str, error_code: &str, message: &str) -> ControlMessage {
    ControlMessage::AuthOk {
        req_id: req_id.to_string(),
        ok: false,
        error: Some(envelope::ErrorBody {
            code: error_code.to_string(),
            message: message.to_string(),
        }),
    }
}

fn type_name_of(message: &ControlMessage) -> &'static str {
    match message {
        ControlMessage::Hello { .. } => "HELLO",
        ControlMessage::HelloAck { .. } => "HELLO_ACK",
        ControlMessage::Auth { .. } => "AUTH",
        ControlMessage::AuthOk { .. } => "AUTH_OK",
        ControlMessage::Ping { .. } => "PING",
        ControlMessage::Pong { .. } => "PONG",
        ControlMessage::ListShares { .. } => "LIST_SHARES",
        ControlMessage::ListSharesResp { .. } => "LIST_SHARES_RESP",
        ControlMessage::ListDir { .. } => "LIST_DIR",
        ControlMessage::ListDirResp { .. } => "LIST_DIR_RESP",
        ControlMessage::Stat { .. } => "STAT",
        ControlMessage::StatResp { .. } => "STAT_RESP",
        ControlMessage::HashReq { .. } => "HASH_REQ",
        ControlMessage::HashResp { .. } => "HASH_RESP",
        ControlMessage::DownloadReq { .. } => "DOWNLOAD_REQ",
        ControlMessage::DownloadAck { .. } => "DOWNLOAD_ACK",
        ControlMessage::UploadReq { .. } => "UPLOAD_REQ",
        ControlMessage::UploadAck { .. } => "UPLOAD_ACK",
        ControlMessage::UploadDone { .. } => "UPLOAD_DONE",
        ControlMessage::FileChunk { .. } => "FILE_CHUNK",
        ControlMessage::FileEnd { .. } => "FILE_END",
    }
}

fn req_id_of(message: &ControlMessage) -> &str {
    match message {
        ControlMessage::Hello { req_id, .. }
        | ControlMessage::HelloAck { req_id, .. }
        | ControlMessage::Auth { req_id, .. }
        | ControlMessage::AuthOk { req_id, .. }
        | ControlMessage::Ping { req_id }
        | ControlMessage::Pong { req_id, .. }
        | ControlMessage::ListShares { req_id }
        | ControlMessage::ListSharesResp { req_id, .. }
        | ControlMessage::ListDir { req_id, .. }
        | ControlMessage::ListDirResp { req_id, .. }
        | ControlMessage::Stat { req_id, .. }
        | ControlMessage::StatResp { req_id, .. }
        | ControlMessage::HashReq { req_id, .. }
        | ControlMessage::HashResp { req_id, .. }
        | ControlMessage::DownloadReq { req_id, .. }
        | ControlMessage::DownloadAck { req_id, .. }
        | ControlMessage::UploadReq { req_id, .. }
        | ControlMessage::UploadAck { req_id, .. }
        | ControlMessage::UploadDone { req_id, .. } => req_id,
        ControlMessage::FileChunk { .. } | ControlMessage::FileEnd { .. } => "",
    }
}

fn mtime_iso(mtime: SystemTime) -> String {
    DateTime::<Utc>::from(mtime).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Share lookup + sandbox resolution shared by every filesystem operation.
fn resolve_share_path(ctx: &ServerContext, share_id: &str, path: &str) -> AppResult<PathBuf> {
    let share = ctx
        .shares
        .get(share_id)
        .ok_or_else(|| AppError::new(code::NOT_FOUND, "unknown share"))?;
    sandbox::resolve_under_root(&share.local_path, path)
}

async fn op_list_dir(ctx: &ServerContext, share_id: &str, path: &str) -> AppResult<Vec<DirEntry>> {
    let resolved = resolve_share_path(ctx, share_id, path)?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|error| metadata_error(&resolved, error))?;
    if !metadata.is_dir() {
        return Err(AppError::new(code::NOT_FOUND, "not a directory"));
    }

    let mut read_dir = tokio::fs::read_dir(&resolved).await.map_err(|error| {
        AppError::new(code::IO_ERROR, "directory read failed").with_detail(error.to_string())
    })?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(|error| {
        AppError::new(code::IO_ERROR, "directory read failed").with_detail(error.to_string())
    })? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_dir() {
            entries.push(DirEntry {
                name,
                is_dir: true,
                size: None,
                mtime_utc: None,
            });
        } else {
            entries.push(DirEntry {
                name,
                is_dir: false,
                size: Some(metadata.len()),
                mtime_utc: metadata.modified().ok().map(mtime_iso),
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn op_stat(ctx: &ServerContext, share_id: &str, path: &str) -> AppResult<FileStat> {
    let resolved = resolve_share_path(ctx, share_id, path)?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|error| metadata_error(&resolved, error))?;
    if !metadata.is_file() {
        return Err(AppError::new(code::NOT_FOUND, "not a regular file"));
    }

    let mtime_utc = metadata.modified().ok().map(mtime_iso).unwrap_or_default();
    let hash_path = resolved.clone();
    let (size, sha256) =
        run_blocking("stat_file_hash", move || hashing::file_sha256_hex(&hash_path)).await?;
    Ok(FileStat {
        size,
        mtime_utc,
        sha256,
    })
}

async fn op_hash(
    ctx: &ServerContext,
    share_id: &str,
    path: &str,
    offset: u64,
    length: u64,
) -> AppResult<String> {
    let resolved = resolve_share_path(ctx, share_id, path)?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|error| metadata_error(&resolved, error))?;
    if !metadata.is_file() {
        return Err(AppError::new(code::NOT_FOUND, "not a regular file"));
    }
    if offset.checked_add(length).is_none_or(|end| end > metadata.len()) {
        return Err(AppError::new(code::INVALID_RANGE, "range exceeds file length")
            .with_ctx("size", metadata.len().to_string()));
    }

    let hash_path = resolved.clone();
    run_blocking("range_hash", move || {
        hashing::range_sha256_hex(&hash_path, offset, length)
    })
    .await
}

fn metadata_error(path: &Path, error: std::io::Error) -> AppError {
    if error.kind() == std::io::ErrorKind::NotFound {
        AppError::new(code::NOT_FOUND, "no such path")
    } else {
        AppError::new(code::IO_ERROR, "metadata read failed")
            .with_detail(format!("{}: {error}", path.display()))
    }
}

async fn serve_download<W: AsyncWrite + Unpin>(
    ctx: &ServerContext,
    writer: &mut W,
    req_id: String,
    transfer_id: String,
    share_id: String,
    path: String,
    offset: u64,
) -> AppResult<()> {
    let prepared = async {
        let resolved = resolve_share_path(ctx, &share_id, &path)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|error| metadata_error(&resolved, error))?;
        if !metadata.is_file() {
            return Err(AppError::new(code::NOT_FOUND, "not a regular file"));
        }
        let hash_path = resolved.clone();
        let (size, sha256) =
            run_blocking("download_file_hash", move || hashing::file_sha256_hex(&hash_path))
                .await?;
        Ok((resolved, size, sha256))
    }
    .await;

    let (resolved, full_size, file_sha256) = match prepared {
        Ok(value) => value,
        Err(error) => {
            send(
                writer,
                &ControlMessage::DownloadAck {
                    req_id,
                    ok: false,
                    error: Some(envelope::error_body(&error)),
                    file: None,
                    offset: None,
                },
            )
            .await?;
            return Ok(());
        }
    };

    let clamped_offset = offset.min(full_size);
    send(
        writer,
        &ControlMessage::DownloadAck {
            req_id,
            ok: true,
            error: None,
            file: Some(FileInfo {
                size: full_size,
                sha256: file_sha256,
            }),
            offset: Some(clamped_offset),
        },
    )
    .await?;
    tracing::info!(
        event = "download_started",
        transfer_id,
        size = full_size,
        offset = clamped_offset
    );

    let mut file = transfer::open_source(&resolved).await?;
    let mut hasher = Sha256::new();
    hashing::seed_prefix(&mut file, clamped_offset, &mut hasher).await?;
    let running_sha = transfer::send_file_chunks(
        writer,
        &mut file,
        &transfer_id,
        clamped_offset,
        full_size,
        hasher,
        None,
        |_| {},
    )
    .await?;

    send(
        writer,
        &ControlMessage::FileEnd {
            transfer_id: transfer_id.clone(),
            ok: true,
            error: None,
            file: Some(FileInfo {
                size: full_size,
                sha256: running_sha,
            }),
        },
    )
    .await?;
    tracing::info!(event = "download_complete", transfer_id);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn serve_upload<R, W>(
    ctx: &ServerContext,
    reader: &mut R,
    writer: &mut W,
    req_id: String,
    transfer_id: String,
    share_id: String,
    path: String,
    declared: FileInfo,
) -> AppResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let prepared = async {
        let share = ctx
            .shares
            .get(&share_id)
            .ok_or_else(|| AppError::new(code::NOT_FOUND, "unknown share"))?;
        if share.read_only {
            return Err(AppError::new(code::READ_ONLY, "share is read-only"));
        }
        let resolved = sandbox::resolve_under_root(&share.local_path, &path)?;
        let existing_len = match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => return Err(AppError::new(code::BAD_REQUEST, "destination is not a file")),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => return Err(metadata_error(&resolved, error)),
        };
        Ok((resolved, existing_len))
    }
    .await;

    let (resolved, existing_len) = match prepared {
        Ok(value) => value,
        Err(error) => {
            send(
                writer,
                &ControlMessage::UploadAck {
                    req_id,
                    ok: false,
                    error: Some(envelope::error_body(&error)),
                    offset: None,
                },
            )
            .await?;
            return Ok(());
        }
    };

    // stale tails longer than the declared size restart from scratch
    let resume_offset = if existing_len <= declared.size {
        existing_len
    } else {
        0
    };
    send(
        writer,
        &ControlMessage::UploadAck {
            req_id: req_id.clone(),
            ok: true,
            error: None,
            offset: Some(resume_offset),
        },
    )
    .await?;
    tracing::info!(
        event = "upload_started",
        transfer_id,
        declared_size = declared.size,
        offset = resume_offset
    );

    let mut file = transfer::open_destination(&resolved).await?;
    file.set_len(resume_offset).await.map_err(|error| {
        AppError::new(code::IO_ERROR, "destination truncate failed").with_detail(error.to_string())
    })?;
    let mut hasher = Sha256::new();
    hashing::seed_prefix(&mut file, resume_offset, &mut hasher).await?;
    file.seek(std::io::SeekFrom::Start(resume_offset))
        .await
        .map_err(|error| {
            AppError::new(code::IO_ERROR, "destination seek failed").with_detail(error.to_string())
        })?;

    let end = match transfer::receive_file_chunks(
        reader,
        &mut file,
        resume_offset,
        declared.size,
        hasher,
        None,
        |_| {},
    )
    .await
    {
        Ok(end) => end,
        // transport failures get no response; the peer is gone or stalled
        Err(error) if error.code == code::CONNECTION_CLOSED || error.code == code::TIMEOUT => {
            return Err(error);
        }
        Err(error) => {
            send(
                writer,
                &ControlMessage::UploadDone {
                    req_id,
                    ok: false,
                    error: Some(envelope::error_body(&error)),
                },
            )
            .await?;
            return Ok(());
        }
    };

    let end_sha = end.end_file.as_ref().map(|info| info.sha256.as_str());
    let verified = end.end_ok
        && end.running_sha256 == declared.sha256
        && end_sha == Some(end.running_sha256.as_str());
    if !verified {
        tracing::warn!(
            event = "upload_integrity_failed",
            transfer_id,
            running = end.running_sha256,
            declared = declared.sha256
        );
        send(
            writer,
            &ControlMessage::UploadDone {
                req_id,
                ok: false,
                error: Some(envelope::ErrorBody {
                    code: code::INTEGRITY_FAILED.to_string(),
                    message: "file hash does not match".to_string(),
                }),
            },
        )
        .await?;
        return Ok(());
    }

    send(
        writer,
        &ControlMessage::UploadDone {
            req_id,
            ok: true,
            error: None,
        },
    )
    .await?;
    tracing::info!(event = "upload_complete", transfer_id);
    Ok(())
}
