use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncSeekExt;
use tokio::net::TcpStream;

use crate::app::transfer;
use crate::core::models::{DirEntry, FileStat};
use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::envelope::{
    self, ControlMessage, Decoded, ErrorBody, FileInfo, ShareInfo,
};
use crate::infrastructure::protocol::frame::{FrameKind, read_frame_timed, write_frame_timed};
use crate::infrastructure::protocol::{
    AUTH_OPEN, AUTH_PSK, CONTROL_TIMEOUT, PROTOCOL_VERSION, auth, code, hashing,
};
use crate::infrastructure::runtime::run_blocking;

const CONNECT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub device_id: String,
    pub device_name: String,
    pub shared_key: Option<String>,
}

/// One TCP session against a peer: handshake, catalog requests, transfers.
/// Strictly request/response; a transfer consumes the connection.
#[derive(Debug)]
pub struct SessionClient {
    stream: TcpStream,
    identity: ClientIdentity,
    server_id: String,
    server_nonce: Vec<u8>,
    auth_required: bool,
    selected_auth: String,
    req_counter: u64,
}

fn server_error(body: Option<ErrorBody>) -> AppError {
    match body {
        Some(body) => AppError::new(body.code, body.message),
        None => AppError::new(code::INTERNAL_ERROR, "peer reported failure without detail"),
    }
}

impl SessionClient {
    /// Connect with short backoff, then run the handshake (and AUTH when
    /// the server's advertised policy calls for it).
    pub async fn connect(addr: &str, identity: ClientIdentity) -> AppResult<Self> {
        let stream = connect_with_backoff(addr).await?;
        let mut client = Self {
            stream,
            identity,
            server_id: String::new(),
            server_nonce: Vec::new(),
            auth_required: false,
            selected_auth: AUTH_OPEN.to_string(),
            req_counter: 0,
        };
        client.handshake().await?;
        Ok(client)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn next_req_id(&mut self) -> String {
        self.req_counter += 1;
        format!("r{}", self.req_counter)
    }

    async fn send(&mut self, message: &ControlMessage) -> AppResult<()> {
        write_frame_timed(
            &mut self.stream,
            FrameKind::Json,
            &envelope::encode(message)?,
            CONTROL_TIMEOUT,
        )
        .await
    }

    async fn read_response(&mut self) -> AppResult<ControlMessage> {
        let Some(frame) = read_frame_timed(&mut self.stream, CONTROL_TIMEOUT).await? else {
            return Err(AppError::new(
                code::CONNECTION_CLOSED,
                "peer closed before responding",
            ));
        };
        if frame.kind != FrameKind::Json {
            return Err(AppError::new(code::BAD_REQUEST, "binary frame instead of a response"));
        }
        match envelope::decode(&frame.payload)? {
            Decoded::Control(message) => Ok(message),
            Decoded::Unrecognized { msg_type, .. } => {
                Err(AppError::new(code::BAD_REQUEST, "unrecognized response")
                    .with_ctx("type", msg_type))
            }
        }
    }

    fn check_req_id(&self, sent: &str, received: &str) -> AppResult<()> {
        if sent == received {
            Ok(())
        } else {
            Err(AppError::new(code::BAD_REQUEST, "response reqId mismatch")
                .with_ctx("sent", sent.to_string())
                .with_ctx("received", received.to_string()))
        }
    }

    async fn handshake(&mut self) -> AppResult<()> {
        let requested = if self.identity.shared_key.is_some() {
            AUTH_PSK
        } else {
            AUTH_OPEN
        };
        let req_id = self.next_req_id();
        self.send(&ControlMessage::Hello {
            req_id: req_id.clone(),
            proto: PROTOCOL_VERSION.to_string(),
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            auth: requested.to_string(),
        })
        .await?;

        match self.read_response().await? {
            ControlMessage::HelloAck {
                req_id: resp_id,
                ok,
                error,
                server_id,
                nonce,
                auth_required,
                selected_auth,
                ..
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                self.server_id = server_id.unwrap_or_default();
                self.server_nonce = auth::decode_base64(nonce.as_deref().unwrap_or_default())?;
                self.auth_required = auth_required.unwrap_or(false);
                self.selected_auth = selected_auth.unwrap_or_else(|| AUTH_OPEN.to_string());
            }
            other => {
                return Err(AppError::new(code::BAD_REQUEST, "expected HELLO_ACK")
                    .with_ctx("got", format!("{other:?}")));
            }
        }

        // the server's advertised policy wins over local configuration
        if self.auth_required || self.selected_auth == AUTH_PSK {
            self.authenticate().await?;
        }
        Ok(())
    }

    async fn authenticate(&mut self) -> AppResult<()> {
        let Some(shared_key) = self.identity.shared_key.clone() else {
            return Err(AppError::new(
                code::AUTH_REQUIRED,
                "server requires a shared key but none is configured",
            ));
        };

        let client_nonce = auth::generate_nonce();
        let mac = auth::compute_mac(
            &shared_key,
            &self.server_nonce,
            &client_nonce,
            &self.server_id,
            &self.identity.device_id,
        )?;

        let req_id = self.next_req_id();
        self.send(&ControlMessage::Auth {
            req_id: req_id.clone(),
            client_nonce: auth::encode_base64(&client_nonce),
            mac: auth::encode_base64(&mac),
        })
        .await?;

        match self.read_response().await? {
            ControlMessage::AuthOk {
                req_id: resp_id,
                ok,
                error,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                Ok(())
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected AUTH_OK")
                .with_ctx("got", format!("{other:?}"))),
        }
    }

    pub async fn ping(&mut self) -> AppResult<()> {
        let req_id = self.next_req_id();
        self.send(&ControlMessage::Ping {
            req_id: req_id.clone(),
        })
        .await?;
        match self.read_response().await? {
            ControlMessage::Pong {
                req_id: resp_id,
                ok,
                error,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                Ok(())
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected PONG")
                .with_ctx("got", format!("{other:?}"))),
        }
    }

    pub async fn list_shares(&mut self) -> AppResult<Vec<ShareInfo>> {
        let req_id = self.next_req_id();
        self.send(&ControlMessage::ListShares {
            req_id: req_id.clone(),
        })
        .await?;
        match self.read_response().await? {
            ControlMessage::ListSharesResp {
                req_id: resp_id,
                ok,
                error,
                shares,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                Ok(shares)
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected LIST_SHARES_RESP")
                .with_ctx("got", format!("{other:?}"))),
        }
    }

    pub async fn list_dir(&mut self, share_id: &str, path: &str) -> AppResult<Vec<DirEntry>> {
        let req_id = self.next_req_id();
        self.send(&ControlMessage::ListDir {
            req_id: req_id.clone(),
            share_id: share_id.to_string(),
            path: path.to_string(),
        })
        .await?;
        match self.read_response().await? {
            ControlMessage::ListDirResp {
                req_id: resp_id,
                ok,
                error,
                entries,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                Ok(entries)
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected LIST_DIR_RESP")
                .with_ctx("got", format!("{other:?}"))),
        }
    }

    pub async fn stat(&mut self, share_id: &str, path: &str) -> AppResult<FileStat> {
        let req_id = self.next_req_id();
        self.send(&ControlMessage::Stat {
            req_id: req_id.clone(),
            share_id: share_id.to_string(),
            path: path.to_string(),
        })
        .await?;
        match self.read_response().await? {
            ControlMessage::StatResp {
                req_id: resp_id,
                ok,
                error,
                stat,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                stat.ok_or_else(|| AppError::new(code::BAD_REQUEST, "STAT_RESP without stat body"))
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected STAT_RESP")
                .with_ctx("got", format!("{other:?}"))),
        }
    }

    /// Range hash. Peers that predate HASH_REQ answer BAD_REQUEST; that
    /// error is surfaced unchanged so callers can fall back to STAT.
    pub async fn hash_range(
        &mut self,
        share_id: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> AppResult<String> {
        let req_id = self.next_req_id();
        self.send(&ControlMessage::HashReq {
            req_id: req_id.clone(),
            share_id: share_id.to_string(),
            path: path.to_string(),
            offset,
            length,
        })
        .await?;
        match self.read_response().await? {
            ControlMessage::HashResp {
                req_id: resp_id,
                ok,
                error,
                sha256,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                sha256.ok_or_else(|| {
                    AppError::new(code::BAD_REQUEST, "HASH_RESP without a digest")
                })
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected HASH_RESP")
                .with_ctx("got", format!("{other:?}"))),
        }
    }

    /// Download into `local_path`, resuming from whatever prefix is
    /// already on disk. Verifies the running hash against both the ACK and
    /// FILE_END digests before reporting success.
    pub async fn download(
        mut self,
        share_id: &str,
        remote_path: &str,
        local_path: &Path,
        transfer_id: &str,
        canceled: Option<&AtomicBool>,
        mut on_progress: impl FnMut(u64, u64),
    ) -> AppResult<u64> {
        let existing_len = match tokio::fs::metadata(local_path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => 0,
        };

        let req_id = self.next_req_id();
        self.send(&ControlMessage::DownloadReq {
            req_id: req_id.clone(),
            transfer_id: transfer_id.to_string(),
            share_id: share_id.to_string(),
            path: remote_path.to_string(),
            offset: existing_len,
        })
        .await?;

        let (file_info, clamped_offset) = match self.read_response().await? {
            ControlMessage::DownloadAck {
                req_id: resp_id,
                ok,
                error,
                file,
                offset,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                let file = file.ok_or_else(|| {
                    AppError::new(code::BAD_REQUEST, "DOWNLOAD_ACK without file info")
                })?;
                (file, offset.unwrap_or(0))
            }
            other => {
                return Err(AppError::new(code::BAD_REQUEST, "expected DOWNLOAD_ACK")
                    .with_ctx("got", format!("{other:?}")));
            }
        };

        let mut file = transfer::open_destination(local_path).await?;
        // drop any stale tail from an earlier attempt before writing
        file.set_len(clamped_offset).await.map_err(|error| {
            AppError::new(code::IO_ERROR, "local truncate failed").with_detail(error.to_string())
        })?;
        let mut hasher = Sha256::new();
        hashing::seed_prefix(&mut file, clamped_offset, &mut hasher).await?;
        file.seek(std::io::SeekFrom::Start(clamped_offset))
            .await
            .map_err(|error| {
                AppError::new(code::IO_ERROR, "local seek failed").with_detail(error.to_string())
            })?;

        let total = file_info.size;
        let end = transfer::receive_file_chunks(
            &mut self.stream,
            &mut file,
            clamped_offset,
            total,
            hasher,
            canceled,
            |done| on_progress(done, total),
        )
        .await?;

        if !end.end_ok {
            return Err(server_error(end.end_error));
        }
        let end_sha = end.end_file.as_ref().map(|info| info.sha256.as_str());
        if end.running_sha256 != file_info.sha256
            || end_sha != Some(end.running_sha256.as_str())
        {
            return Err(AppError::new(code::INTEGRITY_FAILED, "download hash mismatch")
                .with_ctx("running", end.running_sha256.clone())
                .with_ctx("ack", file_info.sha256));
        }
        Ok(total)
    }

    /// Upload `local_path` into a share, resuming from the server's
    /// reported offset.
    pub async fn upload(
        mut self,
        share_id: &str,
        remote_path: &str,
        local_path: &Path,
        transfer_id: &str,
        canceled: Option<&AtomicBool>,
        mut on_progress: impl FnMut(u64, u64),
    ) -> AppResult<u64> {
        let hash_path = local_path.to_path_buf();
        let (size, local_sha256) =
            run_blocking("upload_local_hash", move || hashing::file_sha256_hex(&hash_path))
                .await?;

        let req_id = self.next_req_id();
        self.send(&ControlMessage::UploadReq {
            req_id: req_id.clone(),
            transfer_id: transfer_id.to_string(),
            share_id: share_id.to_string(),
            path: remote_path.to_string(),
            file: FileInfo {
                size,
                sha256: local_sha256.clone(),
            },
        })
        .await?;

        let resume_offset = match self.read_response().await? {
            ControlMessage::UploadAck {
                req_id: resp_id,
                ok,
                error,
                offset,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                offset.unwrap_or(0)
            }
            other => {
                return Err(AppError::new(code::BAD_REQUEST, "expected UPLOAD_ACK")
                    .with_ctx("got", format!("{other:?}")));
            }
        };

        let mut file = transfer::open_source(local_path).await?;
        let mut hasher = Sha256::new();
        hashing::seed_prefix(&mut file, resume_offset, &mut hasher).await?;
        let running_sha = transfer::send_file_chunks(
            &mut self.stream,
            &mut file,
            transfer_id,
            resume_offset,
            size,
            hasher,
            canceled,
            |done| on_progress(done, size),
        )
        .await?;

        self.send(&ControlMessage::FileEnd {
            transfer_id: transfer_id.to_string(),
            ok: true,
            error: None,
            file: Some(FileInfo {
                size,
                sha256: running_sha,
            }),
        })
        .await?;

        match self.read_response().await? {
            ControlMessage::UploadDone {
                req_id: resp_id,
                ok,
                error,
            } => {
                self.check_req_id(&req_id, &resp_id)?;
                if !ok {
                    return Err(server_error(error));
                }
                Ok(size)
            }
            other => Err(AppError::new(code::BAD_REQUEST, "expected UPLOAD_DONE")
                .with_ctx("got", format!("{other:?}"))),
        }
    }
}

async fn connect_with_backoff(addr: &str) -> AppResult<TcpStream> {
    let mut last_error = None;
    for (attempt, delay) in std::iter::once(Duration::ZERO)
        .chain(CONNECT_BACKOFF)
        .enumerate()
    {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                tracing::debug!(
                    event = "peer_connect_retry",
                    addr,
                    attempt,
                    error = error.to_string()
                );
                last_error = Some(error);
            }
        }
    }
    Err(AppError::new(code::IO_ERROR, "peer connect failed")
        .with_ctx("addr", addr.to_string())
        .with_detail(
            last_error
                .map(|error| error.to_string())
                .unwrap_or_default(),
        ))
}
