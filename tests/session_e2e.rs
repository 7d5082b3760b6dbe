use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use netshare::app::session_client::{ClientIdentity, SessionClient};
use netshare::app::session_server::{ServerContext, handle_connection};
use netshare::app::share_registry::ShareRegistry;
use netshare::infrastructure::protocol::frame::{FrameKind, read_frame, write_frame};
use uuid::Uuid;

const HELLO_WORLD_SHA256: &str =
    "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

struct Fixture {
    addr: SocketAddr,
    base: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

impl Fixture {
    fn read_root(&self) -> PathBuf {
        self.base.join("read")
    }

    fn write_root(&self) -> PathBuf {
        self.base.join("write")
    }

    fn local_dir(&self) -> PathBuf {
        self.base.join("local")
    }
}

async fn start_server(open_mode: bool, shared_key: Option<&str>) -> Fixture {
    let base = std::env::temp_dir().join(format!("netshare-e2e-{}", Uuid::new_v4()));
    let read_root = base.join("read");
    let write_root = base.join("write");
    let local_dir = base.join("local");
    std::fs::create_dir_all(&read_root).expect("create read root");
    std::fs::create_dir_all(&write_root).expect("create write root");
    std::fs::create_dir_all(&local_dir).expect("create local dir");
    std::fs::write(read_root.join("hello.txt"), b"hello world").expect("write hello.txt");

    let shares = ShareRegistry::new();
    shares
        .add(&read_root, true, Some("docs".to_string()), None)
        .expect("register read share");
    shares
        .add(&write_root, false, Some("inbox".to_string()), None)
        .expect("register write share");

    let ctx = ServerContext {
        device_id: "S".to_string(),
        device_name: "server".to_string(),
        open_mode,
        shared_key: shared_key.map(str::to_string),
        shares: Arc::new(shares),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = handle_connection(ctx, stream).await;
            });
        }
    });

    Fixture { addr, base }
}

fn open_client_identity() -> ClientIdentity {
    ClientIdentity {
        device_id: "C".to_string(),
        device_name: "cli".to_string(),
        shared_key: None,
    }
}

fn psk_client_identity(key: &str) -> ClientIdentity {
    ClientIdentity {
        device_id: "C".to_string(),
        device_name: "cli".to_string(),
        shared_key: Some(key.to_string()),
    }
}

#[tokio::test]
async fn open_mode_hello_then_list_shares() {
    let fixture = start_server(true, None).await;
    let mut client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    assert_eq!(client.server_id(), "S");

    let shares = client.list_shares().await.expect("list shares");
    assert_eq!(shares.len(), 2);
    let docs = shares
        .iter()
        .find(|share| share.share_id == "docs")
        .expect("docs share");
    assert!(docs.read_only);
}

#[tokio::test]
async fn psk_handshake_should_succeed_with_the_right_key() {
    let fixture = start_server(false, Some("secret")).await;
    let mut client =
        SessionClient::connect(&fixture.addr.to_string(), psk_client_identity("secret"))
            .await
            .expect("authenticated handshake");
    client.ping().await.expect("ping after auth");
}

#[tokio::test]
async fn psk_handshake_should_fail_with_the_wrong_key() {
    let fixture = start_server(false, Some("secret")).await;
    let error = SessionClient::connect(&fixture.addr.to_string(), psk_client_identity("wrong"))
        .await
        .expect_err("expected auth failure");
    assert_eq!(error.code, "AUTH_FAILED");
}

#[tokio::test]
async fn keyless_client_should_refuse_to_auth_against_a_psk_server() {
    let fixture = start_server(false, Some("secret")).await;
    let error = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect_err("expected local refusal");
    assert_eq!(error.code, "AUTH_REQUIRED");
}

#[tokio::test]
async fn stat_should_report_size_and_hash() {
    let fixture = start_server(true, None).await;
    let mut client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");

    let stat = client.stat("docs", "hello.txt").await.expect("stat");
    assert_eq!(stat.size, 11);
    assert_eq!(stat.sha256, HELLO_WORLD_SHA256);
}

#[tokio::test]
async fn list_dir_should_enumerate_children() {
    let fixture = start_server(true, None).await;
    std::fs::create_dir_all(fixture.read_root().join("sub")).expect("mkdir sub");
    let mut client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");

    let entries = client.list_dir("docs", "").await.expect("list dir");
    assert_eq!(entries.len(), 2);
    let file = entries
        .iter()
        .find(|entry| entry.name == "hello.txt")
        .expect("hello.txt entry");
    assert!(!file.is_dir);
    assert_eq!(file.size, Some(11));
    assert!(file.mtime_utc.is_some());
    let dir = entries
        .iter()
        .find(|entry| entry.name == "sub")
        .expect("sub entry");
    assert!(dir.is_dir);
    assert_eq!(dir.size, None);
}

#[tokio::test]
async fn full_download_should_verify_and_match() {
    let fixture = start_server(true, None).await;
    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");

    let local = fixture.local_dir().join("hello.txt");
    let total = client
        .download("docs", "hello.txt", &local, "t-full", None, |_, _| {})
        .await
        .expect("download");
    assert_eq!(total, 11);
    assert_eq!(std::fs::read(&local).expect("read local"), b"hello world");
}

#[tokio::test]
async fn resumed_download_should_complete_the_tail() {
    let fixture = start_server(true, None).await;
    let local = fixture.local_dir().join("hello.txt");
    std::fs::write(&local, b"hello ").expect("seed prefix");

    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    let mut max_done = 0u64;
    let total = client
        .download("docs", "hello.txt", &local, "t-resume", None, |done, _| {
            max_done = max_done.max(done);
        })
        .await
        .expect("resumed download");

    assert_eq!(total, 11);
    assert_eq!(max_done, 11);
    assert_eq!(std::fs::read(&local).expect("read local"), b"hello world");
}

#[tokio::test]
async fn stale_local_tail_should_be_truncated_and_redone() {
    let fixture = start_server(true, None).await;
    let local = fixture.local_dir().join("hello.txt");
    // longer than the remote file: the client must truncate to the
    // server's clamped offset before writing
    std::fs::write(&local, b"hello world plus stale junk").expect("seed stale");

    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    client
        .download("docs", "hello.txt", &local, "t-stale", None, |_, _| {})
        .await
        .expect("download over stale file");
    assert_eq!(std::fs::read(&local).expect("read local"), b"hello world");
}

#[tokio::test]
async fn upload_should_land_bytes_in_a_writable_share() {
    let fixture = start_server(true, None).await;
    let local = fixture.local_dir().join("report.bin");
    let payload = (0..100_000u32).map(|i| (i % 241) as u8).collect::<Vec<_>>();
    std::fs::write(&local, &payload).expect("write local");

    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    let total = client
        .upload("inbox", "nested/report.bin", &local, "t-up", None, |_, _| {})
        .await
        .expect("upload");

    assert_eq!(total, payload.len() as u64);
    let landed = std::fs::read(fixture.write_root().join("nested/report.bin"))
        .expect("read uploaded file");
    assert_eq!(landed, payload);
}

#[tokio::test]
async fn upload_should_resume_from_the_servers_offset() {
    let fixture = start_server(true, None).await;
    let local = fixture.local_dir().join("resume.bin");
    let payload = (0..80_000u32).map(|i| (i % 199) as u8).collect::<Vec<_>>();
    std::fs::write(&local, &payload).expect("write local");
    // half the file already landed in an earlier attempt
    std::fs::write(fixture.write_root().join("resume.bin"), &payload[..40_000])
        .expect("seed server prefix");

    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    client
        .upload("inbox", "resume.bin", &local, "t-up-resume", None, |_, _| {})
        .await
        .expect("resumed upload");

    let landed = std::fs::read(fixture.write_root().join("resume.bin")).expect("read");
    assert_eq!(landed, payload);
}

#[tokio::test]
async fn upload_to_read_only_share_should_fail_without_touching_disk() {
    let fixture = start_server(true, None).await;
    let local = fixture.local_dir().join("blocked.txt");
    std::fs::write(&local, b"nope").expect("write local");

    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    let error = client
        .upload("docs", "blocked.txt", &local, "t-ro", None, |_, _| {})
        .await
        .expect_err("expected read-only rejection");

    assert_eq!(error.code, "READ_ONLY");
    assert!(!fixture.read_root().join("blocked.txt").exists());
}

#[tokio::test]
async fn traversal_paths_should_be_rejected_everywhere() {
    let fixture = start_server(true, None).await;
    let mut client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");

    let error = client
        .list_dir("docs", "../outside")
        .await
        .expect_err("list_dir traversal");
    assert_eq!(error.code, "PATH_TRAVERSAL");

    let error = client
        .stat("docs", "../../etc/passwd")
        .await
        .expect_err("stat traversal");
    assert_eq!(error.code, "PATH_TRAVERSAL");
}

#[tokio::test]
async fn unknown_share_should_be_not_found() {
    let fixture = start_server(true, None).await;
    let mut client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    let error = client
        .list_dir("no-such-share", "")
        .await
        .expect_err("expected miss");
    assert_eq!(error.code, "NOT_FOUND");
}

#[tokio::test]
async fn hash_req_should_digest_the_requested_range() {
    let fixture = start_server(true, None).await;
    let mut client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");

    let sha = client
        .hash_range("docs", "hello.txt", 6, 5)
        .await
        .expect("range hash");
    // sha256("world")
    assert_eq!(
        sha,
        "486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7"
    );

    let error = client
        .hash_range("docs", "hello.txt", 6, 6)
        .await
        .expect_err("expected range failure");
    assert_eq!(error.code, "INVALID_RANGE");
}

#[tokio::test]
async fn unknown_request_type_should_echo_a_typed_failure() {
    let fixture = start_server(true, None).await;
    let mut stream = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("connect raw");

    write_frame(
        &mut stream,
        FrameKind::Json,
        br#"{"type":"FROBNICATE","reqId":"x7"}"#,
    )
    .await
    .expect("write unknown request");

    let frame = read_frame(&mut stream)
        .await
        .expect("read response")
        .expect("response frame");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["type"], "FROBNICATE_RESP");
    assert_eq!(value["reqId"], "x7");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "BAD_REQUEST");

    // the server closes after a protocol violation
    assert!(read_frame(&mut stream).await.expect("eof").is_none());
}

#[tokio::test]
async fn version_mismatch_should_be_rejected_at_hello() {
    let fixture = start_server(true, None).await;
    let mut stream = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("connect raw");

    write_frame(
        &mut stream,
        FrameKind::Json,
        br#"{"type":"HELLO","reqId":"r1","proto":"9.9","deviceId":"C","deviceName":"cli","auth":"open"}"#,
    )
    .await
    .expect("write hello");

    let frame = read_frame(&mut stream)
        .await
        .expect("read response")
        .expect("response frame");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["type"], "HELLO_ACK");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "UNSUPPORTED_VERSION");
}

async fn raw_open_handshake(stream: &mut tokio::net::TcpStream) {
    write_frame(
        stream,
        FrameKind::Json,
        br#"{"type":"HELLO","reqId":"r1","proto":"1.0","deviceId":"C","deviceName":"cli","auth":"open"}"#,
    )
    .await
    .expect("write hello");
    let frame = read_frame(stream)
        .await
        .expect("read hello ack")
        .expect("hello ack frame");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["type"], "HELLO_ACK");
    assert_eq!(value["ok"], true);
}

async fn read_json(stream: &mut tokio::net::TcpStream) -> serde_json::Value {
    let frame = read_frame(stream)
        .await
        .expect("read frame")
        .expect("frame present");
    serde_json::from_slice(&frame.payload).expect("json payload")
}

#[tokio::test]
async fn corrupted_upload_should_fail_integrity_at_file_end() {
    let fixture = start_server(true, None).await;
    let mut stream = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("connect raw");
    raw_open_handshake(&mut stream).await;

    let payload = b"hello world";
    let mut corrupted = payload.to_vec();
    corrupted[3] ^= 0x01;

    let upload_req = serde_json::json!({
        "type": "UPLOAD_REQ", "reqId": "r2", "transferId": "t-corrupt",
        "shareId": "inbox", "path": "corrupt.txt",
        "file": { "size": payload.len(), "sha256": HELLO_WORLD_SHA256 },
    });
    write_frame(
        &mut stream,
        FrameKind::Json,
        &serde_json::to_vec(&upload_req).expect("encode"),
    )
    .await
    .expect("write upload req");

    let ack = read_json(&mut stream).await;
    assert_eq!(ack["type"], "UPLOAD_ACK");
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["offset"], 0);

    let chunk = serde_json::json!({
        "type": "FILE_CHUNK", "transferId": "t-corrupt", "offset": 0, "length": corrupted.len(),
    });
    write_frame(
        &mut stream,
        FrameKind::Json,
        &serde_json::to_vec(&chunk).expect("encode"),
    )
    .await
    .expect("write chunk header");
    write_frame(&mut stream, FrameKind::Binary, &corrupted)
        .await
        .expect("write chunk body");

    // FILE_END still declares the pristine hash; the server's running
    // digest disagrees
    let end = serde_json::json!({
        "type": "FILE_END", "transferId": "t-corrupt", "ok": true,
        "file": { "size": payload.len(), "sha256": HELLO_WORLD_SHA256 },
    });
    write_frame(
        &mut stream,
        FrameKind::Json,
        &serde_json::to_vec(&end).expect("encode"),
    )
    .await
    .expect("write file end");

    let done = read_json(&mut stream).await;
    assert_eq!(done["type"], "UPLOAD_DONE");
    assert_eq!(done["ok"], false);
    assert_eq!(done["error"]["code"], "INTEGRITY_FAILED");
}

#[tokio::test]
async fn upload_overshoot_should_fail_with_bad_request() {
    let fixture = start_server(true, None).await;
    let mut stream = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("connect raw");
    raw_open_handshake(&mut stream).await;

    let upload_req = serde_json::json!({
        "type": "UPLOAD_REQ", "reqId": "r2", "transferId": "t-over",
        "shareId": "inbox", "path": "over.txt",
        "file": { "size": 4, "sha256": HELLO_WORLD_SHA256 },
    });
    write_frame(
        &mut stream,
        FrameKind::Json,
        &serde_json::to_vec(&upload_req).expect("encode"),
    )
    .await
    .expect("write upload req");
    let ack = read_json(&mut stream).await;
    assert_eq!(ack["ok"], true);

    let chunk = serde_json::json!({
        "type": "FILE_CHUNK", "transferId": "t-over", "offset": 0, "length": 11,
    });
    write_frame(
        &mut stream,
        FrameKind::Json,
        &serde_json::to_vec(&chunk).expect("encode"),
    )
    .await
    .expect("write chunk header");
    write_frame(&mut stream, FrameKind::Binary, b"hello world")
        .await
        .expect("write chunk body");

    let done = read_json(&mut stream).await;
    assert_eq!(done["type"], "UPLOAD_DONE");
    assert_eq!(done["ok"], false);
    assert_eq!(done["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn upload_of_an_already_complete_file_should_verify_without_chunks() {
    let fixture = start_server(true, None).await;
    let local = fixture.local_dir().join("whole.txt");
    std::fs::write(&local, b"hello world").expect("write local");
    // destination already holds every byte
    std::fs::write(fixture.write_root().join("whole.txt"), b"hello world")
        .expect("seed complete destination");

    let client = SessionClient::connect(&fixture.addr.to_string(), open_client_identity())
        .await
        .expect("handshake");
    let total = client
        .upload("inbox", "whole.txt", &local, "t-verify", None, |_, _| {})
        .await
        .expect("verify-only upload");
    assert_eq!(total, 11);
}

#[tokio::test]
async fn requests_before_hello_should_be_rejected() {
    let fixture = start_server(true, None).await;
    let mut stream = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("connect raw");

    write_frame(
        &mut stream,
        FrameKind::Json,
        br#"{"type":"LIST_SHARES","reqId":"r1"}"#,
    )
    .await
    .expect("write early request");

    let frame = read_frame(&mut stream)
        .await
        .expect("read response")
        .expect("response frame");
    let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
    assert_eq!(value["type"], "LIST_SHARES_RESP");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "BAD_REQUEST");
}
