use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::app::peer_directory::PeerDirectory;
use crate::app::session_client::{ClientIdentity, SessionClient};
use crate::app::session_server::{ServerContext, handle_connection};
use crate::app::share_registry::ShareRegistry;
use crate::core::models::{
    NodeEvent, PeerView, Share, TransferDirection, TransferSnapshot, TransferState,
};
use crate::core::{AppError, AppResult, ResultExt};
use crate::infrastructure::config::NodeConfig;
use crate::infrastructure::discovery::{
    AnnounceProfile, bind_discovery_socket, run_announce_loop, run_listen_loop, send_query,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PROGRESS_EMIT_INTERVAL_MS: i64 = 250;

struct TransferEntry {
    snapshot: TransferSnapshot,
    canceled: Arc<AtomicBool>,
    started_ms: i64,
    first_done: Option<u64>,
    last_emit_ms: i64,
}

type TransferMap = Arc<RwLock<HashMap<String, TransferEntry>>>;

/// The long-running node: discovery loops, the accept loop, the share and
/// peer tables, and client-initiated transfers. The UI layer observes
/// snapshots and the event channel; it never touches core state directly.
pub struct NodeService {
    config: NodeConfig,
    shares: Arc<ShareRegistry>,
    peers: PeerDirectory,
    events: broadcast::Sender<NodeEvent>,
    stop: Arc<AtomicBool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    transfers: TransferMap,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn calculate_speed(moved_bytes: u64, started_ms: i64) -> u64 {
    let elapsed_ms = (now_millis() - started_ms).max(1) as u64;
    moved_bytes.saturating_mul(1000) / elapsed_ms
}

fn estimate_eta(total: u64, done: u64, speed_bps: u64) -> Option<u64> {
    if speed_bps == 0 || done >= total {
        return None;
    }
    Some((total - done).div_ceil(speed_bps))
}

impl NodeService {
    pub fn new(config: NodeConfig) -> AppResult<Self> {
        let shares = Arc::new(ShareRegistry::from_config(&config.shares)?);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            shares,
            peers: PeerDirectory::new(),
            events,
            stop: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            transfers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn announce_profile(&self) -> AnnounceProfile {
        AnnounceProfile {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            tcp_port: self.config.tcp_port,
            discovery_port: self.config.discovery_port,
            open_mode: self.config.open_mode,
        }
    }

    fn server_context(&self) -> ServerContext {
        ServerContext {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            open_mode: self.config.open_mode,
            shared_key: self.config.shared_key.clone(),
            shares: self.shares.clone(),
        }
    }

    fn client_identity(&self) -> ClientIdentity {
        ClientIdentity {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            shared_key: self.config.shared_key.clone(),
        }
    }

    /// Spawn the discovery loops and the accept loop. Idempotent.
    pub async fn start(&self) -> AppResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket =
            bind_discovery_socket(&self.config.bind_addr, self.config.discovery_port).await?;
        send_query(&socket, self.config.discovery_port).await;

        let listener =
            tokio::net::TcpListener::bind((self.config.bind_addr.as_str(), self.config.tcp_port))
                .await
                .with_code("IO_ERROR", "tcp listener bind failed")
                .with_ctx(
                    "addr",
                    format!("{}:{}", self.config.bind_addr, self.config.tcp_port),
                )?;

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| AppError::new("INTERNAL_ERROR", "task list lock poisoned"))?;
        tasks.push(tokio::spawn(run_announce_loop(
            socket.clone(),
            self.stop.clone(),
            self.announce_profile(),
            self.config.announce_interval_ms,
        )));
        tasks.push(tokio::spawn(run_listen_loop(
            socket,
            self.stop.clone(),
            self.peers.clone(),
            self.announce_profile(),
            self.config.respond_to_queries,
            self.events.clone(),
        )));
        tracing::info!(
            event = "node_started",
            device_id = self.config.device_id,
            tcp_port = self.config.tcp_port,
            discovery_port = self.config.discovery_port
        );

        let ctx = self.server_context();
        let stop = self.stop.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => Some(accepted),
                    _ = tokio::time::sleep(std::time::Duration::from_millis(300)) => None,
                };
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let Some(accepted) = accepted else {
                    continue;
                };
                match accepted {
                    Ok((stream, addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(error) = handle_connection(ctx, stream).await {
                                tracing::warn!(
                                    event = "session_failed",
                                    peer = addr.to_string(),
                                    code = error.code,
                                    message = error.message,
                                    detail = error.detail.unwrap_or_default()
                                );
                            }
                        });
                    }
                    Err(error) => {
                        tracing::warn!(event = "accept_failed", error = error.to_string());
                    }
                }
            }
            tracing::info!(event = "accept_loop_stopped");
        }));

        Ok(())
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        tracing::info!(event = "node_stopping");
    }

    pub async fn peers(&self) -> Vec<PeerView> {
        self.peers.snapshot().await
    }

    /// Dial string for a discovered peer's control port.
    pub async fn peer_endpoint(&self, device_id: &str) -> Option<String> {
        self.peers
            .get(device_id)
            .await
            .map(|peer| format!("{}:{}", peer.address, peer.tcp_port))
    }

    pub fn shares(&self) -> Vec<Share> {
        self.shares.list()
    }

    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.transfers
            .read()
            .map(|guard| guard.values().map(|entry| entry.snapshot.clone()).collect())
            .unwrap_or_default()
    }

    pub fn add_share(
        &self,
        path: &Path,
        read_only: bool,
        name: Option<String>,
    ) -> AppResult<Share> {
        let share = self.shares.add(path, read_only, None, name)?;
        let _ = self.events.send(NodeEvent::SharesChanged);
        Ok(share)
    }

    pub fn remove_share(&self, share_id: &str) -> bool {
        let removed = self.shares.remove(share_id);
        if removed {
            let _ = self.events.send(NodeEvent::SharesChanged);
        }
        removed
    }

    pub fn toggle_share_read_only(&self, share_id: &str) -> bool {
        let toggled = self.shares.toggle_read_only(share_id);
        if toggled {
            let _ = self.events.send(NodeEvent::SharesChanged);
        }
        toggled
    }

    /// Persisted share list for the settings collaborator.
    pub fn shares_config(&self) -> Vec<crate::infrastructure::config::ShareConfig> {
        self.shares.to_config()
    }

    /// Start a download on its own task; returns the transfer-id at once.
    pub fn download(
        &self,
        peer_addr: String,
        share_id: String,
        remote_path: String,
        local_path: PathBuf,
    ) -> String {
        self.spawn_transfer(TransferDirection::Download, move |identity, flag, progress| async move {
            let transfer_id = progress.transfer_id.clone();
            let client = SessionClient::connect(&peer_addr, identity).await?;
            client
                .download(
                    &share_id,
                    &remote_path,
                    &local_path,
                    &transfer_id,
                    Some(flag.as_ref()),
                    |done, total| progress.update(done, total),
                )
                .await
        })
    }

    /// Start an upload on its own task; returns the transfer-id at once.
    pub fn upload(
        &self,
        peer_addr: String,
        share_id: String,
        remote_path: String,
        local_path: PathBuf,
    ) -> String {
        self.spawn_transfer(TransferDirection::Upload, move |identity, flag, progress| async move {
            let transfer_id = progress.transfer_id.clone();
            let client = SessionClient::connect(&peer_addr, identity).await?;
            client
                .upload(
                    &share_id,
                    &remote_path,
                    &local_path,
                    &transfer_id,
                    Some(flag.as_ref()),
                    |done, total| progress.update(done, total),
                )
                .await
        })
    }

    /// Flip the cancel flag; the transfer task notices between chunks and
    /// drops its connection.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        let Ok(guard) = self.transfers.read() else {
            return false;
        };
        match guard.get(transfer_id) {
            Some(entry) => {
                entry.canceled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn spawn_transfer<F, Fut>(&self, direction: TransferDirection, run: F) -> String
    where
        F: FnOnce(ClientIdentity, Arc<AtomicBool>, ProgressHandle) -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<u64>> + Send + 'static,
    {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let canceled = Arc::new(AtomicBool::new(false));
        let snapshot = TransferSnapshot {
            transfer_id: transfer_id.clone(),
            direction,
            done: 0,
            total: 0,
            state: TransferState::Running,
            error_code: None,
            speed_bps: 0,
            eta_seconds: None,
        };
        if let Ok(mut guard) = self.transfers.write() {
            guard.insert(
                transfer_id.clone(),
                TransferEntry {
                    snapshot,
                    canceled: canceled.clone(),
                    started_ms: now_millis(),
                    first_done: None,
                    last_emit_ms: 0,
                },
            );
        }

        let progress = ProgressHandle {
            transfer_id: transfer_id.clone(),
            transfers: self.transfers.clone(),
            events: self.events.clone(),
        };
        let identity = self.client_identity();
        let flag = canceled.clone();
        let transfers = self.transfers.clone();
        let events = self.events.clone();
        let task_id = transfer_id.clone();

        tokio::spawn(async move {
            let result = run(identity, flag, progress).await;
            let final_snapshot = {
                let Ok(mut guard) = transfers.write() else {
                    return;
                };
                let Some(entry) = guard.get_mut(&task_id) else {
                    return;
                };
                match &result {
                    Ok(total) => {
                        entry.snapshot.state = TransferState::Completed;
                        entry.snapshot.done = *total;
                        entry.snapshot.total = *total;
                        entry.snapshot.error_code = None;
                    }
                    Err(error) if error.code == "CANCELED" => {
                        entry.snapshot.state = TransferState::Canceled;
                    }
                    Err(error) => {
                        entry.snapshot.state = TransferState::Failed;
                        entry.snapshot.error_code = Some(error.code.clone());
                    }
                }
                entry.snapshot.eta_seconds = None;
                entry.snapshot.clone()
            };
            match result {
                Ok(_) => {
                    tracing::info!(event = "transfer_finished", transfer_id = task_id);
                }
                Err(error) => {
                    tracing::warn!(
                        event = "transfer_failed",
                        transfer_id = task_id,
                        code = error.code,
                        message = error.message
                    );
                }
            }
            let _ = events.send(NodeEvent::TransferFinished(final_snapshot));
        });

        transfer_id
    }
}

/// Cloneable progress sink handed into the transfer closures; updates the
/// shared snapshot and emits throttled progress events.
#[derive(Clone)]
pub struct ProgressHandle {
    transfer_id: String,
    transfers: TransferMap,
    events: broadcast::Sender<NodeEvent>,
}

impl ProgressHandle {
    fn update(&self, done: u64, total: u64) {
        let Ok(mut guard) = self.transfers.write() else {
            return;
        };
        let Some(entry) = guard.get_mut(&self.transfer_id) else {
            return;
        };

        let first_done = *entry.first_done.get_or_insert(done);
        entry.snapshot.done = done;
        entry.snapshot.total = total;
        entry.snapshot.speed_bps =
            calculate_speed(done.saturating_sub(first_done), entry.started_ms);
        entry.snapshot.eta_seconds = estimate_eta(total, done, entry.snapshot.speed_bps);

        let now = now_millis();
        if done == total || now - entry.last_emit_ms >= PROGRESS_EMIT_INTERVAL_MS {
            entry.last_emit_ms = now;
            let _ = self
                .events
                .send(NodeEvent::TransferProgress(entry.snapshot.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NodeConfig {
        NodeConfig {
            device_id: "test-device".to_string(),
            device_name: "test".to_string(),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn cancel_should_flip_a_registered_transfer() {
        let node = NodeService::new(test_config()).expect("node");
        // unreachable peer: the task will spin on connect retries while we
        // cancel through the public surface
        let transfer_id = node.download(
            "127.0.0.1:1".to_string(),
            "s".to_string(),
            "f".to_string(),
            std::env::temp_dir().join("netshare-cancel-test"),
        );
        assert!(node.cancel(&transfer_id));
        assert!(!node.cancel("missing"));
    }

    #[tokio::test]
    async fn share_mutations_should_emit_events() {
        let node = NodeService::new(test_config()).expect("node");
        let mut events = node.events();

        let dir = std::env::temp_dir().join(format!("netshare-node-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let share = node.add_share(&dir, true, None).expect("add share");
        assert!(matches!(
            events.try_recv().expect("event"),
            NodeEvent::SharesChanged
        ));

        assert!(node.remove_share(&share.share_id));
        assert!(node.shares().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn speed_and_eta_should_derive_sanely() {
        let started = now_millis() - 1000;
        let speed = calculate_speed(1_000_000, started);
        assert!(speed > 0);
        assert_eq!(estimate_eta(100, 100, speed), None);
        assert_eq!(estimate_eta(100, 50, 0), None);
        assert!(estimate_eta(2_000_000, 1_000_000, speed).is_some());
    }
}
