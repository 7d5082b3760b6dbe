use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A peer as tracked by the directory. `last_seen_ms` is unix millis of the
/// most recent accepted datagram; liveness is derived from it at snapshot
/// time and never stored.
#[derive(Debug, Clone)]
pub struct Peer {
    pub device_id: String,
    pub device_name: String,
    pub address: String,
    pub tcp_port: u16,
    pub discovery_port: u16,
    pub last_seen_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    pub device_id: String,
    pub device_name: String,
    pub address: String,
    pub tcp_port: u16,
    pub discovery_port: u16,
    pub last_seen_utc: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub share_id: String,
    pub name: String,
    pub local_path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime_utc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    pub mtime_utc: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Running,
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub done: u64,
    pub total: u64,
    pub state: TransferState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub speed_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

/// Events published on the node's broadcast channel. Publishing is
/// send-and-forget; a lagging subscriber drops events, never the core.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerSeen(PeerView),
    SharesChanged,
    TransferProgress(TransferSnapshot),
    TransferFinished(TransferSnapshot),
}
