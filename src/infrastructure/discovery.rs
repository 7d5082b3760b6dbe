use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::app::peer_directory::PeerDirectory;
use crate::core::models::{NodeEvent, Peer};
use crate::core::{AppResult, ResultExt};
use crate::infrastructure::protocol::{AUTH_OPEN, AUTH_PSK, PROTOCOL_VERSION};

const MAX_DATAGRAM_BYTES: usize = 4096;
const ERROR_LOG_THROTTLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCaps {
    pub auth: Vec<String>,
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum DiscoveryMessage {
    DiscoveryAnnounce {
        proto: String,
        device_id: String,
        device_name: String,
        tcp_port: u16,
        discovery_port: u16,
        ts: String,
        caps: DiscoveryCaps,
    },
    DiscoveryQuery {
        proto: String,
        ts: String,
    },
    DiscoveryResponse {
        proto: String,
        device_id: String,
        device_name: String,
        tcp_port: u16,
        discovery_port: u16,
        ts: String,
        caps: DiscoveryCaps,
    },
}

/// Identity advertised in every ANNOUNCE / RESPONSE datagram.
#[derive(Debug, Clone)]
pub struct AnnounceProfile {
    pub device_id: String,
    pub device_name: String,
    pub tcp_port: u16,
    pub discovery_port: u16,
    pub open_mode: bool,
}

impl AnnounceProfile {
    fn caps(&self) -> DiscoveryCaps {
        let auth = if self.open_mode {
            vec![AUTH_OPEN.to_string(), AUTH_PSK.to_string()]
        } else {
            vec![AUTH_PSK.to_string()]
        };
        DiscoveryCaps { auth, resume: true }
    }

    fn announce(&self) -> DiscoveryMessage {
        DiscoveryMessage::DiscoveryAnnounce {
            proto: PROTOCOL_VERSION.to_string(),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            tcp_port: self.tcp_port,
            discovery_port: self.discovery_port,
            ts: now_iso(),
            caps: self.caps(),
        }
    }

    fn response(&self) -> DiscoveryMessage {
        DiscoveryMessage::DiscoveryResponse {
            proto: PROTOCOL_VERSION.to_string(),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            tcp_port: self.tcp_port,
            discovery_port: self.discovery_port,
            ts: now_iso(),
            caps: self.caps(),
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Suppress repeated socket-error lines; discovery loops must never die on
/// a transient failure, but they must not spam either.
struct LogThrottle {
    last: Option<Instant>,
}

impl LogThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn should_log(&mut self) -> bool {
        match self.last {
            Some(at) if at.elapsed() < ERROR_LOG_THROTTLE => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

/// One socket serves both loops: the announce task writes, the listen task
/// reads. Broadcast and address-reuse go on before the bind, which tokio's
/// `UdpSocket::bind` cannot do; the socket is assembled with socket2 and
/// handed to the runtime afterwards.
pub async fn bind_discovery_socket(bind_addr: &str, port: u16) -> AppResult<Arc<UdpSocket>> {
    let ip: IpAddr = bind_addr
        .parse()
        .with_code("BAD_REQUEST", "invalid discovery bind address")
        .with_ctx("bindAddr", bind_addr.to_string())?;
    let addr = SocketAddr::new(ip, port);

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .with_code("IO_ERROR", "discovery socket create failed")?;
    socket
        .set_reuse_address(true)
        .with_code("IO_ERROR", "discovery reuse-address enable failed")?;
    socket
        .set_broadcast(true)
        .with_code("IO_ERROR", "discovery broadcast enable failed")?;
    socket
        .set_nonblocking(true)
        .with_code("IO_ERROR", "discovery nonblocking enable failed")?;
    socket
        .bind(&addr.into())
        .with_code("IO_ERROR", "discovery socket bind failed")
        .with_ctx("bindAddr", addr.to_string())?;

    let socket = UdpSocket::from_std(socket.into())
        .with_code("IO_ERROR", "discovery socket register failed")?;
    Ok(Arc::new(socket))
}

/// Prompt already-running peers for an immediate RESPONSE instead of
/// waiting out their announce cadence.
pub async fn send_query(socket: &UdpSocket, discovery_port: u16) {
    let query = DiscoveryMessage::DiscoveryQuery {
        proto: PROTOCOL_VERSION.to_string(),
        ts: now_iso(),
    };
    let target = SocketAddr::from(([255, 255, 255, 255], discovery_port));
    match serde_json::to_vec(&query) {
        Ok(bytes) => {
            if let Err(error) = socket.send_to(&bytes, target).await {
                tracing::warn!(event = "discovery_query_send_failed", error = error.to_string());
            }
        }
        Err(error) => {
            tracing::warn!(
                event = "discovery_query_serialize_failed",
                error = error.to_string()
            );
        }
    }
}

pub async fn run_announce_loop(
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    profile: AnnounceProfile,
    interval_ms: u64,
) {
    let target = SocketAddr::from(([255, 255, 255, 255], profile.discovery_port));
    let mut throttle = LogThrottle::new();

    while !stop.load(Ordering::Relaxed) {
        match serde_json::to_vec(&profile.announce()) {
            Ok(bytes) => {
                if let Err(error) = socket.send_to(&bytes, target).await
                    && throttle.should_log()
                {
                    tracing::warn!(
                        event = "discovery_announce_send_failed",
                        error = error.to_string()
                    );
                }
            }
            Err(error) => {
                if throttle.should_log() {
                    tracing::warn!(
                        event = "discovery_announce_serialize_failed",
                        error = error.to_string()
                    );
                }
            }
        }

        sleep(Duration::from_millis(interval_ms)).await;
    }
    tracing::info!(event = "discovery_announce_stopped");
}

pub async fn run_listen_loop(
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    peers: PeerDirectory,
    profile: AnnounceProfile,
    respond_to_queries: bool,
    events: broadcast::Sender<NodeEvent>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];
    let mut throttle = LogThrottle::new();

    while !stop.load(Ordering::Relaxed) {
        let received = tokio::select! {
            recv = socket.recv_from(buffer.as_mut_slice()) => Some(recv),
            _ = sleep(Duration::from_millis(300)) => None,
        };
        let Some(received) = received else {
            continue;
        };

        let (size, addr) = match received {
            Ok(value) => value,
            Err(error) => {
                if throttle.should_log() {
                    tracing::warn!(
                        event = "discovery_recv_failed",
                        error = error.to_string()
                    );
                }
                continue;
            }
        };
        if size == 0 {
            continue;
        }

        let Ok(message) = serde_json::from_slice::<DiscoveryMessage>(&buffer[..size]) else {
            continue;
        };

        match message {
            DiscoveryMessage::DiscoveryAnnounce {
                proto,
                device_id,
                device_name,
                tcp_port,
                discovery_port,
                ..
            }
            | DiscoveryMessage::DiscoveryResponse {
                proto,
                device_id,
                device_name,
                tcp_port,
                discovery_port,
                ..
            } => {
                if proto != PROTOCOL_VERSION || device_id == profile.device_id {
                    continue;
                }
                let view = peers
                    .upsert(Peer {
                        device_id,
                        device_name,
                        address: addr.ip().to_string(),
                        tcp_port,
                        discovery_port,
                        last_seen_ms: Utc::now().timestamp_millis(),
                    })
                    .await;
                let _ = events.send(NodeEvent::PeerSeen(view));
            }
            DiscoveryMessage::DiscoveryQuery { proto, .. } => {
                if proto != PROTOCOL_VERSION || !respond_to_queries {
                    continue;
                }
                match serde_json::to_vec(&profile.response()) {
                    Ok(bytes) => {
                        if let Err(error) = socket.send_to(&bytes, addr).await
                            && throttle.should_log()
                        {
                            tracing::warn!(
                                event = "discovery_response_send_failed",
                                peer = addr.to_string(),
                                error = error.to_string()
                            );
                        }
                    }
                    Err(error) => {
                        if throttle.should_log() {
                            tracing::warn!(
                                event = "discovery_response_serialize_failed",
                                error = error.to_string()
                            );
                        }
                    }
                }
            }
        }
    }
    tracing::info!(event = "discovery_listen_stopped");
}
