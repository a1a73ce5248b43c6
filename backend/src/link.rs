// Vehicle link: one bound UDP endpoint per vehicle.
// Invariants: the peer address is only ever learned from inbound frames
// (or a per-vehicle operator override); a single bad frame never drops
// the link; commands are best-effort datagrams with no retry here.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use mav_core::dialect::{self, msg, MavMessage};
use mav_core::frame::{DecoderStats, FrameDecoder, FrameEncoder};
use mav_core::model::TelemetrySnapshot;

use crate::constants::{
    FRAMING_LOG_WINDOW_MS, HEARTBEAT_TIMEOUT_SECS, RECONNECT_BACKOFF_SECS, RECV_BUFFER_LEN,
    WATCHDOG_TICK_MS,
};
use crate::error::CoreError;
use crate::manager::LinkSink;
use crate::utils::now_epoch_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    UdpIn,
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::UdpIn => "udpin",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

/// Transport descriptor `protocol:host:port`. `udpin:` names a local
/// bind address and the peer is learned from traffic; `udp:` with a
/// concrete remote IP is the operator override form and pre-seeds the
/// command target instead.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// The pinned command target this endpoint configures, if any.
    /// Only `udp:` with a unicast IP literal qualifies; `udp:0.0.0.0:p`
    /// and hostnames stay listen-style, like `udpin:`.
    pub fn peer_override(&self) -> Option<SocketAddr> {
        if self.protocol != Protocol::Udp {
            return None;
        }
        let ip: std::net::IpAddr = self.host.parse().ok()?;
        if ip.is_unspecified() {
            return None;
        }
        Some(SocketAddr::new(ip, self.port))
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidConnectionString(raw.to_string());
        let mut parts = raw.splitn(3, ':');
        let protocol = match parts.next() {
            Some("udpin") => Protocol::UdpIn,
            Some("udp") => Protocol::Udp,
            Some("tcp") => Protocol::Tcp,
            _ => return Err(invalid()),
        };
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = parts
            .next()
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Registered,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Default)]
struct PeerState {
    addr: Option<SocketAddr>,
    /// Operator override: learned traffic must not displace it.
    pinned: bool,
}

/// State shared between the link task and command senders.
pub struct LinkShared {
    pub drone_id: i64,
    status: Mutex<LinkStatus>,
    peer: Mutex<PeerState>,
    /// Learned (sysid, compid) of the vehicle, command target defaults.
    target: Mutex<(u8, u8)>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    encoder: Mutex<FrameEncoder>,
    stats: Mutex<DecoderStats>,
    snapshot: RwLock<TelemetrySnapshot>,
}

impl LinkShared {
    fn new(drone_id: i64, peer_override: Option<SocketAddr>) -> Self {
        Self {
            drone_id,
            status: Mutex::new(LinkStatus::Connecting),
            peer: Mutex::new(PeerState {
                addr: peer_override,
                pinned: peer_override.is_some(),
            }),
            target: Mutex::new((1, 1)),
            socket: Mutex::new(None),
            encoder: Mutex::new(FrameEncoder::new()),
            stats: Mutex::new(DecoderStats::default()),
            snapshot: RwLock::new(TelemetrySnapshot::default()),
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: LinkStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer.lock().unwrap().addr
    }

    pub fn target(&self) -> (u8, u8) {
        *self.target.lock().unwrap()
    }

    pub fn stats(&self) -> DecoderStats {
        *self.stats.lock().unwrap()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.read().await.clone()
    }

    /// Learn (or re-learn) the peer from a datagram source. Returns the
    /// previous address when it changed.
    fn learn_peer(&self, source: SocketAddr) -> Option<Option<SocketAddr>> {
        let mut peer = self.peer.lock().unwrap();
        if peer.pinned || peer.addr == Some(source) {
            return None;
        }
        let previous = peer.addr;
        peer.addr = Some(source);
        Some(previous)
    }

    /// Encode and send one message to the learned peer, best-effort.
    pub async fn send_frame(&self, msg_id: u32, payload: &[u8]) -> Result<(), CoreError> {
        match self.status() {
            LinkStatus::Connecting | LinkStatus::Connected | LinkStatus::Reconnecting => {}
            _ => return Err(CoreError::NotConnected),
        }
        let peer = self.peer().ok_or(CoreError::PeerUnknown)?;
        let socket = self
            .socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(CoreError::NotConnected)?;
        let wire = self.encoder.lock().unwrap().encode(msg_id, payload)?;
        socket.send_to(&wire, peer).await?;
        Ok(())
    }
}

/// Handle owned by the manager; dropping the cancel side stops the task.
pub struct VehicleLink {
    pub shared: Arc<LinkShared>,
    cancel: Option<oneshot::Sender<()>>,
}

impl VehicleLink {
    /// Bind-and-spawn. `peer_override` is the per-vehicle command target
    /// configuration; the learned peer is the default. A pinned peer
    /// means the endpoint names the remote, so the local bind is
    /// ephemeral.
    pub fn spawn(
        drone_id: i64,
        endpoint: Endpoint,
        peer_override: Option<SocketAddr>,
        sink: LinkSink,
    ) -> Result<Self, CoreError> {
        if endpoint.protocol == Protocol::Tcp {
            return Err(CoreError::UnsupportedProtocol(
                endpoint.protocol.as_str().to_string(),
            ));
        }
        let bind_to = match peer_override {
            Some(_) => ("0.0.0.0".to_string(), 0),
            None => (endpoint.host.clone(), endpoint.port),
        };
        let shared = Arc::new(LinkShared::new(drone_id, peer_override));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task_shared = shared.clone();
        tokio::spawn(async move {
            run_link(task_shared, endpoint, bind_to, sink, cancel_rx).await;
        });
        Ok(Self {
            shared,
            cancel: Some(cancel_tx),
        })
    }

    /// Idempotent: signalling an already-finished task is a no-op.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

enum LoopExit {
    Stop,
    Rebind(std::io::Error),
}

async fn run_link(
    shared: Arc<LinkShared>,
    endpoint: Endpoint,
    bind_to: (String, u16),
    sink: LinkSink,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut first_bind = true;

    loop {
        shared.set_status(LinkStatus::Connecting);
        sink.status(LinkStatus::Connecting, None);

        let socket = loop {
            match UdpSocket::bind(bind_to.clone()).await {
                Ok(socket) => break Arc::new(socket),
                Err(err) if first_bind => {
                    warn!(drone_id = shared.drone_id, %endpoint, ?err, "bind failed");
                    shared.set_status(LinkStatus::Disconnected);
                    sink.status(LinkStatus::Disconnected, Some(format!("bind failed: {}", err)));
                    return;
                }
                Err(err) => {
                    debug!(drone_id = shared.drone_id, ?err, "rebind failed, retrying");
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            finish(&shared, &sink, None);
                            return;
                        }
                        _ = time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)) => {}
                    }
                }
            }
        };
        first_bind = false;
        info!(
            drone_id = shared.drone_id,
            addr = ?socket.local_addr().ok(),
            "vehicle link bound"
        );
        *shared.socket.lock().unwrap() = Some(socket.clone());

        match recv_loop(&shared, &sink, &socket, &mut cancel_rx).await {
            LoopExit::Stop => return,
            LoopExit::Rebind(err) => {
                warn!(drone_id = shared.drone_id, ?err, "socket error, rebinding");
                *shared.socket.lock().unwrap() = None;
                shared.set_status(LinkStatus::Reconnecting);
                sink.status(LinkStatus::Reconnecting, Some(format!("socket error: {}", err)));
                tokio::select! {
                    _ = &mut cancel_rx => {
                        finish(&shared, &sink, None);
                        return;
                    }
                    _ = time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)) => {}
                }
            }
        }
    }
}

async fn recv_loop(
    shared: &Arc<LinkShared>,
    sink: &LinkSink,
    socket: &Arc<UdpSocket>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> LoopExit {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; RECV_BUFFER_LEN];
    let mut watchdog = time::interval(Duration::from_millis(WATCHDOG_TICK_MS));
    let started = Instant::now();
    let mut last_heartbeat: Option<Instant> = None;
    let mut framing_window_start = 0u64;
    let mut framing_window_errors = 0u64;

    loop {
        tokio::select! {
            _ = &mut *cancel_rx => {
                finish(shared, sink, None);
                return LoopExit::Stop;
            }
            _ = watchdog.tick() => {
                let since = last_heartbeat.unwrap_or(started).elapsed();
                if since >= Duration::from_secs(HEARTBEAT_TIMEOUT_SECS) {
                    warn!(drone_id = shared.drone_id, "heartbeat timeout");
                    finish(shared, sink, Some("heartbeat timeout".to_string()));
                    return LoopExit::Stop;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, source) = match recv {
                    Ok(ok) => ok,
                    Err(err) => return LoopExit::Rebind(err),
                };
                decoder.feed(&buf[..len]);
                while let Some(result) = decoder.next_frame() {
                    match result {
                        Ok(frame) => {
                            if let Some(previous) = shared.learn_peer(source) {
                                match previous {
                                    None => info!(
                                        drone_id = shared.drone_id,
                                        peer = %source,
                                        "peer learned"
                                    ),
                                    Some(old) => info!(
                                        drone_id = shared.drone_id,
                                        old = %old,
                                        new = %source,
                                        "peer address changed"
                                    ),
                                }
                            }
                            if shared.status() != LinkStatus::Connected {
                                shared.set_status(LinkStatus::Connected);
                                sink.status(LinkStatus::Connected, None);
                            }

                            let message = dialect::decode_message(frame.msg_id, &frame.payload);
                            if frame.msg_id == msg::HEARTBEAT {
                                last_heartbeat = Some(Instant::now());
                                *shared.target.lock().unwrap() = (frame.sysid, frame.compid);
                            }
                            if !matches!(message, MavMessage::Unknown { .. }) {
                                let snapshot = {
                                    let mut snapshot = shared.snapshot.write().await;
                                    snapshot.update_from(&message, now_epoch_ms());
                                    snapshot.clone()
                                };
                                sink.telemetry(frame.msg_id, snapshot);
                            }
                        }
                        Err(err) => {
                            // Counted, never fatal; one log line per window.
                            let now = now_epoch_ms();
                            framing_window_errors += 1;
                            if now.saturating_sub(framing_window_start) >= FRAMING_LOG_WINDOW_MS {
                                debug!(
                                    drone_id = shared.drone_id,
                                    errors = framing_window_errors,
                                    ?err,
                                    "framing errors"
                                );
                                framing_window_start = now;
                                framing_window_errors = 0;
                            }
                        }
                    }
                }
                *shared.stats.lock().unwrap() = decoder.stats();
            }
        }
    }
}

fn finish(shared: &Arc<LinkShared>, sink: &LinkSink, detail: Option<String>) {
    *shared.socket.lock().unwrap() = None;
    shared.set_status(LinkStatus::Disconnected);
    sink.status(LinkStatus::Disconnected, detail);
}
