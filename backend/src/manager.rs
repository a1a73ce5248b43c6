// Drone manager: registry of vehicle links keyed by drone id, owner and
// uin indexes, and the typed event stream consumed by the session engine
// and the subscriber hub.
// Invariants: uin is unique across registrations; registry writes are
// rare, reads are per-message hot paths.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use mav_core::dialect;
use mav_core::model::{FlightMode, TelemetrySnapshot};

use crate::constants::{MANAGER_EVENT_CAP, SERVER_SENDER_NAME};
use crate::error::CoreError;
use crate::link::{Endpoint, LinkStatus, VehicleLink};
use crate::utils::now_epoch_ms;

/// Typed event stream replacing name-based topics: every consumer gets
/// the same ordered view per drone.
#[derive(Clone, Debug)]
pub enum ManagerEvent {
    Telemetry(TelemetryUpdate),
    Link(LinkStatusEvent),
    Operator(OperatorMessage),
}

#[derive(Clone, Debug, Serialize)]
pub struct TelemetryUpdate {
    pub drone_id: i64,
    pub user_id: i64,
    pub uin: String,
    pub name: String,
    /// Message id that caused this update; consumers pick their frame
    /// shape from it.
    pub msg_id: u32,
    pub snapshot: TelemetrySnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct LinkStatusEvent {
    pub drone_id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Normal,
    Important,
    Warning,
    Critical,
}

impl Importance {
    /// Invalid values clamp to `normal`.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "important" => Importance::Important,
            "warning" => Importance::Warning,
            "critical" => Importance::Critical,
            _ => Importance::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorTarget {
    Drone(i64),
    AllConnected,
}

#[derive(Clone, Debug, Serialize)]
pub struct OperatorMessage {
    pub message: String,
    pub importance: Importance,
    pub sender: String,
    pub timestamp_ms: u64,
    /// Owner principal the message is addressed to; `None` broadcasts to
    /// every authenticated channel.
    #[serde(skip)]
    pub recipient: Option<i64>,
}

/// Narrow callback surface handed to each link task; the manager owns
/// the links, the links only ever talk back through this.
#[derive(Clone)]
pub struct LinkSink {
    pub drone_id: i64,
    pub user_id: i64,
    pub uin: String,
    pub name: String,
    pub events: broadcast::Sender<ManagerEvent>,
}

impl LinkSink {
    pub fn telemetry(&self, msg_id: u32, snapshot: TelemetrySnapshot) {
        let _ = self.events.send(ManagerEvent::Telemetry(TelemetryUpdate {
            drone_id: self.drone_id,
            user_id: self.user_id,
            uin: self.uin.clone(),
            name: self.name.clone(),
            msg_id,
            snapshot,
        }));
    }

    pub fn status(&self, status: LinkStatus, detail: Option<String>) {
        let _ = self.events.send(ManagerEvent::Link(LinkStatusEvent {
            drone_id: self.drone_id,
            user_id: self.user_id,
            name: self.name.clone(),
            status,
            detail,
        }));
    }
}

pub struct VehicleRecord {
    pub drone_id: i64,
    pub user_id: i64,
    pub name: String,
    pub uin: String,
    pub endpoint: Endpoint,
    pub peer_override: Option<SocketAddr>,
    pub link: Option<VehicleLink>,
    pub last_error: Option<String>,
}

impl VehicleRecord {
    pub fn status(&self) -> LinkStatus {
        self.link
            .as_ref()
            .map(|link| link.shared.status())
            .unwrap_or(LinkStatus::Registered)
    }
}

#[derive(Default)]
struct Registries {
    by_id: HashMap<i64, VehicleRecord>,
    by_owner: HashMap<i64, HashSet<i64>>,
    by_uin: HashMap<String, i64>,
}

/// Summary row for status responses and the admin listing.
#[derive(Clone, Debug, Serialize)]
pub struct DroneSummary {
    pub drone_id: i64,
    pub user_id: i64,
    pub name: String,
    pub uin: String,
    pub connection_string: String,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<SocketAddr>,
    pub frames: u64,
    pub decode_errors: u64,
    pub snapshot: TelemetrySnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct DroneManager {
    registries: RwLock<Registries>,
    events: broadcast::Sender<ManagerEvent>,
    next_id: AtomicI64,
}

impl DroneManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(MANAGER_EVENT_CAP);
        Self {
            registries: RwLock::new(Registries::default()),
            events,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ManagerEvent> {
        self.events.clone()
    }

    /// Register a vehicle. Fails with `UinConflict` when the uin is taken.
    pub async fn register(
        &self,
        user_id: i64,
        name: &str,
        uin: &str,
        endpoint: Endpoint,
    ) -> Result<i64, CoreError> {
        let mut registries = self.registries.write().await;
        if registries.by_uin.contains_key(uin) {
            return Err(CoreError::UinConflict(uin.to_string()));
        }
        let drone_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        registries.by_uin.insert(uin.to_string(), drone_id);
        registries
            .by_owner
            .entry(user_id)
            .or_default()
            .insert(drone_id);
        let peer_override = endpoint.peer_override();
        registries.by_id.insert(
            drone_id,
            VehicleRecord {
                drone_id,
                user_id,
                name: name.to_string(),
                uin: uin.to_string(),
                endpoint,
                peer_override,
                link: None,
                last_error: None,
            },
        );
        info!(drone_id, user_id, uin, "drone registered");
        Ok(drone_id)
    }

    pub async fn resolve_uin(&self, uin: &str) -> Option<i64> {
        self.registries.read().await.by_uin.get(uin).copied()
    }

    /// The single drone owned by `user_id`, preferring a connected one.
    pub async fn resolve_by_owner(&self, user_id: i64) -> Option<i64> {
        let registries = self.registries.read().await;
        let owned = registries.by_owner.get(&user_id)?;
        let mut fallback = None;
        for drone_id in owned {
            let record = registries.by_id.get(drone_id)?;
            match record.status() {
                LinkStatus::Connected | LinkStatus::Connecting | LinkStatus::Reconnecting => {
                    return Some(*drone_id)
                }
                _ => fallback = fallback.or(Some(*drone_id)),
            }
        }
        fallback
    }

    pub async fn owner_of(&self, drone_id: i64) -> Option<i64> {
        self.registries
            .read()
            .await
            .by_id
            .get(&drone_id)
            .map(|record| record.user_id)
    }

    /// Create the vehicle link. Idempotent while a link is alive.
    pub async fn connect(&self, drone_id: i64) -> Result<(), CoreError> {
        let mut registries = self.registries.write().await;
        let record = registries
            .by_id
            .get_mut(&drone_id)
            .ok_or(CoreError::DroneNotFound)?;

        if let Some(link) = record.link.as_ref() {
            match link.shared.status() {
                LinkStatus::Connecting | LinkStatus::Connected | LinkStatus::Reconnecting => {
                    return Ok(())
                }
                _ => {}
            }
        }

        let sink = LinkSink {
            drone_id,
            user_id: record.user_id,
            uin: record.uin.clone(),
            name: record.name.clone(),
            events: self.events.clone(),
        };
        match VehicleLink::spawn(drone_id, record.endpoint.clone(), record.peer_override, sink) {
            Ok(link) => {
                record.last_error = None;
                record.link = Some(link);
                Ok(())
            }
            Err(err) => {
                record.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Update the endpoint of the user's drone and connect it. This is the
    /// channel `connect{connection_string}` operation.
    pub async fn connect_for_user(
        &self,
        user_id: i64,
        endpoint: Endpoint,
    ) -> Result<i64, CoreError> {
        let drone_id = self
            .resolve_by_owner(user_id)
            .await
            .ok_or(CoreError::DroneNotFound)?;
        {
            let mut registries = self.registries.write().await;
            let record = registries
                .by_id
                .get_mut(&drone_id)
                .ok_or(CoreError::DroneNotFound)?;
            if record.endpoint != endpoint {
                if matches!(
                    record.status(),
                    LinkStatus::Connecting | LinkStatus::Connected | LinkStatus::Reconnecting
                ) {
                    if let Some(link) = record.link.as_mut() {
                        link.cancel();
                    }
                }
                record.peer_override = endpoint.peer_override();
                record.endpoint = endpoint;
            }
        }
        self.connect(drone_id).await?;
        Ok(drone_id)
    }

    /// Idempotent disconnect; the link task emits the terminal status.
    pub async fn disconnect(&self, drone_id: i64) -> Result<(), CoreError> {
        let mut registries = self.registries.write().await;
        let record = registries
            .by_id
            .get_mut(&drone_id)
            .ok_or(CoreError::DroneNotFound)?;
        if let Some(link) = record.link.as_mut() {
            link.cancel();
        }
        Ok(())
    }

    pub async fn arm(&self, drone_id: i64) -> Result<(), CoreError> {
        self.send_arm_disarm(drone_id, true).await
    }

    pub async fn disarm(&self, drone_id: i64) -> Result<(), CoreError> {
        self.send_arm_disarm(drone_id, false).await
    }

    async fn send_arm_disarm(&self, drone_id: i64, arm: bool) -> Result<(), CoreError> {
        let shared = self.link_shared(drone_id).await?;
        let (sysid, compid) = shared.target();
        let (msg_id, payload) = dialect::build_arm_disarm(sysid, compid, arm);
        shared.send_frame(msg_id, &payload).await?;
        info!(drone_id, arm, "arm command sent");
        Ok(())
    }

    pub async fn set_mode(&self, drone_id: i64, mode_name: &str) -> Result<FlightMode, CoreError> {
        let mode = FlightMode::parse_name(mode_name)
            .ok_or_else(|| CoreError::UnknownMode(mode_name.to_string()))?;
        let shared = self.link_shared(drone_id).await?;
        let (sysid, _) = shared.target();
        let (msg_id, payload) = dialect::build_set_mode(sysid, mode.custom_mode());
        shared.send_frame(msg_id, &payload).await?;
        info!(drone_id, mode = %mode, "set-mode command sent");
        Ok(mode)
    }

    /// Queue an operator message for the hub, resolving a drone target to
    /// its owner principal.
    pub async fn send_operator_message(
        &self,
        message: &str,
        importance: Importance,
        target: OperatorTarget,
    ) -> Result<(), CoreError> {
        let recipient = match target {
            OperatorTarget::AllConnected => None,
            OperatorTarget::Drone(drone_id) => Some(
                self.owner_of(drone_id)
                    .await
                    .ok_or(CoreError::DroneNotFound)?,
            ),
        };
        let _ = self.events.send(ManagerEvent::Operator(OperatorMessage {
            message: message.to_string(),
            importance,
            sender: SERVER_SENDER_NAME.to_string(),
            timestamp_ms: now_epoch_ms(),
            recipient,
        }));
        Ok(())
    }

    pub async fn summary(&self, drone_id: i64) -> Result<DroneSummary, CoreError> {
        let registries = self.registries.read().await;
        let record = registries
            .by_id
            .get(&drone_id)
            .ok_or(CoreError::DroneNotFound)?;
        Ok(Self::summarize(record).await)
    }

    pub async fn list(&self) -> Vec<DroneSummary> {
        let registries = self.registries.read().await;
        let mut out = Vec::with_capacity(registries.by_id.len());
        let mut ids: Vec<_> = registries.by_id.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(record) = registries.by_id.get(&id) {
                out.push(Self::summarize(record).await);
            }
        }
        out
    }

    async fn summarize(record: &VehicleRecord) -> DroneSummary {
        let (peer, frames, errors, snapshot) = match record.link.as_ref() {
            Some(link) => {
                let stats = link.shared.stats();
                (
                    link.shared.peer(),
                    stats.frames,
                    stats.errors,
                    link.shared.snapshot().await,
                )
            }
            None => (None, 0, 0, TelemetrySnapshot::default()),
        };
        DroneSummary {
            drone_id: record.drone_id,
            user_id: record.user_id,
            name: record.name.clone(),
            uin: record.uin.clone(),
            connection_string: record.endpoint.to_string(),
            status: record.status(),
            peer,
            frames,
            decode_errors: errors,
            snapshot,
            last_error: record.last_error.clone(),
        }
    }

    async fn link_shared(
        &self,
        drone_id: i64,
    ) -> Result<Arc<crate::link::LinkShared>, CoreError> {
        let registries = self.registries.read().await;
        let record = registries
            .by_id
            .get(&drone_id)
            .ok_or(CoreError::DroneNotFound)?;
        let link = record.link.as_ref().ok_or(CoreError::NotConnected)?;
        if record.status() == LinkStatus::Disconnected {
            return Err(CoreError::NotConnected);
        }
        Ok(link.shared.clone())
    }
}

impl Default for DroneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::parse("udpin:127.0.0.1:0").unwrap()
    }

    #[tokio::test]
    async fn register_assigns_monotonic_ids_and_indexes() {
        let manager = DroneManager::new();
        let a = manager
            .register(7, "alpha", "UIN-A", endpoint())
            .await
            .unwrap();
        let b = manager
            .register(8, "bravo", "UIN-B", endpoint())
            .await
            .unwrap();
        assert!(b > a);
        assert_eq!(manager.resolve_uin("UIN-A").await, Some(a));
        assert_eq!(manager.owner_of(b).await, Some(8));
        assert_eq!(manager.resolve_by_owner(7).await, Some(a));
    }

    #[tokio::test]
    async fn duplicate_uin_conflicts() {
        let manager = DroneManager::new();
        manager
            .register(7, "alpha", "UIN-A", endpoint())
            .await
            .unwrap();
        let err = manager
            .register(9, "copycat", "UIN-A", endpoint())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UinConflict(_)));
    }

    #[tokio::test]
    async fn commands_against_unknown_drone_fail() {
        let manager = DroneManager::new();
        assert!(matches!(
            manager.arm(42).await,
            Err(CoreError::DroneNotFound)
        ));
    }

    #[tokio::test]
    async fn command_without_link_is_not_connected() {
        let manager = DroneManager::new();
        let id = manager
            .register(7, "alpha", "UIN-A", endpoint())
            .await
            .unwrap();
        assert!(matches!(manager.arm(id).await, Err(CoreError::NotConnected)));
    }

    #[tokio::test]
    async fn command_before_first_frame_is_peer_unknown() {
        let manager = DroneManager::new();
        let id = manager
            .register(7, "alpha", "UIN-A", endpoint())
            .await
            .unwrap();
        manager.connect(id).await.unwrap();
        // Idempotent reconnect while the link is alive.
        manager.connect(id).await.unwrap();

        // The link binds asynchronously; until then the socket is absent.
        let mut result = manager.arm(id).await;
        for _ in 0..200 {
            match &result {
                Err(CoreError::PeerUnknown) => break,
                Err(CoreError::NotConnected) => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    result = manager.arm(id).await;
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert!(matches!(result, Err(CoreError::PeerUnknown)), "{:?}", result);
        manager.disconnect(id).await.unwrap();
        manager.disconnect(id).await.unwrap();
    }

    #[tokio::test]
    async fn udp_override_routes_commands_without_learned_traffic() {
        let vehicle = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = vehicle.local_addr().unwrap().port();

        let manager = DroneManager::new();
        let remote = Endpoint::parse(&format!("udp:127.0.0.1:{}", port)).unwrap();
        let id = manager.register(7, "alpha", "UIN-A", remote).await.unwrap();
        manager.connect(id).await.unwrap();

        // The link binds asynchronously; the pinned peer is set from the
        // start, so the first successful send needs no inbound frame.
        let mut result = manager.arm(id).await;
        for _ in 0..200 {
            if result.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            result = manager.arm(id).await;
        }
        result.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            vehicle.recv_from(&mut buf),
        )
        .await
        .expect("no command datagram")
        .unwrap();
        assert!(len > 0);

        let summary = manager.summary(id).await.unwrap();
        assert_eq!(
            summary.peer.map(|peer| peer.port()),
            Some(port),
            "summary reports the pinned peer"
        );
        manager.disconnect(id).await.unwrap();
    }

    #[tokio::test]
    async fn set_mode_validates_name_before_touching_the_link() {
        let manager = DroneManager::new();
        let id = manager
            .register(7, "alpha", "UIN-A", endpoint())
            .await
            .unwrap();
        assert!(matches!(
            manager.set_mode(id, "WARP").await,
            Err(CoreError::UnknownMode(_))
        ));
    }

    #[tokio::test]
    async fn operator_message_resolves_recipient() {
        let manager = DroneManager::new();
        let id = manager
            .register(7, "alpha", "UIN-A", endpoint())
            .await
            .unwrap();
        let mut rx = manager.subscribe();

        manager
            .send_operator_message("fly safe", Importance::Warning, OperatorTarget::Drone(id))
            .await
            .unwrap();
        let Ok(ManagerEvent::Operator(message)) = rx.recv().await else {
            panic!("expected operator event");
        };
        assert_eq!(message.recipient, Some(7));
        assert_eq!(message.importance, Importance::Warning);

        manager
            .send_operator_message("all hands", Importance::Normal, OperatorTarget::AllConnected)
            .await
            .unwrap();
        let Ok(ManagerEvent::Operator(message)) = rx.recv().await else {
            panic!("expected operator event");
        };
        assert_eq!(message.recipient, None);

        assert!(matches!(
            manager
                .send_operator_message("?", Importance::Normal, OperatorTarget::Drone(999))
                .await,
            Err(CoreError::DroneNotFound)
        ));
    }

    #[test]
    fn importance_clamps_to_normal() {
        assert_eq!(Importance::parse("critical"), Importance::Critical);
        assert_eq!(Importance::parse("WARNING"), Importance::Warning);
        assert_eq!(Importance::parse("silly"), Importance::Normal);
        assert_eq!(Importance::parse(""), Importance::Normal);
    }
}
