// Session and event engine: turns the manager's event stream into
// session rows and debounced event rows.
// Invariants: telemetry is never blocked on storage; transient write
// failures drop the row, a permanent failure disables persistence and
// flips the health flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use mav_core::dialect::msg;
use mav_core::model::TelemetrySnapshot;
use mav_core::session::{FlightEvent, FlightSession, SessionSummary};

use crate::constants::DRONE_ROW_WRITE_INTERVAL_MS;
use crate::link::LinkStatus;
use crate::manager::{LinkStatusEvent, ManagerEvent, TelemetryUpdate};
use crate::storage::{
    DroneStatusUpdate, EventRow, SessionCloseRow, SessionRow, Storage, StorageError,
};
use crate::utils::now_epoch_ms;

/// Geofence collaborator intake; flows through the same debounce and
/// persistence path as derived events.
#[derive(Clone, Debug)]
pub struct ZoneViolation {
    pub drone_id: i64,
    pub point: Option<(f64, f64)>,
    pub message: String,
}

#[derive(Clone)]
pub struct EngineHandle {
    zone_tx: mpsc::Sender<ZoneViolation>,
}

impl EngineHandle {
    pub async fn report_zone_violation(&self, violation: ZoneViolation) {
        let _ = self.zone_tx.send(violation).await;
    }
}

struct DroneFlight {
    user_id: i64,
    session: Option<FlightSession>,
    awaiting_heartbeat: bool,
    last_snapshot: TelemetrySnapshot,
    last_row_write_ms: u64,
}

pub struct SessionEngine {
    storage: Arc<dyn Storage>,
    health_failed: Arc<AtomicBool>,
    persistence_enabled: bool,
    flights: HashMap<i64, DroneFlight>,
}

impl SessionEngine {
    pub fn new(storage: Arc<dyn Storage>, health_failed: Arc<AtomicBool>) -> Self {
        Self {
            storage,
            health_failed,
            persistence_enabled: true,
            flights: HashMap::new(),
        }
    }

    pub async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Link(link) => self.handle_link(link).await,
            ManagerEvent::Telemetry(update) => self.handle_telemetry(update).await,
            ManagerEvent::Operator(_) => {}
        }
    }

    pub async fn handle_zone_violation(&mut self, violation: ZoneViolation) {
        let now = now_epoch_ms();
        let Some(flight) = self.flights.get_mut(&violation.drone_id) else {
            return;
        };
        let Some(session) = flight.session.as_mut() else {
            return;
        };
        let point = violation.point.or_else(|| flight.last_snapshot.position());
        if let Some(event) = session.zone_violation(point, &violation.message, now) {
            let row = event_row(&event, violation.drone_id, flight.user_id);
            self.write_event(row).await;
        }
    }

    async fn handle_link(&mut self, link: LinkStatusEvent) {
        match link.status {
            LinkStatus::Connected => {
                let flight = self.flights.entry(link.drone_id).or_insert(DroneFlight {
                    user_id: link.user_id,
                    session: None,
                    awaiting_heartbeat: false,
                    last_snapshot: TelemetrySnapshot::default(),
                    last_row_write_ms: 0,
                });
                // A fresh session starts on the next heartbeat, including
                // after a reconnect.
                if flight.session.is_none() {
                    flight.awaiting_heartbeat = true;
                }
                self.write_drone_status(link.drone_id, "connected", None).await;
            }
            LinkStatus::Disconnected => {
                self.close_flight(link.drone_id).await;
                self.write_drone_status(link.drone_id, "offline", None).await;
                if let Some(detail) = link.detail.as_deref() {
                    debug!(drone_id = link.drone_id, detail, "link down");
                }
            }
            // A rebind starts a fresh session on the next heartbeat, so
            // whatever was active ends here.
            LinkStatus::Connecting | LinkStatus::Reconnecting => {
                self.close_flight(link.drone_id).await;
                self.write_drone_status(link.drone_id, "connecting", None).await;
            }
            LinkStatus::Registered => {}
        }
    }

    async fn close_flight(&mut self, drone_id: i64) {
        if let Some(mut flight) = self.flights.remove(&drone_id) {
            flight.awaiting_heartbeat = false;
            if let Some(session) = flight.session.take() {
                let now = now_epoch_ms();
                let (summary, event) = session.close(&flight.last_snapshot, now);
                self.persist_session_close(&summary, &event, drone_id, flight.user_id)
                    .await;
                info!(
                    drone_id,
                    session_id = %summary.session_id,
                    status = ?summary.status,
                    "session closed"
                );
            }
        }
    }

    async fn handle_telemetry(&mut self, update: TelemetryUpdate) {
        let now = now_epoch_ms();
        let flight = self.flights.entry(update.drone_id).or_insert(DroneFlight {
            user_id: update.user_id,
            session: None,
            awaiting_heartbeat: false,
            last_snapshot: TelemetrySnapshot::default(),
            last_row_write_ms: 0,
        });
        flight.last_snapshot = update.snapshot.clone();

        let mut rows = Vec::new();
        if flight.awaiting_heartbeat && update.msg_id == msg::HEARTBEAT {
            flight.awaiting_heartbeat = false;
            let (session, started) = FlightSession::open(&update.snapshot, now);
            info!(
                drone_id = update.drone_id,
                session_id = %session.session_id,
                "session started"
            );
            rows.push(PendingWrite::Session(SessionRow {
                session_id: session.session_id,
                user_id: flight.user_id,
                drone_id: update.drone_id,
                mission_id: None,
                started_at_ms: session.started_at_ms,
                start_battery: session.start_battery(),
                start_point: session.start_point(),
            }));
            rows.push(PendingWrite::Event(event_row(
                &started,
                update.drone_id,
                flight.user_id,
            )));
            flight.session = Some(session);
        }

        if let Some(session) = flight.session.as_mut() {
            for event in session.observe(&update.snapshot, now) {
                if event.persist {
                    rows.push(PendingWrite::Event(event_row(
                        &event,
                        update.drone_id,
                        flight.user_id,
                    )));
                } else {
                    debug!(
                        drone_id = update.drone_id,
                        kind = event.kind.as_str(),
                        "event suppressed by cooldown"
                    );
                }
            }
        }

        // Throttled mirror of the live fix onto the drone row.
        let write_row = now.saturating_sub(flight.last_row_write_ms) >= DRONE_ROW_WRITE_INTERVAL_MS;
        if write_row {
            flight.last_row_write_ms = now;
        }

        for row in rows {
            match row {
                PendingWrite::Session(row) => self.write_session(row).await,
                PendingWrite::Event(row) => self.write_event(row).await,
            }
        }
        if write_row {
            let status = if update.snapshot.armed {
                "flying"
            } else {
                "connected"
            };
            let update_row = DroneStatusUpdate {
                drone_id: update.drone_id,
                status: status.to_string(),
                last_seen_ms: Some(now),
                position: update.snapshot.position(),
                altitude_m: update.snapshot.alt_rel_m,
            };
            self.write(|storage| async move { storage.update_drone_status(&update_row).await })
                .await;
        }
    }

    async fn persist_session_close(
        &mut self,
        summary: &SessionSummary,
        event: &FlightEvent,
        drone_id: i64,
        user_id: i64,
    ) {
        if summary
            .end_battery
            .zip(summary.start_battery)
            .map_or(false, |(end, start)| end > start)
        {
            warn!(
                session_id = %summary.session_id,
                start = summary.start_battery,
                end = summary.end_battery,
                "end battery above start, battery_used clamped to 0"
            );
        }
        let row = SessionCloseRow {
            session_id: summary.session_id,
            ended_at_ms: summary.ended_at_ms,
            flight_duration_ms: summary.flight_duration_ms,
            end_battery: summary.end_battery,
            battery_used: summary.battery_used,
            end_point: summary.end_point,
            max_altitude_m: summary.max_altitude_m,
            max_speed_mps: summary.max_speed_mps,
            avg_speed_mps: summary.avg_speed_mps,
            total_distance_m: summary.total_distance_m,
            status: status_name(summary).to_string(),
        };
        self.write(|storage| async move { storage.close_session(&row).await })
            .await;
        self.write_event(event_row(event, drone_id, user_id)).await;
    }

    async fn write_session(&mut self, row: SessionRow) {
        self.write(|storage| async move { storage.insert_session(&row).await })
            .await;
    }

    async fn write_event(&mut self, row: EventRow) {
        self.write(|storage| async move { storage.insert_event(&row).await })
            .await;
    }

    async fn write_drone_status(&mut self, drone_id: i64, status: &str, last_seen: Option<u64>) {
        let row = DroneStatusUpdate {
            drone_id,
            status: status.to_string(),
            last_seen_ms: last_seen,
            position: None,
            altitude_m: None,
        };
        self.write(|storage| async move { storage.update_drone_status(&row).await })
            .await;
    }

    /// One write with the drop policy applied: transient failures are
    /// dropped, a permanent failure disables the writer for good.
    async fn write<F, Fut>(&mut self, op: F)
    where
        F: FnOnce(Arc<dyn Storage>) -> Fut,
        Fut: std::future::Future<Output = Result<(), StorageError>>,
    {
        if !self.persistence_enabled {
            return;
        }
        match op(self.storage.clone()).await {
            Ok(()) => {}
            Err(StorageError::Transient(message)) => {
                debug!(error = %message, "transient storage failure, write dropped");
            }
            Err(StorageError::Permanent(message)) => {
                error!(error = %message, "permanent storage failure, persistence disabled");
                self.persistence_enabled = false;
                self.health_failed.store(true, Ordering::Relaxed);
            }
        }
    }
}

enum PendingWrite {
    Session(SessionRow),
    Event(EventRow),
}

fn status_name(summary: &SessionSummary) -> &'static str {
    match summary.status {
        mav_core::session::SessionStatus::Active => "active",
        mav_core::session::SessionStatus::Completed => "completed",
        mav_core::session::SessionStatus::Aborted => "aborted",
    }
}

fn event_row(event: &FlightEvent, drone_id: i64, user_id: i64) -> EventRow {
    EventRow {
        session_id: event.session_id,
        user_id,
        drone_id,
        mission_id: None,
        timestamp_ms: event.timestamp_ms,
        event_type: event.kind.as_str().to_string(),
        point: event.point,
        altitude_m: event.altitude_m,
        battery_pct: event.battery_pct,
        speed_mps: event.speed_mps,
        mode: event.mode.map(|mode| mode.name()),
        message: event.message.clone(),
    }
}

/// Long-running engine task: one consumer of the manager stream plus the
/// zone-violation intake.
pub fn spawn_engine(
    mut events: broadcast::Receiver<ManagerEvent>,
    storage: Arc<dyn Storage>,
    health_failed: Arc<AtomicBool>,
) -> EngineHandle {
    let (zone_tx, mut zone_rx) = mpsc::channel::<ZoneViolation>(32);
    tokio::spawn(async move {
        let mut engine = SessionEngine::new(storage, health_failed);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => engine.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session engine lagged behind telemetry");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                violation = zone_rx.recv() => match violation {
                    Some(violation) => engine.handle_zone_violation(violation).await,
                    None => break,
                },
            }
        }
    });
    EngineHandle { zone_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use mav_core::model::FlightMode;

    fn link_event(status: LinkStatus) -> ManagerEvent {
        ManagerEvent::Link(LinkStatusEvent {
            drone_id: 1,
            user_id: 7,
            name: "sitl".to_string(),
            status,
            detail: None,
        })
    }

    fn telemetry(msg_id: u32, snapshot: TelemetrySnapshot) -> ManagerEvent {
        ManagerEvent::Telemetry(TelemetryUpdate {
            drone_id: 1,
            user_id: 7,
            uin: "UIN-1".to_string(),
            name: "sitl".to_string(),
            msg_id,
            snapshot,
        })
    }

    fn snapshot(armed: bool, alt: f32, battery: u8) -> TelemetrySnapshot {
        TelemetrySnapshot {
            armed,
            mode: Some(FlightMode::Guided),
            lat: Some(-35.3),
            lon: Some(149.1),
            alt_msl_m: Some(600.0),
            alt_rel_m: Some(alt),
            ground_speed_mps: Some(5.0),
            air_speed_mps: Some(5.5),
            heading_deg: Some(90),
            throttle_pct: Some(40),
            battery_pct: Some(battery),
            voltage_v: None,
            current_a: None,
            satellites: Some(9),
            last_update_epoch_ms: 1,
        }
    }

    #[tokio::test]
    async fn session_opens_on_first_heartbeat_after_connect() {
        let storage = Arc::new(MemoryStorage::default());
        let health = Arc::new(AtomicBool::new(false));
        let mut engine = SessionEngine::new(storage.clone(), health);

        engine.handle_event(link_event(LinkStatus::Connected)).await;
        assert!(storage.sessions.lock().unwrap().is_empty());

        // Position traffic alone does not open a session.
        engine
            .handle_event(telemetry(msg::GLOBAL_POSITION_INT, snapshot(false, 0.0, 95)))
            .await;
        assert!(storage.sessions.lock().unwrap().is_empty());

        engine
            .handle_event(telemetry(msg::HEARTBEAT, snapshot(false, 0.0, 95)))
            .await;
        let sessions = storage.sessions.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_battery, Some(95));
        assert_eq!(sessions[0].user_id, 7);
        drop(sessions);
        assert_eq!(storage.event_count("session_started"), 1);

        // Second heartbeat must not open a second session.
        engine
            .handle_event(telemetry(msg::HEARTBEAT, snapshot(false, 0.0, 95)))
            .await;
        assert_eq!(storage.sessions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn takeoff_persists_once_and_disconnect_aborts() {
        let storage = Arc::new(MemoryStorage::default());
        let health = Arc::new(AtomicBool::new(false));
        let mut engine = SessionEngine::new(storage.clone(), health);

        engine.handle_event(link_event(LinkStatus::Connected)).await;
        engine
            .handle_event(telemetry(msg::HEARTBEAT, snapshot(false, 0.0, 95)))
            .await;
        for alt in [6.0, 7.0, 8.0, 9.0, 10.0] {
            engine
                .handle_event(telemetry(msg::GLOBAL_POSITION_INT, snapshot(true, alt, 94)))
                .await;
        }
        assert_eq!(storage.event_count("takeoff"), 1);

        engine
            .handle_event(link_event(LinkStatus::Disconnected))
            .await;
        let closed = storage.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, "aborted");
        assert_eq!(closed[0].battery_used, Some(1));
        drop(closed);
        assert_eq!(storage.event_count("session_ended"), 1);

        // Disconnect again: nothing further to close.
        engine
            .handle_event(link_event(LinkStatus::Disconnected))
            .await;
        assert_eq!(storage.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zone_violation_flows_through_debounce() {
        let storage = Arc::new(MemoryStorage::default());
        let health = Arc::new(AtomicBool::new(false));
        let mut engine = SessionEngine::new(storage.clone(), health);

        engine.handle_event(link_event(LinkStatus::Connected)).await;
        engine
            .handle_event(telemetry(msg::HEARTBEAT, snapshot(true, 20.0, 90)))
            .await;

        let violation = ZoneViolation {
            drone_id: 1,
            point: None,
            message: "outside zone Alpha".to_string(),
        };
        engine.handle_zone_violation(violation.clone()).await;
        engine.handle_zone_violation(violation).await;
        assert_eq!(storage.event_count("zone_violation"), 1);
    }

    #[tokio::test]
    async fn transient_failures_drop_quietly() {
        let storage = Arc::new(MemoryStorage::default());
        let health = Arc::new(AtomicBool::new(false));
        let mut engine = SessionEngine::new(storage.clone(), health.clone());

        *storage.fail.lock().unwrap() = Some("transient");
        engine.handle_event(link_event(LinkStatus::Connected)).await;
        engine
            .handle_event(telemetry(msg::HEARTBEAT, snapshot(false, 0.0, 95)))
            .await;
        assert!(!health.load(Ordering::Relaxed));

        // Recovered: subsequent writes land again.
        *storage.fail.lock().unwrap() = None;
        engine
            .handle_event(telemetry(msg::GLOBAL_POSITION_INT, snapshot(true, 30.0, 94)))
            .await;
        assert_eq!(storage.event_count("takeoff"), 1);
    }

    #[tokio::test]
    async fn permanent_failure_disables_persistence_and_flags_health() {
        let storage = Arc::new(MemoryStorage::default());
        let health = Arc::new(AtomicBool::new(false));
        let mut engine = SessionEngine::new(storage.clone(), health.clone());

        *storage.fail.lock().unwrap() = Some("permanent");
        engine.handle_event(link_event(LinkStatus::Connected)).await;
        engine
            .handle_event(telemetry(msg::HEARTBEAT, snapshot(false, 0.0, 95)))
            .await;
        assert!(health.load(Ordering::Relaxed));

        // Telemetry keeps flowing, but even healthy storage sees no writes.
        *storage.fail.lock().unwrap() = None;
        engine
            .handle_event(telemetry(msg::GLOBAL_POSITION_INT, snapshot(true, 30.0, 94)))
            .await;
        assert_eq!(storage.events.lock().unwrap().len(), 0);
    }
}
