// Flight session tracking and event derivation.
// Invariants: at most one event of a given kind is persisted per session
// within the cooldown window; aggregate updates never block or allocate
// on the per-message path.

use serde::Serialize;
use uuid::Uuid;

use crate::model::{FlightMode, TelemetrySnapshot};

pub const EVENT_COOLDOWN_MS: u64 = 3_000;
pub const TAKEOFF_ALT_REL_M: f32 = 5.0;
pub const LANDING_ALT_REL_M: f32 = 2.0;
pub const BATTERY_LOW_PCT: u8 = 20;
/// Position jumps implying more than this ground speed are GPS glitches
/// and excluded from the distance sum.
pub const GPS_GLITCH_LIMIT_MPS: f64 = 100.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    SessionEnded,
    Takeoff,
    Landing,
    ModeChange,
    BatteryLow,
    ZoneViolation,
}

impl EventKind {
    pub const COUNT: usize = 7;

    pub fn index(self) -> usize {
        match self {
            EventKind::SessionStarted => 0,
            EventKind::SessionEnded => 1,
            EventKind::Takeoff => 2,
            EventKind::Landing => 3,
            EventKind::ModeChange => 4,
            EventKind::BatteryLow => 5,
            EventKind::ZoneViolation => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionStarted => "session_started",
            EventKind::SessionEnded => "session_ended",
            EventKind::Takeoff => "takeoff",
            EventKind::Landing => "landing",
            EventKind::ModeChange => "mode_change",
            EventKind::BatteryLow => "battery_low",
            EventKind::ZoneViolation => "zone_violation",
        }
    }
}

/// A derived lifecycle observation. `persist` is false when the trigger
/// fired inside the per-kind cooldown: the event may still be shown to
/// operators but must not be written through to storage.
#[derive(Clone, Debug, Serialize)]
pub struct FlightEvent {
    pub session_id: Uuid,
    pub kind: EventKind,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<FlightMode>,
    pub message: String,
    #[serde(skip)]
    pub persist: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub flight_duration_ms: u64,
    pub start_battery: Option<u8>,
    pub end_battery: Option<u8>,
    /// `start - end`, clamped to zero when the end reading is higher.
    pub battery_used: Option<u8>,
    pub start_point: Option<(f64, f64)>,
    pub end_point: Option<(f64, f64)>,
    pub max_altitude_m: f32,
    pub max_speed_mps: f32,
    pub avg_speed_mps: f32,
    pub total_distance_m: f64,
    pub status: SessionStatus,
}

/// One bounded flight interval: opened on the first heartbeat after a
/// connect, closed on disconnect or operator termination.
#[derive(Clone, Debug)]
pub struct FlightSession {
    pub session_id: Uuid,
    pub started_at_ms: u64,
    start_battery: Option<u8>,
    start_point: Option<(f64, f64)>,
    max_altitude_m: f32,
    max_speed_mps: f32,
    total_distance_m: f64,
    speed_sum_mps: f64,
    speed_samples: u64,
    last_fix: Option<(f64, f64, u64)>,
    prior_mode: Option<FlightMode>,
    airborne: bool,
    last_persisted_ms: [Option<u64>; EventKind::COUNT],
}

impl FlightSession {
    pub fn open(snapshot: &TelemetrySnapshot, now_ms: u64) -> (Self, FlightEvent) {
        let session_id = Uuid::new_v4();
        let mut session = Self {
            session_id,
            started_at_ms: now_ms,
            start_battery: snapshot.battery_pct,
            start_point: snapshot.position(),
            max_altitude_m: 0.0,
            max_speed_mps: 0.0,
            total_distance_m: 0.0,
            speed_sum_mps: 0.0,
            speed_samples: 0,
            last_fix: snapshot.position().map(|(lat, lon)| (lat, lon, now_ms)),
            prior_mode: snapshot.mode,
            airborne: false,
            last_persisted_ms: [None; EventKind::COUNT],
        };
        session.last_persisted_ms[EventKind::SessionStarted.index()] = Some(now_ms);
        let event = session.event(
            EventKind::SessionStarted,
            snapshot,
            now_ms,
            "Session started".to_string(),
            true,
        );
        (session, event)
    }

    /// Evaluate one telemetry update against the derivation rules and
    /// fold it into the running aggregates.
    pub fn observe(&mut self, snapshot: &TelemetrySnapshot, now_ms: u64) -> Vec<FlightEvent> {
        self.update_aggregates(snapshot, now_ms);

        let mut events = Vec::new();

        // Mode change: instantaneous edge, emitted immediately, persisted
        // at most once per cooldown.
        if let Some(mode) = snapshot.mode {
            if let Some(prior) = self.prior_mode {
                if prior != mode {
                    let persist = self.try_persist(EventKind::ModeChange, now_ms);
                    events.push(self.event(
                        EventKind::ModeChange,
                        snapshot,
                        now_ms,
                        format!("Flight mode changed from {} to {}", prior, mode),
                        persist,
                    ));
                }
            }
            self.prior_mode = Some(mode);
        }

        if !self.airborne {
            if snapshot.armed && snapshot.alt_rel_m.map_or(false, |alt| alt > TAKEOFF_ALT_REL_M) {
                self.airborne = true;
                let persist = self.try_persist(EventKind::Takeoff, now_ms);
                events.push(self.event(
                    EventKind::Takeoff,
                    snapshot,
                    now_ms,
                    "Takeoff detected".to_string(),
                    persist,
                ));
            }
        } else if !snapshot.armed
            && snapshot.alt_rel_m.map_or(false, |alt| alt < LANDING_ALT_REL_M)
        {
            self.airborne = false;
            let persist = self.try_persist(EventKind::Landing, now_ms);
            events.push(self.event(
                EventKind::Landing,
                snapshot,
                now_ms,
                "Landing detected".to_string(),
                persist,
            ));
        }

        // Battery low is level-triggered; inside the cooldown it is
        // suppressed entirely rather than re-announced.
        if let Some(pct) = snapshot.battery_pct {
            if pct < BATTERY_LOW_PCT && self.cooldown_expired(EventKind::BatteryLow, now_ms) {
                self.try_persist(EventKind::BatteryLow, now_ms);
                events.push(self.event(
                    EventKind::BatteryLow,
                    snapshot,
                    now_ms,
                    format!("Battery low: {}%", pct),
                    true,
                ));
            }
        }

        events
    }

    /// Geofence intake from the zone collaborator; same debounce path.
    pub fn zone_violation(
        &mut self,
        point: Option<(f64, f64)>,
        message: &str,
        now_ms: u64,
    ) -> Option<FlightEvent> {
        if !self.cooldown_expired(EventKind::ZoneViolation, now_ms) {
            return None;
        }
        self.try_persist(EventKind::ZoneViolation, now_ms);
        Some(FlightEvent {
            session_id: self.session_id,
            kind: EventKind::ZoneViolation,
            timestamp_ms: now_ms,
            point,
            altitude_m: None,
            battery_pct: None,
            speed_mps: None,
            mode: None,
            message: message.to_string(),
            persist: true,
        })
    }

    /// End the flight. `Completed` only if the vehicle is back on the
    /// ground (or never left it); anything cut short mid-air is `Aborted`.
    pub fn close(self, snapshot: &TelemetrySnapshot, now_ms: u64) -> (SessionSummary, FlightEvent) {
        let end_battery = snapshot.battery_pct;
        let battery_used = match (self.start_battery, end_battery) {
            (Some(start), Some(end)) => Some(start.saturating_sub(end)),
            _ => None,
        };
        let avg_speed_mps = if self.speed_samples > 0 {
            (self.speed_sum_mps / self.speed_samples as f64) as f32
        } else {
            0.0
        };
        let status = if self.airborne {
            SessionStatus::Aborted
        } else {
            SessionStatus::Completed
        };

        let event = FlightEvent {
            session_id: self.session_id,
            kind: EventKind::SessionEnded,
            timestamp_ms: now_ms,
            point: snapshot.position(),
            altitude_m: snapshot.alt_rel_m,
            battery_pct: end_battery,
            speed_mps: snapshot.ground_speed_mps,
            mode: snapshot.mode,
            message: "Session ended".to_string(),
            persist: true,
        };

        let summary = SessionSummary {
            session_id: self.session_id,
            started_at_ms: self.started_at_ms,
            ended_at_ms: now_ms,
            flight_duration_ms: now_ms.saturating_sub(self.started_at_ms),
            start_battery: self.start_battery,
            end_battery,
            battery_used,
            start_point: self.start_point,
            end_point: snapshot.position(),
            max_altitude_m: self.max_altitude_m,
            max_speed_mps: self.max_speed_mps,
            avg_speed_mps,
            total_distance_m: self.total_distance_m,
            status,
        };
        (summary, event)
    }

    pub fn start_battery(&self) -> Option<u8> {
        self.start_battery
    }

    pub fn start_point(&self) -> Option<(f64, f64)> {
        self.start_point
    }

    fn update_aggregates(&mut self, snapshot: &TelemetrySnapshot, now_ms: u64) {
        if self.start_battery.is_none() {
            self.start_battery = snapshot.battery_pct;
        }
        if self.start_point.is_none() {
            self.start_point = snapshot.position();
        }
        if let Some(alt) = snapshot.alt_rel_m {
            if alt > self.max_altitude_m {
                self.max_altitude_m = alt;
            }
        }
        if let Some(speed) = snapshot.ground_speed_mps {
            if speed > self.max_speed_mps {
                self.max_speed_mps = speed;
            }
            self.speed_sum_mps += speed as f64;
            self.speed_samples += 1;
        }
        if let Some((lat, lon)) = snapshot.position() {
            if let Some((prev_lat, prev_lon, prev_ms)) = self.last_fix {
                let distance = haversine_m(prev_lat, prev_lon, lat, lon);
                let dt_s = now_ms.saturating_sub(prev_ms) as f64 / 1000.0;
                if dt_s > 0.0 && distance / dt_s <= GPS_GLITCH_LIMIT_MPS {
                    self.total_distance_m += distance;
                }
            }
            self.last_fix = Some((lat, lon, now_ms));
        }
    }

    fn cooldown_expired(&self, kind: EventKind, now_ms: u64) -> bool {
        match self.last_persisted_ms[kind.index()] {
            Some(last) => now_ms.saturating_sub(last) >= EVENT_COOLDOWN_MS,
            None => true,
        }
    }

    fn try_persist(&mut self, kind: EventKind, now_ms: u64) -> bool {
        if self.cooldown_expired(kind, now_ms) {
            self.last_persisted_ms[kind.index()] = Some(now_ms);
            true
        } else {
            false
        }
    }

    fn event(
        &self,
        kind: EventKind,
        snapshot: &TelemetrySnapshot,
        now_ms: u64,
        message: String,
        persist: bool,
    ) -> FlightEvent {
        FlightEvent {
            session_id: self.session_id,
            kind,
            timestamp_ms: now_ms,
            point: snapshot.position(),
            altitude_m: snapshot.alt_rel_m,
            battery_pct: snapshot.battery_pct,
            speed_mps: snapshot.ground_speed_mps,
            mode: snapshot.mode,
            message,
            persist,
        }
    }
}

/// Great-circle distance between two fixes in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            armed: false,
            mode: Some(FlightMode::Stabilize),
            lat: Some(-35.363262),
            lon: Some(149.165237),
            alt_msl_m: Some(584.0),
            alt_rel_m: Some(0.0),
            ground_speed_mps: Some(0.0),
            air_speed_mps: Some(0.0),
            heading_deg: Some(0),
            throttle_pct: Some(0),
            battery_pct: Some(100),
            voltage_v: Some(12.6),
            current_a: Some(1.2),
            satellites: Some(10),
            last_update_epoch_ms: 1,
        }
    }

    fn persisted(events: &[FlightEvent], kind: EventKind) -> usize {
        events
            .iter()
            .filter(|event| event.kind == kind && event.persist)
            .count()
    }

    #[test]
    fn open_emits_session_started_with_start_state() {
        let snap = snapshot();
        let (session, event) = FlightSession::open(&snap, 10_000);
        assert_eq!(event.kind, EventKind::SessionStarted);
        assert!(event.persist);
        assert_eq!(session.start_battery(), Some(100));
        assert!(session.start_point().is_some());
    }

    #[test]
    fn takeoff_fires_exactly_once_over_bouncing_altitude() {
        let mut snap = snapshot();
        let (mut session, _) = FlightSession::open(&snap, 0);

        snap.armed = true;
        let mut all = Vec::new();
        for (i, alt) in [6.0, 7.0, 8.0, 9.0, 8.0, 7.0, 8.0, 9.0, 10.0, 11.0]
            .iter()
            .enumerate()
        {
            snap.alt_rel_m = Some(*alt);
            all.extend(session.observe(&snap, (i as u64) * 100));
        }
        assert_eq!(persisted(&all, EventKind::Takeoff), 1);
        assert_eq!(
            all.iter().filter(|e| e.kind == EventKind::Takeoff).count(),
            1
        );
    }

    #[test]
    fn landing_only_after_airborne_and_low_disarmed() {
        let mut snap = snapshot();
        let (mut session, _) = FlightSession::open(&snap, 0);

        // Disarmed on the ground: not a landing.
        snap.alt_rel_m = Some(0.5);
        assert!(session.observe(&snap, 100).is_empty());

        snap.armed = true;
        snap.alt_rel_m = Some(20.0);
        let events = session.observe(&snap, 200);
        assert_eq!(persisted(&events, EventKind::Takeoff), 1);

        snap.armed = false;
        snap.alt_rel_m = Some(1.0);
        let events = session.observe(&snap, 10_000);
        assert_eq!(persisted(&events, EventKind::Landing), 1);
    }

    #[test]
    fn mode_change_only_on_actual_change() {
        let mut snap = snapshot();
        snap.mode = Some(FlightMode::Land);
        let (mut session, _) = FlightSession::open(&snap, 0);

        // Same mode again: nothing.
        assert!(session.observe(&snap, 100).is_empty());

        snap.mode = Some(FlightMode::Rtl);
        let events = session.observe(&snap, 200);
        assert_eq!(persisted(&events, EventKind::ModeChange), 1);
        assert!(events[0].message.contains("LAND"));
        assert!(events[0].message.contains("RTL"));

        // A quick flip back inside the cooldown is emitted but not persisted.
        snap.mode = Some(FlightMode::Land);
        let events = session.observe(&snap, 400);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ModeChange);
        assert!(!events[0].persist);
    }

    #[test]
    fn battery_low_reannounces_after_cooldown() {
        let mut snap = snapshot();
        snap.battery_pct = Some(15);
        let (mut session, _) = FlightSession::open(&snap, 0);

        let mut all = Vec::new();
        for i in 0..10 {
            all.extend(session.observe(&snap, i * 500));
        }
        // Ten 500 ms ticks cover 0..4500: fires at t=0 and t=3000 only.
        assert_eq!(persisted(&all, EventKind::BatteryLow), 2);
        assert!(all.iter().all(|event| event.persist));
    }

    #[test]
    fn zone_violation_is_debounced() {
        let snap = snapshot();
        let (mut session, _) = FlightSession::open(&snap, 0);

        assert!(session
            .zone_violation(snap.position(), "left zone Alpha", 1_000)
            .is_some());
        assert!(session
            .zone_violation(snap.position(), "left zone Alpha", 2_000)
            .is_none());
        assert!(session
            .zone_violation(snap.position(), "left zone Alpha", 4_100)
            .is_some());
    }

    #[test]
    fn distance_skips_gps_glitches() {
        let mut snap = snapshot();
        let (mut session, _) = FlightSession::open(&snap, 0);

        // ~111 m north in 10 s: plausible, counted.
        snap.lat = Some(snap.lat.unwrap() + 0.001);
        session.observe(&snap, 10_000);
        // ~1.11 km jump in 1 s (1110 m/s): glitch, skipped.
        snap.lat = Some(snap.lat.unwrap() + 0.01);
        session.observe(&snap, 11_000);

        let (summary, _) = session.close(&snap, 12_000);
        assert!(summary.total_distance_m > 100.0);
        assert!(summary.total_distance_m < 130.0);
    }

    #[test]
    fn close_computes_battery_used_with_clamp() {
        let mut snap = snapshot();
        let (session, _) = FlightSession::open(&snap, 0);
        snap.battery_pct = Some(60);
        let (summary, event) = session.close(&snap, 90_000);
        assert_eq!(summary.battery_used, Some(40));
        assert_eq!(summary.flight_duration_ms, 90_000);
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(event.kind, EventKind::SessionEnded);

        // Battery "gained" (swap, sensor noise): clamp to zero.
        let mut snap2 = snapshot();
        snap2.battery_pct = Some(50);
        let (session2, _) = FlightSession::open(&snap2, 0);
        snap2.battery_pct = Some(80);
        let (summary2, _) = session2.close(&snap2, 1_000);
        assert_eq!(summary2.battery_used, Some(0));
    }

    #[test]
    fn disconnect_mid_air_aborts() {
        let mut snap = snapshot();
        let (mut session, _) = FlightSession::open(&snap, 0);
        snap.armed = true;
        snap.alt_rel_m = Some(30.0);
        session.observe(&snap, 1_000);

        let (summary, _) = session.clone().close(&snap, 2_000);
        assert_eq!(summary.status, SessionStatus::Aborted);

        // Land first, then disconnect: completed.
        snap.armed = false;
        snap.alt_rel_m = Some(0.4);
        session.observe(&snap, 20_000);
        let (summary, _) = session.close(&snap, 21_000);
        assert_eq!(summary.status, SessionStatus::Completed);
    }

    #[test]
    fn speed_aggregates() {
        let mut snap = snapshot();
        let (mut session, _) = FlightSession::open(&snap, 0);
        for (i, speed) in [4.0f32, 8.0, 12.0].iter().enumerate() {
            snap.ground_speed_mps = Some(*speed);
            session.observe(&snap, (i as u64 + 1) * 1_000);
        }
        let (summary, _) = session.close(&snap, 5_000);
        assert_eq!(summary.max_speed_mps, 12.0);
        assert!((summary.avg_speed_mps - 8.0).abs() < 1e-3);
    }
}
