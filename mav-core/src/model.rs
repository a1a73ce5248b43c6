// Telemetry snapshot and flight mode naming.
// Invariants: fields that have not arrived yet stay `None`; no guessing.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::dialect::MavMessage;

/// ArduCopter custom_mode values this station names. Anything else keeps
/// its numeric identity as `MODE_<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightMode {
    Stabilize,
    Acro,
    AltHold,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Circle,
    Land,
    PosHold,
    Brake,
    Other(u32),
}

impl FlightMode {
    pub fn from_custom_mode(custom_mode: u32) -> Self {
        match custom_mode {
            0 => FlightMode::Stabilize,
            1 => FlightMode::Acro,
            2 => FlightMode::AltHold,
            3 => FlightMode::Auto,
            4 => FlightMode::Guided,
            5 => FlightMode::Loiter,
            6 => FlightMode::Rtl,
            7 => FlightMode::Circle,
            9 => FlightMode::Land,
            16 => FlightMode::PosHold,
            17 => FlightMode::Brake,
            other => FlightMode::Other(other),
        }
    }

    pub fn custom_mode(&self) -> u32 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::Acro => 1,
            FlightMode::AltHold => 2,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            FlightMode::Loiter => 5,
            FlightMode::Rtl => 6,
            FlightMode::Circle => 7,
            FlightMode::Land => 9,
            FlightMode::PosHold => 16,
            FlightMode::Brake => 17,
            FlightMode::Other(n) => *n,
        }
    }

    pub fn name(&self) -> String {
        match self {
            FlightMode::Stabilize => "STABILIZE".to_string(),
            FlightMode::Acro => "ACRO".to_string(),
            FlightMode::AltHold => "ALT_HOLD".to_string(),
            FlightMode::Auto => "AUTO".to_string(),
            FlightMode::Guided => "GUIDED".to_string(),
            FlightMode::Loiter => "LOITER".to_string(),
            FlightMode::Rtl => "RTL".to_string(),
            FlightMode::Circle => "CIRCLE".to_string(),
            FlightMode::Land => "LAND".to_string(),
            FlightMode::PosHold => "POSHOLD".to_string(),
            FlightMode::Brake => "BRAKE".to_string(),
            FlightMode::Other(n) => format!("MODE_{}", n),
        }
    }

    /// Case-insensitive lookup of a named mode. `MODE_<n>` is not accepted
    /// here; operators can only request modes the table names.
    pub fn parse_name(name: &str) -> Option<Self> {
        let mode = match name.to_ascii_uppercase().as_str() {
            "STABILIZE" => FlightMode::Stabilize,
            "ACRO" => FlightMode::Acro,
            "ALT_HOLD" => FlightMode::AltHold,
            "AUTO" => FlightMode::Auto,
            "GUIDED" => FlightMode::Guided,
            "LOITER" => FlightMode::Loiter,
            "RTL" => FlightMode::Rtl,
            "CIRCLE" => FlightMode::Circle,
            "LAND" => FlightMode::Land,
            "POSHOLD" => FlightMode::PosHold,
            "BRAKE" => FlightMode::Brake,
            _ => return None,
        };
        Some(mode)
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for FlightMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Current state of one vehicle, overwritten in place by its link's
/// decoder. One writer, many readers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub armed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<FlightMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_msl_m: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_rel_m: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_speed_mps: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_speed_mps: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_pct: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_v: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_a: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u8>,
    pub last_update_epoch_ms: u64,
}

impl TelemetrySnapshot {
    /// Merge one decoded message. Fields carried by other message kinds
    /// are left as they were.
    pub fn update_from(&mut self, message: &MavMessage, now_epoch_ms: u64) {
        match message {
            MavMessage::Heartbeat(hb) => {
                self.armed = hb.armed();
                self.mode = Some(hb.mode());
            }
            MavMessage::SysStatus(status) => {
                if let Some(pct) = status.remaining_pct() {
                    self.battery_pct = Some(pct);
                }
                if let Some(v) = status.voltage_v() {
                    self.voltage_v = Some(v);
                }
                if let Some(a) = status.current_a() {
                    self.current_a = Some(a);
                }
            }
            MavMessage::GpsRawInt(gps) => {
                self.satellites = Some(gps.satellites_visible);
            }
            MavMessage::GlobalPositionInt(pos) => {
                self.lat = Some(pos.lat_deg());
                self.lon = Some(pos.lon_deg());
                self.alt_msl_m = Some(pos.alt_msl_m());
                self.alt_rel_m = Some(pos.alt_rel_m());
                self.heading_deg = Some(pos.heading_deg());
            }
            MavMessage::VfrHud(hud) => {
                self.air_speed_mps = Some(hud.airspeed);
                self.ground_speed_mps = Some(hud.groundspeed);
                self.throttle_pct = Some(hud.throttle);
            }
            MavMessage::BatteryStatus(battery) => {
                if let Some(pct) = battery.remaining_pct() {
                    self.battery_pct = Some(pct);
                }
            }
            MavMessage::Unknown { .. } => return,
        }
        self.last_update_epoch_ms = now_epoch_ms;
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_update_epoch_ms == 0
    }
}
