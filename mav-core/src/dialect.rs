// Dialect tables and message schemas for the subset of the common dialect
// this ground station speaks. Payloads are little-endian and ordered by
// descending field width; truncated v2 payloads are zero-padded to the
// nominal length before slicing.

use crate::model::FlightMode;

/// Message ids used throughout the crate.
pub mod msg {
    pub const HEARTBEAT: u32 = 0;
    pub const SYS_STATUS: u32 = 1;
    pub const SET_MODE: u32 = 11;
    pub const GPS_RAW_INT: u32 = 24;
    pub const GLOBAL_POSITION_INT: u32 = 33;
    pub const VFR_HUD: u32 = 74;
    pub const COMMAND_LONG: u32 = 76;
    pub const BATTERY_STATUS: u32 = 147;
}

/// MAV_CMD_COMPONENT_ARM_DISARM.
pub const CMD_COMPONENT_ARM_DISARM: u16 = 400;

/// MAV_MODE_FLAG_SAFETY_ARMED.
pub const BASE_MODE_ARMED: u8 = 0x80;

/// MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.
pub const BASE_MODE_CUSTOM_ENABLED: u8 = 0x01;

/// CRC_EXTRA seed for each message id in the shipped dialect. A schema
/// drift between peers shows up as a checksum failure, which is the
/// intended failure mode.
pub fn crc_extra(msg_id: u32) -> Option<u8> {
    let extra = match msg_id {
        0 => 50,
        1 => 124,
        2 => 137,
        4 => 237,
        11 => 89,
        20 => 214,
        21 => 159,
        22 => 220,
        23 => 168,
        24 => 24,
        25 => 23,
        26 => 170,
        27 => 144,
        28 => 67,
        29 => 115,
        30 => 39,
        31 => 246,
        32 => 185,
        33 => 104,
        34 => 237,
        35 => 244,
        36 => 222,
        37 => 212,
        38 => 9,
        39 => 254,
        40 => 230,
        41 => 28,
        42 => 28,
        43 => 132,
        44 => 221,
        45 => 232,
        46 => 11,
        47 => 153,
        48 => 41,
        49 => 39,
        50 => 78,
        51 => 196,
        54 => 15,
        55 => 3,
        61 => 167,
        62 => 183,
        63 => 119,
        64 => 191,
        65 => 118,
        66 => 148,
        67 => 21,
        69 => 243,
        70 => 124,
        73 => 38,
        74 => 20,
        75 => 158,
        76 => 152,
        77 => 143,
        81 => 106,
        82 => 49,
        83 => 22,
        84 => 143,
        85 => 140,
        86 => 5,
        87 => 150,
        89 => 231,
        90 => 183,
        91 => 63,
        92 => 54,
        93 => 47,
        100 => 175,
        101 => 102,
        102 => 158,
        103 => 208,
        104 => 56,
        105 => 93,
        106 => 138,
        107 => 108,
        108 => 32,
        109 => 185,
        110 => 84,
        111 => 34,
        112 => 174,
        113 => 124,
        114 => 237,
        115 => 4,
        116 => 76,
        117 => 128,
        118 => 56,
        119 => 116,
        120 => 134,
        121 => 237,
        122 => 203,
        123 => 250,
        124 => 87,
        125 => 203,
        126 => 220,
        127 => 25,
        128 => 226,
        129 => 46,
        130 => 29,
        131 => 223,
        132 => 85,
        133 => 6,
        134 => 229,
        135 => 203,
        136 => 1,
        137 => 195,
        138 => 109,
        139 => 168,
        140 => 181,
        141 => 47,
        142 => 72,
        143 => 131,
        144 => 127,
        146 => 103,
        147 => 154,
        148 => 178,
        149 => 200,
        230 => 163,
        231 => 105,
        232 => 151,
        233 => 35,
        234 => 150,
        235 => 179,
        241 => 90,
        242 => 104,
        243 => 85,
        244 => 95,
        245 => 130,
        246 => 184,
        247 => 81,
        248 => 8,
        249 => 204,
        250 => 49,
        251 => 170,
        252 => 44,
        253 => 83,
        254 => 46,
        256 => 71,
        257 => 131,
        258 => 187,
        259 => 92,
        260 => 146,
        261 => 179,
        262 => 12,
        263 => 133,
        264 => 49,
        265 => 26,
        266 => 193,
        267 => 35,
        268 => 14,
        269 => 109,
        270 => 59,
        299 => 19,
        300 => 217,
        310 => 28,
        311 => 95,
        320 => 243,
        321 => 88,
        322 => 243,
        323 => 78,
        324 => 132,
        330 => 23,
        331 => 91,
        332 => 236,
        333 => 231,
        _ => return None,
    };
    Some(extra)
}

/// Nominal (untruncated) payload length of the messages this station
/// decodes field-by-field.
pub fn nominal_len(msg_id: u32) -> Option<usize> {
    let len = match msg_id {
        msg::HEARTBEAT => 9,
        msg::SYS_STATUS => 31,
        msg::SET_MODE => 6,
        msg::GPS_RAW_INT => 30,
        msg::GLOBAL_POSITION_INT => 28,
        msg::VFR_HUD => 20,
        msg::COMMAND_LONG => 33,
        msg::BATTERY_STATUS => 36,
        _ => return None,
    };
    Some(len)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub mav_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub mavlink_version: u8,
}

impl Heartbeat {
    pub fn armed(&self) -> bool {
        self.base_mode & BASE_MODE_ARMED != 0
    }

    pub fn mode(&self) -> FlightMode {
        FlightMode::from_custom_mode(self.custom_mode)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SysStatus {
    pub voltage_battery_mv: u16,
    pub current_battery_ca: i16,
    pub battery_remaining_pct: i8,
}

impl SysStatus {
    /// Battery voltage in volts; `u16::MAX` on the wire means unknown.
    pub fn voltage_v(&self) -> Option<f32> {
        (self.voltage_battery_mv != u16::MAX).then(|| self.voltage_battery_mv as f32 / 1000.0)
    }

    /// Battery current in amps; -1 on the wire means unknown.
    pub fn current_a(&self) -> Option<f32> {
        (self.current_battery_ca != -1).then(|| self.current_battery_ca as f32 / 100.0)
    }

    pub fn remaining_pct(&self) -> Option<u8> {
        (0..=100)
            .contains(&self.battery_remaining_pct)
            .then_some(self.battery_remaining_pct as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpsRawInt {
    pub time_usec: u64,
    pub lat: i32,
    pub lon: i32,
    pub alt: i32,
    pub fix_type: u8,
    pub satellites_visible: u8,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalPositionInt {
    pub time_boot_ms: u32,
    pub lat: i32,
    pub lon: i32,
    pub alt: i32,
    pub relative_alt: i32,
    pub vx: i16,
    pub vy: i16,
    pub vz: i16,
    pub hdg: u16,
}

impl GlobalPositionInt {
    pub fn lat_deg(&self) -> f64 {
        self.lat as f64 / 1e7
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon as f64 / 1e7
    }

    pub fn alt_msl_m(&self) -> f32 {
        self.alt as f32 / 1000.0
    }

    pub fn alt_rel_m(&self) -> f32 {
        self.relative_alt as f32 / 1000.0
    }

    pub fn heading_deg(&self) -> i16 {
        (self.hdg / 100) as i16
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VfrHud {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub alt: f32,
    pub climb: f32,
    pub heading: i16,
    pub throttle: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatteryStatus {
    pub current_consumed: i32,
    pub temperature: i16,
    pub current_battery_ca: i16,
    pub id: u8,
    pub battery_remaining_pct: i8,
}

impl BatteryStatus {
    pub fn remaining_pct(&self) -> Option<u8> {
        (0..=100)
            .contains(&self.battery_remaining_pct)
            .then_some(self.battery_remaining_pct as u8)
    }
}

/// Decoded messages. Ids outside the decoded set but inside the dialect
/// table surface as `Unknown`, which consumers skip without error.
#[derive(Clone, Debug)]
pub enum MavMessage {
    Heartbeat(Heartbeat),
    SysStatus(SysStatus),
    GpsRawInt(GpsRawInt),
    GlobalPositionInt(GlobalPositionInt),
    VfrHud(VfrHud),
    BatteryStatus(BatteryStatus),
    Unknown { id: u32, bytes: Vec<u8> },
}

impl MavMessage {
    pub fn id(&self) -> u32 {
        match self {
            MavMessage::Heartbeat(_) => msg::HEARTBEAT,
            MavMessage::SysStatus(_) => msg::SYS_STATUS,
            MavMessage::GpsRawInt(_) => msg::GPS_RAW_INT,
            MavMessage::GlobalPositionInt(_) => msg::GLOBAL_POSITION_INT,
            MavMessage::VfrHud(_) => msg::VFR_HUD,
            MavMessage::BatteryStatus(_) => msg::BATTERY_STATUS,
            MavMessage::Unknown { id, .. } => *id,
        }
    }
}

/// Slice a validated payload into a typed message, zero-padding wire
/// truncation back to the nominal length first.
pub fn decode_message(msg_id: u32, payload: &[u8]) -> MavMessage {
    let Some(nominal) = nominal_len(msg_id) else {
        return MavMessage::Unknown {
            id: msg_id,
            bytes: payload.to_vec(),
        };
    };
    let mut buf = payload.to_vec();
    if buf.len() < nominal {
        buf.resize(nominal, 0);
    }
    let p = buf.as_slice();

    match msg_id {
        msg::HEARTBEAT => MavMessage::Heartbeat(Heartbeat {
            custom_mode: read_u32(p, 0),
            mav_type: p[4],
            autopilot: p[5],
            base_mode: p[6],
            system_status: p[7],
            mavlink_version: p[8],
        }),
        msg::SYS_STATUS => MavMessage::SysStatus(SysStatus {
            voltage_battery_mv: read_u16(p, 14),
            current_battery_ca: read_i16(p, 16),
            battery_remaining_pct: p[30] as i8,
        }),
        msg::GPS_RAW_INT => MavMessage::GpsRawInt(GpsRawInt {
            time_usec: read_u64(p, 0),
            lat: read_i32(p, 8),
            lon: read_i32(p, 12),
            alt: read_i32(p, 16),
            fix_type: p[28],
            satellites_visible: p[29],
        }),
        msg::GLOBAL_POSITION_INT => MavMessage::GlobalPositionInt(GlobalPositionInt {
            time_boot_ms: read_u32(p, 0),
            lat: read_i32(p, 4),
            lon: read_i32(p, 8),
            alt: read_i32(p, 12),
            relative_alt: read_i32(p, 16),
            vx: read_i16(p, 20),
            vy: read_i16(p, 22),
            vz: read_i16(p, 24),
            hdg: read_u16(p, 26),
        }),
        msg::VFR_HUD => MavMessage::VfrHud(VfrHud {
            airspeed: read_f32(p, 0),
            groundspeed: read_f32(p, 4),
            alt: read_f32(p, 8),
            climb: read_f32(p, 12),
            heading: read_i16(p, 16),
            throttle: read_u16(p, 18),
        }),
        msg::BATTERY_STATUS => MavMessage::BatteryStatus(BatteryStatus {
            current_consumed: read_i32(p, 0),
            temperature: read_i16(p, 8),
            current_battery_ca: read_i16(p, 30),
            id: p[32],
            battery_remaining_pct: p[35] as i8,
        }),
        _ => MavMessage::Unknown {
            id: msg_id,
            bytes: payload.to_vec(),
        },
    }
}

/// SET_MODE payload: `custom_mode u32, target_system u8, base_mode u8`
/// with CUSTOM_MODE_ENABLED set.
pub fn build_set_mode(target_system: u8, custom_mode: u32) -> (u32, Vec<u8>) {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&custom_mode.to_le_bytes());
    payload.push(target_system);
    payload.push(BASE_MODE_CUSTOM_ENABLED);
    (msg::SET_MODE, payload)
}

/// COMMAND_LONG payload: seven f32 params, then command/target/confirmation.
pub fn build_command_long(
    target_system: u8,
    target_component: u8,
    command: u16,
    params: [f32; 7],
) -> (u32, Vec<u8>) {
    let mut payload = Vec::with_capacity(33);
    for param in params {
        payload.extend_from_slice(&param.to_le_bytes());
    }
    payload.extend_from_slice(&command.to_le_bytes());
    payload.push(target_system);
    payload.push(target_component);
    payload.push(0); // confirmation
    (msg::COMMAND_LONG, payload)
}

/// Arm (`param1 = 1.0`) or disarm (`param1 = 0.0`) via COMMAND_LONG 400.
pub fn build_arm_disarm(target_system: u8, target_component: u8, arm: bool) -> (u32, Vec<u8>) {
    let param1 = if arm { 1.0 } else { 0.0 };
    build_command_long(
        target_system,
        target_component,
        CMD_COMPONENT_ARM_DISARM,
        [param1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    )
}

fn read_u16(p: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([p[offset], p[offset + 1]])
}

fn read_i16(p: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([p[offset], p[offset + 1]])
}

fn read_u32(p: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([p[offset], p[offset + 1], p[offset + 2], p[offset + 3]])
}

fn read_i32(p: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([p[offset], p[offset + 1], p[offset + 2], p[offset + 3]])
}

fn read_u64(p: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&p[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_f32(p: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([p[offset], p[offset + 1], p[offset + 2], p[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_crc_extras() {
        for (id, extra) in [
            (msg::HEARTBEAT, 50),
            (msg::SYS_STATUS, 124),
            (msg::GPS_RAW_INT, 24),
            (msg::GLOBAL_POSITION_INT, 104),
            (msg::SET_MODE, 89),
            (msg::COMMAND_LONG, 152),
            (msg::BATTERY_STATUS, 154),
            (msg::VFR_HUD, 20),
        ] {
            assert_eq!(crc_extra(id), Some(extra), "msg {}", id);
        }
        assert_eq!(crc_extra(0xFFF0), None);
    }

    #[test]
    fn heartbeat_decodes_mode_and_armed() {
        let mut payload = vec![0u8; 9];
        payload[..4].copy_from_slice(&9u32.to_le_bytes()); // LAND
        payload[6] = 0x81;
        let MavMessage::Heartbeat(hb) = decode_message(msg::HEARTBEAT, &payload) else {
            panic!("wrong variant");
        };
        assert!(hb.armed());
        assert_eq!(hb.mode().name(), "LAND");
    }

    #[test]
    fn truncated_payload_decodes_like_padded() {
        // GLOBAL_POSITION_INT with everything past lat/lon zero, truncated
        // on the wire after byte 12.
        let mut full = vec![0u8; 28];
        full[4..8].copy_from_slice(&473_977_420i32.to_le_bytes());
        full[8..12].copy_from_slice(&85_455_920i32.to_le_bytes());
        let truncated = &full[..12];

        let a = decode_message(msg::GLOBAL_POSITION_INT, &full);
        let b = decode_message(msg::GLOBAL_POSITION_INT, truncated);
        let (MavMessage::GlobalPositionInt(a), MavMessage::GlobalPositionInt(b)) = (a, b) else {
            panic!("wrong variant");
        };
        assert_eq!(a, b);
        assert!((a.lat_deg() - 47.397742).abs() < 1e-6);
        assert!((a.lon_deg() - 8.545592).abs() < 1e-6);
    }

    #[test]
    fn sys_status_sentinels() {
        let mut payload = vec![0u8; 31];
        payload[14..16].copy_from_slice(&u16::MAX.to_le_bytes());
        payload[16..18].copy_from_slice(&(-1i16).to_le_bytes());
        payload[30] = (-1i8) as u8;
        let MavMessage::SysStatus(status) = decode_message(msg::SYS_STATUS, &payload) else {
            panic!("wrong variant");
        };
        assert_eq!(status.voltage_v(), None);
        assert_eq!(status.current_a(), None);
        assert_eq!(status.remaining_pct(), None);
    }

    #[test]
    fn arm_command_layout() {
        let (id, payload) = build_arm_disarm(1, 1, true);
        assert_eq!(id, msg::COMMAND_LONG);
        assert_eq!(payload.len(), 33);
        assert_eq!(read_f32(&payload, 0), 1.0);
        assert_eq!(read_u16(&payload, 28), CMD_COMPONENT_ARM_DISARM);
        assert_eq!(payload[30], 1); // target_system
        assert_eq!(payload[31], 1); // target_component
        assert_eq!(payload[32], 0); // confirmation

        let (_, disarm) = build_arm_disarm(1, 1, false);
        assert_eq!(read_f32(&disarm, 0), 0.0);
    }

    #[test]
    fn set_mode_layout() {
        let (id, payload) = build_set_mode(1, 4);
        assert_eq!(id, msg::SET_MODE);
        assert_eq!(payload.len(), 6);
        assert_eq!(read_u32(&payload, 0), 4);
        assert_eq!(payload[4], 1);
        assert_eq!(payload[5], BASE_MODE_CUSTOM_ENABLED);
    }

    #[test]
    fn unknown_id_keeps_bytes() {
        let MavMessage::Unknown { id, bytes } = decode_message(30, &[1, 2, 3]) else {
            panic!("wrong variant");
        };
        assert_eq!(id, 30);
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
