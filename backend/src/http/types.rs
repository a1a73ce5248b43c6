// Request and response payload types for the command surface.

use serde::{Deserialize, Serialize};

use mav_core::model::FlightMode;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: &'static str,
    pub subscribers: usize,
    pub uptime_ms: u64,
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub connection_string: String,
}

#[derive(Serialize)]
pub struct ConnectResponse {
    pub drone_id: i64,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct CommandResponse {
    pub drone_id: i64,
    pub command: &'static str,
    pub ok: bool,
}

#[derive(Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
}

#[derive(Serialize)]
pub struct SetModeResponse {
    pub drone_id: i64,
    pub mode: FlightMode,
    pub ok: bool,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub uin: String,
    pub connection_string: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub drone_id: i64,
    pub uin: String,
}

#[derive(Deserialize)]
pub struct OperatorMessageRequest {
    pub message: String,
    #[serde(default)]
    pub importance: Option<String>,
    /// Absent means broadcast to every authenticated channel.
    #[serde(default)]
    pub drone_id: Option<i64>,
}

#[derive(Serialize)]
pub struct OperatorMessageResponse {
    pub sent: bool,
}
