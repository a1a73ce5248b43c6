// Storage collaborator interface. The core only writes rows: drone
// status mirrors, session open/close, derived events, and the startup
// offline sweep. Everything else about the schema belongs to the
// storage service.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod postgres;

pub use postgres::PgStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Busy/timeout class failures; the caller drops the write and moves on.
    #[error("transient: {0}")]
    Transient(String),
    /// Schema or connection-fatal failures; the writer stops persisting.
    #[error("permanent: {0}")]
    Permanent(String),
}

#[derive(Clone, Debug)]
pub struct DroneRow {
    pub drone_id: i64,
    pub user_id: i64,
    pub name: String,
    pub uin: String,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct DroneStatusUpdate {
    pub drone_id: i64,
    pub status: String,
    pub last_seen_ms: Option<u64>,
    pub position: Option<(f64, f64)>,
    pub altitude_m: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub user_id: i64,
    pub drone_id: i64,
    pub mission_id: Option<i64>,
    pub started_at_ms: u64,
    pub start_battery: Option<u8>,
    pub start_point: Option<(f64, f64)>,
}

#[derive(Clone, Debug)]
pub struct SessionCloseRow {
    pub session_id: Uuid,
    pub ended_at_ms: u64,
    pub flight_duration_ms: u64,
    pub end_battery: Option<u8>,
    pub battery_used: Option<u8>,
    pub end_point: Option<(f64, f64)>,
    pub max_altitude_m: f32,
    pub max_speed_mps: f32,
    pub avg_speed_mps: f32,
    pub total_distance_m: f64,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct EventRow {
    pub session_id: Uuid,
    pub user_id: i64,
    pub drone_id: i64,
    pub mission_id: Option<i64>,
    pub timestamp_ms: u64,
    pub event_type: String,
    pub point: Option<(f64, f64)>,
    pub altitude_m: Option<f32>,
    pub battery_pct: Option<u8>,
    pub speed_mps: Option<f32>,
    pub mode: Option<String>,
    pub message: String,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Startup recovery: no live links exist yet, so nothing may claim to
    /// be connected or flying.
    async fn mark_drones_offline(&self) -> Result<u64, StorageError>;

    async fn upsert_drone(&self, row: &DroneRow) -> Result<(), StorageError>;

    async fn update_drone_status(&self, update: &DroneStatusUpdate) -> Result<(), StorageError>;

    async fn insert_session(&self, row: &SessionRow) -> Result<(), StorageError>;

    async fn close_session(&self, row: &SessionCloseRow) -> Result<(), StorageError>;

    async fn insert_event(&self, row: &EventRow) -> Result<(), StorageError>;
}

/// Stand-in used when no `DATABASE_URL` is configured (SITL bench runs):
/// accepts and discards every write.
pub struct NullStorage;

#[async_trait]
impl Storage for NullStorage {
    async fn mark_drones_offline(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn upsert_drone(&self, _row: &DroneRow) -> Result<(), StorageError> {
        Ok(())
    }

    async fn update_drone_status(&self, _update: &DroneStatusUpdate) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_session(&self, _row: &SessionRow) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close_session(&self, _row: &SessionCloseRow) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_event(&self, _row: &EventRow) -> Result<(), StorageError> {
        Ok(())
    }
}
