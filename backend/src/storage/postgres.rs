// sqlx-backed storage collaborator. Plain bind queries only; the schema
// is owned by the storage service and treated as opaque rows here.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{
    DroneRow, DroneStatusUpdate, EventRow, SessionCloseRow, SessionRow, Storage, StorageError,
};

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(classify)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Busy/timeout failures are retried-or-dropped by callers; anything
/// schema- or connection-fatal is permanent.
fn classify(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
            StorageError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default();
            if code.starts_with("40") || code.starts_with("55") || code.starts_with("57") {
                StorageError::Transient(err.to_string())
            } else {
                StorageError::Permanent(err.to_string())
            }
        }
        _ => StorageError::Permanent(err.to_string()),
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn mark_drones_offline(&self) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE drones SET status = 'offline' WHERE status IN ('connected', 'flying')",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn upsert_drone(&self, row: &DroneRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO drones (id, user_id, name, uin, status) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET name = $3, status = $5",
        )
        .bind(row.drone_id)
        .bind(row.user_id)
        .bind(&row.name)
        .bind(&row.uin)
        .bind(&row.status)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn update_drone_status(&self, update: &DroneStatusUpdate) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE drones SET status = $2, last_seen = $3, lat = $4, lon = $5, alt = $6 \
             WHERE id = $1",
        )
        .bind(update.drone_id)
        .bind(&update.status)
        .bind(update.last_seen_ms.map(|ms| ms as i64))
        .bind(update.position.map(|(lat, _)| lat))
        .bind(update.position.map(|(_, lon)| lon))
        .bind(update.altitude_m.map(f64::from))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn insert_session(&self, row: &SessionRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO drone_sessions \
             (session_id, user_id, drone_id, mission_id, started_at, start_battery, \
              start_lat, start_lon, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active')",
        )
        .bind(row.session_id)
        .bind(row.user_id)
        .bind(row.drone_id)
        .bind(row.mission_id)
        .bind(row.started_at_ms as i64)
        .bind(row.start_battery.map(i16::from))
        .bind(row.start_point.map(|(lat, _)| lat))
        .bind(row.start_point.map(|(_, lon)| lon))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn close_session(&self, row: &SessionCloseRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE drone_sessions SET \
             ended_at = $2, flight_duration = $3, end_battery = $4, battery_used = $5, \
             end_lat = $6, end_lon = $7, max_altitude = $8, max_speed = $9, \
             avg_speed = $10, total_distance = $11, status = $12 \
             WHERE session_id = $1",
        )
        .bind(row.session_id)
        .bind(row.ended_at_ms as i64)
        .bind(row.flight_duration_ms as i64)
        .bind(row.end_battery.map(i16::from))
        .bind(row.battery_used.map(i16::from))
        .bind(row.end_point.map(|(lat, _)| lat))
        .bind(row.end_point.map(|(_, lon)| lon))
        .bind(f64::from(row.max_altitude_m))
        .bind(f64::from(row.max_speed_mps))
        .bind(f64::from(row.avg_speed_mps))
        .bind(row.total_distance_m)
        .bind(&row.status)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn insert_event(&self, row: &EventRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO drone_events \
             (session_id, user_id, drone_id, mission_id, timestamp, event_type, \
              lat, lon, altitude, battery, speed, mode, message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(row.session_id)
        .bind(row.user_id)
        .bind(row.drone_id)
        .bind(row.mission_id)
        .bind(row.timestamp_ms as i64)
        .bind(&row.event_type)
        .bind(row.point.map(|(lat, _)| lat))
        .bind(row.point.map(|(_, lon)| lon))
        .bind(row.altitude_m.map(f64::from))
        .bind(row.battery_pct.map(i16::from))
        .bind(row.speed_mps.map(f64::from))
        .bind(&row.mode)
        .bind(&row.message)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}
