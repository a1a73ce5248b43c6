// Error kinds raised by the core, with their stable operator-facing
// texts and request-surface status mapping.

use axum::http::StatusCode;
use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("framing error: {0}")]
    Framing(#[from] mav_core::frame::FramingError),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("failed to bind {0}")]
    BindFailed(String),

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("peer address unknown, no frame received yet")]
    PeerUnknown,

    #[error("drone is not connected")]
    NotConnected,

    #[error("authentication required")]
    NotAuthenticated,

    #[error("uin already registered: {0}")]
    UinConflict(String),

    #[error("unknown flight mode: {0}")]
    UnknownMode(String),

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("drone not found")]
    DroneNotFound,

    #[error("transient storage failure: {0}")]
    StorageTransient(String),

    #[error("permanent storage failure: {0}")]
    StoragePermanent(String),

    #[error("subscriber queue overflow")]
    SubscriberBackpressure,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Request-surface mapping: validation 400, auth 401, missing 404,
    /// conflicts 409, everything else 500.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::InvalidConnectionString(_) | CoreError::UnknownMode(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            CoreError::DroneNotFound => StatusCode::NOT_FOUND,
            CoreError::UinConflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(message) => CoreError::StorageTransient(message),
            StorageError::Permanent(message) => CoreError::StoragePermanent(message),
        }
    }
}
