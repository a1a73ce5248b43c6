// HTTP handlers and routing for the command surface. Every handler
// authenticates through the auth collaborator and funnels into the same
// manager operations as the channel vocabulary.

use axum::extract::State as AxumState;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::warn;

use crate::app::AppState;
use crate::auth::Principal;
use crate::constants::WS_PATH;
use crate::error::CoreError;
use crate::link::Endpoint;
use crate::manager::{DroneSummary, Importance, OperatorTarget};
use crate::utils::monotonic_ms;
use crate::ws::ws_handler;

mod types;
use types::*;

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/drone/connect", post(connect_drone))
        .route("/drone/disconnect", post(disconnect_drone))
        .route("/drone/status", get(drone_status))
        .route("/drone/arm", post(arm_drone))
        .route("/drone/disarm", post(disarm_drone))
        .route("/drone/set-mode", post(set_mode))
        .route("/user/drone/register", post(register_drone))
        .route("/user/drone/disconnect", post(disconnect_drone))
        .route("/admin/drones", get(admin_list_drones))
        .route("/admin/message/send", post(admin_send_message))
        .route(WS_PATH, get(ws_handler))
        .with_state(app_state)
}

/// Error body carrying the stable text for the kind.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn authenticate(app_state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError(CoreError::NotAuthenticated))?;
    app_state
        .verifier
        .verify(bearer)
        .await
        .map_err(|_| ApiError(CoreError::NotAuthenticated))
}

async fn require_admin(app_state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let principal = authenticate(app_state, headers).await?;
    if !principal.is_admin {
        return Err(ApiError(CoreError::NotAuthenticated));
    }
    Ok(principal)
}

async fn owned_drone(app_state: &AppState, principal: Principal) -> Result<i64, ApiError> {
    app_state
        .manager
        .resolve_by_owner(principal.user_id)
        .await
        .ok_or(ApiError(CoreError::DroneNotFound))
}

async fn health(AxumState(app_state): AxumState<AppState>) -> impl IntoResponse {
    let storage = if app_state.storage_failed.load(Ordering::Relaxed) {
        "failed"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: "ok",
        storage,
        subscribers: app_state.hub.subscriber_count(),
        uptime_ms: monotonic_ms(app_state.start_instant),
    })
}

async fn connect_drone(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let endpoint = Endpoint::parse(&request.connection_string)?;
    let drone_id = app_state
        .manager
        .connect_for_user(principal.user_id, endpoint)
        .await?;
    Ok(Json(ConnectResponse {
        drone_id,
        status: "connecting",
    }))
}

async fn disconnect_drone(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
) -> Result<Json<CommandResponse>, ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let drone_id = owned_drone(&app_state, principal).await?;
    app_state.manager.disconnect(drone_id).await?;
    Ok(Json(CommandResponse {
        drone_id,
        command: "disconnect",
        ok: true,
    }))
}

async fn drone_status(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
) -> Result<Json<DroneSummary>, ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let drone_id = owned_drone(&app_state, principal).await?;
    let summary = app_state.manager.summary(drone_id).await?;
    Ok(Json(summary))
}

async fn arm_drone(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
) -> Result<Json<CommandResponse>, ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let drone_id = owned_drone(&app_state, principal).await?;
    app_state.manager.arm(drone_id).await?;
    Ok(Json(CommandResponse {
        drone_id,
        command: "arm",
        ok: true,
    }))
}

async fn disarm_drone(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
) -> Result<Json<CommandResponse>, ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let drone_id = owned_drone(&app_state, principal).await?;
    app_state.manager.disarm(drone_id).await?;
    Ok(Json(CommandResponse {
        drone_id,
        command: "disarm",
        ok: true,
    }))
}

async fn set_mode(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetModeRequest>,
) -> Result<Json<SetModeResponse>, ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let drone_id = owned_drone(&app_state, principal).await?;
    let mode = app_state.manager.set_mode(drone_id, &request.mode).await?;
    Ok(Json(SetModeResponse {
        drone_id,
        mode,
        ok: true,
    }))
}

async fn register_drone(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let principal = authenticate(&app_state, &headers).await?;
    let endpoint = Endpoint::parse(&request.connection_string)?;
    let drone_id = app_state
        .manager
        .register(principal.user_id, &request.name, &request.uin, endpoint)
        .await?;
    if let Err(err) = app_state
        .storage
        .upsert_drone(&crate::storage::DroneRow {
            drone_id,
            user_id: principal.user_id,
            name: request.name.clone(),
            uin: request.uin.clone(),
            status: "registered".to_string(),
        })
        .await
    {
        // Registration stands; the row write follows the usual drop policy.
        warn!(drone_id, %err, "drone row write failed");
    }
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            drone_id,
            uin: request.uin,
        }),
    ))
}

async fn admin_list_drones(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DroneSummary>>, ApiError> {
    require_admin(&app_state, &headers).await?;
    Ok(Json(app_state.manager.list().await))
}

async fn admin_send_message(
    AxumState(app_state): AxumState<AppState>,
    headers: HeaderMap,
    Json(request): Json<OperatorMessageRequest>,
) -> Result<Json<OperatorMessageResponse>, ApiError> {
    require_admin(&app_state, &headers).await?;
    let importance = Importance::parse(request.importance.as_deref().unwrap_or("normal"));
    let target = match request.drone_id {
        Some(drone_id) => OperatorTarget::Drone(drone_id),
        None => OperatorTarget::AllConnected,
    };
    app_state
        .manager
        .send_operator_message(&request.message, importance, target)
        .await?;
    Ok(Json(OperatorMessageResponse { sent: true }))
}
