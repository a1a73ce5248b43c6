// WebSocket transport layer for the operator channel.
// Invariants: an unauthenticated channel only ever sees the requires-auth
// banner and answers to `auth`; replies and fan-out share one queue so
// per-channel ordering holds.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State as AxumState;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::Principal;
use crate::error::CoreError;
use crate::hub::{QueuedFrame, SubscriberChannel};
use crate::link::Endpoint;
use crate::manager::DroneManager;
use crate::utils::now_epoch_ms;

/// Channel envelope: `{ "type": ..., "data": ..., "timestamp": ms }`.
pub fn envelope(kind: &str, data: serde_json::Value) -> String {
    json!({
        "type": kind,
        "data": data,
        "timestamp": now_epoch_ms(),
    })
    .to_string()
}

#[derive(Deserialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct AuthData {
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    is_admin: Option<bool>,
    bearer: String,
}

#[derive(Deserialize)]
struct ConnectData {
    connection_string: String,
}

#[derive(Deserialize)]
struct SetModeData {
    mode: String,
}

pub async fn ws_handler(
    AxumState(app_state): AxumState<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let channel = app_state.hub.register();
    channel.push(QueuedFrame::new(
        envelope("status", json!({ "requires_auth": true })),
        false,
    ));

    let (mut sender, mut receiver) = socket.split();

    // Dispatcher: drains the channel queue in production order.
    let dispatcher_channel = channel.clone();
    let dispatcher = tokio::spawn(async move {
        while let Some(frame) = dispatcher_channel.pop().await {
            if sender
                .send(Message::Text(frame.payload.to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(inbound) = receiver.next().await {
        match inbound {
            Ok(Message::Text(text)) => {
                handle_client_message(&app_state, &channel, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(channel = channel.id, ?err, "ws error");
                break;
            }
        }
    }

    app_state.hub.remove(channel.id);
    dispatcher.abort();
    info!(channel = channel.id, "ws disconnected");
}

async fn handle_client_message(app_state: &AppState, channel: &SubscriberChannel, text: &str) {
    let Ok(inbound) = serde_json::from_str::<Inbound>(text) else {
        push_error(channel, "malformed message");
        return;
    };

    if inbound.kind == "ping" {
        channel.push(QueuedFrame::new(envelope("pong", json!({})), false));
        return;
    }

    if inbound.kind == "auth" {
        handle_auth(app_state, channel, inbound.data).await;
        return;
    }

    let Some(principal) = channel.principal() else {
        push_error(channel, "authentication required");
        return;
    };

    let result = match inbound.kind.as_str() {
        "connect" => handle_connect(&app_state.manager, principal, inbound.data).await,
        "disconnect" => match owned_drone(&app_state.manager, principal).await {
            Ok(drone_id) => app_state.manager.disconnect(drone_id).await.map(|_| {
                envelope(
                    "status",
                    json!({ "drone_id": drone_id, "command": "disconnect" }),
                )
            }),
            Err(err) => Err(err),
        },
        "arm" => match owned_drone(&app_state.manager, principal).await {
            Ok(drone_id) => app_state
                .manager
                .arm(drone_id)
                .await
                .map(|_| envelope("status", json!({ "drone_id": drone_id, "command": "arm" }))),
            Err(err) => Err(err),
        },
        "disarm" => match owned_drone(&app_state.manager, principal).await {
            Ok(drone_id) => app_state.manager.disarm(drone_id).await.map(|_| {
                envelope("status", json!({ "drone_id": drone_id, "command": "disarm" }))
            }),
            Err(err) => Err(err),
        },
        "set_mode" => match serde_json::from_value::<SetModeData>(inbound.data) {
            Ok(data) => match owned_drone(&app_state.manager, principal).await {
                Ok(drone_id) => app_state
                    .manager
                    .set_mode(drone_id, &data.mode)
                    .await
                    .map(|mode| {
                        envelope(
                            "status",
                            json!({ "drone_id": drone_id, "command": "set_mode", "mode": mode }),
                        )
                    }),
                Err(err) => Err(err),
            },
            Err(_) => {
                push_error(channel, "malformed set_mode message");
                return;
            }
        },
        other => {
            push_error(channel, &format!("unknown message type: {}", other));
            return;
        }
    };

    match result {
        Ok(reply) => channel.push(QueuedFrame::new(reply, false)),
        Err(err) => push_error(channel, &err.to_string()),
    }
}

async fn handle_auth(app_state: &AppState, channel: &SubscriberChannel, data: serde_json::Value) {
    let Ok(auth) = serde_json::from_value::<AuthData>(data) else {
        push_error(channel, "malformed auth message");
        return;
    };
    match app_state.verifier.verify(&auth.bearer).await {
        Ok(principal) => {
            // The bearer is authoritative; a mismatched claim is an error,
            // not an escalation.
            if auth.user_id.is_some_and(|claimed| claimed != principal.user_id)
                || auth.is_admin.is_some_and(|claimed| claimed && !principal.is_admin)
            {
                push_error(channel, "authentication required");
                return;
            }
            channel.authenticate(principal);
            info!(
                channel = channel.id,
                user_id = principal.user_id,
                is_admin = principal.is_admin,
                "channel authenticated"
            );
            channel.push(QueuedFrame::new(
                envelope(
                    "status",
                    json!({
                        "authenticated": true,
                        "user_id": principal.user_id,
                        "is_admin": principal.is_admin,
                    }),
                ),
                false,
            ));
        }
        Err(err) => {
            warn!(channel = channel.id, %err, "channel auth failed");
            push_error(channel, "authentication required");
        }
    }
}

async fn handle_connect(
    manager: &DroneManager,
    principal: Principal,
    data: serde_json::Value,
) -> Result<String, CoreError> {
    let data: ConnectData = serde_json::from_value(data)
        .map_err(|_| CoreError::InvalidConnectionString(String::new()))?;
    let endpoint = Endpoint::parse(&data.connection_string)?;
    let drone_id = manager.connect_for_user(principal.user_id, endpoint).await?;
    Ok(envelope(
        "status",
        json!({ "drone_id": drone_id, "command": "connect", "connecting": true }),
    ))
}

async fn owned_drone(manager: &DroneManager, principal: Principal) -> Result<i64, CoreError> {
    manager
        .resolve_by_owner(principal.user_id)
        .await
        .ok_or(CoreError::DroneNotFound)
}

fn push_error(channel: &SubscriberChannel, message: &str) {
    channel.push(QueuedFrame::new(
        envelope("error", json!({ "message": message })),
        false,
    ));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::auth::testing::mint;
    use crate::auth::JwtVerifier;
    use crate::engine;
    use crate::hub::Hub;
    use crate::storage::{NullStorage, Storage};

    const SECRET: &[u8] = b"ws-test-secret";

    fn test_state() -> AppState {
        let manager = Arc::new(DroneManager::new());
        let hub = Arc::new(Hub::new());
        let storage: Arc<dyn Storage> = Arc::new(NullStorage);
        let storage_failed = Arc::new(AtomicBool::new(false));
        let engine =
            engine::spawn_engine(manager.subscribe(), storage.clone(), storage_failed.clone());
        AppState {
            manager,
            hub,
            verifier: Arc::new(JwtVerifier::new(SECRET)),
            storage,
            storage_failed,
            engine,
            start_instant: Instant::now(),
        }
    }

    async fn next_payload(channel: &SubscriberChannel) -> serde_json::Value {
        let frame = channel.pop().await.expect("expected a frame");
        serde_json::from_str(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn commands_require_authentication() {
        let app_state = test_state();
        let channel = app_state.hub.register();

        handle_client_message(&app_state, &channel, r#"{"type":"arm"}"#).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["message"], "authentication required");
    }

    #[tokio::test]
    async fn ping_answers_before_auth() {
        let app_state = test_state();
        let channel = app_state.hub.register();

        handle_client_message(&app_state, &channel, r#"{"type":"ping"}"#).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "pong");
    }

    #[tokio::test]
    async fn auth_then_command_flow() {
        let app_state = test_state();
        let channel = app_state.hub.register();

        let bearer = mint(SECRET, 7, false, None);
        let auth = serde_json::json!({ "type": "auth", "data": { "bearer": bearer } });
        handle_client_message(&app_state, &channel, &auth.to_string()).await;

        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "status");
        assert_eq!(reply["data"]["authenticated"], true);
        assert_eq!(reply["data"]["user_id"], 7);
        assert!(channel.is_authenticated());

        // Authenticated, but user 7 owns no drone yet.
        handle_client_message(&app_state, &channel, r#"{"type":"arm"}"#).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["message"], "drone not found");
    }

    #[tokio::test]
    async fn bad_bearer_is_rejected() {
        let app_state = test_state();
        let channel = app_state.hub.register();

        let auth = serde_json::json!({ "type": "auth", "data": { "bearer": "junk" } });
        handle_client_message(&app_state, &channel, &auth.to_string()).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "error");
        assert!(!channel.is_authenticated());
    }

    #[tokio::test]
    async fn mismatched_claim_is_rejected() {
        let app_state = test_state();
        let channel = app_state.hub.register();

        let bearer = mint(SECRET, 7, false, None);
        let auth = serde_json::json!({
            "type": "auth",
            "data": { "user_id": 8, "bearer": bearer },
        });
        handle_client_message(&app_state, &channel, &auth.to_string()).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "error");
        assert!(!channel.is_authenticated());
    }

    #[tokio::test]
    async fn connect_validates_the_connection_string() {
        let app_state = test_state();
        let channel = app_state.hub.register();
        channel.authenticate(crate::auth::Principal {
            user_id: 7,
            is_admin: false,
        });

        let message = serde_json::json!({
            "type": "connect",
            "data": { "connection_string": "serial:/dev/ttyUSB0:57600" },
        });
        handle_client_message(&app_state, &channel, &message.to_string()).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["data"]["message"]
            .as_str()
            .unwrap()
            .contains("invalid connection string"));
    }

    #[tokio::test]
    async fn unknown_types_get_an_error_frame() {
        let app_state = test_state();
        let channel = app_state.hub.register();
        channel.authenticate(crate::auth::Principal {
            user_id: 7,
            is_admin: false,
        });
        handle_client_message(&app_state, &channel, r#"{"type":"warp"}"#).await;
        let reply = next_payload(&channel).await;
        assert_eq!(reply["type"], "error");
    }
}
