// SkyLink ground-station backend: MAVLink vehicle links in, operator
// channels out.

use std::env;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use skylink_gcs_server::app::AppState;
use skylink_gcs_server::auth::JwtVerifier;
use skylink_gcs_server::constants::DEFAULT_PORT;
use skylink_gcs_server::engine;
use skylink_gcs_server::http;
use skylink_gcs_server::hub::{self, Hub};
use skylink_gcs_server::link::Endpoint;
use skylink_gcs_server::manager::DroneManager;
use skylink_gcs_server::storage::{DroneRow, NullStorage, PgStorage, Storage};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .expect("invalid PORT");

    let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("JWT_SECRET not set, using development secret");
        "dev-secret".to_string()
    });

    let storage: Arc<dyn Storage> = match env::var("DATABASE_URL") {
        Ok(url) => match PgStorage::connect(&url).await {
            Ok(storage) => Arc::new(storage),
            Err(err) => {
                // Telemetry must flow even without a healthy database.
                warn!(?err, "storage unavailable, persistence disabled");
                Arc::new(NullStorage)
            }
        },
        Err(_) => {
            warn!("DATABASE_URL not set, persistence disabled");
            Arc::new(NullStorage)
        }
    };

    // Startup recovery: no live links exist yet.
    match storage.mark_drones_offline().await {
        Ok(swept) if swept > 0 => info!(swept, "stale drone rows marked offline"),
        Ok(_) => {}
        Err(err) => warn!(?err, "offline sweep failed"),
    }

    let manager = Arc::new(DroneManager::new());
    let hub = Arc::new(Hub::new());
    let storage_failed = Arc::new(AtomicBool::new(false));

    hub::spawn_fanout(hub.clone(), manager.subscribe());
    let engine_handle =
        engine::spawn_engine(manager.subscribe(), storage.clone(), storage_failed.clone());

    if let Ok(connection) = env::var("SITL_CONNECTION") {
        match Endpoint::parse(&connection) {
            Ok(endpoint) => {
                autoconnect_sitl(&manager, storage.as_ref(), endpoint).await;
            }
            Err(err) => warn!(%connection, %err, "invalid SITL_CONNECTION"),
        }
    }

    let app_state = AppState {
        manager,
        hub,
        verifier: Arc::new(JwtVerifier::new(jwt_secret.into_bytes())),
        storage,
        storage_failed,
        engine: engine_handle,
        start_instant: Instant::now(),
    };

    let app = http::router(app_state);

    info!(%addr, "starting server");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .expect("server failed");
}

/// Default bench vehicle: registered to the first admin principal and
/// connected immediately so a local SITL shows up without any API calls.
async fn autoconnect_sitl(manager: &DroneManager, storage: &dyn Storage, endpoint: Endpoint) {
    const SITL_OWNER: i64 = 1;
    const SITL_UIN: &str = "SITL-LOCAL";

    let drone_id = match manager
        .register(SITL_OWNER, "SITL", SITL_UIN, endpoint.clone())
        .await
    {
        Ok(drone_id) => drone_id,
        Err(err) => {
            warn!(%err, "sitl registration failed");
            return;
        }
    };
    if let Err(err) = storage
        .upsert_drone(&DroneRow {
            drone_id,
            user_id: SITL_OWNER,
            name: "SITL".to_string(),
            uin: SITL_UIN.to_string(),
            status: "registered".to_string(),
        })
        .await
    {
        warn!(%err, "sitl row write failed");
    }
    match manager.connect(drone_id).await {
        Ok(()) => info!(drone_id, %endpoint, "sitl auto-connect started"),
        Err(err) => warn!(%err, "sitl auto-connect failed"),
    }
}
