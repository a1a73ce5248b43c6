// Application state shared by the command surface and the channel layer.
// Constructed once at startup and passed by handle; no process globals.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::time::Instant;

use crate::auth::AuthVerifier;
use crate::engine::EngineHandle;
use crate::hub::Hub;
use crate::manager::DroneManager;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DroneManager>,
    pub hub: Arc<Hub>,
    pub verifier: Arc<dyn AuthVerifier>,
    pub storage: Arc<dyn Storage>,
    /// Set once a permanent storage failure stops the event writer.
    pub storage_failed: Arc<AtomicBool>,
    pub engine: EngineHandle,
    /// Serves the `/health` uptime field.
    pub start_instant: Instant,
}
