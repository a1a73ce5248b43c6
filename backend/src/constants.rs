// Shared constants for server timing, transport, and queue limits.

pub const DEFAULT_PORT: u16 = 5000;
pub const WS_PATH: &str = "/ws/drone";

pub const RECV_BUFFER_LEN: usize = 4096;
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 10;
pub const WATCHDOG_TICK_MS: u64 = 1_000;
pub const RECONNECT_BACKOFF_SECS: u64 = 5;

pub const SUBSCRIBER_QUEUE_CAP: usize = 1024;
pub const MANAGER_EVENT_CAP: usize = 256;

/// Framing-error log lines are throttled to one per window.
pub const FRAMING_LOG_WINDOW_MS: u64 = 10_000;
/// Drone row mirror writes are throttled per drone.
pub const DRONE_ROW_WRITE_INTERVAL_MS: u64 = 1_000;

/// Identity stamped on operator broadcast envelopes sent by the server.
pub const SERVER_SENDER_NAME: &str = "ground-station";
