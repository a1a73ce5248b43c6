// Subscriber hub: multiplexes the manager's event stream out to
// authenticated operator channels.
// Invariants: fan-out never holds the registry lock while pushing; a
// channel only ever sees frames its principal is allowed to see; queue
// overflow evicts the oldest droppable telemetry, never lifecycle,
// operator, or error frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use mav_core::dialect::msg;

use crate::auth::Principal;
use crate::constants::SUBSCRIBER_QUEUE_CAP;
use crate::link::LinkStatus;
use crate::manager::{LinkStatusEvent, ManagerEvent, OperatorMessage, TelemetryUpdate};
use crate::utils::now_epoch_ms;
use crate::ws::envelope;

/// One serialized frame queued for a channel. Shared between channels:
/// the payload is rendered once per event, not once per subscriber.
#[derive(Clone)]
pub struct QueuedFrame {
    pub payload: Arc<str>,
    pub droppable: bool,
}

impl QueuedFrame {
    pub fn new(payload: String, droppable: bool) -> Self {
        Self {
            payload: payload.into(),
            droppable,
        }
    }
}

pub struct SubscriberChannel {
    pub id: u64,
    pub opened_at_ms: u64,
    principal: Mutex<Option<Principal>>,
    queue: Mutex<VecDeque<QueuedFrame>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberChannel {
    fn new(id: u64) -> Self {
        Self {
            id,
            opened_at_ms: now_epoch_ms(),
            principal: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn authenticate(&self, principal: Principal) {
        *self.principal.lock().unwrap() = Some(principal);
    }

    pub fn principal(&self) -> Option<Principal> {
        *self.principal.lock().unwrap()
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal().is_some()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Bounded ring push. At capacity the oldest droppable frame gives
    /// way; frames that must not be lost may grow the queue past the cap.
    pub fn push(&self, frame: QueuedFrame) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= SUBSCRIBER_QUEUE_CAP {
                if let Some(position) = queue.iter().position(|queued| queued.droppable) {
                    queue.remove(position);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                } else if frame.droppable {
                    // Queue full of must-keep frames; the new telemetry
                    // frame is the one to lose.
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Next frame in production order; `None` once the channel is closed
    /// and drained.
    pub async fn pop(&self) -> Option<QueuedFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[derive(Default)]
pub struct Hub {
    channels: RwLock<Vec<Arc<SubscriberChannel>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<SubscriberChannel> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Arc::new(SubscriberChannel::new(id));
        self.channels.write().unwrap().push(channel.clone());
        info!(channel = id, "subscriber channel opened");
        channel
    }

    pub fn remove(&self, id: u64) {
        let mut channels = self.channels.write().unwrap();
        if let Some(position) = channels.iter().position(|channel| channel.id == id) {
            let channel = channels.swap_remove(position);
            channel.close();
            info!(
                channel = id,
                dropped = channel.dropped_frames(),
                "subscriber channel closed"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<SubscriberChannel>> {
        self.channels.read().unwrap().clone()
    }

    /// Fan one manager event out to every channel its filter admits.
    pub fn dispatch(&self, event: &ManagerEvent) {
        match event {
            ManagerEvent::Telemetry(update) => self.dispatch_telemetry(update),
            ManagerEvent::Link(status) => self.dispatch_link(status),
            ManagerEvent::Operator(message) => self.dispatch_operator(message),
        }
    }

    fn dispatch_telemetry(&self, update: &TelemetryUpdate) {
        let frames = telemetry_frames(update);
        if frames.is_empty() {
            return;
        }
        for channel in self.snapshot() {
            let Some(principal) = channel.principal() else {
                continue;
            };
            if principal.is_admin || principal.user_id == update.user_id {
                for frame in &frames {
                    channel.push(frame.clone());
                }
            }
        }
    }

    fn dispatch_link(&self, status: &LinkStatusEvent) {
        let frame = link_frame(status);
        for channel in self.snapshot() {
            let Some(principal) = channel.principal() else {
                continue;
            };
            if principal.is_admin || principal.user_id == status.user_id {
                channel.push(frame.clone());
            }
        }
    }

    fn dispatch_operator(&self, message: &OperatorMessage) {
        let frame = QueuedFrame::new(
            envelope(
                "message",
                json!({
                    "message": message.message,
                    "importance": message.importance,
                    "sender": message.sender,
                }),
            ),
            false,
        );
        for channel in self.snapshot() {
            let Some(principal) = channel.principal() else {
                continue;
            };
            match message.recipient {
                None => channel.push(frame.clone()),
                Some(recipient) if principal.user_id == recipient => {
                    channel.push(frame.clone())
                }
                Some(_) => {}
            }
        }
    }
}

fn telemetry_frames(update: &TelemetryUpdate) -> Vec<QueuedFrame> {
    let snapshot = &update.snapshot;
    let mut frames = Vec::with_capacity(2);
    match update.msg_id {
        msg::HEARTBEAT => {
            frames.push(QueuedFrame::new(
                envelope(
                    "heartbeat",
                    json!({
                        "drone_id": update.drone_id,
                        "name": update.name,
                        "armed": snapshot.armed,
                        "mode": snapshot.mode,
                    }),
                ),
                true,
            ));
            frames.push(QueuedFrame::new(
                envelope(
                    "telemetry",
                    json!({
                        "drone_id": update.drone_id,
                        "name": update.name,
                        "uin": update.uin,
                        "snapshot": snapshot,
                    }),
                ),
                true,
            ));
        }
        msg::GLOBAL_POSITION_INT => frames.push(QueuedFrame::new(
            envelope(
                "position",
                json!({
                    "drone_id": update.drone_id,
                    "lat": snapshot.lat,
                    "lon": snapshot.lon,
                    "alt_msl_m": snapshot.alt_msl_m,
                    "alt_rel_m": snapshot.alt_rel_m,
                    "heading_deg": snapshot.heading_deg,
                }),
            ),
            true,
        )),
        msg::VFR_HUD => frames.push(QueuedFrame::new(
            envelope(
                "telemetry",
                json!({
                    "drone_id": update.drone_id,
                    "name": update.name,
                    "uin": update.uin,
                    "snapshot": snapshot,
                }),
            ),
            true,
        )),
        msg::SYS_STATUS | msg::BATTERY_STATUS => frames.push(QueuedFrame::new(
            envelope(
                "battery",
                json!({
                    "drone_id": update.drone_id,
                    "battery_pct": snapshot.battery_pct,
                    "voltage_v": snapshot.voltage_v,
                    "current_a": snapshot.current_a,
                }),
            ),
            true,
        )),
        msg::GPS_RAW_INT => frames.push(QueuedFrame::new(
            envelope(
                "gps",
                json!({
                    "drone_id": update.drone_id,
                    "satellites": snapshot.satellites,
                }),
            ),
            true,
        )),
        _ => {}
    }
    frames
}

fn link_frame(status: &LinkStatusEvent) -> QueuedFrame {
    let (kind, message) = match status.status {
        LinkStatus::Connected => ("connected", format!("{} connected", status.name)),
        LinkStatus::Disconnected => (
            "disconnected",
            match status.detail.as_deref() {
                Some(detail) => format!("{} disconnected: {}", status.name, detail),
                None => format!("{} disconnected", status.name),
            },
        ),
        _ => ("status", format!("{} {:?}", status.name, status.status)),
    };
    QueuedFrame::new(
        envelope(
            kind,
            json!({
                "drone_id": status.drone_id,
                "name": status.name,
                "status": status.status,
                "message": message,
            }),
        ),
        false,
    )
}

/// Fan-out task: the hub's single consumer of the manager stream.
pub fn spawn_fanout(hub: Arc<Hub>, mut events: broadcast::Receiver<ManagerEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => hub.dispatch(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hub fan-out lagged behind telemetry");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("manager event stream closed, fan-out stopping");
                    break;
                }
            }
        }
    });
}
