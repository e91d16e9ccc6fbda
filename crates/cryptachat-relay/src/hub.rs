//! The delivery hub.
//!
//! One control loop owns the `UserId -> Connection` map and processes
//! registrations, unregistrations and push jobs strictly one at a time.
//! Everything else talks to it through a [`HubHandle`].
//!
//! ## Usage
//!
//! ```ignore
//! let (hub, handle) = Hub::new(HubConfig::default());
//! tokio::spawn(hub.run());
//!
//! // from a request handler, after the message is stored:
//! handle.submit(recipient_id, OutboundFrame::Message(record));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, ConnectionId, ConnectionKey};
use crate::error::RelayError;
use crate::frame::{OutboundFrame, UserId};
use crate::metrics;

/// Default capacity of the hub's push job queue.
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 1024;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the push job queue. Submissions beyond it are dropped.
    pub job_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            job_queue_capacity: DEFAULT_JOB_QUEUE_CAPACITY,
        }
    }
}

/// Why a push did not reach a client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No connection registered for the user.
    Offline,
    /// The user's outbound queue was full; the user was disconnected.
    QueueFull,
    /// The connection's write pump had already gone away.
    QueueClosed,
    /// The frame could not be encoded.
    SerializeFailed,
    /// The hub's own job queue was full.
    HubSaturated,
    /// The hub loop is no longer running.
    HubStopped,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Offline => "offline",
            DropReason::QueueFull => "queue_full",
            DropReason::QueueClosed => "queue_closed",
            DropReason::SerializeFailed => "serialize_failed",
            DropReason::HubSaturated => "hub_saturated",
            DropReason::HubStopped => "hub_stopped",
        }
    }
}

/// Delivery counters for one hub.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    dropped_offline: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_queue_closed: AtomicU64,
    dropped_serialize_failed: AtomicU64,
    dropped_hub_saturated: AtomicU64,
    dropped_hub_stopped: AtomicU64,
    registered: AtomicU64,
    superseded: AtomicU64,
    unregistered: AtomicU64,
}

impl DeliveryStats {
    fn record_delivered(&self, frame: &OutboundFrame) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::record_delivered(frame.kind());
    }

    fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Offline => &self.dropped_offline,
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::QueueClosed => &self.dropped_queue_closed,
            DropReason::SerializeFailed => &self.dropped_serialize_failed,
            DropReason::HubSaturated => &self.dropped_hub_saturated,
            DropReason::HubStopped => &self.dropped_hub_stopped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_drop(reason.as_str());
    }

    /// Take a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_offline: self.dropped_offline.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_queue_closed: self.dropped_queue_closed.load(Ordering::Relaxed),
            dropped_serialize_failed: self.dropped_serialize_failed.load(Ordering::Relaxed),
            dropped_hub_saturated: self.dropped_hub_saturated.load(Ordering::Relaxed),
            dropped_hub_stopped: self.dropped_hub_stopped.load(Ordering::Relaxed),
            registered: self.registered.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub dropped_offline: u64,
    pub dropped_queue_full: u64,
    pub dropped_queue_closed: u64,
    pub dropped_serialize_failed: u64,
    pub dropped_hub_saturated: u64,
    pub dropped_hub_stopped: u64,
    pub registered: u64,
    pub superseded: u64,
    pub unregistered: u64,
}

struct Registration {
    connection: Connection,
    ack: oneshot::Sender<()>,
}

/// One payload for one user, consumed once by the control loop.
struct PushJob {
    user_id: UserId,
    frame: OutboundFrame,
}

/// Cloneable entry point to a running hub.
///
/// The hub loop stops once every handle has been dropped.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::UnboundedSender<Registration>,
    unregister_tx: mpsc::UnboundedSender<ConnectionKey>,
    push_tx: mpsc::Sender<PushJob>,
    presence: Arc<DashMap<UserId, ConnectionId>>,
    stats: Arc<DeliveryStats>,
}

impl HubHandle {
    /// Register a connection, superseding any existing one for the same user.
    ///
    /// Resolves once the control loop has inserted it.
    pub async fn register(&self, connection: Connection) -> Result<(), RelayError> {
        let (ack, registered) = oneshot::channel();
        self.register_tx
            .send(Registration { connection, ack })
            .map_err(|_| RelayError::HubStopped)?;
        registered.await.map_err(|_| RelayError::HubStopped)
    }

    /// Unregister one exact connection instance.
    ///
    /// A no-op if that instance was already removed or superseded.
    pub fn unregister(&self, key: ConnectionKey) {
        if self.unregister_tx.send(key).is_err() {
            debug!(user_id = key.user_id, "Hub stopped, unregister ignored");
        }
    }

    /// Queue a frame for delivery to `user_id`. Never blocks.
    ///
    /// If the hub's job queue is full the frame is dropped; the message log
    /// still has it.
    pub fn submit(&self, user_id: UserId, frame: impl Into<OutboundFrame>) {
        let job = PushJob {
            user_id,
            frame: frame.into(),
        };
        match self.push_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(
                    user_id,
                    kind = job.frame.kind(),
                    "Hub job queue full, dropping push"
                );
                self.stats.record_drop(DropReason::HubSaturated);
            }
            Err(TrySendError::Closed(job)) => {
                warn!(
                    user_id,
                    kind = job.frame.kind(),
                    "Hub not running, dropping push"
                );
                self.stats.record_drop(DropReason::HubStopped);
            }
        }
    }

    /// Whether a connection is registered for `user_id` as of the last
    /// processed event.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence.contains_key(&user_id)
    }

    /// The connection currently registered for `user_id`, if any.
    pub fn connection_of(&self, user_id: UserId) -> Option<ConnectionId> {
        self.presence.get(&user_id).map(|entry| *entry.value())
    }

    /// Number of users currently online.
    pub fn online_count(&self) -> usize {
        self.presence.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// The hub's control loop and the state only it may touch.
pub struct Hub {
    connections: HashMap<UserId, Connection>,
    register_rx: mpsc::UnboundedReceiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<ConnectionKey>,
    push_rx: mpsc::Receiver<PushJob>,
    presence: Arc<DashMap<UserId, ConnectionId>>,
    stats: Arc<DeliveryStats>,
}

impl Hub {
    /// Create a hub and its first handle. Spawn [`Hub::run`] to start it.
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        info!(
            job_queue_capacity = config.job_queue_capacity,
            "Creating delivery hub"
        );
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::channel(config.job_queue_capacity.max(1));
        let presence = Arc::new(DashMap::new());
        let stats = Arc::new(DeliveryStats::default());

        let hub = Self {
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            push_rx,
            presence: Arc::clone(&presence),
            stats: Arc::clone(&stats),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            push_tx,
            presence,
            stats,
        };
        (hub, handle)
    }

    /// Run the control loop until every [`HubHandle`] is dropped.
    ///
    /// Registrations and unregistrations are served ahead of pushes so a
    /// push never targets a connection whose removal is already queued.
    #[instrument(skip_all, name = "hub")]
    pub async fn run(mut self) {
        info!("Delivery hub started");
        loop {
            tokio::select! {
                biased;

                Some(registration) = self.register_rx.recv() => self.register(registration),
                Some(key) = self.unregister_rx.recv() => self.unregister(key),
                Some(job) = self.push_rx.recv() => self.push(job),
                else => break,
            }
        }

        let remaining = self.connections.len();
        self.connections.clear();
        self.presence.clear();
        metrics::record_active_connections(0);
        info!(remaining, "Delivery hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        let Registration { connection, ack } = registration;
        let key = connection.key();

        if let Some(previous) = self.connections.remove(&key.user_id) {
            info!(
                user_id = key.user_id,
                previous = %previous.id(),
                "User reconnected, closing previous connection"
            );
            // Dropping the previous entry closes its queue.
            drop(previous);
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            metrics::record_superseded();
        }

        self.connections.insert(key.user_id, connection);
        self.presence.insert(key.user_id, key.id);
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        metrics::record_active_connections(self.connections.len() as i64);
        debug!(user_id = key.user_id, connection_id = %key.id, "Connection registered");

        if ack.send(()).is_err() {
            debug!(user_id = key.user_id, "Registration acknowledged to a departed caller");
        }
    }

    fn unregister(&mut self, key: ConnectionKey) {
        if self.remove_if_current(key).is_some() {
            debug!(user_id = key.user_id, connection_id = %key.id, "Connection unregistered");
        } else {
            debug!(
                user_id = key.user_id,
                connection_id = %key.id,
                "Connection already gone or superseded"
            );
        }
    }

    fn remove_if_current(&mut self, key: ConnectionKey) -> Option<Connection> {
        let is_current = self
            .connections
            .get(&key.user_id)
            .is_some_and(|connection| connection.id() == key.id);
        if !is_current {
            return None;
        }

        let removed = self.connections.remove(&key.user_id);
        self.presence.remove(&key.user_id);
        self.stats.unregistered.fetch_add(1, Ordering::Relaxed);
        metrics::record_active_connections(self.connections.len() as i64);
        removed
    }

    fn push(&mut self, job: PushJob) {
        let PushJob { user_id, frame } = job;

        let Some(connection) = self.connections.get(&user_id) else {
            debug!(user_id, kind = frame.kind(), "User not connected, push dropped");
            self.stats.record_drop(DropReason::Offline);
            return;
        };

        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user_id, kind = frame.kind(), error = %e, "Failed to encode frame");
                self.stats.record_drop(DropReason::SerializeFailed);
                return;
            }
        };

        match connection.try_enqueue(payload) {
            Ok(()) => {
                debug!(user_id, kind = frame.kind(), "Frame queued for delivery");
                self.stats.record_delivered(&frame);
            }
            Err(TrySendError::Full(_)) => {
                warn!(user_id, "Client queue full, disconnecting");
                self.stats.record_drop(DropReason::QueueFull);
                let key = connection.key();
                if let Some(connection) = self.remove_if_current(key) {
                    connection.tear_down();
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id, "Client queue closed, removing stale connection");
                self.stats.record_drop(DropReason::QueueClosed);
                let key = connection.key();
                self.remove_if_current(key);
            }
        }
    }
}
