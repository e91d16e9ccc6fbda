//! Per-user push connection and its read/write pumps.
//!
//! A connection is registered with the hub before either pump starts. The
//! hub holds the only sender of the outbound queue, so dropping the hub's
//! entry is what closes the queue. The two pumps share a cancellation token
//! and nothing else.

use std::fmt;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::frame::UserId;
use crate::hub::HubHandle;

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Floor for the keepalive interval; tokio intervals reject a zero period.
const MIN_PING_PERIOD: Duration = Duration::from_millis(1);

/// Budget for the close handshake once the connection has been shut down.
const SHUTDOWN_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Unique identifier of one connection instance.
///
/// Two connections for the same user always have different ids, which is
/// what lets the hub tell a stale unregister apart from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a registered connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: UserId,
    pub id: ConnectionId,
}

/// Transport-neutral WebSocket frame.
///
/// The server adapts its WebSocket type to and from this so the pumps can be
/// driven by any `Sink`/`Stream` pair, including in-memory channels in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl WsFrame {
    fn payload_len(&self) -> usize {
        match self {
            WsFrame::Text(text) => text.len(),
            WsFrame::Binary(data) | WsFrame::Ping(data) | WsFrame::Pong(data) => data.len(),
            WsFrame::Close => 0,
        }
    }
}

/// Timing and sizing for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound queue. A push that finds it full disconnects the user.
    pub outbound_capacity: usize,
    /// Longest time the peer may stay silent (pongs count) before it is dropped.
    pub pong_wait: Duration,
    /// Interval between keepalive pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Upper bound on a single write to the peer.
    pub write_timeout: Duration,
    /// Largest inbound frame accepted from the peer.
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 4096,
        }
    }
}

impl ConnectionConfig {
    fn keepalive_period(&self) -> Duration {
        self.ping_period.max(MIN_PING_PERIOD)
    }
}

/// The hub's handle on one online user.
///
/// Owns the only sender of the outbound queue; dropping the connection
/// closes the queue and the write pump drains what is left and exits.
#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Build a connection for `user_id`, returning the queue's receiving end
    /// for the write pump.
    pub fn new(
        user_id: UserId,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let connection = Self {
            key: ConnectionKey {
                user_id,
                id: ConnectionId::new(),
            },
            outbound,
            shutdown,
        };
        (connection, receiver)
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn user_id(&self) -> UserId {
        self.key.user_id
    }

    pub fn id(&self) -> ConnectionId {
        self.key.id
    }

    pub(crate) fn try_enqueue(&self, payload: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(payload)
    }

    /// Close the queue and stop both pumps without draining.
    pub(crate) fn tear_down(self) {
        self.shutdown.cancel();
    }
}

/// Join handles for a served connection's pumps.
#[derive(Debug)]
pub struct ConnectionTasks {
    pub key: ConnectionKey,
    pub writer: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

impl ConnectionTasks {
    /// Wait for both pumps to finish.
    pub async fn join(self) {
        let _ = self.writer.await;
        let _ = self.reader.await;
    }
}

/// Register a connection for `user_id` and start its pumps.
///
/// Resolves once the hub has recorded the connection, so a push submitted
/// after this returns will find it.
#[instrument(skip(hub, sink, stream, config))]
pub async fn serve<Si, St, E>(
    hub: &HubHandle,
    user_id: UserId,
    sink: Si,
    stream: St,
    config: ConnectionConfig,
) -> Result<ConnectionTasks, RelayError>
where
    Si: Sink<WsFrame> + Send + Unpin + 'static,
    Si::Error: fmt::Display,
    St: Stream<Item = Result<WsFrame, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let (connection, outbound) = Connection::new(user_id, config.outbound_capacity, shutdown.clone());
    let key = connection.key();

    hub.register(connection).await?;
    info!(connection_id = %key.id, "Push connection established");

    let writer = tokio::spawn(write_pump(
        sink,
        outbound,
        shutdown.clone(),
        config.clone(),
        key,
    ));
    let reader = tokio::spawn(read_pump(stream, hub.clone(), key, shutdown.clone(), config));

    Ok(ConnectionTasks {
        key,
        writer,
        reader,
    })
}

async fn send_frame<Si>(sink: &mut Si, frame: WsFrame, wait: Duration) -> Result<(), RelayError>
where
    Si: Sink<WsFrame> + Unpin,
    Si::Error: fmt::Display,
{
    match timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Write(e.to_string())),
        Err(_) => Err(RelayError::WriteTimeout(wait)),
    }
}

/// Why the write pump stopped.
enum PumpExit {
    /// The hub dropped the connection and the queue ran dry.
    Drained,
    /// The shared token was cancelled between writes.
    Cancelled,
    /// A write failed, timed out, or was cut off mid-flight.
    Broken,
}

/// Drain the outbound queue onto the sink in FIFO order, pinging the peer
/// every `ping_period`.
///
/// Exits when the queue closes, a write fails, or the connection is shut
/// down. A closed queue gets the full close handshake and a shutdown gets it
/// under [`SHUTDOWN_CLOSE_GRACE`]. A failed or abandoned write just drops the
/// sink. On exit the shared token is cancelled so the read pump stops too.
async fn write_pump<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<String>,
    shutdown: CancellationToken,
    config: ConnectionConfig,
    key: ConnectionKey,
) where
    Si: Sink<WsFrame> + Unpin,
    Si::Error: fmt::Display,
{
    let period = config.keepalive_period();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut exit = PumpExit::Drained;
    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(user_id = key.user_id, connection_id = %key.id, "Write pump cancelled");
                exit = PumpExit::Cancelled;
                break;
            }
            next = outbound.recv() => match next {
                Some(payload) => WsFrame::Text(payload),
                None => {
                    debug!(user_id = key.user_id, connection_id = %key.id, "Outbound queue closed");
                    break;
                }
            },
            _ = keepalive.tick() => WsFrame::Ping(Vec::new()),
        };
        let is_ping = matches!(frame, WsFrame::Ping(_));

        let written = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(user_id = key.user_id, "Write abandoned on shutdown");
                exit = PumpExit::Broken;
                break;
            }
            written = send_frame(&mut sink, frame, config.write_timeout) => written,
        };
        match written {
            Ok(()) if is_ping => trace!(user_id = key.user_id, "Ping sent"),
            Ok(()) => {}
            Err(e) => {
                warn!(user_id = key.user_id, error = %e, "Failed to write frame");
                exit = PumpExit::Broken;
                break;
            }
        }
    }

    let close_budget = match exit {
        PumpExit::Drained => Some(config.write_timeout),
        PumpExit::Cancelled => Some(config.write_timeout.min(SHUTDOWN_CLOSE_GRACE)),
        PumpExit::Broken => None,
    };
    if let Some(budget) = close_budget {
        let _ = timeout(budget, async {
            let _ = sink.send(WsFrame::Close).await;
            let _ = sink.close().await;
        })
        .await;
    }
    drop(sink);
    shutdown.cancel();
    debug!(user_id = key.user_id, connection_id = %key.id, "Write pump stopped");
}

/// Read from the peer only to notice that it went away.
///
/// Inbound payloads are ignored. Any terminal condition (close frame, read
/// error, end of stream, oversized frame, or `pong_wait` without traffic)
/// unregisters this exact connection once and stops the write pump.
async fn read_pump<St, E>(
    mut stream: St,
    hub: HubHandle,
    key: ConnectionKey,
    shutdown: CancellationToken,
    config: ConnectionConfig,
) where
    St: Stream<Item = Result<WsFrame, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(user_id = key.user_id, connection_id = %key.id, "Read pump cancelled");
                break;
            }
            next = timeout(config.pong_wait, stream.next()) => next,
        };

        match next {
            Err(_) => {
                info!(user_id = key.user_id, "Peer idle past pong wait, dropping connection");
                break;
            }
            Ok(None) => {
                debug!(user_id = key.user_id, "Peer stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(user_id = key.user_id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => {
                if frame.payload_len() > config.max_frame_bytes {
                    warn!(
                        user_id = key.user_id,
                        len = frame.payload_len(),
                        limit = config.max_frame_bytes,
                        "Inbound frame too large, dropping connection"
                    );
                    break;
                }
                match frame {
                    WsFrame::Close => {
                        debug!(user_id = key.user_id, "Peer closed connection");
                        break;
                    }
                    WsFrame::Text(_) | WsFrame::Binary(_) => {
                        trace!(user_id = key.user_id, "Ignoring inbound data frame");
                    }
                    WsFrame::Ping(_) | WsFrame::Pong(_) => {
                        trace!(user_id = key.user_id, "Keepalive received");
                    }
                }
            }
        }
    }

    hub.unregister(key);
    shutdown.cancel();
    debug!(user_id = key.user_id, connection_id = %key.id, "Read pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OutboundFrame;
    use crate::hub::{Hub, HubConfig};
    use futures::channel::mpsc as fmpsc;

    type Inbound = Result<WsFrame, String>;

    async fn wait_until_offline(hub: &HubHandle, user_id: UserId) {
        for _ in 0..200 {
            if !hub.is_online(user_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("user {user_id} still online");
    }

    #[test]
    fn test_default_ping_period_is_shorter_than_pong_wait() {
        let config = ConnectionConfig::default();
        assert!(config.ping_period < config.pong_wait);
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert_eq!(config.outbound_capacity, 256);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _rx_a) = Connection::new(1, 4, CancellationToken::new());
        let (b, _rx_b) = Connection::new(1, 4, CancellationToken::new());
        assert_eq!(a.user_id(), b.user_id());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_serve_registers_before_returning() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, _peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (_peer_tx, stream) = fmpsc::unbounded::<Inbound>();

        let tasks = serve(&handle, 5, sink, stream, ConnectionConfig::default())
            .await
            .unwrap();

        assert!(handle.is_online(5));
        assert_eq!(tasks.key.user_id, 5);
    }

    #[tokio::test]
    async fn test_peer_close_unregisters_and_closes_sink() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, mut peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (peer_tx, stream) = fmpsc::unbounded::<Inbound>();

        let tasks = serve(&handle, 9, sink, stream, ConnectionConfig::default())
            .await
            .unwrap();

        peer_tx.unbounded_send(Ok(WsFrame::Close)).unwrap();
        tasks.join().await;

        wait_until_offline(&handle, 9).await;
        assert_eq!(peer_rx.next().await, Some(WsFrame::Close));
        assert_eq!(peer_rx.next().await, None);
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_drops_connection() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, _peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (peer_tx, stream) = fmpsc::unbounded::<Inbound>();
        let config = ConnectionConfig {
            max_frame_bytes: 8,
            ..ConnectionConfig::default()
        };

        let tasks = serve(&handle, 3, sink, stream, config).await.unwrap();
        peer_tx
            .unbounded_send(Ok(WsFrame::Text("this is far too long".to_string())))
            .unwrap();
        tasks.join().await;

        wait_until_offline(&handle, 3).await;
    }

    #[tokio::test]
    async fn test_read_error_drops_connection() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, _peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (peer_tx, stream) = fmpsc::unbounded::<Inbound>();

        let tasks = serve(&handle, 4, sink, stream, ConnectionConfig::default())
            .await
            .unwrap();
        peer_tx.unbounded_send(Err("connection reset".to_string())).unwrap();
        tasks.join().await;

        wait_until_offline(&handle, 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_times_out() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, mut peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (_peer_tx, stream) = fmpsc::unbounded::<Inbound>();

        let tasks = serve(&handle, 11, sink, stream, ConnectionConfig::default())
            .await
            .unwrap();

        // Paused clock auto-advances: one ping at 54s, then the 60s read deadline.
        tasks.join().await;
        wait_until_offline(&handle, 11).await;

        assert_eq!(peer_rx.next().await, Some(WsFrame::Ping(Vec::new())));
        assert_eq!(peer_rx.next().await, Some(WsFrame::Close));
    }

    #[tokio::test]
    async fn test_write_failure_stops_both_pumps() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (_peer_tx, stream) = fmpsc::unbounded::<Inbound>();
        drop(peer_rx);

        let tasks = serve(&handle, 12, sink, stream, ConnectionConfig::default())
            .await
            .unwrap();
        handle.submit(
            12,
            OutboundFrame::ChatRequest {
                from_username: "dave".to_string(),
            },
        );
        tasks.join().await;

        wait_until_offline(&handle, 12).await;
    }

    #[tokio::test]
    async fn test_forced_disconnect_does_not_wait_on_stalled_peer() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        // Nobody reads the peer side, so the first write never completes.
        let (sink, _peer_rx) = fmpsc::channel::<WsFrame>(0);
        let (_peer_tx, stream) = fmpsc::unbounded::<Inbound>();
        let config = ConnectionConfig {
            outbound_capacity: 1,
            write_timeout: Duration::from_secs(30),
            ..ConnectionConfig::default()
        };

        let tasks = serve(&handle, 13, sink, stream, config).await.unwrap();
        for _ in 0..5 {
            handle.submit(
                13,
                OutboundFrame::ChatRequest {
                    from_username: "erin".to_string(),
                },
            );
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .expect("pumps should stop well before the write timeout");
        wait_until_offline(&handle, 13).await;
    }

    #[test]
    fn test_keepalive_period_is_never_zero() {
        let config = ConnectionConfig {
            pong_wait: Duration::ZERO,
            ping_period: Duration::ZERO,
            ..ConnectionConfig::default()
        };
        assert_eq!(config.keepalive_period(), MIN_PING_PERIOD);
        assert_eq!(
            ConnectionConfig::default().keepalive_period(),
            Duration::from_secs(54)
        );
    }

    #[tokio::test]
    async fn test_zero_timings_do_not_panic_the_pumps() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (sink, _peer_rx) = fmpsc::unbounded::<WsFrame>();
        let (_peer_tx, stream) = fmpsc::unbounded::<Inbound>();
        let config = ConnectionConfig {
            pong_wait: Duration::ZERO,
            ping_period: Duration::ZERO,
            ..ConnectionConfig::default()
        };

        let tasks = serve(&handle, 14, sink, stream, config).await.unwrap();
        assert!(tasks.writer.await.is_ok());
        assert!(tasks.reader.await.is_ok());
        wait_until_offline(&handle, 14).await;
    }
}
