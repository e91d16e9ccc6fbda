//! # cryptachat-relay
//!
//! Real-time delivery core for Cryptachat.
//!
//! The server never sees plaintext; what this crate moves around are
//! already-encrypted message records. It owns the in-memory picture of who is
//! online and pushes freshly stored messages to those users over their
//! WebSocket. Offline users lose nothing: the durable message log stays the
//! source of truth and clients can always poll it.
//!
//! ## Architecture
//!
//! - **Hub**: a single control loop that owns the `UserId -> Connection` map.
//!   It is reachable only through a cloneable [`HubHandle`].
//! - **Connection**: one per online user, with a bounded outbound queue and
//!   two pumps (read and write) running as separate tasks.
//! - **Delivery gateway**: persists through a [`MessageLog`] and then asks the
//!   hub to push, never the other way round.
//!
//! ```ignore
//! let (hub, handle) = Hub::new(HubConfig::default());
//! tokio::spawn(hub.run());
//!
//! // after the transport upgrade:
//! let tasks = cryptachat_relay::serve(&handle, user_id, sink, stream, ConnectionConfig::default()).await?;
//! ```

pub mod connection;
pub mod frame;
pub mod gateway;
pub mod hub;
pub mod metrics;

mod error;

pub use connection::{serve, ConnectionConfig, ConnectionId, ConnectionTasks, WsFrame};
pub use error::RelayError;
pub use frame::{MessageRecord, NewMessage, OutboundFrame, StoredMessage, UserId};
pub use gateway::{DeliveryGateway, MessageLog};
pub use hub::{DeliveryStats, Hub, HubConfig, HubHandle, StatsSnapshot};
