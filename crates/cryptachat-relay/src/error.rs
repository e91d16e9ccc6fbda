use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the relay.
///
/// Delivery never fails observably to a sender; these cover registering
/// against a stopped hub and the write failures that end a connection.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Hub is not running")]
    HubStopped,

    #[error("Write to peer failed: {0}")]
    Write(String),

    #[error("Write to peer timed out after {0:?}")]
    WriteTimeout(Duration),
}
