//! Test utilities for relay integration tests.
//!
//! Provides an in-memory message log and a fake WebSocket peer built on
//! futures channels.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::{Mutex, Once};
use std::time::Duration;

use chrono::Utc;
use cryptachat_relay::{
    serve, ConnectionConfig, ConnectionTasks, HubHandle, MessageLog, MessageRecord, NewMessage,
    StoredMessage, UserId, WsFrame,
};
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a tracing subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("cryptachat_relay=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Append-only log kept in memory.
#[derive(Default)]
pub struct MemoryLog {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryLog {
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl MessageLog for MemoryLog {
    type Error = Infallible;

    async fn append(&self, message: NewMessage) -> Result<StoredMessage, Self::Error> {
        let mut messages = self.messages.lock().unwrap();
        let stored = StoredMessage {
            id: messages.len() as i64 + 1,
            sender_id: message.sender_id,
            sender_username: message.sender_username,
            recipient_id: message.recipient_id,
            sender_blob: message.sender_blob,
            recipient_blob: message.recipient_blob,
            timestamp: Utc::now(),
        };
        messages.push(stored.clone());
        Ok(stored)
    }

    async fn query(
        &self,
        viewer: UserId,
        partner: UserId,
        since_id: i64,
    ) -> Result<Vec<MessageRecord>, Self::Error> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| m.id > since_id)
            .filter(|m| {
                (m.sender_id == viewer && m.recipient_id == partner)
                    || (m.sender_id == partner && m.recipient_id == viewer)
            })
            .map(|m| m.view_for(viewer))
            .collect())
    }
}

/// Build a message from `sender` to `recipient` with recognisable blobs.
pub fn new_message(sender: UserId, recipient: UserId, body: &str) -> NewMessage {
    NewMessage {
        sender_id: sender,
        sender_username: format!("user{sender}"),
        recipient_id: recipient,
        sender_blob: format!("self:{body}"),
        recipient_blob: format!("peer:{body}"),
    }
}

/// The far end of a served connection.
pub struct TestPeer {
    pub tasks: ConnectionTasks,
    pub from_server: mpsc::UnboundedReceiver<WsFrame>,
    pub to_server: mpsc::UnboundedSender<Result<WsFrame, String>>,
}

impl TestPeer {
    /// Serve a connection for `user_id` over in-memory channels.
    pub async fn connect(hub: &HubHandle, user_id: UserId, config: ConnectionConfig) -> Self {
        let (sink, from_server) = mpsc::unbounded();
        let (to_server, stream) = mpsc::unbounded();
        let tasks = serve(hub, user_id, sink, stream, config)
            .await
            .expect("serve connection");
        Self {
            tasks,
            from_server,
            to_server,
        }
    }

    /// Next frame from the server, skipping keepalive pings.
    pub async fn next_frame(&mut self) -> Option<WsFrame> {
        loop {
            match timeout(DEFAULT_TIMEOUT, self.from_server.next()).await {
                Ok(Some(WsFrame::Ping(_))) => continue,
                Ok(frame) => return frame,
                Err(_) => panic!("timed out waiting for a frame"),
            }
        }
    }

    /// Next text frame parsed as JSON.
    pub async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            Some(WsFrame::Text(text)) => serde_json::from_str(&text).expect("valid JSON frame"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.next_frame().await {
                Some(WsFrame::Close) | None => return,
                Some(WsFrame::Text(_)) => continue,
                Some(other) => panic!("unexpected frame while closing: {other:?}"),
            }
        }
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = timeout(wait, self.from_server.next()).await {
            panic!("expected no frame, got {frame:?}");
        }
    }

    pub fn close(&self) {
        let _ = self.to_server.unbounded_send(Ok(WsFrame::Close));
    }
}

/// Poll until `check` holds or the default timeout passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {DEFAULT_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
