//! Real-time push channel.
//!
//! The socket is one-way in practice: the server pushes frames, the client
//! only answers pings and eventually closes. Everything after the upgrade is
//! handled by the relay's connection pumps.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use cryptachat_relay::{UserId, WsFrame};
use futures::{future, SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::auth::WsAuthUser;
use crate::server::AppState;

/// GET /ws
///
/// Authenticates before upgrading, so an unauthenticated client gets a plain
/// 401 and never a socket.
pub async fn ws_handler(
    WsAuthUser(user): WsAuthUser,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    info!(user_id = user.id, "WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state, user.id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let (sender, receiver) = socket.split();
    let sink = sender.with(|frame: WsFrame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = receiver.map(|message| message.map(from_message));

    let hub = state.gateway.hub();
    match cryptachat_relay::serve(hub, user_id, sink, stream, state.config.connection.clone()).await
    {
        Ok(tasks) => {
            let connection_id = tasks.key.id;
            tasks.join().await;
            debug!(user_id, %connection_id, "WebSocket connection finished");
        }
        Err(e) => warn!(user_id, error = %e, "Could not register push connection"),
    }
}

fn to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::Text(text),
        WsFrame::Binary(data) => Message::Binary(data),
        WsFrame::Ping(data) => Message::Ping(data),
        WsFrame::Pong(data) => Message::Pong(data),
        WsFrame::Close => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        })),
    }
}

fn from_message(message: Message) -> WsFrame {
    match message {
        Message::Text(text) => WsFrame::Text(text),
        Message::Binary(data) => WsFrame::Binary(data),
        Message::Ping(data) => WsFrame::Ping(data),
        Message::Pong(data) => WsFrame::Pong(data),
        Message::Close(_) => WsFrame::Close,
    }
}
