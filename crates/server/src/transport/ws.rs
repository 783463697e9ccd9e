// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection WebSocket handling.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::link;
use crate::server::ServerInner;
use crate::state::Status;
use crate::transport::gate;

/// WebSocket upgrade for the broker endpoint.  Requests failing the query
/// parameter gate are terminated before the upgrade with no further effect.
pub(crate) async fn upgrade_handler(
    State(inner): State<Arc<ServerInner>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if inner.lock_state().status != Status::Listening {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if !gate::check(&inner.config.http.query_params, &params) {
        debug!("connection refused by query parameter gate");
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(inner, socket))
}

/// Per-connection loop: registers the connection, forwards queued outbound
/// frames to the socket, and feeds inbound text frames to the link machine.
async fn handle_socket(inner: Arc<ServerInner>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let Some(connection_id) = inner.lock_state().register_connection(tx) else {
        // Raced with shutdown; drop the socket without observable effect.
        return;
    };
    debug!(connection = %connection_id, "connection accepted");

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                // Terminated server-side; the queue has been drained.
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    link::handle_frame(&inner, &connection_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(connection = %connection_id, err = %err, "websocket receive error");
                    break;
                }
                // Binary, ping, and pong frames are not part of the protocol.
                Some(Ok(_)) => {}
            },
        }
    }

    link::handle_close(&inner, &connection_id).await;
}
