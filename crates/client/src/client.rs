// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The client state machine and its WebSocket plumbing.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use krmx_core::message::{self, RejectedPayload, UserPayload};
use krmx_core::{version, Event, EventBus, Message};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::event::{ClientEvent, EVENT_CLOSE};

/// Client lifecycle status, mirroring the server-side model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Initializing,
    Connecting,
    Connected,
    Linking,
    Linked,
    Unlinking,
    Closing,
    Closed,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Linking => "linking",
            Self::Linked => "linked",
            Self::Unlinking => "unlinking",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum OutboundFrame {
    Text(String),
    Close,
}

struct ClientState {
    status: ClientStatus,
    username: Option<String>,
    pending_username: Option<String>,
    users: IndexMap<String, bool>,
    tx: Option<mpsc::UnboundedSender<OutboundFrame>>,
    pending_link: Option<oneshot::Sender<Result<(), String>>>,
    pending_unlink: Option<oneshot::Sender<()>>,
    pending_leave: Option<(String, oneshot::Sender<()>)>,
}

struct ClientInner {
    events: EventBus<ClientEvent>,
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: &ClientEvent) {
        for failure in self.events.emit(event) {
            warn!(event = event.name(), err = %failure, "event listener failed");
        }
    }
}

/// A krmx client.  Cheaply cloneable; clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                events: EventBus::new(),
                state: Mutex::new(ClientState {
                    status: ClientStatus::Initializing,
                    username: None,
                    pending_username: None,
                    users: IndexMap::new(),
                    tx: None,
                    pending_link: None,
                    pending_unlink: None,
                    pending_leave: None,
                }),
            }),
        }
    }

    /// The event bus carrying every observable transition.
    pub fn events(&self) -> &EventBus<ClientEvent> {
        &self.inner.events
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.lock().status
    }

    /// The username this client is linked to, if any.
    pub fn username(&self) -> Option<String> {
        self.inner.lock().username.clone()
    }

    /// Every known user with its linked flag, in join order.
    pub fn users(&self) -> Vec<(String, bool)> {
        self.inner.lock().users.iter().map(|(name, linked)| (name.clone(), *linked)).collect()
    }

    /// Establish the WebSocket connection to a broker.
    pub async fn connect(&self, url: &str) -> Result<(), ClientError> {
        {
            let mut state = self.inner.lock();
            if !matches!(state.status, ClientStatus::Initializing | ClientStatus::Closed) {
                return Err(ClientError::InvalidStatus {
                    action: "connect",
                    status: state.status,
                });
            }
            state.status = ClientStatus::Connecting;
        }

        let (stream, _response) = match connect_async(url).await {
            Ok(ok) => ok,
            Err(err) => {
                self.inner.lock().status = ClientStatus::Closed;
                return Err(ClientError::Connect(err.to_string()));
            }
        };
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

        {
            let mut state = self.inner.lock();
            state.tx = Some(tx);
            state.status = ClientStatus::Connected;
        }

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    OutboundFrame::Close => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => handle_inbound(&inner, text.as_str()),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            handle_disconnect(&inner);
        });

        self.inner.emit(&ClientEvent::Connect);
        Ok(())
    }

    /// Link this connection to a user-session, creating it if new.  Resolves
    /// once the server has accepted or rejected the attempt.
    pub async fn link(&self, username: &str, auth: Option<&str>) -> Result<(), ClientError> {
        let rx = {
            let mut state = self.inner.lock();
            if state.status != ClientStatus::Connected {
                return Err(ClientError::InvalidStatus { action: "link", status: state.status });
            }
            state.status = ClientStatus::Linking;
            state.pending_username = Some(username.to_owned());
            let (tx, rx) = oneshot::channel();
            state.pending_link = Some(tx);
            rx
        };

        if let Err(err) = self.send_frame(&message::link(username, version::VERSION, auth)) {
            let mut state = self.inner.lock();
            state.status = ClientStatus::Connected;
            state.pending_username = None;
            state.pending_link = None;
            return Err(err);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ClientError::Rejected(reason)),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Detach from the user-session; the connection stays open and the user
    /// stays joined.  Resolves once the server has announced the unlink.
    pub async fn unlink(&self) -> Result<(), ClientError> {
        let rx = {
            let mut state = self.inner.lock();
            if state.status != ClientStatus::Linked {
                return Err(ClientError::InvalidStatus { action: "unlink", status: state.status });
            }
            state.status = ClientStatus::Unlinking;
            let (tx, rx) = oneshot::channel();
            state.pending_unlink = Some(tx);
            rx
        };
        self.send_frame(&message::unlink_request())?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Leave the session entirely.  Resolves once the server has announced
    /// the departure back to this client.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let rx = {
            let mut state = self.inner.lock();
            if state.status != ClientStatus::Linked {
                return Err(ClientError::InvalidStatus { action: "leave", status: state.status });
            }
            let Some(username) = state.username.clone() else {
                return Err(ClientError::InvalidStatus { action: "leave", status: state.status });
            };
            let (tx, rx) = oneshot::channel();
            state.pending_leave = Some((username, tx));
            rx
        };
        self.send_frame(&message::leave_request())?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send an application message to the server.
    pub fn send(&self, message: &Message) -> Result<(), ClientError> {
        if message.is_reserved() {
            return Err(ClientError::ReservedType(message.kind.clone()));
        }
        {
            let state = self.inner.lock();
            if state.status != ClientStatus::Linked {
                return Err(ClientError::InvalidStatus { action: "send", status: state.status });
            }
        }
        self.send_frame(message)
    }

    /// Tear down the connection.  Refused while linked unless `force`.
    pub async fn disconnect(&self, force: bool) -> Result<(), ClientError> {
        {
            let state = self.inner.lock();
            match state.status {
                ClientStatus::Linked if !force => {
                    return Err(ClientError::InvalidStatus {
                        action: "disconnect",
                        status: state.status,
                    });
                }
                ClientStatus::Initializing | ClientStatus::Closing | ClientStatus::Closed => {
                    return Err(ClientError::InvalidStatus {
                        action: "disconnect",
                        status: state.status,
                    });
                }
                _ => {}
            }
        }

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let slot = Arc::new(Mutex::new(Some(done_tx)));
        self.inner
            .events
            .once(EVENT_CLOSE, move |_| {
                if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(());
                }
                Ok(())
            })
            .map_err(|_| ClientError::ConnectionClosed)?;

        {
            let mut state = self.inner.lock();
            state.status = ClientStatus::Closing;
            if let Some(tx) = state.tx.as_ref() {
                let _ = tx.send(OutboundFrame::Close);
            }
        }

        let _ = done_rx.await;
        Ok(())
    }

    fn send_frame(&self, message: &Message) -> Result<(), ClientError> {
        let text =
            serde_json::to_string(message).map_err(|err| ClientError::Encode(err.to_string()))?;
        let state = self.inner.lock();
        let Some(tx) = state.tx.as_ref() else {
            return Err(ClientError::ConnectionClosed);
        };
        tx.send(OutboundFrame::Text(text)).map_err(|_| ClientError::ConnectionClosed)
    }
}

// -- Inbound frames -----------------------------------------------------------

fn handle_inbound(inner: &Arc<ClientInner>, text: &str) {
    let Ok(msg) = Message::parse(text) else {
        debug!("undecodable frame from server");
        return;
    };
    if !msg.is_reserved() {
        inner.emit(&ClientEvent::Message { message: msg });
        return;
    }
    match msg.kind.as_str() {
        message::ACCEPTED => {
            let mut state = inner.lock();
            state.username = state.pending_username.take();
            state.status = ClientStatus::Linked;
            if let Some(tx) = state.pending_link.take() {
                let _ = tx.send(Ok(()));
            }
        }
        message::REJECTED => {
            let reason = msg
                .payload_as::<RejectedPayload>()
                .map(|p| p.reason)
                .unwrap_or_else(|_| "rejected".to_owned());
            let mut state = inner.lock();
            if state.status == ClientStatus::Linking {
                state.status = ClientStatus::Connected;
            }
            state.pending_username = None;
            if let Some(tx) = state.pending_link.take() {
                let _ = tx.send(Err(reason));
            }
        }
        message::JOINED => {
            if let Ok(UserPayload { username }) = msg.payload_as() {
                inner.lock().users.insert(username.clone(), false);
                inner.emit(&ClientEvent::Join { username });
            }
        }
        message::LINKED => {
            if let Ok(UserPayload { username }) = msg.payload_as() {
                *inner.lock().users.entry(username.clone()).or_insert(false) = true;
                inner.emit(&ClientEvent::Link { username });
            }
        }
        message::UNLINKED => {
            if let Ok(UserPayload { username }) = msg.payload_as() {
                if let Some(linked) = inner.lock().users.get_mut(&username) {
                    *linked = false;
                }
                // The username is still visible to listeners during this
                // emission; only afterwards does the client fall back to
                // connected.
                inner.emit(&ClientEvent::Unlink { username: username.clone() });
                let mut state = inner.lock();
                if state.username.as_deref() == Some(username.as_str()) {
                    state.username = None;
                    state.status = ClientStatus::Connected;
                    if let Some(tx) = state.pending_unlink.take() {
                        let _ = tx.send(());
                    }
                }
            }
        }
        message::LEFT => {
            if let Ok(UserPayload { username }) = msg.payload_as() {
                inner.lock().users.shift_remove(&username);
                inner.emit(&ClientEvent::Leave { username: username.clone() });
                let mut state = inner.lock();
                if state.username.as_deref() == Some(username.as_str()) {
                    state.username = None;
                    state.status = ClientStatus::Connected;
                }
                if let Some((name, tx)) = state.pending_leave.take() {
                    if name == username {
                        let _ = tx.send(());
                    } else {
                        state.pending_leave = Some((name, tx));
                    }
                }
            }
        }
        other => debug!(kind = other, "unexpected protocol message from server"),
    }
}

fn handle_disconnect(inner: &Arc<ClientInner>) {
    {
        let mut state = inner.lock();
        if state.status == ClientStatus::Closed {
            return;
        }
        state.status = ClientStatus::Closed;
        state.username = None;
        state.pending_username = None;
        state.users.clear();
        state.tx = None;
        // Dropping the pending senders fails any in-flight waiters.
        state.pending_link = None;
        state.pending_unlink = None;
        state.pending_leave = None;
    }
    inner.emit(&ClientEvent::Close);
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
