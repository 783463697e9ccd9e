// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::SecondsFormat;
use krmx_core::{Event, EventBus, Message, Metadata};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::event::ServerEvent;
use crate::link;
use crate::state::{BrokerState, Status};
use crate::transport;

/// The session broker.  Cheaply cloneable; clones share the same broker, so
/// event listeners can capture one and call back into the API re-entrantly.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) state: Mutex<BrokerState>,
    pub(crate) events: EventBus<ServerEvent>,
    /// Serializes whole inbound-frame handlings across connections, so one
    /// frame's multi-step transitions never interleave with another's.
    pub(crate) frame_guard: tokio::sync::Mutex<()>,
    pub(crate) shutdown: CancellationToken,
    serve_handle: Mutex<Option<JoinHandle<()>>>,
    port: Mutex<Option<u16>>,
}

impl ServerInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode a message for the wire, stamping metadata when enabled.
    pub(crate) fn encode(&self, message: &Message, is_broadcast: bool) -> Option<String> {
        let mut message = message.clone();
        if self.config.metadata {
            message.metadata = Some(Metadata {
                is_broadcast,
                timestamp: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            });
        }
        match serde_json::to_string(&message) {
            Ok(frame) => Some(frame),
            Err(err) => {
                error!(kind = %message.kind, err = %err, "failed to encode outbound frame");
                None
            }
        }
    }

    /// Emit an event, logging listener failures instead of propagating them.
    pub(crate) fn emit(&self, event: &ServerEvent) {
        for failure in self.events.emit(event) {
            warn!(event = event.name(), err = %failure, "event listener failed");
        }
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                state: Mutex::new(BrokerState::new()),
                events: EventBus::new(),
                frame_guard: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                serve_handle: Mutex::new(None),
                port: Mutex::new(None),
            }),
        }
    }

    /// The event bus carrying every observable transition.
    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.inner.events
    }

    pub fn status(&self) -> Status {
        self.inner.lock_state().status
    }

    /// The bound port, once listening.
    pub fn port(&self) -> Option<u16> {
        *self.inner.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every known user with its linked flag, in join order.
    pub fn users(&self) -> Vec<(String, bool)> {
        self.inner
            .lock_state()
            .users
            .iter()
            .map(|(name, user)| (name.clone(), user.connection_id.is_some()))
            .collect()
    }

    /// Start accepting connections.  Binds a fresh listener on the configured
    /// host (port 0 picks an ephemeral port), or serves on the caller-provided
    /// listener; a `port` argument that contradicts that listener is an error.
    pub async fn listen(&self, port: Option<u16>) -> Result<u16, ServerError> {
        {
            let mut state = self.inner.lock_state();
            if state.status != Status::Initializing {
                return Err(ServerError::InvalidStatus { action: "listen", status: state.status });
            }
            state.status = Status::Starting;
        }

        match self.bind(port).await {
            Ok(bound) => {
                self.inner.lock_state().status = Status::Listening;
                info!(port = bound, "krmx server listening");
                self.inner.emit(&ServerEvent::Listen { port: bound });
                Ok(bound)
            }
            Err(err) => {
                // Leave the server usable so the caller may retry.
                self.inner.lock_state().status = Status::Initializing;
                Err(err)
            }
        }
    }

    async fn bind(&self, port: Option<u16>) -> Result<u16, ServerError> {
        let provided = self
            .inner
            .config
            .http
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let listener = match provided {
            Some(listener) => {
                let bound = listener
                    .local_addr()
                    .map_err(|err| ServerError::Bind(err.to_string()))?
                    .port();
                match port {
                    Some(requested) if requested != bound => {
                        // Hand the listener back so the caller may retry.
                        *self
                            .inner
                            .config
                            .http
                            .listener
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
                        return Err(ServerError::PortMismatch { requested, bound });
                    }
                    _ => listener,
                }
            }
            None => {
                let addr = format!("{}:{}", self.inner.config.http.host, port.unwrap_or(0));
                TcpListener::bind(&addr)
                    .await
                    .map_err(|err| ServerError::Bind(err.to_string()))?
            }
        };

        let bound = listener.local_addr().map_err(|err| ServerError::Bind(err.to_string()))?.port();
        let router = transport::build_router(Arc::clone(&self.inner));
        let shutdown = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) =
                axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await
            {
                error!(err = %err, "websocket server terminated");
            }
        });
        *self.inner.serve_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *self.inner.port.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);
        Ok(bound)
    }

    /// Stop the broker: every remaining user leaves (unlink before leave),
    /// all connections are terminated, and the listener shuts down.
    pub async fn close(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.lock_state();
            if !matches!(state.status, Status::Starting | Status::Listening) {
                return Err(ServerError::InvalidStatus { action: "close", status: state.status });
            }
            state.status = Status::Closing;
        }
        info!("krmx server closing");

        {
            // Hold the frame guard so the teardown never interleaves with an
            // in-flight frame handling; released before the serve task is
            // awaited, which needs it for its own close handling.
            let _guard = self.inner.frame_guard.lock().await;
            let usernames: Vec<String> = self.inner.lock_state().users.keys().cloned().collect();
            for username in usernames {
                link::leave_user(&self.inner, &username);
            }
            self.inner.lock_state().terminate_all();
        }
        self.inner.shutdown.cancel();

        let handle =
            self.inner.serve_handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.lock_state().status = Status::Closed;
        info!("krmx server closed");
        self.inner.emit(&ServerEvent::Close);
        Ok(())
    }

    /// Send an application message to one linked user.
    pub fn send(&self, username: &str, message: &Message) -> Result<(), ServerError> {
        self.guard("send")?;
        self.ensure_unreserved(message)?;
        let state = self.inner.lock_state();
        let Some(user) = state.users.get(username) else {
            return Err(ServerError::NoSuchUser(username.to_owned()));
        };
        let Some(connection_id) = user.connection_id.clone() else {
            return Err(ServerError::UserNotLinked(username.to_owned()));
        };
        if let Some(frame) = self.inner.encode(message, false) {
            state.send_to(&connection_id, &frame);
        }
        Ok(())
    }

    /// Send an application message to every linked user, optionally skipping
    /// one username.
    pub fn broadcast(&self, message: &Message, skip: Option<&str>) -> Result<(), ServerError> {
        self.guard("broadcast")?;
        self.ensure_unreserved(message)?;
        let state = self.inner.lock_state();
        let skip_connection = skip
            .and_then(|username| state.users.get(username))
            .and_then(|user| user.connection_id.clone());
        if let Some(frame) = self.inner.encode(message, true) {
            state.fan_out(&frame, skip_connection.as_deref());
        }
        Ok(())
    }

    /// Create a user server-side without a connection.  Useful together with
    /// `accept_new_users(false)` to pre-approve the set of usernames.
    pub fn join(&self, username: &str) -> Result<(), ServerError> {
        self.guard("join")?;
        if !(self.inner.config.is_valid_username)(username) {
            return Err(ServerError::InvalidUsername(username.to_owned()));
        }
        if self.inner.lock_state().users.contains_key(username) {
            return Err(ServerError::UserAlreadyExists(username.to_owned()));
        }
        link::join_user(&self.inner, username);
        Ok(())
    }

    /// Detach a user from its connection; the user stays joined and the
    /// connection stays open.
    pub fn unlink(&self, username: &str) -> Result<(), ServerError> {
        self.guard("unlink")?;
        {
            let state = self.inner.lock_state();
            let Some(user) = state.users.get(username) else {
                return Err(ServerError::NoSuchUser(username.to_owned()));
            };
            if user.connection_id.is_none() {
                return Err(ServerError::UserNotLinked(username.to_owned()));
            }
        }
        link::unlink_user(&self.inner, username);
        Ok(())
    }

    /// Remove a user from the session; its connection, if any, stays open.
    pub fn kick(&self, username: &str) -> Result<(), ServerError> {
        self.guard("kick")?;
        if !self.inner.lock_state().users.contains_key(username) {
            return Err(ServerError::NoSuchUser(username.to_owned()));
        }
        link::leave_user(&self.inner, username);
        Ok(())
    }

    fn guard(&self, action: &'static str) -> Result<(), ServerError> {
        let status = self.inner.lock_state().status;
        if matches!(status, Status::Listening | Status::Closing) {
            Ok(())
        } else {
            Err(ServerError::InvalidStatus { action, status })
        }
    }

    fn ensure_unreserved(&self, message: &Message) -> Result<(), ServerError> {
        if message.is_reserved() {
            Err(ServerError::ReservedType(message.kind.clone()))
        } else {
            Ok(())
        }
    }
}
