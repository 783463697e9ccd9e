// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection and user registries.
//!
//! Both registries are owned by the server and guarded by a single mutex;
//! entries reference each other by id only and are resolved on every use.
//! Insertion order is kept so backfill and broadcast iterate users in join
//! order.

use std::fmt;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Server lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initializing,
    Starting,
    Listening,
    Closing,
    Closed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One WebSocket session.  Outbound frames go through the channel; a writer
/// task owns the socket sink, so writes are serialized per connection.
pub(crate) struct Connection {
    pub username: Option<String>,
    pub terminal: bool,
    tx: mpsc::UnboundedSender<String>,
}

impl Connection {
    /// Queue a frame for delivery.  Nothing is ever written to a terminal
    /// connection.
    pub fn send_raw(&self, frame: &str) {
        if !self.terminal {
            let _ = self.tx.send(frame.to_owned());
        }
    }
}

/// A named user-session; `connection_id` is set while linked.
pub(crate) struct User {
    pub connection_id: Option<String>,
}

pub(crate) struct BrokerState {
    pub status: Status,
    pub connections: IndexMap<String, Connection>,
    pub users: IndexMap<String, User>,
}

impl BrokerState {
    pub fn new() -> Self {
        Self { status: Status::Initializing, connections: IndexMap::new(), users: IndexMap::new() }
    }

    /// Register an accepted connection under a fresh opaque id.  Returns
    /// `None` once the server is no longer listening.
    pub fn register_connection(&mut self, tx: mpsc::UnboundedSender<String>) -> Option<String> {
        if self.status != Status::Listening {
            return None;
        }
        let id = self.fresh_connection_id();
        self.connections.insert(id.clone(), Connection { username: None, terminal: false, tx });
        Some(id)
    }

    fn fresh_connection_id(&self) -> String {
        loop {
            let uuid = Uuid::new_v4().simple().to_string();
            let id = format!("cn-{}", &uuid[..12]);
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    /// Bind a user and a connection to each other.
    pub fn bind(&mut self, connection_id: &str, username: &str) {
        if let Some(conn) = self.connections.get_mut(connection_id) {
            conn.username = Some(username.to_owned());
        }
        if let Some(user) = self.users.get_mut(username) {
            user.connection_id = Some(connection_id.to_owned());
        }
    }

    /// Clear the two-way binding of a user, if any.
    pub fn unbind(&mut self, username: &str) {
        let connection_id = match self.users.get_mut(username) {
            Some(user) => user.connection_id.take(),
            None => None,
        };
        if let Some(connection_id) = connection_id {
            if let Some(conn) = self.connections.get_mut(&connection_id) {
                conn.username = None;
            }
        }
    }

    /// Deliver a frame to a single connection.
    pub fn send_to(&self, connection_id: &str, frame: &str) {
        if let Some(conn) = self.connections.get(connection_id) {
            conn.send_raw(frame);
        }
    }

    /// Deliver a frame to every linked connection, in user join order,
    /// optionally skipping one connection.
    pub fn fan_out(&self, frame: &str, skip_connection: Option<&str>) {
        for user in self.users.values() {
            let Some(connection_id) = &user.connection_id else {
                continue;
            };
            if skip_connection == Some(connection_id.as_str()) {
                continue;
            }
            self.send_to(connection_id, frame);
        }
    }

    /// Mark every connection terminal and drop the registry.  Dropping the
    /// senders ends each connection's writer loop after its queue drains.
    pub fn terminate_all(&mut self) {
        for conn in self.connections.values_mut() {
            conn.terminal = true;
        }
        self.connections.clear();
        for user in self.users.values_mut() {
            user.connection_id = None;
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
