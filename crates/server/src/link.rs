// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The link state machine: how frames move connections and users between
//! unlinked, linked, and gone.
//!
//! Every inbound frame is handled under the frame guard, so the multi-step
//! sequences below (join then link, unlink then leave) are never interleaved
//! with another connection's transitions.  Each individual step takes the
//! state lock once for its mutation plus fan-out, then emits its event with
//! the lock released so listeners can call back into the server.

use std::sync::Arc;

use krmx_core::message::{self, LinkPayload};
use krmx_core::{version, Message, RESERVED_PREFIX};
use tracing::{debug, warn};

use crate::event::{AuthRequest, ServerEvent};
use crate::server::ServerInner;
use crate::state::{Status, User};

/// Handle one text frame from a connection.
pub(crate) async fn handle_frame(inner: &Arc<ServerInner>, connection_id: &str, text: &str) {
    let _guard = inner.frame_guard.lock().await;
    let bound = {
        let state = inner.lock_state();
        if state.status != Status::Listening {
            return;
        }
        match state.connections.get(connection_id) {
            Some(conn) => conn.username.clone(),
            None => return,
        }
    };
    match bound {
        None => handle_unlinked_frame(inner, connection_id, text).await,
        Some(username) => handle_linked_frame(inner, &username, text),
    }
}

/// Handle the socket of a connection going away.
pub(crate) async fn handle_close(inner: &Arc<ServerInner>, connection_id: &str) {
    let _guard = inner.frame_guard.lock().await;
    let username = {
        let state = inner.lock_state();
        state.connections.get(connection_id).and_then(|conn| conn.username.clone())
    };
    if let Some(username) = username {
        unlink_user(inner, &username);
    }
    inner.lock_state().connections.shift_remove(connection_id);
    debug!(connection = connection_id, "connection closed");
}

// -- Unlinked connections -----------------------------------------------------

async fn handle_unlinked_frame(inner: &Arc<ServerInner>, connection_id: &str, text: &str) {
    let msg = match Message::parse(text) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(connection = connection_id, err = %err, "undecodable frame on unlinked connection");
            reject(inner, connection_id, "invalid message");
            return;
        }
    };
    if msg.kind != message::LINK {
        reject(inner, connection_id, "unlinked connection");
        return;
    }
    let request: LinkPayload = match msg.payload_as() {
        Ok(request) => request,
        Err(_) => {
            reject(inner, connection_id, "invalid link request");
            return;
        }
    };
    if let Err(reason) = version::check_client_version(version::VERSION, &request.version) {
        reject(inner, connection_id, &reason);
        return;
    }
    if !(inner.config.is_valid_username)(&request.username) {
        reject(inner, connection_id, "invalid username");
        return;
    }
    let username = request.username;
    let is_new_user = match link_preconditions(inner, &username) {
        Ok(is_new_user) => is_new_user,
        Err(reason) => {
            reject(inner, connection_id, &reason);
            return;
        }
    };

    let auth = AuthRequest::new(&username, is_new_user, request.auth);
    inner.emit(&ServerEvent::Authenticate { request: auth.clone() });
    for task in auth.take_deferred() {
        task.await;
    }
    if let Some(reason) = auth.rejection() {
        reject(inner, connection_id, &reason);
        return;
    }

    // The state may have shifted while an async authenticate hook ran: the
    // user could have been joined or kicked, the connection terminated.
    if !inner.lock_state().connections.contains_key(connection_id) {
        return;
    }
    let is_new_user = match link_preconditions(inner, &username) {
        Ok(is_new_user) => is_new_user,
        Err(reason) => {
            reject(inner, connection_id, &reason);
            return;
        }
    };

    if let Some(frame) = inner.encode(&message::accepted(), false) {
        inner.lock_state().send_to(connection_id, &frame);
    }
    if is_new_user {
        join_user(inner, &username);
    }
    link_connection(inner, connection_id, &username);
}

/// Whether `username` may link right now; `Ok(true)` means the link creates
/// the user.
fn link_preconditions(inner: &ServerInner, username: &str) -> Result<bool, String> {
    let state = inner.lock_state();
    match state.users.get(username) {
        None if inner.config.accept_new_users => Ok(true),
        None => Err("server is not accepting new users".to_owned()),
        Some(user) if user.connection_id.is_some() => {
            Err(format!("user {username} is already linked to a connection"))
        }
        Some(_) => Ok(false),
    }
}

fn reject(inner: &ServerInner, connection_id: &str, reason: &str) {
    debug!(connection = connection_id, reason, "link attempt rejected");
    if let Some(frame) = inner.encode(&message::rejected(reason), false) {
        inner.lock_state().send_to(connection_id, &frame);
    }
}

// -- Linked connections -------------------------------------------------------

fn handle_linked_frame(inner: &Arc<ServerInner>, username: &str, text: &str) {
    let msg = match Message::parse(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(user = username, err = %err, "undecodable frame on linked connection");
            unlink_user(inner, username);
            return;
        }
    };
    match msg.kind.as_str() {
        // A second link is a request to restart the session: just unlink.
        message::LINK | message::UNLINK => unlink_user(inner, username),
        message::LEAVE => leave_user(inner, username),
        kind if kind.starts_with(RESERVED_PREFIX) => {
            warn!(user = username, kind, "reserved message type from linked user");
            unlink_user(inner, username);
        }
        _ => inner.emit(&ServerEvent::Message { username: username.to_owned(), message: msg }),
    }
}

// -- Transitions --------------------------------------------------------------

/// Announce and create a user.  The user starts unlinked, so sends to it from
/// `join` listeners fail by construction.
pub(crate) fn join_user(inner: &ServerInner, username: &str) {
    {
        let mut state = inner.lock_state();
        if let Some(frame) = inner.encode(&message::joined(username), true) {
            state.fan_out(&frame, None);
        }
        state.users.insert(username.to_owned(), User { connection_id: None });
    }
    debug!(user = username, "user joined");
    inner.emit(&ServerEvent::Join { username: username.to_owned() });
}

/// Bind a connection to a user, backfill the full user list to it, and
/// announce the link to everyone else.
pub(crate) fn link_connection(inner: &ServerInner, connection_id: &str, username: &str) {
    {
        let mut state = inner.lock_state();
        state.bind(connection_id, username);
        let known: Vec<(String, bool)> = state
            .users
            .iter()
            .map(|(name, user)| (name.clone(), user.connection_id.is_some()))
            .collect();
        for (name, linked) in known {
            if let Some(frame) = inner.encode(&message::joined(&name), false) {
                state.send_to(connection_id, &frame);
            }
            if linked {
                if let Some(frame) = inner.encode(&message::linked(&name), false) {
                    state.send_to(connection_id, &frame);
                }
            }
        }
        // The backfill already told the new connection about itself.
        if let Some(frame) = inner.encode(&message::linked(username), true) {
            state.fan_out(&frame, Some(connection_id));
        }
    }
    debug!(user = username, connection = connection_id, "user linked");
    inner.emit(&ServerEvent::Link { username: username.to_owned() });
}

/// Detach a user from its connection.  The connection itself stays open and
/// returns to the unlinked state; it still receives the announcement.
pub(crate) fn unlink_user(inner: &ServerInner, username: &str) {
    {
        let mut state = inner.lock_state();
        if let Some(frame) = inner.encode(&message::unlinked(username), true) {
            state.fan_out(&frame, None);
        }
        state.unbind(username);
    }
    debug!(user = username, "user unlinked");
    inner.emit(&ServerEvent::Unlink { username: username.to_owned() });
}

/// Remove a user from the session, unlinking it first if needed.  The
/// formerly bound connection additionally receives the departure directly so
/// a leaving client observes its own leave.
pub(crate) fn leave_user(inner: &ServerInner, username: &str) {
    let bound = {
        let state = inner.lock_state();
        state.users.get(username).and_then(|user| user.connection_id.clone())
    };
    if bound.is_some() {
        unlink_user(inner, username);
    }
    {
        let mut state = inner.lock_state();
        if let Some(connection_id) = &bound {
            if let Some(frame) = inner.encode(&message::left(username), false) {
                state.send_to(connection_id, &frame);
            }
        }
        if let Some(frame) = inner.encode(&message::left(username), true) {
            state.fan_out(&frame, None);
        }
        state.users.shift_remove(username);
    }
    debug!(user = username, "user left");
    inner.emit(&ServerEvent::Leave { username: username.to_owned() });
}

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;
