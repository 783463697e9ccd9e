// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use crate::state::Status;

/// Errors reported to callers of the server API.
///
/// Protocol-level rejections are not errors: they go to the client as
/// `krmx/rejected` frames and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The operation is not allowed in the server's current status.
    InvalidStatus { action: &'static str, status: Status },
    /// A port was requested that differs from the caller-provided listener.
    PortMismatch { requested: u16, bound: u16 },
    /// Binding or inspecting the listener failed.
    Bind(String),
    NoSuchUser(String),
    UserNotLinked(String),
    UserAlreadyExists(String),
    InvalidUsername(String),
    /// The message type uses the reserved `krmx/` prefix.
    ReservedType(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatus { action, status } => {
                write!(f, "cannot {action} when the server is {status}")
            }
            Self::PortMismatch { requested, bound } => write!(
                f,
                "cannot listen on port {requested}: the provided http server is bound to port {bound}"
            ),
            Self::Bind(err) => write!(f, "failed to bind listener: {err}"),
            Self::NoSuchUser(username) => write!(f, "no such user {username}"),
            Self::UserNotLinked(username) => write!(f, "user {username} is not linked"),
            Self::UserAlreadyExists(username) => write!(f, "user {username} already exists"),
            Self::InvalidUsername(username) => write!(f, "invalid username {username}"),
            Self::ReservedType(kind) => {
                write!(f, "message type {kind} uses the reserved krmx/ prefix")
            }
        }
    }
}

impl std::error::Error for ServerError {}
