// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-side event vocabulary.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use krmx_core::{Event, Message};

pub const EVENT_LISTEN: &str = "listen";
pub const EVENT_CLOSE: &str = "close";
pub const EVENT_AUTHENTICATE: &str = "authenticate";
pub const EVENT_JOIN: &str = "join";
pub const EVENT_LINK: &str = "link";
pub const EVENT_UNLINK: &str = "unlink";
pub const EVENT_LEAVE: &str = "leave";
pub const EVENT_MESSAGE: &str = "message";

/// Everything observable about the broker, in the order it happens.
#[derive(Clone)]
pub enum ServerEvent {
    /// The server accepted its port and is reachable.
    Listen { port: u16 },
    /// The server finished closing.
    Close,
    /// A link attempt passed all protocol checks and awaits a verdict.
    Authenticate { request: AuthRequest },
    Join { username: String },
    Link { username: String },
    Unlink { username: String },
    Leave { username: String },
    /// An application message from a linked user.
    Message { username: String, message: Message },
}

impl Event for ServerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Listen { .. } => EVENT_LISTEN,
            Self::Close => EVENT_CLOSE,
            Self::Authenticate { .. } => EVENT_AUTHENTICATE,
            Self::Join { .. } => EVENT_JOIN,
            Self::Link { .. } => EVENT_LINK,
            Self::Unlink { .. } => EVENT_UNLINK,
            Self::Leave { .. } => EVENT_LEAVE,
            Self::Message { .. } => EVENT_MESSAGE,
        }
    }
}

/// A pending link attempt handed to `authenticate` listeners.
///
/// Listeners may reject synchronously via [`AuthRequest::reject`], or register
/// asynchronous work with [`AuthRequest::mark_async`]; the server awaits all
/// registered futures before deciding.  The first rejection wins and later
/// ones are ignored.
#[derive(Clone)]
pub struct AuthRequest {
    username: String,
    is_new_user: bool,
    auth: Option<String>,
    verdict: Arc<Mutex<Option<String>>>,
    deferred: Arc<Mutex<Vec<BoxFuture<'static, ()>>>>,
}

impl AuthRequest {
    pub(crate) fn new(username: &str, is_new_user: bool, auth: Option<String>) -> Self {
        Self {
            username: username.to_owned(),
            is_new_user,
            auth,
            verdict: Arc::new(Mutex::new(None)),
            deferred: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether this link attempt would create the user.
    pub fn is_new_user(&self) -> bool {
        self.is_new_user
    }

    /// The `auth` field of the link request, if any.
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    /// Reject the link attempt with a reason sent verbatim to the client.
    /// The first invocation wins; subsequent invocations are no-ops.
    pub fn reject(&self, reason: impl Into<String>) {
        let mut verdict = self.verdict.lock().unwrap_or_else(PoisonError::into_inner);
        if verdict.is_none() {
            *verdict = Some(reason.into());
        }
    }

    /// Defer the verdict until the given future has completed.  The future
    /// typically captures a clone of this request and calls `reject` itself.
    pub fn mark_async(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).push(Box::pin(task));
    }

    pub(crate) fn take_deferred(&self) -> Vec<BoxFuture<'static, ()>> {
        std::mem::take(&mut self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn rejection(&self) -> Option<String> {
        self.verdict.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
