// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side event vocabulary, mirroring the server's.

use krmx_core::{Event, Message};

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_CLOSE: &str = "close";
pub const EVENT_JOIN: &str = "join";
pub const EVENT_LINK: &str = "link";
pub const EVENT_UNLINK: &str = "unlink";
pub const EVENT_LEAVE: &str = "leave";
pub const EVENT_MESSAGE: &str = "message";

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The WebSocket connection is established.
    Connect,
    /// The WebSocket connection is gone.
    Close,
    Join { username: String },
    Link { username: String },
    Unlink { username: String },
    Leave { username: String },
    /// An application message from the server.
    Message { message: Message },
}

impl Event for ClientEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect => EVENT_CONNECT,
            Self::Close => EVENT_CLOSE,
            Self::Join { .. } => EVENT_JOIN,
            Self::Link { .. } => EVENT_LINK,
            Self::Unlink { .. } => EVENT_UNLINK,
            Self::Leave { .. } => EVENT_LEAVE,
            Self::Message { .. } => EVENT_MESSAGE,
        }
    }
}
