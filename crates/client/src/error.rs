// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use crate::client::ClientStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The operation is not allowed in the client's current status.
    InvalidStatus { action: &'static str, status: ClientStatus },
    /// The server rejected the link attempt; the reason is verbatim.
    Rejected(String),
    /// The message type uses the reserved `krmx/` prefix.
    ReservedType(String),
    /// Establishing the WebSocket connection failed.
    Connect(String),
    /// Serializing an outbound message failed.
    Encode(String),
    /// The connection dropped while an operation was pending.
    ConnectionClosed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatus { action, status } => {
                write!(f, "cannot {action} when the client is {status}")
            }
            Self::Rejected(reason) => write!(f, "link rejected: {reason}"),
            Self::ReservedType(kind) => {
                write!(f, "message type {kind} uses the reserved krmx/ prefix")
            }
            Self::Connect(err) => write!(f, "failed to connect: {err}"),
            Self::Encode(err) => write!(f, "failed to encode message: {err}"),
            Self::ConnectionClosed => f.write_str("connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}
