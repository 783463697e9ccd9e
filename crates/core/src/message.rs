// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire codec: the JSON frame envelope and the protocol message catalogue.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Message types starting with this prefix are owned by the protocol.
pub const RESERVED_PREFIX: &str = "krmx/";

// -- Protocol message types ---------------------------------------------------

/// Client to server.
pub const LINK: &str = "krmx/link";
pub const UNLINK: &str = "krmx/unlink";
pub const LEAVE: &str = "krmx/leave";

/// Server to client.
pub const ACCEPTED: &str = "krmx/accepted";
pub const REJECTED: &str = "krmx/rejected";
pub const JOINED: &str = "krmx/joined";
pub const LINKED: &str = "krmx/linked";
pub const UNLINKED: &str = "krmx/unlinked";
pub const LEFT: &str = "krmx/left";

// -- Frame envelope -----------------------------------------------------------

/// A single wire frame: required `type`, optional `payload`, and an optional
/// server-stamped `metadata` object.  Unknown top-level fields on inbound
/// frames are ignored for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Outbound decoration added by the server when metadata is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "isBroadcast")]
    pub is_broadcast: bool,
    /// RFC 3339 UTC timestamp taken when the frame was encoded.
    pub timestamp: String,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self { kind: kind.into(), payload, metadata: None }
    }

    /// Decode a text frame.  Anything that is not a JSON object with a string
    /// `type` field is an invalid frame.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(|source| DecodeError { source })
    }

    /// Whether this message uses the reserved `krmx/` type prefix.
    pub fn is_reserved(&self) -> bool {
        self.kind.starts_with(RESERVED_PREFIX)
    }

    /// Deserialize the payload into a typed shape.  A missing payload is
    /// treated as JSON `null` so required fields fail loudly.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)
    }
}

/// A frame that could not be decoded into a [`Message`].
#[derive(Debug)]
pub struct DecodeError {
    source: serde_json::Error,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message frame: {}", self.source)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

// -- Typed payloads -----------------------------------------------------------

/// Payload of `krmx/link`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPayload {
    pub username: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Payload of `krmx/rejected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub reason: String,
}

/// Payload of the four user lifecycle announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub username: String,
}

// -- Control constructors -----------------------------------------------------

fn with_payload<T: Serialize>(kind: &str, payload: &T) -> Message {
    // Serializing our own payload structs cannot fail; fall back to a bare
    // frame if it somehow does so callers never observe an error here.
    Message::new(kind, serde_json::to_value(payload).ok())
}

pub fn link(username: &str, version: &str, auth: Option<&str>) -> Message {
    with_payload(
        LINK,
        &LinkPayload {
            username: username.to_owned(),
            version: version.to_owned(),
            auth: auth.map(ToOwned::to_owned),
        },
    )
}

pub fn unlink_request() -> Message {
    Message::new(UNLINK, None)
}

pub fn leave_request() -> Message {
    Message::new(LEAVE, None)
}

pub fn accepted() -> Message {
    Message::new(ACCEPTED, None)
}

pub fn rejected(reason: &str) -> Message {
    with_payload(REJECTED, &RejectedPayload { reason: reason.to_owned() })
}

pub fn joined(username: &str) -> Message {
    with_payload(JOINED, &UserPayload { username: username.to_owned() })
}

pub fn linked(username: &str) -> Message {
    with_payload(LINKED, &UserPayload { username: username.to_owned() })
}

pub fn unlinked(username: &str) -> Message {
    with_payload(UNLINKED, &UserPayload { username: username.to_owned() })
}

pub fn left(username: &str) -> Message {
    with_payload(LEFT, &UserPayload { username: username.to_owned() })
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
