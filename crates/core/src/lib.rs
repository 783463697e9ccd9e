// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Krmx wire protocol and event plumbing shared by the server and client.
//!
//! The wire format is one UTF-8 JSON object per WebSocket text frame with a
//! required string `type` field.  Message types starting with `krmx/` are
//! reserved for the protocol itself; everything else is application traffic.

pub mod bus;
pub mod message;
pub mod username;
pub mod version;

pub use bus::{BusError, Event, EventBus, Subscription};
pub use message::{Message, Metadata, RESERVED_PREFIX};
pub use version::VERSION;
