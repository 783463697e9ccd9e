// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket transport for the broker.

pub mod gate;
pub(crate) mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::server::ServerInner;

/// Build the axum `Router` serving the WebSocket endpoint.
pub(crate) fn build_router(inner: Arc<ServerInner>) -> Router {
    Router::new()
        .route(&inner.config.endpoint_path(), get(ws::upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(inner)
}
