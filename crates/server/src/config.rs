// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;

use crate::transport::gate::QueryRule;

/// Configuration for a krmx server instance.
///
/// Built with chained setters; every field has a sensible default:
///
/// ```
/// use krmx_server::ServerConfig;
///
/// let config = ServerConfig::new().with_metadata(true).accept_new_users(false);
/// ```
pub struct ServerConfig {
    /// Decorate outbound frames with `{ isBroadcast, timestamp }`.
    pub metadata: bool,
    /// When false, only users joined server-side may link.
    pub accept_new_users: bool,
    /// Username validity predicate applied to every link attempt.
    pub is_valid_username: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    pub http: HttpConfig,
}

/// Transport-level configuration.
pub struct HttpConfig {
    /// Host to bind on when no listener is provided.
    pub host: String,
    /// WebSocket endpoint path; leading slash optional.  Defaults to `/`.
    pub path: Option<String>,
    /// Accept gate evaluated against the upgrade request's query parameters.
    pub query_params: HashMap<String, QueryRule>,
    /// Caller-provided listener to reuse instead of binding a fresh one.
    pub listener: Mutex<Option<TcpListener>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metadata: false,
            accept_new_users: true,
            is_valid_username: Arc::new(krmx_core::username::is_valid_username),
            http: HttpConfig {
                host: "127.0.0.1".to_owned(),
                path: None,
                query_params: HashMap::new(),
                listener: Mutex::new(None),
            },
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.metadata = enabled;
        self
    }

    pub fn accept_new_users(mut self, accept: bool) -> Self {
        self.accept_new_users = accept;
        self
    }

    pub fn username_validator(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_valid_username = Arc::new(predicate);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.http.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.http.path = Some(path.into());
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, rule: QueryRule) -> Self {
        self.http.query_params.insert(name.into(), rule);
        self
    }

    /// Reuse an already-bound listener; `listen` then serves on its port.
    pub fn http_listener(self, listener: TcpListener) -> Self {
        *self.http.listener.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(listener);
        self
    }

    /// Route path for the WebSocket endpoint, normalized to a leading slash.
    pub(crate) fn endpoint_path(&self) -> String {
        match self.http.path.as_deref() {
            None | Some("") | Some("/") => "/".to_owned(),
            Some(path) if path.starts_with('/') => path.to_owned(),
            Some(path) => format!("/{path}"),
        }
    }
}
