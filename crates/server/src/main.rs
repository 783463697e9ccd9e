// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use krmx_server::event::{
    ServerEvent, EVENT_JOIN, EVENT_LEAVE, EVENT_LINK, EVENT_MESSAGE, EVENT_UNLINK,
};
use krmx_server::{Server, ServerConfig};
use tracing::{error, info};

/// Standalone krmx session broker.
#[derive(Debug, Parser)]
struct Args {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "KRMX_HOST")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8082, env = "KRMX_PORT")]
    port: u16,

    /// WebSocket endpoint path (leading slash optional).
    #[arg(long, env = "KRMX_PATH")]
    path: Option<String>,

    /// Decorate outbound frames with metadata.
    #[arg(long, env = "KRMX_METADATA")]
    metadata: bool,

    /// Refuse link attempts from usernames that were not joined server-side.
    #[arg(long, env = "KRMX_REJECT_NEW_USERS")]
    reject_new_users: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ServerConfig::new()
        .host(args.host)
        .with_metadata(args.metadata)
        .accept_new_users(!args.reject_new_users);
    if let Some(path) = args.path {
        config = config.path(path);
    }

    let server = Server::new(config);
    log_transitions(&server)?;

    server.listen(Some(args.port)).await?;
    tokio::signal::ctrl_c().await?;
    server.close().await?;
    Ok(())
}

fn log_transitions(server: &Server) -> anyhow::Result<()> {
    let events = server.events();
    events.on(EVENT_JOIN, |e| {
        if let ServerEvent::Join { username } = e {
            info!(user = %username, "user joined");
        }
        Ok(())
    })?;
    events.on(EVENT_LINK, |e| {
        if let ServerEvent::Link { username } = e {
            info!(user = %username, "user linked");
        }
        Ok(())
    })?;
    events.on(EVENT_UNLINK, |e| {
        if let ServerEvent::Unlink { username } = e {
            info!(user = %username, "user unlinked");
        }
        Ok(())
    })?;
    events.on(EVENT_LEAVE, |e| {
        if let ServerEvent::Leave { username } = e {
            info!(user = %username, "user left");
        }
        Ok(())
    })?;
    events.on(EVENT_MESSAGE, |e| {
        if let ServerEvent::Message { username, message } = e {
            info!(user = %username, kind = %message.kind, "message received");
        }
        Ok(())
    })?;
    Ok(())
}
