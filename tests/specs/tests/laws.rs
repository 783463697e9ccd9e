// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Round-trip laws and boundary behaviors from the protocol contract.

use std::sync::{Arc, Mutex};

use serde_json::json;

use krmx_core::Message;
use krmx_server::event::{ServerEvent, EVENT_LEAVE};
use krmx_server::{QueryRule, ServerConfig};
use krmx_specs::{start_server, WsPeer};

#[tokio::test]
async fn connection_outlives_its_users() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let mut peer = WsPeer::connect(port).await?;

    // link, unlink, link again on the same socket.
    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;
    peer.expect_user("krmx/joined", "alice").await?;
    peer.expect_user("krmx/linked", "alice").await?;

    peer.send_json(&json!({ "type": "krmx/unlink" })).await?;
    peer.expect_user("krmx/unlinked", "alice").await?;

    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;
    peer.expect_user("krmx/joined", "alice").await?;
    peer.expect_user("krmx/linked", "alice").await?;

    // The same socket can even serve a different user next.
    peer.send_json(&json!({ "type": "krmx/leave" })).await?;
    peer.expect_user("krmx/unlinked", "alice").await?;
    peer.expect_user("krmx/left", "alice").await?;
    peer.link("bob").await?;
    peer.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn garbled_frame_on_unlinked_connection_is_soft() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let mut peer = WsPeer::connect(port).await?;

    peer.send_text("{{{ not json").await?;
    let rejected = peer.expect("krmx/rejected").await?;
    assert_eq!(rejected["payload"]["reason"], "invalid message");

    // The socket remains open and usable.
    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn broadcast_is_permitted_while_closing() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let results = Arc::new(Mutex::new(Vec::new()));
    let handle = server.clone();
    let sink = Arc::clone(&results);
    server.events().on(EVENT_LEAVE, move |e| {
        if let ServerEvent::Leave { .. } = e {
            sink.lock()
                .expect("results")
                .push(handle.broadcast(&Message::new("custom/goodbye", None), None));
        }
        Ok(())
    })?;

    let mut peer = WsPeer::connect(port).await?;
    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;

    server.close().await?;
    let results = results.lock().expect("results");
    assert_eq!(results.len(), 1, "leave listener ran during close");
    assert_eq!(results[0], Ok(()), "broadcast while closing is permitted");
    Ok(())
}

#[tokio::test]
async fn metadata_decorates_every_outbound_frame_iff_enabled() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new().with_metadata(true)).await?;
    let mut peer = WsPeer::connect(port).await?;
    peer.link("alice").await?;
    for _ in 0..3 {
        let frame = peer.recv_json().await?;
        assert!(frame["metadata"]["timestamp"].is_string(), "{frame}");
        assert!(frame["metadata"]["isBroadcast"].is_boolean(), "{frame}");
    }
    server.close().await?;

    let (server, port) = start_server(ServerConfig::new()).await?;
    let mut peer = WsPeer::connect(port).await?;
    peer.link("alice").await?;
    for _ in 0..3 {
        let frame = peer.recv_json().await?;
        assert!(frame.get("metadata").is_none(), "{frame}");
    }
    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn query_parameter_gate_blocks_the_upgrade() -> anyhow::Result<()> {
    let config =
        ServerConfig::new().query_param("token", QueryRule::Equals("letmein".to_owned()));
    let (server, port) = start_server(config).await?;

    assert!(WsPeer::connect(port).await.is_err(), "missing token is refused");
    assert!(
        WsPeer::connect_url(&format!("ws://127.0.0.1:{port}/?token=wrong")).await.is_err(),
        "wrong token is refused"
    );

    let mut peer = WsPeer::connect_url(&format!("ws://127.0.0.1:{port}/?token=letmein")).await?;
    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn endpoint_path_is_honored() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new().path("krmx")).await?;

    assert!(WsPeer::connect(port).await.is_err(), "root path does not serve the endpoint");

    let mut peer = WsPeer::connect_url(&format!("ws://127.0.0.1:{port}/krmx")).await?;
    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn closing_server_delivers_final_frames() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let mut peer = WsPeer::connect(port).await?;
    peer.link("alice").await?;
    peer.expect("krmx/accepted").await?;
    peer.expect_user("krmx/joined", "alice").await?;
    peer.expect_user("krmx/linked", "alice").await?;

    server.close().await?;

    // The departure reached the wire before the socket went down.
    peer.expect_user("krmx/unlinked", "alice").await?;
    peer.expect_user("krmx/left", "alice").await?;
    Ok(())
}

#[tokio::test]
async fn messages_are_delivered_in_transition_order() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let mut observer = WsPeer::connect(port).await?;
    observer.link("observer").await?;
    observer.expect("krmx/accepted").await?;
    observer.expect_user("krmx/joined", "observer").await?;
    observer.expect_user("krmx/linked", "observer").await?;

    // Three users join and link; the observer sees join-before-link per user,
    // in arrival order.
    for name in ["uno", "dos", "tres"] {
        let mut peer = WsPeer::connect(port).await?;
        peer.link(name).await?;
        peer.expect("krmx/accepted").await?;
        observer.expect_user("krmx/joined", name).await?;
        observer.expect_user("krmx/linked", name).await?;
    }

    server.close().await?;
    Ok(())
}
