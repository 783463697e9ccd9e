// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end protocol scenarios over real WebSockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use krmx_core::version;
use krmx_server::event::{ServerEvent, EVENT_AUTHENTICATE, EVENT_MESSAGE};
use krmx_server::ServerConfig;
use krmx_specs::{start_server, wait_until, WsPeer};

fn major_minor() -> (String, String) {
    let mut parts = version::VERSION.split('.');
    (
        parts.next().unwrap_or_default().to_owned(),
        parts.next().unwrap_or_default().to_owned(),
    )
}

fn event_names(server: &krmx_server::Server) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    server
        .events()
        .all(move |e| {
            use krmx_core::Event;
            sink.lock().expect("event log").push(e.name().to_owned());
            Ok(())
        })
        .expect("subscribe");
    log
}

#[tokio::test]
async fn s1_happy_path_link_and_exchange() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let events = event_names(&server);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    server.events().on(EVENT_MESSAGE, move |e| {
        if let ServerEvent::Message { username, message } = e {
            sink.lock().expect("messages").push((username.clone(), message.clone()));
        }
        Ok(())
    })?;

    let (major, minor) = major_minor();
    let mut client = WsPeer::connect(port).await?;
    client
        .send_json(&json!({
            "type": "krmx/link",
            "payload": { "username": "simon", "version": format!("{major}.{minor}.0") },
        }))
        .await?;

    client.expect("krmx/accepted").await?;
    client.expect_user("krmx/joined", "simon").await?;
    client.expect_user("krmx/linked", "simon").await?;

    client.send_json(&json!({ "type": "custom/hello", "payload": 42 })).await?;
    wait_until(
        "the message event",
        || !messages.lock().expect("messages").is_empty(),
        Duration::from_secs(2),
    )
    .await?;
    {
        let messages = messages.lock().expect("messages");
        assert_eq!(messages[0].0, "simon");
        assert_eq!(messages[0].1.kind, "custom/hello");
        assert_eq!(messages[0].1.payload, Some(json!(42)));
    }
    assert_eq!(
        *events.lock().expect("event log"),
        ["authenticate", "join", "link", "message"]
    );

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn s2_authentication_rejection() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    server.events().on(EVENT_AUTHENTICATE, |e| {
        if let ServerEvent::Authenticate { request } = e {
            if request.auth() != Some("secret") {
                request.reject("authentication failed");
            }
        }
        Ok(())
    })?;
    let events = event_names(&server);

    let mut client = WsPeer::connect(port).await?;
    client
        .send_json(&json!({
            "type": "krmx/link",
            "payload": { "username": "simon", "version": version::VERSION, "auth": "wrong" },
        }))
        .await?;
    let rejected = client.expect("krmx/rejected").await?;
    assert_eq!(rejected["payload"]["reason"], "authentication failed");
    assert!(
        !events.lock().expect("event log").iter().any(|e| e == "join" || e == "link"),
        "no join or link after a rejection"
    );

    // The connection survived; a correct attempt on the same socket succeeds.
    client
        .send_json(&json!({
            "type": "krmx/link",
            "payload": { "username": "simon", "version": version::VERSION, "auth": "secret" },
        }))
        .await?;
    client.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn s3_version_skew() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let (major, minor) = major_minor();
    let minor_number: u64 = minor.parse()?;

    let mut client = WsPeer::connect(port).await?;
    let skewed = format!("{major}.{}.0", minor_number + 1);
    client
        .send_json(&json!({
            "type": "krmx/link",
            "payload": { "username": "simon", "version": skewed },
        }))
        .await?;
    let rejected = client.expect("krmx/rejected").await?;
    assert_eq!(
        rejected["payload"]["reason"],
        format!("krmx server version mismatch (server={major}.{minor}.*,client={skewed})")
    );

    // Patch skew is accepted.
    client
        .send_json(&json!({
            "type": "krmx/link",
            "payload": { "username": "simon", "version": format!("{major}.{minor}.9") },
        }))
        .await?;
    client.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn s4_reconnect_across_transports() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;

    let mut alice = WsPeer::connect(port).await?;
    alice.link("alice").await?;
    alice.expect("krmx/accepted").await?;

    let mut bob = WsPeer::connect(port).await?;
    bob.link("bob").await?;
    bob.expect("krmx/accepted").await?;
    bob.expect_user("krmx/joined", "alice").await?;
    bob.expect_user("krmx/linked", "alice").await?;
    bob.expect_user("krmx/joined", "bob").await?;
    bob.expect_user("krmx/linked", "bob").await?;

    // Alice's transport goes away; her session survives.
    alice.close().await?;
    bob.expect_user("krmx/unlinked", "alice").await?;
    bob.assert_silent(Duration::from_millis(200)).await?;

    // A fresh socket picks the session back up: linked without a new joined.
    let mut alice2 = WsPeer::connect(port).await?;
    alice2.link("alice").await?;
    alice2.expect("krmx/accepted").await?;
    bob.expect_user("krmx/linked", "alice").await?;

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn s5_kick() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;
    let events = event_names(&server);

    let mut x = WsPeer::connect(port).await?;
    x.link("xavier").await?;
    x.expect("krmx/accepted").await?;
    x.expect_user("krmx/joined", "xavier").await?;
    x.expect_user("krmx/linked", "xavier").await?;
    let mut y = WsPeer::connect(port).await?;
    y.link("yara").await?;
    y.expect("krmx/accepted").await?;
    x.expect_user("krmx/joined", "yara").await?;
    x.expect_user("krmx/linked", "yara").await?;

    server.kick("xavier")?;

    x.expect_user("krmx/unlinked", "xavier").await?;
    x.expect_user("krmx/left", "xavier").await?;
    // Skip yara's backfill before the kick announcements.
    y.expect_user("krmx/joined", "xavier").await?;
    y.expect_user("krmx/linked", "xavier").await?;
    y.expect_user("krmx/joined", "yara").await?;
    y.expect_user("krmx/linked", "yara").await?;
    y.expect_user("krmx/unlinked", "xavier").await?;
    y.expect_user("krmx/left", "xavier").await?;

    // Both sockets stay open.
    x.assert_silent(Duration::from_millis(200)).await?;
    y.assert_silent(Duration::from_millis(200)).await?;

    let log = events.lock().expect("event log").clone();
    let tail: Vec<&str> = log.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(tail, ["unlink", "leave"], "server emits unlink then leave");

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn s6_reserved_prefix_abuse() -> anyhow::Result<()> {
    let (server, port) = start_server(ServerConfig::new()).await?;

    let mut abuser = WsPeer::connect(port).await?;
    abuser.link("abuser").await?;
    abuser.expect("krmx/accepted").await?;
    abuser.expect_user("krmx/joined", "abuser").await?;
    abuser.expect_user("krmx/linked", "abuser").await?;
    let mut watcher = WsPeer::connect(port).await?;
    watcher.link("watcher").await?;
    watcher.expect("krmx/accepted").await?;
    abuser.expect_user("krmx/joined", "watcher").await?;
    abuser.expect_user("krmx/linked", "watcher").await?;

    abuser.send_json(&json!({ "type": "krmx/custom" })).await?;

    abuser.expect_user("krmx/unlinked", "abuser").await?;
    // Skip the watcher's own backfill.
    watcher.expect_user("krmx/joined", "abuser").await?;
    watcher.expect_user("krmx/linked", "abuser").await?;
    watcher.expect_user("krmx/joined", "watcher").await?;
    watcher.expect_user("krmx/linked", "watcher").await?;
    watcher.expect_user("krmx/unlinked", "abuser").await?;

    // No leave follows and the abuser's socket stays open for a re-link.
    watcher.assert_silent(Duration::from_millis(200)).await?;
    abuser.link("abuser").await?;
    abuser.expect("krmx/accepted").await?;

    server.close().await?;
    Ok(())
}
