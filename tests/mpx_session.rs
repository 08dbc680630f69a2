//! MPX sessions against a running engine.

use bytes::Bytes;
use std::time::Duration;

use socket_engine::mpx::{self, MpxEvent, ProtocolVersion, SessionState};
use socket_engine::EngineError;

mod common;

async fn next_matching<F>(conn: &mut mpx::MpxConnection, mut pred: F) -> MpxEvent
where
    F: FnMut(&MpxEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = conn.next_event().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn echo_app_returns_messages() {
    let engine = common::start_engine(common::mpx_config(Some("secret"))).await;
    let client_end = common::client_endpoint(ProtocolVersion::new(1, 0), ProtocolVersion::new(1, 0));

    let mut client = mpx::connect(&client_end, engine.mpx[0], "secret").await.unwrap();
    assert_eq!(client.wait_multiplexed().await.unwrap(), ProtocolVersion::new(1, 0));
    assert_eq!(client.handle.state(), SessionState::Multiplexed);

    client.handle.request_channel("greetings").unwrap();
    next_matching(&mut client, |e| matches!(e, MpxEvent::ChannelAdded { .. })).await;
    client
        .handle
        .send("greetings", Bytes::from_static(b"hello engine"))
        .unwrap();

    match next_matching(&mut client, |e| matches!(e, MpxEvent::Received { .. })).await {
        MpxEvent::Received { channel, data } => {
            assert_eq!(channel, "greetings");
            assert_eq!(&data[..], b"hello engine");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(engine.state.mpx.endpoint.sessions.len(), 1);

    client.handle.close();
    client.finished().await.unwrap();
    engine.stop().await;
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let engine = common::start_engine(common::mpx_config(Some("secret"))).await;
    let client_end = common::client_endpoint(ProtocolVersion::new(1, 0), ProtocolVersion::new(1, 0));

    let mut client = mpx::connect(&client_end, engine.mpx[0], "guess").await.unwrap();
    match client.wait_multiplexed().await {
        Err(EngineError::AuthenticationFailure(_)) => {}
        other => panic!("expected authentication failure, got {:?}", other.map(|v| v.to_string())),
    }
    engine.stop().await;
}

#[tokio::test]
async fn incompatible_versions_disconnect() {
    let mut config = common::mpx_config(None);
    config.mpx.version = ProtocolVersion::new(3, 0);
    config.mpx.minimum_version = ProtocolVersion::new(3, 0);
    let engine = common::start_engine(config).await;
    let client_end = common::client_endpoint(ProtocolVersion::new(2, 0), ProtocolVersion::new(1, 0));

    let mut client = mpx::connect(&client_end, engine.mpx[0], "").await.unwrap();
    match client.wait_multiplexed().await {
        Err(EngineError::ProtocolVersionMismatch(m)) => {
            assert_eq!(m.remote_minimum, ProtocolVersion::new(3, 0));
        }
        other => panic!("expected version mismatch, got {:?}", other.map(|v| v.to_string())),
    }
    engine.stop().await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let engine = common::start_engine(common::mpx_config(None)).await;
    let client_end = common::client_endpoint(ProtocolVersion::new(1, 0), ProtocolVersion::new(1, 0));

    let mut client = mpx::connect(&client_end, engine.mpx[0], "").await.unwrap();
    client.wait_multiplexed().await.unwrap();

    let state = std::sync::Arc::clone(&engine.state);
    engine.stop().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), client.finished())
        .await
        .unwrap();
    assert!(outcome.is_some());
    assert_eq!(state.registry.active_count(), 0);
    assert_eq!(state.accepted.stats().in_use, 0);
}

#[tokio::test]
async fn reload_can_stop_mpx_ports() {
    let engine = common::start_engine(common::mpx_config(None)).await;
    assert_eq!(engine.state.mpx_ports.ports(), vec![0]);

    let mut config = common::mpx_config(None);
    config.mpx.enabled = false;
    engine.state.apply_config(config);

    assert!(engine.state.mpx_ports.ports().is_empty());
    assert!(!engine.state.config.load().mpx.enabled);
    engine.stop().await;
}
