//! Liveness: ping cadence, pong deadlines, stale-close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use ws_kit::socket::CloseCode;
use ws_kit::transport::OutFrame;
use ws_kit::{CloseInfo, HeartbeatConfig, Router, RouterConfig};

use ws_kit_test::{connect, GetUser, User};

fn heartbeat_config(interval_ms: u64, timeout_ms: u64) -> RouterConfig {
    RouterConfig {
        heartbeat: HeartbeatConfig::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        ),
        ..RouterConfig::default()
    }
}

fn router_with(config: RouterConfig) -> (Arc<Router>, Arc<Mutex<Vec<CloseInfo>>>) {
    let closes = Arc::new(Mutex::new(Vec::new()));
    let record = closes.clone();
    let mut router = Router::new(config);
    router.on_close(move |_client, info| {
        let record = record.clone();
        async move {
            record.lock().unwrap().push(info);
        }
    });
    router.rpc::<GetUser, _, _>(|ctx, req| async move {
        ctx.reply(User {
            id: req.id,
            name: "Alice".to_owned(),
        })
        .await;
        Ok(())
    });
    (Arc::new(router), closes)
}

#[tokio::test(start_paused = true)]
async fn missed_pong_closes_1011_and_fires_on_close_once() {
    let (router, closes) = router_with(heartbeat_config(100, 50));
    let (mut client, handle) = connect(&router);

    assert_eq!(client.next().await, Some(OutFrame::Ping));
    // never pong: the deadline passes
    let (code, reason) = client.next_close().await.unwrap();
    assert_eq!(code, 1011);
    assert_eq!(reason, "HEARTBEAT_TIMEOUT");

    let info = handle.await.unwrap();
    assert_eq!(info.code, CloseCode::Internal);
    let closes = closes.lock().unwrap();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].code, CloseCode::Internal);
}

#[tokio::test(start_paused = true)]
async fn pong_resets_the_deadline() {
    let (router, _closes) = router_with(heartbeat_config(50, 25));
    let (mut client, handle) = connect(&router);

    for _ in 0..3 {
        assert_eq!(client.next().await, Some(OutFrame::Ping));
        client.pong().await;
    }
    // stop answering: the next round times out
    let (code, _reason) = client.next_close().await.unwrap();
    assert_eq!(code, 1011);
    assert_eq!(handle.await.unwrap().code, CloseCode::Internal);
}

#[tokio::test(start_paused = true)]
async fn traffic_does_not_replace_pongs() {
    // rpc frames are not liveness; only pongs reset the deadline
    let (router, _closes) = router_with(heartbeat_config(40, 20));
    let (mut client, handle) = connect(&router);

    assert_eq!(client.next().await, Some(OutFrame::Ping));
    client
        .send_json(&json!({
            "type": "GET_USER",
            "meta": { "correlationId": "r1" },
            "payload": { "id": "u1" },
        }))
        .await;

    // the reply may race the close, but the connection still dies 1011
    let mut saw_close = None;
    while let Some(frame) = client.next().await {
        if let OutFrame::Close { code, .. } = frame {
            saw_close = Some(code);
            break;
        }
    }
    assert_eq!(saw_close, Some(1011));
    assert_eq!(handle.await.unwrap().code, CloseCode::Internal);
}

#[tokio::test(start_paused = true)]
async fn clean_close_cancels_the_heartbeat() {
    let (router, closes) = router_with(heartbeat_config(50, 25));
    let (mut client, handle) = connect(&router);

    assert_eq!(client.next().await, Some(OutFrame::Ping));
    client.pong().await;
    client.close(1000).await;

    let info = handle.await.unwrap();
    assert_eq!(info.code, CloseCode::Normal);
    assert_eq!(closes.lock().unwrap().len(), 1);
    // no further pings after teardown
    assert_eq!(client.next().await, None);
}
