//! Fan-out, subscription management and broker ingress, end to end.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use ws_kit::transport::ChannelConsumer;
use ws_kit::{BrokerConsumer, ErrorCode, PublishOptions, Router, RouterConfig};

use ws_kit_test::{
    base_config, connect, JoinRoom, Joined, NoteBody, PublishAck, PublishNote, RoomNote,
    SetTopics, TopicsChanged,
};

fn room_router(config: RouterConfig) -> Router {
    let mut router = Router::new(config);
    router.rpc::<JoinRoom, _, _>(|ctx, req| async move {
        match ctx.topics().subscribe(&req.topic).await {
            Ok(()) => {
                ctx.reply(Joined { topic: req.topic }).await;
            }
            Err(err) => {
                ctx.error(ErrorCode::Invalid, err.to_string(), Some(err.details()))
                    .await;
            }
        }
        Ok(())
    });
    router.rpc::<PublishNote, _, _>(|ctx, req| async move {
        let result = ctx
            .publish::<RoomNote>(
                &req.topic,
                NoteBody { text: req.text },
                PublishOptions {
                    exclude_self: req.exclude_self,
                    meta: None,
                },
            )
            .await;
        match result {
            Ok(ok) => {
                ctx.reply(PublishAck {
                    matched: ok.matched.map(|m| m as u64),
                    capability: format!("{:?}", ok.capability).to_lowercase(),
                })
                .await;
            }
            Err(err) => {
                ctx.error(err.code, "publish failed", None).await;
            }
        }
        Ok(())
    });
    router.rpc::<SetTopics, _, _>(|ctx, req| async move {
        match ctx.topics().replace(&req.topics).await {
            Ok(outcome) => {
                ctx.reply(TopicsChanged {
                    added: outcome.added as u64,
                    removed: outcome.removed as u64,
                    total: outcome.total as u64,
                })
                .await;
            }
            Err(err) => {
                ctx.error(ErrorCode::Invalid, err.to_string(), Some(err.details()))
                    .await;
            }
        }
        Ok(())
    });
    router
}

async fn join(client: &mut ws_kit::transport::TestClient, topic: &str) {
    client
        .send_json(&json!({
            "type": "JOIN_ROOM",
            "meta": { "correlationId": "join" },
            "payload": { "topic": topic },
        }))
        .await;
    let frame = client.next_json().await.unwrap();
    assert_eq!(frame["type"], "JOINED", "join failed: {frame}");
}

#[tokio::test]
async fn fan_out_with_exclude_self_reaches_everyone_else() {
    let router = Arc::new(room_router(base_config()));
    let (mut a, _ha) = connect(&router);
    let (mut b, _hb) = connect(&router);
    let (mut c, _hc) = connect(&router);

    join(&mut a, "room:1").await;
    join(&mut b, "room:1").await;
    join(&mut c, "room:1").await;

    a.send_json(&json!({
        "type": "PUBLISH_NOTE",
        "meta": { "correlationId": "p1" },
        "payload": { "topic": "room:1", "text": "hi", "exclude_self": true },
    }))
    .await;

    // the publisher sees only its ack, with an exact matched count of 2
    let ack = a.next_json().await.unwrap();
    assert_eq!(ack["type"], "PUBLISH_ACK");
    assert_eq!(ack["payload"]["matched"], 2);
    assert_eq!(ack["payload"]["capability"], "exact");

    for receiver in [&mut b, &mut c] {
        let frame = receiver.next_json().await.unwrap();
        assert_eq!(frame["type"], "ROOM_NOTE");
        assert_eq!(frame["meta"]["topic"], "room:1");
        assert_eq!(frame["payload"]["text"], "hi");
    }

    // the sender got no copy: its stream ends with nothing further
    a.close(1000).await;
    assert_eq!(a.next().await, None);
}

#[tokio::test]
async fn publish_without_exclude_reaches_the_sender_too() {
    let router = Arc::new(room_router(base_config()));
    let (mut a, _ha) = connect(&router);
    join(&mut a, "room:9").await;

    a.send_json(&json!({
        "type": "PUBLISH_NOTE",
        "meta": { "correlationId": "p1" },
        "payload": { "topic": "room:9", "text": "echo", "exclude_self": false },
    }))
    .await;

    // fan-out happens inside the handler before the ack
    let note = a.next_json().await.unwrap();
    assert_eq!(note["type"], "ROOM_NOTE");
    let ack = a.next_json().await.unwrap();
    assert_eq!(ack["payload"]["matched"], 1);
}

#[tokio::test]
async fn invalid_topic_and_quota_surface_as_rpc_errors() {
    let mut config = base_config();
    config.limits.max_topics_per_conn = Some(2);
    let router = Arc::new(room_router(config));
    let (mut client, _handle) = connect(&router);

    client
        .send_json(&json!({
            "type": "JOIN_ROOM",
            "meta": { "correlationId": "bad" },
            "payload": { "topic": "no spaces allowed" },
        }))
        .await;
    let frame = client.next_json().await.unwrap();
    assert_eq!(frame["type"], "ERROR");
    assert_eq!(frame["payload"]["code"], "INVALID");
    assert_eq!(frame["payload"]["details"]["reason"], "pattern");

    join(&mut client, "room:1").await;
    join(&mut client, "room:2").await;
    client
        .send_json(&json!({
            "type": "JOIN_ROOM",
            "meta": { "correlationId": "full" },
            "payload": { "topic": "room:3" },
        }))
        .await;
    let frame = client.next_json().await.unwrap();
    assert_eq!(frame["type"], "ERROR");
    assert_eq!(frame["payload"]["details"]["limit"], 2);
}

#[tokio::test]
async fn replace_reports_the_set_difference() {
    let router = Arc::new(room_router(base_config()));
    let (mut client, _handle) = connect(&router);

    client
        .send_json(&json!({
            "type": "SET_TOPICS",
            "meta": { "correlationId": "s1" },
            "payload": { "topics": ["x", "y"] },
        }))
        .await;
    let frame = client.next_json().await.unwrap();
    assert_eq!(frame["payload"], json!({ "added": 2, "removed": 0, "total": 2 }));

    client
        .send_json(&json!({
            "type": "SET_TOPICS",
            "meta": { "correlationId": "s2" },
            "payload": { "topics": ["y", "z", "w"] },
        }))
        .await;
    let frame = client.next_json().await.unwrap();
    assert_eq!(frame["payload"], json!({ "added": 2, "removed": 1, "total": 3 }));

    // equal set: a no-op
    client
        .send_json(&json!({
            "type": "SET_TOPICS",
            "meta": { "correlationId": "s3" },
            "payload": { "topics": ["w", "y", "z"] },
        }))
        .await;
    let frame = client.next_json().await.unwrap();
    assert_eq!(frame["payload"], json!({ "added": 0, "removed": 0, "total": 3 }));
}

#[tokio::test]
async fn router_level_publish_has_no_sender() {
    let router = Arc::new(room_router(base_config()));
    let (mut subscriber, _handle) = connect(&router);
    join(&mut subscriber, "alerts").await;

    let ok = router
        .publish::<RoomNote>(
            "alerts",
            NoteBody {
                text: "maintenance at noon".to_owned(),
            },
            PublishOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(ok.matched, Some(1));

    let frame = subscriber.next_json().await.unwrap();
    assert_eq!(frame["type"], "ROOM_NOTE");
    assert_eq!(frame["payload"]["text"], "maintenance at noon");
}

#[tokio::test]
async fn disconnect_purges_subscriptions() {
    let router = Arc::new(room_router(base_config()));
    let (mut leaver, leave_handle) = connect(&router);
    let (mut stayer, _handle) = connect(&router);
    join(&mut leaver, "room:1").await;
    join(&mut stayer, "room:1").await;

    leaver.close(1000).await;
    leave_handle.await.unwrap();

    let ok = router
        .publish::<RoomNote>(
            "room:1",
            NoteBody {
                text: "after leave".to_owned(),
            },
            PublishOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(ok.matched, Some(1));
    let frame = stayer.next_json().await.unwrap();
    assert_eq!(frame["payload"]["text"], "after leave");
}

#[tokio::test]
async fn broker_ingress_fans_out_and_isolates_bad_envelopes() {
    let router = Arc::new(room_router(base_config()));
    let (mut subscriber, _handle) = connect(&router);
    join(&mut subscriber, "room:1").await;

    let (tx, rx) = mpsc::channel::<String>(8);
    let consumer: Arc<dyn BrokerConsumer> = Arc::new(ChannelConsumer::new(rx));
    router.clone().start_consumer(&consumer).await.unwrap();

    tx.send(
        json!({ "topic": "room:1", "type": "ROOM_NOTE", "payload": { "text": "remote-1" } })
            .to_string(),
    )
    .await
    .unwrap();
    let frame = subscriber.next_json().await.unwrap();
    assert_eq!(frame["payload"]["text"], "remote-1");

    // a bad envelope is skipped, not fatal
    tx.send("{broken".to_owned()).await.unwrap();
    tx.send(
        json!({ "topic": "room:1", "type": "ROOM_NOTE", "payload": { "text": "remote-2" } })
            .to_string(),
    )
    .await
    .unwrap();
    let frame = subscriber.next_json().await.unwrap();
    assert_eq!(frame["payload"]["text"], "remote-2");

    // stop is idempotent; a second start reports the adapter error
    consumer.stop().await;
    consumer.stop().await;
    let err = router.clone().start_consumer(&consumer).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AdapterError);
}
