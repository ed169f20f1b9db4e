mod common;

use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpListener;

use common::{eventually, test_config, TestClient};
use v_im_backbone::cluster::NodeInfo;
use v_im_backbone::domain::{Envelope, Payload, RoutePath, ServerFrame, Target};
use v_im_backbone::Backbone;

#[tokio::test]
async fn test_offline_user_gets_message_after_reconnect() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let gw1 = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let gw2 = backbone.spawn_gateway("gw-2", None).await.unwrap();

    let mut alice = TestClient::connect(&gw1, "alice", "phone").await;
    let send = r#"{"type":"send","message_id":"m-1","target":{"kind":"user","id":"bob"},"payload":"aGVsbG8="}"#;
    v_im_backbone::ws::handler::dispatch(&gw1, &alice.session, send)
        .await
        .unwrap();
    let (sequence_number, path) = match alice.next_frame().await {
        Some(ServerFrame::SendAck {
            message_id,
            sequence_number,
            path,
        }) => {
            assert_eq!(message_id, "m-1");
            (sequence_number, path)
        }
        other => panic!("expected send_ack, got {:?}", other),
    };
    assert_eq!(path, RoutePath::Slow);

    let storage = backbone.storage().clone();
    assert!(eventually(|| storage.offline_count("bob") == 1).await);

    let mut bob = TestClient::connect(&gw2, "bob", "laptop").await;
    v_im_backbone::ws::handler::dispatch(&gw2, &bob.session, r#"{"type":"pull_offline"}"#)
        .await
        .unwrap();
    match bob.next_frame().await {
        Some(ServerFrame::OfflinePage { items, next_cursor }) => {
            assert_eq!(items.len(), 1);
            assert!(next_cursor.is_none());
            let message = &items[0].message;
            assert_eq!(message.message_id, "m-1");
            assert_eq!(message.sender_id, "alice");
            assert_eq!(message.sequence_number, sequence_number);
            assert_eq!(message.payload, Payload::from("hello"));
        }
        other => panic!("expected offline_page, got {:?}", other),
    }

    // 确认后不再出现在离线拉取中 / Once acked it no longer shows up in a pull
    v_im_backbone::ws::handler::dispatch(&gw2, &bob.session, r#"{"type":"ack","message_id":"m-1"}"#)
        .await
        .unwrap();
    let (items, _) = gw2
        .pull_offline("bob", Some("laptop"), None, None)
        .await
        .unwrap();
    assert!(items.is_empty());
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_online_user_receives_on_fast_path() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let gw1 = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let gw2 = backbone.spawn_gateway("gw-2", None).await.unwrap();
    let _alice = TestClient::connect(&gw1, "alice", "phone").await;
    let mut bob_phone = TestClient::connect(&gw2, "bob", "phone").await;
    let mut bob_laptop = TestClient::connect(&gw1, "bob", "laptop").await;

    let result = backbone
        .router()
        .route(Envelope::new("alice", Target::User("bob".into()), "ping"))
        .await
        .unwrap();
    assert_eq!(result.path, RoutePath::Fast);
    assert_eq!(result.devices.len(), 2);
    assert!(result.devices.iter().all(|d| d.accepted));

    let a = bob_phone.next_delivery().await.unwrap();
    let b = bob_laptop.next_delivery().await.unwrap();
    assert_eq!(a.message_id, result.message.message_id);
    assert_eq!(b.sequence_number, result.message.sequence_number);

    // 全部设备接收时不写离线副本 / No offline copy when every device accepted
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backbone.storage().offline_count("bob"), 0);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_group_fanout_exactly_once_in_order() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let gw1 = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let gw2 = backbone.spawn_gateway("gw-2", None).await.unwrap();
    let membership = backbone.local_membership().unwrap().clone();
    for i in 0..50 {
        membership.join("g1", &format!("member-{}", i)).await.unwrap();
    }

    let _alice = TestClient::connect(&gw1, "alice", "phone").await;
    let mut online = Vec::new();
    for i in 0..10 {
        online.push(TestClient::connect(&gw2, &format!("member-{}", i), "phone").await);
    }

    let first = backbone
        .router()
        .route(Envelope::new("alice", Target::Group("g1".into()), "one"))
        .await
        .unwrap();
    let second = backbone
        .router()
        .route(Envelope::new("alice", Target::Group("g1".into()), "two"))
        .await
        .unwrap();
    assert_eq!(first.path, RoutePath::Group);
    assert!(first.message.sequence_number < second.message.sequence_number);

    for client in online.iter_mut() {
        let m1 = client.next_delivery().await.unwrap();
        let m2 = client.next_delivery().await.unwrap();
        assert_eq!(m1.message_id, first.message.message_id);
        assert_eq!(m2.message_id, second.message.message_id);
        assert!(client
            .next_delivery_within(Duration::from_millis(200))
            .await
            .is_none());
    }

    // 群消息同时进入归档 / Group messages are archived as well
    let storage = backbone.storage().clone();
    assert!(eventually(|| storage.group_history("g1", 0, 10).map(|h| h.len()).unwrap_or(0) == 2).await);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_phone_ack_leaves_the_laptop_offline_copy_alone() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let gw1 = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let gw2 = backbone.spawn_gateway("gw-2", None).await.unwrap();
    let mut phone = TestClient::connect(&gw1, "bob", "phone").await;
    // 笔记本登记在一个不可达的节点上 / The laptop is registered on a node nobody can reach
    backbone
        .registry()
        .register("bob", "laptop", "gw-far", Duration::from_secs(90))
        .await
        .unwrap();

    let result = backbone
        .router()
        .route(Envelope::new("alice", Target::User("bob".into()), "hi"))
        .await
        .unwrap();
    assert_eq!(result.path, RoutePath::Fast);
    let id = result.message.message_id.clone();
    assert_eq!(phone.next_delivery().await.unwrap().message_id, id);

    let storage = backbone.storage().clone();
    assert!(eventually(|| storage.offline_count("bob") == 1).await);
    let ack = format!(r#"{{"type":"ack","message_id":"{}"}}"#, id);
    v_im_backbone::ws::handler::dispatch(&gw1, &phone.session, &ack)
        .await
        .unwrap();

    let mut laptop = TestClient::connect(&gw2, "bob", "laptop").await;
    v_im_backbone::ws::handler::dispatch(&gw2, &laptop.session, r#"{"type":"pull_offline"}"#)
        .await
        .unwrap();
    match laptop.next_frame().await {
        Some(ServerFrame::OfflinePage { items, .. }) => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].message.message_id, id);
        }
        other => panic!("expected offline_page, got {:?}", other),
    }
    let (items, _) = gw1
        .pull_offline("bob", Some("phone"), None, None)
        .await
        .unwrap();
    assert!(items.is_empty());
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_crashed_gateway_lease_lapses_and_sends_go_offline() {
    let mut cfg = test_config();
    cfg.registry.lease_ttl_ms = 300;
    cfg.registry.heartbeat_interval_ms = 100;
    let backbone = Backbone::start(cfg).await.unwrap();
    let registry = backbone.registry();
    let gw1 = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let mut alice = TestClient::connect(&gw1, "alice", "phone").await;
    assert_eq!(registry.lookup("alice").await.unwrap().len(), 1);

    let before = backbone
        .router()
        .route(Envelope::new("bob", Target::User("alice".into()), "are you there"))
        .await
        .unwrap();
    assert_eq!(before.path, RoutePath::Fast);
    assert!(alice.next_delivery().await.is_some());

    // 进程崩溃：不注销、不再续约，节点不可达
    // The process dies: no deregistration, no more renewals, the node is unreachable
    assert!(backbone.crash_gateway("gw-1"));
    let during = backbone
        .router()
        .route(Envelope::new("bob", Target::User("alice".into()), "hello?"))
        .await
        .unwrap();
    assert_eq!(during.path, RoutePath::Slow);

    let mut lapsed = false;
    for _ in 0..50 {
        if registry.lookup("alice").await.unwrap().is_empty() {
            lapsed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(lapsed, "lease lapses within the ttl");
    // 会话从未被干净关闭 / the session was never closed cleanly
    assert_eq!(gw1.session_count(), 1);

    let after = backbone
        .router()
        .route(Envelope::new("bob", Target::User("alice".into()), "still?"))
        .await
        .unwrap();
    assert_eq!(after.path, RoutePath::Slow);
    assert!(after.devices.is_empty());

    let storage = backbone.storage().clone();
    assert!(eventually(|| storage.offline_count("alice") == 2).await);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_fast_path_timeout_falls_back_to_slow_path() {
    let backbone = Backbone::start(test_config()).await.unwrap();

    // 只接受连接、从不应答的节点 / A node that accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    backbone.directory().register_node(NodeInfo {
        node_id: "gw-overloaded".into(),
        http_addr: Some(format!("http://{}", addr)),
        is_alive: true,
    });
    backbone
        .registry()
        .register("bob", "phone", "gw-overloaded", Duration::from_secs(30))
        .await
        .unwrap();

    let result = backbone
        .router()
        .route(Envelope::new("alice", Target::User("bob".into()), "hi"))
        .await
        .unwrap();
    assert_eq!(result.path, RoutePath::Slow);

    let storage = backbone.storage().clone();
    assert!(eventually(|| storage.offline_count("bob") == 1).await);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_offline_message_persists_once() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let result = backbone
        .router()
        .route(Envelope::new("alice", Target::User("bob".into()), "once"))
        .await
        .unwrap();
    // 同一消息再次进入离线主题 / The same message reaches the offline topic again
    backbone.router().slow_path(&result.message).await.unwrap();
    backbone.router().slow_path(&result.message).await.unwrap();

    let bus = backbone.bus().clone();
    assert!(eventually(|| bus.lag("offline-worker", "offline_msg").unwrap_or(1) == 0).await);
    assert_eq!(backbone.storage().offline_count("bob"), 1);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_sequence_strictly_increases_per_target() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let mut last = 0;
    let mut seen = HashSet::new();
    for i in 0..20 {
        let result = backbone
            .router()
            .route(Envelope::new("alice", Target::User("bob".into()), format!("m{}", i).as_str()))
            .await
            .unwrap();
        assert!(result.message.sequence_number > last);
        last = result.message.sequence_number;
        assert!(seen.insert(last));
    }
    let other = backbone
        .router()
        .route(Envelope::new("alice", Target::User("carol".into()), "x"))
        .await
        .unwrap();
    assert_eq!(other.message.sequence_number, 1);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_rejected_content_is_surfaced_to_sender() {
    let mut cfg = test_config();
    cfg.filter.sensitive_words = vec!["forbidden".into()];
    cfg.filter.mode = v_im_backbone::service::filter::SensitiveMode::Reject;
    let backbone = Backbone::start(cfg).await.unwrap();
    let gw = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let mut alice = TestClient::connect(&gw, "alice", "phone").await;

    let send = r#"{"type":"send","message_id":"bad","target":{"kind":"user","id":"bob"},"payload":"Zm9yYmlkZGVu"}"#;
    v_im_backbone::ws::handler::dispatch(&gw, &alice.session, send)
        .await
        .unwrap();
    match alice.next_frame().await {
        Some(ServerFrame::Error {
            message_id, retry, ..
        }) => {
            assert_eq!(message_id.as_deref(), Some("bad"));
            assert!(!retry);
        }
        other => panic!("expected error, got {:?}", other),
    }
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_on_same_device_replaces_old_session() {
    let backbone = Backbone::start(test_config()).await.unwrap();
    let gw1 = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let gw2 = backbone.spawn_gateway("gw-2", None).await.unwrap();

    let mut old = TestClient::connect(&gw1, "bob", "phone").await;
    let _new = TestClient::connect(&gw2, "bob", "phone").await;

    // 旧网关观察到注册中心的替换并踢掉旧会话
    // The old gateway sees the registry replacement and kicks the stale session
    let mut kicked = false;
    while let Some(frame) = old.next_frame().await {
        if matches!(frame, ServerFrame::Kicked { .. }) {
            kicked = true;
            break;
        }
    }
    assert!(kicked);
    let entries = backbone.registry().lookup("bob").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].gateway_node_id, "gw-2");
    assert!(eventually(|| gw1.sessions_of("bob").is_empty()).await);
    backbone.shutdown().await;
}

#[tokio::test]
async fn test_unacked_push_is_stored_offline_after_deadline() {
    let mut cfg = test_config();
    cfg.ack_deadline_ms = 200;
    let backbone = Backbone::start(cfg).await.unwrap();
    let gw = backbone.spawn_gateway("gw-1", None).await.unwrap();
    let mut bob = TestClient::connect(&gw, "bob", "phone").await;
    let mut carol = TestClient::connect(&gw, "carol", "phone").await;

    let to_bob = backbone
        .router()
        .route(Envelope::new("alice", Target::User("bob".into()), "ack me"))
        .await
        .unwrap();
    let to_carol = backbone
        .router()
        .route(Envelope::new("alice", Target::User("carol".into()), "ack me too"))
        .await
        .unwrap();
    assert_eq!(to_bob.path, RoutePath::Fast);
    assert_eq!(to_carol.path, RoutePath::Fast);
    assert!(bob.next_delivery().await.is_some());
    let pushed = carol.next_delivery().await.unwrap();
    gw.record_ack(&carol.session, &pushed.message_id).await.unwrap();

    // bob 未确认，消息补进离线；carol 已确认，不落库
    // bob never acked so the message lands offline; carol acked so nothing is stored
    let storage = backbone.storage().clone();
    assert!(eventually(|| storage.offline_count("bob") == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(storage.offline_count("carol"), 0);
    backbone.shutdown().await;
}
