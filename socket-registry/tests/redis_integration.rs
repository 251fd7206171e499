//! Runs against a live Redis at `REDIS_URL`.
//!
//! `cargo test -p socket-registry -- --ignored`

use serde_json::json;
use serial_test::serial;
use socket_registry::{
    keys, ChannelConnection, Connection, MembershipStore, RedisStore, RelayListener, SocketId,
    SocketManager,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
}

/// Unique name so runs never see each other's keys
fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

async fn instance() -> (Arc<SocketManager>, RedisStore) {
    let store = RedisStore::connect(&get_redis_url()).await.unwrap();
    (Arc::new(SocketManager::new(Arc::new(store.clone()))), store)
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_open_and_close_round_trip() {
    let (manager, store) = instance().await;
    let client = unique("client");
    let (conn, _rx) = ChannelConnection::new(SocketId::new());
    let member = conn.id().to_string();

    manager.on_open(conn.clone(), &client).await.unwrap();
    manager.on_open(conn.clone(), &client).await.unwrap();

    assert_eq!(manager.get_client_id(&*conn).await.unwrap(), client);
    assert_eq!(store.scard(&keys::client_sockets(&client)).await.unwrap(), 1);
    assert!(store.sismember(keys::ACTIVE_SOCKETS, &member).await.unwrap());
    assert!(store
        .hget(&keys::socket_hash(conn.id()), keys::CONNECTED_AT_FIELD)
        .await
        .unwrap()
        .is_some());

    manager.on_close(&*conn, &client).await.unwrap();
    manager.on_close(&*conn, &client).await.unwrap();

    assert_eq!(manager.try_get_client_id(&*conn).await.unwrap(), None);
    assert!(!store.sismember(keys::ACTIVE_SOCKETS, &member).await.unwrap());
    assert!(!store.exists(&keys::client_sockets(&client)).await.unwrap());
    assert!(!store.exists(&keys::socket_hash(conn.id())).await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_subscription_transaction() {
    let (manager, store) = instance().await;
    let client = unique("client");
    let topic = unique("topic");

    manager.subscribe(&client, &topic).await.unwrap();
    manager.subscribe(&client, &topic).await.unwrap();

    assert_eq!(manager.get_topics(&client).await.unwrap(), vec![topic.clone()]);
    assert_eq!(manager.get_subscribers(&topic).await.unwrap(), vec![client.clone()]);
    assert!(store.sismember(keys::ALL_TOPICS, &topic).await.unwrap());

    manager.unsubscribe(&client, &topic).await.unwrap();

    assert!(manager.get_topics(&client).await.unwrap().is_empty());
    assert!(manager.get_subscribers(&topic).await.unwrap().is_empty());

    let _ = store.srem(keys::ALL_TOPICS, &topic).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_broadcast_fans_out_across_instances() {
    let (instance_a, store) = instance().await;
    let (instance_b, _) = instance().await;
    let listener_a = RelayListener::start(instance_a.clone()).await.unwrap();
    let listener_b = RelayListener::start(instance_b.clone()).await.unwrap();

    let topic = unique("sourdough-data");
    let (client_a, client_b) = (unique("client"), unique("client"));
    let (conn_a, mut rx_a) = ChannelConnection::new(SocketId::new());
    let (conn_b, mut rx_b) = ChannelConnection::new(SocketId::new());

    instance_a.on_open(conn_a.clone(), &client_a).await.unwrap();
    instance_b.on_open(conn_b.clone(), &client_b).await.unwrap();
    instance_a.subscribe(&client_a, &topic).await.unwrap();
    instance_b.subscribe(&client_b, &topic).await.unwrap();

    instance_a
        .broadcast(&topic, &json!({"ph": 4.2}))
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for relay")
            .expect("connection channel closed");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["payload"]["ph"], 4.2);
    }

    // Each socket is held by exactly one instance, so exactly one delivery
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());

    // Direct send only reaches the instance holding the socket
    let report = instance_a.send_to_client(&client_b, &json!({})).await.unwrap();
    assert_eq!(report.not_local, 1);
    assert!(!report.reached_local());

    listener_a.stop().await;
    listener_b.stop().await;

    instance_a.unsubscribe(&client_a, &topic).await.unwrap();
    instance_b.unsubscribe(&client_b, &topic).await.unwrap();
    instance_a.on_close(&*conn_a, &client_a).await.unwrap();
    instance_b.on_close(&*conn_b, &client_b).await.unwrap();
    let _ = store.srem(keys::ALL_TOPICS, &topic).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_stopped_listener_no_longer_relays() {
    let (manager, store) = instance().await;
    let listener = RelayListener::start(manager.clone()).await.unwrap();
    listener.stop().await;

    let topic = unique("topic");
    let client = unique("client");
    let (conn, mut rx) = ChannelConnection::new(SocketId::new());
    manager.on_open(conn.clone(), &client).await.unwrap();
    manager.subscribe(&client, &topic).await.unwrap();
    manager.broadcast(&topic, &json!({"n": 1})).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    manager.unsubscribe(&client, &topic).await.unwrap();
    manager.on_close(&*conn, &client).await.unwrap();
    let _ = store.srem(keys::ALL_TOPICS, &topic).await;
}
