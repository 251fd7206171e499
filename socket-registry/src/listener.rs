use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::delivery::{collect_local, write_all, DeliveryReport};
use crate::keys;
use crate::manager::SocketManager;
use crate::metrics::METRICS;
use crate::store::{PatternSubscription, StoreMessage};
use crate::Result;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Turns messages published on any topic channel into writes to the
/// connections held by this process.
///
/// One listener per process. Each inbound message is handled on its own
/// task so a slow socket never delays the next relay message.
pub struct RelayListener {
    cancel_token: CancellationToken,
    work_token: CancellationToken,
    receive_handle: Option<JoinHandle<()>>,
    tracker: TaskTracker,
}

impl RelayListener {
    /// Subscribe to every topic channel and start relaying.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial pattern subscription fails. Later
    /// disconnects are retried in the background.
    pub async fn start(manager: Arc<SocketManager>) -> Result<Self> {
        let subscription = manager
            .store()
            .psubscribe(keys::ALL_TOPIC_CHANNELS_PATTERN)
            .await?;
        tracing::info!(
            pattern = keys::ALL_TOPIC_CHANNELS_PATTERN,
            "Relay listener subscribed to topic channels"
        );

        let cancel_token = CancellationToken::new();
        let work_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let receive_handle = Self::spawn_receive_task(
            manager,
            subscription,
            cancel_token.clone(),
            work_token.clone(),
            tracker.clone(),
        );

        Ok(Self {
            cancel_token,
            work_token,
            receive_handle: Some(receive_handle),
            tracker,
        })
    }

    fn spawn_receive_task(
        manager: Arc<SocketManager>,
        subscription: Box<dyn PatternSubscription>,
        cancel_token: CancellationToken,
        work_token: CancellationToken,
        tracker: TaskTracker,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut subscription = subscription;
            loop {
                Self::receive_loop(&mut *subscription, &manager, &cancel_token, &work_token, &tracker)
                    .await;

                if cancel_token.is_cancelled() {
                    match subscription.unsubscribe().await {
                        Ok(()) => tracing::debug!("Relay listener unsubscribed"),
                        Err(e) => tracing::warn!("Failed to unsubscribe relay listener: {}", e),
                    }
                    break;
                }

                tracing::warn!("Relay subscription stream ended, resubscribing");
                let _ = subscription.unsubscribe().await;
                match Self::resubscribe(&manager, &cancel_token).await {
                    Some(fresh) => subscription = fresh,
                    None => break,
                }
            }
            tracing::debug!("Relay receive task shutting down");
        })
    }

    async fn receive_loop(
        subscription: &mut dyn PatternSubscription,
        manager: &Arc<SocketManager>,
        cancel_token: &CancellationToken,
        work_token: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return,
                msg = subscription.next_message() => {
                    let Some(msg) = msg else { return };
                    METRICS.inc_relay_message();

                    let manager = manager.clone();
                    let token = work_token.child_token();
                    tracker.spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {
                                tracing::debug!(channel = %msg.channel, "Relay delivery cancelled");
                            }
                            report = process_message(&manager, &msg) => {
                                tracing::trace!(
                                    channel = %msg.channel,
                                    delivered = report.delivered,
                                    failed = report.failed,
                                    "Relay message processed"
                                );
                            }
                        }
                    });
                }
            }
        }
    }

    /// Retry the pattern subscription until it succeeds or the listener is
    /// stopped.
    async fn resubscribe(
        manager: &SocketManager,
        cancel_token: &CancellationToken,
    ) -> Option<Box<dyn PatternSubscription>> {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return None,
                _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
            }
            match manager
                .store()
                .psubscribe(keys::ALL_TOPIC_CHANNELS_PATTERN)
                .await
            {
                Ok(subscription) => {
                    tracing::info!("Relay listener resubscribed to topic channels");
                    return Some(subscription);
                }
                Err(e) => tracing::error!("Failed to resubscribe relay listener: {}", e),
            }
        }
    }

    /// Unsubscribe, then cancel in-flight deliveries and wait for them.
    pub async fn stop(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.receive_handle.take() {
            let _ = handle.await;
        }

        self.work_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Relay listener stopped");
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        if self.receive_handle.is_some() {
            tracing::debug!("Relay listener dropped without stop, cancelling");
            self.cancel_token.cancel();
            self.work_token.cancel();
        }
    }
}

/// Deliver one relayed message to the subscribers' sockets held by this
/// process. Sockets owned by other instances are skipped; a failed write
/// is logged without affecting the other sockets.
pub async fn process_message(manager: &SocketManager, msg: &StoreMessage) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    let Some(topic) = keys::topic_from_channel(&msg.channel) else {
        tracing::warn!(channel = %msg.channel, "Dropping relay message with malformed channel");
        return report;
    };

    let subscribers = match manager.get_subscribers(topic).await {
        Ok(subscribers) => subscribers,
        Err(e) => {
            tracing::error!(topic, "Failed to read subscribers for relay message: {}", e);
            return report;
        }
    };
    if subscribers.is_empty() {
        tracing::debug!(topic, "No subscribers for relayed topic");
        return report;
    }

    let lookups = join_all(subscribers.iter().map(|client_id| async move {
        (client_id, manager.get_client_sockets(client_id).await)
    }))
    .await;

    let mut targets = Vec::new();
    for (client_id, lookup) in lookups {
        match lookup {
            Ok(socket_ids) => collect_local(manager.local(), &socket_ids, &mut targets, &mut report),
            Err(e) => {
                tracing::warn!(topic, client_id = %client_id, "Failed to read client sockets: {}", e);
            }
        }
    }

    if targets.is_empty() {
        tracing::trace!(topic, remote_sockets = report.not_local, "No local sockets for topic");
        return report;
    }

    write_all(&targets, &msg.payload, &mut report).await;
    tracing::debug!(
        topic,
        delivered = report.delivered,
        failed = report.failed,
        "Relayed message to local sockets"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MembershipStore, MemoryStore};
    use crate::testing::FailingConnection;
    use crate::{ChannelConnection, Connection, SocketId};
    use serde_json::json;

    fn manager() -> (Arc<SocketManager>, MemoryStore) {
        let store = MemoryStore::new();
        (Arc::new(SocketManager::new(Arc::new(store.clone()))), store)
    }

    fn relay(topic: &str, payload: &str) -> StoreMessage {
        StoreMessage {
            channel: keys::topic_channel(topic),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn test_delivers_raw_payload_to_local_subscribers() {
        let (manager, _store) = manager();
        let (s1, mut rx1) = ChannelConnection::new(SocketId::new());
        let (s2, mut rx2) = ChannelConnection::new(SocketId::new());
        manager.on_open(s1.clone(), "c1").await.unwrap();
        manager.on_open(s2.clone(), "c2").await.unwrap();
        manager.subscribe("c1", "t").await.unwrap();
        manager.subscribe("c2", "t").await.unwrap();

        let report = process_message(&manager, &relay("t", "{\"type\":\"X\"}")).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(rx1.recv().await.as_deref(), Some("{\"type\":\"X\"}"));
        assert_eq!(rx2.recv().await.as_deref(), Some("{\"type\":\"X\"}"));
    }

    #[tokio::test]
    async fn test_remote_only_subscriber_gets_no_local_send() {
        let (manager, store) = manager();
        manager.subscribe("c2", "t").await.unwrap();
        store
            .sadd(&keys::client_sockets("c2"), &SocketId::new().to_string())
            .await
            .unwrap();

        let report = process_message(&manager, &relay("t", "{}")).await;

        assert_eq!(report.attempted(), 0);
        assert_eq!(report.not_local, 1);
    }

    #[tokio::test]
    async fn test_failing_socket_does_not_block_sibling() {
        let (manager, _store) = manager();
        let failing = Arc::new(FailingConnection::new());
        let (ok, mut rx_ok) = ChannelConnection::new(SocketId::new());
        manager.on_open(failing.clone(), "c1").await.unwrap();
        manager.on_open(ok.clone(), "c1").await.unwrap();
        manager.subscribe("c1", "t").await.unwrap();

        let report = process_message(&manager, &relay("t", "hello")).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(failing.attempts(), 1);
        assert_eq!(rx_ok.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_malformed_channel_is_dropped() {
        let (manager, _store) = manager();
        let (conn, mut rx) = ChannelConnection::new(SocketId::new());
        manager.on_open(conn.clone(), "c1").await.unwrap();
        manager.subscribe("c1", "t").await.unwrap();

        for channel in ["pubsub:client:c1", "pubsub:topic:", "t"] {
            let msg = StoreMessage {
                channel: channel.to_string(),
                payload: "x".to_string(),
            };
            assert_eq!(process_message(&manager, &msg).await, DeliveryReport::default());
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topic_without_subscribers_does_nothing() {
        let (manager, _store) = manager();
        let report = process_message(&manager, &relay("empty", "x")).await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_start_fails_when_store_is_down() {
        let (manager, store) = manager();
        store.set_unavailable(true);
        assert!(RelayListener::start(manager).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_socket_through_listener() {
        let (manager, _store) = manager();
        let listener = RelayListener::start(manager.clone()).await.unwrap();

        let (conn, mut rx) = ChannelConnection::new(SocketId::new());
        manager.on_open(conn.clone(), "c1").await.unwrap();
        manager.subscribe("c1", "sourdough-data:u1").await.unwrap();
        manager
            .broadcast("sourdough-data:u1", &json!({"temperature": 24.5}))
            .await
            .unwrap();

        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for relay")
            .expect("connection channel closed");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "Value");
        assert_eq!(value["payload"]["temperature"], 24.5);
        assert_eq!(conn.id(), manager.local().lookup(&conn.id()).unwrap().id());

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_pattern() {
        let (manager, store) = manager();
        let listener = RelayListener::start(manager).await.unwrap();
        assert_eq!(store.publish("pubsub:topic:t", "x").await.unwrap(), 1);

        listener.stop().await;
        assert_eq!(store.publish("pubsub:topic:t", "x").await.unwrap(), 0);
    }
}
