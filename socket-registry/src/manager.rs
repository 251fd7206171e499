use serde::Serialize;
use std::sync::Arc;

use crate::delivery::{collect_local, write_all, DeliveryReport};
use crate::error::ensure_present;
use crate::keys;
use crate::local::LocalConnections;
use crate::metrics::METRICS;
use crate::store::{MembershipStore, StoreOp};
use crate::{Connection, ConnectionHandle, Envelope, Error, Result, SocketId};

/// Source of the connect timestamp (unix seconds).
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Registry of connections, clients and topic subscriptions.
///
/// Membership lives in the shared store so every instance sees it; the live
/// connection handles stay in this process's [`LocalConnections`].
///
/// Store failures on mutating operations are logged and absorbed so a
/// hiccup in the shared store never tears down a connection. Invalid
/// arguments always propagate.
pub struct SocketManager {
    store: Arc<dyn MembershipStore>,
    local: LocalConnections,
    clock: Clock,
}

impl SocketManager {
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self {
            store,
            local: LocalConnections::new(),
            clock: Arc::new(|| chrono::Utc::now().timestamp()),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &Arc<dyn MembershipStore> {
        &self.store
    }

    pub fn local(&self) -> &LocalConnections {
        &self.local
    }

    /// Look up a connection accepted by this instance.
    pub fn try_get_local_socket(&self, socket_id: &SocketId) -> Option<ConnectionHandle> {
        self.local.lookup(socket_id)
    }

    /// Register `connection` as owned by `client_id`.
    ///
    /// Idempotent: repeating the call leaves set cardinalities and the
    /// original connect timestamp unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `client_id` is blank.
    pub async fn on_open(&self, connection: ConnectionHandle, client_id: &str) -> Result<()> {
        ensure_present(client_id, "client_id must not be empty")?;

        let socket_id = connection.id();
        self.local.register(socket_id, connection);

        match self.record_open(socket_id, client_id).await {
            Ok(()) => {
                METRICS.inc_connection_opened();
                tracing::info!(%socket_id, client_id, "Socket opened");
            }
            Err(e) => {
                tracing::error!(%socket_id, client_id, "Failed to record socket open: {}", e);
            }
        }
        Ok(())
    }

    async fn record_open(&self, socket_id: SocketId, client_id: &str) -> Result<()> {
        let socket_hash = keys::socket_hash(socket_id);
        let member = socket_id.to_string();
        let connected_at = (self.clock)().to_string();

        let ops = [
            StoreOp::hset(&socket_hash, keys::CLIENT_ID_FIELD, client_id),
            StoreOp::hset_nx(&socket_hash, keys::CONNECTED_AT_FIELD, connected_at),
            StoreOp::set(keys::socket_to_client(socket_id), client_id),
            StoreOp::sadd(keys::ACTIVE_SOCKETS, &member),
            StoreOp::sadd(keys::client_sockets(client_id), &member),
        ];
        self.store.atomic(&ops).await
    }

    /// Forget `connection`. The local handle is dropped first, whatever the
    /// store says.
    ///
    /// Cleanup follows the owner recorded in the store rather than the
    /// caller's `client_id`; a mismatch is logged. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `client_id` is blank.
    pub async fn on_close(&self, connection: &dyn Connection, client_id: &str) -> Result<()> {
        ensure_present(client_id, "client_id must not be empty")?;

        let socket_id = connection.id();
        self.local.remove(&socket_id);

        match self.record_close(socket_id, client_id).await {
            Ok(()) => {
                METRICS.inc_connection_closed();
                tracing::info!(
                    %socket_id,
                    provided_client_id = client_id,
                    "Socket closed"
                );
            }
            Err(e) => {
                tracing::error!(%socket_id, client_id, "Failed to record socket close: {}", e);
            }
        }
        Ok(())
    }

    async fn record_close(&self, socket_id: SocketId, client_id: &str) -> Result<()> {
        let socket_to_client = keys::socket_to_client(socket_id);
        let stored_owner = self
            .store
            .get(&socket_to_client)
            .await?
            .filter(|owner| !owner.trim().is_empty());

        match stored_owner.as_deref() {
            Some(owner) if owner != client_id => {
                tracing::warn!(
                    %socket_id,
                    provided_client_id = client_id,
                    stored_client_id = owner,
                    "Client ID mismatch during close"
                );
            }
            Some(_) => {}
            None => {
                tracing::warn!(
                    %socket_id,
                    key = %socket_to_client,
                    "Socket closed but no associated client ID found"
                );
            }
        }

        let member = socket_id.to_string();
        let mut ops = vec![
            StoreOp::del(keys::socket_hash(socket_id)),
            StoreOp::del(&socket_to_client),
            StoreOp::srem(keys::ACTIVE_SOCKETS, &member),
        ];

        // The mapping and the owner's set entry go in the same transaction,
        // so a failed close leaves the owner readable for a retry.
        let mut listed = false;
        if let Some(owner) = stored_owner.as_deref() {
            let client_sockets = keys::client_sockets(owner);
            listed = self.store.sismember(&client_sockets, &member).await?;
            if !listed {
                tracing::warn!(
                    %socket_id,
                    key = %client_sockets,
                    "Socket was not present in its owner's socket set"
                );
            }
            ops.push(StoreOp::srem(client_sockets, &member));
        }

        self.store.atomic(&ops).await?;

        if let Some(owner) = stored_owner.as_deref().filter(|_| listed) {
            if let Ok(0) = self.store.scard(&keys::client_sockets(owner)).await {
                tracing::info!(
                    %socket_id,
                    client_id = owner,
                    "Client has no more active connections"
                );
            }
        }
        Ok(())
    }

    /// Owner of `connection`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the socket is not registered anywhere; use
    /// [`try_get_client_id`](Self::try_get_client_id) when absence is expected.
    pub async fn get_client_id(&self, connection: &dyn Connection) -> Result<String> {
        let socket_id = connection.id();
        self.try_get_client_id(connection)
            .await?
            .ok_or(Error::NotFound(socket_id))
    }

    pub async fn try_get_client_id(&self, connection: &dyn Connection) -> Result<Option<String>> {
        let stored = self
            .store
            .get(&keys::socket_to_client(connection.id()))
            .await?;
        Ok(stored.filter(|client_id| !client_id.is_empty()))
    }

    /// Subscribe `client_id` to `topic`. Both directions of the relationship
    /// and the global topic set are written in one transaction.
    pub async fn subscribe(&self, client_id: &str, topic: &str) -> Result<()> {
        ensure_present(client_id, "client_id must not be empty")?;
        ensure_present(topic, "topic must not be empty")?;

        let ops = [
            StoreOp::sadd(keys::ALL_TOPICS, topic),
            StoreOp::sadd(keys::client_topics(client_id), topic),
            StoreOp::sadd(keys::topic_subscribers(topic), client_id),
        ];
        match self.store.atomic(&ops).await {
            Ok(()) => tracing::info!(client_id, topic, "Client subscribed to topic"),
            Err(e) => tracing::error!(
                client_id,
                topic,
                "Failed to execute subscription transaction: {}",
                e
            ),
        }
        Ok(())
    }

    /// Inverse of [`subscribe`](Self::subscribe). The topic stays in the
    /// global topic set.
    pub async fn unsubscribe(&self, client_id: &str, topic: &str) -> Result<()> {
        ensure_present(client_id, "client_id must not be empty")?;
        ensure_present(topic, "topic must not be empty")?;

        let ops = [
            StoreOp::srem(keys::client_topics(client_id), topic),
            StoreOp::srem(keys::topic_subscribers(topic), client_id),
        ];
        match self.store.atomic(&ops).await {
            Ok(()) => tracing::info!(client_id, topic, "Client unsubscribed from topic"),
            Err(e) => tracing::error!(
                client_id,
                topic,
                "Failed to execute unsubscription transaction: {}",
                e
            ),
        }
        Ok(())
    }

    pub async fn get_topics(&self, client_id: &str) -> Result<Vec<String>> {
        ensure_present(client_id, "client_id must not be empty")?;
        self.store.smembers(&keys::client_topics(client_id)).await
    }

    pub async fn get_subscribers(&self, topic: &str) -> Result<Vec<String>> {
        ensure_present(topic, "topic must not be empty")?;
        self.store.smembers(&keys::topic_subscribers(topic)).await
    }

    /// Socket ids registered for `client_id` on any instance. Malformed
    /// entries are logged and skipped.
    pub async fn get_client_sockets(&self, client_id: &str) -> Result<Vec<SocketId>> {
        ensure_present(client_id, "client_id must not be empty")?;
        let members = self.store.smembers(&keys::client_sockets(client_id)).await?;

        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse::<SocketId>() {
                Ok(socket_id) => Some(socket_id),
                Err(_) => {
                    tracing::warn!(
                        client_id,
                        member = %member,
                        "Invalid socket id found in client socket set"
                    );
                    None
                }
            })
            .collect())
    }

    /// Publish `message` to every subscriber of `topic` on every instance.
    ///
    /// Fire-and-forget: nothing is published when the topic has no
    /// subscribers, and serialization or store failures are only logged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `topic` is blank.
    pub async fn broadcast<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        self.broadcast_envelope(topic, &Envelope::new(message)).await
    }

    pub async fn broadcast_envelope<T: Serialize>(
        &self,
        topic: &str,
        envelope: &Envelope<'_, T>,
    ) -> Result<()> {
        ensure_present(topic, "topic must not be empty")?;

        let subscribers = match self.get_subscribers(topic).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::error!(topic, "Failed to read subscribers before publish: {}", e);
                return Ok(());
            }
        };
        if subscribers.is_empty() {
            METRICS.inc_broadcast_skipped();
            tracing::debug!(topic, "No subscribers found for topic. Skipping publish.");
            return Ok(());
        }

        let message_type = envelope.message_type.as_ref();
        tracing::info!(
            topic,
            message_type,
            subscriber_count = subscribers.len(),
            "Publishing message to topic channel"
        );

        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic, message_type, "Failed to serialize broadcast: {}", e);
                return Ok(());
            }
        };

        let channel = keys::topic_channel(topic);
        match self.store.publish(&channel, &payload).await {
            Ok(receivers) => {
                METRICS.inc_broadcast_published();
                tracing::debug!(topic, channel = %channel, receivers, "Published message");
            }
            Err(e) => {
                tracing::error!(topic, channel = %channel, "Failed to publish message: {}", e);
            }
        }
        Ok(())
    }

    /// Write `message` to the sockets of `client_id` that live on this
    /// instance.
    ///
    /// Sockets held by other instances are not reached; route through a
    /// topic the client subscribes to for fleet-wide delivery. The report
    /// says how many sockets were written and how many were remote.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `client_id` is blank.
    pub async fn send_to_client<T: Serialize>(
        &self,
        client_id: &str,
        message: &T,
    ) -> Result<DeliveryReport> {
        self.send_envelope_to_client(client_id, &Envelope::new(message))
            .await
    }

    pub async fn send_envelope_to_client<T: Serialize>(
        &self,
        client_id: &str,
        envelope: &Envelope<'_, T>,
    ) -> Result<DeliveryReport> {
        ensure_present(client_id, "client_id must not be empty")?;
        let mut report = DeliveryReport::default();

        let socket_ids = match self.get_client_sockets(client_id).await {
            Ok(socket_ids) => socket_ids,
            Err(e) => {
                tracing::error!(client_id, "Failed to read client sockets: {}", e);
                return Ok(report);
            }
        };
        if socket_ids.is_empty() {
            tracing::warn!(client_id, "Attempted to send message to client, but no sockets found");
            return Ok(report);
        }

        let message_type = envelope.message_type.as_ref();
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(client_id, message_type, "Failed to serialize direct message: {}", e);
                return Ok(report);
            }
        };

        let mut targets = Vec::new();
        collect_local(&self.local, &socket_ids, &mut targets, &mut report);

        if targets.is_empty() {
            METRICS.inc_direct_send_unreached();
            tracing::info!(
                client_id,
                message_type,
                remote_sockets = report.not_local,
                "No local, available sockets for client; direct message not delivered"
            );
            return Ok(report);
        }

        write_all(&targets, &payload, &mut report).await;
        tracing::debug!(
            client_id,
            message_type,
            delivered = report.delivered,
            failed = report.failed,
            remote_sockets = report.not_local,
            "Direct message sent to local sockets"
        );
        Ok(report)
    }
}
