use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;

use super::{MembershipStore, PatternSubscription, StoreMessage, StoreOp};
use crate::Result;

/// Redis-backed membership store shared by every instance of the fleet.
///
/// Commands go over one multiplexed connection; each pattern subscription
/// opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    /// Get the Redis connection for ad-hoc commands
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl MembershipStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.connection();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.connection();
        let written: bool = conn.hset_nx(key, field, value).await?;
        Ok(written)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let added: u64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: u64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let present: bool = conn.sismember(key, member).await?;
        Ok(present)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection();
        let count: u64 = conn.scard(key).await?;
        Ok(count)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let deleted: u64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn atomic(&self, ops: &[StoreOp]) -> Result<()> {
        // MULTI ... EXEC
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::Set { key, value } => pipe.set(key, value).ignore(),
                StoreOp::Del { key } => pipe.del(key).ignore(),
                StoreOp::HSet { key, field, value } => pipe.hset(key, field, value).ignore(),
                StoreOp::HSetNx { key, field, value } => pipe.hset_nx(key, field, value).ignore(),
                StoreOp::SAdd { key, member } => pipe.sadd(key, member).ignore(),
                StoreOp::SRem { key, member } => pipe.srem(key, member).ignore(),
            };
        }

        let mut conn = self.connection();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.connection();
        let receivers: u64 = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn PatternSubscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        tracing::debug!(pattern, "Subscribed to Redis channel pattern");

        Ok(Box::new(RedisSubscription {
            pubsub,
            pattern: pattern.to_string(),
        }))
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    pattern: String,
}

#[async_trait]
impl PatternSubscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<StoreMessage> {
        loop {
            let msg = self.pubsub.on_message().next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    return Some(StoreMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        channel = msg.get_channel_name(),
                        "Failed to get Pub/Sub payload: {}",
                        e
                    );
                }
            }
        }
    }

    async fn unsubscribe(mut self: Box<Self>) -> Result<()> {
        self.pubsub.punsubscribe(&self.pattern).await?;
        tracing::debug!(pattern = %self.pattern, "Unsubscribed from Redis channel pattern");
        Ok(())
    }
}
