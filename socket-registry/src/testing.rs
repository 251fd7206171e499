use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::store::{MembershipStore, MemoryStore, PatternSubscription, StoreOp};
use crate::{Connection, Error, SocketId};

/// Connection whose every write fails, for exercising failure isolation.
pub(crate) struct FailingConnection {
    id: SocketId,
    attempts: AtomicUsize,
}

impl FailingConnection {
    pub(crate) fn new() -> Self {
        Self {
            id: SocketId::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FailingConnection {
    fn id(&self) -> SocketId {
        self.id
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn send(&self, _text: &str) -> Result<(), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Send("broken pipe".into()))
    }
}

/// Store that fails writes to keys ending in a chosen suffix, the way a
/// Redis node rejects commands mid-sequence. Reads always pass through.
///
/// A transaction touching a failing key is rejected whole, like an aborted
/// MULTI/EXEC.
#[derive(Clone)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing_suffix: Arc<Mutex<Option<&'static str>>>,
}

impl FlakyStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            failing_suffix: Arc::default(),
        }
    }

    pub(crate) fn fail_writes_to(&self, suffix: &'static str) {
        *self.failing_suffix.lock() = Some(suffix);
    }

    pub(crate) fn heal(&self) {
        *self.failing_suffix.lock() = None;
    }

    fn check_write(&self, key: &str) -> Result<(), Error> {
        match *self.failing_suffix.lock() {
            Some(suffix) if key.ends_with(suffix) => Err(Error::StoreUnavailable(format!(
                "write to {} rejected",
                key
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MembershipStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.check_write(key)?;
        self.inner.set(key, value).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        self.check_write(key)?;
        self.inner.hset(key, field, value).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, Error> {
        self.check_write(key)?;
        self.inner.hset_nx(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        self.inner.hget(key, field).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.check_write(key)?;
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.check_write(key)?;
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        self.inner.smembers(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.inner.sismember(key, member).await
    }

    async fn scard(&self, key: &str) -> Result<u64, Error> {
        self.inner.scard(key).await
    }

    async fn del(&self, key: &str) -> Result<bool, Error> {
        self.check_write(key)?;
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        self.inner.exists(key).await
    }

    async fn atomic(&self, ops: &[StoreOp]) -> Result<(), Error> {
        for op in ops {
            self.check_write(op.key())?;
        }
        self.inner.atomic(ops).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, Error> {
        self.inner.publish(channel, payload).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn PatternSubscription>, Error> {
        self.inner.psubscribe(pattern).await
    }
}
