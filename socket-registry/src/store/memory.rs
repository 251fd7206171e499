use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{MembershipStore, PatternSubscription, StoreMessage, StoreOp};
use crate::{Error, Result};

/// Buffered messages per pattern before a slow listener starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

/// In-process membership store with Redis semantics.
///
/// Empty sets and hashes disappear the way they do in Redis. Only reaches
/// connections inside this process, so it suits single-instance
/// deployments and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    data: Mutex<HashMap<String, Value>>,
    patterns: DashMap<String, broadcast::Sender<StoreMessage>>,
    unavailable: AtomicBool,
    publish_attempts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `publish` calls made, including failed ones.
    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn with_set<T>(
        data: &mut HashMap<String, Value>,
        key: &str,
        f: impl FnOnce(&mut HashSet<String>) -> T,
    ) -> Result<T> {
        let value = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()));
        let Value::Set(set) = value else {
            return Err(Error::StoreUnavailable(WRONG_TYPE.into()));
        };
        let out = f(set);
        if set.is_empty() {
            data.remove(key);
        }
        Ok(out)
    }

    fn read_set<'a>(
        data: &'a HashMap<String, Value>,
        key: &str,
    ) -> Result<Option<&'a HashSet<String>>> {
        match data.get(key) {
            None => Ok(None),
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(Error::StoreUnavailable(WRONG_TYPE.into())),
        }
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        match self.inner.data.lock().get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Error::StoreUnavailable(WRONG_TYPE.into())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner
            .data
            .lock()
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check()?;
        let mut data = self.inner.data.lock();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        let Value::Hash(hash) = entry else {
            return Err(Error::StoreUnavailable(WRONG_TYPE.into()));
        };
        hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.check()?;
        let mut data = self.inner.data.lock();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        let Value::Hash(hash) = entry else {
            return Err(Error::StoreUnavailable(WRONG_TYPE.into()));
        };
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check()?;
        match self.inner.data.lock().get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(Error::StoreUnavailable(WRONG_TYPE.into())),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        let mut data = self.inner.data.lock();
        Self::with_set(&mut data, key, |set| set.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        let mut data = self.inner.data.lock();
        if !data.contains_key(key) {
            return Ok(false);
        }
        Self::with_set(&mut data, key, |set| set.remove(member))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let data = self.inner.data.lock();
        Ok(Self::read_set(&data, key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        let data = self.inner.data.lock();
        Ok(Self::read_set(&data, key)?.is_some_and(|set| set.contains(member)))
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        self.check()?;
        let data = self.inner.data.lock();
        Ok(Self::read_set(&data, key)?.map_or(0, |set| set.len() as u64))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.inner.data.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.inner.data.lock().contains_key(key))
    }

    async fn atomic(&self, ops: &[StoreOp]) -> Result<()> {
        self.check()?;
        let mut data = self.inner.data.lock();

        // Stage every touched key so a failing op leaves the keyspace untouched.
        let mut staged: HashMap<&str, Option<Value>> = HashMap::new();
        for op in ops {
            let key = op.key();
            let slot = staged
                .entry(key)
                .or_insert_with(|| data.get(key).cloned());
            apply(slot, op)?;
        }

        for (key, slot) in staged {
            match slot {
                Some(value) => data.insert(key.to_string(), value),
                None => data.remove(key),
            };
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let mut receivers = 0u64;
        for entry in self.inner.patterns.iter() {
            if glob_match(entry.key(), channel) {
                let msg = StoreMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                };
                receivers += entry.value().send(msg).unwrap_or(0) as u64;
            }
        }
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn PatternSubscription>> {
        self.check()?;
        let rx = self
            .inner
            .patterns
            .entry(pattern.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        Ok(Box::new(MemorySubscription {
            store: self.clone(),
            pattern: pattern.to_string(),
            rx,
        }))
    }
}

struct MemorySubscription {
    store: MemoryStore,
    pattern: String,
    rx: broadcast::Receiver<StoreMessage>,
}

#[async_trait]
impl PatternSubscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<StoreMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(pattern = %self.pattern, skipped, "Pattern subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        let MemorySubscription { store, pattern, rx } = *self;
        drop(rx);
        store
            .inner
            .patterns
            .remove_if(&pattern, |_, tx| tx.receiver_count() == 0);
        Ok(())
    }
}

/// Apply one transaction op to a staged key, with Redis type rules and
/// empty collections removed.
fn apply(slot: &mut Option<Value>, op: &StoreOp) -> Result<()> {
    match op {
        StoreOp::Set { value, .. } => *slot = Some(Value::Str(value.clone())),
        StoreOp::Del { .. } => *slot = None,
        StoreOp::HSet { field, value, .. } | StoreOp::HSetNx { field, value, .. } => {
            let hash = match slot.get_or_insert_with(|| Value::Hash(HashMap::new())) {
                Value::Hash(hash) => hash,
                _ => return Err(Error::StoreUnavailable(WRONG_TYPE.into())),
            };
            if matches!(op, StoreOp::HSet { .. }) || !hash.contains_key(field) {
                hash.insert(field.clone(), value.clone());
            }
        }
        StoreOp::SAdd { member, .. } => {
            match slot.get_or_insert_with(|| Value::Set(HashSet::new())) {
                Value::Set(set) => set.insert(member.clone()),
                _ => return Err(Error::StoreUnavailable(WRONG_TYPE.into())),
            };
        }
        StoreOp::SRem { member, .. } => match slot {
            None => {}
            Some(Value::Set(set)) => {
                set.remove(member);
                if set.is_empty() {
                    *slot = None;
                }
            }
            Some(_) => return Err(Error::StoreUnavailable(WRONG_TYPE.into())),
        },
    }
    Ok(())
}

/// Redis-style glob match supporting `*`, `?` and `\` escapes.
fn glob_match(pattern: &str, input: &str) -> bool {
    let (pat, inp) = (pattern.as_bytes(), input.as_bytes());
    let (mut pi, mut ii) = (0, 0);
    let (mut star_pi, mut star_ii) = (usize::MAX, usize::MAX);

    while ii < inp.len() {
        if pi < pat.len() && pat[pi] == b'\\' && pi + 1 < pat.len() {
            if inp[ii] == pat[pi + 1] {
                pi += 2;
                ii += 1;
                continue;
            }
        } else if pi < pat.len() && pat[pi] == b'?' {
            pi += 1;
            ii += 1;
            continue;
        } else if pi < pat.len() && pat[pi] == b'*' {
            star_pi = pi;
            star_ii = ii;
            pi += 1;
            continue;
        } else if pi < pat.len() && pat[pi] == inp[ii] {
            pi += 1;
            ii += 1;
            continue;
        }

        if star_pi == usize::MAX {
            return false;
        }
        pi = star_pi + 1;
        star_ii += 1;
        ii = star_ii;
    }

    while pi < pat.len() && pat[pi] == b'*' {
        pi += 1;
    }
    pi == pat.len()
}
