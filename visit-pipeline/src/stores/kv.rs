use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::time::timeout;

use crate::error::StoreError;

// Writes `ARGV[3]` only if the key still holds what the caller read.
// ARGV[1] == "1" means the caller saw no value at all.
const COMPARE_AND_SET: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current then
        return 0
    end
elseif current ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
";

const REDIS_TIMEOUT: Duration = Duration::from_secs(2);

/// Low-latency key-value store holding the running aggregates.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value` if the key currently holds `expected`, where `None`
    /// means the key must be absent. Returns false when another writer got
    /// there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError>;

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

pub struct RedisKvStore {
    connection: MultiplexedConnection,
    compare_and_set: Script,
}

impl RedisKvStore {
    pub async fn new(addr: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(addr)?;
        let connection = with_timeout(client.get_multiplexed_tokio_connection()).await?;

        Ok(Self {
            connection,
            compare_and_set: Script::new(COMPARE_AND_SET),
        })
    }
}

async fn with_timeout<T>(
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, StoreError> {
    match timeout(REDIS_TIMEOUT, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Unavailable(format!(
            "redis did not answer within {REDIS_TIMEOUT:?}"
        ))),
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        with_timeout(conn.get::<_, Option<String>>(key)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.compare_and_set.prepare_invoke();
        invocation
            .key(key)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value);

        let written: i32 = with_timeout(invocation.invoke_async(&mut conn)).await?;
        Ok(written == 1)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        with_timeout(conn.sadd::<_, _, ()>(key, member)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        with_timeout(conn.smembers::<_, Vec<String>>(key)).await
    }
}

/// In-memory store with fault injection, for tests.
#[derive(Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    unavailable: AtomicBool,
    failures: AtomicU32,
    conflicts: AtomicU32,
    writes: AtomicU32,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails until set back to false.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` calls fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` compare-and-set calls report a conflict.
    pub fn conflict_next(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// Successful compare-and-set writes so far.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn values(&self) -> HashMap<String, String> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values().remove(key)
    }

    fn check(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("kv store is down".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("kv store lock poisoned".to_string())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let values = self.values.lock().map_err(|_| Self::poisoned())?;
        Ok(values.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }

        let mut values = self.values.lock().map_err(|_| Self::poisoned())?;
        if values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        values.insert(key.to_owned(), value.to_owned());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut sets = self.sets.lock().map_err(|_| Self::poisoned())?;
        sets.entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let sets = self.sets.lock().map_err(|_| Self::poisoned())?;
        Ok(sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}
