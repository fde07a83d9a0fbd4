use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use redis::Value;

use crate::batch::{Batch, BatchOp, Precondition};
use crate::error::StoreError;

/// In-memory state backing `StoreClient::in_memory()`. Mirrors exactly the
/// subset of Redis semantics the coordinator relies on (string/SETEX TTL,
/// hash, set, create-if-absent SET NX EX), so tests exercise the same
/// `StoreClient` API a production deployment uses without a live Redis
/// (SPEC_FULL.md §2 ambient stack: "a lightweight in-memory fake of the
/// store client is provided for tests").
#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn get_string(&mut self, key: &str) -> Option<String> {
        let expired = match self.strings.get(key) {
            Some((_, Some(expiry))) => Instant::now() >= *expiry,
            Some((_, None)) => false,
            None => return None,
        };
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|(v, _)| v.clone())
    }

    fn exists(&mut self, key: &str) -> bool {
        if self.get_string(key).is_some() {
            return true;
        }
        self.hashes.contains_key(key) || self.sets.contains_key(key)
    }
}

enum Backend {
    Redis(MultiplexedConnection),
    Memory(Arc<Mutex<MemoryState>>),
}

/// Client for the shared-state store (spec.md §4.1, C1): GET/SET/SETEX/DEL,
/// hash GET/SET, set ADD/REMOVE/MEMBERS, atomic batch, create-if-absent SET
/// with TTL, and publish/subscribe (the latter via `crate::pubsub`).
///
/// All operations take `&self` — the underlying `MultiplexedConnection` is
/// cheaply cloned per call, matching the teacher's `QueueClient`. Backed
/// either by Redis or, for tests, an in-process fake with equivalent
/// semantics.
pub struct StoreClient {
    backend: Backend,
}

impl StoreClient {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        tracing::info!("connecting to shared-state store");

        let client = redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { backend: Backend::Redis(conn) };
        store.health_check().await?;
        tracing::info!("shared-state store connection established");

        Ok(store)
    }

    /// An in-process fake with no external dependency, used by unit and
    /// integration tests that exercise C2/C3 without a live Redis.
    pub fn in_memory() -> Self {
        Self { backend: Backend::Memory(Arc::new(Mutex::new(MemoryState::default()))) }
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let pong: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;

                if pong != "PONG" {
                    return Err(StoreError::Command(format!("unexpected PING response: {pong}")));
                }
                Ok(())
            }
            Backend::Memory(_) => Ok(()),
        }
    }

    /// The raw Redis connection, for callers that need it directly. `None`
    /// for the in-memory backend.
    pub fn connection(&self) -> Option<MultiplexedConnection> {
        match &self.backend {
            Backend::Redis(conn) => Some(conn.clone()),
            Backend::Memory(_) => None,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let value: Option<String> = redis::cmd("GET")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(value)
            }
            Backend::Memory(state) => Ok(state.lock().unwrap().get_string(key)),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(state) => {
                state.lock().unwrap().strings.insert(key.to_string(), (value.to_string(), None));
                Ok(())
            }
        }
    }

    pub async fn setex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl_seconds)
                    .arg(value)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(state) => {
                let expiry = Instant::now() + Duration::from_secs(ttl_seconds);
                state.lock().unwrap().strings.insert(key.to_string(), (value.to_string(), Some(expiry)));
                Ok(())
            }
        }
    }

    pub async fn del(&self, key: &str) -> Result<bool, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let removed: i64 = redis::cmd("DEL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(removed > 0)
            }
            Backend::Memory(state) => {
                let mut state = state.lock().unwrap();
                let mut removed = state.strings.remove(key).is_some();
                removed |= state.hashes.remove(key).is_some();
                removed |= state.sets.remove(key).is_some();
                Ok(removed)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let count: i64 = redis::cmd("EXISTS")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(count > 0)
            }
            Backend::Memory(state) => Ok(state.lock().unwrap().exists(key)),
        }
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let value: Option<String> = redis::cmd("HGET")
                    .arg(key)
                    .arg(field)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(value)
            }
            Backend::Memory(state) => {
                Ok(state.lock().unwrap().hashes.get(key).and_then(|h| h.get(field).cloned()))
            }
        }
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("HSET")
                    .arg(key)
                    .arg(field)
                    .arg(value)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(state) => {
                state
                    .lock()
                    .unwrap()
                    .hashes
                    .entry(key.to_string())
                    .or_default()
                    .insert(field.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let pairs: Vec<(String, String)> = redis::cmd("HGETALL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(pairs)
            }
            Backend::Memory(state) => Ok(state
                .lock()
                .unwrap()
                .hashes
                .get(key)
                .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()),
        }
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("SADD")
                    .arg(key)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(state) => {
                state.lock().unwrap().sets.entry(key.to_string()).or_default().insert(member.to_string());
                Ok(())
            }
        }
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("SREM")
                    .arg(key)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(state) => {
                if let Some(set) = state.lock().unwrap().sets.get_mut(key) {
                    set.remove(member);
                }
                Ok(())
            }
        }
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let members: Vec<String> = redis::cmd("SMEMBERS")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(members)
            }
            Backend::Memory(state) => Ok(state
                .lock()
                .unwrap()
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()),
        }
    }

    /// Create-if-absent lock primitive: `SET key value NX EX ttl_seconds`.
    /// Returns `true` if the lock was acquired, `false` if it was already held.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let reply: Value = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_seconds)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;

                Ok(!matches!(reply, Value::Nil))
            }
            Backend::Memory(state) => {
                let mut state = state.lock().unwrap();
                if state.get_string(key).is_some() {
                    return Ok(false);
                }
                let expiry = Instant::now() + Duration::from_secs(ttl_seconds);
                state.strings.insert(key.to_string(), (value.to_string(), Some(expiry)));
                Ok(true)
            }
        }
    }

    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(_) => {
                // The in-memory fake has no subscribers to notify; the
                // optional store-channel transport (spec.md §9 Open
                // Question 3) is disabled by default and untested against
                // this backend.
                Ok(())
            }
        }
    }

    /// Apply a `Batch` atomically. Every precondition is checked under
    /// `WATCH`; if any fails, the transaction is unwatched and
    /// `StoreError::TransactionConflict` is returned without touching the
    /// store (spec.md §4.1).
    pub async fn commit_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        match &self.backend {
            Backend::Redis(conn) => self.commit_batch_redis(conn.clone(), batch).await,
            Backend::Memory(state) => {
                let mut state = state.lock().unwrap();

                for (key, precondition) in &batch.preconditions {
                    let satisfied = match precondition {
                        Precondition::Absent => !state.exists(key),
                        Precondition::Equals(expected) => {
                            state.get_string(key).as_deref() == Some(expected.as_str())
                        }
                    };
                    if !satisfied {
                        return Err(StoreError::TransactionConflict(format!(
                            "precondition failed for key {key}"
                        )));
                    }
                }

                // Preconditions held under the same lock we now mutate
                // with, so the whole batch is atomic by construction.
                for op in &batch.ops {
                    match op {
                        BatchOp::Set { key, value } => {
                            state.strings.insert(key.clone(), (value.clone(), None));
                        }
                        BatchOp::SetEx { key, value, ttl_seconds } => {
                            let expiry = Instant::now() + Duration::from_secs(*ttl_seconds);
                            state.strings.insert(key.clone(), (value.clone(), Some(expiry)));
                        }
                        BatchOp::Del { key } => {
                            state.strings.remove(key);
                            state.hashes.remove(key);
                            state.sets.remove(key);
                        }
                        BatchOp::HSet { key, field, value } => {
                            state.hashes.entry(key.clone()).or_default().insert(field.clone(), value.clone());
                        }
                        BatchOp::SAdd { key, member } => {
                            state.sets.entry(key.clone()).or_default().insert(member.clone());
                        }
                        BatchOp::SRem { key, member } => {
                            if let Some(set) = state.sets.get_mut(key) {
                                set.remove(member);
                            }
                        }
                    }
                }

                Ok(())
            }
        }
    }

    async fn commit_batch_redis(&self, mut conn: MultiplexedConnection, batch: &Batch) -> Result<(), StoreError> {
        let watched_keys: Vec<&str> = batch.preconditions.iter().map(|(k, _)| k.as_str()).collect();

        if !watched_keys.is_empty() {
            let mut watch_cmd = redis::cmd("WATCH");
            for key in &watched_keys {
                watch_cmd.arg(*key);
            }
            watch_cmd
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| StoreError::Command(e.to_string()))?;
        }

        for (key, precondition) in &batch.preconditions {
            let satisfied = match precondition {
                Precondition::Absent => {
                    let count: i64 = redis::cmd("EXISTS")
                        .arg(key)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| StoreError::Command(e.to_string()))?;
                    count == 0
                }
                Precondition::Equals(expected) => {
                    let current: Option<String> = redis::cmd("GET")
                        .arg(key)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| StoreError::Command(e.to_string()))?;
                    current.as_deref() == Some(expected.as_str())
                }
            };

            if !satisfied {
                let _: () = redis::cmd("UNWATCH")
                    .query_async(&mut conn)
                    .await
                    .unwrap_or(());
                return Err(StoreError::TransactionConflict(format!(
                    "precondition failed for key {key}"
                )));
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &batch.ops {
            match op {
                BatchOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
                BatchOp::SetEx { key, value, ttl_seconds } => {
                    pipe.cmd("SETEX").arg(key).arg(*ttl_seconds).arg(value);
                }
                BatchOp::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                BatchOp::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value);
                }
                BatchOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
                BatchOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member);
                }
            }
        }

        let reply: Option<Vec<Value>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        match reply {
            Some(_) => Ok(()),
            None => Err(StoreError::TransactionConflict(
                "transaction aborted, a watched key changed concurrently".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_set_get_roundtrips() {
        let store = StoreClient::in_memory();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.del("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_memory_set_nx_ex_rejects_second_acquirer() {
        let store = StoreClient::in_memory();
        assert!(store.set_nx_ex("lock", "a", 5).await.unwrap());
        assert!(!store.set_nx_ex("lock", "b", 5).await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_setex_expires() {
        let store = StoreClient::in_memory();
        store.setex("k", "v", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_batch_is_atomic_on_precondition_failure() {
        let store = StoreClient::in_memory();
        store.set("status", "idle").await.unwrap();

        let batch = Batch::new().expect_value("status", "processing").set("status", "done");

        assert!(store.commit_batch(&batch).await.is_err());
        assert_eq!(store.get("status").await.unwrap().as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn in_memory_hash_and_set_ops() {
        let store = StoreClient::in_memory();
        store.hset("h", "f", "v").await.unwrap();
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("v"));

        store.sadd("s", "a").await.unwrap();
        store.sadd("s", "b").await.unwrap();
        let mut members = store.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        store.srem("s", "a").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["b".to_string()]);
    }
}
