//! Typed access to the backing key-value store.
//!
//! Everything durable in this service lives behind the [`Kv`] trait: event
//! records, idempotency markers, the CRM token cache, enrichment caches, and
//! the queue's lists. The production implementation is Redis over a
//! multiplexed connection; tests use [`MemoryKv`].
//!
//! The adapter retries transient network faults (connection drops, timeouts)
//! a couple of times before surfacing the error. Application-level errors are
//! never retried here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

/// Retries for transient network faults inside the adapter.
const NETWORK_RETRIES: u32 = 2;
const NETWORK_RETRY_DELAY_MS: u64 = 100;

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()>;
    /// Atomic set-if-absent with TTL. Returns true when this caller won.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<bool>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> anyhow::Result<()>;
    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;
    async fn hincr(&self, key: &str, field: &str, by: i64) -> anyhow::Result<i64>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()>;

    // List / sorted-set primitives for the queue namespace.
    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn lpop(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn llen(&self, key: &str) -> anyhow::Result<u64>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>>;
    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()>;
    /// Remove and return members with score <= `max_score`. Each returned
    /// member was removed by exactly one caller.
    async fn zpop_due(&self, key: &str, max_score: f64) -> anyhow::Result<Vec<String>>;
}

/// Redis-backed implementation over a multiplexed async connection.
#[derive(Clone)]
pub struct RedisKv {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// Run an operation, retrying when Redis reports a connection-level fault.
    async fn with_retries<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut(redis::aio::MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(self.conn.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt < NETWORK_RETRIES => {
                    attempt += 1;
                    warn!(op = op_name, attempt, error = %e, "Transient Redis fault, retrying");
                    tokio::time::sleep(Duration::from_millis(NETWORK_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_connection_refusal()
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.with_retries("get", |mut c| {
            let key = key.to_string();
            async move { c.get(key).await }
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()> {
        self.with_retries("set_ex", |mut c| {
            let (key, value) = (key.to_string(), value.to_string());
            async move { c.set_ex(key, value, ttl_secs).await }
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<bool> {
        let reply: Option<String> = self
            .with_retries("set_nx_ex", |mut c| {
                let (key, value) = (key.to_string(), value.to_string());
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&value)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl_secs)
                        .query_async(&mut c)
                        .await
                }
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.with_retries("del", |mut c| {
            let key = key.to_string();
            async move { c.del::<_, ()>(key).await }
        })
        .await
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.with_retries("exists", |mut c| {
            let key = key.to_string();
            async move { c.exists(key).await }
        })
        .await
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> anyhow::Result<()> {
        let owned: Vec<(String, String)> = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.clone()))
            .collect();
        self.with_retries("hset", |mut c| {
            let key = key.to_string();
            let owned = owned.clone();
            async move { c.hset_multiple::<_, _, _, ()>(key, &owned).await }
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        self.with_retries("hgetall", |mut c| {
            let key = key.to_string();
            async move { c.hgetall(key).await }
        })
        .await
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> anyhow::Result<i64> {
        self.with_retries("hincr", |mut c| {
            let (key, field) = (key.to_string(), field.to_string());
            async move { c.hincr(key, field, by).await }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()> {
        self.with_retries("expire", |mut c| {
            let key = key.to_string();
            async move { c.expire::<_, ()>(key, ttl_secs as i64).await }
        })
        .await
    }

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.with_retries("rpush", |mut c| {
            let (key, value) = (key.to_string(), value.to_string());
            async move { c.rpush::<_, _, ()>(key, value).await }
        })
        .await
    }

    async fn lpop(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.with_retries("lpop", |mut c| {
            let key = key.to_string();
            async move { c.lpop(key, None).await }
        })
        .await
    }

    async fn llen(&self, key: &str) -> anyhow::Result<u64> {
        self.with_retries("llen", |mut c| {
            let key = key.to_string();
            async move { c.llen(key).await }
        })
        .await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>> {
        self.with_retries("lrange", |mut c| {
            let key = key.to_string();
            async move { c.lrange(key, start, stop).await }
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        self.with_retries("zadd", |mut c| {
            let (key, member) = (key.to_string(), member.to_string());
            async move { c.zadd::<_, _, _, ()>(key, member, score).await }
        })
        .await
    }

    async fn zpop_due(&self, key: &str, max_score: f64) -> anyhow::Result<Vec<String>> {
        let candidates: Vec<String> = self
            .with_retries("zrangebyscore", |mut c| {
                let key = key.to_string();
                async move { c.zrangebyscore(key, f64::MIN, max_score).await }
            })
            .await?;

        // ZREM is the ownership claim: only the caller that removed the
        // member processes it, so concurrent workers never double-pop.
        let mut owned = Vec::new();
        for member in candidates {
            let removed: i64 = self
                .with_retries("zrem", |mut c| {
                    let (key, member) = (key.to_string(), member.clone());
                    async move { c.zrem(key, member).await }
                })
                .await?;
            if removed == 1 {
                owned.push(member);
            }
        }
        Ok(owned)
    }
}

/// In-memory [`Kv`] used by unit tests. Tracks the TTL recorded at write time
/// so tests can assert TTL application without sleeping.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    enum Value {
        Str(String),
        Hash(HashMap<String, String>),
        List(VecDeque<String>),
        Zset(Vec<(String, f64)>),
    }

    #[derive(Debug, Clone)]
    struct Entry {
        value: Value,
        ttl_secs: Option<u64>,
    }

    #[derive(Default)]
    pub struct MemoryKv {
        data: Mutex<HashMap<String, Entry>>,
    }

    impl MemoryKv {
        pub fn new() -> Self {
            Self::default()
        }

        /// TTL recorded for a key at its last TTL-bearing write.
        pub fn recorded_ttl(&self, key: &str) -> Option<u64> {
            self.data
                .lock()
                .unwrap()
                .get(key)
                .and_then(|e| e.ttl_secs)
        }

        pub fn keys(&self) -> Vec<String> {
            self.data.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl Kv for MemoryKv {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            let data = self.data.lock().unwrap();
            match data.get(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Ok(Some(s.clone())),
                _ => Ok(None),
            }
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()> {
            self.data.lock().unwrap().insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    ttl_secs: Some(ttl_secs),
                },
            );
            Ok(())
        }

        async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<bool> {
            let mut data = self.data.lock().unwrap();
            if data.contains_key(key) {
                return Ok(false);
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    ttl_secs: Some(ttl_secs),
                },
            );
            Ok(true)
        }

        async fn del(&self, key: &str) -> anyhow::Result<()> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            Ok(self.data.lock().unwrap().contains_key(key))
        }

        async fn hset(&self, key: &str, fields: &[(&str, String)]) -> anyhow::Result<()> {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(key.to_string()).or_insert(Entry {
                value: Value::Hash(HashMap::new()),
                ttl_secs: None,
            });
            if let Value::Hash(h) = &mut entry.value {
                for (f, v) in fields {
                    h.insert(f.to_string(), v.clone());
                }
            }
            Ok(())
        }

        async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
            let data = self.data.lock().unwrap();
            match data.get(key) {
                Some(Entry {
                    value: Value::Hash(h),
                    ..
                }) => Ok(h.clone()),
                _ => Ok(HashMap::new()),
            }
        }

        async fn hincr(&self, key: &str, field: &str, by: i64) -> anyhow::Result<i64> {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(key.to_string()).or_insert(Entry {
                value: Value::Hash(HashMap::new()),
                ttl_secs: None,
            });
            if let Value::Hash(h) = &mut entry.value {
                let current: i64 = h
                    .get(field)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let next = current + by;
                h.insert(field.to_string(), next.to_string());
                Ok(next)
            } else {
                anyhow::bail!("hincr on non-hash key {key}")
            }
        }

        async fn expire(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()> {
            if let Some(entry) = self.data.lock().unwrap().get_mut(key) {
                entry.ttl_secs = Some(ttl_secs);
            }
            Ok(())
        }

        async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(key.to_string()).or_insert(Entry {
                value: Value::List(VecDeque::new()),
                ttl_secs: None,
            });
            if let Value::List(l) = &mut entry.value {
                l.push_back(value.to_string());
            }
            Ok(())
        }

        async fn lpop(&self, key: &str) -> anyhow::Result<Option<String>> {
            let mut data = self.data.lock().unwrap();
            match data.get_mut(key) {
                Some(Entry {
                    value: Value::List(l),
                    ..
                }) => Ok(l.pop_front()),
                _ => Ok(None),
            }
        }

        async fn llen(&self, key: &str) -> anyhow::Result<u64> {
            let data = self.data.lock().unwrap();
            match data.get(key) {
                Some(Entry {
                    value: Value::List(l),
                    ..
                }) => Ok(l.len() as u64),
                _ => Ok(0),
            }
        }

        async fn lrange(
            &self,
            key: &str,
            start: isize,
            stop: isize,
        ) -> anyhow::Result<Vec<String>> {
            let data = self.data.lock().unwrap();
            let Some(Entry {
                value: Value::List(l),
                ..
            }) = data.get(key)
            else {
                return Ok(Vec::new());
            };
            let len = l.len() as isize;
            let norm = |i: isize| -> isize {
                if i < 0 {
                    (len + i).max(0)
                } else {
                    i.min(len - 1)
                }
            };
            if len == 0 {
                return Ok(Vec::new());
            }
            let (start, stop) = (norm(start), norm(stop));
            if start > stop {
                return Ok(Vec::new());
            }
            Ok(l.iter()
                .skip(start as usize)
                .take((stop - start + 1) as usize)
                .cloned()
                .collect())
        }

        async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
            let mut data = self.data.lock().unwrap();
            let entry = data.entry(key.to_string()).or_insert(Entry {
                value: Value::Zset(Vec::new()),
                ttl_secs: None,
            });
            if let Value::Zset(z) = &mut entry.value {
                z.retain(|(m, _)| m != member);
                z.push((member.to_string(), score));
                z.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            }
            Ok(())
        }

        async fn zpop_due(&self, key: &str, max_score: f64) -> anyhow::Result<Vec<String>> {
            let mut data = self.data.lock().unwrap();
            let Some(Entry {
                value: Value::Zset(z),
                ..
            }) = data.get_mut(key)
            else {
                return Ok(Vec::new());
            };
            let due: Vec<String> = z
                .iter()
                .filter(|(_, s)| *s <= max_score)
                .map(|(m, _)| m.clone())
                .collect();
            z.retain(|(_, s)| *s > max_score);
            Ok(due)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn set_nx_is_first_writer_wins() {
            let kv = MemoryKv::new();
            assert!(kv.set_nx_ex("k", "first", 60).await.unwrap());
            assert!(!kv.set_nx_ex("k", "second", 60).await.unwrap());
            assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("first"));
        }

        #[tokio::test]
        async fn recorded_ttl_reflects_last_write() {
            let kv = MemoryKv::new();
            kv.set_ex("k", "v", 120).await.unwrap();
            assert_eq!(kv.recorded_ttl("k"), Some(120));
            kv.hset("h", &[("f", "v".into())]).await.unwrap();
            kv.expire("h", 300).await.unwrap();
            assert_eq!(kv.recorded_ttl("h"), Some(300));
        }

        #[tokio::test]
        async fn list_is_fifo() {
            let kv = MemoryKv::new();
            kv.rpush("q", "a").await.unwrap();
            kv.rpush("q", "b").await.unwrap();
            assert_eq!(kv.llen("q").await.unwrap(), 2);
            assert_eq!(kv.lpop("q").await.unwrap().as_deref(), Some("a"));
            assert_eq!(kv.lpop("q").await.unwrap().as_deref(), Some("b"));
            assert_eq!(kv.lpop("q").await.unwrap(), None);
        }

        #[tokio::test]
        async fn zpop_due_honors_scores() {
            let kv = MemoryKv::new();
            kv.zadd("z", "early", 10.0).await.unwrap();
            kv.zadd("z", "late", 100.0).await.unwrap();
            let due = kv.zpop_due("z", 50.0).await.unwrap();
            assert_eq!(due, vec!["early".to_string()]);
            let rest = kv.zpop_due("z", 200.0).await.unwrap();
            assert_eq!(rest, vec!["late".to_string()]);
        }

        #[tokio::test]
        async fn hincr_counts_from_zero() {
            let kv = MemoryKv::new();
            assert_eq!(kv.hincr("h", "attempts", 1).await.unwrap(), 1);
            assert_eq!(kv.hincr("h", "attempts", 1).await.unwrap(), 2);
        }
    }
}

#[cfg(test)]
pub use memory::MemoryKv;
