use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("broker unreachable")]
    Unreachable,
}

/// Priority scores leave room for a monotonic sequence number so jobs within
/// one priority tier stay FIFO.
const PRIORITY_SHIFT: f64 = 1e9;

/// Ephemeral state: rate-limit windows and the job queues. Backed by Redis
/// when configured, otherwise by in-process structures (single-node mode).
#[derive(Clone)]
pub enum Broker {
    Redis(RedisBroker),
    Memory(Arc<MemoryBroker>),
}

#[derive(Clone)]
pub struct RedisBroker {
    manager: ConnectionManager,
    prefix: String,
}

#[derive(Default)]
pub struct MemoryBroker {
    windows: DashMap<String, (u64, Instant)>,
    queues: Mutex<HashMap<String, BTreeMap<(i64, u64), String>>>,
    tenants: Mutex<HashMap<String, HashSet<String>>>,
    delayed: Mutex<HashMap<String, BTreeMap<(u64, u64), String>>>,
    active: Mutex<HashMap<String, HashMap<String, u64>>>,
    seq: AtomicU64,
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Broker {
    pub async fn connect(
        host: &str,
        port: u16,
        prefix: &str,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
        let manager = client.get_connection_manager().await?;
        info!(host, port, "connected to key/value broker");
        Ok(Broker::Redis(RedisBroker {
            manager,
            prefix: prefix.to_string(),
        }))
    }

    pub fn memory() -> Self {
        Broker::Memory(Arc::new(MemoryBroker::default()))
    }

    fn key(&self, suffix: &str) -> String {
        match self {
            Broker::Redis(r) => format!("{}:{suffix}", r.prefix),
            Broker::Memory(_) => suffix.to_string(),
        }
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                if pong == "PONG" {
                    Ok(())
                } else {
                    Err(BrokerError::Unreachable)
                }
            }
            Broker::Memory(_) => Ok(()),
        }
    }

    /// Increments a windowed counter, setting its expiry on first touch.
    /// Returns the value after the increment.
    pub async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, BrokerError> {
        let key = self.key(key);
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let count: u64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
                if count == 1 {
                    let _: () = redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(ttl.as_secs())
                        .query_async(&mut conn)
                        .await?;
                }
                Ok(count)
            }
            Broker::Memory(mem) => {
                let now = Instant::now();
                let mut entry = mem.windows.entry(key).or_insert((0, now + ttl));
                if entry.1 <= now {
                    *entry = (0, now + ttl);
                }
                entry.0 += 1;
                Ok(entry.0)
            }
        }
    }

    /// Reads a set of windowed counters; absent or expired windows count 0.
    pub async fn window_counts(&self, keys: &[String]) -> Result<Vec<u64>, BrokerError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let mut cmd = redis::cmd("MGET");
                for key in keys {
                    cmd.arg(self.key(key));
                }
                let values: Vec<Option<u64>> = cmd.query_async(&mut conn).await?;
                Ok(values.into_iter().map(Option::unwrap_or_default).collect())
            }
            Broker::Memory(mem) => {
                let now = Instant::now();
                Ok(keys
                    .iter()
                    .map(|key| match mem.windows.get(key.as_str()) {
                        Some(entry) if entry.1 > now => entry.0,
                        _ => 0,
                    })
                    .collect())
            }
        }
    }

    /// Enqueues a payload into a per-(queue, tenant) waiting list, ordered by
    /// (priority, arrival).
    pub async fn queue_push(
        &self,
        queue: &str,
        tenant: &str,
        payload: &str,
        priority: i64,
    ) -> Result<(), BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let seq: u64 = redis::cmd("INCR")
                    .arg(self.key("seq"))
                    .query_async(&mut conn)
                    .await?;
                let score = priority as f64 * PRIORITY_SHIFT + seq as f64;
                let _: () = redis::cmd("ZADD")
                    .arg(self.key(&format!("q:{queue}:{tenant}")))
                    .arg(score)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await?;
                let _: () = redis::cmd("SADD")
                    .arg(self.key(&format!("tenants:{queue}")))
                    .arg(tenant)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Broker::Memory(mem) => {
                let seq = mem.seq.fetch_add(1, Ordering::Relaxed);
                mem.queues
                    .lock()
                    .unwrap()
                    .entry(format!("q:{queue}:{tenant}"))
                    .or_default()
                    .insert((priority, seq), payload.to_string());
                mem.tenants
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .insert(tenant.to_string());
                Ok(())
            }
        }
    }

    /// Pops the highest-priority waiting payload for one tenant.
    pub async fn queue_pop(&self, queue: &str, tenant: &str) -> Result<Option<String>, BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                    .arg(self.key(&format!("q:{queue}:{tenant}")))
                    .arg(1)
                    .query_async(&mut conn)
                    .await?;
                Ok(popped.into_iter().next().map(|(payload, _)| payload))
            }
            Broker::Memory(mem) => {
                let mut queues = mem.queues.lock().unwrap();
                let Some(tree) = queues.get_mut(&format!("q:{queue}:{tenant}")) else {
                    return Ok(None);
                };
                let Some(key) = tree.keys().next().copied() else {
                    return Ok(None);
                };
                Ok(tree.remove(&key))
            }
        }
    }

    /// Tenants that have (or recently had) waiting jobs on a queue.
    pub async fn queue_tenants(&self, queue: &str) -> Result<Vec<String>, BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let tenants: Vec<String> = redis::cmd("SMEMBERS")
                    .arg(self.key(&format!("tenants:{queue}")))
                    .query_async(&mut conn)
                    .await?;
                Ok(tenants)
            }
            Broker::Memory(mem) => Ok(mem
                .tenants
                .lock()
                .unwrap()
                .get(queue)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()),
        }
    }

    pub async fn waiting_count(&self, queue: &str) -> Result<u64, BrokerError> {
        let tenants = self.queue_tenants(queue).await?;
        let mut total = 0u64;
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                for tenant in tenants {
                    let count: u64 = redis::cmd("ZCARD")
                        .arg(self.key(&format!("q:{queue}:{tenant}")))
                        .query_async(&mut conn)
                        .await?;
                    total += count;
                }
            }
            Broker::Memory(mem) => {
                let queues = mem.queues.lock().unwrap();
                for tenant in tenants {
                    total += queues
                        .get(&format!("q:{queue}:{tenant}"))
                        .map(|tree| tree.len() as u64)
                        .unwrap_or_default();
                }
            }
        }
        Ok(total)
    }

    /// Parks a payload until its due time.
    pub async fn delayed_push(
        &self,
        queue: &str,
        payload: &str,
        due_unix: u64,
    ) -> Result<(), BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let _: () = redis::cmd("ZADD")
                    .arg(self.key(&format!("delayed:{queue}")))
                    .arg(due_unix as f64)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Broker::Memory(mem) => {
                let seq = mem.seq.fetch_add(1, Ordering::Relaxed);
                mem.delayed
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .insert((due_unix, seq), payload.to_string());
                Ok(())
            }
        }
    }

    /// Removes and returns payloads whose due time has passed.
    pub async fn delayed_due(
        &self,
        queue: &str,
        now_unix: u64,
        limit: usize,
    ) -> Result<Vec<String>, BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let key = self.key(&format!("delayed:{queue}"));
                let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg("-inf")
                    .arg(now_unix as f64)
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit)
                    .query_async(&mut conn)
                    .await?;
                for payload in &due {
                    let _: () = redis::cmd("ZREM")
                        .arg(&key)
                        .arg(payload)
                        .query_async(&mut conn)
                        .await?;
                }
                Ok(due)
            }
            Broker::Memory(mem) => {
                let mut delayed = mem.delayed.lock().unwrap();
                let Some(tree) = delayed.get_mut(queue) else {
                    return Ok(Vec::new());
                };
                let due_keys: Vec<(u64, u64)> = tree
                    .range(..(now_unix + 1, 0))
                    .take(limit)
                    .map(|(k, _)| *k)
                    .collect();
                Ok(due_keys.into_iter().filter_map(|k| tree.remove(&k)).collect())
            }
        }
    }

    pub async fn delayed_count(&self, queue: &str) -> Result<u64, BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let count: u64 = redis::cmd("ZCARD")
                    .arg(self.key(&format!("delayed:{queue}")))
                    .query_async(&mut conn)
                    .await?;
                Ok(count)
            }
            Broker::Memory(mem) => Ok(mem
                .delayed
                .lock()
                .unwrap()
                .get(queue)
                .map(|tree| tree.len() as u64)
                .unwrap_or_default()),
        }
    }

    /// Marks a job active, stamped with its start time for stuck detection.
    pub async fn active_add(&self, queue: &str, job_id: &str) -> Result<(), BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let _: () = redis::cmd("ZADD")
                    .arg(self.key(&format!("active:{queue}")))
                    .arg(now_unix() as f64)
                    .arg(job_id)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Broker::Memory(mem) => {
                mem.active
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .insert(job_id.to_string(), now_unix());
                Ok(())
            }
        }
    }

    pub async fn active_remove(&self, queue: &str, job_id: &str) -> Result<(), BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let _: () = redis::cmd("ZREM")
                    .arg(self.key(&format!("active:{queue}")))
                    .arg(job_id)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Broker::Memory(mem) => {
                if let Some(jobs) = mem.active.lock().unwrap().get_mut(queue) {
                    jobs.remove(job_id);
                }
                Ok(())
            }
        }
    }

    pub async fn active_count(&self, queue: &str) -> Result<u64, BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let count: u64 = redis::cmd("ZCARD")
                    .arg(self.key(&format!("active:{queue}")))
                    .query_async(&mut conn)
                    .await?;
                Ok(count)
            }
            Broker::Memory(mem) => Ok(mem
                .active
                .lock()
                .unwrap()
                .get(queue)
                .map(|jobs| jobs.len() as u64)
                .unwrap_or_default()),
        }
    }

    /// Start time of the oldest active job, if any.
    pub async fn active_oldest(&self, queue: &str) -> Result<Option<u64>, BrokerError> {
        match self {
            Broker::Redis(r) => {
                let mut conn = r.manager.clone();
                let oldest: Vec<(String, f64)> = redis::cmd("ZRANGE")
                    .arg(self.key(&format!("active:{queue}")))
                    .arg(0)
                    .arg(0)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await?;
                Ok(oldest.first().map(|(_, started)| *started as u64))
            }
            Broker::Memory(mem) => Ok(mem
                .active
                .lock()
                .unwrap()
                .get(queue)
                .and_then(|jobs| jobs.values().min().copied())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn window_counters_expire() {
        let broker = Broker::memory();

        for _ in 0..3 {
            broker
                .incr_window("w:test", Duration::from_millis(20))
                .await
                .unwrap();
        }
        assert_eq!(
            broker.window_counts(&["w:test".into()]).await.unwrap(),
            vec![3]
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            broker.window_counts(&["w:test".into()]).await.unwrap(),
            vec![0]
        );
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_arrival() {
        let broker = Broker::memory();
        broker.queue_push("send-email", "t1", "low", 5).await.unwrap();
        broker.queue_push("send-email", "t1", "first", 1).await.unwrap();
        broker.queue_push("send-email", "t1", "second", 1).await.unwrap();

        assert_eq!(
            broker.queue_pop("send-email", "t1").await.unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(
            broker.queue_pop("send-email", "t1").await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(
            broker.queue_pop("send-email", "t1").await.unwrap().as_deref(),
            Some("low")
        );
        assert_eq!(broker.queue_pop("send-email", "t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delayed_jobs_become_due() {
        let broker = Broker::memory();
        let now = now_unix();
        broker.delayed_push("send-email", "later", now + 60).await.unwrap();
        broker.delayed_push("send-email", "now", now).await.unwrap();

        let due = broker.delayed_due("send-email", now, 10).await.unwrap();
        assert_eq!(due, vec!["now".to_string()]);
        assert_eq!(broker.delayed_count("send-email").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn active_tracking_reports_oldest() {
        let broker = Broker::memory();
        broker.active_add("send-webhook", "job-1").await.unwrap();
        assert_eq!(broker.active_count("send-webhook").await.unwrap(), 1);
        assert!(broker.active_oldest("send-webhook").await.unwrap().is_some());

        broker.active_remove("send-webhook", "job-1").await.unwrap();
        assert_eq!(broker.active_count("send-webhook").await.unwrap(), 0);
        assert_eq!(broker.active_oldest("send-webhook").await.unwrap(), None);
    }
}
