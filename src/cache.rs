//! Remote key/value cache with a process-local fallback.
//!
//! The facade fronts Redis. While the remote is reachable, every write is
//! mirrored into a local TTL map so a later outage starts from warm values.
//! When the remote goes away, a supervisor task reconnects with exponential
//! backoff; after the attempt budget is spent the layer enters fallback
//! mode and serves everything from the local map. Writes made in fallback
//! are not replayed to Redis when it returns; everything cached here is
//! recomputable from persistent storage.

use crate::metrics::Metrics;
use crate::retry::backoff_delay;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

/// First reconnect delay.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// Attempts before giving up and entering fallback mode.
const RECONNECT_ATTEMPTS: u32 = 10;
/// Chance (out of 256) that a write also scrubs expired local entries.
const SCRUB_CHANCE: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Connect,
    Ready,
    Error(String),
    Close,
    Reconnecting { attempt: u32 },
    End,
    Fallback,
}

#[derive(Debug, Clone)]
pub enum CacheOp {
    Get(String),
    Set(String, String, Option<Duration>),
    Del(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Nil,
    Ok,
    Value(String),
}

struct LocalEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

pub struct CacheLayer {
    redis_url: String,
    remote: RwLock<Option<ConnectionManager>>,
    local: DashMap<String, LocalEntry>,
    connected: AtomicBool,
    fallback_mode: AtomicBool,
    reconnect_tx: mpsc::UnboundedSender<()>,
    events: broadcast::Sender<CacheEvent>,
    metrics: Arc<Metrics>,
}

impl CacheLayer {
    /// Connect to Redis, spawning the reconnect supervisor. Never fails:
    /// an unreachable remote simply starts the backoff schedule.
    pub async fn connect(redis_url: &str, metrics: Arc<Metrics>) -> Arc<Self> {
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let layer = Arc::new(Self {
            redis_url: redis_url.to_string(),
            remote: RwLock::new(None),
            local: DashMap::new(),
            connected: AtomicBool::new(false),
            fallback_mode: AtomicBool::new(false),
            reconnect_tx,
            events,
            metrics,
        });
        tokio::spawn(reconnect_supervisor(layer.clone(), reconnect_rx));
        let _ = layer.reconnect_tx.send(());
        layer
    }

    /// Purely local layer: permanent fallback mode. Used in tests and when
    /// no Redis is configured at all.
    pub fn local_only(metrics: Arc<Metrics>) -> Arc<Self> {
        let (reconnect_tx, _) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(8);
        Arc::new(Self {
            redis_url: String::new(),
            remote: RwLock::new(None),
            local: DashMap::new(),
            connected: AtomicBool::new(false),
            fallback_mode: AtomicBool::new(true),
            reconnect_tx,
            events,
            metrics,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_mode.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Drop the current connection and restart the backoff schedule from
    /// attempt one, leaving fallback mode if we were in it.
    pub async fn force_reconnect(&self) {
        *self.remote.write().await = None;
        self.connected.store(false, Ordering::Relaxed);
        self.fallback_mode.store(false, Ordering::Relaxed);
        let _ = self.reconnect_tx.send(());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if self.is_connected() {
            let conn = self.remote.read().await.clone();
            if let Some(mut conn) = conn {
                match redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await {
                    Ok(v) => return v,
                    Err(e) => self.on_remote_error("get", &e).await,
                }
            }
        }
        self.metrics.cache_fallback_reads.fetch_add(1, Ordering::Relaxed);
        self.local_get(key)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        // Local first: the remote may die mid-call and the next fallback
        // read must already see this value.
        self.local_set(key, value, ttl);
        if self.is_connected() {
            let conn = self.remote.read().await.clone();
            if let Some(mut conn) = conn {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value);
                if let Some(ttl) = ttl {
                    cmd.arg("EX").arg(ttl.as_secs().max(1));
                }
                if let Err(e) = cmd.query_async::<_, ()>(&mut conn).await {
                    self.on_remote_error("set", &e).await;
                }
            }
        }
    }

    pub async fn del(&self, key: &str) {
        self.local.remove(key);
        if self.is_connected() {
            let conn = self.remote.read().await.clone();
            if let Some(mut conn) = conn {
                if let Err(e) = redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await {
                    self.on_remote_error("del", &e).await;
                }
            }
        }
    }

    /// Execute a batch of operations, pipelined against the remote when
    /// available, applied to the local map otherwise.
    pub async fn pipeline(&self, ops: &[CacheOp]) -> Vec<CacheValue> {
        if self.is_connected() {
            let conn = self.remote.read().await.clone();
            if let Some(mut conn) = conn {
                let mut pipe = redis::pipe();
                for op in ops {
                    match op {
                        CacheOp::Get(k) => {
                            pipe.cmd("GET").arg(k);
                        }
                        CacheOp::Set(k, v, ttl) => {
                            let c = pipe.cmd("SET").arg(k).arg(v);
                            if let Some(ttl) = ttl {
                                c.arg("EX").arg(ttl.as_secs().max(1));
                            }
                        }
                        CacheOp::Del(k) => {
                            pipe.cmd("DEL").arg(k);
                        }
                    }
                }
                match pipe.query_async::<_, Vec<redis::Value>>(&mut conn).await {
                    Ok(values) => {
                        // Mirror sets locally after the remote accepted them.
                        for op in ops {
                            match op {
                                CacheOp::Set(k, v, ttl) => self.local_set(k, v, *ttl),
                                CacheOp::Del(k) => {
                                    self.local.remove(k);
                                }
                                CacheOp::Get(_) => {}
                            }
                        }
                        return values.into_iter().map(from_redis_value).collect();
                    }
                    Err(e) => self.on_remote_error("pipeline", &e).await,
                }
            }
        }
        self.metrics.cache_fallback_reads.fetch_add(1, Ordering::Relaxed);
        ops.iter()
            .map(|op| match op {
                CacheOp::Get(k) => match self.local_get(k) {
                    Some(v) => CacheValue::Value(v),
                    None => CacheValue::Nil,
                },
                CacheOp::Set(k, v, ttl) => {
                    self.local_set(k, v, *ttl);
                    CacheValue::Ok
                }
                CacheOp::Del(k) => {
                    self.local.remove(k);
                    CacheValue::Ok
                }
            })
            .collect()
    }

    /// Drop expired local entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.local.len();
        self.local.retain(|_, e| !e.is_expired());
        before - self.local.len()
    }

    /// Number of live local entries (fallback working set).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    fn local_get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.local.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.local.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    fn local_set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        if rand::random::<u8>() < SCRUB_CHANCE {
            self.cleanup();
        }
    }

    async fn on_remote_error(&self, op: &str, e: &redis::RedisError) {
        warn!(op, error = %e, "cache_remote_error");
        let _ = self.events.send(CacheEvent::Error(e.to_string()));
        if self.connected.swap(false, Ordering::Relaxed) {
            let _ = self.events.send(CacheEvent::Close);
            *self.remote.write().await = None;
            let _ = self.reconnect_tx.send(());
        }
    }
}

fn from_redis_value(v: redis::Value) -> CacheValue {
    match v {
        redis::Value::Nil => CacheValue::Nil,
        redis::Value::Data(bytes) => {
            CacheValue::Value(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::Status(s) if s == "OK" => CacheValue::Ok,
        redis::Value::Status(s) => CacheValue::Value(s),
        redis::Value::Int(i) => CacheValue::Value(i.to_string()),
        _ => CacheValue::Ok,
    }
}

/// Owns the reconnect schedule. Signals collapse: a burst of errors while
/// a reconnect cycle is running triggers at most one more cycle.
async fn reconnect_supervisor(layer: Arc<CacheLayer>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        // Collapse queued signals.
        while rx.try_recv().is_ok() {}
        if layer.is_connected() {
            continue;
        }

        let mut attempt: u32 = 1;
        loop {
            let _ = layer.events.send(CacheEvent::Reconnecting { attempt });
            match try_connect(&layer.redis_url).await {
                Ok(conn) => {
                    *layer.remote.write().await = Some(conn);
                    layer.connected.store(true, Ordering::Relaxed);
                    layer.fallback_mode.store(false, Ordering::Relaxed);
                    layer.metrics.cache_reconnects.fetch_add(1, Ordering::Relaxed);
                    let _ = layer.events.send(CacheEvent::Connect);
                    let _ = layer.events.send(CacheEvent::Ready);
                    info!(attempt, "cache_connected");
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "cache_connect_failed");
                    if attempt >= RECONNECT_ATTEMPTS {
                        layer.fallback_mode.store(true, Ordering::Relaxed);
                        let _ = layer.events.send(CacheEvent::Fallback);
                        warn!("cache_fallback_mode — serving from local map");
                        break;
                    }
                    tokio::time::sleep(backoff_delay(attempt, RECONNECT_BASE, RECONNECT_MAX)).await;
                    attempt += 1;
                }
            }
        }
    }
    let _ = layer.events.send(CacheEvent::End);
}

async fn try_connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    ConnectionManager::new(client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_layer() -> Arc<CacheLayer> {
        CacheLayer::local_only(Metrics::new())
    }

    #[tokio::test]
    async fn test_fallback_set_then_get_within_ttl() {
        let cache = local_layer();
        cache.set("lastLocation:99", "{\"lat\":12.97}", Some(Duration::from_secs(300))).await;
        assert_eq!(cache.get("lastLocation:99").await.as_deref(), Some("{\"lat\":12.97}"));
    }

    #[tokio::test]
    async fn test_fallback_get_after_expiry_is_none() {
        let cache = local_layer();
        cache.set("k", "v", Some(Duration::from_millis(5))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_set_without_ttl_persists() {
        let cache = local_layer();
        cache.set("pinned", "1", None).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get("pinned").await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_del_removes_value() {
        let cache = local_layer();
        cache.set("k", "v", None).await;
        cache.del("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_pipeline_in_fallback_applies_in_order() {
        let cache = local_layer();
        let results = cache
            .pipeline(&[
                CacheOp::Set("a".into(), "1".into(), None),
                CacheOp::Get("a".into()),
                CacheOp::Del("a".into()),
                CacheOp::Get("a".into()),
            ])
            .await;
        assert_eq!(
            results,
            vec![
                CacheValue::Ok,
                CacheValue::Value("1".into()),
                CacheValue::Ok,
                CacheValue::Nil,
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_expired() {
        let cache = local_layer();
        cache.set("dead", "x", Some(Duration::from_millis(1))).await;
        cache.set("alive", "y", Some(Duration::from_secs(60))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = cache.cleanup();
        assert_eq!(removed, 1);
        assert_eq!(cache.get("alive").await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_local_only_reports_fallback_not_connected() {
        let cache = local_layer();
        assert!(!cache.is_connected());
        assert!(cache.is_fallback());
    }

    #[test]
    fn test_from_redis_value_mapping() {
        assert_eq!(from_redis_value(redis::Value::Nil), CacheValue::Nil);
        assert_eq!(
            from_redis_value(redis::Value::Status("OK".into())),
            CacheValue::Ok
        );
        assert_eq!(
            from_redis_value(redis::Value::Data(b"hi".to_vec())),
            CacheValue::Value("hi".into())
        );
    }
}
