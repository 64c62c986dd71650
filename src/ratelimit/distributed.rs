//! Distributed counter backend on Redis and the memoized slot holding it.
//!
//! The Redis backend keeps a sliding-window log per key in a sorted set. One
//! Lua script trims entries older than the window, counts the rest, records
//! the new request while the total is within the limit, and refreshes the TTL,
//! so every instance sharing the server sees the same total.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::backend::{CounterBackend, WindowHit};
use crate::config::GuardConfig;
use crate::error::BackendError;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
end
redis.call('PEXPIRE', key, window)

local first = now
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  first = tonumber(oldest[2])
end
return {count + 1, first}
"#;

/// Sliding-window counter backed by a Redis server.
///
/// The connection is established on first use, so bad credentials or an
/// unreachable server surface as errors from [`CounterBackend::hit`].
pub struct RedisBackend {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Create a backend for `url` without connecting.
    pub fn open(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, BackendError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to distributed rate limit backend");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<WindowHit, BackendError> {
        let mut conn = self.connection().await?;
        let now_ms = now.timestamp_millis();
        let window_ms = window.num_milliseconds();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let (count, oldest_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, count = count, "Distributed window observed");

        let count = u64::try_from(count)
            .map_err(|_| BackendError::Protocol(format!("negative count {}", count)))?;
        let reset = DateTime::<Utc>::from_timestamp_millis(oldest_ms.saturating_add(window_ms))
            .ok_or_else(|| BackendError::Protocol(format!("invalid timestamp {}", oldest_ms)))?;

        Ok(WindowHit { count, reset })
    }
}

type BackendFactory = Arc<dyn Fn() -> Option<Arc<dyn CounterBackend>> + Send + Sync>;

/// Lazily constructed, shared handle to the distributed backend.
///
/// The first [`get`](Self::get) builds the backend; every later call returns
/// the same `Arc`. A slot without a factory is local-only mode.
pub struct BackendSlot {
    factory: Option<BackendFactory>,
    cached: RwLock<Option<Arc<dyn CounterBackend>>>,
    creations: AtomicUsize,
}

impl BackendSlot {
    /// Local-only mode: [`get`](Self::get) always returns `None`.
    pub fn disabled() -> Self {
        Self {
            factory: None,
            cached: RwLock::new(None),
            creations: AtomicUsize::new(0),
        }
    }

    /// Slot built from an arbitrary constructor.
    ///
    /// A constructor returning `None` is treated like a missing backend and
    /// is retried on the next call.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Option<Arc<dyn CounterBackend>> + Send + Sync + 'static,
    {
        Self {
            factory: Some(Arc::new(factory)),
            cached: RwLock::new(None),
            creations: AtomicUsize::new(0),
        }
    }

    /// Redis slot when a backend URL is configured, otherwise disabled.
    pub fn from_config(config: &GuardConfig) -> Self {
        let Some(url) = config.redis_url().map(str::to_string) else {
            info!("No distributed backend configured, using local counters");
            return Self::disabled();
        };

        Self::with_factory(move || match RedisBackend::open(&url) {
            Ok(backend) => {
                info!("Distributed rate limit backend initialized");
                Some(Arc::new(backend) as Arc<dyn CounterBackend>)
            }
            Err(e) => {
                warn!(error = %e, "Distributed backend could not be constructed, using local counters");
                None
            }
        })
    }

    pub fn is_configured(&self) -> bool {
        self.factory.is_some()
    }

    /// The shared backend, constructing it on first use.
    pub fn get(&self) -> Option<Arc<dyn CounterBackend>> {
        let factory = self.factory.as_ref()?;

        if let Some(backend) = self.cached.read().as_ref() {
            return Some(backend.clone());
        }

        let mut cached = self.cached.write();
        if let Some(backend) = cached.as_ref() {
            return Some(backend.clone());
        }

        let backend = factory()?;
        self.creations.fetch_add(1, Ordering::SeqCst);
        *cached = Some(backend.clone());
        Some(backend)
    }

    /// How many times the backend has been constructed since the last reset.
    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Forget the cached backend and the creation counter.
    ///
    /// This is primarily useful for testing.
    pub fn reset(&self) {
        let mut cached = self.cached.write();
        *cached = None;
        self.creations.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for BackendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSlot")
            .field("configured", &self.is_configured())
            .field("cached", &self.cached.read().is_some())
            .field("creations", &self.creation_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::RateLimitResult;

    struct NoopBackend;

    #[async_trait]
    impl CounterBackend for NoopBackend {
        async fn hit(
            &self,
            _key: &str,
            _limit: u32,
            window: TimeDelta,
            now: DateTime<Utc>,
        ) -> Result<WindowHit, BackendError> {
            Ok(WindowHit {
                count: 1,
                reset: now + window,
            })
        }
    }

    fn counting_slot() -> Arc<BackendSlot> {
        Arc::new(BackendSlot::with_factory(|| {
            Some(Arc::new(NoopBackend) as Arc<dyn CounterBackend>)
        }))
    }

    #[test]
    fn test_disabled_slot_returns_none() {
        let slot = BackendSlot::disabled();
        assert!(!slot.is_configured());
        assert!(slot.get().is_none());
        assert_eq!(slot.creation_count(), 0);
    }

    #[test]
    fn test_from_config_without_url_is_disabled() {
        let slot = BackendSlot::from_config(&GuardConfig::default());
        assert!(!slot.is_configured());
    }

    #[test]
    fn test_from_config_with_malformed_url_behaves_as_local() {
        let config = GuardConfig {
            redis_url: Some("definitely not a url".to_string()),
            ..GuardConfig::default()
        };
        let slot = BackendSlot::from_config(&config);
        assert!(slot.is_configured());
        assert!(slot.get().is_none());
        assert_eq!(slot.creation_count(), 0);
    }

    #[test]
    fn test_from_config_with_url_constructs_lazily() {
        let config = GuardConfig {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            ..GuardConfig::default()
        };
        let slot = BackendSlot::from_config(&config);
        assert_eq!(slot.creation_count(), 0);

        let first = slot.get().unwrap();
        let second = slot.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(slot.creation_count(), 1);
    }

    #[test]
    fn test_get_memoizes() {
        let slot = counting_slot();
        let first = slot.get().unwrap();
        for _ in 0..10 {
            assert!(Arc::ptr_eq(&first, &slot.get().unwrap()));
        }
        assert_eq!(slot.creation_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_memoizes_under_concurrency() {
        let slot = counting_slot();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let slot = slot.clone();
                tokio::spawn(async move { slot.get().unwrap() })
            })
            .collect();
        let handles = futures::future::join_all(tasks).await;

        let first = handles[0].as_ref().unwrap().clone();
        for handle in &handles {
            assert!(Arc::ptr_eq(&first, handle.as_ref().unwrap()));
        }
        assert_eq!(slot.creation_count(), 1);
    }

    #[test]
    fn test_reset_allows_one_new_construction() {
        let slot = counting_slot();
        let before = slot.get().unwrap();

        slot.reset();
        assert_eq!(slot.creation_count(), 0);

        let after = slot.get().unwrap();
        slot.get().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(slot.creation_count(), 1);
    }

    /// Backend against `RL_REDIS_URL` (or a local default), if reachable.
    async fn live_backend() -> Option<RedisBackend> {
        let url = std::env::var("RL_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let backend = RedisBackend::open(&url).ok()?;
        match backend.connection().await {
            Ok(_) => Some(backend),
            Err(e) => {
                eprintln!("Skipping test: Redis not available at {}: {}", url, e);
                None
            }
        }
    }

    fn unique_key(test_name: &str) -> String {
        format!("test:{}:rl:{}", Uuid::new_v4(), test_name)
    }

    /// Whole milliseconds, matching the resolution stored in Redis.
    fn start_time() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
    }

    async fn window_size(backend: &RedisBackend, key: &str) -> u64 {
        let mut conn = backend.connection().await.unwrap();
        redis::cmd("ZCARD").arg(key).query_async(&mut conn).await.unwrap()
    }

    async fn delete(backend: &RedisBackend, key: &str) {
        let mut conn = backend.connection().await.unwrap();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_rejected_request_is_not_recorded() {
        let Some(backend) = live_backend().await else {
            return;
        };
        let key = unique_key("reject");
        let window = TimeDelta::seconds(60);
        let now = start_time();

        for expected in 1..=3 {
            let hit = backend.hit(&key, 3, window, now).await.unwrap();
            assert_eq!(hit.count, expected);
            assert!(RateLimitResult::from_hit(3, hit).success);
        }

        let over = backend.hit(&key, 3, window, now).await.unwrap();
        assert_eq!(over.count, 4);
        let result = RateLimitResult::from_hit(3, over);
        assert!(!result.success);
        assert_eq!(result.remaining, 0);

        assert_eq!(window_size(&backend, &key).await, 3);
        backend.hit(&key, 3, window, now).await.unwrap();
        assert_eq!(window_size(&backend, &key).await, 3);

        delete(&backend, &key).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_window_slides_past_oldest_entry() {
        let Some(backend) = live_backend().await else {
            return;
        };
        let key = unique_key("slide");
        let window = TimeDelta::milliseconds(1000);
        let t0 = start_time();

        assert!(RateLimitResult::from_hit(2, backend.hit(&key, 2, window, t0).await.unwrap()).success);
        let second = t0 + TimeDelta::milliseconds(400);
        assert!(RateLimitResult::from_hit(2, backend.hit(&key, 2, window, second).await.unwrap()).success);

        let blocked = backend
            .hit(&key, 2, window, t0 + TimeDelta::milliseconds(600))
            .await
            .unwrap();
        assert!(!RateLimitResult::from_hit(2, blocked).success);

        // The entry at t0 leaves the window; the one at t0+400ms stays
        let slid = backend
            .hit(&key, 2, window, t0 + TimeDelta::milliseconds(1000))
            .await
            .unwrap();
        assert_eq!(slid.count, 2);
        assert!(RateLimitResult::from_hit(2, slid).success);
        assert_eq!(slid.reset, second + window);

        delete(&backend, &key).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_reset_is_oldest_entry_plus_window() {
        let Some(backend) = live_backend().await else {
            return;
        };
        let key = unique_key("reset");
        let window = TimeDelta::seconds(30);
        let t0 = start_time();

        let first = backend.hit(&key, 5, window, t0).await.unwrap();
        assert_eq!(first.reset, t0 + window);

        let later = backend
            .hit(&key, 5, window, t0 + TimeDelta::milliseconds(250))
            .await
            .unwrap();
        assert_eq!(later.count, 2);
        assert_eq!(later.reset, t0 + window);

        delete(&backend, &key).await;
    }

    #[test]
    fn test_redis_backend_rejects_malformed_url() {
        assert!(matches!(
            RedisBackend::open("not a url"),
            Err(BackendError::Redis(_))
        ));
    }
}
