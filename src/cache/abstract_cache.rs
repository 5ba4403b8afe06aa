//! # 缓存抽象层
//!
//! 提供统一的缓存接口，支持内存缓存和Redis缓存。
//! 除了常规的键值操作外，还提供滑动窗口准入这一原子操作：
//! 内存实现依赖 `DashMap` 的分片写锁，Redis 实现依赖服务端 Lua 脚本。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Serialize, de::DeserializeOwned};

use crate::config::{CacheConfig, CacheType};
use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 缓存项
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// 滑动窗口准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// 被拒绝时距离最早记录滑出窗口的毫秒数
    pub retry_after_ms: u64,
}

impl WindowDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
        }
    }

    const fn deny(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
        }
    }
}

/// 滑动窗口参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// 窗口内最大记录数
    pub max_requests: u32,
    /// 窗口长度（毫秒）
    pub window_ms: u64,
    /// 键的过期时间
    pub expiration: Duration,
}

/// 缓存抽象trait
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// 设置缓存值
    async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send;

    /// 获取缓存值
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send;

    /// 删除缓存值
    async fn delete(&self, key: &str) -> Result<()>;

    /// 检查键是否存在
    async fn exists(&self, key: &str) -> Result<bool>;

    /// 设置过期时间
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// 增加数字值
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// 原子的滑动窗口检查并记录
    ///
    /// 记录数不足上限时直接记录；否则比较最早记录与 `now_ms`，
    /// 已滑出窗口则淘汰最早记录并记录本次，未滑出则拒绝。
    async fn sliding_window_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        now_ms: i64,
    ) -> Result<WindowDecision>;

    /// 获取缓存统计信息
    async fn stats(&self) -> Result<CacheStats>;
}

/// 缓存统计信息
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_keys: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub cache_type: String,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// 内存缓存实现
pub struct MemoryCache {
    data: DashMap<String, CacheEntry<Vec<u8>>>,
    windows: DashMap<String, CacheEntry<VecDeque<i64>>>,
    max_entries: usize,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            data: DashMap::new(),
            windows: DashMap::new(),
            max_entries: max_entries.max(1),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    fn ensure_capacity(&self) {
        if self.data.len() < self.max_entries {
            return;
        }
        self.data.retain(|_, entry| !entry.is_expired());
        if self.data.len() < self.max_entries {
            return;
        }
        // 仍然超限时移除任意一项
        let victim = self.data.iter().next().map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.data.remove(&key);
        }
    }

    /// 窗口数达到上限时清理过期窗口；未过期的窗口保留，避免放宽限流
    fn sweep_windows(&self) {
        if self.windows.len() >= self.max_entries {
            self.windows.retain(|_, entry| !entry.is_expired());
        }
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        let serialized = serde_json::to_vec(&value)
            .map_err(|e| ProxyError::cache_with_source("序列化缓存值失败", e))?;

        if !self.data.contains_key(key) {
            self.ensure_capacity();
        }
        self.data
            .insert(key.to_string(), CacheEntry::new(serialized, ttl));
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let bytes = match self.data.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            _ => None,
        };

        let Some(bytes) = bytes else {
            self.data.remove_if(key, |_, entry| entry.is_expired());
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        self.hit_count.fetch_add(1, Ordering::Relaxed);
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ProxyError::cache_with_source("反序列化缓存值失败", e))?;
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        self.windows.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.get(key).is_some_and(|entry| !entry.is_expired())
            || self.windows.get(key).is_some_and(|entry| !entry.is_expired()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(b"0".to_vec(), None));

        let current_value = if entry.is_expired() {
            entry.expires_at = None;
            0
        } else {
            serde_json::from_slice::<i64>(&entry.value).unwrap_or(0)
        };

        let new_value = current_value + delta;
        entry.value = serde_json::to_vec(&new_value)
            .map_err(|e| ProxyError::cache_with_source("序列化数字值失败", e))?;
        Ok(new_value)
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        if !self.windows.contains_key(key) {
            self.sweep_windows();
        }

        let max = spec.max_requests as usize;
        // entry 持有分片写锁，整个检查与写入对同一键是串行的
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(VecDeque::new(), Some(spec.expiration)));

        if entry.is_expired() {
            entry.value.clear();
        }

        let decision = if entry.value.len() < max {
            entry.value.push_front(now_ms);
            WindowDecision::allow()
        } else {
            match entry.value.back().copied() {
                Some(oldest) => {
                    let diff = now_ms.saturating_sub(oldest).max(0) as u64;
                    if diff < spec.window_ms {
                        WindowDecision::deny(spec.window_ms - diff)
                    } else {
                        entry.value.push_front(now_ms);
                        entry.value.truncate(max);
                        WindowDecision::allow()
                    }
                }
                None => WindowDecision::deny(spec.window_ms),
            }
        };

        entry.expires_at = Some(Instant::now() + spec.expiration);
        Ok(decision)
    }

    async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            total_keys: self.data.len() + self.windows.len(),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            cache_type: "Memory".to_string(),
        })
    }
}

/// 滑动窗口 Lua 脚本：LLEN / LINDEX / LPUSH+LTRIM 在服务端一次完成
const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local max = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local expiration = tonumber(ARGV[4])

local len = redis.call('LLEN', key)
if len < max then
    redis.call('LPUSH', key, now)
    redis.call('EXPIRE', key, expiration)
    return {1, 0}
end

local oldest = tonumber(redis.call('LINDEX', key, -1))
if oldest == nil then
    redis.call('DEL', key)
    redis.call('LPUSH', key, now)
    redis.call('EXPIRE', key, expiration)
    return {1, 0}
end

local diff = now - oldest
if diff < window then
    redis.call('EXPIRE', key, expiration)
    return {0, window - diff}
end

redis.call('LPUSH', key, now)
redis.call('LTRIM', key, 0, max - 1)
redis.call('EXPIRE', key, expiration)
return {1, 0}
";

/// Redis缓存实现
pub struct RedisCache {
    connection_manager: ConnectionManager,
    window_script: redis::Script,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl RedisCache {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ProxyError::cache_with_source("创建Redis客户端失败", e))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| ProxyError::cache_with_source("建立 Redis 连接失败", e))?;

        Ok(Self {
            connection_manager,
            window_script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        let serialized = serde_json::to_string(&value)
            .map_err(|e| ProxyError::cache_with_source("序列化缓存值失败", e))?;
        let mut conn = self.conn();

        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, serialized, ttl.as_secs().max(1))
                    .await
                    .map_err(|e| ProxyError::cache_with_source(format!("设置缓存失败: {key}"), e))?;
            }
            None => {
                conn.set::<_, _, ()>(key, serialized)
                    .await
                    .map_err(|e| ProxyError::cache_with_source(format!("设置缓存失败: {key}"), e))?;
            }
        }
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let mut conn = self.conn();
        let result: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis GET失败", e))?;

        if let Some(data) = result {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            let value = serde_json::from_str(&data)
                .map_err(|e| ProxyError::cache_with_source("反序列化缓存值失败", e))?;
            Ok(Some(value))
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis DEL失败", e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn
            .exists(key)
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis EXISTS失败", e))?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        conn.expire::<_, ()>(key, i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis EXPIRE失败", e))?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        let result: i64 = conn
            .incr(key, delta)
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis INCRBY失败", e))?;
        Ok(result)
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        let mut conn = self.conn();
        let reply: Vec<i64> = self
            .window_script
            .key(key)
            .arg(spec.max_requests)
            .arg(spec.window_ms)
            .arg(now_ms)
            .arg(spec.expiration.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ProxyError::cache_with_source("滑动窗口脚本执行失败", e))?;

        match reply.as_slice() {
            [1, ..] => Ok(WindowDecision::allow()),
            [0, wait] => Ok(WindowDecision::deny(u64::try_from(*wait).unwrap_or(0))),
            other => Err(ProxyError::cache(format!(
                "滑动窗口脚本返回异常: {other:?}"
            ))),
        }
    }

    async fn stats(&self) -> Result<CacheStats> {
        let mut conn = self.conn();
        let total_keys: usize = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis DBSIZE失败", e))?;

        Ok(CacheStats {
            total_keys,
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            cache_type: "Redis".to_string(),
        })
    }
}

/// 缓存提供者枚举 - 避免 trait object 兼容性问题
pub enum CacheProviderType {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl CacheProviderType {
    /// 设置缓存值
    pub async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        match self {
            Self::Memory(cache) => cache.set(key, value, ttl).await,
            Self::Redis(cache) => cache.set(key, value, ttl).await,
        }
    }

    /// 获取缓存值
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self {
            Self::Memory(cache) => cache.get(key).await,
            Self::Redis(cache) => cache.get(key).await,
        }
    }

    /// 删除缓存值
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::Memory(cache) => cache.delete(key).await,
            Self::Redis(cache) => cache.delete(key).await,
        }
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(cache) => cache.exists(key).await,
            Self::Redis(cache) => cache.exists(key).await,
        }
    }

    /// 设置过期时间
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        match self {
            Self::Memory(cache) => cache.expire(key, ttl).await,
            Self::Redis(cache) => cache.expire(key, ttl).await,
        }
    }

    /// 增加数字值
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        match self {
            Self::Memory(cache) => cache.incr(key, delta).await,
            Self::Redis(cache) => cache.incr(key, delta).await,
        }
    }

    /// 原子滑动窗口准入
    pub async fn sliding_window_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        match self {
            Self::Memory(cache) => cache.sliding_window_admit(key, spec, now_ms).await,
            Self::Redis(cache) => cache.sliding_window_admit(key, spec, now_ms).await,
        }
    }

    /// 获取缓存统计信息
    pub async fn stats(&self) -> Result<CacheStats> {
        match self {
            Self::Memory(cache) => cache.stats().await,
            Self::Redis(cache) => cache.stats().await,
        }
    }
}

/// 统一缓存管理器
pub struct UnifiedCacheManager {
    provider: CacheProviderType,
}

impl UnifiedCacheManager {
    /// 根据配置创建缓存管理器
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        let provider = match config.cache_type {
            CacheType::Memory => {
                linfo!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Cache,
                    "init_memory_cache",
                    &format!("使用内存缓存，最大条目数: {}", config.memory_max_entries)
                );
                CacheProviderType::Memory(MemoryCache::new(config.memory_max_entries))
            }
            CacheType::Redis => {
                let redis = config
                    .redis
                    .as_ref()
                    .ok_or_else(|| ProxyError::cache("Redis 缓存配置缺失"))?;
                linfo!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Cache,
                    "init_redis_cache",
                    "使用Redis缓存"
                );
                CacheProviderType::Redis(RedisCache::new(&redis.url).await?)
            }
        };

        Ok(Self { provider })
    }

    /// 仅使用内存后端（单实例部署与测试）
    pub fn memory_only() -> Self {
        Self {
            provider: CacheProviderType::Memory(MemoryCache::new(100_000)),
        }
    }

    /// 获取缓存提供者的引用
    pub const fn provider(&self) -> &CacheProviderType {
        &self.provider
    }

    /// 设置缓存值
    pub async fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send,
    {
        self.provider.set(key, value, ttl).await
    }

    /// 获取缓存值
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.provider.get(key).await
    }

    /// 删除缓存值
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.provider.delete(key).await
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.provider.exists(key).await
    }

    /// 设置过期时间
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.provider.expire(key, ttl).await
    }

    /// 增加数字值
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.provider.incr(key, delta).await
    }

    /// 原子滑动窗口准入
    pub async fn sliding_window_admit(
        &self,
        key: &str,
        spec: WindowSpec,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        self.provider.sliding_window_admit(key, spec, now_ms).await
    }

    /// 获取缓存统计信息
    pub async fn stats(&self) -> Result<CacheStats> {
        self.provider.stats().await
    }
}
