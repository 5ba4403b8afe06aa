//! # 缓存模块
//!
//! 内存 / Redis 缓存抽象、滑动窗口原子准入与缓存键规范

pub mod abstract_cache;
pub mod keys;

pub use abstract_cache::{
    CacheProvider, CacheProviderType, CacheStats, MemoryCache, RedisCache, UnifiedCacheManager,
    WindowDecision, WindowSpec,
};
pub use keys::{CacheKey, CacheKeyBuilder};

/// 统一缓存管理器别名
pub type CacheManager = UnifiedCacheManager;
