//! # 滑动窗口限流器
//!
//! 固定容量的滑动窗口：每个限流键保存最近 `max_requests` 次准入时间戳（新的在前），
//! 检查与记录作为一个原子单元提交给缓存后端。

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheKey, CacheManager, WindowDecision, WindowSpec};
use crate::error::Result;
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// 滑动窗口限流器
pub struct SlidingWindowLimiter {
    cache: Arc<CacheManager>,
    /// 限流键的过期时间
    expiration: Duration,
}

impl SlidingWindowLimiter {
    pub const fn new(cache: Arc<CacheManager>, expiration: Duration) -> Self {
        Self { cache, expiration }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// 以当前时间检查并记录一次准入
    pub async fn admit(
        &self,
        request_id: &str,
        key: &CacheKey,
        max_requests: u32,
        window_seconds: u64,
    ) -> Result<WindowDecision> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.admit_at(request_id, key, max_requests, window_seconds, now_ms)
            .await
    }

    /// 以给定时间（毫秒）检查并记录一次准入
    pub async fn admit_at(
        &self,
        request_id: &str,
        key: &CacheKey,
        max_requests: u32,
        window_seconds: u64,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        let window_ms = window_seconds.saturating_mul(1000);
        if max_requests == 0 {
            return Ok(WindowDecision {
                allowed: false,
                retry_after_ms: window_ms,
            });
        }

        let spec = WindowSpec {
            max_requests,
            window_ms,
            expiration: self.expiration,
        };
        let cache_key = key.build();
        let decision = self
            .cache
            .sliding_window_admit(&cache_key, spec, now_ms)
            .await?;

        ldebug!(
            request_id,
            LogStage::RateLimit,
            LogComponent::RateLimiter,
            "window_admit",
            "Sliding window checked",
            key = %cache_key,
            max_requests = max_requests,
            window_seconds = window_seconds,
            allowed = decision.allowed,
            retry_after_ms = decision.retry_after_ms
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKeyBuilder;

    fn limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            Arc::new(CacheManager::memory_only()),
            Duration::from_secs(1200),
        )
    }

    #[tokio::test]
    async fn zero_max_always_denies() {
        let limiter = limiter();
        let key = CacheKeyBuilder::rate_limit("GA", "1.1.1.1");
        let decision = limiter.admit("t", &key, 0, 60).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 60_000);
    }

    #[tokio::test]
    async fn window_slides_with_time() {
        let limiter = limiter();
        let key = CacheKeyBuilder::rate_limit("CT", "2.2.2.2");
        let base = 1_700_000_000_000;
        assert!(limiter.admit_at("t", &key, 2, 10, base).await.unwrap().allowed);
        assert!(limiter.admit_at("t", &key, 2, 10, base + 1).await.unwrap().allowed);

        let denied = limiter.admit_at("t", &key, 2, 10, base + 4000).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 6000);

        assert!(limiter.admit_at("t", &key, 2, 10, base + 10_000).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_respect_limit() {
        let limiter = Arc::new(limiter());
        let key = CacheKeyBuilder::rate_limit("UP", "4.4.4.4");
        let now = 1_700_000_000_000;

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.admit_at("t", &key, 5, 60, now).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    proptest::proptest! {
        #[test]
        fn admitted_never_exceed_limit_within_window(
            gaps in proptest::collection::vec(0i64..3000, 1..60),
            max_requests in 1u32..6,
        ) {
            let limiter = limiter();
            let key = CacheKeyBuilder::rate_limit("GW", "3.3.3.3");
            let window_ms = 5000;
            let mut now = 1_700_000_000_000i64;
            let mut admitted = Vec::new();

            for gap in gaps {
                now += gap;
                let decision = tokio_test::block_on(limiter.admit_at("t", &key, max_requests, 5, now)).unwrap();
                if decision.allowed {
                    admitted.push(now);
                }
                let in_window = admitted.iter().filter(|t| now - **t < window_ms).count();
                proptest::prop_assert!(in_window <= max_requests as usize);
            }
        }
    }
}
