//! # 按 IP 的分层限流
//!
//! 全局 API / 全局 Web / 关键操作 / 上传 / 下载 五个层级，各自独立命名空间，
//! 键为 `rateLimit:{mark}{client_ip}`。

use std::sync::Arc;

use crate::cache::CacheKeyBuilder;
use crate::config::{RateLimitConfig, RateLimitTier};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

use super::SlidingWindowLimiter;

/// 限流层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTierKind {
    GlobalApi,
    GlobalWeb,
    Critical,
    Upload,
    Download,
}

impl RateLimitTierKind {
    /// 键前缀标记
    pub const fn mark(self) -> &'static str {
        match self {
            Self::GlobalApi => "GA",
            Self::GlobalWeb => "GW",
            Self::Critical => "CT",
            Self::Upload => "UP",
            Self::Download => "DW",
        }
    }

    fn tier(self, config: &RateLimitConfig) -> RateLimitTier {
        match self {
            Self::GlobalApi => config.global_api,
            Self::GlobalWeb => config.global_web,
            Self::Critical => config.critical,
            Self::Upload => config.upload,
            Self::Download => config.download,
        }
    }
}

/// 分层限流器
pub struct TieredRateLimiter {
    limiter: Arc<SlidingWindowLimiter>,
    config: RateLimitConfig,
}

impl TieredRateLimiter {
    pub const fn new(limiter: Arc<SlidingWindowLimiter>, config: RateLimitConfig) -> Self {
        Self { limiter, config }
    }

    /// 检查单个层级，未启用的层级直接放行
    pub async fn check(
        &self,
        request_id: &str,
        kind: RateLimitTierKind,
        client_ip: &str,
    ) -> Result<()> {
        let tier = kind.tier(&self.config);
        if !tier.enabled {
            return Ok(());
        }

        let key = CacheKeyBuilder::rate_limit(kind.mark(), client_ip);
        let decision = self
            .limiter
            .admit(request_id, &key, tier.max_requests, tier.window_seconds)
            .await?;

        if decision.allowed {
            return Ok(());
        }

        lwarn!(
            request_id,
            LogStage::RateLimit,
            LogComponent::RateLimiter,
            "tier_denied",
            "Request denied by rate limit tier",
            tier = kind.mark(),
            client_ip = client_ip,
            retry_after_ms = decision.retry_after_ms
        );
        Err(ProxyError::rate_limit(format!(
            "rate limit exceeded, retry after {}s",
            decision.retry_after_ms.div_ceil(1000)
        )))
    }

    /// 依次检查所有适用层级，任一拒绝即失败
    pub async fn check_all(
        &self,
        request_id: &str,
        kinds: &[RateLimitTierKind],
        client_ip: &str,
    ) -> Result<()> {
        for kind in kinds {
            self.check(request_id, *kind, client_ip).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use std::time::Duration;

    fn tiered(config: RateLimitConfig) -> TieredRateLimiter {
        let limiter = SlidingWindowLimiter::new(
            Arc::new(CacheManager::memory_only()),
            Duration::from_secs(config.key_expiration_seconds),
        );
        TieredRateLimiter::new(Arc::new(limiter), config)
    }

    #[tokio::test]
    async fn tiers_use_independent_namespaces() {
        let mut config = RateLimitConfig::default();
        config.critical = RateLimitTier::new(true, 1, 60);
        config.upload = RateLimitTier::new(true, 1, 60);
        let limiter = tiered(config);

        limiter.check("t", RateLimitTierKind::Critical, "9.9.9.9").await.unwrap();
        limiter.check("t", RateLimitTierKind::Upload, "9.9.9.9").await.unwrap();

        let err = limiter
            .check("t", RateLimitTierKind::Critical, "9.9.9.9")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::RateLimit { .. }));
        assert_eq!(err.to_http_response_parts().0.as_u16(), 429);

        // 其他 IP 不受影响
        limiter.check("t", RateLimitTierKind::Critical, "8.8.8.8").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_tier_is_skipped() {
        let mut config = RateLimitConfig::default();
        config.global_web = RateLimitTier::new(false, 0, 60);
        let limiter = tiered(config);
        for _ in 0..5 {
            limiter.check("t", RateLimitTierKind::GlobalWeb, "1.2.3.4").await.unwrap();
        }
    }

    #[tokio::test]
    async fn check_all_requires_every_tier() {
        let mut config = RateLimitConfig::default();
        config.global_api = RateLimitTier::new(true, 10, 60);
        config.download = RateLimitTier::new(true, 1, 60);
        let limiter = tiered(config);
        let kinds = [RateLimitTierKind::GlobalApi, RateLimitTierKind::Download];

        limiter.check_all("t", &kinds, "5.5.5.5").await.unwrap();
        assert!(limiter.check_all("t", &kinds, "5.5.5.5").await.is_err());
    }
}
