//! # 按 (用户, 令牌, 模型) 的 RPM 限流
//!
//! 被拒绝时不立即失败：在等待预算内按随机退避重试，每次重试都重新读取限流配置。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use entity::model_limits;
use moka::future::Cache;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};

use crate::cache::CacheKeyBuilder;
use crate::config::RateLimitConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

use super::SlidingWindowLimiter;

/// 等待超时的对外信息
pub const LOCK_TIMEOUT_MESSAGE: &str =
    "Rate limit exceeded and failed to acquire RPM lock within timeout period";

/// 单条模型限流配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimit {
    pub rpm_limit: i32,
    pub rpm_limit_enabled: bool,
    pub wait_duration_seconds: i64,
    pub relay_timeout_seconds: i64,
}

impl ModelLimit {
    /// 是否需要执行 RPM 检查
    pub const fn is_active(&self) -> bool {
        self.rpm_limit_enabled && self.rpm_limit > 0
    }

    /// 覆盖全局中继超时
    pub fn relay_timeout(&self) -> Option<Duration> {
        u64::try_from(self.relay_timeout_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn wait_budget(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.wait_duration_seconds).unwrap_or(0))
    }
}

impl From<model_limits::Model> for ModelLimit {
    fn from(model: model_limits::Model) -> Self {
        Self {
            rpm_limit: model.rpm_limit,
            rpm_limit_enabled: model.rpm_limit_enabled,
            wait_duration_seconds: model.wait_duration_seconds,
            relay_timeout_seconds: model.relay_timeout_seconds,
        }
    }
}

/// 限流配置来源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LimitSource: Send + Sync {
    async fn find_limit(
        &self,
        user_id: i32,
        token_name: &str,
        model: &str,
    ) -> Result<Option<ModelLimit>>;
}

/// 基于数据库的限流配置来源
pub struct DbLimitSource {
    db: Arc<DatabaseConnection>,
}

impl DbLimitSource {
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LimitSource for DbLimitSource {
    async fn find_limit(
        &self,
        user_id: i32,
        token_name: &str,
        model: &str,
    ) -> Result<Option<ModelLimit>> {
        let record = model_limits::Entity::find()
            .filter(model_limits::Column::UserId.eq(user_id))
            .filter(model_limits::Column::TokenName.eq(token_name))
            .filter(model_limits::Column::ModelName.eq(model))
            .one(self.db.as_ref())
            .await?;
        Ok(record.map(ModelLimit::from))
    }
}

/// 限流主体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmSubject<'a> {
    pub user_id: i32,
    pub token_name: &'a str,
    pub model: &'a str,
}

/// 可等待的模型 RPM 限流器
pub struct ModelRpmLimiter {
    limiter: Arc<SlidingWindowLimiter>,
    source: Arc<dyn LimitSource>,
    config_cache: Cache<String, Option<ModelLimit>>,
    window_seconds: u64,
    backoff_min_seconds: u64,
    backoff_max_seconds: u64,
}

impl ModelRpmLimiter {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        source: Arc<dyn LimitSource>,
        config: &RateLimitConfig,
    ) -> Self {
        let config_cache = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_millis(config.limit_config_cache_ms.max(1)))
            .build();

        Self {
            limiter,
            source,
            config_cache,
            window_seconds: config.model_rpm_window_seconds,
            backoff_min_seconds: config.backoff_min_seconds,
            backoff_max_seconds: config.backoff_max_seconds.max(config.backoff_min_seconds),
        }
    }

    /// 读取限流配置（短时缓存）
    async fn limit_config(
        &self,
        request_id: &str,
        subject: &RpmSubject<'_>,
    ) -> Option<ModelLimit> {
        let cache_key =
            CacheKeyBuilder::limit_config(subject.user_id, subject.token_name, subject.model)
                .build();
        if let Some(cached) = self.config_cache.get(&cache_key).await {
            return cached;
        }

        match self
            .source
            .find_limit(subject.user_id, subject.token_name, subject.model)
            .await
        {
            Ok(limit) => {
                self.config_cache.insert(cache_key, limit).await;
                limit
            }
            Err(e) => {
                // 查询失败时不限流
                lwarn!(
                    request_id,
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "limit_lookup_failed",
                    &format!("读取模型限流配置失败，跳过限流: {e}")
                );
                None
            }
        }
    }

    /// 获取一次 RPM 准入；返回生效的限流配置（用于中继超时覆盖）
    pub async fn acquire(
        &self,
        request_id: &str,
        subject: &RpmSubject<'_>,
    ) -> Result<Option<ModelLimit>> {
        let key = CacheKeyBuilder::model_rpm(subject.user_id, subject.token_name, subject.model);
        let started = tokio::time::Instant::now();

        loop {
            let limit = self.limit_config(request_id, subject).await;
            let Some(active) = limit.filter(ModelLimit::is_active) else {
                return Ok(limit);
            };

            let max_requests = u32::try_from(active.rpm_limit).unwrap_or(0);
            let decision = self
                .limiter
                .admit(request_id, &key, max_requests, self.window_seconds)
                .await?;
            if decision.allowed {
                return Ok(Some(active));
            }

            let budget = active.wait_budget();
            let waited = started.elapsed();
            if waited >= budget {
                lwarn!(
                    request_id,
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "rpm_lock_timeout",
                    "RPM wait budget exhausted",
                    user_id = subject.user_id,
                    token_name = subject.token_name,
                    model = subject.model,
                    waited_ms = waited.as_millis() as u64
                );
                return Err(ProxyError::lock_timeout(LOCK_TIMEOUT_MESSAGE, waited.as_secs()));
            }

            let backoff = Duration::from_secs(fastrand::u64(
                self.backoff_min_seconds..=self.backoff_max_seconds,
            ));
            let sleep_for = backoff.min(budget - waited);
            ldebug!(
                request_id,
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                "rpm_backoff",
                "RPM limit reached, backing off",
                model = subject.model,
                backoff_ms = sleep_for.as_millis() as u64
            );
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;

    fn limit(rpm: i32, enabled: bool, wait: i64) -> ModelLimit {
        ModelLimit {
            rpm_limit: rpm,
            rpm_limit_enabled: enabled,
            wait_duration_seconds: wait,
            relay_timeout_seconds: 0,
        }
    }

    fn rpm_limiter(source: MockLimitSource, window_seconds: u64) -> ModelRpmLimiter {
        let config = RateLimitConfig {
            model_rpm_window_seconds: window_seconds,
            backoff_min_seconds: 1,
            backoff_max_seconds: 1,
            ..RateLimitConfig::default()
        };
        let window = SlidingWindowLimiter::new(
            Arc::new(CacheManager::memory_only()),
            Duration::from_secs(config.key_expiration_seconds),
        );
        ModelRpmLimiter::new(Arc::new(window), Arc::new(source), &config)
    }

    const SUBJECT: RpmSubject<'static> = RpmSubject {
        user_id: 1,
        token_name: "default",
        model: "gpt-4",
    };

    #[tokio::test]
    async fn missing_or_disabled_config_skips_limit() {
        let mut source = MockLimitSource::new();
        source.expect_find_limit().returning(|_, _, _| Ok(None));
        let limiter = rpm_limiter(source, 60);
        for _ in 0..3 {
            assert_eq!(limiter.acquire("t", &SUBJECT).await.unwrap(), None);
        }

        let mut source = MockLimitSource::new();
        source
            .expect_find_limit()
            .returning(|_, _, _| Ok(Some(limit(1, false, 0))));
        let limiter = rpm_limiter(source, 60);
        for _ in 0..3 {
            assert!(limiter.acquire("t", &SUBJECT).await.is_ok());
        }
    }

    #[tokio::test]
    async fn zero_wait_budget_fails_with_lock_timeout() {
        let mut source = MockLimitSource::new();
        source
            .expect_find_limit()
            .returning(|_, _, _| Ok(Some(limit(1, true, 0))));
        let limiter = rpm_limiter(source, 60);

        assert!(limiter.acquire("t", &SUBJECT).await.is_ok());
        let err = limiter.acquire("t", &SUBJECT).await.unwrap_err();
        assert!(matches!(err, ProxyError::LockTimeout { .. }));
        assert_eq!(err.to_string(), LOCK_TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn waiting_request_is_admitted_after_window_slides() {
        let mut source = MockLimitSource::new();
        source
            .expect_find_limit()
            .returning(|_, _, _| Ok(Some(limit(1, true, 5))));
        let limiter = rpm_limiter(source, 1);

        assert!(limiter.acquire("t", &SUBJECT).await.is_ok());
        let started = std::time::Instant::now();
        let admitted = limiter.acquire("t", &SUBJECT).await.unwrap();
        assert!(admitted.is_some());
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn lookup_failure_fails_open() {
        let mut source = MockLimitSource::new();
        source
            .expect_find_limit()
            .returning(|_, _, _| Err(ProxyError::database("db down")));
        let limiter = rpm_limiter(source, 60);
        assert_eq!(limiter.acquire("t", &SUBJECT).await.unwrap(), None);
    }

    #[test]
    fn relay_timeout_override() {
        let mut l = limit(10, true, 0);
        assert_eq!(l.relay_timeout(), None);
        l.relay_timeout_seconds = 30;
        assert_eq!(l.relay_timeout(), Some(Duration::from_secs(30)));
    }
}
