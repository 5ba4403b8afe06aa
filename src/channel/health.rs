//! # 渠道健康追踪
//!
//! 统计渠道连续失败次数，超过阈值自动禁用；成功一次即清零。

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheKeyBuilder, CacheManager};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

use super::registry::ChannelRegistry;
use super::types::ChannelStatus;

/// 失败计数的保留时间
const FAILURE_COUNTER_TTL: Duration = Duration::from_secs(3600);

pub struct ChannelHealth {
    cache: Arc<CacheManager>,
    registry: Arc<ChannelRegistry>,
    /// 0 表示不自动禁用
    threshold: u32,
}

impl ChannelHealth {
    pub const fn new(
        cache: Arc<CacheManager>,
        registry: Arc<ChannelRegistry>,
        threshold: u32,
    ) -> Self {
        Self {
            cache,
            registry,
            threshold,
        }
    }

    /// 记录一次失败；返回是否因此禁用了渠道
    pub async fn record_failure(&self, request_id: &str, channel_id: i32) -> Result<bool> {
        let key = CacheKeyBuilder::channel_failures(channel_id).build();
        let failures = self.cache.incr(&key, 1).await?;
        if failures == 1 {
            self.cache.expire(&key, FAILURE_COUNTER_TTL).await?;
        }

        ldebug!(
            request_id,
            LogStage::ResponseFailure,
            LogComponent::ChannelRegistry,
            "channel_failure",
            "Channel failure recorded",
            channel_id = channel_id,
            consecutive_failures = failures
        );

        if self.threshold == 0 || failures < i64::from(self.threshold) {
            return Ok(false);
        }

        self.registry
            .set_status(channel_id, ChannelStatus::AutoDisabled)
            .await?;
        self.cache.delete(&key).await?;
        lwarn!(
            request_id,
            LogStage::ResponseFailure,
            LogComponent::ChannelRegistry,
            "channel_auto_disabled",
            "Channel disabled after consecutive failures",
            channel_id = channel_id,
            consecutive_failures = failures
        );
        Ok(true)
    }

    /// 记录一次成功，清空失败计数
    pub async fn record_success(&self, channel_id: i32) -> Result<()> {
        self.cache
            .delete(&CacheKeyBuilder::channel_failures(channel_id).build())
            .await
    }
}
