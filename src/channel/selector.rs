//! # 渠道选择
//!
//! 过滤可用渠道后，取最高优先级层级，在层级内按权重随机选择

use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror};

use super::registry::ChannelRegistry;
use super::types::Channel;

/// 渠道选择器
pub struct ChannelSelector {
    registry: Arc<ChannelRegistry>,
}

impl ChannelSelector {
    pub const fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// 为 (分组, 模型) 选择一个可用渠道，跳过已尝试的渠道
    pub async fn select(
        &self,
        request_id: &str,
        group: &str,
        model: &str,
        exclude: &[i32],
    ) -> Result<Arc<Channel>> {
        let candidates = self.registry.candidates(group).await?;

        let eligible: Vec<Arc<Channel>> = candidates
            .channels
            .into_iter()
            .filter(|c| c.is_enabled() && c.supports_model(model) && !exclude.contains(&c.id))
            .collect();

        if eligible.is_empty() {
            if candidates.missing.is_empty() {
                return Err(ProxyError::no_available_channel(group, model));
            }
            lerror!(
                request_id,
                LogStage::Scheduling,
                LogComponent::Selector,
                "channel_inconsistent",
                "Channel index references rows that no longer exist",
                group = group,
                model = model,
                missing = ?candidates.missing
            );
            return Err(ProxyError::channel_inconsistent(group, model));
        }

        let tier = top_priority_tier(&eligible);
        let total_weight: u64 = tier.iter().map(|c| c.effective_weight()).sum();
        let roll = fastrand::u64(0..total_weight);
        let selected = pick_weighted(&tier, roll)
            .ok_or_else(|| crate::internal_error!("weighted selection produced no channel"))?;

        ldebug!(
            request_id,
            LogStage::Scheduling,
            LogComponent::Selector,
            "select_channel",
            "Selected channel using weighted priority strategy",
            channel_id = selected.id,
            channel_name = %selected.name,
            priority = selected.priority,
            tier_size = tier.len(),
            total_weight = total_weight,
            excluded = ?exclude
        );
        Ok(Arc::clone(selected))
    }
}

/// 取最高优先级的渠道集合
fn top_priority_tier(channels: &[Arc<Channel>]) -> Vec<Arc<Channel>> {
    let Some(top) = channels.iter().map(|c| c.priority).max() else {
        return Vec::new();
    };
    channels
        .iter()
        .filter(|c| c.priority == top)
        .cloned()
        .collect()
}

/// 按累积权重定位 `roll` 所在的渠道
fn pick_weighted(channels: &[Arc<Channel>], roll: u64) -> Option<&Arc<Channel>> {
    let mut cursor = roll;
    for channel in channels {
        let weight = channel.effective_weight();
        if cursor < weight {
            return Some(channel);
        }
        cursor -= weight;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::registry::MemoryChannelSource;
    use crate::channel::types::{ChannelStatus, VendorType, fixtures::channel};

    async fn selector(channels: Vec<Channel>) -> ChannelSelector {
        let source = Arc::new(MemoryChannelSource::new(channels));
        ChannelSelector::new(Arc::new(ChannelRegistry::load(source).await.unwrap()))
    }

    #[tokio::test]
    async fn empty_pool_names_group_and_model() {
        let selector = selector(vec![]).await;
        let err = selector.select("t", "default", "gpt-4", &[]).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no available channel for model gpt-4 under group default"
        );
        assert_eq!(err.to_http_response_parts().0.as_u16(), 503);
    }

    #[tokio::test]
    async fn filters_status_model_group_and_exclusions() {
        let mut disabled = channel(1, VendorType::OpenAi, &["gpt-4"], &["default"]);
        disabled.status = ChannelStatus::ManuallyDisabled;
        let selector = selector(vec![
            disabled,
            channel(2, VendorType::OpenAi, &["gpt-3.5"], &["default"]),
            channel(3, VendorType::OpenAi, &["gpt-4"], &["vip"]),
            channel(4, VendorType::OpenAi, &["gpt-4"], &["default"]),
            channel(5, VendorType::OpenAi, &["*"], &["default"]),
        ])
        .await;

        for _ in 0..20 {
            let picked = selector.select("t", "default", "gpt-4", &[]).await.unwrap();
            assert!(picked.id == 4 || picked.id == 5);
        }
        let picked = selector.select("t", "default", "gpt-4", &[4]).await.unwrap();
        assert_eq!(picked.id, 5);
        assert!(selector.select("t", "default", "gpt-4", &[4, 5]).await.is_err());
    }

    #[tokio::test]
    async fn higher_priority_tier_wins() {
        let mut high = channel(1, VendorType::Claude, &["claude-3-opus"], &["default"]);
        high.priority = 10;
        let low = channel(2, VendorType::Claude, &["claude-3-opus"], &["default"]);
        let selector = selector(vec![high, low]).await;

        for _ in 0..20 {
            let picked = selector.select("t", "default", "claude-3-opus", &[]).await.unwrap();
            assert_eq!(picked.id, 1);
        }
        // 高优先级被排除后退到下一层
        let picked = selector.select("t", "default", "claude-3-opus", &[1]).await.unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn weighted_pick_covers_cumulative_ranges() {
        let mut a = channel(1, VendorType::OpenAi, &["m"], &["g"]);
        a.weight = 3;
        let mut b = channel(2, VendorType::OpenAi, &["m"], &["g"]);
        b.weight = 0;
        let channels = vec![Arc::new(a), Arc::new(b)];

        assert_eq!(pick_weighted(&channels, 0).map(|c| c.id), Some(1));
        assert_eq!(pick_weighted(&channels, 2).map(|c| c.id), Some(1));
        // 权重 0 按 1 计
        assert_eq!(pick_weighted(&channels, 3).map(|c| c.id), Some(2));
        assert!(pick_weighted(&channels, 4).is_none());
    }
}
