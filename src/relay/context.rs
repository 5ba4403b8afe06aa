//! # 请求上下文
//!
//! 单个中继请求的状态，由编排器独占；流式任务接管后随任务移动。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::TokenInfo;
use crate::channel::{Channel, Distribution};
use crate::pricing::PriceData;
use crate::providers::UpstreamTarget;

pub use crate::providers::RelayMode;

#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub mode: RelayMode,
    pub token: TokenInfo,
    pub group: String,
    /// 客户端请求的模型名
    pub original_model: String,
    /// 当前渠道映射后的模型名
    pub upstream_model: String,
    pub channel: Arc<Channel>,
    pub api_version: Option<String>,
    /// 令牌指定渠道时不换渠道重试
    pub pinned: bool,
    pub is_stream: bool,
    pub include_usage: bool,
    pub prompt_tokens: u32,
    pub price: PriceData,
    /// 预扣额度，信任快速路径下为 0
    pub pre_consumed_quota: i64,
    /// 本请求生效的中继超时
    pub relay_timeout: Option<Duration>,
    pub started_at: Instant,
    /// 已尝试过的渠道
    pub tried_channels: Vec<i32>,
}

impl RelayContext {
    pub fn new(
        request_id: &str,
        mode: RelayMode,
        token: TokenInfo,
        distribution: Distribution,
        price: PriceData,
    ) -> Self {
        let upstream_model = distribution
            .channel
            .upstream_model(&distribution.original_model);
        Self {
            request_id: request_id.to_string(),
            mode,
            token,
            group: distribution.group,
            original_model: distribution.original_model,
            upstream_model,
            tried_channels: vec![distribution.channel.id],
            channel: distribution.channel,
            api_version: distribution.api_version,
            pinned: distribution.pinned,
            is_stream: false,
            include_usage: false,
            prompt_tokens: 0,
            price,
            pre_consumed_quota: 0,
            relay_timeout: None,
            started_at: Instant::now(),
        }
    }

    /// 切换到重试渠道
    pub fn switch_channel(&mut self, channel: Arc<Channel>) {
        self.upstream_model = channel.upstream_model(&self.original_model);
        self.api_version = channel.api_version();
        self.tried_channels.push(channel.id);
        self.channel = channel;
    }

    /// 当前渠道的上游调用目标
    pub fn upstream_target(&self) -> UpstreamTarget {
        UpstreamTarget {
            mode: self.mode,
            base_url: self.channel.base_url().to_string(),
            api_key: self.channel.key.clone(),
            upstream_model: self.upstream_model.clone(),
            api_version: self.api_version.clone(),
            stream: self.is_stream,
            prompt_tokens: self.prompt_tokens,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 剩余的中继时间预算
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.relay_timeout
            .map(|timeout| timeout.saturating_sub(self.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::VendorType;
    use crate::channel::types::fixtures::channel;
    use crate::pricing::PricingConfig;

    fn token() -> TokenInfo {
        TokenInfo {
            token_id: 7,
            token_name: "ci".to_string(),
            user_id: 3,
            user_group: "default".to_string(),
            token_group: String::new(),
            role: 1,
            unlimited_quota: false,
            model_limits: None,
            allow_ips: Vec::new(),
            specific_channel_id: None,
        }
    }

    #[test]
    fn retry_switch_remaps_model_and_tracks_channels() {
        let mut first = channel(1, VendorType::OpenAi, &["gpt-4"], &["default"]);
        first.base_url = "https://one.test/".to_string();
        let mut second = channel(2, VendorType::Gemini, &["gpt-4"], &["default"]);
        second
            .model_mapping
            .insert("gpt-4".to_string(), "gemini-1.5-pro".to_string());
        second.settings.api_version = Some("v1".to_string());

        let mut pricing = PricingConfig::default();
        pricing.model_ratio.insert("gpt-4".to_string(), 15.0);
        let price = pricing.price_for("gpt-4", "default").unwrap();

        let distribution = Distribution {
            group: "default".to_string(),
            original_model: "gpt-4".to_string(),
            channel: Arc::new(first),
            pinned: false,
            api_version: None,
        };
        let mut ctx = RelayContext::new("r1", RelayMode::ChatCompletions, token(), distribution, price);
        assert_eq!(ctx.upstream_target().base_url, "https://one.test");
        assert_eq!(ctx.upstream_model, "gpt-4");

        ctx.switch_channel(Arc::new(second));
        assert_eq!(ctx.tried_channels, vec![1, 2]);
        let target = ctx.upstream_target();
        assert_eq!(target.upstream_model, "gemini-1.5-pro");
        assert_eq!(target.api_version.as_deref(), Some("v1"));
    }
}
