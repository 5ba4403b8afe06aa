//! # 请求分发
//!
//! 在选择渠道前完成令牌级检查（来源 IP、分组、指定渠道、模型白名单），
//! 然后为请求选出渠道并产出分发结果。

use std::net::IpAddr;
use std::sync::Arc;

use crate::auth::TokenInfo;
use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::pricing::PricingConfig;

use super::selector::ChannelSelector;
use super::types::Channel;

/// 分发结果
#[derive(Debug, Clone)]
pub struct Distribution {
    /// 生效分组
    pub group: String,
    /// 客户端请求的模型名（重试时复用）
    pub original_model: String,
    pub channel: Arc<Channel>,
    /// 是否由令牌指定渠道（指定渠道不换渠道重试）
    pub pinned: bool,
    /// 按供应商类型解析出的版本号
    pub api_version: Option<String>,
}

/// 请求分发器
pub struct Distributor {
    selector: Arc<ChannelSelector>,
    pricing: Arc<PricingConfig>,
}

impl Distributor {
    pub const fn new(selector: Arc<ChannelSelector>, pricing: Arc<PricingConfig>) -> Self {
        Self { selector, pricing }
    }

    pub fn selector(&self) -> &Arc<ChannelSelector> {
        &self.selector
    }

    /// 解析令牌的生效分组
    pub fn resolve_group(&self, token: &TokenInfo) -> Result<String> {
        let group = if token.token_group.is_empty() {
            token.user_group.clone()
        } else {
            if !self
                .pricing
                .is_usable_group(&token.user_group, &token.token_group)
            {
                return Err(ProxyError::forbidden(format!(
                    "token group {} is not usable for this user",
                    token.token_group
                )));
            }
            token.token_group.clone()
        };

        if self.pricing.group_ratio(&group).is_none() {
            return Err(ProxyError::forbidden(format!("group {group} is deprecated")));
        }
        Ok(group)
    }

    /// 为请求分发渠道
    pub async fn distribute(
        &self,
        request_id: &str,
        token: &TokenInfo,
        client_ip: Option<IpAddr>,
        model: &str,
    ) -> Result<Distribution> {
        if !token.ip_allowed(client_ip) {
            return Err(ProxyError::forbidden("ip not allowed"));
        }

        let group = self.resolve_group(token)?;

        let (channel, pinned) = if let Some(channel_id) = token.specific_channel_id {
            let channel = self
                .selector
                .registry()
                .get(channel_id)
                .await?
                .ok_or_else(|| ProxyError::forbidden(format!("channel {channel_id} does not exist")))?;
            if !channel.is_enabled() {
                return Err(ProxyError::forbidden(format!(
                    "channel {channel_id} is disabled"
                )));
            }
            (channel, true)
        } else {
            if !token.can_access_model(model) {
                return Err(ProxyError::forbidden(format!(
                    "token cannot access model {model}"
                )));
            }
            let channel = self.selector.select(request_id, &group, model, &[]).await?;
            (channel, false)
        };

        let api_version = channel.api_version();

        linfo!(
            request_id,
            LogStage::Scheduling,
            LogComponent::Distributor,
            "distributed",
            "Request distributed to channel",
            group = %group,
            model = model,
            channel_id = channel.id,
            vendor = channel.vendor.as_str(),
            pinned = pinned
        );

        Ok(Distribution {
            group,
            original_model: model.to_string(),
            channel,
            pinned,
            api_version,
        })
    }
}
