//! # 额度结算
//!
//! 每个完成预扣的请求恰好结算一次，并且恰好写入一条消费日志。
//! 实际额度与预扣额度的差值回写到令牌与用户；上游失败时预扣额度交给后台退还。

use std::sync::Arc;

use serde::Serialize;

use super::context::RelayContext;
use super::quota::QuotaStore;
use super::refund::{Refund, RefundPool};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::providers::Usage;
use crate::{lerror, linfo, lwarn};

/// 零用量的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroUsageCause {
    UpstreamTimeout,
    EmptyResponse,
    UpstreamError,
    ClientDisconnected,
}

impl ZeroUsageCause {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpstreamTimeout => "upstream_timeout",
            Self::EmptyResponse => "empty_response",
            Self::UpstreamError => "upstream_error",
            Self::ClientDisconnected => "client_disconnected",
        }
    }
}

impl std::fmt::Display for ZeroUsageCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条消费日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeLogEntry {
    pub request_id: String,
    pub user_id: i32,
    pub token_id: i32,
    pub token_name: String,
    pub channel_id: i32,
    pub group: String,
    pub model_name: String,
    pub usage: Usage,
    pub quota: i64,
    /// 实际额度减预扣额度
    pub quota_delta: i64,
    pub elapsed_ms: i64,
    pub is_stream: bool,
    pub zero_usage_cause: Option<ZeroUsageCause>,
    pub note: String,
}

impl ConsumeLogEntry {
    fn from_context(ctx: &RelayContext, usage: Usage, quota: i64) -> Self {
        Self {
            request_id: ctx.request_id.clone(),
            user_id: ctx.token.user_id,
            token_id: ctx.token.token_id,
            token_name: ctx.token.token_name.clone(),
            channel_id: ctx.channel.id,
            group: ctx.group.clone(),
            model_name: ctx.original_model.clone(),
            usage,
            quota,
            quota_delta: quota - ctx.pre_consumed_quota,
            elapsed_ms: i64::try_from(ctx.elapsed().as_millis()).unwrap_or(i64::MAX),
            is_stream: ctx.is_stream,
            zero_usage_cause: None,
            note: String::new(),
        }
    }
}

/// 结算结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub quota: i64,
    pub quota_delta: i64,
    pub zero_usage_cause: Option<ZeroUsageCause>,
}

/// 结算器
#[derive(Clone)]
pub struct Settler {
    store: Arc<dyn QuotaStore>,
    refunds: RefundPool,
}

impl Settler {
    pub fn new(store: Arc<dyn QuotaStore>, refunds: RefundPool) -> Self {
        Self { store, refunds }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn refunds(&self) -> &RefundPool {
        &self.refunds
    }

    /// 按实际用量结算
    ///
    /// 用量为零时不收费，`cause` 缺省记为空响应；有用量的中断请求照常计费，
    /// 中断原因写入日志备注。
    pub async fn settle(
        &self,
        ctx: &RelayContext,
        usage: Usage,
        cause: Option<ZeroUsageCause>,
    ) -> Result<Settlement> {
        let zero_usage_cause = usage
            .is_zero()
            .then(|| cause.unwrap_or(ZeroUsageCause::EmptyResponse));
        let quota = if zero_usage_cause.is_some() {
            0
        } else {
            ctx.price.quota_for(&usage)
        };

        let mut entry = ConsumeLogEntry::from_context(ctx, usage, quota);
        entry.zero_usage_cause = zero_usage_cause;
        if let Some(cause) = zero_usage_cause {
            entry.note = format!("zero usage: {cause}");
            lwarn!(
                ctx.request_id,
                LogStage::Billing,
                LogComponent::Billing,
                "zero_usage",
                "Request produced no usage, nothing charged",
                cause = %cause,
                channel_id = ctx.channel.id,
                model = %ctx.original_model
            );
        } else if let Some(cause) = cause {
            entry.note = format!("stream interrupted: {cause}");
        }

        // 各项回写互不依赖，单项失败只记录错误，消费日志总要写入
        let delta = entry.quota_delta;
        if delta != 0 {
            if let Err(e) = self.store.adjust_token(ctx.token.token_id, delta).await {
                report_write_failure(ctx, "adjust_token", delta, &e);
            }
            if let Err(e) = self.store.adjust_user(ctx.token.user_id, delta).await {
                report_write_failure(ctx, "adjust_user", delta, &e);
            }
        }
        if quota > 0 {
            if let Err(e) = self
                .store
                .record_usage(ctx.token.user_id, ctx.channel.id, quota)
                .await
            {
                report_write_failure(ctx, "record_usage", quota, &e);
            }
        }
        self.store.insert_log(&entry).await?;

        linfo!(
            ctx.request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "settled",
            "Request settled",
            user_id = ctx.token.user_id,
            channel_id = ctx.channel.id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            quota = quota,
            pre_consumed = ctx.pre_consumed_quota,
            delta = delta
        );

        Ok(Settlement {
            quota,
            quota_delta: delta,
            zero_usage_cause,
        })
    }

    /// 上游失败：写零额度日志，预扣额度异步退还
    pub async fn settle_failure(
        &self,
        ctx: &RelayContext,
        cause: ZeroUsageCause,
        note: &str,
    ) -> Result<Settlement> {
        let mut entry = ConsumeLogEntry::from_context(ctx, Usage::default(), 0);
        entry.zero_usage_cause = Some(cause);
        entry.note = note.to_string();

        self.refunds.submit(Refund {
            request_id: ctx.request_id.clone(),
            user_id: ctx.token.user_id,
            token_id: ctx.token.token_id,
            amount: ctx.pre_consumed_quota,
        });
        self.store.insert_log(&entry).await?;

        lwarn!(
            ctx.request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "settled_failure",
            "Request failed, pre-consumed quota scheduled for refund",
            cause = %cause,
            channel_id = ctx.channel.id,
            refund = ctx.pre_consumed_quota
        );

        Ok(Settlement {
            quota: 0,
            quota_delta: entry.quota_delta,
            zero_usage_cause: Some(cause),
        })
    }
}

fn report_write_failure(ctx: &RelayContext, operation: &str, amount: i64, err: &ProxyError) {
    lerror!(
        ctx.request_id,
        LogStage::Billing,
        LogComponent::Billing,
        operation,
        "Quota write failed during settlement",
        user_id = ctx.token.user_id,
        token_id = ctx.token.token_id,
        channel_id = ctx.channel.id,
        amount = amount,
        error = %err
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenInfo;
    use crate::channel::types::fixtures::channel;
    use crate::channel::{Distribution, VendorType};
    use crate::pricing::PricingConfig;
    use crate::relay::context::RelayMode;
    use crate::relay::quota::{MemoryQuotaStore, MockQuotaStore};
    use std::collections::HashMap;

    fn context(pre: i64) -> RelayContext {
        let token = TokenInfo {
            token_id: 1,
            token_name: "default".to_string(),
            user_id: 1,
            user_group: "default".to_string(),
            token_group: String::new(),
            role: 1,
            unlimited_quota: false,
            model_limits: None,
            allow_ips: Vec::new(),
            specific_channel_id: None,
        };
        let distribution = Distribution {
            group: "default".to_string(),
            original_model: "gpt-4".to_string(),
            channel: Arc::new(channel(5, VendorType::OpenAi, &["gpt-4"], &["default"])),
            pinned: false,
            api_version: None,
        };
        let pricing = PricingConfig {
            model_ratio: HashMap::from([("gpt-4".to_string(), 1.0)]),
            ..PricingConfig::default()
        };
        let price = pricing.price_for("gpt-4", "default").unwrap();
        let mut ctx = RelayContext::new("req-1", RelayMode::ChatCompletions, token, distribution, price);
        ctx.pre_consumed_quota = pre;
        ctx
    }

    fn settler(user: i64, token: i64) -> (Settler, Arc<MemoryQuotaStore>) {
        let store = Arc::new(MemoryQuotaStore::new());
        store.set_user(1, user);
        store.set_token(1, token);
        let refunds = RefundPool::new(store.clone(), 4);
        (Settler::new(store.clone(), refunds), store)
    }

    #[tokio::test]
    async fn overestimate_is_returned() {
        // 预扣 500 后余额为 9500
        let (settler, store) = settler(9_500, 9_500);
        let ctx = context(500);
        let result = settler.settle(&ctx, Usage::new(100, 50), None).await.unwrap();

        assert_eq!(result.quota, 150);
        assert_eq!(result.quota_delta, -350);
        assert_eq!(store.user_quota(1).await.unwrap(), 10_000 - 150);
        assert_eq!(store.token_quota(1).await.unwrap(), 10_000 - 150);
        assert_eq!(store.user_used(1), 150);
        assert_eq!(store.channel_used(5), 150);

        let logs = store.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 150);
        assert_eq!(logs[0].quota_delta, -350);
        assert_eq!(logs[0].zero_usage_cause, None);
    }

    #[tokio::test]
    async fn underestimate_charges_the_difference() {
        let (settler, store) = settler(10_000, 10_000);
        let ctx = context(0);
        let result = settler.settle(&ctx, Usage::new(300, 200), None).await.unwrap();
        assert_eq!(result.quota_delta, 500);
        assert_eq!(store.user_quota(1).await.unwrap(), 9_500);
    }

    #[tokio::test]
    async fn zero_usage_is_free_and_explained() {
        let (settler, store) = settler(9_500, 9_500);
        let ctx = context(500);
        let result = settler
            .settle(&ctx, Usage::default(), Some(ZeroUsageCause::ClientDisconnected))
            .await
            .unwrap();

        assert_eq!(result.quota, 0);
        assert_eq!(result.zero_usage_cause, Some(ZeroUsageCause::ClientDisconnected));
        assert_eq!(store.user_quota(1).await.unwrap(), 10_000);
        assert_eq!(store.user_used(1), 0);

        let logs = store.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].note, "zero usage: client_disconnected");
    }

    #[tokio::test]
    async fn interrupted_request_with_usage_is_charged() {
        let (settler, store) = settler(9_500, 9_500);
        let result = settler
            .settle(&context(500), Usage::new(40, 10), Some(ZeroUsageCause::UpstreamTimeout))
            .await
            .unwrap();

        assert_eq!(result.quota, 50);
        assert_eq!(result.zero_usage_cause, None);
        assert_eq!(store.user_quota(1).await.unwrap(), 9_950);
        let logs = store.logs().await;
        assert_eq!(logs[0].note, "stream interrupted: upstream_timeout");
    }

    #[tokio::test]
    async fn zero_usage_defaults_to_empty_response() {
        let (settler, _) = settler(10_000, 10_000);
        let result = settler.settle(&context(0), Usage::default(), None).await.unwrap();
        assert_eq!(result.zero_usage_cause, Some(ZeroUsageCause::EmptyResponse));
    }

    #[tokio::test]
    async fn failure_refunds_in_background() {
        let (settler, store) = settler(9_500, 9_500);
        let ctx = context(500);
        settler
            .settle_failure(&ctx, ZeroUsageCause::UpstreamError, "upstream returned 500")
            .await
            .unwrap();
        settler.refunds().drain().await;

        assert_eq!(store.user_quota(1).await.unwrap(), 10_000);
        assert_eq!(store.token_quota(1).await.unwrap(), 10_000);
        let logs = store.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 0);
        assert_eq!(logs[0].quota_delta, -500);
        assert_eq!(logs[0].note, "upstream returned 500");
    }

    #[tokio::test]
    async fn log_is_written_when_quota_writes_fail() {
        let mut store = MockQuotaStore::new();
        store.expect_adjust_token().times(1).returning(|_, _| Ok(()));
        store
            .expect_adjust_user()
            .times(1)
            .returning(|_, _| Err(ProxyError::database("connection reset")));
        store
            .expect_record_usage()
            .times(1)
            .returning(|_, _, _| Err(ProxyError::database("connection reset")));
        store
            .expect_insert_log()
            .withf(|entry| entry.quota == 150 && entry.quota_delta == -350)
            .times(1)
            .returning(|_| Ok(()));

        let store: Arc<dyn QuotaStore> = Arc::new(store);
        let settler = Settler::new(store.clone(), RefundPool::new(store, 1));
        let result = settler.settle(&context(500), Usage::new(100, 50), None).await.unwrap();
        assert_eq!(result.quota, 150);
    }

    #[test]
    fn causes_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&ZeroUsageCause::UpstreamTimeout).unwrap(),
            "\"upstream_timeout\""
        );
        assert_eq!(ZeroUsageCause::EmptyResponse.as_str(), "empty_response");
    }
}
