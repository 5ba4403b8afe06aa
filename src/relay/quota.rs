//! # 额度存储与预扣
//!
//! 额度计数只通过原子增减修改；预扣使用带下限条件的单条 UPDATE。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use entity::{Channels, ConsumeLogs, Tokens, Users, channels, consume_logs, tokens, users};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tokio::sync::Mutex;

use super::settlement::ConsumeLogEntry;
use crate::auth::TokenInfo;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// 额度存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn user_quota(&self, user_id: i32) -> Result<i64>;

    async fn token_quota(&self, token_id: i32) -> Result<i64>;

    /// 预扣令牌额度；`enforce` 为真时余额不足则失败
    async fn reserve_token(&self, token_id: i32, amount: i64, enforce: bool) -> Result<()>;

    /// 预扣用户额度，余额不足则失败
    async fn reserve_user(&self, user_id: i32, amount: i64) -> Result<()>;

    /// 令牌额度增减：正数为多扣，负数为退还
    async fn adjust_token(&self, token_id: i32, delta: i64) -> Result<()>;

    /// 用户额度增减：正数为多扣，负数为退还
    async fn adjust_user(&self, user_id: i32, delta: i64) -> Result<()>;

    /// 累计用户已用额度、请求次数与渠道已用额度
    async fn record_usage(&self, user_id: i32, channel_id: i32, quota: i64) -> Result<()>;

    async fn insert_log(&self, entry: &ConsumeLogEntry) -> Result<()>;
}

/// 预扣额度，返回实际预扣的数量
///
/// 用户与令牌额度都远超预估时走信任路径，不预扣。
pub async fn pre_consume(
    store: &dyn QuotaStore,
    request_id: &str,
    token: &TokenInfo,
    estimated: i64,
    trusted_multiplier: i64,
) -> Result<i64> {
    let user_quota = store.user_quota(token.user_id).await?;
    if user_quota <= 0 {
        return Err(ProxyError::insufficient_quota("user quota is not enough"));
    }
    if user_quota - estimated < 0 {
        return Err(ProxyError::insufficient_quota(format!(
            "user quota is not enough, remaining {user_quota}, need {estimated}"
        )));
    }

    let threshold = estimated.saturating_mul(trusted_multiplier);
    let trusted = user_quota > threshold
        && (token.unlimited_quota || store.token_quota(token.token_id).await? > threshold);
    if trusted {
        ldebug!(
            request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "pre_consume_trusted",
            "Quota well above estimate, skipping pre-consumption",
            user_id = token.user_id,
            user_quota = user_quota,
            estimated = estimated
        );
        return Ok(0);
    }

    if estimated <= 0 {
        return Ok(0);
    }

    store
        .reserve_token(token.token_id, estimated, !token.unlimited_quota)
        .await?;
    if let Err(e) = store.reserve_user(token.user_id, estimated).await {
        store.adjust_token(token.token_id, -estimated).await?;
        return Err(e);
    }

    linfo!(
        request_id,
        LogStage::Billing,
        LogComponent::Billing,
        "pre_consumed",
        "Quota pre-consumed",
        user_id = token.user_id,
        token_id = token.token_id,
        amount = estimated
    );
    Ok(estimated)
}

/// 基于数据库的额度存储
pub struct DbQuotaStore {
    db: Arc<DatabaseConnection>,
}

impl DbQuotaStore {
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QuotaStore for DbQuotaStore {
    async fn user_quota(&self, user_id: i32) -> Result<i64> {
        Users::find_by_id(user_id)
            .one(self.db.as_ref())
            .await?
            .map(|user| user.quota)
            .ok_or_else(|| ProxyError::unauthorized(format!("user {user_id} does not exist")))
    }

    async fn token_quota(&self, token_id: i32) -> Result<i64> {
        Tokens::find_by_id(token_id)
            .one(self.db.as_ref())
            .await?
            .map(|token| token.remain_quota)
            .ok_or_else(|| ProxyError::unauthorized(format!("token {token_id} does not exist")))
    }

    async fn reserve_token(&self, token_id: i32, amount: i64, enforce: bool) -> Result<()> {
        let mut update = Tokens::update_many()
            .col_expr(
                tokens::Column::RemainQuota,
                Expr::col(tokens::Column::RemainQuota).sub(amount),
            )
            .col_expr(
                tokens::Column::UsedQuota,
                Expr::col(tokens::Column::UsedQuota).add(amount),
            )
            .filter(tokens::Column::Id.eq(token_id));
        if enforce {
            update = update.filter(tokens::Column::RemainQuota.gte(amount));
        }
        let result = update.exec(self.db.as_ref()).await?;
        if result.rows_affected == 0 {
            return Err(ProxyError::insufficient_quota("token quota is not enough"));
        }
        Ok(())
    }

    async fn reserve_user(&self, user_id: i32, amount: i64) -> Result<()> {
        let result = Users::update_many()
            .col_expr(users::Column::Quota, Expr::col(users::Column::Quota).sub(amount))
            .filter(users::Column::Id.eq(user_id))
            .filter(users::Column::Quota.gte(amount))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(ProxyError::insufficient_quota("user quota is not enough"));
        }
        Ok(())
    }

    async fn adjust_token(&self, token_id: i32, delta: i64) -> Result<()> {
        Tokens::update_many()
            .col_expr(
                tokens::Column::RemainQuota,
                Expr::col(tokens::Column::RemainQuota).sub(delta),
            )
            .col_expr(
                tokens::Column::UsedQuota,
                Expr::col(tokens::Column::UsedQuota).add(delta),
            )
            .filter(tokens::Column::Id.eq(token_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn adjust_user(&self, user_id: i32, delta: i64) -> Result<()> {
        Users::update_many()
            .col_expr(users::Column::Quota, Expr::col(users::Column::Quota).sub(delta))
            .filter(users::Column::Id.eq(user_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn record_usage(&self, user_id: i32, channel_id: i32, quota: i64) -> Result<()> {
        Users::update_many()
            .col_expr(
                users::Column::UsedQuota,
                Expr::col(users::Column::UsedQuota).add(quota),
            )
            .col_expr(
                users::Column::RequestCount,
                Expr::col(users::Column::RequestCount).add(1),
            )
            .filter(users::Column::Id.eq(user_id))
            .exec(self.db.as_ref())
            .await?;
        Channels::update_many()
            .col_expr(
                channels::Column::UsedQuota,
                Expr::col(channels::Column::UsedQuota).add(quota),
            )
            .filter(channels::Column::Id.eq(channel_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn insert_log(&self, entry: &ConsumeLogEntry) -> Result<()> {
        let to_i32 = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        let log = consume_logs::ActiveModel {
            request_id: Set(entry.request_id.clone()),
            user_id: Set(entry.user_id),
            token_id: Set(entry.token_id),
            token_name: Set(entry.token_name.clone()),
            channel_id: Set(entry.channel_id),
            group: Set(entry.group.clone()),
            model_name: Set(entry.model_name.clone()),
            prompt_tokens: Set(to_i32(entry.usage.prompt_tokens)),
            completion_tokens: Set(to_i32(entry.usage.completion_tokens)),
            reasoning_tokens: Set(to_i32(entry.usage.reasoning_tokens)),
            cached_tokens: Set(to_i32(entry.usage.cached_tokens)),
            quota: Set(entry.quota),
            quota_delta: Set(entry.quota_delta),
            elapsed_ms: Set(entry.elapsed_ms),
            is_stream: Set(entry.is_stream),
            zero_usage_cause: Set(entry.zero_usage_cause.map(|c| c.as_str().to_string())),
            note: Set(entry.note.clone()),
            created_at: Set(chrono::Utc::now().naive_utc()),
            ..Default::default()
        };
        ConsumeLogs::insert(log).exec(self.db.as_ref()).await?;
        Ok(())
    }
}

/// 内存额度存储，供测试与单机演示使用
#[derive(Default)]
pub struct MemoryQuotaStore {
    users: DashMap<i32, i64>,
    tokens: DashMap<i32, i64>,
    used: DashMap<i32, i64>,
    channel_used: DashMap<i32, i64>,
    logs: Mutex<Vec<ConsumeLogEntry>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user(&self, user_id: i32, quota: i64) {
        self.users.insert(user_id, quota);
    }

    pub fn set_token(&self, token_id: i32, quota: i64) {
        self.tokens.insert(token_id, quota);
    }

    pub fn channel_used(&self, channel_id: i32) -> i64 {
        self.channel_used.get(&channel_id).map_or(0, |v| *v)
    }

    pub fn user_used(&self, user_id: i32) -> i64 {
        self.used.get(&user_id).map_or(0, |v| *v)
    }

    pub async fn logs(&self) -> Vec<ConsumeLogEntry> {
        self.logs.lock().await.clone()
    }

    fn reserve(map: &DashMap<i32, i64>, id: i32, amount: i64, enforce: bool) -> bool {
        let Some(mut entry) = map.get_mut(&id) else {
            return false;
        };
        if enforce && *entry < amount {
            return false;
        }
        *entry -= amount;
        true
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn user_quota(&self, user_id: i32) -> Result<i64> {
        self.users
            .get(&user_id)
            .map(|v| *v)
            .ok_or_else(|| ProxyError::unauthorized(format!("user {user_id} does not exist")))
    }

    async fn token_quota(&self, token_id: i32) -> Result<i64> {
        self.tokens
            .get(&token_id)
            .map(|v| *v)
            .ok_or_else(|| ProxyError::unauthorized(format!("token {token_id} does not exist")))
    }

    async fn reserve_token(&self, token_id: i32, amount: i64, enforce: bool) -> Result<()> {
        if Self::reserve(&self.tokens, token_id, amount, enforce) {
            Ok(())
        } else {
            Err(ProxyError::insufficient_quota("token quota is not enough"))
        }
    }

    async fn reserve_user(&self, user_id: i32, amount: i64) -> Result<()> {
        if Self::reserve(&self.users, user_id, amount, true) {
            Ok(())
        } else {
            Err(ProxyError::insufficient_quota("user quota is not enough"))
        }
    }

    async fn adjust_token(&self, token_id: i32, delta: i64) -> Result<()> {
        if let Some(mut quota) = self.tokens.get_mut(&token_id) {
            *quota -= delta;
        }
        Ok(())
    }

    async fn adjust_user(&self, user_id: i32, delta: i64) -> Result<()> {
        if let Some(mut quota) = self.users.get_mut(&user_id) {
            *quota -= delta;
        }
        Ok(())
    }

    async fn record_usage(&self, user_id: i32, channel_id: i32, quota: i64) -> Result<()> {
        *self.used.entry(user_id).or_insert(0) += quota;
        *self.channel_used.entry(channel_id).or_insert(0) += quota;
        Ok(())
    }

    async fn insert_log(&self, entry: &ConsumeLogEntry) -> Result<()> {
        self.logs.lock().await.push(entry.clone());
        Ok(())
    }
}
