//! # 消费日志实体定义
//!
//! 只追加的额度消费记录

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 消费日志实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "consume_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub user_id: i32,
    pub token_id: i32,
    pub token_name: String,
    pub channel_id: i32,
    pub group: String,
    pub model_name: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub reasoning_tokens: i32,
    pub cached_tokens: i32,
    /// 实际扣除额度
    pub quota: i64,
    /// 实际额度与预扣额度之差
    pub quota_delta: i64,
    pub elapsed_ms: i64,
    pub is_stream: bool,
    /// 零用量时的原因编码
    pub zero_usage_cause: Option<String>,
    pub note: String,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
