//! # 模型限流配置实体
//!
//! 按 (用户, 令牌名, 模型) 维度的 RPM 限制

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "model_limits")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    pub token_name: String,
    pub model_name: String,
    pub rpm_limit: i32,
    pub rpm_limit_enabled: bool,
    /// 被限流时最长等待秒数
    pub wait_duration_seconds: i64,
    /// 覆盖全局中继超时，0 表示沿用全局
    pub relay_timeout_seconds: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
