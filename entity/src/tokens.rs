//! # 令牌实体定义
//!
//! 租户签发的 API 令牌，带独立额度与模型白名单

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 令牌实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    #[sea_orm(unique)]
    pub key: String,
    pub name: String,
    /// 1 启用, 2 禁用, 3 过期, 4 耗尽
    pub status: i32,
    /// 令牌分组，为空时沿用用户分组
    pub group: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    pub model_limits_enabled: bool,
    /// 逗号分隔的模型白名单
    pub model_limits: String,
    /// 换行或逗号分隔的 IP / CIDR 白名单
    pub allow_ips: Option<String>,
    /// 过期时间（Unix 秒），-1 表示永不过期
    pub expired_time: i64,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
