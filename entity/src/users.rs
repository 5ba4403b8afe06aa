//! # 用户实体定义
//!
//! 租户用户及其额度计数器的 Sea-ORM 实体模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 用户实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub username: String,
    /// 用户所属分组（定价层级）
    pub group: String,
    /// 剩余额度
    pub quota: i64,
    /// 已用额度
    pub used_quota: i64,
    pub request_count: i32,
    /// 1 启用, 2 禁用
    pub status: i32,
    /// 角色：1 普通用户, 10 管理员, 100 超级管理员
    pub role: i32,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tokens::Entity")]
    Tokens,
}

impl Related<super::tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tokens.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
