//! # 渠道实体定义
//!
//! 上游供应商凭证与配置单元

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 渠道实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    /// 供应商类型编码
    pub channel_type: i32,
    pub base_url: String,
    pub key: String,
    /// 逗号分隔的模型列表
    pub models: String,
    /// 逗号分隔的可达分组
    pub groups: String,
    /// JSON 对象：请求模型 -> 上游模型
    pub model_mapping: Option<String>,
    /// JSON 对象：上游状态码 -> 返回状态码
    pub status_code_mapping: Option<String>,
    /// JSON 对象：供应商专属设置（api_version / region / plugin）
    pub settings: Option<String>,
    /// 1 启用, 2 手动禁用, 3 自动禁用
    pub status: i32,
    pub weight: i32,
    pub priority: i64,
    pub tag: Option<String>,
    pub used_quota: i64,
    /// 软删除标记
    pub deleted: bool,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
