//! # 令牌认证
//!
//! 解析 `Authorization: Bearer sk-{key}[-{channel_id}]`，校验令牌与所属用户状态，
//! 产出中继所需的令牌上下文。

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use entity::{tokens, users};
use ipnetwork::IpNetwork;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 管理员角色下限
pub const ROLE_ADMIN: i32 = 10;

/// 令牌状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Enabled,
            3 => Self::Expired,
            4 => Self::Exhausted,
            _ => Self::Disabled,
        }
    }
}

/// 认证通过的令牌上下文
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token_id: i32,
    pub token_name: String,
    pub user_id: i32,
    pub user_group: String,
    /// 令牌指定的分组，空表示沿用用户分组
    pub token_group: String,
    pub role: i32,
    pub unlimited_quota: bool,
    /// `None` 表示不限制模型
    pub model_limits: Option<HashSet<String>>,
    /// 为空表示不限制来源 IP
    pub allow_ips: Vec<IpNetwork>,
    /// 管理员通过 `sk-{key}-{channel_id}` 指定的渠道
    pub specific_channel_id: Option<i32>,
}

impl TokenInfo {
    pub fn ip_allowed(&self, ip: Option<IpAddr>) -> bool {
        if self.allow_ips.is_empty() {
            return true;
        }
        ip.is_some_and(|ip| self.allow_ips.iter().any(|net| net.contains(ip)))
    }

    pub fn can_access_model(&self, model: &str) -> bool {
        self.model_limits
            .as_ref()
            .is_none_or(|allowed| allowed.contains(model))
    }
}

/// 解析后的令牌键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub key: &'a str,
    pub channel_suffix: Option<&'a str>,
}

/// 从 Authorization 头解析令牌键
pub fn parse_authorization(header: &str) -> Option<ParsedKey<'_>> {
    let raw = header.trim();
    let raw = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();
    let raw = raw.strip_prefix("sk-").unwrap_or(raw);

    let mut parts = raw.splitn(2, '-');
    let key = parts.next().filter(|k| !k.is_empty())?;
    let channel_suffix = parts.next().filter(|s| !s.is_empty());
    Some(ParsedKey {
        key,
        channel_suffix,
    })
}

/// 解析换行或逗号分隔的 IP / CIDR 列表，非法条目被忽略
pub fn parse_allow_ips(raw: Option<&str>) -> Vec<IpNetwork> {
    raw.unwrap_or_default()
        .split(['\n', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| match IpNetwork::from_str(entry) {
            Ok(net) => Some(net),
            Err(_) => {
                lwarn!(
                    "system",
                    LogStage::Authentication,
                    LogComponent::Server,
                    "invalid_allow_ip",
                    &format!("忽略非法的 IP 白名单条目: {entry}")
                );
                None
            }
        })
        .collect()
}

/// 令牌认证器
pub struct TokenAuthenticator {
    db: Arc<DatabaseConnection>,
}

impl TokenAuthenticator {
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 校验 Authorization 头并返回令牌上下文
    pub async fn authenticate(&self, request_id: &str, authorization: &str) -> Result<TokenInfo> {
        let parsed = parse_authorization(authorization)
            .ok_or_else(|| ProxyError::unauthorized("no token provided"))?;

        let token = tokens::Entity::find()
            .filter(tokens::Column::Key.eq(parsed.key))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ProxyError::unauthorized("invalid token"))?;

        match TokenStatus::from_code(token.status) {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => return Err(ProxyError::unauthorized("token is disabled")),
            TokenStatus::Expired => return Err(ProxyError::unauthorized("token has expired")),
            TokenStatus::Exhausted => {
                return Err(ProxyError::unauthorized("token quota is exhausted"));
            }
        }
        if token.expired_time != -1 && token.expired_time < chrono::Utc::now().timestamp() {
            return Err(ProxyError::unauthorized("token has expired"));
        }
        if !token.unlimited_quota && token.remain_quota <= 0 {
            return Err(ProxyError::unauthorized("token quota is exhausted"));
        }

        let user = users::Entity::find_by_id(token.user_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ProxyError::unauthorized("token owner does not exist"))?;
        if user.status != 1 {
            return Err(ProxyError::forbidden("user is banned"));
        }

        let specific_channel_id = match parsed.channel_suffix {
            None => None,
            Some(_) if user.role < ROLE_ADMIN => {
                return Err(ProxyError::forbidden(
                    "only administrators may specify a channel",
                ));
            }
            Some(suffix) => Some(
                suffix
                    .parse::<i32>()
                    .map_err(|_| ProxyError::forbidden("invalid channel id"))?,
            ),
        };

        let model_limits = token.model_limits_enabled.then(|| {
            token
                .model_limits
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string)
                .collect()
        });

        ldebug!(
            request_id,
            LogStage::Authentication,
            LogComponent::Server,
            "token_authenticated",
            "Token authenticated",
            token_id = token.id,
            user_id = user.id,
            specific_channel = ?specific_channel_id
        );

        Ok(TokenInfo {
            token_id: token.id,
            token_name: token.name,
            user_id: user.id,
            user_group: user.group,
            token_group: token.group,
            role: user.role,
            unlimited_quota: token.unlimited_quota,
            model_limits,
            allow_ips: parse_allow_ips(token.allow_ips.as_deref()),
            specific_channel_id,
        })
    }
}
