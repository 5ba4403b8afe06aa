//! # 渠道领域模型

use std::collections::HashMap;

use entity::channels;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// 渠道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub const fn code(self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
        }
    }

    /// 未知状态码按手动禁用处理
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Enabled,
            3 => Self::AutoDisabled,
            _ => Self::ManuallyDisabled,
        }
    }
}

/// 供应商类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VendorType {
    /// OpenAI 兼容协议，请求透传
    OpenAi,
    /// Claude 消息协议
    Claude,
    /// Gemini generateContent 协议
    Gemini,
    /// 火山引擎方舟（OpenAI 兼容，路径不同）
    VolcEngine,
}

impl VendorType {
    pub const fn code(self) -> i32 {
        match self {
            Self::OpenAi => 1,
            Self::Claude => 14,
            Self::Gemini => 24,
            Self::VolcEngine => 45,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::OpenAi),
            14 => Some(Self::Claude),
            24 => Some(Self::Gemini),
            45 => Some(Self::VolcEngine),
            _ => None,
        }
    }

    /// 渠道未配置 base_url 时使用
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Claude => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::VolcEngine => "https://ark.cn-beijing.volces.com",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::VolcEngine => "volcengine",
        }
    }
}

/// 供应商专属设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub api_version: Option<String>,
    pub region: Option<String>,
    pub plugin: Option<String>,
}

/// 上游渠道
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i32,
    pub name: String,
    pub vendor: VendorType,
    pub base_url: String,
    pub key: String,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    pub status_code_mapping: HashMap<u16, u16>,
    pub settings: ChannelSettings,
    pub status: ChannelStatus,
    pub weight: u32,
    pub priority: i64,
    pub tag: Option<String>,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// 是否服务该模型（`*` 表示全部模型）
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model || m == "*")
    }

    pub fn serves_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// 有效权重，最小为 1
    pub fn effective_weight(&self) -> u64 {
        u64::from(self.weight.max(1))
    }

    /// 请求基础地址（去掉末尾斜杠）
    pub fn base_url(&self) -> &str {
        let base = if self.base_url.is_empty() {
            self.vendor.default_base_url()
        } else {
            self.base_url.as_str()
        };
        base.trim_end_matches('/')
    }

    /// 模型名映射后的上游模型
    pub fn upstream_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// 按供应商类型生效的 API 版本
    pub fn api_version(&self) -> Option<String> {
        match self.vendor {
            VendorType::Gemini | VendorType::OpenAi => self.settings.api_version.clone(),
            VendorType::Claude | VendorType::VolcEngine => None,
        }
    }

    /// 上游状态码映射后的对外状态码
    pub fn map_status(&self, status: u16) -> u16 {
        self.status_code_mapping
            .get(&status)
            .copied()
            .unwrap_or(status)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_json_field<T>(channel_id: i32, field: &str, raw: Option<&str>) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match raw.map(str::trim).filter(|s| !s.is_empty() && *s != "{}") {
        None => Ok(T::default()),
        Some(text) => serde_json::from_str(text).map_err(|e| {
            ProxyError::config_with_source(format!("渠道 {channel_id} 的 {field} 不是合法 JSON"), e)
        }),
    }
}

impl TryFrom<channels::Model> for Channel {
    type Error = ProxyError;

    fn try_from(model: channels::Model) -> Result<Self> {
        let vendor = VendorType::from_code(model.channel_type).ok_or_else(|| {
            ProxyError::config(format!(
                "渠道 {} 的类型 {} 不受支持",
                model.id, model.channel_type
            ))
        })?;

        if !model.base_url.is_empty() {
            url::Url::parse(&model.base_url).map_err(|e| {
                ProxyError::config(format!(
                    "渠道 {} 的 base_url 无效: {} ({e})",
                    model.id, model.base_url
                ))
            })?;
        }

        let status_code_mapping: HashMap<String, String> = parse_json_field(
            model.id,
            "status_code_mapping",
            model.status_code_mapping.as_deref(),
        )?;
        let status_code_mapping = status_code_mapping
            .into_iter()
            .filter_map(|(from, to)| Some((from.parse().ok()?, to.parse().ok()?)))
            .collect();

        Ok(Self {
            id: model.id,
            name: model.name,
            vendor,
            base_url: model.base_url,
            key: model.key,
            models: split_list(&model.models),
            groups: split_list(&model.groups),
            model_mapping: parse_json_field(
                model.id,
                "model_mapping",
                model.model_mapping.as_deref(),
            )?,
            status_code_mapping,
            settings: parse_json_field(model.id, "settings", model.settings.as_deref())?,
            status: ChannelStatus::from_code(model.status),
            weight: u32::try_from(model.weight).unwrap_or(0),
            priority: model.priority,
            tag: model.tag,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> channels::Model {
        channels::Model {
            id: 7,
            name: "gemini-main".to_string(),
            channel_type: 24,
            base_url: "https://proxy.example.com/".to_string(),
            key: "secret".to_string(),
            models: "gemini-1.5-pro, gemini-1.5-flash".to_string(),
            groups: "default,vip".to_string(),
            model_mapping: Some(r#"{"gemini-pro":"gemini-1.5-pro"}"#.to_string()),
            status_code_mapping: Some(r#"{"429":"503"}"#.to_string()),
            settings: Some(r#"{"api_version":"v1"}"#.to_string()),
            status: 1,
            weight: 0,
            priority: 5,
            tag: None,
            used_quota: 0,
            deleted: false,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn converts_database_row() {
        let channel = Channel::try_from(row()).unwrap();
        assert_eq!(channel.vendor, VendorType::Gemini);
        assert_eq!(channel.models, vec!["gemini-1.5-pro", "gemini-1.5-flash"]);
        assert!(channel.serves_group("vip"));
        assert_eq!(channel.upstream_model("gemini-pro"), "gemini-1.5-pro");
        assert_eq!(channel.upstream_model("gemini-1.5-flash"), "gemini-1.5-flash");
        assert_eq!(channel.map_status(429), 503);
        assert_eq!(channel.map_status(500), 500);
        assert_eq!(channel.settings.api_version.as_deref(), Some("v1"));
        assert_eq!(channel.base_url(), "https://proxy.example.com");
        assert_eq!(channel.effective_weight(), 1);
    }

    #[test]
    fn rejects_unknown_vendor_and_bad_json() {
        let mut bad_type = row();
        bad_type.channel_type = 999;
        assert!(Channel::try_from(bad_type).is_err());

        let mut bad_json = row();
        bad_json.model_mapping = Some("{not json".to_string());
        assert!(Channel::try_from(bad_json).is_err());

        let mut bad_url = row();
        bad_url.base_url = "proxy.example.com".to_string();
        assert!(Channel::try_from(bad_url).is_err());
    }

    #[test]
    fn wildcard_model_and_default_base_url() {
        let channel = fixtures::channel(1, VendorType::Claude, &["*"], &["default"]);
        assert!(channel.supports_model("anything"));
        assert_eq!(channel.base_url(), "https://api.anthropic.com");
    }
}
