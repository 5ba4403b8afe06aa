//! # 中继指标
//!
//! 按 (渠道, 模型, 分组) 统计请求总数、成功、失败与耗时；默认实现输出 tracing 事件。

use std::time::Duration;

use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 指标标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLabels {
    pub channel_id: i32,
    pub model: String,
    pub group: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    /// relay_request_total
    fn request_total(&self, labels: &RelayLabels);

    /// relay_request_success 与耗时
    fn request_success(&self, labels: &RelayLabels, elapsed: Duration);

    /// relay_request_failed 与耗时
    fn request_failed(&self, labels: &RelayLabels, status: u16, elapsed: Duration);
}

/// 以结构化日志输出指标
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn request_total(&self, labels: &RelayLabels) {
        ldebug!(
            "metrics",
            LogStage::Response,
            LogComponent::Metrics,
            "relay_request_total",
            "relay request",
            channel_id = labels.channel_id,
            model = %labels.model,
            group = %labels.group
        );
    }

    fn request_success(&self, labels: &RelayLabels, elapsed: Duration) {
        ldebug!(
            "metrics",
            LogStage::Response,
            LogComponent::Metrics,
            "relay_request_success",
            "relay request succeeded",
            channel_id = labels.channel_id,
            model = %labels.model,
            group = %labels.group,
            duration_ms = elapsed.as_millis() as u64
        );
    }

    fn request_failed(&self, labels: &RelayLabels, status: u16, elapsed: Duration) {
        lwarn!(
            "metrics",
            LogStage::ResponseFailure,
            LogComponent::Metrics,
            "relay_request_failed",
            "relay request failed",
            channel_id = labels.channel_id,
            model = %labels.model,
            group = %labels.group,
            status = status,
            duration_ms = elapsed.as_millis() as u64
        );
    }
}
