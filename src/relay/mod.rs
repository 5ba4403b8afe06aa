//! # 中继模块
//!
//! 请求上下文、校验、额度预扣与结算、异步退款以及完整的中继编排

pub mod context;
pub mod metrics;
pub mod orchestrator;
pub mod quota;
pub mod refund;
pub mod settlement;
pub mod validate;

pub use context::{RelayContext, RelayMode};
pub use metrics::{MetricsSink, RelayLabels, TracingMetrics};
pub use orchestrator::{InboundRequest, RelayComponents, RelayOutput, RelayService, RelayStream};
pub use quota::{DbQuotaStore, MemoryQuotaStore, QuotaStore, pre_consume};
pub use refund::{Refund, RefundPool};
pub use settlement::{ConsumeLogEntry, Settlement, Settler, ZeroUsageCause};
