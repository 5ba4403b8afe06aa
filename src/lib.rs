//! # Relay Gateway
//!
//! 多租户 AI 中继网关核心库：渠道选择、限流、供应商协议转换与额度结算

pub mod auth;
pub mod cache;
pub mod channel;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pricing;
pub mod providers;
pub mod rate_limit;
pub mod relay;
pub mod server;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ProxyError, Result};
