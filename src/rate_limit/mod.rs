//! # 限流模块
//!
//! 滑动窗口准入、按 IP 的分层限流以及可等待的模型 RPM 限流

pub mod model_rpm;
pub mod tiers;
pub mod window;

pub use model_rpm::{
    DbLimitSource, LOCK_TIMEOUT_MESSAGE, LimitSource, ModelLimit, ModelRpmLimiter, RpmSubject,
};
pub use tiers::{RateLimitTierKind, TieredRateLimiter};
pub use window::SlidingWindowLimiter;
