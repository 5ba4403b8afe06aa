//! # 渠道模块
//!
//! 渠道模型、注册表缓存、选择器、健康追踪与请求分发

pub mod distributor;
pub mod health;
pub mod registry;
pub mod selector;
pub mod types;

pub use distributor::{Distribution, Distributor};
pub use health::ChannelHealth;
pub use registry::{
    Candidates, ChannelRegistry, ChannelSource, DbChannelSource, MemoryChannelSource,
};
pub use selector::ChannelSelector;
pub use types::{Channel, ChannelSettings, ChannelStatus, VendorType};
