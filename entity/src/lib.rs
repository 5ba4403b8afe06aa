//! # Entity 模块
//!
//! 包含中继网关使用的所有 Sea-ORM 实体定义

pub mod channels;
pub mod consume_logs;
pub mod model_limits;
pub mod tokens;
pub mod users;

pub use channels::Entity as Channels;
pub use consume_logs::Entity as ConsumeLogs;
pub use model_limits::Entity as ModelLimits;
pub use tokens::Entity as Tokens;
pub use users::Entity as Users;

#[cfg(test)]
mod tests;
