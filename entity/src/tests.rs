//! # 实体定义测试

use crate::{channels, consume_logs, model_limits, tokens, users};
use sea_orm::{EntityName, Set};

#[test]
fn test_table_names() {
    assert_eq!(users::Entity.table_name(), "users");
    assert_eq!(tokens::Entity.table_name(), "tokens");
    assert_eq!(channels::Entity.table_name(), "channels");
    assert_eq!(consume_logs::Entity.table_name(), "consume_logs");
    assert_eq!(model_limits::Entity.table_name(), "model_limits");
}

#[tokio::test]
async fn test_token_active_model() {
    let token = tokens::ActiveModel {
        user_id: Set(1),
        key: Set("sk-test".to_string()),
        name: Set("default".to_string()),
        unlimited_quota: Set(true),
        ..Default::default()
    };

    assert_eq!(token.key.as_ref(), "sk-test");
    assert_eq!(token.unlimited_quota.as_ref(), &true);
}

#[tokio::test]
async fn test_channel_active_model() {
    let channel = channels::ActiveModel {
        name: Set("claude-main".to_string()),
        channel_type: Set(14),
        models: Set("claude-3-opus,claude-3-thinking".to_string()),
        weight: Set(1),
        ..Default::default()
    };

    assert_eq!(channel.channel_type.as_ref(), &14);
    assert!(channel.models.as_ref().contains("claude-3-thinking"));
}
