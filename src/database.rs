//! # 数据库模块
//!
//! 数据库连接和表结构初始化

use std::path::Path;

use entity::{Channels, ConsumeLogs, ModelLimits, Tokens, Users};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, Schema,
};

use crate::config::DatabaseConfig;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// 初始化数据库连接
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let database_url = config.url.as_str();
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "connect",
        &format!(
            "正在连接数据库: {}",
            database_url.chars().take(50).collect::<String>()
        )
    );

    // 对于SQLite数据库，确保数据库文件的目录和文件存在
    if database_url.starts_with("sqlite:") && !database_url.contains(":memory:") {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        ensure_sqlite_file(Path::new(db_path))?;
    }

    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .max_connections(config.max_connections)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "connected",
        "数据库连接成功"
    );
    Ok(db)
}

fn ensure_sqlite_file(db_file_path: &Path) -> Result<(), DbErr> {
    if let Some(parent_dir) = db_file_path.parent()
        && !parent_dir.as_os_str().is_empty()
        && !parent_dir.exists()
    {
        ldebug!(
            "system",
            LogStage::Startup,
            LogComponent::Database,
            "create_dir",
            &format!("创建数据库目录: {}", parent_dir.display())
        );
        std::fs::create_dir_all(parent_dir).map_err(|e| {
            DbErr::Custom(format!("无法创建数据库目录 {}: {e}", parent_dir.display()))
        })?;
    }

    if !db_file_path.exists() {
        std::fs::File::create(db_file_path).map_err(|e| {
            DbErr::Custom(format!("无法创建数据库文件 {}: {e}", db_file_path.display()))
        })?;
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Database,
            "create_file",
            &format!("数据库文件创建成功: {}", db_file_path.display())
        );
    }
    Ok(())
}

/// 按实体定义建表（已存在则跳过）
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, Users).await?;
    create_table(db, Tokens).await?;
    create_table(db, Channels).await?;
    create_table(db, ConsumeLogs).await?;
    create_table(db, ModelLimits).await?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "ensure_schema",
        "数据表结构检查完成"
    );
    Ok(())
}

async fn create_table<E>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::PaginatorTrait;

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        };
        let db = init_database(&config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();

        assert_eq!(Users::find().count(&db).await.unwrap(), 0);
        assert_eq!(Channels::find().count(&db).await.unwrap(), 0);
    }
}
