//! # Relay Gateway 主程序

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_gateway::{
    ProxyError, Result,
    cache::CacheManager,
    config::{self, AppConfig},
    database,
    error::Context,
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
    server::{self, AppState},
};

/// 多租户 AI 中继网关
#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about)]
struct Cli {
    /// 配置文件路径，缺省读取 RELAY_GATEWAY_CONFIG 或 config/config.{RUST_ENV}.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_optimized_logging(cli.log_level.as_ref());

    if let Err(e) = run(cli).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_start_failed",
            &format!("服务启动失败: {e}")
        );
        return Err(e);
    }

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "服务正常关闭"
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load(cli.config)?;

    let db = database::init_database(&config.database)
        .await
        .context("数据库连接失败")?;
    database::ensure_schema(&db)
        .await
        .context("数据表初始化失败")?;
    let db = Arc::new(db);

    let cache = Arc::new(CacheManager::new(&config.cache).await?);
    let state = AppState::build(&config, db, cache).await?;
    let _refresh = state
        .registry
        .spawn_refresh_task(Duration::from_secs(config.relay.channel_refresh_seconds.max(1)));

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_starting",
        "服务启动"
    );
    server::serve(&config, state).await
}

fn load(path: Option<PathBuf>) -> Result<AppConfig> {
    let Some(path) = path else {
        return config::load_config();
    };
    let mut config = config::load_config_file(&path)?;
    config::apply_env_overrides(&mut config, std::env::vars())?;
    config.validate().map_err(ProxyError::config)?;
    Ok(config)
}
