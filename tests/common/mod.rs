//! 集成测试公共设施：内存 SQLite + 内存缓存 + 本地监听的网关

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use entity::{channels, model_limits, tokens, users};
use relay_gateway::cache::CacheManager;
use relay_gateway::channel::VendorType;
use relay_gateway::config::{AppConfig, DatabaseConfig};
use relay_gateway::database::{ensure_schema, init_database};
use relay_gateway::server::{AppState, router};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const TOKEN_KEY: &str = "integrationkey";
pub const USER_QUOTA: i64 = 10_000;
pub const TOKEN_QUOTA: i64 = 10_000;

pub struct Gateway {
    pub base_url: String,
    pub db: Arc<DatabaseConnection>,
    pub state: AppState,
    pub http: reqwest::Client,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .header("authorization", format!("Bearer sk-{TOKEN_KEY}"))
    }
}

/// 测试渠道行
pub struct ChannelSpec {
    pub id: i32,
    pub vendor: VendorType,
    pub base_url: String,
    pub models: &'static str,
    pub priority: i64,
}

impl ChannelSpec {
    pub fn new(id: i32, vendor: VendorType, base_url: &str, models: &'static str) -> Self {
        Self {
            id,
            vendor,
            base_url: base_url.to_string(),
            models,
            priority: 0,
        }
    }

    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// 所有模型倍率为 1 的配置
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pricing.default_model_ratio = Some(1.0);
    config
}

pub async fn gateway(config: AppConfig, channel_specs: Vec<ChannelSpec>) -> Gateway {
    let db = init_database(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap();
    ensure_schema(&db).await.unwrap();
    seed_account(&db).await;
    for spec in channel_specs {
        seed_channel(&db, spec).await;
    }

    let db = Arc::new(db);
    let state = AppState::build(&config, db.clone(), Arc::new(CacheManager::memory_only()))
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Gateway {
        base_url: format!("http://{addr}"),
        db,
        state,
        http: reqwest::Client::new(),
    }
}

async fn seed_account(db: &DatabaseConnection) {
    let now = chrono::Utc::now().naive_utc();
    users::ActiveModel {
        id: Set(1),
        username: Set("alice".to_string()),
        group: Set("default".to_string()),
        quota: Set(USER_QUOTA),
        used_quota: Set(0),
        request_count: Set(0),
        status: Set(1),
        role: Set(1),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    tokens::ActiveModel {
        id: Set(1),
        user_id: Set(1),
        key: Set(TOKEN_KEY.to_string()),
        name: Set("default".to_string()),
        status: Set(1),
        group: Set(String::new()),
        remain_quota: Set(TOKEN_QUOTA),
        unlimited_quota: Set(false),
        used_quota: Set(0),
        model_limits_enabled: Set(false),
        model_limits: Set(String::new()),
        allow_ips: Set(None),
        expired_time: Set(-1),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();
}

async fn seed_channel(db: &DatabaseConnection, spec: ChannelSpec) {
    channels::ActiveModel {
        id: Set(spec.id),
        name: Set(format!("channel-{}", spec.id)),
        channel_type: Set(spec.vendor.code()),
        base_url: Set(spec.base_url),
        key: Set(format!("upstream-key-{}", spec.id)),
        models: Set(spec.models.to_string()),
        groups: Set("default".to_string()),
        model_mapping: Set(None),
        status_code_mapping: Set(None),
        settings: Set(None),
        status: Set(1),
        weight: Set(1),
        priority: Set(spec.priority),
        tag: Set(None),
        used_quota: Set(0),
        deleted: Set(false),
        created_at: Set(chrono::Utc::now().naive_utc()),
    }
    .insert(db)
    .await
    .unwrap();
}

/// 只覆盖中继超时、不做 RPM 限制的模型配置
pub async fn seed_relay_timeout(db: &DatabaseConnection, model: &str, timeout_seconds: i64) {
    model_limits::ActiveModel {
        user_id: Set(1),
        token_name: Set("default".to_string()),
        model_name: Set(model.to_string()),
        rpm_limit: Set(0),
        rpm_limit_enabled: Set(false),
        wait_duration_seconds: Set(0),
        relay_timeout_seconds: Set(timeout_seconds),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap();
}

/// 按间隔逐块下发 SSE 事件、之后保持连接不结束的上游
///
/// wiremock 只能整体延迟响应，流中途停顿需要直接写 chunked 报文。
pub async fn stalling_sse_upstream(events: Vec<String>, interval: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let events = events.clone();
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                for event in events {
                    let frame = format!("{:x}\r\n{event}\r\n", event.len());
                    if socket.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(interval).await;
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    format!("http://{addr}")
}

async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= header_end + 4 + content_length {
            return;
        }
    }
}

pub async fn seed_model_limit(db: &DatabaseConnection, model: &str, rpm: i32, wait_seconds: i64) {
    model_limits::ActiveModel {
        user_id: Set(1),
        token_name: Set("default".to_string()),
        model_name: Set(model.to_string()),
        rpm_limit: Set(rpm),
        rpm_limit_enabled: Set(true),
        wait_duration_seconds: Set(wait_seconds),
        relay_timeout_seconds: Set(0),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap();
}
