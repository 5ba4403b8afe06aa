//! # HTTP 服务
//!
//! Axum 路由：五个中继端点与健康检查。入站请求依次经过 IP 限流、令牌认证，
//! 再交给中继服务。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use sea_orm::DatabaseConnection;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::TokenAuthenticator;
use crate::cache::CacheManager;
use crate::channel::{ChannelHealth, ChannelRegistry, ChannelSelector, DbChannelSource, Distributor};
use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::providers::{AdapterRegistry, RelayMode};
use crate::rate_limit::{
    DbLimitSource, ModelRpmLimiter, RateLimitTierKind, SlidingWindowLimiter, TieredRateLimiter,
};
use crate::relay::{
    DbQuotaStore, InboundRequest, QuotaStore, RefundPool, RelayComponents, RelayOutput,
    RelayService, Settler, TracingMetrics,
};
use crate::{ldebug, linfo, lwarn};

/// 请求 ID 头
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 中继入口适用的限流层级
const RELAY_TIERS: [RateLimitTierKind; 1] = [RateLimitTierKind::GlobalApi];

/// 服务共享状态
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub authenticator: Arc<TokenAuthenticator>,
    pub tiers: Arc<TieredRateLimiter>,
    pub registry: Arc<ChannelRegistry>,
}

impl AppState {
    /// 按配置组装全部组件
    pub async fn build(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        cache: Arc<CacheManager>,
    ) -> Result<Self> {
        let registry = Arc::new(
            ChannelRegistry::load(Arc::new(DbChannelSource::new(db.clone()))).await?,
        );
        let selector = Arc::new(ChannelSelector::new(registry.clone()));
        let pricing = Arc::new(config.pricing.clone());
        let distributor = Arc::new(Distributor::new(selector, pricing.clone()));
        let health = Arc::new(ChannelHealth::new(
            cache.clone(),
            registry.clone(),
            config.relay.channel_failure_threshold,
        ));

        let window = Arc::new(SlidingWindowLimiter::new(
            cache,
            Duration::from_secs(config.rate_limit.key_expiration_seconds),
        ));
        let rpm_limiter = Arc::new(ModelRpmLimiter::new(
            window.clone(),
            Arc::new(DbLimitSource::new(db.clone())),
            &config.rate_limit,
        ));
        let tiers = Arc::new(TieredRateLimiter::new(window, config.rate_limit.clone()));

        let quota: Arc<dyn QuotaStore> = Arc::new(DbQuotaStore::new(db.clone()));
        let refunds = RefundPool::new(quota.clone(), config.relay.refund_workers);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::config_with_source("构建 HTTP 客户端失败", e))?;

        let relay = RelayService::new(RelayComponents {
            client,
            adapters: Arc::new(AdapterRegistry::new(
                config.claude.clone(),
                config.gemini.clone(),
            )),
            distributor,
            health,
            rpm_limiter,
            quota: quota.clone(),
            settler: Settler::new(quota, refunds),
            pricing,
            metrics: Arc::new(TracingMetrics),
            config: config.relay.clone(),
        });

        Ok(Self {
            relay: Arc::new(relay),
            authenticator: Arc::new(TokenAuthenticator::new(db)),
            tiers,
            registry,
        })
    }
}

/// 构造路由
pub fn router(state: AppState) -> Router {
    let mut relay_routes = Router::new();
    for mode in [
        RelayMode::ChatCompletions,
        RelayMode::Completions,
        RelayMode::Embeddings,
        RelayMode::Moderations,
        RelayMode::Rerank,
    ] {
        relay_routes = relay_routes.route(mode.path(), post(relay_handler));
    }

    Router::new()
        .merge(relay_routes)
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// 监听并服务，收到退出信号后等待退款任务完成
pub async fn serve(config: &AppConfig, state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::config_with_source(format!("无法监听地址: {addr}"), e))?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Server,
        "server_listening",
        &format!("中继服务监听于 {addr}")
    );

    let refunds = state.relay.settler().refunds().clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    refunds.drain().await;
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Server,
        "server_stopped",
        "中继服务已停止"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        lwarn!(
            "system",
            LogStage::Shutdown,
            LogComponent::Server,
            "signal_failed",
            &format!("监听退出信号失败: {e}")
        );
        std::future::pending::<()>().await;
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn relay_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let client_ip = client_ip(&headers, peer);

    let result = handle_relay(&state, &request_id, client_ip, &uri, &headers, &body).await;
    let mut response = match result {
        Ok(RelayOutput::Json(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(RelayOutput::Stream(stream)) => sse_response(Body::from_stream(stream)),
        Err(err) => {
            let (status, code) = err.to_http_response_parts();
            lwarn!(
                request_id,
                LogStage::Error,
                LogComponent::Server,
                "relay_rejected",
                "Relay request failed",
                status = status.as_u16(),
                code = code,
                error = %err
            );
            err.into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn handle_relay(
    state: &AppState,
    request_id: &str,
    client_ip: IpAddr,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<RelayOutput> {
    let mode = RelayMode::from_path(uri.path())
        .ok_or_else(|| ProxyError::validation(format!("unsupported path {}", uri.path())))?;

    state
        .tiers
        .check_all(request_id, &RELAY_TIERS, &client_ip.to_string())
        .await?;

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let token = state
        .authenticator
        .authenticate(request_id, authorization)
        .await?;

    let body: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::validation(format!("invalid request body: {e}")))?;

    ldebug!(
        request_id,
        LogStage::RequestStart,
        LogComponent::Server,
        "relay_received",
        "Relay request received",
        mode = mode.as_str(),
        client_ip = %client_ip,
        user_id = token.user_id
    );

    state
        .relay
        .relay(InboundRequest {
            request_id: request_id.to_string(),
            mode,
            token,
            client_ip: Some(client_ip),
            body,
        })
        .await
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// 取客户端请求 ID，缺失时生成
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string)
}

/// 优先使用 `X-Forwarded-For` 的第一个地址
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:5000".parse().unwrap()
    }

    #[test]
    fn forwarded_for_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));
        assert_eq!(client_ip(&headers, peer()), "1.2.3.4".parse::<IpAddr>().unwrap());

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_ip(&headers, peer()), peer().ip());
    }

    #[test]
    fn request_id_is_reused_or_generated() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id(&headers).len(), 36);
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(request_id(&headers), "abc");
    }

    #[test]
    fn stream_responses_disable_buffering() {
        let response = sse_response(Body::empty());
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    }
}
