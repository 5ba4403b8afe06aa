//! # 中继编排
//!
//! 单个请求的完整流程：
//!
//! 1. 解析与校验请求体
//! 2. 模型 RPM 准入（可等待）
//! 3. 分发渠道、定价、估算并预扣额度
//! 4. 调用上游，可重试错误换渠道重试
//! 5. 转换响应；流式响应由后台任务泵送
//! 6. 结算：每个完成预扣的请求恰好结算一次

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::Decoder;

use super::context::RelayContext;
use super::metrics::{MetricsSink, RelayLabels};
use super::quota::{QuotaStore, pre_consume};
use super::settlement::{Settler, ZeroUsageCause};
use super::validate::{parse_request, prompt_tokens, validate_request};
use crate::auth::TokenInfo;
use crate::channel::{Channel, ChannelHealth, Distributor};
use crate::config::RelayConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::pricing::PricingConfig;
use crate::providers::sse::{SseDecoder, SseEvent, StreamFrame, done_frame};
use crate::providers::{
    AdapterRegistry, ChatChunk, ConvertedResponse, ProviderAdapter, ProviderError, RelayMode,
    RelayRequest, StreamConverter,
};
use crate::rate_limit::{ModelRpmLimiter, RpmSubject};
use crate::{ldebug, lerror, linfo, lwarn};

/// 下游流式通道容量
const STREAM_BUFFER: usize = 64;

/// 下游流式响应体
pub type RelayStream = ReceiverStream<std::result::Result<Bytes, Infallible>>;

/// 中继输出
#[derive(Debug)]
pub enum RelayOutput {
    Json(Value),
    Stream(RelayStream),
}

/// 一次入站中继请求
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: String,
    pub mode: RelayMode,
    pub token: TokenInfo,
    pub client_ip: Option<IpAddr>,
    pub body: Value,
}

/// 中继服务依赖
pub struct RelayComponents {
    pub client: reqwest::Client,
    pub adapters: Arc<AdapterRegistry>,
    pub distributor: Arc<Distributor>,
    pub health: Arc<ChannelHealth>,
    pub rpm_limiter: Arc<ModelRpmLimiter>,
    pub quota: Arc<dyn QuotaStore>,
    pub settler: Settler,
    pub pricing: Arc<PricingConfig>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: RelayConfig,
}

/// 上游调用成功后的结果
enum Upstream {
    Buffered(ConvertedResponse),
    Streaming {
        response: reqwest::Response,
        converter: Box<dyn StreamConverter>,
    },
}

/// 中继服务
pub struct RelayService {
    client: reqwest::Client,
    adapters: Arc<AdapterRegistry>,
    distributor: Arc<Distributor>,
    health: Arc<ChannelHealth>,
    rpm_limiter: Arc<ModelRpmLimiter>,
    quota: Arc<dyn QuotaStore>,
    settler: Settler,
    pricing: Arc<PricingConfig>,
    metrics: Arc<dyn MetricsSink>,
    config: RelayConfig,
}

impl RelayService {
    pub fn new(components: RelayComponents) -> Self {
        let RelayComponents {
            client,
            adapters,
            distributor,
            health,
            rpm_limiter,
            quota,
            settler,
            pricing,
            metrics,
            config,
        } = components;
        Self {
            client,
            adapters,
            distributor,
            health,
            rpm_limiter,
            quota,
            settler,
            pricing,
            metrics,
            config,
        }
    }

    pub fn settler(&self) -> &Settler {
        &self.settler
    }

    /// 处理一个中继请求
    pub async fn relay(&self, inbound: InboundRequest) -> Result<RelayOutput> {
        let InboundRequest {
            request_id,
            mode,
            token,
            client_ip,
            body,
        } = inbound;
        let rid = request_id.as_str();

        let request = parse_request(mode, body)?;
        validate_request(&request, self.config.max_tokens_ceiling)?;
        if request.is_stream() && !self.config.stream_enabled {
            return Err(ProxyError::validation("stream is not enabled"));
        }

        let model = request.model().to_string();
        let limit = self
            .rpm_limiter
            .acquire(
                rid,
                &RpmSubject {
                    user_id: token.user_id,
                    token_name: &token.token_name,
                    model: &model,
                },
            )
            .await?;

        let distribution = self
            .distributor
            .distribute(rid, &token, client_ip, &model)
            .await?;
        let price = self.pricing.price_for(&model, &distribution.group)?;

        let mut ctx = RelayContext::new(rid, mode, token, distribution, price);
        ctx.is_stream = request.is_stream();
        ctx.include_usage = request.include_usage();
        ctx.prompt_tokens = prompt_tokens(&request);
        ctx.relay_timeout = limit
            .as_ref()
            .and_then(|l| l.relay_timeout())
            .or_else(|| {
                (self.config.relay_timeout_seconds > 0)
                    .then(|| Duration::from_secs(self.config.relay_timeout_seconds))
            });

        let max_tokens = request.max_tokens().and_then(|m| u32::try_from(m).ok());
        let estimated = ctx.price.estimate_quota(
            rid,
            ctx.prompt_tokens,
            max_tokens,
            self.config.pre_consumed_quota,
        );
        ctx.pre_consumed_quota = pre_consume(
            self.quota.as_ref(),
            rid,
            &ctx.token,
            estimated,
            self.config.trusted_quota_multiplier,
        )
        .await?;

        linfo!(
            rid,
            LogStage::RequestStart,
            LogComponent::Relay,
            "relay_start",
            "Relay request accepted",
            mode = ctx.mode.as_str(),
            model = %ctx.original_model,
            group = %ctx.group,
            channel_id = ctx.channel.id,
            stream = ctx.is_stream,
            prompt_tokens = ctx.prompt_tokens,
            pre_consumed = ctx.pre_consumed_quota
        );
        self.metrics.request_total(&labels(&ctx));

        let mut retries_left = self.config.retry_times;
        loop {
            let attempt = self.attempt(&ctx, &request).await;
            let err = match attempt {
                Ok(Upstream::Buffered(converted)) => {
                    self.finish_buffered(&ctx, &converted).await;
                    return Ok(RelayOutput::Json(converted.body));
                }
                Ok(Upstream::Streaming {
                    response,
                    converter,
                }) => return Ok(RelayOutput::Stream(self.spawn_stream(ctx, response, converter))),
                Err(err) => err,
            };

            if err.is_channel_failure() {
                self.record_failure(&ctx);
            }
            lwarn!(
                rid,
                LogStage::ResponseFailure,
                LogComponent::Relay,
                "attempt_failed",
                "Upstream attempt failed",
                channel_id = ctx.channel.id,
                retryable = err.is_retryable(),
                retries_left = retries_left,
                error = %err
            );

            if let Some(channel) = self.retry_channel(&ctx, &err, retries_left).await {
                retries_left -= 1;
                ctx.switch_channel(channel);
                continue;
            }

            self.metrics.request_failed(
                &labels(&ctx),
                err.to_http_response_parts().0.as_u16(),
                ctx.elapsed(),
            );
            let cause = if matches!(err, ProxyError::Timeout { .. }) {
                ZeroUsageCause::UpstreamTimeout
            } else {
                ZeroUsageCause::UpstreamError
            };
            if let Err(e) = self
                .settler
                .settle_failure(&ctx, cause, &err.to_string())
                .await
            {
                lerror!(
                    rid,
                    LogStage::Billing,
                    LogComponent::Billing,
                    "settle_failure_failed",
                    "Failed to record failed request",
                    error = %e
                );
            }
            return Err(err);
        }
    }

    /// 可重试、未指定渠道、仍有预算时挑选下一个渠道
    async fn retry_channel(
        &self,
        ctx: &RelayContext,
        err: &ProxyError,
        retries_left: u32,
    ) -> Option<Arc<Channel>> {
        if ctx.pinned || retries_left == 0 || !err.is_retryable() {
            return None;
        }
        if ctx.remaining_timeout().is_some_and(|left| left.is_zero()) {
            return None;
        }
        match self
            .distributor
            .selector()
            .select(
                &ctx.request_id,
                &ctx.group,
                &ctx.original_model,
                &ctx.tried_channels,
            )
            .await
        {
            Ok(channel) => {
                linfo!(
                    ctx.request_id,
                    LogStage::Scheduling,
                    LogComponent::Relay,
                    "retry_channel",
                    "Retrying on another channel",
                    from_channel = ctx.channel.id,
                    to_channel = channel.id,
                    retries_left = retries_left - 1
                );
                Some(channel)
            }
            Err(e) => {
                ldebug!(
                    ctx.request_id,
                    LogStage::Scheduling,
                    LogComponent::Relay,
                    "retry_unavailable",
                    "No channel left for retry",
                    error = %e
                );
                None
            }
        }
    }

    /// 在当前渠道上执行一次上游调用
    async fn attempt(&self, ctx: &RelayContext, request: &RelayRequest) -> Result<Upstream> {
        let rid = ctx.request_id.as_str();
        let adapter: Arc<dyn ProviderAdapter> = self.adapters.get(ctx.channel.vendor)?;
        if !adapter.supports_mode(ctx.mode) {
            return Err(ProxyError::validation(format!(
                "{} channel does not support {}",
                ctx.channel.vendor.as_str(),
                ctx.mode.as_str()
            )));
        }

        let target = ctx.upstream_target();
        let body = adapter.convert_request(rid, request, &target)?;
        ldebug!(
            rid,
            LogStage::UpstreamRequest,
            LogComponent::Relay,
            "upstream_request",
            "Sending upstream request",
            channel_id = ctx.channel.id,
            vendor = ctx.channel.vendor.as_str(),
            upstream_model = %target.upstream_model
        );

        let deadline = ctx.remaining_timeout().map(|left| Instant::now() + left);
        let response = with_deadline(
            deadline,
            ctx.relay_timeout,
            adapter.do_request(&self.client, &target, &body),
        )
        .await?
        .map_err(|e| remap_status(ProxyError::from(e), &ctx.channel))?;

        if ctx.is_stream {
            let converter = adapter.stream_converter(rid, &target);
            return Ok(Upstream::Streaming {
                response,
                converter,
            });
        }

        let bytes = with_deadline(deadline, ctx.relay_timeout, response.bytes())
            .await?
            .map_err(ProxyError::from)?;
        let converted = adapter
            .convert_response(rid, &bytes, &target)
            .map_err(|e| remap_status(ProxyError::from(e), &ctx.channel))?;
        Ok(Upstream::Buffered(converted))
    }

    async fn finish_buffered(&self, ctx: &RelayContext, converted: &ConvertedResponse) {
        if let Err(e) = self.settler.settle(ctx, converted.usage, None).await {
            lerror!(
                ctx.request_id,
                LogStage::Billing,
                LogComponent::Billing,
                "settle_failed",
                "Failed to settle request",
                error = %e
            );
        }
        if let Err(e) = self.health.record_success(ctx.channel.id).await {
            lwarn!(
                ctx.request_id,
                LogStage::Cache,
                LogComponent::Relay,
                "record_success_failed",
                "Failed to reset channel failure counter",
                error = %e
            );
        }
        self.metrics.request_success(&labels(ctx), ctx.elapsed());
    }

    fn record_failure(&self, ctx: &RelayContext) {
        let health = self.health.clone();
        let request_id = ctx.request_id.clone();
        let channel_id = ctx.channel.id;
        tokio::spawn(async move {
            if let Err(e) = health.record_failure(&request_id, channel_id).await {
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::Relay,
                    "record_failure_failed",
                    "Failed to record channel failure",
                    channel_id = channel_id,
                    error = %e
                );
            }
        });
    }

    fn spawn_stream(
        &self,
        ctx: RelayContext,
        response: reqwest::Response,
        converter: Box<dyn StreamConverter>,
    ) -> RelayStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let pump = StreamPump {
            ctx,
            converter,
            tx,
            settler: self.settler.clone(),
            health: self.health.clone(),
            metrics: self.metrics.clone(),
        };
        tokio::spawn(pump.run(response));
        ReceiverStream::new(rx)
    }
}

fn labels(ctx: &RelayContext) -> RelayLabels {
    RelayLabels {
        channel_id: ctx.channel.id,
        model: ctx.original_model.clone(),
        group: ctx.group.clone(),
    }
}

/// 在截止时间内等待 future，超时转换为中继超时错误
async fn with_deadline<F: std::future::Future>(
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, future).await.map_err(|_| {
            let secs = timeout.map_or(0, |t| t.as_secs());
            ProxyError::timeout(format!("upstream did not respond within {secs}s"), secs)
        }),
        None => Ok(future.await),
    }
}

/// 按渠道配置改写对外状态码，重试判定沿用上游原始状态
fn remap_status(err: ProxyError, channel: &Channel) -> ProxyError {
    match err {
        ProxyError::Upstream {
            message,
            status,
            retryable,
            source,
        } => ProxyError::Upstream {
            message,
            status: channel.map_status(status),
            retryable,
            source,
        },
        other => other,
    }
}

/// 上游流转发任务
struct StreamPump {
    ctx: RelayContext,
    converter: Box<dyn StreamConverter>,
    tx: mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    settler: Settler,
    health: Arc<ChannelHealth>,
    metrics: Arc<dyn MetricsSink>,
}

impl StreamPump {
    async fn run(mut self, response: reqwest::Response) {
        let cause = self.pump(response).await;
        let summary = self.converter.finish();

        if cause != Some(ZeroUsageCause::ClientDisconnected) {
            let mut tail = Vec::with_capacity(2);
            if self.ctx.include_usage {
                let chunk =
                    ChatChunk::usage_only(&summary.id, summary.created, &summary.model, summary.usage);
                match StreamFrame::chunk(chunk).to_bytes() {
                    Ok(bytes) => tail.push(bytes),
                    Err(e) => lwarn!(
                        self.ctx.request_id,
                        LogStage::Response,
                        LogComponent::Relay,
                        "usage_chunk_failed",
                        "Failed to encode usage chunk",
                        error = %e
                    ),
                }
            }
            tail.push(done_frame());
            for bytes in tail {
                if self.tx.send(Ok(bytes)).await.is_err() {
                    break;
                }
            }
        }

        let labels = labels(&self.ctx);
        match cause {
            Some(ZeroUsageCause::UpstreamError | ZeroUsageCause::UpstreamTimeout) => {
                if let Err(e) = self
                    .health
                    .record_failure(&self.ctx.request_id, self.ctx.channel.id)
                    .await
                {
                    lwarn!(
                        self.ctx.request_id,
                        LogStage::Cache,
                        LogComponent::Relay,
                        "record_failure_failed",
                        "Failed to record channel failure",
                        error = %e
                    );
                }
                self.metrics.request_failed(&labels, 502, self.ctx.elapsed());
            }
            _ => {
                if let Err(e) = self.health.record_success(self.ctx.channel.id).await {
                    lwarn!(
                        self.ctx.request_id,
                        LogStage::Cache,
                        LogComponent::Relay,
                        "record_success_failed",
                        "Failed to reset channel failure counter",
                        error = %e
                    );
                }
                self.metrics.request_success(&labels, self.ctx.elapsed());
            }
        }

        if let Err(e) = self.settler.settle(&self.ctx, summary.usage, cause).await {
            lerror!(
                self.ctx.request_id,
                LogStage::Billing,
                LogComponent::Billing,
                "settle_failed",
                "Failed to settle streamed request",
                error = %e
            );
        }
    }

    /// 转发上游事件直到结束；返回中断原因
    async fn pump(&mut self, response: reqwest::Response) -> Option<ZeroUsageCause> {
        let deadline = self
            .ctx
            .remaining_timeout()
            .map(|left| Instant::now() + left);
        let mut upstream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        let mut decoder = SseDecoder::new();

        loop {
            let next = tokio::select! {
                biased;
                () = self.tx.closed() => {
                    self.log_interrupted("client_disconnected", "Client disconnected during stream");
                    return Some(ZeroUsageCause::ClientDisconnected);
                }
                next = with_deadline(deadline, self.ctx.relay_timeout, upstream.next()) => next,
            };

            match next {
                Err(_) => {
                    self.log_interrupted("stream_timeout", "Upstream stream exceeded relay timeout");
                    return Some(ZeroUsageCause::UpstreamTimeout);
                }
                Ok(Some(Ok(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    loop {
                        match decoder.decode(&mut buffer) {
                            Ok(Some(event)) => {
                                if let Some(cause) = self.forward(&event).await {
                                    return Some(cause);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                self.log_interrupted("stream_decode_failed", &e.to_string());
                                return Some(ZeroUsageCause::UpstreamError);
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    self.log_interrupted("stream_read_failed", &e.to_string());
                    return Some(ZeroUsageCause::UpstreamError);
                }
                Ok(None) => {
                    while let Ok(Some(event)) = decoder.decode_eof(&mut buffer) {
                        if let Some(cause) = self.forward(&event).await {
                            return Some(cause);
                        }
                    }
                    return None;
                }
            }
        }
    }

    /// 转换并下发一个事件；需要结束转发时返回原因
    async fn forward(&mut self, event: &SseEvent) -> Option<ZeroUsageCause> {
        let frames = match self.converter.on_event(event) {
            Ok(frames) => frames,
            Err(e @ (ProviderError::ApiError { .. } | ProviderError::EmptyCandidates)) => {
                self.log_interrupted("stream_upstream_error", &e.to_string());
                return Some(ZeroUsageCause::UpstreamError);
            }
            Err(e) => {
                lwarn!(
                    self.ctx.request_id,
                    LogStage::Response,
                    LogComponent::Relay,
                    "stream_event_skipped",
                    "Skipping unparsable upstream event",
                    error = %e
                );
                return None;
            }
        };

        for frame in frames {
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    lwarn!(
                        self.ctx.request_id,
                        LogStage::Response,
                        LogComponent::Relay,
                        "stream_frame_skipped",
                        "Failed to encode stream frame",
                        error = %e
                    );
                    continue;
                }
            };
            if self.tx.send(Ok(bytes)).await.is_err() {
                self.log_interrupted("client_disconnected", "Client disconnected during stream");
                return Some(ZeroUsageCause::ClientDisconnected);
            }
        }
        None
    }

    fn log_interrupted(&self, operation: &str, message: &str) {
        lwarn!(
            self.ctx.request_id,
            LogStage::ResponseFailure,
            LogComponent::Relay,
            operation,
            message,
            channel_id = self.ctx.channel.id,
            elapsed_ms = self.ctx.elapsed().as_millis() as u64
        );
    }
}
