//! 可观测性：日志、追踪与指标
//!
//! 服务启动时调用一次 `init`：装配 tracing 订阅者（终端或 JSON 日志，
//! 可选 OTLP 导出），安装 Prometheus recorder 并在独立端口暴露
//! `/metrics`。返回的 guard 负责在进程退出时刷新未导出的 span。
//! 消费链路的追踪上下文通过 Kafka 消息 headers 传播（W3C traceparent），
//! 由 `set_parent_from_headers` 在记录处理的 span 上恢复。

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider as TracerProvider},
};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// Drop 时关闭 tracer provider，把尚未导出的 span 刷到后端。
/// 指标服务器随进程退出，无需显式关闭。
pub struct ObservabilityGuard {
    tracer_provider: Option<TracerProvider>,
    _metrics_server: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("关闭 tracer provider 失败: {e:?}");
        }
    }
}

/// 初始化日志、追踪与指标
pub async fn init(
    service_name: &str,
    settings: &ObservabilityConfig,
) -> Result<ObservabilityGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let log_layer = if settings.log_format == "json" {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let tracer_provider = match &settings.tracing_endpoint {
        Some(endpoint) if settings.tracing_enabled => {
            Some(build_tracer_provider(service_name, endpoint)?)
        }
        _ => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(log_layer);
    match &tracer_provider {
        Some(provider) => {
            let tracer = provider.tracer(service_name.to_string());
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
        None => registry.try_init()?,
    }

    let metrics_server = if settings.metrics_enabled {
        Some(serve_metrics(settings.metrics_port).await?)
    } else {
        None
    };
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);

    info!(
        service = service_name,
        metrics_enabled = settings.metrics_enabled,
        tracing_enabled = settings.tracing_enabled,
        "可观测性已初始化"
    );

    Ok(ObservabilityGuard {
        tracer_provider,
        _metrics_server: metrics_server,
    })
}

/// 构建 OTLP 导出的 TracerProvider 并注册为全局
fn build_tracer_provider(service_name: &str, endpoint: &str) -> Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(
            Resource::builder_empty()
                .with_attributes(vec![KeyValue::new(
                    SERVICE_NAME,
                    service_name.to_string(),
                )])
                .build(),
        )
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// 安装 Prometheus recorder 并启动 `/metrics` 服务器
async fn serve_metrics(port: u16) -> Result<tokio::task::JoinHandle<()>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_pipeline_metrics();

    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "指标服务器已启动");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "指标服务器异常退出");
        }
    }))
}

/// 审批流水线指标的 HELP 描述
fn describe_pipeline_metrics() {
    metrics::describe_counter!(
        "approval_records_received_total",
        "Total change-stream records received"
    );
    metrics::describe_counter!(
        "approval_new_decisions_total",
        "Change records classified as new approval decisions"
    );
    metrics::describe_counter!(
        "approval_decisions_applied_total",
        "Approval decisions applied to the order aggregate"
    );
    metrics::describe_counter!(
        "approval_benign_noops_total",
        "Decisions absorbed as benign no-ops (by kind)"
    );
    metrics::describe_counter!(
        "approval_malformed_payloads_total",
        "Outbox payloads that failed to decode"
    );
    metrics::describe_counter!(
        "approval_unexpected_failures_total",
        "Decisions that failed for unclassified reasons"
    );
    metrics::describe_histogram!(
        "approval_batch_duration_seconds",
        "Batch processing duration in seconds"
    );
}

// ---------------------------------------------------------------------------
// 追踪上下文传播
// ---------------------------------------------------------------------------

/// 把 Kafka 消息 headers 当作 W3C 传播载体查询
struct HeaderLookup<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderLookup<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// 从消息 headers 恢复上游追踪上下文并挂为当前 span 的父级
///
/// headers 中没有 traceparent 时等价于空操作。
pub fn set_parent_from_headers(headers: &HashMap<String, String>) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let context = TraceContextPropagator::new().extract(&HeaderLookup(headers));
    tracing::Span::current().set_parent(context);
}
