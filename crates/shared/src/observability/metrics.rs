//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册规则同步相关指标的描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "rule_upsert_chunks_total",
        "Total number of rule upsert chunks, by family and status"
    );
    metrics::describe_counter!(
        "rule_upsert_rows_total",
        "Total number of rule rows written by committed chunks"
    );
    metrics::describe_histogram!(
        "rule_upsert_chunk_duration_seconds",
        "Rule upsert chunk duration in seconds"
    );

    metrics::describe_counter!("rule_publishes_total", "Total number of metadata publishes");
    metrics::describe_histogram!(
        "rule_publish_duration_seconds",
        "Metadata publish duration in seconds"
    );
    metrics::describe_gauge!(
        "rule_published_rules",
        "Number of active rules in the latest artifact, by family"
    );

    metrics::describe_counter!(
        "rule_history_entries_total",
        "Total number of persisted rule history entries"
    );
    metrics::describe_counter!(
        "metadata_artifacts_compacted_total",
        "Total number of superseded metadata artifacts removed by retention"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次分块写入
#[inline]
pub fn record_upsert_chunk(family: &str, status: &str, rows: usize, duration_secs: f64) {
    metrics::counter!(
        "rule_upsert_chunks_total",
        "family" => family.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if status == "success" {
        metrics::counter!("rule_upsert_rows_total", "family" => family.to_string())
            .increment(rows as u64);
    }

    metrics::histogram!(
        "rule_upsert_chunk_duration_seconds",
        "family" => family.to_string()
    )
    .record(duration_secs);
}

/// 记录一次元数据发布
#[inline]
pub fn record_publish(family: &str, status: &str, rule_count: usize, duration_secs: f64) {
    metrics::counter!(
        "rule_publishes_total",
        "family" => family.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "rule_publish_duration_seconds",
        "family" => family.to_string()
    )
    .record(duration_secs);

    if status == "success" {
        metrics::gauge!("rule_published_rules", "family" => family.to_string())
            .set(rule_count as f64);
    }
}

/// 记录一条变更历史
#[inline]
pub fn record_history_entry(subject: &str, action: &str) {
    metrics::counter!(
        "rule_history_entries_total",
        "subject" => subject.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// 记录清理掉的历史制品数量
#[inline]
pub fn record_compaction(deleted: u64) {
    metrics::counter!("metadata_artifacts_compacted_total").increment(deleted);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 没有初始化 recorder 时这些函数也不应该 panic
        record_upsert_chunk("floor", "success", 2, 0.01);
        record_upsert_chunk("floor", "failed", 2, 0.01);
        record_publish("price_factor", "success", 3, 0.02);
        record_history_entry("Floor", "created");
        record_compaction(5);
        assert!(get_handle().is_none());
    }
}
