//! 统一可观测性模块
//!
//! 提供 metrics、tracing、logging 的统一初始化和管理。
//! 所有入口通过单一初始化函数配置可观测性，确保一致的指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use serde::Deserialize;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，用于标识追踪和指标的来源
    pub service_name: String,

    /// OpenTelemetry OTLP 端点
    /// 为空时禁用分布式追踪导出
    pub otlp_endpoint: Option<String>,

    /// 是否启动 Prometheus 指标导出
    pub metrics_enabled: bool,

    /// Prometheus 指标导出端口
    pub metrics_port: u16,

    /// 日志级别（如 "info", "debug"）
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    pub json_logs: bool,
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            otlp_endpoint: None,
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 从环境变量加载配置
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok(),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_metrics_port),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level()),
            json_logs: std::env::var("JSON_LOGS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// 注入服务名（配置文件中通常不写服务名）
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        if !service_name.is_empty() {
            self.service_name = service_name.to_string();
        }
        self
    }
}

/// 可观测性资源守卫
///
/// 持有各种可观测性资源的生命周期。
/// 当 Guard 被 drop 时，会关闭追踪 provider 并刷新待发送数据。
pub struct ObservabilityGuard {
    _metrics_handle: Option<metrics::MetricsHandle>,
    _tracing_guard: Option<tracing::TracingGuard>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            _metrics_handle: None,
            _tracing_guard: None,
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        info!("Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志和追踪）
/// 2. Metrics（Prometheus 指标，仅在 metrics_enabled 时启动）
pub async fn init(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    let tracing_guard = tracing::init(config)?;

    info!(
        service = %config.service_name,
        metrics_enabled = config.metrics_enabled,
        metrics_port = %config.metrics_port,
        otlp_endpoint = ?config.otlp_endpoint,
        "Observability initialized"
    );

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init(config).await?)
    } else {
        None
    };

    Ok(ObservabilityGuard {
        _metrics_handle: metrics_handle,
        _tracing_guard: Some(tracing_guard),
    })
}
