//! 统一可观测性模块
//!
//! 提供 metrics、tracing、logging 的统一初始化和管理。
//! 规则引擎的调用方通过单一入口点配置可观测性，确保一致的指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 持有 Prometheus recorder 的 handle，供宿主进程渲染指标快照。
pub struct ObservabilityGuard {
    prometheus: Option<PrometheusHandle>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self { prometheus: None }
    }

    /// 以 Prometheus 文本格式渲染当前指标
    pub fn render_metrics(&self) -> Option<String> {
        self.prometheus.as_ref().map(PrometheusHandle::render)
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus recorder，可通过配置关闭）
///
/// # Example
///
/// ```ignore
/// use kundali_shared::config::AppConfig;
/// use kundali_shared::observability;
///
/// let config = AppConfig::load("rule-engine")?;
/// let guard = observability::init(&config.service_name, &config.observability)?;
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    let prometheus = if config.metrics_enabled {
        Some(metrics::init(service_name)?)
    } else {
        None
    };

    info!(
        service = %service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Observability initialized"
    );

    Ok(ObservabilityGuard { prometheus })
}
