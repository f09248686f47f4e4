//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集。
//! 未安装 recorder 时，所有记录函数都是空操作。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub const RULE_EVALUATIONS_TOTAL: &str = "rule_engine_evaluations_total";
pub const RULE_EVALUATION_DURATION_SECONDS: &str = "rule_engine_evaluation_duration_seconds";
pub const RULE_EVALUATIONS_TRUNCATED_TOTAL: &str = "rule_engine_truncated_total";
pub const RULE_CANDIDATES: &str = "rule_engine_candidates";
pub const CACHE_LOOKUPS_TOTAL: &str = "rule_engine_cache_lookups_total";
pub const CACHE_ENTRIES: &str = "rule_engine_cache_entries";
pub const CORPUS_RELOADS_TOTAL: &str = "rule_engine_reload_total";
pub const CORPUS_RULES_LOADED: &str = "rule_engine_rules_loaded";

/// 安装 Prometheus recorder 并注册指标描述
pub fn init(service_name: &str) -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_rule_engine_metrics(service_name);
    Ok(handle)
}

/// 注册规则引擎指标描述
///
/// 这些描述会出现在 /metrics 输出的 HELP 注释中
fn register_rule_engine_metrics(service_name: &str) {
    metrics::describe_counter!(RULE_EVALUATIONS_TOTAL, "Total number of engine evaluations");
    metrics::describe_histogram!(
        RULE_EVALUATION_DURATION_SECONDS,
        "Engine evaluation duration in seconds"
    );
    metrics::describe_counter!(
        RULE_EVALUATIONS_TRUNCATED_TOTAL,
        "Evaluations cut short by the time budget"
    );
    metrics::describe_histogram!(RULE_CANDIDATES, "Candidate rules per evaluation");
    metrics::describe_counter!(CACHE_LOOKUPS_TOTAL, "Evaluation cache lookups by outcome");
    metrics::describe_gauge!(CACHE_ENTRIES, "Entries held by the evaluation cache");
    metrics::describe_counter!(CORPUS_RELOADS_TOTAL, "Rule corpus reload attempts by outcome");
    metrics::describe_gauge!(CORPUS_RULES_LOADED, "Rules in the active corpus");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次引擎评估
#[inline]
pub fn record_evaluation(duration: Duration, candidates: usize, truncated: bool) {
    metrics::counter!(RULE_EVALUATIONS_TOTAL).increment(1);
    metrics::histogram!(RULE_EVALUATION_DURATION_SECONDS).record(duration.as_secs_f64());
    metrics::histogram!(RULE_CANDIDATES).record(candidates as f64);
    if truncated {
        metrics::counter!(RULE_EVALUATIONS_TRUNCATED_TOTAL).increment(1);
    }
}

/// 记录一次缓存查询，outcome 取值 hit / miss / joined / collision
#[inline]
pub fn record_cache_lookup(outcome: &'static str) {
    metrics::counter!(CACHE_LOOKUPS_TOTAL, "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_cache_size(entries: usize) {
    metrics::gauge!(CACHE_ENTRIES).set(entries as f64);
}

/// 记录一次规则库重载
#[inline]
pub fn record_reload(success: bool, rules_loaded: Option<usize>) {
    let outcome = if success { "success" } else { "rejected" };
    metrics::counter!(CORPUS_RELOADS_TOTAL, "outcome" => outcome).increment(1);
    if let Some(count) = rules_loaded {
        metrics::gauge!(CORPUS_RULES_LOADED).set(count as f64);
    }
}
