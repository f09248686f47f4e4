//! 解读服务
//!
//! 组合规则引擎与评估缓存，对外提供评估、重载、统计接口。

use kundali_shared::config::AppConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::cache::{CacheOptions, CacheStats, EvaluationCache, Fingerprint};
use crate::condition::Dimension;
use crate::context::FactContext;
use crate::engine::{EngineOptions, RuleEngine};
use crate::error::Result;
use crate::evaluator::Explanation;
use crate::models::{EvaluationResult, Priority, RuleDefinition};

/// 服务统计
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub rule_count: usize,
    pub corpus_version: u64,
    pub index_dimension_counts: BTreeMap<Dimension, usize>,
    pub priority_counts: BTreeMap<Priority, usize>,
    pub section_counts: BTreeMap<String, usize>,
    /// 未启用缓存时为 None
    pub cache: Option<CacheStats>,
    /// 引擎实际执行的评估次数
    pub evaluations: u64,
}

/// 解读服务
pub struct InterpretationService {
    engine: RuleEngine,
    cache: Option<EvaluationCache>,
    default_budget: Duration,
}

impl InterpretationService {
    /// `cache` 为 None 时不启用缓存
    pub fn new(options: EngineOptions, cache: Option<CacheOptions>) -> Self {
        Self {
            engine: RuleEngine::new(options),
            cache: cache.map(EvaluationCache::new),
            default_budget: options.default_budget,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| CacheOptions::from(&config.cache));
        Self::new(EngineOptions::from(&config.engine), cache)
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// 评估事实上下文；`budget` 为 None 时使用默认预算
    pub fn evaluate(&self, context: &FactContext, budget: Option<Duration>) -> Arc<EvaluationResult> {
        let budget = budget.unwrap_or(self.default_budget);
        let snapshot = self.engine.snapshot();

        match &self.cache {
            Some(cache) => {
                let fingerprint = Fingerprint::of(context);
                cache
                    .get_or_compute(snapshot.version, &fingerprint, budget, || {
                        self.engine.evaluate_with(&snapshot, context, budget)
                    })
                    .into_result()
            }
            None => Arc::new(self.engine.evaluate_with(&snapshot, context, budget)),
        }
    }

    /// 重载规则库并清空缓存，返回新版本号
    #[instrument(skip(self, definitions), fields(count = definitions.len()))]
    pub fn reload(&self, definitions: Vec<RuleDefinition>) -> Result<u64> {
        let version = self.engine.reload(definitions)?;
        self.invalidate();
        Ok(version)
    }

    #[instrument(skip(self, json))]
    pub fn reload_from_json(&self, json: &str) -> Result<u64> {
        let version = self.engine.reload_from_json(json)?;
        self.invalidate();
        Ok(version)
    }

    fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    pub fn clear_cache(&self) {
        self.invalidate();
        info!("评估缓存已手动清空");
    }

    /// 对单条规则给出评估追踪
    pub fn explain(&self, serial: u64, context: &FactContext) -> Option<Explanation> {
        self.engine.explain(serial, context)
    }

    pub fn stats(&self) -> ServiceStats {
        let snapshot = self.engine.snapshot();

        ServiceStats {
            rule_count: snapshot.corpus.len(),
            corpus_version: snapshot.version,
            index_dimension_counts: snapshot.index.dimension_counts(),
            priority_counts: snapshot.corpus.priority_counts(),
            section_counts: snapshot.corpus.section_counts(),
            cache: self.cache.as_ref().map(EvaluationCache::stats),
            evaluations: self.engine.evaluation_count(),
        }
    }
}

impl Default for InterpretationService {
    fn default() -> Self {
        Self::new(EngineOptions::default(), Some(CacheOptions::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> Vec<RuleDefinition> {
        vec![
            RuleDefinition::new(
                1,
                Priority::High,
                json!({"position": {"entity": "sun", "slot": 1}}),
                "Sun in the first house",
            )
            .with_section("lagna"),
            RuleDefinition::new(
                2,
                Priority::Low,
                json!({"lunar_phase": "waxing"}),
                "Waxing moon",
            ),
        ]
    }

    #[test]
    fn test_evaluate_uses_cache() {
        let service = InterpretationService::default();
        service.reload(rules()).unwrap();
        let context = FactContext::new().with_position("sun", 1);

        let first = service.evaluate(&context, None);
        let second = service.evaluate(&context, None);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.stats().evaluations, 1);
    }

    #[test]
    fn test_without_cache_every_call_evaluates() {
        let service = InterpretationService::new(EngineOptions::default(), None);
        service.reload(rules()).unwrap();
        let context = FactContext::new().with_position("sun", 1);

        service.evaluate(&context, None);
        service.evaluate(&context, None);

        let stats = service.stats();
        assert_eq!(stats.evaluations, 2);
        assert!(stats.cache.is_none());
    }

    #[test]
    fn test_stats() {
        let service = InterpretationService::default();
        service.reload(rules()).unwrap();

        let stats = service.stats();
        assert_eq!(stats.rule_count, 2);
        assert_eq!(stats.corpus_version, 1);
        assert_eq!(stats.section_counts["lagna"], 1);
        assert_eq!(stats.priority_counts[&Priority::Low], 1);
        assert_eq!(stats.index_dimension_counts[&Dimension::LunarPhase], 1);
        assert_eq!(stats.cache.map(|c| c.size), Some(0));
    }

    #[test]
    fn test_from_config() {
        let mut config = AppConfig::default();
        config.cache.enabled = false;
        config.engine.default_budget_ms = 5;

        let service = InterpretationService::from_config(&config);
        assert!(service.stats().cache.is_none());
        assert_eq!(service.engine().options().default_budget, Duration::from_millis(5));
    }
}
