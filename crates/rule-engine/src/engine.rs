//! 规则引擎
//!
//! 持有当前发布的规则库快照。重载时在旁路编译并建立索引，完成后原子替换快照；
//! 读取方从不加锁，正在进行的评估继续使用它开始时加载的快照。

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use kundali_shared::config::RuleEngineConfig;
use kundali_shared::observability::metrics as engine_metrics;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::compiler::{RuleCompiler, RuleCorpus};
use crate::context::FactContext;
use crate::error::{Result, RuleError};
use crate::evaluator::{ConditionEvaluator, Explanation};
use crate::index::RuleIndex;
use crate::models::{
    AppliedVariation, EvaluationResult, Requirement, RuleDefinition, TriggeredRule,
};

/// 引擎参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// 每批评估的候选规则数，批次之间检查时间预算
    pub batch_size: usize,
    pub default_budget: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            default_budget: Duration::from_millis(100),
        }
    }
}

impl From<&RuleEngineConfig> for EngineOptions {
    fn from(config: &RuleEngineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            default_budget: config.default_budget(),
        }
    }
}

/// 已发布的规则库快照，发布后不可变
#[derive(Debug)]
pub struct CorpusSnapshot {
    /// 每次成功重载加一，初始空库为 0
    pub version: u64,
    pub corpus: RuleCorpus,
    pub index: RuleIndex,
    pub loaded_at: DateTime<Utc>,
}

impl CorpusSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            corpus: RuleCorpus::empty(),
            index: RuleIndex::default(),
            loaded_at: Utc::now(),
        }
    }
}

/// 规则引擎
pub struct RuleEngine {
    snapshot: ArcSwap<CorpusSnapshot>,
    compiler: RuleCompiler,
    /// 串行化重载，读取方不受影响
    reload_lock: Mutex<()>,
    options: EngineOptions,
    evaluations: AtomicU64,
}

impl RuleEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(CorpusSnapshot::empty()),
            compiler: RuleCompiler::new(),
            reload_lock: Mutex::new(()),
            options,
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<CorpusSnapshot> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// 实际执行的评估次数（不含缓存命中）
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// 重载规则库，成功时返回新版本号；失败时保持原规则库不变
    #[instrument(skip(self, definitions), fields(count = definitions.len()))]
    pub fn reload(&self, definitions: Vec<RuleDefinition>) -> Result<u64> {
        self.publish(|compiler| compiler.compile_batch(definitions).map_err(RuleError::from))
    }

    /// 从 JSON 重载规则库
    #[instrument(skip(self, json), fields(bytes = json.len()))]
    pub fn reload_from_json(&self, json: &str) -> Result<u64> {
        self.publish(|compiler| compiler.compile_batch_from_json(json))
    }

    fn publish(&self, compile: impl FnOnce(&RuleCompiler) -> Result<RuleCorpus>) -> Result<u64> {
        let _guard = self.reload_lock.lock();

        let corpus = match compile(&self.compiler) {
            Ok(corpus) => corpus,
            Err(e) => {
                warn!("规则库重载失败，保留版本 {}: {}", self.version(), e);
                engine_metrics::record_reload(false, None);
                return Err(e);
            }
        };

        let index = RuleIndex::build(&corpus);
        let version = self.snapshot.load().version + 1;
        let rule_count = corpus.len();

        self.snapshot.store(Arc::new(CorpusSnapshot {
            version,
            corpus,
            index,
            loaded_at: Utc::now(),
        }));

        engine_metrics::record_reload(true, Some(rule_count));
        info!(version, rule_count, "规则库已发布");
        Ok(version)
    }

    /// 针对当前快照评估
    pub fn evaluate(&self, context: &FactContext, budget: Duration) -> EvaluationResult {
        let snapshot = self.snapshot.load_full();
        self.evaluate_with(&snapshot, context, budget)
    }

    /// 针对指定快照评估
    ///
    /// 候选规则分批评估，每批开始前检查耗时；预算耗尽时停止并标记 truncated。
    pub fn evaluate_with(
        &self,
        snapshot: &CorpusSnapshot,
        context: &FactContext,
        budget: Duration,
    ) -> EvaluationResult {
        let start = Instant::now();
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let corpus = &snapshot.corpus;
        let candidates = snapshot.index.candidates(context);

        let mut matches = Vec::new();
        let mut evaluated_count = 0;
        let mut truncated = false;

        for batch in candidates.chunks(self.options.batch_size.max(1)) {
            if start.elapsed() >= budget {
                truncated = true;
                break;
            }

            for &position in batch {
                let Some(rule) = corpus.rule_at(position) else {
                    continue;
                };
                let result = ConditionEvaluator::evaluate_rule(rule, context);
                if result.matched {
                    matches.push((position, result.variation));
                }
            }
            evaluated_count += batch.len();
        }

        let rules = resolve_matches(corpus, context, matches);

        let elapsed = start.elapsed();
        engine_metrics::record_evaluation(elapsed, candidates.len(), truncated);
        if truncated {
            warn!(
                "评估超出时间预算 {:?}: 已评估 {}/{} 条候选规则",
                budget,
                evaluated_count,
                candidates.len()
            );
        } else {
            debug!(
                "评估完成: {} 条候选, {} 条命中, 耗时 {:?}",
                candidates.len(),
                rules.len(),
                elapsed
            );
        }

        EvaluationResult {
            rules,
            evaluated_count,
            total_candidates: candidates.len(),
            truncated,
            corpus_version: snapshot.version,
            elapsed_us: elapsed.as_micros() as u64,
        }
    }

    /// 对单条规则给出评估追踪
    pub fn explain(&self, serial: u64, context: &FactContext) -> Option<Explanation> {
        let snapshot = self.snapshot.load();
        snapshot
            .corpus
            .get(serial)
            .map(|rule| ConditionEvaluator::explain(rule, context))
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

/// 解析命中规则的内容并执行一次组合
fn resolve_matches(
    corpus: &RuleCorpus,
    context: &FactContext,
    matches: Vec<(usize, Option<AppliedVariation>)>,
) -> Vec<TriggeredRule> {
    let mut triggered: Vec<TriggeredRule> = matches
        .into_iter()
        .filter_map(|(position, variation)| {
            let rule = corpus.rule_at(position)?;
            Some(TriggeredRule {
                serial: rule.serial,
                id: rule.id.clone(),
                section: rule.section.clone(),
                priority: rule.priority,
                outcome: rule.resolve_outcome(variation.as_ref()),
                applied_variation: variation,
                combined: false,
                absorbed: Vec::new(),
            })
        })
        .collect();

    let matched: HashSet<u64> = triggered.iter().map(|t| t.serial).collect();

    // 组合只执行一轮，不做传递
    for entry in triggered.iter_mut() {
        let Some(combination) = corpus.get(entry.serial).and_then(|r| r.combination.as_ref())
        else {
            continue;
        };

        let satisfied = combination.requires.iter().all(|requirement| match requirement {
            Requirement::Rule(serial) => {
                matched.contains(serial)
                    || corpus
                        .get(*serial)
                        .is_some_and(|r| ConditionEvaluator::evaluate(&r.condition, context))
            }
            Requirement::Condition(condition) => ConditionEvaluator::evaluate(condition, context),
        });
        if !satisfied {
            continue;
        }

        entry.outcome = entry.outcome.apply(&combination.merge);
        entry.combined = true;
        entry.absorbed = combination
            .rule_refs()
            .filter(|serial| matched.contains(serial))
            .collect();
        entry.absorbed.sort_unstable();
        entry.absorbed.dedup();
    }

    // 自身应用了组合的规则不会被吸收
    let combined: HashSet<u64> = triggered
        .iter()
        .filter(|t| t.combined)
        .map(|t| t.serial)
        .collect();
    let mut absorbed = HashSet::new();
    for entry in triggered.iter_mut() {
        entry.absorbed.retain(|serial| !combined.contains(serial));
        absorbed.extend(entry.absorbed.iter().copied());
    }

    triggered.retain(|t| !absorbed.contains(&t.serial));
    triggered.sort_by_key(|t| (Reverse(t.priority), t.serial));
    triggered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use serde_json::json;

    fn sun_rule(serial: u64, priority: Priority, slot: u32) -> RuleDefinition {
        RuleDefinition::new(
            serial,
            priority,
            json!({"position": {"entity": "sun", "slot": slot}}),
            "Sun placement",
        )
    }

    #[test]
    fn test_reload_publishes_new_version() {
        let engine = RuleEngine::default();
        assert_eq!(engine.version(), 0);
        assert!(engine.snapshot().corpus.is_empty());

        let version = engine.reload(vec![sun_rule(1, Priority::High, 1)]).unwrap();
        assert_eq!(version, 1);
        assert_eq!(engine.snapshot().corpus.len(), 1);

        let version = engine
            .reload_from_json(
                r#"[{"serial": 2, "priority": "Low", "condition": {"lunar_phase": "waxing"}, "summary": "x"}]"#,
            )
            .unwrap();
        assert_eq!(version, 2);
        assert!(engine.snapshot().corpus.get(1).is_none());
    }

    #[test]
    fn test_failed_reload_keeps_previous_corpus() {
        let engine = RuleEngine::default();
        engine.reload(vec![sun_rule(1, Priority::High, 1)]).unwrap();

        let result = engine.reload(vec![sun_rule(2, Priority::High, 1), sun_rule(2, Priority::Low, 3)]);
        assert!(matches!(result, Err(RuleError::Validation(_))));
        assert_eq!(engine.version(), 1);
        assert!(engine.snapshot().corpus.get(1).is_some());
    }

    #[test]
    fn test_evaluate_orders_output() {
        let engine = RuleEngine::default();
        engine
            .reload(vec![
                sun_rule(30, Priority::Low, 1),
                sun_rule(20, Priority::High, 1),
                sun_rule(10, Priority::Low, 1),
                sun_rule(40, Priority::High, 2),
            ])
            .unwrap();

        let context = FactContext::new().with_position("sun", 1);
        let result = engine.evaluate(&context, Duration::from_secs(1));

        assert_eq!(result.serials(), vec![20, 10, 30]);
        assert_eq!(result.total_candidates, 3);
        assert_eq!(result.evaluated_count, 3);
        assert!(!result.truncated);
        assert_eq!(result.corpus_version, 1);
    }

    #[test]
    fn test_zero_budget_truncates() {
        let engine = RuleEngine::default();
        engine.reload(vec![sun_rule(1, Priority::High, 1)]).unwrap();

        let context = FactContext::new().with_position("sun", 1);
        let result = engine.evaluate(&context, Duration::ZERO);

        assert!(result.truncated);
        assert_eq!(result.evaluated_count, 0);
        assert!(result.rules.is_empty());

        // 没有候选时不算截断
        let result = engine.evaluate(&FactContext::new(), Duration::ZERO);
        assert!(!result.truncated);
    }

    #[test]
    fn test_combination_absorbs_referenced_rule() {
        let engine = RuleEngine::default();
        engine
            .reload(vec![
                sun_rule(1, Priority::High, 1),
                RuleDefinition::new(
                    2,
                    Priority::Medium,
                    json!({"dignity": {"entity": "sun", "dignity": "exalted"}}),
                    "Exalted sun",
                )
                .with_combination(vec![json!(1)], "Exalted sun in the first house"),
            ])
            .unwrap();

        let context = FactContext::new()
            .with_position("sun", 1)
            .with_dignity("sun", "exalted");
        let result = engine.evaluate(&context, Duration::from_secs(1));

        assert_eq!(result.serials(), vec![2]);
        let merged = &result.rules[0];
        assert!(merged.combined);
        assert_eq!(merged.absorbed, vec![1]);
        assert_eq!(merged.outcome.summary, "Exalted sun in the first house");
    }

    #[test]
    fn test_combination_requirement_not_met() {
        let engine = RuleEngine::default();
        engine
            .reload(vec![
                sun_rule(1, Priority::High, 1),
                sun_rule(2, Priority::High, 10)
                    .with_combination(vec![json!({"condition": {"lunar_phase": "full_moon"}})], "merged"),
            ])
            .unwrap();

        let context = FactContext::new().with_position("sun", 10);
        let result = engine.evaluate(&context, Duration::from_secs(1));

        assert_eq!(result.serials(), vec![2]);
        assert!(!result.rules[0].combined);
        assert_eq!(result.rules[0].outcome.summary, "Sun placement");
    }

    #[test]
    fn test_referenced_rule_outside_matches_checked_against_context() {
        let corpus = RuleCompiler::new()
            .compile_batch(vec![
                sun_rule(1, Priority::Low, 1),
                RuleDefinition::new(
                    2,
                    Priority::High,
                    json!({"dignity": {"entity": "sun", "dignity": "exalted"}}),
                    "Exalted sun",
                )
                .with_combination(vec![json!(1)], "Exalted sun in the first house"),
            ])
            .unwrap();
        let position = corpus.rules().iter().position(|r| r.serial == 2).unwrap();

        // 规则 1 未进入命中集合（如被预算截断），但其条件在上下文中成立
        let context = FactContext::new()
            .with_position("sun", 1)
            .with_dignity("sun", "exalted");
        let triggered = resolve_matches(&corpus, &context, vec![(position, None)]);

        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].serial, 2);
        assert!(triggered[0].combined);
        assert!(triggered[0].absorbed.is_empty());
        assert_eq!(triggered[0].outcome.summary, "Exalted sun in the first house");

        // 条件不成立时不合并
        let context = FactContext::new()
            .with_position("sun", 7)
            .with_dignity("sun", "exalted");
        let triggered = resolve_matches(&corpus, &context, vec![(position, None)]);

        assert_eq!(triggered.len(), 1);
        assert!(!triggered[0].combined);
        assert_eq!(triggered[0].outcome.summary, "Exalted sun");
    }

    #[test]
    fn test_mutual_combinations_are_not_absorbed() {
        let engine = RuleEngine::default();
        engine
            .reload(vec![
                sun_rule(1, Priority::High, 1).with_combination(vec![json!(2)], "one"),
                sun_rule(2, Priority::High, 1).with_combination(vec![json!(1)], "two"),
            ])
            .unwrap();

        let context = FactContext::new().with_position("sun", 1);
        let result = engine.evaluate(&context, Duration::from_secs(1));

        assert_eq!(result.serials(), vec![1, 2]);
        assert!(result.rules.iter().all(|r| r.combined && r.absorbed.is_empty()));
    }

    #[test]
    fn test_explain_uses_current_snapshot() {
        let engine = RuleEngine::default();
        engine.reload(vec![sun_rule(1, Priority::High, 1)]).unwrap();

        let context = FactContext::new().with_position("sun", 1);
        assert!(engine.explain(1, &context).unwrap().matched);
        assert!(engine.explain(99, &context).is_none());
    }
}
