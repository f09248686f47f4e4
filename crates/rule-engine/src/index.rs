//! 规则倒排索引
//!
//! 以事实为键，记录条件树中引用了该事实的规则在规则库中的位置。
//! 评估时只需查询上下文中实际存在的事实，即可得到候选规则集合。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::compiler::RuleCorpus;
use crate::condition::{Dimension, Primitive};
use crate::context::FactContext;

/// 索引键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    /// `slot` 为 None 表示"实体位于任意槽位"
    Position { entity: String, slot: Option<u32> },
    /// `dignity` 为 None 表示"实体有任意尊贵度"
    Dignity {
        entity: String,
        dignity: Option<String>,
    },
    Aspect { from: String },
    PeriodLord { lord: String },
    LunarPhase(String),
    SeasonalPhase(String),
}

impl IndexKey {
    pub fn dimension(&self) -> Dimension {
        match self {
            Self::Position { .. } => Dimension::Position,
            Self::Dignity { .. } => Dimension::Dignity,
            Self::Aspect { .. } => Dimension::Aspect,
            Self::PeriodLord { .. } => Dimension::PeriodLord,
            Self::LunarPhase(_) => Dimension::LunarPhase,
            Self::SeasonalPhase(_) => Dimension::SeasonalPhase,
        }
    }

    /// 一个原语对应的全部键
    fn for_primitive(primitive: &Primitive) -> Vec<IndexKey> {
        match primitive {
            Primitive::Position { entity, slots } if slots.is_empty() => vec![Self::Position {
                entity: entity.clone(),
                slot: None,
            }],
            Primitive::Position { entity, slots } => slots
                .iter()
                .map(|slot| Self::Position {
                    entity: entity.clone(),
                    slot: Some(*slot),
                })
                .collect(),
            Primitive::Dignity { entity, dignities } if dignities.is_empty() => {
                vec![Self::Dignity {
                    entity: entity.clone(),
                    dignity: None,
                }]
            }
            Primitive::Dignity { entity, dignities } => dignities
                .iter()
                .map(|dignity| Self::Dignity {
                    entity: entity.clone(),
                    dignity: Some(dignity.clone()),
                })
                .collect(),
            Primitive::Aspect { from, .. } => vec![Self::Aspect { from: from.clone() }],
            Primitive::PeriodLord { lord, .. } => vec![Self::PeriodLord { lord: lord.clone() }],
            Primitive::LunarPhase(phase) => vec![Self::LunarPhase(phase.clone())],
            Primitive::SeasonalPhase(phase) => vec![Self::SeasonalPhase(phase.clone())],
        }
    }

    /// 上下文中实际存在的全部键
    fn for_context(context: &FactContext) -> Vec<IndexKey> {
        let mut keys = Vec::with_capacity(context.fact_count() * 2);

        for (entity, slot) in context.positions() {
            keys.push(Self::Position {
                entity: entity.to_string(),
                slot: Some(slot),
            });
            keys.push(Self::Position {
                entity: entity.to_string(),
                slot: None,
            });
        }
        for (entity, dignity) in context.dignities() {
            keys.push(Self::Dignity {
                entity: entity.to_string(),
                dignity: Some(dignity.to_string()),
            });
            keys.push(Self::Dignity {
                entity: entity.to_string(),
                dignity: None,
            });
        }
        for aspect in context.aspects() {
            keys.push(Self::Aspect {
                from: aspect.from.clone(),
            });
        }
        for lord in context.period_chain() {
            keys.push(Self::PeriodLord { lord: lord.clone() });
        }
        if let Some(phase) = context.lunar_phase() {
            keys.push(Self::LunarPhase(phase.to_string()));
        }
        if let Some(phase) = context.seasonal_phase() {
            keys.push(Self::SeasonalPhase(phase.to_string()));
        }

        keys
    }
}

/// 倒排索引
///
/// 位置列表保持升序，由于规则库已按输出顺序排列，候选集合排序后即为输出顺序。
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    postings: HashMap<IndexKey, Vec<usize>>,
    /// 无法通过正向事实召回的规则（条件可在事实缺失时成立），永远是候选
    unanchored: Vec<usize>,
    rule_count: usize,
}

impl RuleIndex {
    pub fn build(corpus: &RuleCorpus) -> Self {
        let mut postings: HashMap<IndexKey, Vec<usize>> = HashMap::new();
        let mut unanchored = Vec::new();

        for (position, rule) in corpus.rules().iter().enumerate() {
            if !rule.condition.is_anchored() {
                unanchored.push(position);
            }

            let mut keys = BTreeSet::new();
            rule.condition.for_each_primitive(&mut |primitive| {
                for key in IndexKey::for_primitive(primitive) {
                    keys.insert(key);
                }
            });

            for key in keys {
                postings.entry(key).or_default().push(position);
            }
        }

        Self {
            postings,
            unanchored,
            rule_count: corpus.len(),
        }
    }

    /// 候选规则位置，升序去重
    pub fn candidates(&self, context: &FactContext) -> Vec<usize> {
        let mut candidates = self.unanchored.clone();

        for key in IndexKey::for_context(context) {
            if let Some(positions) = self.postings.get(&key) {
                candidates.extend_from_slice(positions);
            }
        }

        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }

    /// 某个键下的规则位置
    pub fn postings(&self, key: &IndexKey) -> &[usize] {
        self.postings.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn unanchored(&self) -> &[usize] {
        &self.unanchored
    }

    pub fn key_count(&self) -> usize {
        self.postings.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// 每个维度的不同键数量
    pub fn dimension_counts(&self) -> BTreeMap<Dimension, usize> {
        let mut counts = BTreeMap::new();
        for key in self.postings.keys() {
            *counts.entry(key.dimension()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::models::{Priority, RuleDefinition};
    use serde_json::json;

    fn corpus() -> RuleCorpus {
        RuleCompiler::new()
            .compile_batch(vec![
                RuleDefinition::new(
                    1,
                    Priority::High,
                    json!({"position": {"entity": "sun", "slots": [1, 10]}}),
                    "sun angular",
                ),
                RuleDefinition::new(
                    2,
                    Priority::Medium,
                    json!({"all": [
                        {"dignity": {"entity": "moon"}},
                        {"not": {"aspect": {"from": "saturn", "to": "moon"}}}
                    ]}),
                    "moon dignified",
                ),
                RuleDefinition::new(
                    3,
                    Priority::Low,
                    json!({"not": {"lunar_phase": "waning"}}),
                    "not waning",
                ),
                RuleDefinition::new(
                    4,
                    Priority::Low,
                    json!({"period_lord": {"lord": "venus", "level": 1}}),
                    "venus sub-period",
                ),
            ])
            .unwrap()
    }

    #[test]
    fn test_build_postings() {
        let index = RuleIndex::build(&corpus());

        assert_eq!(
            index.postings(&IndexKey::Position {
                entity: "sun".to_string(),
                slot: Some(10)
            }),
            &[0]
        );
        // not 之下的原语同样入索引
        assert_eq!(
            index.postings(&IndexKey::Aspect {
                from: "saturn".to_string()
            }),
            &[1]
        );
        assert_eq!(index.unanchored(), &[2]);
        assert_eq!(index.rule_count(), 4);

        let counts = index.dimension_counts();
        assert_eq!(counts[&Dimension::Position], 2);
        assert_eq!(counts[&Dimension::Dignity], 1);
        assert_eq!(counts[&Dimension::PeriodLord], 1);
        assert_eq!(index.key_count(), 6);
    }

    #[test]
    fn test_candidates_union_sorted() {
        let index = RuleIndex::build(&corpus());
        let context = FactContext::new()
            .with_position("sun", 10)
            .with_dignity("moon", "own")
            .with_period_chain(["jupiter", "venus"]);

        assert_eq!(index.candidates(&context), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_candidates_empty_context_keeps_unanchored() {
        let index = RuleIndex::build(&corpus());

        assert_eq!(index.candidates(&FactContext::new()), vec![2]);
    }

    #[test]
    fn test_slot_miss_excludes_rule() {
        let index = RuleIndex::build(&corpus());
        let context = FactContext::new().with_position("sun", 5);

        assert!(!index.candidates(&context).contains(&0));
    }
}
