//! 条件评估器
//!
//! 对条件树做纯函数式的递归短路求值。缺失的事实使原语为假，评估永不报错。

use serde::Serialize;

use crate::condition::{Condition, Primitive};
use crate::context::FactContext;
use crate::models::{AppliedVariation, Rule};

/// 单条规则的匹配结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    /// 命中时选中的变体
    pub variation: Option<AppliedVariation>,
}

/// 规则评估追踪，用于诊断单条规则为何命中或未命中
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Explanation {
    pub serial: u64,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<AppliedVariation>,
    pub trace: Vec<String>,
}

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件树
    pub fn evaluate(condition: &Condition, context: &FactContext) -> bool {
        match condition {
            Condition::Fact(primitive) => Self::evaluate_primitive(primitive, context),
            // all: 遇到 false 立即返回
            Condition::All(children) => children.iter().all(|c| Self::evaluate(c, context)),
            // any: 遇到 true 立即返回
            Condition::Any(children) => children.iter().any(|c| Self::evaluate(c, context)),
            Condition::Not(child) => !Self::evaluate(child, context),
        }
    }

    /// 评估单个原语
    pub fn evaluate_primitive(primitive: &Primitive, context: &FactContext) -> bool {
        match primitive {
            Primitive::Position { entity, slots } => match context.position(entity) {
                Some(slot) => slots.is_empty() || slots.binary_search(&slot).is_ok(),
                None => false,
            },
            Primitive::Dignity { entity, dignities } => match context.dignity(entity) {
                Some(dignity) => dignities.is_empty() || dignities.iter().any(|d| d == dignity),
                None => false,
            },
            Primitive::Aspect { from, to, kind } => context.aspects().any(|aspect| {
                aspect.from == *from
                    && to.as_ref().is_none_or(|to| aspect.to == *to)
                    && kind.as_ref().is_none_or(|kind| aspect.kind == *kind)
            }),
            Primitive::PeriodLord { lord, level } => {
                let chain = context.period_chain();
                match level {
                    Some(level) => chain.get(*level).is_some_and(|l| l == lord),
                    None => chain.iter().any(|l| l == lord),
                }
            }
            Primitive::LunarPhase(phase) => context.lunar_phase() == Some(phase.as_str()),
            Primitive::SeasonalPhase(phase) => context.seasonal_phase() == Some(phase.as_str()),
        }
    }

    /// 评估规则并选择变体
    pub fn evaluate_rule(rule: &Rule, context: &FactContext) -> MatchResult {
        if !Self::evaluate(&rule.condition, context) {
            return MatchResult {
                matched: false,
                variation: None,
            };
        }

        MatchResult {
            matched: true,
            variation: Self::select_variation(rule, context),
        }
    }

    /// 选择变体：主体的尊贵度优先；否则按大运链由内到外、月相、季节的顺序取第一个有定义的时运标签
    pub fn select_variation(rule: &Rule, context: &FactContext) -> Option<AppliedVariation> {
        if let Some(subject) = &rule.subject
            && let Some(dignity) = context.dignity(subject)
            && rule.strength_variations.contains_key(dignity)
        {
            return Some(AppliedVariation::strength(dignity));
        }

        if rule.timing_variations.is_empty() {
            return None;
        }

        context
            .period_chain()
            .iter()
            .rev()
            .map(String::as_str)
            .chain(context.lunar_phase())
            .chain(context.seasonal_phase())
            .find(|label| rule.timing_variations.contains_key(*label))
            .map(AppliedVariation::timing)
    }

    /// 带追踪的规则评估
    pub fn explain(rule: &Rule, context: &FactContext) -> Explanation {
        let mut trace = Vec::new();
        let matched = Self::trace_node(&rule.condition, context, "condition", &mut trace);
        let variation = if matched {
            Self::select_variation(rule, context)
        } else {
            None
        };

        if let Some(variation) = &variation {
            trace.push(format!("variation: {:?} {}", variation.kind, variation.label));
        }

        Explanation {
            serial: rule.serial,
            matched,
            variation,
            trace,
        }
    }

    fn trace_node(
        condition: &Condition,
        context: &FactContext,
        path: &str,
        trace: &mut Vec<String>,
    ) -> bool {
        let matched = match condition {
            Condition::Fact(primitive) => {
                let matched = Self::evaluate_primitive(primitive, context);
                trace.push(format!("{}: {} => {}", path, primitive, verdict(matched)));
                return matched;
            }
            Condition::All(children) => {
                let mut matched = true;
                for (i, child) in children.iter().enumerate() {
                    let child_path = format!("{}.all[{}]", path, i);
                    if !Self::trace_node(child, context, &child_path, trace) {
                        trace.push(format!("{}: all 短路 - 子节点 {} 不匹配", path, i));
                        matched = false;
                        break;
                    }
                }
                matched
            }
            Condition::Any(children) => {
                let mut matched = false;
                for (i, child) in children.iter().enumerate() {
                    let child_path = format!("{}.any[{}]", path, i);
                    if Self::trace_node(child, context, &child_path, trace) {
                        trace.push(format!("{}: any 短路 - 子节点 {} 匹配", path, i));
                        matched = true;
                        break;
                    }
                }
                matched
            }
            Condition::Not(child) => {
                !Self::trace_node(child, context, &format!("{}.not", path), trace)
            }
        };

        trace.push(format!("{} => {}", path, verdict(matched)));
        matched
    }
}

fn verdict(matched: bool) -> &'static str {
    if matched { "MATCHED" } else { "NOT_MATCHED" }
}
