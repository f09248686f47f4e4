//! 星盘解读规则引擎
//!
//! 针对一份星盘事实快照，从数千条解读规则中找出全部命中的规则，支持：
//! - JSON 规则定义的整批校验与编译
//! - 倒排索引缩小候选范围
//! - 短路求值与强度/时运变体选择
//! - 规则组合与确定性排序
//! - 带单飞去重的 LRU + TTL 结果缓存
//! - 规则库原子热重载

pub mod cache;
pub mod compiler;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod index;
pub mod models;
pub mod service;

pub use cache::{CacheOptions, CacheStats, EvaluationCache, Fingerprint, Lookup};
pub use compiler::{RuleCompiler, RuleCorpus};
pub use condition::{Condition, Dimension, Primitive};
pub use context::{AspectFact, FactContext};
pub use engine::{CorpusSnapshot, EngineOptions, RuleEngine};
pub use error::{Result, RuleError, ValidationError, ValidationErrorKind, ValidationErrors};
pub use evaluator::{ConditionEvaluator, Explanation, MatchResult};
pub use index::{IndexKey, RuleIndex};
pub use models::{
    ActionDefinition, AppliedVariation, EvaluationResult, ImpactDefinition, MergeMode, Outcome,
    OutcomeVariant, Priority, Rule, RuleDefinition, TriggeredRule, VariantDefinition,
    VariationKind,
};
pub use service::{InterpretationService, ServiceStats};
