//! 规则引擎领域模型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::condition::Condition;

/// 规则优先级，High > Medium > Low
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// 大小写不敏感地解析优先级标签
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 规则命中后返回的解读内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

impl Outcome {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            impact: None,
            actions: Vec::new(),
        }
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = Some(impact.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    /// 在当前内容上应用一个变体
    ///
    /// Replace 直接替换；Augment 追加摘要、以变体的 impact 覆盖（若有）、合并行动建议。
    pub fn apply(&self, variant: &OutcomeVariant) -> Outcome {
        match variant.mode {
            MergeMode::Replace => variant.outcome.clone(),
            MergeMode::Augment => {
                let mut merged = self.clone();
                let extra = &variant.outcome;
                if !extra.summary.is_empty() {
                    if !merged.summary.is_empty() {
                        merged.summary.push(' ');
                    }
                    merged.summary.push_str(&extra.summary);
                }
                if extra.impact.is_some() {
                    merged.impact = extra.impact.clone();
                }
                merged.actions.extend(extra.actions.iter().cloned());
                merged
            }
        }
    }
}

/// 变体的合并方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Replace,
    Augment,
}

/// 编译后的变体内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeVariant {
    pub mode: MergeMode,
    pub outcome: Outcome,
}

/// 组合要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// 同一次评估中另一条规则也需命中（以序号引用）
    Rule(u64),
    /// 一个附加条件
    Condition(Condition),
}

/// 组合效果：全部要求满足时，用 merge 改写本规则的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    pub requires: Vec<Requirement>,
    pub merge: OutcomeVariant,
}

impl Combination {
    /// 引用到的规则序号
    pub fn rule_refs(&self) -> impl Iterator<Item = u64> + '_ {
        self.requires.iter().filter_map(|r| match r {
            Requirement::Rule(serial) => Some(*serial),
            Requirement::Condition(_) => None,
        })
    }
}

/// 规则定义（加载后不可变）
#[derive(Debug, Clone)]
pub struct Rule {
    pub serial: u64,
    pub id: Option<String>,
    pub section: Option<String>,
    pub priority: Priority,
    pub condition: Condition,
    /// 决定强度变体的实体
    pub subject: Option<String>,
    pub base_outcome: Outcome,
    pub strength_variations: BTreeMap<String, OutcomeVariant>,
    pub timing_variations: BTreeMap<String, OutcomeVariant>,
    pub combination: Option<Combination>,
    /// 出处信息，引擎不解析
    pub source_reference: Option<Value>,
}

impl Rule {
    /// 按命中的变体解析内容；无变体时返回基础内容
    pub fn resolve_outcome(&self, variation: Option<&AppliedVariation>) -> Outcome {
        let variant = variation.and_then(|applied| match applied.kind {
            VariationKind::Strength => self.strength_variations.get(&applied.label),
            VariationKind::Timing => self.timing_variations.get(&applied.label),
        });

        match variant {
            Some(variant) => self.base_outcome.apply(variant),
            None => self.base_outcome.clone(),
        }
    }
}

/// 变体定义：纯文本简写，或带合并方式的完整内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantDefinition {
    Text(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<MergeMode>,
        #[serde(flatten)]
        outcome: Outcome,
    },
}

impl VariantDefinition {
    pub fn into_variant(self, default_mode: MergeMode) -> OutcomeVariant {
        match self {
            Self::Text(summary) => OutcomeVariant {
                mode: default_mode,
                outcome: Outcome::new(summary),
            },
            Self::Detailed { mode, outcome } => OutcomeVariant {
                mode: mode.unwrap_or(default_mode),
                outcome,
            },
        }
    }
}

impl From<Outcome> for VariantDefinition {
    fn from(outcome: Outcome) -> Self {
        Self::Detailed {
            mode: None,
            outcome,
        }
    }
}

impl From<&str> for VariantDefinition {
    fn from(summary: &str) -> Self {
        Self::Text(summary.to_string())
    }
}

/// 旧格式的影响：纯文本，或分正负两面描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImpactDefinition {
    Text(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positive_manifestation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_manifestation: Option<String>,
    },
}

impl ImpactDefinition {
    /// 对象形式取正面表现，缺失时退回负面表现
    pub fn into_impact(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Detailed {
                positive_manifestation,
                negative_manifestation,
            } => positive_manifestation.or(negative_manifestation),
        }
    }
}

impl From<&str> for ImpactDefinition {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// 旧格式的行动建议：单条文本，或带 `primary_actions` 列表的对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionDefinition {
    Text(String),
    Detailed {
        #[serde(default)]
        primary_actions: Vec<String>,
        /// 按大运给出的时机建议，原样保留不参与评估
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timing_guidance: Option<Value>,
    },
}

impl ActionDefinition {
    pub fn into_actions(self) -> Vec<String> {
        match self {
            Self::Text(text) => vec![text],
            Self::Detailed {
                primary_actions, ..
            } => primary_actions,
        }
    }
}

impl From<&str> for ActionDefinition {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// 组合效果定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationDefinition {
    /// 每项为规则引用（序号或 ID，可写作 `{"rule": ..}`）或 `{"condition": {..}}`
    pub requires: Vec<Value>,
    pub merge: VariantDefinition,
}

/// 规则定义的原始输入
///
/// 字段均为可选，缺失的必填字段由编译器统一报告。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefinition {
    pub serial: Option<u64>,
    pub id: Option<String>,
    pub section: Option<String>,
    pub priority: Option<String>,
    #[serde(alias = "conditions")]
    pub condition: Option<Value>,
    pub subject: Option<String>,
    pub outcome: Option<Outcome>,
    /// 旧格式：摘要/影响/行动直接写在规则上
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<ImpactDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionDefinition>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub strength_variations: BTreeMap<String, VariantDefinition>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub timing_variations: BTreeMap<String, VariantDefinition>,
    pub combination: Option<CombinationDefinition>,
    pub source_reference: Option<Value>,
    /// 旧格式的出处字符串，仅在 source_reference 缺失时使用
    #[serde(rename = "_source", skip_serializing_if = "Option::is_none")]
    pub legacy_source: Option<String>,
}

impl RuleDefinition {
    pub fn new(serial: u64, priority: Priority, condition: Value, summary: &str) -> Self {
        Self {
            serial: Some(serial),
            priority: Some(priority.as_str().to_string()),
            condition: Some(condition),
            outcome: Some(Outcome::new(summary)),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_section(mut self, section: &str) -> Self {
        self.section = Some(section.to_string());
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_strength_variation(
        mut self,
        label: &str,
        variant: impl Into<VariantDefinition>,
    ) -> Self {
        self.strength_variations
            .insert(label.to_string(), variant.into());
        self
    }

    pub fn with_timing_variation(
        mut self,
        label: &str,
        variant: impl Into<VariantDefinition>,
    ) -> Self {
        self.timing_variations
            .insert(label.to_string(), variant.into());
        self
    }

    pub fn with_combination(
        mut self,
        requires: Vec<Value>,
        merge: impl Into<VariantDefinition>,
    ) -> Self {
        self.combination = Some(CombinationDefinition {
            requires,
            merge: merge.into(),
        });
        self
    }
}

/// 变体来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariationKind {
    Strength,
    Timing,
}

/// 本次命中所采用的变体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedVariation {
    pub kind: VariationKind,
    pub label: String,
}

impl AppliedVariation {
    pub fn strength(label: &str) -> Self {
        Self {
            kind: VariationKind::Strength,
            label: label.to_string(),
        }
    }

    pub fn timing(label: &str) -> Self {
        Self {
            kind: VariationKind::Timing,
            label: label.to_string(),
        }
    }
}

/// 命中的规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredRule {
    pub serial: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub priority: Priority,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_variation: Option<AppliedVariation>,
    /// 是否应用了组合效果
    pub combined: bool,
    /// 被本规则的组合效果吸收的规则序号
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub absorbed: Vec<u64>,
}

/// 评估结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationResult {
    /// 按优先级降序、序号升序排列
    pub rules: Vec<TriggeredRule>,
    pub evaluated_count: usize,
    pub total_candidates: usize,
    /// 时间预算耗尽时为 true，此时 rules 只包含已评估部分的命中
    pub truncated: bool,
    pub corpus_version: u64,
    pub elapsed_us: u64,
}

impl EvaluationResult {
    pub fn serials(&self) -> Vec<u64> {
        self.rules.iter().map(|r| r.serial).collect()
    }

    pub fn get(&self, serial: u64) -> Option<&TriggeredRule> {
        self.rules.iter().find(|r| r.serial == serial)
    }
}
