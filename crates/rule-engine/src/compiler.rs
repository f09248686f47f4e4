//! 规则编译器
//!
//! 将 JSON 规则定义校验并编译成内存中的条件树。整批规则要么全部通过，要么整体拒绝，
//! 所有错误一次性收集返回而不是遇错即停。

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

use crate::condition::{Condition, normalize_label};
use crate::error::{Result, RuleError, ValidationError, ValidationErrorKind, ValidationErrors};
use crate::models::{
    ActionDefinition, Combination, CombinationDefinition, ImpactDefinition, MergeMode, Outcome,
    OutcomeVariant, Priority, Requirement, Rule, RuleDefinition, VariantDefinition,
};

/// 编译完成的规则库
///
/// 规则按（优先级降序，序号升序）排列，即最终输出顺序。
#[derive(Debug, Clone, Default)]
pub struct RuleCorpus {
    rules: Vec<Rule>,
    by_serial: HashMap<u64, usize>,
}

impl RuleCorpus {
    pub fn empty() -> Self {
        Self::default()
    }

    fn from_rules(mut rules: Vec<Rule>) -> Self {
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.serial.cmp(&b.serial))
        });
        let by_serial = rules
            .iter()
            .enumerate()
            .map(|(position, rule)| (rule.serial, position))
            .collect();
        Self { rules, by_serial }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// 按库内位置取规则
    pub fn rule_at(&self, position: usize) -> Option<&Rule> {
        self.rules.get(position)
    }

    /// 按序号取规则
    pub fn get(&self, serial: u64) -> Option<&Rule> {
        self.by_serial.get(&serial).map(|&i| &self.rules[i])
    }

    pub fn priority_counts(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for rule in &self.rules {
            *counts.entry(rule.priority).or_insert(0) += 1;
        }
        counts
    }

    /// 各分区的规则数，未设置分区的规则不计入
    pub fn section_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for rule in &self.rules {
            if let Some(section) = &rule.section {
                *counts.entry(section.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// 单条规则编译过程中的错误收集器
struct Diagnostics<'a> {
    index: usize,
    serial: Option<u64>,
    errors: &'a mut Vec<ValidationError>,
    reported: usize,
}

impl<'a> Diagnostics<'a> {
    fn new(index: usize, serial: Option<u64>, errors: &'a mut Vec<ValidationError>) -> Self {
        Self {
            index,
            serial,
            errors,
            reported: 0,
        }
    }

    fn report(&mut self, path: impl Into<String>, kind: ValidationErrorKind) {
        self.errors
            .push(ValidationError::new(self.index, self.serial, path, kind));
        self.reported += 1;
    }

    fn malformed(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.report(path, ValidationErrorKind::MalformedCondition(message.into()));
    }

    fn is_clean(&self) -> bool {
        self.reported == 0
    }
}

/// 批次内的序号与 ID 表
struct BatchTables {
    serials: HashMap<u64, usize>,
    ids: HashMap<String, u64>,
}

/// 规则编译器
#[derive(Debug, Default)]
pub struct RuleCompiler;

impl RuleCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 从 JSON 编译一批规则
    ///
    /// 接受顶层数组或 `{"rules": [...]}`。每个元素单独解码，格式错误的记录以下标报告。
    #[instrument(skip(self, json), fields(bytes = json.len()))]
    pub fn compile_batch_from_json(&self, json: &str) -> Result<RuleCorpus> {
        let value: Value = serde_json::from_str(json)?;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("rules") {
                Some(Value::Array(items)) => items,
                _ => return Err(batch_shape_error("对象形式的批次必须包含 rules 数组")),
            },
            _ => return Err(batch_shape_error("规则批次必须是数组")),
        };

        let mut definitions = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<RuleDefinition>(item) {
                Ok(definition) => definitions.push((index, definition)),
                Err(e) => errors.push(ValidationError::new(
                    index,
                    None,
                    "",
                    ValidationErrorKind::Malformed(e.to_string()),
                )),
            }
        }

        self.compile_indexed(definitions, errors)
            .map_err(RuleError::from)
    }

    /// 编译一批规则定义
    #[instrument(skip(self, definitions), fields(count = definitions.len()))]
    pub fn compile_batch(
        &self,
        definitions: Vec<RuleDefinition>,
    ) -> std::result::Result<RuleCorpus, ValidationErrors> {
        self.compile_indexed(definitions.into_iter().enumerate().collect(), Vec::new())
    }

    fn compile_indexed(
        &self,
        definitions: Vec<(usize, RuleDefinition)>,
        mut errors: Vec<ValidationError>,
    ) -> std::result::Result<RuleCorpus, ValidationErrors> {
        let tables = self.build_tables(&definitions, &mut errors);

        let mut rules = Vec::with_capacity(definitions.len());
        for (index, definition) in definitions {
            if let Some(rule) = self.compile_rule(index, definition, &tables, &mut errors) {
                rules.push(rule);
            }
        }

        if !errors.is_empty() {
            errors.sort_by_key(|e| e.index);
            return Err(ValidationErrors::new(errors));
        }

        debug!("规则批次编译完成: {} 条", rules.len());
        Ok(RuleCorpus::from_rules(rules))
    }

    /// 第一遍：建立序号表和 ID 表，同时检查重复
    fn build_tables(
        &self,
        definitions: &[(usize, RuleDefinition)],
        errors: &mut Vec<ValidationError>,
    ) -> BatchTables {
        let mut serials = HashMap::with_capacity(definitions.len());
        let mut ids = HashMap::new();

        for (index, definition) in definitions {
            let Some(serial) = definition.serial else {
                continue;
            };

            if serials.insert(serial, *index).is_some() {
                errors.push(ValidationError::new(
                    *index,
                    Some(serial),
                    "serial",
                    ValidationErrorKind::DuplicateSerial(serial),
                ));
            }

            if let Some(id) = clean_id(definition.id.as_deref())
                && ids.insert(id.clone(), serial).is_some()
            {
                errors.push(ValidationError::new(
                    *index,
                    Some(serial),
                    "id",
                    ValidationErrorKind::DuplicateId(id),
                ));
            }
        }

        BatchTables { serials, ids }
    }

    /// 第二遍：编译单条规则，出错时返回 None 并记录全部错误
    fn compile_rule(
        &self,
        index: usize,
        definition: RuleDefinition,
        tables: &BatchTables,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Rule> {
        let mut diag = Diagnostics::new(index, definition.serial, errors);

        if definition.serial.is_none() {
            diag.report("", ValidationErrorKind::MissingField("serial".to_string()));
        }

        let priority = match definition.priority.as_deref() {
            None => {
                diag.report("", ValidationErrorKind::MissingField("priority".to_string()));
                None
            }
            Some(label) => {
                let parsed = Priority::parse(label);
                if parsed.is_none() {
                    diag.report(
                        "priority",
                        ValidationErrorKind::InvalidPriority(label.to_string()),
                    );
                }
                parsed
            }
        };

        let condition = match &definition.condition {
            None => {
                diag.report("", ValidationErrorKind::MissingField("condition".to_string()));
                None
            }
            Some(value) => parse_condition(value, "condition", &mut diag),
        };

        let base_outcome = resolve_base_outcome(&definition, &mut diag);

        let strength_variations = compile_variations(
            definition.strength_variations,
            MergeMode::Replace,
            "strength_variations",
            &mut diag,
        );
        let timing_variations = compile_variations(
            definition.timing_variations,
            MergeMode::Augment,
            "timing_variations",
            &mut diag,
        );

        let subject = definition.subject.as_deref().map(normalize_label).or_else(|| {
            condition
                .as_ref()
                .and_then(Condition::first_subject)
                .map(str::to_string)
        });
        // 没有主体实体时强度变体永远不会被选中
        if subject.is_none() && condition.is_some() && !strength_variations.is_empty() {
            diag.report(
                "strength_variations",
                ValidationErrorKind::UnselectableStrengthVariations,
            );
        }

        let combination = definition.combination.and_then(|combination| {
            compile_combination(combination, definition.serial, tables, &mut diag)
        });

        if !diag.is_clean() {
            return None;
        }
        let (serial, priority, condition, base_outcome) =
            (definition.serial?, priority?, condition?, base_outcome?);

        Some(Rule {
            serial,
            id: clean_id(definition.id.as_deref()),
            section: definition.section,
            priority,
            condition,
            subject,
            base_outcome,
            strength_variations,
            timing_variations,
            combination,
            source_reference: definition
                .source_reference
                .or_else(|| definition.legacy_source.map(Value::String)),
        })
    }
}

fn batch_shape_error(message: &str) -> RuleError {
    RuleError::Validation(ValidationErrors::new(vec![ValidationError::new(
        0,
        None,
        "",
        ValidationErrorKind::Malformed(message.to_string()),
    )]))
}

fn clean_id(id: Option<&str>) -> Option<String> {
    id.map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// 基础内容：优先 `outcome`，否则使用旧格式的 summary/impact/action
fn resolve_base_outcome(definition: &RuleDefinition, diag: &mut Diagnostics<'_>) -> Option<Outcome> {
    let outcome = match (&definition.outcome, &definition.summary) {
        (Some(outcome), _) => outcome.clone(),
        (None, Some(summary)) => {
            let actions = definition
                .action
                .clone()
                .map(ActionDefinition::into_actions)
                .unwrap_or_default();
            if matches!(definition.action, Some(ActionDefinition::Detailed { .. }))
                && actions.is_empty()
            {
                diag.report(
                    "action",
                    ValidationErrorKind::MissingField("action.primary_actions".to_string()),
                );
                return None;
            }
            Outcome {
                summary: summary.clone(),
                impact: definition
                    .impact
                    .clone()
                    .and_then(ImpactDefinition::into_impact),
                actions,
            }
        }
        (None, None) => {
            diag.report("", ValidationErrorKind::MissingField("outcome".to_string()));
            return None;
        }
    };

    if outcome.summary.trim().is_empty() {
        diag.report(
            "outcome",
            ValidationErrorKind::MissingField("outcome.summary".to_string()),
        );
        return None;
    }
    Some(outcome)
}

/// 编译变体表；规范化后重名的标签报错而不是互相覆盖
fn compile_variations(
    definitions: BTreeMap<String, VariantDefinition>,
    default_mode: MergeMode,
    path: &str,
    diag: &mut Diagnostics<'_>,
) -> BTreeMap<String, OutcomeVariant> {
    let mut variations = BTreeMap::new();
    for (label, variant) in definitions {
        let normalized = normalize_label(&label);
        if variations.contains_key(&normalized) {
            diag.report(
                format!("{}.{}", path, label),
                ValidationErrorKind::DuplicateVariation(normalized),
            );
            continue;
        }
        variations.insert(normalized, variant.into_variant(default_mode));
    }
    variations
}

fn compile_combination(
    definition: CombinationDefinition,
    own_serial: Option<u64>,
    tables: &BatchTables,
    diag: &mut Diagnostics<'_>,
) -> Option<Combination> {
    if definition.requires.is_empty() {
        diag.report("combination.requires", ValidationErrorKind::EmptyGroup);
        return None;
    }

    let mut requires = Vec::with_capacity(definition.requires.len());
    for (i, value) in definition.requires.iter().enumerate() {
        let path = format!("combination.requires[{}]", i);
        if let Some(requirement) = parse_requirement(value, &path, own_serial, tables, diag) {
            requires.push(requirement);
        }
    }

    (requires.len() == definition.requires.len()).then(|| Combination {
        requires,
        merge: definition.merge.into_variant(MergeMode::Replace),
    })
}

/// 组合要求：序号、ID、`{"rule": ..}` 或 `{"condition": {..}}`
fn parse_requirement(
    value: &Value,
    path: &str,
    own_serial: Option<u64>,
    tables: &BatchTables,
    diag: &mut Diagnostics<'_>,
) -> Option<Requirement> {
    let serial = match value {
        Value::Number(n) => match n.as_u64() {
            Some(serial) => {
                if !tables.serials.contains_key(&serial) {
                    diag.report(path, ValidationErrorKind::DanglingReference(serial.to_string()));
                    return None;
                }
                serial
            }
            None => {
                diag.report(path, ValidationErrorKind::Malformed(format!("无效的规则序号: {}", n)));
                return None;
            }
        },
        Value::String(id) => match tables.ids.get(id.trim()) {
            Some(&serial) => serial,
            None => {
                diag.report(path, ValidationErrorKind::DanglingReference(id.clone()));
                return None;
            }
        },
        Value::Object(map) if map.len() == 1 && map.contains_key("rule") => {
            return parse_requirement(&map["rule"], path, own_serial, tables, diag);
        }
        Value::Object(map) if map.len() == 1 && map.contains_key("condition") => {
            let condition_path = format!("{}.condition", path);
            return parse_condition(&map["condition"], &condition_path, diag)
                .map(Requirement::Condition);
        }
        _ => {
            diag.report(
                path,
                ValidationErrorKind::Malformed("组合要求必须是规则引用或 {\"condition\": ..}".to_string()),
            );
            return None;
        }
    };

    if Some(serial) == own_serial {
        diag.report(path, ValidationErrorKind::SelfReference(serial));
        return None;
    }
    Some(Requirement::Rule(serial))
}

/// 解析条件节点，错误写入 diag 并返回 None
fn parse_condition(value: &Value, path: &str, diag: &mut Diagnostics<'_>) -> Option<Condition> {
    let Value::Object(map) = value else {
        diag.malformed(path, "条件节点必须是对象");
        return None;
    };
    if map.len() != 1 {
        diag.malformed(path, format!("条件节点必须恰好有一个键，实际为 {}", map.len()));
        return None;
    }
    let (kind, body) = map.iter().next()?;
    let child_path = format!("{}.{}", path, kind);

    match kind.as_str() {
        "all" | "any" | "any_of" => {
            let Value::Array(items) = body else {
                diag.malformed(child_path, "逻辑组必须是条件数组");
                return None;
            };
            if items.is_empty() {
                diag.report(child_path, ValidationErrorKind::EmptyGroup);
                return None;
            }

            let mut children = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                if let Some(child) = parse_condition(item, &format!("{}[{}]", child_path, i), diag)
                {
                    children.push(child);
                }
            }
            if children.len() != items.len() {
                return None;
            }
            Some(if kind == "all" {
                Condition::all(children)
            } else {
                Condition::any(children)
            })
        }
        "not" => parse_condition(body, &child_path, diag).map(Condition::not),
        "position" | "planet_position" => parse_position(body, &child_path, diag),
        "dignity" | "planet_dignity" => parse_dignity(body, &child_path, diag),
        "aspect" => parse_aspect(body, &child_path, diag),
        "period_lord" | "dasha_lord" => parse_period_lord(body, &child_path, diag),
        "lunar_phase" => label_value(body, &child_path, diag).map(|p| Condition::lunar_phase(&p)),
        "seasonal_phase" => {
            label_value(body, &child_path, diag).map(|p| Condition::seasonal_phase(&p))
        }
        other => {
            diag.report(path, ValidationErrorKind::UnknownConditionKind(other.to_string()));
            None
        }
    }
}

fn object_body<'v>(
    body: &'v Value,
    path: &str,
    diag: &mut Diagnostics<'_>,
) -> Option<&'v Map<String, Value>> {
    match body {
        Value::Object(map) => Some(map),
        _ => {
            diag.malformed(path, "参数必须是对象");
            None
        }
    }
}

/// 按别名顺序取第一个存在的字段
fn field<'v>(map: &'v Map<String, Value>, names: &[&str]) -> Option<&'v Value> {
    names.iter().find_map(|name| map.get(*name))
}

/// 必填的非空字符串字段
fn required_label(
    map: &Map<String, Value>,
    names: &[&str],
    path: &str,
    diag: &mut Diagnostics<'_>,
) -> Option<String> {
    match field(map, names) {
        Some(value) => label_value(value, &format!("{}.{}", path, names[0]), diag),
        None => {
            diag.malformed(path, format!("缺少参数 {}", names[0]));
            None
        }
    }
}

fn optional_label(
    map: &Map<String, Value>,
    name: &str,
    path: &str,
    diag: &mut Diagnostics<'_>,
) -> Option<Option<String>> {
    match map.get(name) {
        None | Some(Value::Null) => Some(None),
        Some(value) => label_value(value, &format!("{}.{}", path, name), diag).map(Some),
    }
}

fn label_value(value: &Value, path: &str, diag: &mut Diagnostics<'_>) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => {
            diag.malformed(path, "必须是非空字符串");
            None
        }
    }
}

fn parse_position(body: &Value, path: &str, diag: &mut Diagnostics<'_>) -> Option<Condition> {
    let map = object_body(body, path, diag)?;
    let entity = required_label(map, &["entity", "planet"], path, diag);

    let slots = match field(map, &["slots", "slot", "house", "houses"]) {
        None => Some(Vec::new()),
        Some(value) => match slot_list(value) {
            Ok(slots) if !slots.is_empty() => Some(slots),
            Ok(_) => {
                diag.report(format!("{}.slots", path), ValidationErrorKind::EmptyGroup);
                None
            }
            Err(message) => {
                diag.malformed(format!("{}.slots", path), message);
                None
            }
        },
    };

    Some(Condition::position(&entity?, slots?))
}

/// 槽位值：整数、数字字符串、数组或 `{"in": [...]}`
fn slot_list(value: &Value) -> std::result::Result<Vec<u32>, String> {
    match value {
        Value::Array(items) => {
            let mut slots = Vec::with_capacity(items.len());
            for item in items {
                slots.push(single_slot(item)?);
            }
            Ok(slots)
        }
        Value::Object(map) if map.len() == 1 && map.contains_key("in") => slot_list(&map["in"]),
        other => single_slot(other).map(|slot| vec![slot]),
    }
}

fn single_slot(value: &Value) -> std::result::Result<u32, String> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| format!("无效的槽位: {}", value))
}

fn parse_dignity(body: &Value, path: &str, diag: &mut Diagnostics<'_>) -> Option<Condition> {
    let map = object_body(body, path, diag)?;
    let entity = required_label(map, &["entity", "planet"], path, diag);

    let dignities = match field(map, &["dignities", "dignity", "in"]) {
        None => Some(Vec::new()),
        Some(Value::String(label)) if !label.trim().is_empty() => Some(vec![label.clone()]),
        Some(Value::Array(items)) if !items.is_empty() => {
            let labels: Option<Vec<String>> = items
                .iter()
                .map(|item| item.as_str().filter(|s| !s.trim().is_empty()).map(str::to_string))
                .collect();
            if labels.is_none() {
                diag.malformed(format!("{}.dignities", path), "尊贵度必须是非空字符串");
            }
            labels
        }
        Some(Value::Array(_)) => {
            diag.report(format!("{}.dignities", path), ValidationErrorKind::EmptyGroup);
            None
        }
        Some(_) => {
            diag.malformed(format!("{}.dignities", path), "尊贵度必须是字符串或字符串数组");
            None
        }
    };

    let entity = entity?;
    let dignities = dignities?;
    Some(Condition::dignity(&entity, dignities.iter().map(String::as_str)))
}

fn parse_aspect(body: &Value, path: &str, diag: &mut Diagnostics<'_>) -> Option<Condition> {
    let map = object_body(body, path, diag)?;
    let from = required_label(map, &["from"], path, diag);
    let to = optional_label(map, "to", path, diag);
    let kind = optional_label(map, "kind", path, diag);

    let (from, to, kind) = (from?, to?, kind?);
    Some(Condition::aspect(&from, to.as_deref(), kind.as_deref()))
}

fn parse_period_lord(body: &Value, path: &str, diag: &mut Diagnostics<'_>) -> Option<Condition> {
    let map = object_body(body, path, diag)?;
    let lord = required_label(map, &["lord", "planet"], path, diag);

    let level = match map.get("level") {
        None | Some(Value::Null) => Some(None),
        Some(value) => match value.as_u64().and_then(|n| usize::try_from(n).ok()) {
            Some(level) => Some(Some(level)),
            None => {
                diag.malformed(format!("{}.level", path), "层级必须是非负整数");
                None
            }
        },
    };

    let (lord, level) = (lord?, level?);
    Some(Condition::period_lord(&lord, level))
}
