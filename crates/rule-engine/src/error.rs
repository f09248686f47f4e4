//! 规则引擎错误类型

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则库校验失败: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// 单条校验错误的类别
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    #[error("缺少必填字段: {0}")]
    MissingField(String),

    #[error("序号重复: {0}")]
    DuplicateSerial(u64),

    #[error("规则 ID 重复: {0}")]
    DuplicateId(String),

    #[error("无效的优先级: {0}")]
    InvalidPriority(String),

    #[error("未知的条件类型: {0}")]
    UnknownConditionKind(String),

    #[error("条件格式错误: {0}")]
    MalformedCondition(String),

    #[error("逻辑组不能为空")]
    EmptyGroup,

    #[error("组合引用的规则不存在: {0}")]
    DanglingReference(String),

    #[error("组合不能引用规则自身: {0}")]
    SelfReference(u64),

    #[error("变体标签重复: {0}")]
    DuplicateVariation(String),

    #[error("强度变体无法选中: 规则没有主体实体，请设置 subject")]
    UnselectableStrengthVariations,

    #[error("规则定义格式错误: {0}")]
    Malformed(String),
}

/// 带位置信息的校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    /// 规则在批次中的下标
    pub index: usize,
    pub serial: Option<u64>,
    /// 出错字段的路径，如 `condition.all[1]`
    pub path: String,
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    pub fn new(
        index: usize,
        serial: Option<u64>,
        path: impl Into<String>,
        kind: ValidationErrorKind,
    ) -> Self {
        Self {
            index,
            serial,
            path: path.into(),
            kind,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rules[{}]", self.index)?;
        if let Some(serial) = self.serial {
            write!(f, " (serial {})", serial)?;
        }
        if !self.path.is_empty() {
            write!(f, " {}", self.path)?;
        }
        write!(f, ": {}", self.kind)
    }
}

/// 一个批次的全部校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// 是否包含满足条件的错误类别
    pub fn has(&self, predicate: impl Fn(&ValidationErrorKind) -> bool) -> bool {
        self.0.iter().any(|e| predicate(&e.kind))
    }

    pub fn into_inner(self) -> Vec<ValidationError> {
        self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "共 {} 个错误", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let error = ValidationError::new(
            3,
            Some(12),
            "condition.all[1]",
            ValidationErrorKind::UnknownConditionKind("planet_house".to_string()),
        );

        assert_eq!(
            error.to_string(),
            "rules[3] (serial 12) condition.all[1]: 未知的条件类型: planet_house"
        );
    }

    #[test]
    fn test_validation_errors_wrap_into_rule_error() {
        let errors = ValidationErrors::new(vec![ValidationError::new(
            0,
            None,
            "",
            ValidationErrorKind::MissingField("serial".to_string()),
        )]);
        let error: RuleError = errors.into();

        assert!(error.to_string().contains("缺少必填字段: serial"));
    }

    #[test]
    fn test_validation_errors_are_std_errors() {
        let errors = ValidationErrors::new(vec![ValidationError::new(
            1,
            Some(4),
            "strength_variations.Exalted",
            ValidationErrorKind::DuplicateVariation("exalted".to_string()),
        )]);
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(errors.clone());

        assert_eq!(
            boxed.to_string(),
            "共 1 个错误; rules[1] (serial 4) strength_variations.Exalted: 变体标签重复: exalted"
        );
        assert!(boxed.source().is_none());

        let single: &dyn std::error::Error = errors.iter().next().unwrap();
        assert!(single.to_string().starts_with("rules[1]"));
    }
}
