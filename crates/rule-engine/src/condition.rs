//! 条件树定义
//!
//! 规则条件是一棵封闭的标签化语法树：叶子为事实原语，内部节点为 all / any / not 组合子。
//! 条件树只在规则加载时构造和校验一次，评估阶段不做任何运行时类型检查。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 统一标签格式：去掉首尾空白并转为小写
///
/// 规则与事实上下文两侧都经过同一归一化，保证 "Sun" 与 "sun " 视为同一实体。
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// 事实维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Position,
    Dignity,
    Aspect,
    PeriodLord,
    LunarPhase,
    SeasonalPhase,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Position => "position",
            Self::Dignity => "dignity",
            Self::Aspect => "aspect",
            Self::PeriodLord => "period_lord",
            Self::LunarPhase => "lunar_phase",
            Self::SeasonalPhase => "seasonal_phase",
        };
        write!(f, "{}", s)
    }
}

/// 事实原语（条件树的叶子）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    /// 实体位于任一槽位；`slots` 为空表示实体位于任意槽位
    Position { entity: String, slots: Vec<u32> },
    /// 实体具有任一尊贵度；`dignities` 为空表示实体有任意尊贵度记录
    Dignity {
        entity: String,
        dignities: Vec<String>,
    },
    /// 存在从 `from` 出发的相位，可选限定目标与相位类型
    Aspect {
        from: String,
        to: Option<String>,
        kind: Option<String>,
    },
    /// 当前大运链包含某主星；`level` 限定链上的层级（0 为最外层）
    PeriodLord { lord: String, level: Option<usize> },
    LunarPhase(String),
    SeasonalPhase(String),
}

impl Primitive {
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

    /// 位置或尊贵度原语所描述的实体
    pub fn subject_entity(&self) -> Option<&str> {
        match self {
            Self::Position { entity, .. } | Self::Dignity { entity, .. } => Some(entity),
            _ => None,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position { entity, slots } if slots.is_empty() => {
                write!(f, "position({})", entity)
            }
            Self::Position { entity, slots } => write!(f, "position({} in {:?})", entity, slots),
            Self::Dignity { entity, dignities } if dignities.is_empty() => {
                write!(f, "dignity({})", entity)
            }
            Self::Dignity { entity, dignities } => {
                write!(f, "dignity({} in [{}])", entity, dignities.join(", "))
            }
            Self::Aspect { from, to, kind } => {
                write!(f, "aspect({}", from)?;
                if let Some(to) = to {
                    write!(f, " -> {}", to)?;
                }
                if let Some(kind) = kind {
                    write!(f, " : {}", kind)?;
                }
                write!(f, ")")
            }
            Self::PeriodLord { lord, level: Some(level) } => {
                write!(f, "period_lord({} @ {})", lord, level)
            }
            Self::PeriodLord { lord, level: None } => write!(f, "period_lord({})", lord),
            Self::LunarPhase(phase) => write!(f, "lunar_phase({})", phase),
            Self::SeasonalPhase(phase) => write!(f, "seasonal_phase({})", phase),
        }
    }
}

/// 条件节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Fact(Primitive),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn all(children: Vec<Condition>) -> Self {
        Self::All(children)
    }

    pub fn any(children: Vec<Condition>) -> Self {
        Self::Any(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Condition) -> Self {
        Self::Not(Box::new(child))
    }

    pub fn position(entity: &str, slots: impl IntoIterator<Item = u32>) -> Self {
        let mut slots: Vec<u32> = slots.into_iter().collect();
        slots.sort_unstable();
        slots.dedup();
        Self::Fact(Primitive::Position {
            entity: normalize_label(entity),
            slots,
        })
    }

    pub fn dignity<'a>(entity: &str, dignities: impl IntoIterator<Item = &'a str>) -> Self {
        let mut dignities: Vec<String> = dignities.into_iter().map(normalize_label).collect();
        dignities.sort_unstable();
        dignities.dedup();
        Self::Fact(Primitive::Dignity {
            entity: normalize_label(entity),
            dignities,
        })
    }

    pub fn aspect(from: &str, to: Option<&str>, kind: Option<&str>) -> Self {
        Self::Fact(Primitive::Aspect {
            from: normalize_label(from),
            to: to.map(normalize_label),
            kind: kind.map(normalize_label),
        })
    }

    pub fn period_lord(lord: &str, level: Option<usize>) -> Self {
        Self::Fact(Primitive::PeriodLord {
            lord: normalize_label(lord),
            level,
        })
    }

    pub fn lunar_phase(phase: &str) -> Self {
        Self::Fact(Primitive::LunarPhase(normalize_label(phase)))
    }

    pub fn seasonal_phase(phase: &str) -> Self {
        Self::Fact(Primitive::SeasonalPhase(normalize_label(phase)))
    }

    /// 深度优先、从左到右访问所有原语（包括 not 之下的原语）
    pub fn for_each_primitive<'a>(&'a self, visit: &mut impl FnMut(&'a Primitive)) {
        match self {
            Self::Fact(primitive) => visit(primitive),
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.for_each_primitive(visit);
                }
            }
            Self::Not(child) => child.for_each_primitive(visit),
        }
    }

    /// 条件是否"有锚点"：若条件成立，则上下文中必然存在至少一个被引用的事实
    ///
    /// 叶子有锚点；all 只要任一子节点有锚点即可；any 需要全部子节点有锚点；not 永远没有锚点。
    /// 没有锚点的规则无法通过倒排索引召回，只能作为常驻候选。
    pub fn is_anchored(&self) -> bool {
        match self {
            Self::Fact(_) => true,
            Self::All(children) => children.iter().any(Condition::is_anchored),
            Self::Any(children) => {
                !children.is_empty() && children.iter().all(Condition::is_anchored)
            }
            Self::Not(_) => false,
        }
    }

    /// 第一个位置或尊贵度原语中的实体，用作强度变体的默认主体
    pub fn first_subject(&self) -> Option<&str> {
        let mut subject = None;
        self.for_each_primitive(&mut |primitive| {
            if subject.is_none() {
                subject = primitive.subject_entity();
            }
        });
        subject
    }

    /// 树中原语的数量
    pub fn primitive_count(&self) -> usize {
        let mut count = 0;
        self.for_each_primitive(&mut |_| count += 1);
        count
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_group(f: &mut fmt::Formatter<'_>, name: &str, children: &[Condition]) -> fmt::Result {
            write!(f, "{}(", name)?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", child)?;
            }
            write!(f, ")")
        }

        match self {
            Self::Fact(primitive) => write!(f, "{}", primitive),
            Self::All(children) => write_group(f, "all", children),
            Self::Any(children) => write_group(f, "any", children),
            Self::Not(child) => write!(f, "not({})", child),
        }
    }
}
