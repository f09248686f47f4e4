//! 事实上下文
//!
//! 由外部星历计算方提供的一次评估所需的全部事实快照。评估期间只读。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::condition::normalize_label;

/// 相位事实
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AspectFact {
    pub from: String,
    pub to: String,
    pub kind: String,
}

impl AspectFact {
    pub fn new(from: &str, to: &str, kind: &str) -> Self {
        Self {
            from: normalize_label(from),
            to: normalize_label(to),
            kind: normalize_label(kind),
        }
    }
}

/// 评估上下文 - 提供给规则引擎的数据
///
/// 全部使用有序容器，保证规范编码与字段插入顺序无关。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactContext {
    positions: BTreeMap<String, u32>,
    dignities: BTreeMap<String, String>,
    aspects: BTreeSet<AspectFact>,
    /// 大运链，最外层（大运）在前
    period_chain: Vec<String>,
    lunar_phase: Option<String>,
    seasonal_phase: Option<String>,
}

/// JSON 输入格式
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFacts {
    positions: BTreeMap<String, u32>,
    dignities: BTreeMap<String, String>,
    aspects: Vec<AspectFact>,
    period_chain: Vec<String>,
    lunar_phase: Option<String>,
    seasonal_phase: Option<String>,
}

impl FactContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 对象创建，所有标签经过归一化
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: RawFacts = serde_json::from_str(json)?;

        let mut context = Self::new();
        for (entity, slot) in &raw.positions {
            context = context.with_position(entity, *slot);
        }
        for (entity, dignity) in &raw.dignities {
            context = context.with_dignity(entity, dignity);
        }
        for aspect in &raw.aspects {
            context = context.with_aspect(&aspect.from, &aspect.to, &aspect.kind);
        }
        context = context.with_period_chain(raw.period_chain.iter().map(String::as_str));
        if let Some(phase) = &raw.lunar_phase {
            context = context.with_lunar_phase(phase);
        }
        if let Some(phase) = &raw.seasonal_phase {
            context = context.with_seasonal_phase(phase);
        }
        Ok(context)
    }

    pub fn with_position(mut self, entity: &str, slot: u32) -> Self {
        self.positions.insert(normalize_label(entity), slot);
        self
    }

    pub fn with_dignity(mut self, entity: &str, dignity: &str) -> Self {
        self.dignities
            .insert(normalize_label(entity), normalize_label(dignity));
        self
    }

    pub fn with_aspect(mut self, from: &str, to: &str, kind: &str) -> Self {
        self.aspects.insert(AspectFact::new(from, to, kind));
        self
    }

    pub fn with_period_chain<'a>(mut self, lords: impl IntoIterator<Item = &'a str>) -> Self {
        self.period_chain = lords.into_iter().map(normalize_label).collect();
        self
    }

    pub fn with_lunar_phase(mut self, phase: &str) -> Self {
        self.lunar_phase = Some(normalize_label(phase));
        self
    }

    pub fn with_seasonal_phase(mut self, phase: &str) -> Self {
        self.seasonal_phase = Some(normalize_label(phase));
        self
    }

    /// 实体所在槽位（参数须为归一化后的标签）
    pub fn position(&self, entity: &str) -> Option<u32> {
        self.positions.get(entity).copied()
    }

    pub fn dignity(&self, entity: &str) -> Option<&str> {
        self.dignities.get(entity).map(String::as_str)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&str, u32)> {
        self.positions.iter().map(|(e, s)| (e.as_str(), *s))
    }

    pub fn dignities(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dignities.iter().map(|(e, d)| (e.as_str(), d.as_str()))
    }

    pub fn aspects(&self) -> impl Iterator<Item = &AspectFact> {
        self.aspects.iter()
    }

    pub fn period_chain(&self) -> &[String] {
        &self.period_chain
    }

    pub fn lunar_phase(&self) -> Option<&str> {
        self.lunar_phase.as_deref()
    }

    pub fn seasonal_phase(&self) -> Option<&str> {
        self.seasonal_phase.as_deref()
    }

    /// 事实总数
    pub fn fact_count(&self) -> usize {
        self.positions.len()
            + self.dignities.len()
            + self.aspects.len()
            + self.period_chain.len()
            + usize::from(self.lunar_phase.is_some())
            + usize::from(self.seasonal_phase.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.fact_count() == 0
    }

    /// 规范编码，用于计算缓存指纹
    ///
    /// 每个分区以标记字节开头，字符串带长度前缀，因此不同的事实集合不会编码成相同的字节序列。
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 * (self.fact_count() + 1));

        out.push(b'P');
        put_len(&mut out, self.positions.len());
        for (entity, slot) in &self.positions {
            put_str(&mut out, entity);
            out.extend_from_slice(&slot.to_be_bytes());
        }

        out.push(b'D');
        put_len(&mut out, self.dignities.len());
        for (entity, dignity) in &self.dignities {
            put_str(&mut out, entity);
            put_str(&mut out, dignity);
        }

        out.push(b'A');
        put_len(&mut out, self.aspects.len());
        for aspect in &self.aspects {
            put_str(&mut out, &aspect.from);
            put_str(&mut out, &aspect.to);
            put_str(&mut out, &aspect.kind);
        }

        out.push(b'C');
        put_len(&mut out, self.period_chain.len());
        for lord in &self.period_chain {
            put_str(&mut out, lord);
        }

        out.push(b'L');
        put_opt(&mut out, self.lunar_phase.as_deref());
        out.push(b'S');
        put_opt(&mut out, self.seasonal_phase.as_deref());

        out
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn put_opt(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            out.push(1);
            put_str(out, s);
        }
        None => out.push(0),
    }
}
