//! 索引正确性差分测试
//!
//! 随机生成规则库与事实上下文，比较索引召回的候选集合与逐条暴力评估的结果。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rule_engine::{
    Condition, ConditionEvaluator, FactContext, Priority, RuleCompiler, RuleDefinition,
    RuleEngine, RuleIndex,
};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::time::Duration;

const ENTITIES: [&str; 6] = ["sun", "moon", "mars", "jupiter", "venus", "saturn"];
const DIGNITIES: [&str; 4] = ["exalted", "own", "neutral", "debilitated"];
const ASPECT_KINDS: [&str; 3] = ["conjunction", "trine", "square"];
const LUNAR: [&str; 4] = ["waxing", "waning", "new_moon", "full_moon"];
const SEASONS: [&str; 3] = ["spring", "summer", "monsoon"];

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items[rng.random_range(0..items.len())]
}

fn random_primitive(rng: &mut StdRng) -> Value {
    match rng.random_range(0..6) {
        0 => {
            let slots: Vec<u32> = (0..rng.random_range(0..3))
                .map(|_| rng.random_range(1..=12))
                .collect();
            if slots.is_empty() {
                json!({"position": {"entity": pick(rng, &ENTITIES)}})
            } else {
                json!({"position": {"entity": pick(rng, &ENTITIES), "slots": slots}})
            }
        }
        1 => {
            if rng.random_bool(0.3) {
                json!({"dignity": {"entity": pick(rng, &ENTITIES)}})
            } else {
                json!({"dignity": {"entity": pick(rng, &ENTITIES), "dignity": pick(rng, &DIGNITIES)}})
            }
        }
        2 => {
            let mut body = serde_json::Map::new();
            body.insert("from".into(), json!(pick(rng, &ENTITIES)));
            if rng.random_bool(0.5) {
                body.insert("to".into(), json!(pick(rng, &ENTITIES)));
            }
            if rng.random_bool(0.5) {
                body.insert("kind".into(), json!(pick(rng, &ASPECT_KINDS)));
            }
            json!({"aspect": body})
        }
        3 => {
            if rng.random_bool(0.5) {
                json!({"period_lord": {"lord": pick(rng, &ENTITIES), "level": rng.random_range(0..3)}})
            } else {
                json!({"period_lord": {"lord": pick(rng, &ENTITIES)}})
            }
        }
        4 => json!({"lunar_phase": pick(rng, &LUNAR)}),
        _ => json!({"seasonal_phase": pick(rng, &SEASONS)}),
    }
}

fn random_condition(rng: &mut StdRng, depth: u32) -> Value {
    if depth == 0 || rng.random_bool(0.4) {
        return random_primitive(rng);
    }

    let children: Vec<Value> = (0..rng.random_range(1..=3))
        .map(|_| random_condition(rng, depth - 1))
        .collect();
    match rng.random_range(0..3) {
        0 => json!({"all": children}),
        1 => json!({"any": children}),
        _ => json!({"not": random_condition(rng, depth - 1)}),
    }
}

fn random_corpus(rng: &mut StdRng, size: u64) -> Vec<RuleDefinition> {
    (1..=size)
        .map(|serial| {
            let priority = match rng.random_range(0..3) {
                0 => Priority::High,
                1 => Priority::Medium,
                _ => Priority::Low,
            };
            RuleDefinition::new(serial, priority, random_condition(rng, 3), "reading")
        })
        .collect()
}

fn random_context(rng: &mut StdRng) -> FactContext {
    let mut context = FactContext::new();
    for entity in ENTITIES {
        if rng.random_bool(0.6) {
            context = context.with_position(entity, rng.random_range(1..=12));
        }
        if rng.random_bool(0.4) {
            context = context.with_dignity(entity, pick(rng, &DIGNITIES));
        }
    }
    for _ in 0..rng.random_range(0..4) {
        let (from, to, kind) = (
            pick(rng, &ENTITIES),
            pick(rng, &ENTITIES),
            pick(rng, &ASPECT_KINDS),
        );
        context = context.with_aspect(from, to, kind);
    }
    let chain: Vec<&str> = (0..rng.random_range(0..4))
        .map(|_| pick(rng, &ENTITIES))
        .collect();
    context = context.with_period_chain(chain);
    if rng.random_bool(0.5) {
        context = context.with_lunar_phase(pick(rng, &LUNAR));
    }
    if rng.random_bool(0.5) {
        context = context.with_seasonal_phase(pick(rng, &SEASONS));
    }
    context
}

#[test]
fn test_index_candidates_superset_of_brute_force() {
    let mut rng = StdRng::seed_from_u64(0x5eed_2026);
    let compiler = RuleCompiler::new();

    for _ in 0..30 {
        let corpus = compiler
            .compile_batch(random_corpus(&mut rng, 300))
            .unwrap();
        let index = RuleIndex::build(&corpus);

        for _ in 0..40 {
            let context = random_context(&mut rng);
            let candidates: BTreeSet<usize> = index.candidates(&context).into_iter().collect();

            for (position, rule) in corpus.rules().iter().enumerate() {
                if ConditionEvaluator::evaluate(&rule.condition, &context) {
                    assert!(
                        candidates.contains(&position),
                        "rule {} ({}) matched but was not a candidate for {:?}",
                        rule.serial,
                        rule.condition,
                        context
                    );
                }
            }
        }
    }
}

#[test]
fn test_engine_output_equals_brute_force() {
    let mut rng = StdRng::seed_from_u64(42);
    let engine = RuleEngine::default();
    let definitions = random_corpus(&mut rng, 500);
    engine.reload(definitions).unwrap();
    let snapshot = engine.snapshot();

    for _ in 0..100 {
        let context = random_context(&mut rng);
        let result = engine.evaluate(&context, Duration::from_secs(10));
        assert!(!result.truncated);

        let expected: Vec<u64> = snapshot
            .corpus
            .rules()
            .iter()
            .filter(|rule| ConditionEvaluator::evaluate(&rule.condition, &context))
            .map(|rule| rule.serial)
            .collect();
        assert_eq!(result.serials(), expected);
    }
}

#[test]
fn test_unanchored_rule_always_candidate() {
    let corpus = RuleCompiler::new()
        .compile_batch(vec![RuleDefinition::new(
            1,
            Priority::High,
            json!({"not": {"position": {"entity": "sun", "slot": 1}}}),
            "Sun away from the ascendant",
        )])
        .unwrap();
    let index = RuleIndex::build(&corpus);
    let empty = FactContext::new();

    assert_eq!(index.candidates(&empty), vec![0]);
    assert!(ConditionEvaluator::evaluate(
        &Condition::not(Condition::position("sun", [1])),
        &empty
    ));
}
