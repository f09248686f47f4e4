//! 并发测试
//!
//! 验证缓存单飞去重，以及评估与重载并发时的快照一致性。

use rule_engine::{FactContext, InterpretationService, Priority, RuleDefinition};
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn heavy_corpus(rule_count: u64) -> Vec<RuleDefinition> {
    (1..=rule_count)
        .map(|serial| {
            RuleDefinition::new(
                serial,
                if serial % 3 == 0 { Priority::High } else { Priority::Low },
                json!({"any": [
                    {"position": {"entity": "sun", "slots": [1, 5, 9]}},
                    {"period_lord": {"lord": "saturn"}}
                ]}),
                "Sun in a trine",
            )
        })
        .collect()
}

#[test]
fn test_concurrent_evaluations_share_one_computation() {
    let service = Arc::new(InterpretationService::default());
    service.reload(heavy_corpus(5_000)).unwrap();
    let context = FactContext::new()
        .with_position("sun", 5)
        .with_period_chain(["saturn", "mercury"]);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            let context = context.clone();
            thread::spawn(move || {
                barrier.wait();
                service.evaluate(&context, Some(Duration::from_secs(10)))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(service.stats().evaluations, 1);
    assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(results[0].rules.len(), 5_000);

    let cache = service.stats().cache.unwrap();
    assert_eq!(cache.misses, 1);
    assert_eq!(cache.hits + cache.joined, (threads - 1) as u64);
    assert_eq!(cache.in_flight, 0);
}

#[test]
fn test_distinct_contexts_compute_independently() {
    let service = Arc::new(InterpretationService::default());
    service.reload(heavy_corpus(100)).unwrap();

    let handles: Vec<_> = [1u32, 5, 9, 2]
        .into_iter()
        .map(|slot| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let context = FactContext::new().with_position("sun", slot);
                service.evaluate(&context, None).rules.len()
            })
        })
        .collect();

    let counts: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(counts, vec![100, 100, 100, 0]);
    assert_eq!(service.stats().evaluations, 4);
}

#[test]
fn test_evaluations_during_reload_see_a_whole_snapshot() {
    let service = Arc::new(InterpretationService::new(Default::default(), None));
    service.reload(heavy_corpus(200)).unwrap();
    let context = FactContext::new().with_position("sun", 1);

    let reader = {
        let service = Arc::clone(&service);
        let context = context.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let result = service.evaluate(&context, None);
                // 每个版本的规则数固定：奇数版本 200 条，偶数版本 50 条
                let expected = if result.corpus_version % 2 == 1 { 200 } else { 50 };
                assert_eq!(result.rules.len(), expected);
            }
        })
    };

    for round in 0..20 {
        let size = if round % 2 == 0 { 50 } else { 200 };
        service.reload(heavy_corpus(size)).unwrap();
    }

    reader.join().unwrap();
    assert_eq!(service.stats().corpus_version, 21);
}
