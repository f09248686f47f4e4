//! 评估结果缓存
//!
//! LRU + TTL 缓存，键为事实上下文指纹与规则库版本。同一键的并发未命中只计算一次，
//! 其余调用方等待并共享结果。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kundali_shared::config::CacheConfig;
use kundali_shared::observability::metrics as cache_metrics;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::FactContext;
use crate::models::EvaluationResult;

/// 事实上下文指纹：规范编码的 SHA-256
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    digest: [u8; 32],
}

impl Fingerprint {
    pub fn of(context: &FactContext) -> Self {
        let hash = Sha256::digest(context.canonical_bytes());
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hash);
        Self { digest }
    }

    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self { digest }
    }

    /// 摘要前 8 字节，作为缓存键
    pub fn key(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.digest[..8]);
        u64::from_be_bytes(bytes)
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

/// 缓存参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            capacity: config.capacity,
            ttl: config.ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    version: u64,
    key: u64,
}

/// 缓存条目
#[derive(Debug)]
pub struct CacheEntry {
    pub result: Arc<EvaluationResult>,
    /// 完整摘要，用于发现 64 位键冲突
    pub digest: [u8; 32],
    pub inserted_at: Instant,
    pub computed_at: DateTime<Utc>,
    /// 计算时使用的时间预算
    pub budget: Duration,
}

impl CacheEntry {
    /// 截断的结果只能提供给预算不大于原预算的调用方
    fn covers(&self, budget: Duration) -> bool {
        !self.result.truncated || budget <= self.budget
    }
}

/// 查询结果
#[derive(Debug, Clone)]
pub enum Lookup {
    /// 缓存命中
    Hit(Arc<EvaluationResult>),
    /// 本次调用执行了计算
    Computed(Arc<EvaluationResult>),
    /// 等待并共享了另一个调用方的计算结果
    Joined(Arc<EvaluationResult>),
}

impl Lookup {
    pub fn into_result(self) -> Arc<EvaluationResult> {
        match self {
            Self::Hit(result) | Self::Computed(result) | Self::Joined(result) => result,
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed(_))
    }
}

enum Probe {
    Usable(Arc<CacheEntry>),
    Collision,
    Miss,
}

/// 由谁完成了 OnceLock 初始化
enum Role {
    Hit,
    Computed,
    Joined,
}

/// 缓存统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
    pub collisions: u64,
    pub in_flight: usize,
    /// (hits + joined) / 总查询数
    pub hit_rate: f64,
}

/// 评估结果缓存
pub struct EvaluationCache {
    entries: Mutex<LruCache<CacheKey, Arc<CacheEntry>>>,
    in_flight: DashMap<CacheKey, Arc<OnceLock<Arc<CacheEntry>>>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    collisions: AtomicU64,
}

impl EvaluationCache {
    /// 容量为 0 时按 1 处理
    pub fn new(options: CacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            ttl: options.ttl,
            capacity: capacity.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
        }
    }

    /// 查询缓存，未命中时计算并写入
    ///
    /// 同一键的并发未命中只有一个调用方执行 `compute`，其余等待其结果。
    pub fn get_or_compute<F>(
        &self,
        version: u64,
        fingerprint: &Fingerprint,
        budget: Duration,
        mut compute: F,
    ) -> Lookup
    where
        F: FnMut() -> EvaluationResult,
    {
        let key = CacheKey {
            version,
            key: fingerprint.key(),
        };

        match self.probe(&key, fingerprint, budget) {
            Probe::Usable(entry) => {
                self.count_hit();
                return Lookup::Hit(Arc::clone(&entry.result));
            }
            Probe::Collision => {
                self.count_collision(&key);
                return Lookup::Computed(self.compute_and_store(key, fingerprint, budget, &mut compute));
            }
            Probe::Miss => {}
        }

        // 取出 slot 后立即释放分片锁
        let slot = self
            .in_flight
            .entry(key)
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .value()
            .clone();

        let mut role = Role::Joined;
        let entry = Arc::clone(slot.get_or_init(|| {
            // 先前的计算可能在我们创建 slot 之前已经完成
            if let Probe::Usable(entry) = self.probe(&key, fingerprint, budget) {
                role = Role::Hit;
                return entry;
            }
            role = Role::Computed;
            let entry = self.build_entry(fingerprint, budget, compute());
            self.store(key, Arc::clone(&entry));
            entry
        }));
        self.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));

        match role {
            Role::Hit => {
                self.count_hit();
                Lookup::Hit(Arc::clone(&entry.result))
            }
            Role::Computed => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                cache_metrics::record_cache_lookup("miss");
                Lookup::Computed(Arc::clone(&entry.result))
            }
            Role::Joined if entry.digest == *fingerprint.digest() && entry.covers(budget) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                cache_metrics::record_cache_lookup("joined");
                Lookup::Joined(Arc::clone(&entry.result))
            }
            Role::Joined => {
                // 等到的结果不适用（键冲突或预算更大），自行计算
                if entry.digest != *fingerprint.digest() {
                    self.count_collision(&key);
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    cache_metrics::record_cache_lookup("miss");
                }
                Lookup::Computed(self.compute_and_store(key, fingerprint, budget, &mut compute))
            }
        }
    }

    fn probe(&self, key: &CacheKey, fingerprint: &Fingerprint, budget: Duration) -> Probe {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key).cloned() else {
            return Probe::Miss;
        };

        if entry.inserted_at.elapsed() >= self.ttl {
            entries.pop(key);
            return Probe::Miss;
        }
        if entry.digest != *fingerprint.digest() {
            return Probe::Collision;
        }
        if !entry.covers(budget) {
            return Probe::Miss;
        }
        Probe::Usable(entry)
    }

    fn build_entry(
        &self,
        fingerprint: &Fingerprint,
        budget: Duration,
        result: EvaluationResult,
    ) -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            result: Arc::new(result),
            digest: *fingerprint.digest(),
            inserted_at: Instant::now(),
            computed_at: Utc::now(),
            budget,
        })
    }

    fn compute_and_store<F>(
        &self,
        key: CacheKey,
        fingerprint: &Fingerprint,
        budget: Duration,
        compute: &mut F,
    ) -> Arc<EvaluationResult>
    where
        F: FnMut() -> EvaluationResult,
    {
        let entry = self.build_entry(fingerprint, budget, compute());
        self.store(key, Arc::clone(&entry));
        Arc::clone(&entry.result)
    }

    fn store(&self, key: CacheKey, entry: Arc<CacheEntry>) {
        let size = {
            let mut entries = self.entries.lock();
            entries.put(key, entry);
            entries.len()
        };
        cache_metrics::record_cache_size(size);
    }

    fn count_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        cache_metrics::record_cache_lookup("hit");
    }

    fn count_collision(&self, key: &CacheKey) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        cache_metrics::record_cache_lookup("collision");
        warn!(version = key.version, key = key.key, "缓存键冲突，重新计算");
    }

    /// 清空全部条目
    pub fn invalidate_all(&self) {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.len();
            entries.clear();
            removed
        };
        cache_metrics::record_cache_size(0);
        debug!("缓存已清空: {} 条", removed);
    }

    /// 移除过期条目，返回移除数量
    pub fn purge_expired(&self) -> usize {
        let (removed, size) = {
            let mut entries = self.entries.lock();
            let expired: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
                .map(|(key, _)| *key)
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            (expired.len(), entries.len())
        };

        if removed > 0 {
            cache_metrics::record_cache_size(size);
            debug!("已清理 {} 条过期缓存", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let joined = self.joined.load(Ordering::Relaxed);
        let total = hits + misses + joined;

        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            joined,
            collisions: self.collisions.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
            hit_rate: if total > 0 {
                (hits + joined) as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}
