//! 内置替换策略
//!
//! 缓存按组相联组织：块号落在某个组里，组满时由替换策略选出被驱逐的块。
//! 这里提供 FIFO 与 LRU 两种实现（LRU 基于 `lru` crate），
//! 以及把它们接到生命周期控制上的 [`BuiltinPolicyEngine`]。

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;

use super::binding::{CacheBinding, PolicyId};
use super::engine::PolicyEngine;
use crate::error::{Error, ErrorKind, Result};

/// 替换策略实例
pub type PolicyHandle = Box<dyn ReplacementPolicy>;

/// 替换策略接口
pub trait ReplacementPolicy: Send {
    /// 策略标识
    fn id(&self) -> PolicyId;

    /// 把块放入组中；组已满时返回被驱逐的块
    fn insert(&mut self, set: u64, block: u64) -> Option<u64>;

    /// 命中时更新块的位置
    fn touch(&mut self, set: u64, block: u64);

    /// 从组中驱逐一个块
    fn evict(&mut self, set: u64) -> Option<u64>;

    /// 按替换顺序导出所有 `(组, 块)`，最先被驱逐的在前
    fn persist(&self) -> Vec<(u64, u64)>;
}

/// FIFO 替换
pub struct FifoPolicy {
    assoc: usize,
    sets: BTreeMap<u64, VecDeque<u64>>,
}

impl FifoPolicy {
    /// 创建策略，`assoc` 为每组块数
    pub fn new(assoc: NonZeroUsize) -> Self {
        Self {
            assoc: assoc.get(),
            sets: BTreeMap::new(),
        }
    }
}

impl ReplacementPolicy for FifoPolicy {
    fn id(&self) -> PolicyId {
        PolicyId::Fifo
    }

    fn insert(&mut self, set: u64, block: u64) -> Option<u64> {
        let queue = self.sets.entry(set).or_default();
        if queue.contains(&block) {
            return None;
        }
        let evicted = if queue.len() >= self.assoc {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(block);
        evicted
    }

    fn touch(&mut self, _set: u64, _block: u64) {}

    fn evict(&mut self, set: u64) -> Option<u64> {
        self.sets.get_mut(&set)?.pop_front()
    }

    fn persist(&self) -> Vec<(u64, u64)> {
        self.sets
            .iter()
            .flat_map(|(set, queue)| queue.iter().map(move |b| (*set, *b)))
            .collect()
    }
}

/// LRU 替换
pub struct LruPolicy {
    assoc: NonZeroUsize,
    sets: BTreeMap<u64, LruCache<u64, ()>>,
}

impl LruPolicy {
    /// 创建策略，`assoc` 为每组块数
    pub fn new(assoc: NonZeroUsize) -> Self {
        Self {
            assoc,
            sets: BTreeMap::new(),
        }
    }
}

impl ReplacementPolicy for LruPolicy {
    fn id(&self) -> PolicyId {
        PolicyId::Lru
    }

    fn insert(&mut self, set: u64, block: u64) -> Option<u64> {
        let assoc = self.assoc;
        let cache = self.sets.entry(set).or_insert_with(|| LruCache::new(assoc));
        // push 在容量满时返回被挤出的最久未使用项
        match cache.push(block, ()) {
            Some((evicted, ())) if evicted != block => Some(evicted),
            _ => None,
        }
    }

    fn touch(&mut self, set: u64, block: u64) {
        if let Some(cache) = self.sets.get_mut(&set) {
            cache.promote(&block);
        }
    }

    fn evict(&mut self, set: u64) -> Option<u64> {
        self.sets.get_mut(&set)?.pop_lru().map(|(block, ())| block)
    }

    fn persist(&self) -> Vec<(u64, u64)> {
        // iter() 从最近使用到最久未使用，导出时反转
        self.sets
            .iter()
            .flat_map(|(set, cache)| {
                let mut blocks: Vec<_> = cache.iter().map(|(b, _)| (*set, *b)).collect();
                blocks.reverse();
                blocks
            })
            .collect()
    }
}

/// 内置策略引擎
///
/// 支持 FIFO 和 LRU；`Random` 不受支持，初始化时返回 `Unsupported`。
#[derive(Debug, Default)]
pub struct BuiltinPolicyEngine;

impl PolicyEngine for BuiltinPolicyEngine {
    fn init(&self, binding: &CacheBinding, policy: PolicyId) -> Result<PolicyHandle> {
        let assoc = NonZeroUsize::new(binding.assoc() as usize)
            .ok_or(Error::new(ErrorKind::InvalidInput, "associativity must be non-zero"))?;
        let handle: PolicyHandle = match policy {
            PolicyId::Fifo => Box::new(FifoPolicy::new(assoc)),
            PolicyId::Lru => Box::new(LruPolicy::new(assoc)),
            PolicyId::Random => {
                log::error!("[POLICY] {}: random replacement not supported", binding.name());
                return Err(Error::new(ErrorKind::Unsupported, "replacement policy not supported"));
            }
        };
        log::debug!(
            "[POLICY] {}: {:?} initialised for {} sets",
            binding.name(),
            policy,
            binding.nr_sets()
        );
        Ok(handle)
    }

    fn mark_clean_lru(&self, binding: &CacheBinding, new: &mut PolicyHandle) {
        let current = binding.policy().lock();
        if let Some(old) = current.as_ref() {
            for (set, block) in old.persist() {
                new.insert(set, block);
            }
        }
    }

    fn switch_cleanup(&self, binding: &CacheBinding, old: PolicyHandle) {
        log::debug!("[POLICY] {}: released {:?} structures", binding.name(), old.id());
    }
}
